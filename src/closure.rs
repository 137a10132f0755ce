// 🌳 Family closure - every record related to a set of seed batches
//
// Two phases over the single-parent relation:
//   1. Ascend: seeds → parents → ... until no parent (or a missing/tombstoned one)
//   2. Descend: roots → every record whose parent is already known, to the leaves
//
// Output is one flat list of (kind, id, parent kind, parent id) tuples.
// The recursive query is the default; the frontier loop gives the same answer
// one round trip per depth level.

use crate::config::LineageConfig;
use crate::error::LineageError;
use crate::record::{RecordKind, RecordRef};
use anyhow::{anyhow, Context as AnyhowContext, Result};
use rusqlite::{Connection, Row};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// One record of the family and its stored parent reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineageEdge {
    pub child: RecordRef,
    pub parent: Option<RecordRef>,
}

// ============================================================================
// SQL BUILDING
// ============================================================================
//
// No shared edges view: every step reads one table through its primary key
// (ascend) or a parent-column index (descend), so a resolve touches the family
// and nothing else.

const UNION_SEPARATOR: &str = "\n                UNION\n                ";

fn tombstone_condition(kind: RecordKind, exclude_tombstoned: bool) -> Option<String> {
    match kind.tombstone_column() {
        Some(column) if exclude_tombstoned => Some(format!("{}.{} = 0", kind.table(), column)),
        _ => None,
    }
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

/// `'kind', id, <parent kind>, <parent id>` read from the kind's own table
fn edge_columns_sql(kind: RecordKind) -> String {
    let table = kind.table();
    let links = kind.parent_links();

    let parent_kind = if links.len() == 1 {
        format!(
            "CASE WHEN {}.{} IS NOT NULL THEN '{}' END",
            table, links[0].column, links[0].kind
        )
    } else {
        let arms: Vec<String> = links
            .iter()
            .map(|link| format!("WHEN {}.{} IS NOT NULL THEN '{}'", table, link.column, link.kind))
            .collect();
        format!("CASE {} END", arms.join(" "))
    };

    let parent_id = if links.len() == 1 {
        format!("{}.{}", table, links[0].column)
    } else {
        let columns: Vec<String> = links
            .iter()
            .map(|link| format!("{}.{}", table, link.column))
            .collect();
        format!("COALESCE({})", columns.join(", "))
    };

    format!("'{}', {}.id, {}, {}", kind, table, parent_kind, parent_id)
}

/// The seed batches themselves, bound as a JSON array in `?1`
fn seed_select(exclude_tombstoned: bool) -> String {
    let batch = RecordKind::Batch;
    let mut conditions = vec![format!(
        "{}.id IN (SELECT value FROM json_each(?1))",
        batch.table()
    )];
    conditions.extend(tombstone_condition(batch, exclude_tombstoned));

    format!(
        "SELECT {} FROM {}{}",
        edge_columns_sql(batch),
        batch.table(),
        where_clause(&conditions)
    )
}

/// One step up: the parent row of a known ancestor
fn ascend_select(kind: RecordKind, exclude_tombstoned: bool) -> String {
    let table = kind.table();
    let mut conditions = vec![format!("ancestors.parent_kind = '{}'", kind)];
    conditions.extend(tombstone_condition(kind, exclude_tombstoned));

    format!(
        "SELECT {} FROM ancestors CROSS JOIN {} ON {}.id = ancestors.parent_id{}",
        edge_columns_sql(kind),
        table,
        table,
        where_clause(&conditions)
    )
}

/// One step down per parent link of `kind`: rows whose effective parent is a family member
fn descend_selects(kind: RecordKind, exclude_tombstoned: bool) -> Vec<String> {
    let table = kind.table();
    let links = kind.parent_links();

    links
        .iter()
        .enumerate()
        .map(|(i, link)| {
            let mut conditions = vec![format!("family.kind = '{}'", link.kind)];
            // A non-null higher-precedence link means the row belongs elsewhere
            conditions.extend(
                links[..i]
                    .iter()
                    .map(|earlier| format!("{}.{} IS NULL", table, earlier.column)),
            );
            conditions.extend(tombstone_condition(kind, exclude_tombstoned));

            format!(
                "SELECT {} FROM family CROSS JOIN {} ON {}.{} = family.id{}",
                edge_columns_sql(kind),
                table,
                table,
                link.column,
                where_clause(&conditions)
            )
        })
        .collect()
}

/// Ancestors whose parent is not itself an ancestor: no parent, missing, or tombstoned
const ROOTS_SELECT: &str = "SELECT kind, id, parent_kind, parent_id FROM ancestors \
     WHERE NOT EXISTS (SELECT 1 FROM ancestors AS p \
     WHERE p.kind = ancestors.parent_kind AND p.id = ancestors.parent_id)";

/// Ascend from the seed batches, then descend from the roots found, in one statement.
/// Seeds are bound as a JSON array in `?1`.
pub fn recursive_closure_sql(exclude_tombstoned: bool) -> String {
    let ascend: Vec<String> = std::iter::once(seed_select(exclude_tombstoned))
        .chain(
            RecordKind::ALL
                .iter()
                .map(|kind| ascend_select(*kind, exclude_tombstoned)),
        )
        .collect();

    let descend: Vec<String> = std::iter::once(ROOTS_SELECT.to_string())
        .chain(
            RecordKind::ALL
                .iter()
                .flat_map(|kind| descend_selects(*kind, exclude_tombstoned)),
        )
        .collect();

    format!(
        "WITH RECURSIVE
            ancestors(kind, id, parent_kind, parent_id) AS (
                {ascend}
            ),
            family(kind, id, parent_kind, parent_id) AS (
                {descend}
            )
         SELECT kind, id, parent_kind, parent_id FROM ancestors
         UNION
         SELECT kind, id, parent_kind, parent_id FROM family
         ORDER BY kind, id",
        ascend = ascend.join(UNION_SEPARATOR),
        descend = descend.join(UNION_SEPARATOR),
    )
}

// ============================================================================
// RECURSIVE QUERY
// ============================================================================

pub fn recursive_family(
    conn: &Connection,
    seeds: &[i64],
    config: &LineageConfig,
) -> Result<Vec<LineageEdge>> {
    let sql = recursive_closure_sql(config.exclude_tombstoned);
    let seeds_json = serde_json::to_string(seeds)?;

    let mut stmt = conn
        .prepare(&sql)
        .context("Failed to prepare family closure query")?;

    let rows = stmt
        .query_map([seeds_json], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut edges = Vec::with_capacity(rows.len());
    for (kind, id, parent_kind, parent_id) in rows {
        let kind = RecordKind::parse(&kind).ok_or_else(|| anyhow!("Unknown record kind: {}", kind))?;
        let parent = match (parent_kind, parent_id) {
            (Some(parent_kind), Some(parent_id)) => {
                let parent_kind = RecordKind::parse(&parent_kind)
                    .ok_or_else(|| anyhow!("Unknown record kind: {}", parent_kind))?;
                Some(RecordRef::new(parent_kind, parent_id))
            }
            _ => None,
        };
        edges.push(LineageEdge { child: RecordRef::new(kind, id), parent });
    }

    debug!(seeds = seeds.len(), edges = edges.len(), "recursive closure complete");
    Ok(edges)
}

// ============================================================================
// ITERATIVE FRONTIER
// ============================================================================

fn edge_from_row(kind: RecordKind, row: &Row<'_>) -> rusqlite::Result<LineageEdge> {
    let id: i64 = row.get(0)?;
    let mut parent = None;
    for (i, link) in kind.parent_links().iter().enumerate() {
        if let Some(parent_id) = row.get::<_, Option<i64>>(i + 1)? {
            parent = Some(RecordRef::new(link.kind, parent_id));
            break;
        }
    }
    Ok(LineageEdge { child: RecordRef::new(kind, id), parent })
}

fn edge_columns(kind: RecordKind) -> String {
    let mut columns = vec!["id"];
    columns.extend(kind.parent_links().iter().map(|link| link.column));
    columns.join(", ")
}

fn query_edges(
    conn: &Connection,
    kind: RecordKind,
    sql: &str,
    ids: &BTreeSet<i64>,
) -> Result<Vec<LineageEdge>> {
    let ids_json = serde_json::to_string(ids)?;
    let mut stmt = conn.prepare(sql)?;
    let edges = stmt
        .query_map([ids_json], |row| edge_from_row(kind, row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Rows of `kind` with the given ids
fn edges_by_id(
    conn: &Connection,
    kind: RecordKind,
    ids: &BTreeSet<i64>,
    exclude_tombstoned: bool,
) -> Result<Vec<LineageEdge>> {
    let tombstone = match kind.tombstone_column() {
        Some(column) if exclude_tombstoned => format!(" AND {} = 0", column),
        _ => String::new(),
    };
    let sql = format!(
        "SELECT {} FROM {} WHERE id IN (SELECT value FROM json_each(?1)){}",
        edge_columns(kind),
        kind.table(),
        tombstone
    );
    query_edges(conn, kind, &sql, ids)
}

/// Rows of any kind whose effective parent is one of `parent_ids` of `parent_kind`
fn edges_by_parent(
    conn: &Connection,
    parent_kind: RecordKind,
    parent_ids: &BTreeSet<i64>,
    exclude_tombstoned: bool,
) -> Result<Vec<LineageEdge>> {
    let mut found = Vec::new();

    for kind in RecordKind::ALL {
        for link in kind.parent_links().iter().filter(|link| link.kind == parent_kind) {
            let tombstone = match kind.tombstone_column() {
                Some(column) if exclude_tombstoned => format!(" AND {} = 0", column),
                _ => String::new(),
            };
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IN (SELECT value FROM json_each(?1)){}",
                edge_columns(kind),
                kind.table(),
                link.column,
                tombstone
            );

            // A row matched on a lower-precedence column belongs to another parent
            found.extend(
                query_edges(conn, kind, &sql, parent_ids)?
                    .into_iter()
                    .filter(|edge| {
                        edge.parent
                            .map_or(false, |p| p.kind == parent_kind && parent_ids.contains(&p.id))
                    }),
            );
        }
    }

    Ok(found)
}

fn check_rounds(rounds: usize, config: &LineageConfig) -> Result<()> {
    if rounds > config.max_frontier_rounds {
        return Err(LineageError::FrontierLimit { rounds: config.max_frontier_rounds }.into());
    }
    Ok(())
}

pub fn iterative_family(
    conn: &Connection,
    seeds: &[i64],
    config: &LineageConfig,
) -> Result<Vec<LineageEdge>> {
    let exclude = config.exclude_tombstoned;
    let mut known: BTreeMap<RecordRef, Option<RecordRef>> = BTreeMap::new();
    let mut rounds = 0;

    // Phase 1: ascend
    let mut frontier: BTreeMap<RecordKind, BTreeSet<i64>> = BTreeMap::new();
    if !seeds.is_empty() {
        frontier.insert(RecordKind::Batch, seeds.iter().copied().collect());
    }

    while !frontier.is_empty() {
        rounds += 1;
        check_rounds(rounds, config)?;

        let mut next: BTreeMap<RecordKind, BTreeSet<i64>> = BTreeMap::new();
        for (kind, ids) in &frontier {
            for edge in edges_by_id(conn, *kind, ids, exclude)? {
                if known.insert(edge.child, edge.parent).is_some() {
                    continue;
                }
                if let Some(parent) = edge.parent {
                    if !known.contains_key(&parent) {
                        next.entry(parent.kind).or_default().insert(parent.id);
                    }
                }
            }
        }
        frontier = next;
    }

    // Roots: no parent, or a parent that did not load (missing or tombstoned)
    let roots: Vec<RecordRef> = known
        .iter()
        .filter(|(_, parent)| parent.map_or(true, |p| !known.contains_key(&p)))
        .map(|(child, _)| *child)
        .collect();

    // Phase 2: descend
    let mut visited: HashSet<RecordRef> = roots.iter().copied().collect();
    let mut frontier: BTreeMap<RecordKind, BTreeSet<i64>> = BTreeMap::new();
    for root in &roots {
        frontier.entry(root.kind).or_default().insert(root.id);
    }

    while !frontier.is_empty() {
        rounds += 1;
        check_rounds(rounds, config)?;

        let mut next: BTreeMap<RecordKind, BTreeSet<i64>> = BTreeMap::new();
        for (parent_kind, parent_ids) in &frontier {
            for edge in edges_by_parent(conn, *parent_kind, parent_ids, exclude)? {
                known.entry(edge.child).or_insert(edge.parent);
                if visited.insert(edge.child) {
                    next.entry(edge.child.kind).or_default().insert(edge.child.id);
                }
            }
        }
        frontier = next;
    }

    let edges: Vec<LineageEdge> = known
        .into_iter()
        .map(|(child, parent)| LineageEdge { child, parent })
        .collect();

    debug!(seeds = seeds.len(), edges = edges.len(), rounds, "frontier closure complete");
    Ok(edges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::setup_database;

    #[test]
    fn test_edge_columns_two_links() {
        assert_eq!(
            edge_columns_sql(RecordKind::Batch),
            "'batch', batches.id, CASE WHEN batches.parent_batch_id IS NOT NULL THEN 'batch' \
             WHEN batches.parent_inventory_id IS NOT NULL THEN 'inventory' END, \
             COALESCE(batches.parent_batch_id, batches.parent_inventory_id)"
        );
    }

    #[test]
    fn test_edge_columns_single_link() {
        assert_eq!(
            edge_columns_sql(RecordKind::Certificate),
            "'certificate', certificates.id, CASE WHEN certificates.parent_certificate_source_id \
             IS NOT NULL THEN 'certificate_source' END, certificates.parent_certificate_source_id"
        );
    }

    #[test]
    fn test_descend_respects_link_precedence() {
        let selects = descend_selects(RecordKind::Batch, true);
        assert_eq!(selects.len(), 2);
        assert!(selects[0].contains("ON batches.parent_batch_id = family.id"));
        assert!(!selects[0].contains("IS NULL"));
        assert!(selects[1].ends_with(
            "ON batches.parent_inventory_id = family.id WHERE family.kind = 'inventory' \
             AND batches.parent_batch_id IS NULL AND batches.is_deleted = 0"
        ));
    }

    #[test]
    fn test_tombstone_filter_can_be_disabled() {
        let sql = recursive_closure_sql(false);
        assert!(!sql.contains("is_deleted"));
        let sql = recursive_closure_sql(true);
        assert!(sql.contains("batches.is_deleted = 0"));
        assert!(!sql.contains("inventories.is_deleted"));
    }

    #[test]
    fn test_closure_sql_covers_every_kind() {
        let sql = recursive_closure_sql(true);
        for kind in RecordKind::ALL {
            assert!(sql.contains(kind.table()), "missing {}", kind.table());
        }
        assert!(sql.starts_with("WITH RECURSIVE"));
    }

    #[test]
    fn test_closure_plan_never_scans_a_table() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let sql = format!("EXPLAIN QUERY PLAN {}", recursive_closure_sql(true));
        let mut stmt = conn.prepare(&sql).unwrap();
        let details: Vec<String> = stmt
            .query_map(["[1]"], |row| row.get(3))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for kind in RecordKind::ALL {
            let scan = format!("SCAN {}", kind.table());
            for detail in &details {
                assert!(
                    *detail != scan && !detail.starts_with(&format!("{} ", scan)),
                    "full table scan: {}",
                    detail
                );
            }
        }
        assert!(details.iter().any(|d| d.contains("idx_batches_parent_batch_id")));
    }
}
