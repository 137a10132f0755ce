// 🧬 Lineage Resolver - seed batches → fully wired family trees
//
// One closure query, one batch load per kind, then pointer wiring in memory.
// Each seed comes back as its own node (not the root): walk `.parent()` or
// `.root()` to go up, `.children()` to go down.

use crate::closure::LineageEdge;
use crate::config::LineageConfig;
use crate::node::Node;
use crate::record::{RecordKind, RecordRef};
use crate::store::RecordStore;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

// ============================================================================
// RESOLUTION
// ============================================================================

/// Every node built by one resolve call. Parent links are weak, so a seed only
/// reaches its ancestors while this (or a handle on its root) is alive.
#[derive(Debug, Default)]
pub struct Resolution {
    seeds: Vec<Node>,
    roots: Vec<Node>,
    index: HashMap<RecordRef, Node>,
}

impl Resolution {
    /// One node per requested seed that resolved, in request order
    pub fn seeds(&self) -> &[Node] {
        &self.seeds
    }

    /// Top of every family touched, ordered by kind then id
    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn node(&self, record: RecordRef) -> Option<Node> {
        self.index.get(&record).cloned()
    }

    /// Total records across all families
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct LineageResolver<'a> {
    store: &'a dyn RecordStore,
    config: LineageConfig,
}

impl<'a> LineageResolver<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self::with_config(store, LineageConfig::default())
    }

    pub fn with_config(store: &'a dyn RecordStore, config: LineageConfig) -> Self {
        LineageResolver { store, config }
    }

    pub fn config(&self) -> &LineageConfig {
        &self.config
    }

    /// Resolve the families of the given batch ids.
    ///
    /// Unknown and tombstoned seeds are dropped from the output. A parent
    /// reference to a row that does not exist makes its child a root.
    pub fn resolve(&self, seeds: &[i64]) -> Result<Resolution> {
        if seeds.is_empty() {
            return Ok(Resolution::default());
        }

        // Same record reported twice: keep the first parent seen
        let mut edges: BTreeMap<RecordRef, Option<RecordRef>> = BTreeMap::new();
        for LineageEdge { child, parent } in self.store.family_edges(seeds, &self.config)? {
            edges.entry(child).or_insert(parent);
        }

        let mut ids_by_kind: BTreeMap<RecordKind, BTreeSet<i64>> = BTreeMap::new();
        for child in edges.keys() {
            ids_by_kind.entry(child.kind).or_default().insert(child.id);
        }

        let mut index: HashMap<RecordRef, Node> = HashMap::with_capacity(edges.len());
        for (kind, ids) in &ids_by_kind {
            let ids: Vec<i64> = ids.iter().copied().collect();
            for record in self.store.load_records(*kind, &ids)? {
                index.insert(record.record_ref(), Node::wrap(record));
            }
        }

        for (child, parent) in &edges {
            let (Some(parent), Some(child_node)) = (parent, index.get(child)) else {
                continue;
            };
            match index.get(parent) {
                Some(parent_node) => {
                    if !Node::attach(parent_node, child_node) {
                        warn!(child = %child, parent = %parent, "cyclic parent reference ignored");
                    }
                }
                None => {
                    warn!(child = %child, parent = %parent, "dangling parent reference, treating as root");
                }
            }
        }

        let mut roots: Vec<Node> = index.values().filter(|node| node.is_root()).cloned().collect();
        roots.sort_by_key(|node| node.record_ref());

        let mut resolved = Vec::with_capacity(seeds.len());
        for id in seeds {
            match index.get(&RecordRef::new(RecordKind::Batch, *id)) {
                Some(node) => resolved.push(node.clone()),
                None => debug!(batch = id, "seed not resolved, dropped"),
            }
        }

        info!(
            seeds = seeds.len(),
            resolved = resolved.len(),
            records = index.len(),
            families = roots.len(),
            "lineage resolved"
        );

        Ok(Resolution { seeds: resolved, roots, index })
    }
}

/// Resolve with the default configuration
pub fn resolve(store: &dyn RecordStore, seeds: &[i64]) -> Result<Resolution> {
    LineageResolver::new(store).resolve(seeds)
}
