// 🌊 Propagation Engine - cascade staged edits to every descendant
//
// Per hop (parent kind → child kind) a rule decides what crosses:
//   - copy:    same name on both sides (GHG figures, identity)
//   - rename:  different name on the child side (volume → total_volume)
//   - exclude: never crosses this hop (identity at a transformation)
// Anything the rule does not mention is dropped for that hop.
// Values a child's kind cannot hold are still relayed to its own children.

use crate::config::LineageConfig;
use crate::error::LineageError;
use crate::node::Node;
use crate::record::{FieldValues, RecordKind, RecordRef, GHG_FIELDS, IDENTITY_FIELDS};
use crate::store::RecordStore;
use anyhow::{Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// HOP RULES
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HopRule {
    /// Fields that cross unchanged
    #[serde(default)]
    pub copy: Vec<String>,

    /// Parent field → child field
    #[serde(default)]
    pub rename: BTreeMap<String, String>,

    /// Fields that never cross, even if listed above
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl HopRule {
    fn copying(fields: &[&[&str]]) -> Self {
        HopRule {
            copy: fields.iter().flat_map(|group| group.iter().map(|f| f.to_string())).collect(),
            ..Default::default()
        }
    }

    fn renaming(mut self, from: &str, to: &str) -> Self {
        self.rename.insert(from.to_string(), to.to_string());
        self
    }

    fn excluding(mut self, fields: &[&str]) -> Self {
        self.exclude.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    /// Translate parent-side values into child-side values
    pub fn map(&self, values: &FieldValues) -> FieldValues {
        let mut mapped = FieldValues::new();
        for (name, value) in values {
            if self.exclude.contains(name) {
                continue;
            }
            if let Some(target) = self.rename.get(name) {
                mapped.insert(target.clone(), value.clone());
            } else if self.copy.contains(name) {
                mapped.insert(name.clone(), value.clone());
            }
        }
        mapped
    }
}

/// One row of a mapping file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopEntry {
    pub from: RecordKind,
    pub to: RecordKind,
    #[serde(flatten)]
    pub rule: HopRule,
}

// ============================================================================
// FIELD MAPPING TABLE
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    rules: HashMap<(RecordKind, RecordKind), HopRule>,
}

impl FieldMapping {
    /// No hop carries anything
    pub fn empty() -> Self {
        FieldMapping::default()
    }

    /// The default table for the five record kinds
    pub fn standard() -> Self {
        use RecordKind::*;

        let material = || HopRule::copying(&[GHG_FIELDS, IDENTITY_FIELDS]);

        let mut mapping = FieldMapping::empty();
        mapping.set(Batch, Batch, material());
        mapping.set(
            Batch,
            Inventory,
            material()
                .renaming("delivery_site_id", "site_id")
                .renaming("delivery_site_country", "site_country"),
        );
        mapping.set(
            Batch,
            CertificateSource,
            HopRule::copying(&[GHG_FIELDS, IDENTITY_FIELDS, &["delivery_site_id"][..]])
                .renaming("volume", "total_volume"),
        );
        mapping.set(Inventory, Batch, material());
        // The transformation row holds none of these; it only relays them
        mapping.set(Inventory, InventoryTransformation, material());
        // What the material is may change across a transformation
        mapping.set(
            InventoryTransformation,
            Inventory,
            material().excluding(&["biofuel_code", "feedstock_code"]),
        );
        mapping.set(CertificateSource, Certificate, material());
        mapping.set(Certificate, CertificateSource, material());
        mapping
    }

    pub fn from_entries(entries: Vec<HopEntry>) -> Self {
        let mut mapping = FieldMapping::empty();
        for entry in entries {
            mapping.set(entry.from, entry.to, entry.rule);
        }
        mapping
    }

    /// Load a mapping table from a JSON array of hop entries
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read field mapping file: {:?}", path.as_ref()))?;

        let entries: Vec<HopEntry> =
            serde_json::from_str(&content).context("Failed to parse field mapping JSON")?;

        Ok(FieldMapping::from_entries(entries))
    }

    pub fn set(&mut self, from: RecordKind, to: RecordKind, rule: HopRule) {
        self.rules.insert((from, to), rule);
    }

    pub fn rule(&self, from: RecordKind, to: RecordKind) -> Option<&HopRule> {
        self.rules.get(&(from, to))
    }

    /// Values that cross from a `from` record to its `to` child; unmapped pairs carry nothing
    pub fn map_hop(&self, from: RecordKind, to: RecordKind, values: &FieldValues) -> FieldValues {
        self.rule(from, to).map(|rule| rule.map(values)).unwrap_or_default()
    }
}

// ============================================================================
// PROPAGATION REPORT
// ============================================================================

/// One record the cascade could not update. Its in-memory copy is left as
/// it was before the attempt, except for the origin, which keeps its staged edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescendantFailure {
    pub record: RecordRef,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationReport {
    pub run_id: Uuid,
    pub origin: RecordRef,
    pub started_at: DateTime<Utc>,

    /// Descendants reached with a non-empty carried set
    pub visited: usize,

    /// Records written to the store in visit order, the origin first when
    /// its own kind holds any staged field
    pub saved: Vec<RecordRef>,

    pub failures: Vec<DescendantFailure>,
}

impl PropagationReport {
    fn new(origin: RecordRef) -> Self {
        PropagationReport {
            run_id: Uuid::new_v4(),
            origin,
            started_at: Utc::now(),
            visited: 0,
            saved: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Err when any record failed; saved records are not rolled back
    pub fn into_result(self) -> Result<Self, LineageError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(LineageError::PropagationIncomplete {
                failed: self.failures.len(),
                saved: self.saved.len(),
            })
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Propagation from {}: {} visited, {} saved, {} failed",
            self.origin,
            self.visited,
            self.saved.len(),
            self.failures.len()
        )
    }
}

// ============================================================================
// PROPAGATION ENGINE
// ============================================================================

pub struct PropagationEngine {
    mapping: FieldMapping,
    continue_on_failure: bool,
}

impl PropagationEngine {
    pub fn new(mapping: FieldMapping, config: &LineageConfig) -> Self {
        PropagationEngine {
            mapping,
            continue_on_failure: config.continue_on_save_failure,
        }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Save the edited node, then walk every descendant depth-first, applying
    /// the node's staged values through the hop rules and saving each
    /// descendant that changed.
    /// Not transactional: a failure leaves earlier saves in place.
    pub fn propagate(&self, node: &Node, store: &dyn RecordStore) -> PropagationReport {
        let mut report = PropagationReport::new(node.record_ref());
        let staged = node.staged();

        // The origin keeps its staged values in memory even if this save fails
        if staged.keys().any(|name| node.kind().has_field(name)) {
            match node.save(store) {
                Ok(()) => report.saved.push(node.record_ref()),
                Err(e) => {
                    self.record_failure(&mut report, node, e);
                    if !self.continue_on_failure {
                        info!(run_id = %report.run_id, "{}", report.summary());
                        return report;
                    }
                }
            }
        }

        let mut seen: HashSet<RecordRef> = HashSet::new();
        seen.insert(node.record_ref());

        let mut stack: Vec<(Node, FieldValues)> = Vec::new();
        self.push_children(node, &staged, &mut stack);

        while let Some((current, carried)) = stack.pop() {
            if !seen.insert(current.record_ref()) || carried.is_empty() {
                continue;
            }
            report.visited += 1;

            match self.apply_and_save(&current, &carried, store) {
                Ok(true) => report.saved.push(current.record_ref()),
                Ok(false) => {}
                Err(e) => {
                    self.record_failure(&mut report, &current, e);
                    if !self.continue_on_failure {
                        break;
                    }
                }
            }

            self.push_children(&current, &carried, &mut stack);
        }

        info!(run_id = %report.run_id, "{}", report.summary());
        report
    }

    fn record_failure(&self, report: &mut PropagationReport, node: &Node, e: anyhow::Error) {
        let error = format!("{:#}", e);
        warn!(record = %node, error = %error, "record not updated");
        report.failures.push(DescendantFailure {
            record: node.record_ref(),
            error,
        });
    }

    fn push_children(&self, parent: &Node, values: &FieldValues, stack: &mut Vec<(Node, FieldValues)>) {
        // Reversed so the first child is visited first
        for child in parent.children().into_iter().rev() {
            let mapped = self.mapping.map_hop(parent.kind(), child.kind(), values);
            debug!(from = %parent, to = %child, fields = mapped.len(), "hop mapped");
            stack.push((child, mapped));
        }
    }

    /// Ok(true) when something was written and saved.
    /// A failed save puts the in-memory record back the way it was.
    fn apply_and_save(&self, node: &Node, values: &FieldValues, store: &dyn RecordStore) -> Result<bool> {
        let before = node.record().clone();
        let applied = node.apply_carried(values)?;
        if applied.is_empty() {
            return Ok(false);
        }
        if let Err(e) = node.save(store) {
            node.replace_record(before);
            return Err(e);
        }
        Ok(true)
    }
}

impl Default for PropagationEngine {
    fn default() -> Self {
        PropagationEngine::new(FieldMapping::standard(), &LineageConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Batch, Certificate, CertificateSource, Inventory, InventoryTransformation};
    use crate::store::SqliteStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn values(pairs: &[(&str, serde_json::Value)]) -> FieldValues {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_batch_to_certificate_source_renames_volume() {
        let mapping = FieldMapping::standard();
        let mapped = mapping.map_hop(
            RecordKind::Batch,
            RecordKind::CertificateSource,
            &values(&[("volume", json!(500.0)), ("ghg_eec", json!(4.1)), ("period", json!(202402))]),
        );

        assert_eq!(mapped, values(&[("ghg_eec", json!(4.1)), ("total_volume", json!(500.0))]));
    }

    #[test]
    fn test_batch_to_inventory_renames_site() {
        let mapping = FieldMapping::standard();
        let mapped = mapping.map_hop(
            RecordKind::Batch,
            RecordKind::Inventory,
            &values(&[("delivery_site_id", json!("DEPOT-7")), ("volume", json!(10.0))]),
        );

        assert_eq!(mapped, values(&[("site_id", json!("DEPOT-7"))]));
    }

    #[test]
    fn test_transformation_hop_excludes_identity() {
        let mapping = FieldMapping::standard();
        let mapped = mapping.map_hop(
            RecordKind::InventoryTransformation,
            RecordKind::Inventory,
            &values(&[
                ("biofuel_code", json!("ETBE")),
                ("feedstock_code", json!("BLE")),
                ("country_of_origin", json!("DE")),
                ("ghg_total", json!(20.0)),
            ]),
        );

        assert_eq!(
            mapped,
            values(&[("country_of_origin", json!("DE")), ("ghg_total", json!(20.0))])
        );
    }

    #[test]
    fn test_certificate_drops_cumulative_quantity() {
        let mapping = FieldMapping::standard();
        let mapped = mapping.map_hop(
            RecordKind::CertificateSource,
            RecordKind::Certificate,
            &values(&[("total_volume", json!(9.0))]),
        );
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_unmapped_pair_carries_nothing() {
        let mapping = FieldMapping::standard();
        let mapped = mapping.map_hop(
            RecordKind::Certificate,
            RecordKind::Batch,
            &values(&[("ghg_total", json!(1.0))]),
        );
        assert!(mapped.is_empty());
    }

    #[test]
    fn test_mapping_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"from": "batch", "to": "certificate_source", "copy": ["ghg_total"],
                  "rename": {{"volume": "total_volume"}}}},
                {{"from": "inventory_transformation", "to": "inventory", "copy": ["biofuel_code"],
                  "exclude": ["biofuel_code"]}}
            ]"#
        )
        .unwrap();

        let mapping = FieldMapping::from_file(file.path()).unwrap();

        let rule = mapping.rule(RecordKind::Batch, RecordKind::CertificateSource).unwrap();
        assert_eq!(rule.copy, vec!["ghg_total".to_string()]);
        assert_eq!(rule.rename.get("volume"), Some(&"total_volume".to_string()));
        let mapped = mapping.map_hop(
            RecordKind::InventoryTransformation,
            RecordKind::Inventory,
            &values(&[("biofuel_code", json!("ETBE"))]),
        );
        assert!(mapped.is_empty());
        assert!(mapping.rule(RecordKind::Batch, RecordKind::Batch).is_none());
    }

    fn batch_with_certificate(store: &SqliteStore) -> (Node, Node, Node) {
        let batch = store
            .insert(Batch { volume: 100.0, biofuel_code: Some("HVO".to_string()), ..Default::default() })
            .unwrap();
        let source = store
            .insert(CertificateSource { parent_batch_id: Some(batch.id()), ..Default::default() })
            .unwrap();
        let certificate = store
            .insert(Certificate {
                parent_certificate_source_id: Some(source.id()),
                volume: 40.0,
                ..Default::default()
            })
            .unwrap();

        let (b, s, c) = (Node::wrap(batch), Node::wrap(source), Node::wrap(certificate));
        Node::attach(&b, &s);
        Node::attach(&s, &c);
        (b, s, c)
    }

    #[test]
    fn test_propagate_saves_touched_descendants() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (batch, source, certificate) = batch_with_certificate(&store);

        batch
            .update(values(&[("volume", json!(250.0)), ("ghg_total", json!(18.5))]))
            .unwrap();
        let report = batch.propagate(&store);

        assert!(report.is_complete());
        assert_eq!(
            report.saved,
            vec![batch.record_ref(), source.record_ref(), certificate.record_ref()]
        );

        let saved_batch = store.load_one(batch.record_ref()).unwrap().unwrap();
        assert_eq!(saved_batch.field("volume"), Some(json!(250.0)));

        let saved_source = store.load_one(source.record_ref()).unwrap().unwrap();
        assert_eq!(saved_source.field("total_volume"), Some(json!(250.0)));
        assert_eq!(saved_source.field("ghg_total"), Some(json!(18.5)));

        let saved_certificate = store.load_one(certificate.record_ref()).unwrap().unwrap();
        assert_eq!(saved_certificate.field("ghg_total"), Some(json!(18.5)));
        assert_eq!(saved_certificate.field("volume"), Some(json!(40.0)));
    }

    #[test]
    fn test_propagate_leaves_unmentioned_fields_alone() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (batch, source, _) = batch_with_certificate(&store);
        let before = store.load_one(source.record_ref()).unwrap().unwrap();

        batch.update(values(&[("ghg_ep", json!(2.0))])).unwrap();
        batch.propagate(&store);

        let after = store.load_one(source.record_ref()).unwrap().unwrap();
        let mut before_fields = before.to_fields().unwrap();
        before_fields.insert("ghg_ep".to_string(), json!(2.0));
        assert_eq!(after.to_fields().unwrap(), before_fields);
    }

    #[test]
    fn test_transformation_is_relayed_but_not_saved() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = store.insert(Inventory::default()).unwrap();
        let transformation = store
            .insert(InventoryTransformation {
                source_inventory_id: Some(source.id()),
                ..Default::default()
            })
            .unwrap();
        let destination = store
            .insert(Inventory {
                parent_transformation_id: Some(transformation.id()),
                ..Default::default()
            })
            .unwrap();

        let (s, t, d) = (Node::wrap(source), Node::wrap(transformation), Node::wrap(destination));
        Node::attach(&s, &t);
        Node::attach(&t, &d);

        s.update(values(&[("ghg_eu", json!(0.5))])).unwrap();
        let report = s.propagate(&store);

        assert_eq!(report.visited, 2);
        assert_eq!(report.saved, vec![s.record_ref(), d.record_ref()]);
        assert_eq!(d.record().field("ghg_eu"), Some(json!(0.5)));
    }

    #[test]
    fn test_save_failure_is_reported_per_descendant() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = store.insert(Batch::default()).unwrap();
        let gone = store
            .insert(Batch { parent_batch_id: Some(batch.id()), ..Default::default() })
            .unwrap();
        let kept = store
            .insert(Batch { parent_batch_id: Some(batch.id()), ..Default::default() })
            .unwrap();

        let (root, a, b) = (Node::wrap(batch), Node::wrap(gone.clone()), Node::wrap(kept.clone()));
        Node::attach(&root, &a);
        Node::attach(&root, &b);
        store
            .connection()
            .execute("DELETE FROM batches WHERE id = ?1", [gone.id()])
            .unwrap();

        root.update(values(&[("ghg_total", json!(7.0))])).unwrap();
        let report = root.propagate(&store);

        assert_eq!(report.saved, vec![root.record_ref(), kept.record_ref()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].record, gone.record_ref());
        assert!(report.failures[0].error.contains("Record not found"));

        // The failed node's in-memory copy still matches what was stored
        assert_eq!(a.record().field("ghg_total"), Some(json!(0.0)));
        assert_eq!(b.record().field("ghg_total"), Some(json!(7.0)));

        assert!(matches!(
            report.into_result(),
            Err(LineageError::PropagationIncomplete { failed: 1, saved: 2 })
        ));
    }

    #[test]
    fn test_stop_at_first_failure_when_configured() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = store.insert(Batch::default()).unwrap();
        let gone = store
            .insert(Batch { parent_batch_id: Some(batch.id()), ..Default::default() })
            .unwrap();
        let kept = store
            .insert(Batch { parent_batch_id: Some(batch.id()), ..Default::default() })
            .unwrap();

        let (root, a, b) = (Node::wrap(batch), Node::wrap(gone.clone()), Node::wrap(kept));
        Node::attach(&root, &a);
        Node::attach(&root, &b);
        store
            .connection()
            .execute("DELETE FROM batches WHERE id = ?1", [gone.id()])
            .unwrap();

        let config = LineageConfig { continue_on_save_failure: false, ..Default::default() };
        let engine = PropagationEngine::new(FieldMapping::standard(), &config);
        root.update(values(&[("ghg_total", json!(7.0))])).unwrap();
        let report = engine.propagate(&root, &store);

        assert_eq!(report.saved, vec![root.record_ref()]);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_propagate_saves_the_origin() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (batch, source, _) = batch_with_certificate(&store);

        batch.update(values(&[("ghg_total", json!(9.0))])).unwrap();
        batch.propagate(&store).into_result().unwrap();

        let saved_batch = store.load_one(batch.record_ref()).unwrap().unwrap();
        assert_eq!(saved_batch.field("ghg_total"), Some(json!(9.0)));
        let saved_source = store.load_one(source.record_ref()).unwrap().unwrap();
        assert_eq!(saved_source.field("ghg_total"), Some(json!(9.0)));
    }

    #[test]
    fn test_origin_without_own_fields_is_not_saved() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (batch, source, _) = batch_with_certificate(&store);

        // Only a certificate source holds this field
        batch.update(values(&[("total_volume", json!(12.0))])).unwrap();
        let report = batch.propagate(&store);

        assert!(report.is_complete());
        assert!(report.saved.is_empty());
        assert_eq!(
            store.load_one(source.record_ref()).unwrap().unwrap().field("total_volume"),
            Some(json!(0.0))
        );
    }

    #[test]
    fn test_origin_save_failure_stops_when_configured() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (batch, source, _) = batch_with_certificate(&store);
        store
            .connection()
            .execute("DELETE FROM batches WHERE id = ?1", [batch.id()])
            .unwrap();

        let config = LineageConfig { continue_on_save_failure: false, ..Default::default() };
        let engine = PropagationEngine::new(FieldMapping::standard(), &config);
        batch.update(values(&[("ghg_total", json!(3.0))])).unwrap();
        let report = engine.propagate(&batch, &store);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].record, batch.record_ref());
        assert_eq!(report.visited, 0);
        assert_eq!(
            store.load_one(source.record_ref()).unwrap().unwrap().field("ghg_total"),
            Some(json!(0.0))
        );
        assert_eq!(batch.record().field("ghg_total"), Some(json!(3.0)));
    }

    #[test]
    fn test_report_summary() {
        let report = PropagationReport::new(RecordRef::new(RecordKind::Batch, 3));
        assert_eq!(report.summary(), "Propagation from batch#3: 0 visited, 0 saved, 0 failed");
        assert!(report.into_result().is_ok());
    }
}
