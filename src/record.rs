// 🛢️ Record Kinds - the five persisted shapes of material lineage
//
// Batch → Inventory → Transformation → Inventory → ... → CertificateSource → Certificate
//
// Every record has at most one parent, of exactly one kind. Field values cross
// the lineage as serde_json values and are patched into the typed structs by name.

use crate::error::LineageError;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Staged field edits: field name → value
pub type FieldValues = BTreeMap<String, Value>;

// ============================================================================
// RECORD KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Discrete quantity of material with a single physical origin
    Batch,

    /// Pooled material, possibly merged from several batches
    Inventory,

    /// Converts a source inventory into a physically different destination inventory
    InventoryTransformation,

    /// Material set aside for certificate issuance
    CertificateSource,

    /// Issued tradeable unit
    Certificate,
}

/// A nullable parent column and the kind it points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLink {
    pub column: &'static str,
    pub kind: RecordKind,
}

/// GHG decomposition figures plus totals, shared by every kind that carries material
pub const GHG_FIELDS: &[&str] = &[
    "ghg_eec",
    "ghg_el",
    "ghg_ep",
    "ghg_etd",
    "ghg_eu",
    "ghg_esca",
    "ghg_eccs",
    "ghg_eccr",
    "ghg_eee",
    "ghg_total",
    "ghg_reduction",
];

/// What the material physically is
pub const IDENTITY_FIELDS: &[&str] = &["biofuel_code", "feedstock_code", "country_of_origin"];

impl RecordKind {
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Batch,
        RecordKind::Inventory,
        RecordKind::InventoryTransformation,
        RecordKind::CertificateSource,
        RecordKind::Certificate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Batch => "batch",
            RecordKind::Inventory => "inventory",
            RecordKind::InventoryTransformation => "inventory_transformation",
            RecordKind::CertificateSource => "certificate_source",
            RecordKind::Certificate => "certificate",
        }
    }

    pub fn parse(s: &str) -> Option<RecordKind> {
        RecordKind::ALL.into_iter().find(|kind| kind.as_str() == s)
    }

    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Batch => "batches",
            RecordKind::Inventory => "inventories",
            RecordKind::InventoryTransformation => "inventory_transformations",
            RecordKind::CertificateSource => "certificate_sources",
            RecordKind::Certificate => "certificates",
        }
    }

    /// Parent columns in precedence order: the first non-null one is the parent
    pub fn parent_links(&self) -> &'static [ParentLink] {
        match self {
            RecordKind::Batch => &[
                ParentLink { column: "parent_batch_id", kind: RecordKind::Batch },
                ParentLink { column: "parent_inventory_id", kind: RecordKind::Inventory },
            ],
            RecordKind::Inventory => &[
                ParentLink { column: "parent_batch_id", kind: RecordKind::Batch },
                ParentLink {
                    column: "parent_transformation_id",
                    kind: RecordKind::InventoryTransformation,
                },
            ],
            RecordKind::InventoryTransformation => &[ParentLink {
                column: "source_inventory_id",
                kind: RecordKind::Inventory,
            }],
            RecordKind::CertificateSource => &[
                ParentLink { column: "parent_batch_id", kind: RecordKind::Batch },
                ParentLink { column: "parent_certificate_id", kind: RecordKind::Certificate },
            ],
            RecordKind::Certificate => &[ParentLink {
                column: "parent_certificate_source_id",
                kind: RecordKind::CertificateSource,
            }],
        }
    }

    /// Tombstone column, if this kind can be soft-deleted
    pub fn tombstone_column(&self) -> Option<&'static str> {
        match self {
            RecordKind::Batch => Some("is_deleted"),
            _ => None,
        }
    }

    /// Kind-specific value columns (GHG block excluded)
    fn own_fields(&self) -> &'static [&'static str] {
        match self {
            RecordKind::Batch => &[
                "period",
                "biofuel_code",
                "feedstock_code",
                "country_of_origin",
                "volume",
                "delivery_site_id",
                "delivery_site_country",
            ],
            RecordKind::Inventory => &[
                "biofuel_code",
                "feedstock_code",
                "country_of_origin",
                "remaining_volume",
                "site_id",
                "site_country",
            ],
            RecordKind::InventoryTransformation => {
                &["transformation_type", "volume_deducted", "volume_destination"]
            }
            RecordKind::CertificateSource => &[
                "biofuel_code",
                "feedstock_code",
                "country_of_origin",
                "total_volume",
                "delivery_site_id",
            ],
            RecordKind::Certificate => &[
                "certificate_number",
                "biofuel_code",
                "feedstock_code",
                "country_of_origin",
                "volume",
            ],
        }
    }

    pub fn carries_ghg(&self) -> bool {
        !matches!(self, RecordKind::InventoryTransformation)
    }

    /// Fields a staged update may write on this kind
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = self.own_fields().to_vec();
        if self.carries_ghg() {
            fields.extend_from_slice(GHG_FIELDS);
        }
        fields
    }

    /// Every persisted column: id, parent links, tombstone, then fields
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["id"];
        columns.extend(self.parent_links().iter().map(|link| link.column));
        columns.extend(self.tombstone_column());
        columns.extend(self.fields());
        columns
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.own_fields().contains(&name) || (self.carries_ghg() && GHG_FIELDS.contains(&name))
    }

    pub fn is_structural(&self, name: &str) -> bool {
        name == "id"
            || self.parent_links().iter().any(|link| link.column == name)
            || self.tombstone_column() == Some(name)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when some kind persists a field with this name
pub fn is_known_field(name: &str) -> bool {
    RecordKind::ALL.iter().any(|kind| kind.has_field(name))
}

/// True when the name is a structural column on any kind
pub fn is_structural_field(name: &str) -> bool {
    RecordKind::ALL.iter().any(|kind| kind.is_structural(name))
}

// ============================================================================
// RECORD REFERENCE
// ============================================================================

/// (kind, id) - ids are only unique within a kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub kind: RecordKind,
    pub id: i64,
}

impl RecordRef {
    pub fn new(kind: RecordKind, id: i64) -> Self {
        RecordRef { kind, id }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

// ============================================================================
// GHG FIGURES
// ============================================================================

/// Physical property of the material; identical at every hop of a lineage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GhgFigures {
    /// Extraction or cultivation
    #[serde(default)]
    pub ghg_eec: f64,
    /// Land-use change
    #[serde(default)]
    pub ghg_el: f64,
    /// Processing
    #[serde(default)]
    pub ghg_ep: f64,
    /// Transport and distribution
    #[serde(default)]
    pub ghg_etd: f64,
    /// Fuel in use
    #[serde(default)]
    pub ghg_eu: f64,
    /// Soil carbon accumulation
    #[serde(default)]
    pub ghg_esca: f64,
    /// Carbon capture and geological storage
    #[serde(default)]
    pub ghg_eccs: f64,
    /// Carbon capture and replacement
    #[serde(default)]
    pub ghg_eccr: f64,
    /// Excess electricity from cogeneration
    #[serde(default)]
    pub ghg_eee: f64,
    #[serde(default)]
    pub ghg_total: f64,
    #[serde(default)]
    pub ghg_reduction: f64,
}

// ============================================================================
// RECORD STRUCTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: i64,
    pub parent_batch_id: Option<i64>,
    pub parent_inventory_id: Option<i64>,

    /// Tombstoned batches are invisible to lineage resolution
    #[serde(default, deserialize_with = "flag")]
    pub is_deleted: bool,

    /// Delivery period as YYYYMM
    pub period: Option<i64>,
    pub biofuel_code: Option<String>,
    pub feedstock_code: Option<String>,
    pub country_of_origin: Option<String>,
    #[serde(default)]
    pub volume: f64,
    pub delivery_site_id: Option<String>,
    pub delivery_site_country: Option<String>,

    #[serde(flatten)]
    pub ghg: GhgFigures,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub id: i64,
    pub parent_batch_id: Option<i64>,
    pub parent_transformation_id: Option<i64>,
    pub biofuel_code: Option<String>,
    pub feedstock_code: Option<String>,
    pub country_of_origin: Option<String>,
    #[serde(default)]
    pub remaining_volume: f64,
    pub site_id: Option<String>,
    pub site_country: Option<String>,

    #[serde(flatten)]
    pub ghg: GhgFigures,
}

/// The destination inventory points here; this record points at the source inventory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryTransformation {
    pub id: i64,
    pub source_inventory_id: Option<i64>,
    /// e.g. "ETH_ETBE"
    pub transformation_type: Option<String>,
    #[serde(default)]
    pub volume_deducted: f64,
    #[serde(default)]
    pub volume_destination: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateSource {
    pub id: i64,
    pub parent_batch_id: Option<i64>,
    pub parent_certificate_id: Option<i64>,
    pub biofuel_code: Option<String>,
    pub feedstock_code: Option<String>,
    pub country_of_origin: Option<String>,
    /// Cumulative quantity earmarked for issuance
    #[serde(default)]
    pub total_volume: f64,
    pub delivery_site_id: Option<String>,

    #[serde(flatten)]
    pub ghg: GhgFigures,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: i64,
    pub parent_certificate_source_id: Option<i64>,
    pub certificate_number: Option<String>,
    pub biofuel_code: Option<String>,
    pub feedstock_code: Option<String>,
    pub country_of_origin: Option<String>,
    #[serde(default)]
    pub volume: f64,

    #[serde(flatten)]
    pub ghg: GhgFigures,
}

/// SQLite hands booleans back as integers
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Int(value) => value != 0,
    })
}

// ============================================================================
// RECORD (tagged union over the five kinds)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Batch(Batch),
    Inventory(Inventory),
    InventoryTransformation(InventoryTransformation),
    CertificateSource(CertificateSource),
    Certificate(Certificate),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Batch(_) => RecordKind::Batch,
            Record::Inventory(_) => RecordKind::Inventory,
            Record::InventoryTransformation(_) => RecordKind::InventoryTransformation,
            Record::CertificateSource(_) => RecordKind::CertificateSource,
            Record::Certificate(_) => RecordKind::Certificate,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Record::Batch(r) => r.id,
            Record::Inventory(r) => r.id,
            Record::InventoryTransformation(r) => r.id,
            Record::CertificateSource(r) => r.id,
            Record::Certificate(r) => r.id,
        }
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        match self {
            Record::Batch(r) => r.id = id,
            Record::Inventory(r) => r.id = id,
            Record::InventoryTransformation(r) => r.id = id,
            Record::CertificateSource(r) => r.id = id,
            Record::Certificate(r) => r.id = id,
        }
    }

    pub fn record_ref(&self) -> RecordRef {
        RecordRef::new(self.kind(), self.id())
    }

    /// Stored parent reference (first non-null link wins)
    pub fn parent(&self) -> Option<RecordRef> {
        let link = |id: Option<i64>, kind| id.map(|id| RecordRef::new(kind, id));
        match self {
            Record::Batch(r) => link(r.parent_batch_id, RecordKind::Batch)
                .or_else(|| link(r.parent_inventory_id, RecordKind::Inventory)),
            Record::Inventory(r) => link(r.parent_batch_id, RecordKind::Batch).or_else(|| {
                link(r.parent_transformation_id, RecordKind::InventoryTransformation)
            }),
            Record::InventoryTransformation(r) => {
                link(r.source_inventory_id, RecordKind::Inventory)
            }
            Record::CertificateSource(r) => link(r.parent_batch_id, RecordKind::Batch)
                .or_else(|| link(r.parent_certificate_id, RecordKind::Certificate)),
            Record::Certificate(r) => {
                link(r.parent_certificate_source_id, RecordKind::CertificateSource)
            }
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        matches!(self, Record::Batch(b) if b.is_deleted)
    }

    /// Column name → value, one entry per persisted column
    pub fn to_fields(&self) -> serde_json::Result<Map<String, Value>> {
        let value = match self {
            Record::Batch(r) => serde_json::to_value(r)?,
            Record::Inventory(r) => serde_json::to_value(r)?,
            Record::InventoryTransformation(r) => serde_json::to_value(r)?,
            Record::CertificateSource(r) => serde_json::to_value(r)?,
            Record::Certificate(r) => serde_json::to_value(r)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "{} did not serialize to an object: {}",
                self.kind(),
                other
            ))),
        }
    }

    pub fn from_fields(kind: RecordKind, fields: Map<String, Value>) -> serde_json::Result<Record> {
        fn typed<T: DeserializeOwned>(fields: Map<String, Value>) -> serde_json::Result<T> {
            serde_json::from_value(Value::Object(fields))
        }

        Ok(match kind {
            RecordKind::Batch => Record::Batch(typed(fields)?),
            RecordKind::Inventory => Record::Inventory(typed(fields)?),
            RecordKind::InventoryTransformation => Record::InventoryTransformation(typed(fields)?),
            RecordKind::CertificateSource => Record::CertificateSource(typed(fields)?),
            RecordKind::Certificate => Record::Certificate(typed(fields)?),
        })
    }

    /// Current value of a field by name
    pub fn field(&self, name: &str) -> Option<Value> {
        self.to_fields().ok()?.remove(name)
    }

    /// Write every value whose field exists on this kind; other names are skipped.
    /// Returns the names actually written. The record is left untouched on error.
    pub fn apply(&mut self, values: &FieldValues) -> Result<Vec<String>, LineageError> {
        let kind = self.kind();
        let applicable: Vec<(&String, &Value)> = values
            .iter()
            .filter(|(name, _)| kind.has_field(name))
            .collect();

        if applicable.is_empty() {
            return Ok(Vec::new());
        }

        let record = self.record_ref();
        let type_error = |e: serde_json::Error| LineageError::FieldType {
            record,
            message: e.to_string(),
        };

        let mut fields = self.to_fields().map_err(type_error)?;
        for (name, value) in &applicable {
            fields.insert((*name).clone(), (*value).clone());
        }

        *self = Record::from_fields(kind, fields).map_err(type_error)?;

        Ok(applicable.into_iter().map(|(name, _)| name.clone()).collect())
    }
}

impl From<Batch> for Record {
    fn from(record: Batch) -> Self {
        Record::Batch(record)
    }
}

impl From<Inventory> for Record {
    fn from(record: Inventory) -> Self {
        Record::Inventory(record)
    }
}

impl From<InventoryTransformation> for Record {
    fn from(record: InventoryTransformation) -> Self {
        Record::InventoryTransformation(record)
    }
}

impl From<CertificateSource> for Record {
    fn from(record: CertificateSource) -> Self {
        Record::CertificateSource(record)
    }
}

impl From<Certificate> for Record {
    fn from(record: Certificate) -> Self {
        Record::Certificate(record)
    }
}

// ============================================================================
// TESTS
// ============================================================================
