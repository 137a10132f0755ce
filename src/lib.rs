// Fuel Lineage - Core Library
// Batch / inventory / certificate families: resolve once, edit a node, cascade downstream

pub mod error;
pub mod record;      // Five record kinds, one interface
pub mod config;
pub mod store;       // SQLite persistence + the RecordStore seam
pub mod closure;     // Family closure: recursive query or frontier loop
pub mod node;
pub mod resolver;
pub mod propagation; // Per kind-pair field mapping + cascade

// Re-export commonly used types
pub use error::LineageError;
pub use record::{
    Batch, Certificate, CertificateSource, FieldValues, GhgFigures, Inventory,
    InventoryTransformation, ParentLink, Record, RecordKind, RecordRef,
    GHG_FIELDS, IDENTITY_FIELDS,
    is_known_field, is_structural_field,
};
pub use config::{ClosureStrategy, LineageConfig};
pub use store::{setup_database, RecordStore, SqliteStore};
pub use closure::{iterative_family, recursive_family, LineageEdge};
pub use node::Node;
pub use resolver::{resolve, LineageResolver, Resolution};
pub use propagation::{
    DescendantFailure, FieldMapping, HopEntry, HopRule, PropagationEngine, PropagationReport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
