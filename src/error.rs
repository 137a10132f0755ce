// Typed errors for the lineage core
// Store plumbing stays on anyhow; these are the conditions callers match on.

use crate::record::{RecordKind, RecordRef};

#[derive(Debug, thiserror::Error)]
pub enum LineageError {
    /// Field name not known to any record kind
    #[error("unknown field `{0}`")]
    UnknownField(String),

    /// Ids, parent references and tombstones are never staged
    #[error("`{field}` is a structural column of {kind} and cannot be staged")]
    StructuralField { kind: RecordKind, field: String },

    /// Value does not fit the field it was staged on
    #[error("invalid value for {record}: {message}")]
    FieldType { record: RecordRef, message: String },

    /// Iterative closure kept finding new rows past the configured guard
    #[error("closure did not converge after {rounds} frontier rounds")]
    FrontierLimit { rounds: usize },

    #[error("propagation incomplete: {failed} descendant(s) failed, {saved} saved")]
    PropagationIncomplete { failed: usize, saved: usize },
}
