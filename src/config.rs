// ⚙️ Lineage configuration
// Plain data with defaults; optionally loaded from a JSON file

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How the family closure is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureStrategy {
    /// One WITH RECURSIVE query, ascend then descend
    #[default]
    RecursiveQuery,

    /// Load the next frontier of matching rows until no new ids appear
    IterativeFrontier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineageConfig {
    pub closure: ClosureStrategy,

    /// Hide soft-deleted batches from every step of resolution
    pub exclude_tombstoned: bool,

    /// Upper bound on frontier rounds for the iterative strategy
    pub max_frontier_rounds: usize,

    /// Keep walking siblings after a descendant fails to save
    pub continue_on_save_failure: bool,
}

impl Default for LineageConfig {
    fn default() -> Self {
        LineageConfig {
            closure: ClosureStrategy::RecursiveQuery,
            exclude_tombstoned: true,
            max_frontier_rounds: 10_000,
            continue_on_save_failure: true,
        }
    }
}

impl LineageConfig {
    /// Load configuration from a JSON file; missing keys keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read lineage config: {:?}", path.as_ref()))?;

        serde_json::from_str(&content).context("Failed to parse lineage config JSON")
    }

    pub fn with_closure(mut self, closure: ClosureStrategy) -> Self {
        self.closure = closure;
        self
    }
}
