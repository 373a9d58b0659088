//! Storage trait definitions

use crate::flow::{
    DerivedId, DerivedRecord, DiscoveryFlow, FlowId, PhaseId, SourceId, SourceRecord,
};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Referential integrity violation: {0}")]
    Integrity(String),

    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Date parsing error: {0}")]
    DateParse(String),
}

impl StorageError {
    /// Busy/locked database errors are retried as a whole-commit retry;
    /// everything else is fatal to the operation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Conflict(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Everything one phase commit writes, batched so the backend can apply it
/// in a single transaction.
///
/// `flow` carries the post-transition state (phase marked `Completed`);
/// `links` pairs each source row with the derived record that now owns it.
#[derive(Debug)]
pub struct CommitBundle {
    pub flow: DiscoveryFlow,
    pub phase: PhaseId,
    pub artifact: serde_json::Value,
    pub derived: Vec<DerivedRecord>,
    pub links: Vec<(SourceId, DerivedId)>,
}

/// Trait for flow persistence backends
///
/// Implementations must be thread-safe (Send + Sync) and must apply
/// `commit_phase` atomically: either every write in the bundle lands or
/// none of them do.
pub trait FlowStore: Send + Sync {
    // === Flow Operations ===

    /// Create a flow and its source records in one transaction.
    fn create_flow(&self, flow: &DiscoveryFlow, sources: &[SourceRecord]) -> StorageResult<()>;

    /// Load a flow by ID
    fn load_flow(&self, id: &FlowId) -> StorageResult<Option<DiscoveryFlow>>;

    /// Persist flow-level state (statuses, errors, cancelled flag).
    fn update_flow(&self, flow: &DiscoveryFlow) -> StorageResult<()>;

    /// List all flow IDs
    fn list_flows(&self) -> StorageResult<Vec<FlowId>>;

    /// Delete a flow and everything hanging off it.
    fn delete_flow(&self, id: &FlowId) -> StorageResult<bool>;

    // === Record Operations ===

    /// Source records for a flow, in row order.
    fn source_records(&self, flow_id: &FlowId) -> StorageResult<Vec<SourceRecord>>;

    /// Derived records for a flow.
    fn derived_records(&self, flow_id: &FlowId) -> StorageResult<Vec<DerivedRecord>>;

    /// Artifacts committed so far, keyed by phase.
    fn artifacts(&self, flow_id: &FlowId) -> StorageResult<BTreeMap<PhaseId, serde_json::Value>>;

    // === Atomic Phase Commit ===

    /// Apply a phase commit bundle in one transaction: insert derived
    /// records, set source back-references and processed flags, store the
    /// artifact, and update the flow row. Any failure rolls everything back.
    fn commit_phase(&self, bundle: &CommitBundle) -> StorageResult<()>;

    /// Clear derived records, linkage, and artifacts for a flow (full reset).
    fn clear_flow_outputs(&self, flow_id: &FlowId) -> StorageResult<()>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: FlowStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
