//! Phase executor seam
//!
//! Executors are pure with respect to the database: they read the context,
//! compute, and return a `PhaseOutput` describing everything to persist. The
//! linkage coordinator turns that output into a single atomic commit, so an
//! executor error can never leave partial writes behind.

use crate::flow::{DerivedRecord, DiscoveryFlow, FlowConfig, PhaseId, SourceId, SourceRecord, TenantId};
use crate::learn::thresholds::OperationType;
use crate::learn::{LearnError, PatternId, Suggester};
use crate::provider::{AnalysisProvider, ProviderError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Error type for phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("learning error: {0}")]
    Learn(#[from] LearnError),

    #[error("required artifact from phase {0} is missing")]
    MissingArtifact(PhaseId),

    #[error("internal phase error: {0}")]
    Internal(String),
}

/// Everything an executor may read. Assembled by the flow manager from the
/// store before the phase runs; executors never touch the store directly.
pub struct PhaseContext {
    pub flow: DiscoveryFlow,
    pub source_records: Vec<SourceRecord>,
    pub derived_records: Vec<DerivedRecord>,
    /// Artifacts of previously completed phases.
    pub artifacts: BTreeMap<PhaseId, serde_json::Value>,
    pub suggester: Arc<Suggester>,
    pub provider: Arc<dyn AnalysisProvider>,
}

impl PhaseContext {
    pub fn tenant(&self) -> &TenantId {
        &self.flow.tenant
    }

    pub fn config(&self) -> &FlowConfig {
        &self.flow.config
    }

    /// Artifact of a dependency phase, or `MissingArtifact`.
    pub fn require_artifact(&self, phase: PhaseId) -> Result<&serde_json::Value, PhaseError> {
        self.artifacts
            .get(&phase)
            .ok_or(PhaseError::MissingArtifact(phase))
    }
}

/// A derived record before the coordinator mints its identity.
#[derive(Debug, Clone)]
pub struct DerivedDraft {
    pub fields: BTreeMap<String, serde_json::Value>,
    pub confidence: f32,
    pub applied_patterns: Vec<String>,
}

/// Asks the coordinator to link one draft to one source row.
#[derive(Debug, Clone)]
pub struct LinkageRequest {
    /// Index into `PhaseOutput::drafts`.
    pub draft_index: usize,
    pub source: SourceId,
}

/// A pattern usage the manager reports to the learning engine post-commit.
#[derive(Debug, Clone)]
pub struct PatternOutcome {
    pub pattern_id: PatternId,
    pub operation: OperationType,
    /// False means the suggestion was effectively a correction.
    pub accepted: bool,
}

/// Everything one phase produces.
#[derive(Debug, Default)]
pub struct PhaseOutput {
    /// Phase artifact persisted alongside the commit.
    pub artifact: serde_json::Value,
    /// Overall confidence in this phase's output.
    pub confidence: f32,
    pub drafts: Vec<DerivedDraft>,
    pub linkage_requests: Vec<LinkageRequest>,
    pub pattern_outcomes: Vec<PatternOutcome>,
}

/// Trait implemented by each discovery phase.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn id(&self) -> PhaseId;

    /// Whether this phase may run alongside its declaration-order siblings.
    fn parallel_safe(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutput, PhaseError>;
}

/// Registry mapping phase ids to their executors.
pub struct ExecutorRegistry {
    executors: HashMap<PhaseId, Arc<dyn PhaseExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// The five standard discovery executors.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::field_mapping::FieldMappingExecutor));
        registry.register(Arc::new(super::cleansing::CleansingExecutor));
        registry.register(Arc::new(super::inventory::InventoryExecutor));
        registry.register(Arc::new(super::dependency::DependencyMappingExecutor));
        registry.register(Arc::new(super::debt::DebtAnalysisExecutor));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn PhaseExecutor>) {
        self.executors.insert(executor.id(), executor);
    }

    pub fn get(&self, phase: PhaseId) -> Option<Arc<dyn PhaseExecutor>> {
        self.executors.get(&phase).cloned()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_covers_every_phase() {
        let registry = ExecutorRegistry::standard();
        for phase in PhaseId::ALL {
            let executor = registry.get(phase).expect("executor registered");
            assert_eq!(executor.id(), phase);
        }
    }

    #[test]
    fn empty_registry_returns_none() {
        let registry = ExecutorRegistry::new();
        assert!(registry.get(PhaseId::FieldMapping).is_none());
    }
}
