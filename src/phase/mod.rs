//! Discovery phase executors
//!
//! Each phase is a `PhaseExecutor` behind the registry. Executors compute
//! over a read-only context and return outputs; persistence belongs to the
//! linkage coordinator.

pub mod cleansing;
pub mod debt;
pub mod dependency;
pub mod field_mapping;
pub mod inventory;
pub mod traits;

pub use cleansing::CleansingExecutor;
pub use debt::DebtAnalysisExecutor;
pub use dependency::{DependencyGraph, DependencyMappingExecutor};
pub use field_mapping::FieldMappingExecutor;
pub use inventory::InventoryExecutor;
pub use traits::{
    DerivedDraft, ExecutorRegistry, LinkageRequest, PatternOutcome, PhaseContext, PhaseError,
    PhaseExecutor, PhaseOutput,
};
