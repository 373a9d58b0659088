//! Surveyor: resumable infrastructure discovery flows with pattern learning
//!
//! Surveyor drives imported infrastructure exports through a multi-phase
//! discovery pipeline (field mapping, cleansing, inventory, dependency
//! mapping, debt analysis). Every completed phase is persisted atomically,
//! so a flow can be resumed after a crash from its last durable frontier.
//! A tenant-scoped pattern store learns field mappings from corrections and
//! bootstraps new tenants with synthesized starter patterns.
//!
//! Entry points: [`api::SurveyorApi`] for embedding, the `surveyor` binary
//! for the command line.

pub mod api;
pub mod flow;
pub mod learn;
pub mod phase;
pub mod provider;
pub mod storage;

pub use api::{ApiError, ApiResult, FlowStatusView, SurveyorApi};
pub use flow::{
    DiscoveryFlow, FlowConfig, FlowError, FlowId, FlowStateManager, PhaseId, PhaseReport,
    PhaseStatus, TenantId,
};
pub use learn::{Pattern, PatternId, PatternScope, Suggestion};
pub use provider::{AnalysisProvider, MockProvider, ProviderError};
pub use storage::{FlowStore, SqliteFlowStore, StorageError};

/// Crate version, as published.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
