//! Discovery flow state machine

pub mod manager;
pub mod types;

pub use manager::{FlowError, FlowResult, FlowStateManager, PhaseReport};
pub use types::{
    fingerprint, DerivedId, DerivedRecord, DiscoveryFlow, FlowConfig, FlowId, PhaseId,
    PhaseStatus, SourceId, SourceRecord, TenantId, TransitionError,
};
