//! Transport-independent API surface
//!
//! `SurveyorApi` wires the stores, the learning engine, and the flow
//! manager together behind one entry point. The CLI is a thin shell over
//! this; an eventual service layer would sit on it the same way.

use crate::flow::{
    DiscoveryFlow, FlowConfig, FlowError, FlowId, FlowStateManager, PhaseId, PhaseReport,
    PhaseStatus, TenantId,
};
use crate::learn::thresholds::OperationType;
use crate::learn::{
    Adjustment, Embedder, HashEmbedder, LearnError, PatternId, PatternStore, Suggester,
    Suggestion, ThresholdManager,
};
use crate::phase::ExecutorRegistry;
use crate::provider::{AnalysisProvider, MockProvider};
use crate::storage::{FlowStore, OpenStore, SqliteFlowStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Learn(#[from] LearnError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Flow state as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStatusView {
    pub id: String,
    pub tenant: String,
    pub current_phase: Option<PhaseId>,
    pub phase_statuses: BTreeMap<PhaseId, PhaseStatus>,
    pub phase_errors: BTreeMap<PhaseId, String>,
    pub cancelled: bool,
    pub complete: bool,
}

impl From<&DiscoveryFlow> for FlowStatusView {
    fn from(flow: &DiscoveryFlow) -> Self {
        Self {
            id: flow.id.to_string(),
            tenant: flow.tenant.key(),
            current_phase: flow.current_phase,
            phase_statuses: flow.phase_statuses.clone(),
            phase_errors: flow.phase_errors.clone(),
            cancelled: flow.cancelled,
            complete: flow.is_complete(),
        }
    }
}

pub struct SurveyorApi {
    manager: FlowStateManager,
    suggester: Arc<Suggester>,
}

impl SurveyorApi {
    /// Open the API over databases under `dir`, with the given provider.
    pub fn open(dir: impl AsRef<Path>, provider: Arc<dyn AnalysisProvider>) -> ApiResult<Self> {
        let dir = dir.as_ref();
        let store: Arc<dyn FlowStore> = Arc::new(SqliteFlowStore::open(dir.join("flows.db"))?);
        let patterns = Arc::new(PatternStore::open(dir.join("patterns.db"))?);
        let thresholds = Arc::new(ThresholdManager::open(dir.join("thresholds.db"))?);
        Ok(Self::assemble(store, patterns, thresholds, provider))
    }

    /// Fully in-memory API, used by tests and dry runs.
    pub fn in_memory(provider: Arc<dyn AnalysisProvider>) -> ApiResult<Self> {
        let store: Arc<dyn FlowStore> = Arc::new(SqliteFlowStore::open_in_memory()?);
        let patterns = Arc::new(PatternStore::open_in_memory()?);
        let thresholds = Arc::new(ThresholdManager::open_in_memory()?);
        Ok(Self::assemble(store, patterns, thresholds, provider))
    }

    fn assemble(
        store: Arc<dyn FlowStore>,
        patterns: Arc<PatternStore>,
        thresholds: Arc<ThresholdManager>,
        provider: Arc<dyn AnalysisProvider>,
    ) -> Self {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new());
        let suggester = Arc::new(Suggester::new(
            embedder.clone(),
            patterns,
            thresholds,
            FlowConfig::default(),
        ));
        let manager = FlowStateManager::new(
            store,
            ExecutorRegistry::standard(),
            suggester.clone(),
            provider,
            embedder,
        );
        Self { manager, suggester }
    }

    /// Offline API: no external provider, local heuristics only.
    pub fn offline(dir: impl AsRef<Path>) -> ApiResult<Self> {
        Self::open(dir, Arc::new(MockProvider::unavailable()))
    }

    // === Flow operations ===

    pub fn start_flow(
        &self,
        tenant: TenantId,
        rows: Vec<serde_json::Value>,
        config: FlowConfig,
    ) -> ApiResult<FlowId> {
        Ok(self.manager.start_flow(tenant, rows, config)?)
    }

    pub fn get_flow_status(&self, id: &FlowId) -> ApiResult<FlowStatusView> {
        Ok(FlowStatusView::from(&self.manager.flow(id)?))
    }

    pub fn list_flows(&self) -> ApiResult<Vec<FlowId>> {
        Ok(self.manager.list_flows()?)
    }

    pub async fn advance_flow(&self, id: &FlowId) -> ApiResult<PhaseReport> {
        Ok(self.manager.advance(id).await?)
    }

    pub async fn run_flow(&self, id: &FlowId) -> ApiResult<PhaseReport> {
        Ok(self.manager.run_to_completion(id).await?)
    }

    pub async fn resume_flow(&self, id: &FlowId) -> ApiResult<PhaseReport> {
        Ok(self.manager.resume(id).await?)
    }

    pub async fn cancel_flow(&self, id: &FlowId) -> ApiResult<()> {
        Ok(self.manager.cancel(id).await?)
    }

    pub async fn reset_flow(&self, id: &FlowId) -> ApiResult<()> {
        Ok(self.manager.reset(id).await?)
    }

    /// Returns false when no such flow exists.
    pub async fn delete_flow(&self, id: &FlowId) -> ApiResult<bool> {
        Ok(self.manager.delete_flow(id).await?)
    }

    // === Learning operations ===

    pub fn suggest_mapping(
        &self,
        tenant: &TenantId,
        field_signature: &str,
        sample_values: &[String],
    ) -> ApiResult<Vec<Suggestion>> {
        Ok(self.suggester.suggest(
            tenant,
            OperationType::FieldMapping,
            field_signature,
            sample_values,
        )?)
    }

    /// A user rejected a suggestion and supplied the right answer.
    pub fn submit_correction(
        &self,
        tenant: &TenantId,
        operation: OperationType,
        wrong_pattern: Option<&PatternId>,
        field_signature: &str,
        sample_values: &[String],
        corrected_target: &str,
    ) -> ApiResult<PatternId> {
        Ok(self.suggester.learn_correction(
            tenant,
            operation,
            wrong_pattern,
            field_signature,
            sample_values,
            corrected_target,
        )?)
    }

    pub fn threshold_history(
        &self,
        tenant: &TenantId,
        operation: OperationType,
    ) -> ApiResult<Vec<Adjustment>> {
        Ok(self.suggester.thresholds().history(tenant, operation)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> SurveyorApi {
        SurveyorApi::in_memory(Arc::new(MockProvider::unavailable())).unwrap()
    }

    #[tokio::test]
    async fn full_flow_through_the_api() {
        let api = api();
        let tenant = TenantId::new("acme", "wave-1");
        let id = api
            .start_flow(
                tenant,
                vec![json!({"host": "web-01"}), json!({"host": "db-01"})],
                FlowConfig::default(),
            )
            .unwrap();

        let report = api.run_flow(&id).await.unwrap();
        assert!(matches!(report, PhaseReport::AllComplete));

        let status = api.get_flow_status(&id).unwrap();
        assert!(status.complete);
        assert!(status.phase_errors.is_empty());
        assert_eq!(api.list_flows().unwrap(), vec![id]);

        assert!(api.delete_flow(&id).await.unwrap());
        assert!(api.list_flows().unwrap().is_empty());
    }

    #[tokio::test]
    async fn correction_feeds_the_next_suggestion() {
        let api = api();
        let tenant = TenantId::new("acme", "wave-1");
        let samples = vec!["1".to_string(), "2".to_string()];

        assert!(api.suggest_mapping(&tenant, "DR_TIER", &samples).unwrap().is_empty());

        api.submit_correction(
            &tenant,
            OperationType::FieldMapping,
            None,
            "DR_TIER",
            &samples,
            "business_criticality",
        )
        .unwrap();

        let suggestions = api.suggest_mapping(&tenant, "DR_TIER", &samples).unwrap();
        assert_eq!(suggestions[0].target, "business_criticality");
    }
}
