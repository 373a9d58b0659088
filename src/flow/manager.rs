//! Flow state manager
//!
//! Drives a `DiscoveryFlow` through its phases: one phase at a time per
//! flow, enforced by a per-flow async lock, with every completed phase
//! persisted through the linkage coordinator's atomic commit before the
//! next one may start. Flows survive process restarts; `resume` picks up
//! from the last durably completed frontier.

use super::types::{
    fingerprint, DiscoveryFlow, FlowConfig, FlowId, PhaseId, PhaseStatus, SourceRecord, TenantId,
    TransitionError,
};
use crate::learn::{Embedder, SeedExample, Suggester, Synthesizer};
use crate::phase::{ExecutorRegistry, PhaseContext, PhaseOutput};
use crate::storage::{CommitReport, FlowStore, LinkageCoordinator, StorageError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on a single phase execution.
const PHASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors surfaced by manager operations. Phase failures are not errors;
/// they come back as `PhaseReport::Failed` with the flow still resumable.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("illegal transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("unknown flow: {0}")]
    UnknownFlow(FlowId),

    #[error("no executor registered for phase {0}")]
    MissingExecutor(PhaseId),

    #[error("flow has no source rows")]
    EmptyInput,
}

pub type FlowResult<T> = Result<T, FlowError>;

/// Outcome of one `advance` call.
#[derive(Debug)]
pub enum PhaseReport {
    /// A phase ran and its output was committed durably.
    Completed {
        phase: PhaseId,
        confidence: f32,
        commit: CommitReport,
    },
    /// A phase ran and failed; the reason is persisted on the flow.
    Failed { phase: PhaseId, reason: String },
    /// Every phase is already completed; advancing is a no-op.
    AllComplete,
    /// No phase is eligible; failed phases must be resumed first.
    Blocked { failed: Vec<PhaseId> },
    /// The flow's cancelled flag is set.
    Cancelled,
}

pub struct FlowStateManager {
    store: Arc<dyn FlowStore>,
    coordinator: LinkageCoordinator,
    registry: ExecutorRegistry,
    suggester: Arc<Suggester>,
    synthesizer: Synthesizer,
    provider: Arc<dyn crate::provider::AnalysisProvider>,
    /// Per-flow advance locks; different flows run concurrently.
    locks: DashMap<FlowId, Arc<tokio::sync::Mutex<()>>>,
}

impl FlowStateManager {
    pub fn new(
        store: Arc<dyn FlowStore>,
        registry: ExecutorRegistry,
        suggester: Arc<Suggester>,
        provider: Arc<dyn crate::provider::AnalysisProvider>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            coordinator: LinkageCoordinator::new(store.clone()),
            store,
            registry,
            suggester,
            synthesizer: Synthesizer::new(embedder),
            provider,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: FlowId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn load(&self, id: &FlowId) -> FlowResult<DiscoveryFlow> {
        self.store
            .load_flow(id)?
            .ok_or(FlowError::UnknownFlow(*id))
    }

    /// Create a flow over raw imported rows and persist it with every phase
    /// `Pending`. The fingerprint ties the flow to its exact inputs.
    pub fn start_flow(
        &self,
        tenant: TenantId,
        rows: Vec<serde_json::Value>,
        config: FlowConfig,
    ) -> FlowResult<FlowId> {
        if rows.is_empty() {
            return Err(FlowError::EmptyInput);
        }
        let fp = fingerprint(&rows, &config);
        let flow = DiscoveryFlow::new(tenant, config, fp);
        let sources: Vec<SourceRecord> = rows
            .into_iter()
            .enumerate()
            .map(|(i, payload)| SourceRecord::new(flow.id, i, payload))
            .collect();
        self.store.create_flow(&flow, &sources)?;
        tracing::info!(flow = %flow.id, tenant = %flow.tenant, rows = sources.len(), "flow started");
        Ok(flow.id)
    }

    pub fn flow(&self, id: &FlowId) -> FlowResult<DiscoveryFlow> {
        self.load(id)
    }

    pub fn list_flows(&self) -> FlowResult<Vec<FlowId>> {
        Ok(self.store.list_flows()?)
    }

    /// Run the next eligible phase to completion or failure.
    ///
    /// Holds the flow's lock for the whole attempt, so at most one phase of
    /// a flow is ever running. Advancing a fully completed flow is a no-op.
    pub async fn advance(&self, id: &FlowId) -> FlowResult<PhaseReport> {
        let lock = self.lock_for(*id);
        let _guard = lock.lock().await;
        self.advance_locked(id).await
    }

    async fn advance_locked(&self, id: &FlowId) -> FlowResult<PhaseReport> {
        let mut flow = self.load(id)?;

        if flow.cancelled {
            return Ok(PhaseReport::Cancelled);
        }
        if flow.is_complete() {
            return Ok(PhaseReport::AllComplete);
        }
        let Some(phase) = flow.next_eligible() else {
            return Ok(PhaseReport::Blocked {
                failed: flow.failed_phases(),
            });
        };
        let executor = self
            .registry
            .get(phase)
            .ok_or(FlowError::MissingExecutor(phase))?;

        flow.transition(phase, PhaseStatus::Running)?;
        self.store.update_flow(&flow)?;
        tracing::info!(flow = %flow.id, phase = %phase, "phase running");

        let ctx = PhaseContext {
            source_records: self.store.source_records(id)?,
            derived_records: self.store.derived_records(id)?,
            artifacts: self.store.artifacts(id)?,
            suggester: self.suggester.clone(),
            provider: self.provider.clone(),
            flow: flow.clone(),
        };

        let outcome = tokio::time::timeout(PHASE_TIMEOUT, executor.run(&ctx)).await;
        let output = match outcome {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return self.fail_phase(flow, phase, e.to_string()),
            Err(_) => {
                return self.fail_phase(
                    flow,
                    phase,
                    format!("phase timed out after {:?}", PHASE_TIMEOUT),
                )
            }
        };

        // Commit against a copy carrying the Completed status; the Running
        // flow stays untouched so a commit failure can still mark it Failed.
        let mut committed = flow.clone();
        committed.transition(phase, PhaseStatus::Completed)?;
        match self.coordinator.commit(&committed, phase, &output) {
            Ok(commit) => {
                self.absorb_learning(&committed, phase, &output);
                Ok(PhaseReport::Completed {
                    phase,
                    confidence: output.confidence,
                    commit,
                })
            }
            Err(e) => self.fail_phase(flow, phase, format!("commit failed: {}", e)),
        }
    }

    fn fail_phase(
        &self,
        mut flow: DiscoveryFlow,
        phase: PhaseId,
        reason: String,
    ) -> FlowResult<PhaseReport> {
        tracing::warn!(flow = %flow.id, phase = %phase, reason = %reason, "phase failed");
        flow.fail(phase, reason.clone())?;
        self.store.update_flow(&flow)?;
        Ok(PhaseReport::Failed { phase, reason })
    }

    /// Feed pattern outcomes and synthesizer bootstrap back into the
    /// learning engine. Learning failures are logged, never fatal; the
    /// phase commit already landed.
    fn absorb_learning(&self, flow: &DiscoveryFlow, phase: PhaseId, output: &PhaseOutput) {
        for outcome in &output.pattern_outcomes {
            let result = if outcome.accepted {
                self.suggester.store().record_success(&outcome.pattern_id)
            } else {
                self.suggester.store().record_failure(&outcome.pattern_id)
            };
            if let Err(e) = result {
                tracing::warn!(pattern = %outcome.pattern_id, error = %e, "outcome not recorded");
            }
            if let Err(e) = self.suggester.thresholds().record_outcome(
                &flow.tenant,
                outcome.operation,
                !outcome.accepted,
            ) {
                tracing::warn!(error = %e, "threshold outcome not recorded");
            }
        }

        if phase == PhaseId::FieldMapping {
            self.bootstrap_unmapped(flow, &output.artifact);
        }
    }

    /// Synthesize starter patterns for columns field mapping could not
    /// place. The target is the normalized column name; a later correction
    /// merges the real target in.
    fn bootstrap_unmapped(&self, flow: &DiscoveryFlow, artifact: &serde_json::Value) {
        let Some(unmapped) = artifact.get("unmapped").and_then(|v| v.as_array()) else {
            return;
        };
        let seeds: Vec<SeedExample> = unmapped
            .iter()
            .filter_map(|entry| {
                let column = entry.get("column")?.as_str()?;
                let samples = entry
                    .get("samples")
                    .and_then(|s| s.as_array())
                    .map(|s| {
                        s.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();
                let target = column
                    .to_lowercase()
                    .replace(['-', '.', ' '], "_");
                Some(SeedExample {
                    signature: column.to_string(),
                    samples,
                    target,
                })
            })
            .collect();
        if seeds.is_empty() {
            return;
        }

        match self.synthesizer.synthesize(&flow.tenant, &seeds) {
            Ok(patterns) => {
                let count = patterns.len();
                for pattern in patterns {
                    if let Err(e) = self.suggester.store().store(pattern) {
                        tracing::warn!(error = %e, "synthetic pattern not stored");
                    }
                }
                tracing::info!(flow = %flow.id, patterns = count, "bootstrapped unmapped columns");
            }
            Err(e) => tracing::warn!(error = %e, "synthesizer failed"),
        }
    }

    /// Reset failed and stale-running phases to `Pending`, then advance.
    /// Running phases found here are crash leftovers; nothing can actually
    /// be running while we hold the flow lock.
    pub async fn resume(&self, id: &FlowId) -> FlowResult<PhaseReport> {
        let lock = self.lock_for(*id);
        {
            let _guard = lock.lock().await;
            let mut flow = self.load(id)?;
            let mut touched = false;
            for phase in PhaseId::ALL {
                if matches!(flow.status(phase), PhaseStatus::Failed | PhaseStatus::Running) {
                    flow.transition(phase, PhaseStatus::Pending)?;
                    touched = true;
                }
            }
            if touched {
                self.store.update_flow(&flow)?;
                tracing::info!(flow = %flow.id, "flow reset for resume");
            }
        }
        self.advance(id).await
    }

    /// Advance until the flow reaches a terminal report.
    pub async fn run_to_completion(&self, id: &FlowId) -> FlowResult<PhaseReport> {
        loop {
            match self.advance(id).await? {
                PhaseReport::Completed { .. } => continue,
                terminal => return Ok(terminal),
            }
        }
    }

    /// Request cancellation. Honored between phases: a phase already
    /// running finishes and commits, then the next advance reports
    /// `Cancelled`.
    ///
    /// Takes the flow lock, so the flag is written against the post-commit
    /// flow row. Writing from an unlocked read would race the in-flight
    /// phase commit, which rewrites the whole row from its own snapshot.
    pub async fn cancel(&self, id: &FlowId) -> FlowResult<()> {
        let lock = self.lock_for(*id);
        let _guard = lock.lock().await;
        let mut flow = self.load(id)?;
        flow.cancelled = true;
        self.store.update_flow(&flow)?;
        tracing::info!(flow = %flow.id, "flow cancelled");
        Ok(())
    }

    /// Delete a flow and everything stored for it, and drop its lock entry.
    /// Returns false when the flow does not exist.
    pub async fn delete_flow(&self, id: &FlowId) -> FlowResult<bool> {
        let lock = self.lock_for(*id);
        let deleted = {
            let _guard = lock.lock().await;
            self.store.delete_flow(id)?
        };
        self.locks.remove(id);
        if deleted {
            tracing::info!(flow = %id, "flow deleted");
        }
        Ok(deleted)
    }

    /// Full reset: drop all derived output and return every phase to
    /// `Pending`. The only way completed phases become mutable again.
    pub async fn reset(&self, id: &FlowId) -> FlowResult<()> {
        let lock = self.lock_for(*id);
        let _guard = lock.lock().await;
        let mut flow = self.load(id)?;
        self.store.clear_flow_outputs(id)?;
        flow.reset();
        self.store.update_flow(&flow)?;
        tracing::info!(flow = %flow.id, "flow reset");
        Ok(())
    }
}
