//! Asset linkage coordinator
//!
//! The single place where phase outputs become durable state. A commit
//! mints derived record ids, pairs them with their source rows, and hands
//! the whole batch to the store's one-transaction `commit_phase`. Either
//! everything lands (derived records, source back-references, artifact,
//! phase status) or nothing does.

use super::traits::{CommitBundle, FlowStore, StorageError, StorageResult};
use crate::flow::{DerivedId, DerivedRecord, DiscoveryFlow, PhaseId};
use crate::phase::PhaseOutput;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

/// Bounded whole-commit retries on transaction conflicts.
const COMMIT_RETRIES: u32 = 3;

/// Summary of one successful phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReport {
    pub derived_count: usize,
    pub linked_count: usize,
}

pub struct LinkageCoordinator {
    store: Arc<dyn FlowStore>,
}

impl LinkageCoordinator {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    /// Validate the draft/linkage pairing before anything touches the
    /// database: every draft must be claimed by exactly one request, every
    /// request must point at a real draft, and no source row may be claimed
    /// twice within the output.
    fn validate(output: &PhaseOutput) -> StorageResult<()> {
        if output.linkage_requests.len() != output.drafts.len() {
            return Err(StorageError::Integrity(format!(
                "{} drafts but {} linkage requests",
                output.drafts.len(),
                output.linkage_requests.len()
            )));
        }
        let mut draft_indices = HashSet::new();
        let mut sources = HashSet::new();
        for request in &output.linkage_requests {
            if request.draft_index >= output.drafts.len() {
                return Err(StorageError::Integrity(format!(
                    "linkage request points at draft {} of {}",
                    request.draft_index,
                    output.drafts.len()
                )));
            }
            if !draft_indices.insert(request.draft_index) {
                return Err(StorageError::Integrity(format!(
                    "draft {} claimed by two linkage requests",
                    request.draft_index
                )));
            }
            if !sources.insert(request.source) {
                return Err(StorageError::Integrity(format!(
                    "source record {} claimed by two linkage requests",
                    request.source
                )));
            }
        }
        Ok(())
    }

    /// Commit one phase's output atomically. `flow` must already carry the
    /// phase marked `Completed`; on any error the caller's in-memory flow is
    /// the only thing that changed.
    pub fn commit(
        &self,
        flow: &DiscoveryFlow,
        phase: PhaseId,
        output: &PhaseOutput,
    ) -> StorageResult<CommitReport> {
        Self::validate(output)?;

        let now = Utc::now();
        let mut derived = Vec::with_capacity(output.drafts.len());
        let mut links = Vec::with_capacity(output.linkage_requests.len());
        for request in &output.linkage_requests {
            let draft = &output.drafts[request.draft_index];
            let id = DerivedId::new();
            derived.push(DerivedRecord {
                id,
                flow_id: flow.id,
                source_ref: request.source,
                fields: draft.fields.clone(),
                confidence: draft.confidence,
                applied_patterns: draft.applied_patterns.clone(),
                created_at: now,
            });
            links.push((request.source, id));
        }

        let bundle = CommitBundle {
            flow: flow.clone(),
            phase,
            artifact: output.artifact.clone(),
            derived,
            links,
        };

        let mut attempt = 0;
        loop {
            match self.store.commit_phase(&bundle) {
                Ok(()) => {
                    tracing::info!(
                        flow = %flow.id,
                        phase = %phase,
                        derived = bundle.derived.len(),
                        "phase committed"
                    );
                    return Ok(CommitReport {
                        derived_count: bundle.derived.len(),
                        linked_count: bundle.links.len(),
                    });
                }
                Err(e) if e.is_conflict() && attempt < COMMIT_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        flow = %flow.id,
                        phase = %phase,
                        attempt,
                        "commit conflict, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
