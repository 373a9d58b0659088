//! Core data model for discovery flows
//!
//! A `DiscoveryFlow` is one end-to-end analysis session over an imported
//! dataset. Phases transition only forward (`Pending → Running →
//! Completed | Failed`); a completed phase is immutable unless the whole
//! flow is explicitly reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a discovery flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(Uuid);

/// Unique identifier for a raw imported row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(Uuid);

/// Unique identifier for a derived record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivedId(Uuid);

macro_rules! uuid_id {
    ($name:ident) => {
        impl $name {
            /// Create a new random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the string form produced by `Display`
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(FlowId);
uuid_id!(SourceId);
uuid_id!(DerivedId);

/// Tenant isolation boundary: a client/engagement pair.
///
/// Every pattern-store and threshold call carries one of these explicitly;
/// there is no ambient "current tenant".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId {
    pub client: String,
    pub engagement: String,
}

impl TenantId {
    pub fn new(client: impl Into<String>, engagement: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            engagement: engagement.into(),
        }
    }

    /// Stable key used for database scoping columns.
    pub fn key(&self) -> String {
        format!("{}/{}", self.client, self.engagement)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.client, self.engagement)
    }
}

/// The closed set of discovery phases, in declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    FieldMapping,
    Cleansing,
    Inventory,
    DependencyMapping,
    DebtAnalysis,
}

impl PhaseId {
    /// All phases in declaration order.
    pub const ALL: [PhaseId; 5] = [
        PhaseId::FieldMapping,
        PhaseId::Cleansing,
        PhaseId::Inventory,
        PhaseId::DependencyMapping,
        PhaseId::DebtAnalysis,
    ];

    /// Phases that must be `Completed` before this one may start.
    ///
    /// DependencyMapping and DebtAnalysis are independent of each other;
    /// both require the inventory.
    pub fn deps(&self) -> &'static [PhaseId] {
        match self {
            PhaseId::FieldMapping => &[],
            PhaseId::Cleansing => &[PhaseId::FieldMapping],
            PhaseId::Inventory => &[PhaseId::Cleansing],
            PhaseId::DependencyMapping => &[PhaseId::Inventory],
            PhaseId::DebtAnalysis => &[PhaseId::Inventory],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::FieldMapping => "field_mapping",
            PhaseId::Cleansing => "cleansing",
            PhaseId::Inventory => "inventory",
            PhaseId::DependencyMapping => "dependency_mapping",
            PhaseId::DebtAnalysis => "debt_analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

impl std::fmt::Display for PhaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single phase within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Per-flow configuration captured at start time and folded into the
/// fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Source column whose values name other assets this one depends on.
    pub dependency_field: String,
    /// Candidates to retrieve per mapping query.
    pub top_k: usize,
    /// Minimum tenant-scope matches before global patterns are appended.
    pub min_tenant_matches: usize,
    /// Per-attempt provider timeout in seconds.
    pub provider_timeout_secs: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            dependency_field: "depends_on".to_string(),
            top_k: 5,
            min_tenant_matches: 3,
            provider_timeout_secs: 30,
        }
    }
}

/// Errors raised by illegal state-machine transitions.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("phase {phase} is completed and immutable (reset the flow to rerun it)")]
    CompletedImmutable { phase: PhaseId },

    #[error("illegal transition for phase {phase}: {from:?} -> {to:?}")]
    Illegal {
        phase: PhaseId,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    #[error("phase {phase} has incomplete dependency {dep}")]
    DependencyIncomplete { phase: PhaseId, dep: PhaseId },
}

/// One end-to-end multi-phase analysis session over an imported dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryFlow {
    pub id: FlowId,
    pub tenant: TenantId,
    /// The phase currently running, or the next one eligible.
    pub current_phase: Option<PhaseId>,
    pub phase_statuses: BTreeMap<PhaseId, PhaseStatus>,
    /// Human-readable failure reasons, keyed by phase.
    pub phase_errors: BTreeMap<PhaseId, String>,
    pub config: FlowConfig,
    /// Hash of inputs + config (uuid v5 over canonical JSON).
    pub fingerprint: Uuid,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveryFlow {
    /// Create a new flow with every phase `Pending`.
    pub fn new(tenant: TenantId, config: FlowConfig, fingerprint: Uuid) -> Self {
        let now = Utc::now();
        let phase_statuses = PhaseId::ALL
            .iter()
            .map(|p| (*p, PhaseStatus::Pending))
            .collect();
        Self {
            id: FlowId::new(),
            tenant,
            current_phase: Some(PhaseId::FieldMapping),
            phase_statuses,
            phase_errors: BTreeMap::new(),
            config,
            fingerprint,
            cancelled: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self, phase: PhaseId) -> PhaseStatus {
        self.phase_statuses
            .get(&phase)
            .copied()
            .unwrap_or(PhaseStatus::Pending)
    }

    /// Next phase whose dependencies are all completed and which is itself
    /// still pending. Running and failed phases are never eligible; a
    /// failed phase must be reset through `resume`.
    pub fn next_eligible(&self) -> Option<PhaseId> {
        PhaseId::ALL.iter().copied().find(|phase| {
            self.status(*phase) == PhaseStatus::Pending
                && phase
                    .deps()
                    .iter()
                    .all(|dep| self.status(*dep) == PhaseStatus::Completed)
        })
    }

    pub fn failed_phases(&self) -> Vec<PhaseId> {
        PhaseId::ALL
            .iter()
            .copied()
            .filter(|p| self.status(*p) == PhaseStatus::Failed)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        PhaseId::ALL
            .iter()
            .all(|p| self.status(*p) == PhaseStatus::Completed)
    }

    /// Apply a status transition, enforcing the forward-only state machine.
    ///
    /// Legal transitions: `Pending → Running`, `Running → Completed`,
    /// `Running → Failed`, and `Failed | Running → Pending` (resume reset).
    pub fn transition(
        &mut self,
        phase: PhaseId,
        to: PhaseStatus,
    ) -> Result<(), TransitionError> {
        let from = self.status(phase);
        let legal = matches!(
            (from, to),
            (PhaseStatus::Pending, PhaseStatus::Running)
                | (PhaseStatus::Running, PhaseStatus::Completed)
                | (PhaseStatus::Running, PhaseStatus::Failed)
                | (PhaseStatus::Failed, PhaseStatus::Pending)
                | (PhaseStatus::Running, PhaseStatus::Pending)
        );
        if !legal {
            if from == PhaseStatus::Completed {
                return Err(TransitionError::CompletedImmutable { phase });
            }
            return Err(TransitionError::Illegal { phase, from, to });
        }
        if to == PhaseStatus::Running {
            for dep in phase.deps() {
                if self.status(*dep) != PhaseStatus::Completed {
                    return Err(TransitionError::DependencyIncomplete {
                        phase,
                        dep: *dep,
                    });
                }
            }
        }
        self.phase_statuses.insert(phase, to);
        if to != PhaseStatus::Failed {
            self.phase_errors.remove(&phase);
        }
        self.current_phase = match to {
            PhaseStatus::Running => Some(phase),
            _ => self.next_eligible(),
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a failure reason alongside the `Failed` status.
    pub fn fail(&mut self, phase: PhaseId, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(phase, PhaseStatus::Failed)?;
        self.phase_errors.insert(phase, reason.into());
        Ok(())
    }

    /// Explicit full reset: every phase back to `Pending`. This is the only
    /// way a completed phase becomes mutable again.
    pub fn reset(&mut self) {
        for phase in PhaseId::ALL {
            self.phase_statuses.insert(phase, PhaseStatus::Pending);
        }
        self.phase_errors.clear();
        self.cancelled = false;
        self.current_phase = Some(PhaseId::FieldMapping);
        self.updated_at = Utc::now();
    }
}

/// One row of raw imported data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: SourceId,
    pub flow_id: FlowId,
    pub row_index: usize,
    pub payload: serde_json::Value,
    /// Back-reference to the derived record, set only by the linkage commit.
    pub derived_ref: Option<DerivedId>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

impl SourceRecord {
    pub fn new(flow_id: FlowId, row_index: usize, payload: serde_json::Value) -> Self {
        Self {
            id: SourceId::new(),
            flow_id,
            row_index,
            payload,
            derived_ref: None,
            processed: false,
            processed_at: None,
        }
    }
}

/// A classified/mapped asset produced by a phase.
///
/// Constructed only inside the linkage coordinator's atomic commit; never
/// created standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub id: DerivedId,
    pub flow_id: FlowId,
    pub source_ref: SourceId,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub confidence: f32,
    pub applied_patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Compute the flow fingerprint: uuid v5 over the canonical JSON of the raw
/// rows and config. Identical inputs always produce the same fingerprint,
/// which is what makes crash-resume comparisons meaningful.
pub fn fingerprint(rows: &[serde_json::Value], config: &FlowConfig) -> Uuid {
    let canonical = serde_json::json!({ "rows": rows, "config": config });
    // to_string on Value is deterministic (map keys are ordered)
    let bytes = canonical.to_string();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, bytes.as_bytes())
}
