//! Learned pattern representation
//!
//! A `Pattern` maps an input signature (field name plus sample content) to a
//! target decision, carries embeddings for both, and tracks a dynamic
//! confidence score with success/failure counters.

use crate::flow::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternId(Uuid);

impl PatternId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for PatternId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Visibility scope of a pattern.
///
/// Tenant-specific patterns are always preferred; global patterns are a
/// fallback when too few tenant matches exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternScope {
    Tenant(TenantId),
    Global,
}

impl PatternScope {
    /// Stable key used for the scope column.
    pub fn key(&self) -> String {
        match self {
            PatternScope::Tenant(t) => format!("tenant:{}", t.key()),
            PatternScope::Global => "global".to_string(),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        if key == "global" {
            return Some(PatternScope::Global);
        }
        let rest = key.strip_prefix("tenant:")?;
        let (client, engagement) = rest.split_once('/')?;
        Some(PatternScope::Tenant(TenantId::new(client, engagement)))
    }
}

/// Lifecycle derived from confidence and usage stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternLifecycle {
    /// First observations, confidence < 0.5
    New,
    /// Building confidence, 0.5 <= confidence < 0.8
    Learning,
    /// High confidence with enough uses
    Stable,
}

impl PatternLifecycle {
    pub fn from_stats(confidence: f32, success_count: u32) -> Self {
        if confidence >= 0.8 && success_count >= 10 {
            Self::Stable
        } else if confidence >= 0.5 {
            Self::Learning
        } else {
            Self::New
        }
    }
}

/// A learned rule mapping an input signature to an output decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub scope: PatternScope,
    /// Field name / content description this pattern recognizes.
    pub source_signature: String,
    /// What it maps or classifies to.
    pub target: String,
    pub signature_embedding: Vec<f32>,
    pub content_embedding: Vec<f32>,
    /// Dynamic confidence in [0, 1], updated on every reuse.
    pub confidence: f32,
    pub success_count: u32,
    pub failure_count: u32,
    /// Emitted by the synthesizer rather than learned from a real outcome.
    pub synthetic: bool,
    /// Excluded from retrieval but retained for audit.
    pub retired: bool,
    /// Optimistic concurrency version; bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pattern {
    pub fn new(
        scope: PatternScope,
        source_signature: impl Into<String>,
        target: impl Into<String>,
        signature_embedding: Vec<f32>,
        content_embedding: Vec<f32>,
        confidence: f32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PatternId::new(),
            scope,
            source_signature: source_signature.into(),
            target: target.into(),
            signature_embedding,
            content_embedding,
            confidence: confidence.clamp(0.0, 1.0),
            success_count: 0,
            failure_count: 0,
            synthetic: false,
            retired: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn lifecycle(&self) -> PatternLifecycle {
        PatternLifecycle::from_stats(self.confidence, self.success_count)
    }

    /// Whether the failure share makes this a retirement candidate.
    pub fn is_retirement_candidate(&self) -> bool {
        let total = self.success_count + self.failure_count;
        self.failure_count >= 5 && total > 0 && self.failure_count as f32 / total as f32 >= 0.7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_key_roundtrips() {
        let tenant = PatternScope::Tenant(TenantId::new("acme", "wave-1"));
        assert_eq!(
            PatternScope::from_key(&tenant.key()),
            Some(tenant.clone())
        );
        assert_eq!(PatternScope::from_key("global"), Some(PatternScope::Global));
        assert_eq!(PatternScope::from_key("bogus"), None);
    }

    #[test]
    fn lifecycle_follows_stats() {
        assert_eq!(PatternLifecycle::from_stats(0.3, 0), PatternLifecycle::New);
        assert_eq!(PatternLifecycle::from_stats(0.6, 2), PatternLifecycle::Learning);
        assert_eq!(PatternLifecycle::from_stats(0.9, 12), PatternLifecycle::Stable);
        // High confidence but few uses is still learning
        assert_eq!(PatternLifecycle::from_stats(0.9, 3), PatternLifecycle::Learning);
    }

    #[test]
    fn retirement_requires_both_count_and_share() {
        let mut p = Pattern::new(
            PatternScope::Global,
            "sig",
            "target",
            vec![1.0],
            vec![1.0],
            0.5,
        );
        p.failure_count = 4;
        assert!(!p.is_retirement_candidate(), "too few failures");
        p.failure_count = 5;
        p.success_count = 10;
        assert!(!p.is_retirement_candidate(), "failure share too low");
        p.success_count = 1;
        assert!(p.is_retirement_candidate());
    }

    #[test]
    fn confidence_is_clamped() {
        let p = Pattern::new(PatternScope::Global, "s", "t", vec![], vec![], 1.4);
        assert_eq!(p.confidence, 1.0);
    }
}
