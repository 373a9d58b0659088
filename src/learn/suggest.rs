//! Suggestion engine
//!
//! Ties retrieval, confidence thresholds, and the correction loop together.
//! Given a field signature and sample values, ranks nearby patterns and
//! decides per suggestion whether to auto-apply, surface for review, or
//! reject outright.

use super::embedder::Embedder;
use super::pattern::{Pattern, PatternId, PatternScope};
use super::store::PatternStore;
use super::thresholds::{OperationType, ThresholdManager, Thresholds};
use super::LearnResult;
use crate::flow::{FlowConfig, TenantId};
use std::sync::Arc;

/// What to do with a suggestion, decided against the tenant's thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Confidence at or above `auto_apply`: safe to apply without review.
    AutoApply,
    /// Confidence in the suggest band: surface for human review.
    Suggest,
    /// Below the suggest cutoff: not worth surfacing.
    Reject,
}

/// A ranked mapping suggestion for one input signature.
#[derive(Debug, Clone)]
pub struct Suggestion {
    pub pattern_id: PatternId,
    pub target: String,
    /// Pattern confidence discounted by query similarity.
    pub confidence: f32,
    pub similarity: f32,
    pub decision: Decision,
    pub synthetic: bool,
}

/// Retrieval plus thresholding for one tenant query.
pub struct Suggester {
    embedder: Arc<dyn Embedder>,
    store: Arc<PatternStore>,
    thresholds: Arc<ThresholdManager>,
    config: FlowConfig,
}

impl Suggester {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<PatternStore>,
        thresholds: Arc<ThresholdManager>,
        config: FlowConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            thresholds,
            config,
        }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn thresholds(&self) -> &Arc<ThresholdManager> {
        &self.thresholds
    }

    fn decide(thresholds: &Thresholds, confidence: f32) -> Decision {
        if confidence >= thresholds.auto_apply {
            Decision::AutoApply
        } else if confidence >= thresholds.suggest {
            Decision::Suggest
        } else {
            Decision::Reject
        }
    }

    /// Rank patterns near `(field_signature, samples)` for a tenant.
    ///
    /// Suggestion confidence is the pattern's confidence discounted by the
    /// combined similarity, so a confident pattern that is a poor match
    /// still lands below the auto-apply line. Unproven synthetic patterns
    /// are capped just under auto-apply regardless of score.
    pub fn suggest(
        &self,
        tenant: &TenantId,
        operation: OperationType,
        field_signature: &str,
        samples: &[String],
    ) -> LearnResult<Vec<Suggestion>> {
        let sig = self.embedder.embed(field_signature)?;
        let content_text = samples.join(" | ");
        let content = self.embedder.embed(&content_text)?;

        let candidates = self.store.find_candidates(
            tenant,
            &sig,
            &content,
            self.config.top_k,
            self.config.min_tenant_matches,
        )?;
        let thresholds = self.thresholds.get(tenant, operation)?;

        let suggestions = candidates
            .into_iter()
            .map(|c| {
                let similarity = (1.0 - c.distance).clamp(0.0, 1.0);
                let mut confidence = c.pattern.confidence * similarity;
                if c.pattern.synthetic && c.pattern.success_count == 0 {
                    confidence = confidence.min(thresholds.auto_apply - 0.01);
                }
                Suggestion {
                    pattern_id: c.pattern.id,
                    target: c.pattern.target,
                    confidence,
                    similarity,
                    decision: Self::decide(&thresholds, confidence),
                    synthetic: c.pattern.synthetic,
                }
            })
            .collect();
        Ok(suggestions)
    }

    /// Fold a user correction back into the store: the wrong pattern takes a
    /// failure, the corrected mapping is learned as a tenant pattern, and
    /// the tenant's threshold sees one corrected outcome.
    pub fn learn_correction(
        &self,
        tenant: &TenantId,
        operation: OperationType,
        wrong_pattern: Option<&PatternId>,
        field_signature: &str,
        samples: &[String],
        corrected_target: &str,
    ) -> LearnResult<PatternId> {
        if let Some(id) = wrong_pattern {
            self.store.record_failure(id)?;
        }

        let sig = self.embedder.embed(field_signature)?;
        let content = self.embedder.embed(&samples.join(" | "))?;
        let learned = Pattern::new(
            PatternScope::Tenant(tenant.clone()),
            field_signature,
            corrected_target,
            sig,
            content,
            0.6,
        );
        let id = self.store.store(learned)?;
        self.thresholds.record_outcome(tenant, operation, true)?;
        tracing::info!(
            tenant = %tenant,
            signature = field_signature,
            target = corrected_target,
            "learned correction"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::embedder::HashEmbedder;

    fn tenant() -> TenantId {
        TenantId::new("acme", "wave-1")
    }

    fn suggester() -> Suggester {
        Suggester::new(
            Arc::new(HashEmbedder::new()),
            Arc::new(PatternStore::open_in_memory().unwrap()),
            Arc::new(ThresholdManager::open_in_memory().unwrap()),
            FlowConfig::default(),
        )
    }

    fn seed_pattern(s: &Suggester, sig: &str, target: &str, confidence: f32) -> PatternId {
        let e = HashEmbedder::new();
        let p = Pattern::new(
            PatternScope::Tenant(tenant()),
            sig,
            target,
            e.embed(sig).unwrap(),
            e.embed("1 | 2 | 3").unwrap(),
            confidence,
        );
        s.store.store(p).unwrap()
    }

    // === Scenario: DR_TIER maps to business_criticality with high confidence ===

    #[test]
    fn close_signature_yields_high_confidence_suggestion() {
        let s = suggester();
        let mut p = Pattern::new(
            PatternScope::Tenant(tenant()),
            "DR_TIER",
            "business_criticality",
            HashEmbedder::new().embed("DR_TIER").unwrap(),
            HashEmbedder::new().embed("1 | 2 | 3").unwrap(),
            0.95,
        );
        p.success_count = 12;
        s.store.store(p).unwrap();

        let samples = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let out = s
            .suggest(&tenant(), OperationType::FieldMapping, "DR_TIER", &samples)
            .unwrap();
        assert!(!out.is_empty());
        assert_eq!(out[0].target, "business_criticality");
        assert!(out[0].confidence > 0.8, "got {}", out[0].confidence);
        assert_eq!(out[0].decision, Decision::AutoApply);
    }

    #[test]
    fn poor_match_discounts_confidence() {
        let s = suggester();
        seed_pattern(&s, "purchase order quantity", "order_qty", 0.95);

        let out = s
            .suggest(
                &tenant(),
                OperationType::FieldMapping,
                "DR_TIER",
                &["1".to_string()],
            )
            .unwrap();
        if let Some(top) = out.first() {
            assert!(top.confidence < 0.6, "distant pattern must not score high");
            assert_ne!(top.decision, Decision::AutoApply);
        }
    }

    #[test]
    fn unproven_synthetic_never_auto_applies() {
        let s = suggester();
        let e = HashEmbedder::new();
        let p = Pattern::new(
            PatternScope::Tenant(tenant()),
            "DR_TIER",
            "business_criticality",
            e.embed("DR_TIER").unwrap(),
            e.embed("1 | 2 | 3").unwrap(),
            // Absurdly confident synthetic, still must not auto-apply
            0.99,
        )
        .synthetic();
        s.store.store(p).unwrap();

        let samples = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let out = s
            .suggest(&tenant(), OperationType::FieldMapping, "DR_TIER", &samples)
            .unwrap();
        assert!(!out.is_empty());
        assert!(out[0].synthetic);
        assert_ne!(out[0].decision, Decision::AutoApply);
    }

    #[test]
    fn reinforced_synthetic_can_auto_apply() {
        let s = suggester();
        let e = HashEmbedder::new();
        let mut p = Pattern::new(
            PatternScope::Tenant(tenant()),
            "DR_TIER",
            "business_criticality",
            e.embed("DR_TIER").unwrap(),
            e.embed("1 | 2 | 3").unwrap(),
            0.95,
        )
        .synthetic();
        p.success_count = 3;
        s.store.store(p).unwrap();

        let samples = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let out = s
            .suggest(&tenant(), OperationType::FieldMapping, "DR_TIER", &samples)
            .unwrap();
        assert_eq!(out[0].decision, Decision::AutoApply);
    }

    #[test]
    fn learn_correction_penalizes_and_stores() {
        let s = suggester();
        let wrong = seed_pattern(&s, "TIER", "service_tier", 0.8);

        let learned = s
            .learn_correction(
                &tenant(),
                OperationType::FieldMapping,
                Some(&wrong),
                "TIER",
                &["gold".to_string()],
                "business_criticality",
            )
            .unwrap();

        let wrong_after = s.store.get(&wrong).unwrap().unwrap();
        assert_eq!(wrong_after.failure_count, 1);
        assert!(wrong_after.confidence < 0.8);

        let stored = s.store.get(&learned).unwrap().unwrap();
        assert_eq!(stored.target, "business_criticality");
        assert!(!stored.synthetic);
    }
}
