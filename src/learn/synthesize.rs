//! Self-training synthesizer
//!
//! Bootstraps the pattern store before any user feedback exists: generates
//! plausible variants of a seed signature, clusters them by embedding
//! similarity, and emits one low-confidence synthetic pattern per cluster.
//! Synthetic patterns are never auto-applied until reinforced by a real
//! accepted outcome (enforced at suggestion time).

use super::embedder::{cosine_similarity, Embedder};
use super::pattern::{Pattern, PatternScope};
use super::LearnResult;
use crate::flow::TenantId;
use std::sync::Arc;

/// Initial confidence for synthetic patterns, well below any auto-apply
/// threshold.
pub const SYNTHETIC_CONFIDENCE: f32 = 0.4;

/// Similarity above which two variants land in the same cluster.
const CLUSTER_SIMILARITY: f32 = 0.8;

/// A seed observation to synthesize around.
#[derive(Debug, Clone)]
pub struct SeedExample {
    /// Field name / content description.
    pub signature: String,
    /// Representative sample values.
    pub samples: Vec<String>,
    /// The decision this signature should map to.
    pub target: String,
}

/// Abbreviations commonly seen in imported infrastructure exports.
/// Expansion both ways gives the trigram embedder something to grip.
const EXPANSIONS: &[(&str, &str)] = &[
    ("dr", "disaster recovery"),
    ("env", "environment"),
    ("os", "operating system"),
    ("db", "database"),
    ("app", "application"),
    ("crit", "criticality"),
    ("mgmt", "management"),
    ("svr", "server"),
    ("cfg", "configuration"),
];

pub struct Synthesizer {
    embedder: Arc<dyn Embedder>,
}

impl Synthesizer {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    /// Deterministic signature variants: separator and case forms plus
    /// abbreviation expansion. Order is stable, duplicates removed.
    fn signature_variants(signature: &str) -> Vec<String> {
        let lower = signature.to_lowercase();
        let spaced = lower.replace(['_', '-', '.'], " ");
        let words: Vec<&str> = spaced.split_whitespace().collect();

        let mut variants = vec![
            signature.to_string(),
            lower.clone(),
            signature.to_uppercase(),
            words.join(" "),
            words.join("_"),
            words.join("-"),
        ];

        // Expand known abbreviations word by word
        let expanded: Vec<String> = words
            .iter()
            .map(|w| {
                EXPANSIONS
                    .iter()
                    .find(|(abbr, _)| abbr == w)
                    .map(|(_, full)| full.to_string())
                    .unwrap_or_else(|| w.to_string())
            })
            .collect();
        if expanded.join(" ") != words.join(" ") {
            variants.push(expanded.join(" "));
            variants.push(expanded.join("_"));
        }

        variants.dedup();
        let mut seen = std::collections::BTreeSet::new();
        variants.retain(|v| seen.insert(v.clone()));
        variants
    }

    /// Sample-value rotations so content embeddings do not overfit order.
    fn sample_variants(samples: &[String]) -> Vec<String> {
        if samples.is_empty() {
            return vec![String::new()];
        }
        let mut out = Vec::new();
        for rot in 0..samples.len().min(3) {
            let rotated: Vec<&str> = samples[rot..]
                .iter()
                .chain(samples[..rot].iter())
                .map(String::as_str)
                .collect();
            out.push(rotated.join(" | "));
        }
        out
    }

    /// Generate synthetic patterns for a tenant from seed examples.
    ///
    /// Variants are clustered greedily: each embedding joins the first
    /// cluster whose centroid is similar enough, otherwise starts its own.
    /// One pattern is emitted per cluster, carrying the cluster's first
    /// variant as its signature.
    pub fn synthesize(
        &self,
        tenant: &TenantId,
        seeds: &[SeedExample],
    ) -> LearnResult<Vec<Pattern>> {
        let mut patterns = Vec::new();

        for seed in seeds {
            let variants = Self::signature_variants(&seed.signature);
            let refs: Vec<&str> = variants.iter().map(String::as_str).collect();
            let sig_embeddings = self.embedder.embed_batch(&refs)?;

            let content_forms = Self::sample_variants(&seed.samples);
            let content_refs: Vec<&str> = content_forms.iter().map(String::as_str).collect();
            let content_embeddings = self.embedder.embed_batch(&content_refs)?;
            let content_embedding = content_embeddings
                .first()
                .cloned()
                .unwrap_or_default();

            // Greedy clustering over signature embeddings
            struct Cluster {
                representative: usize,
                centroid: Vec<f32>,
                members: usize,
            }
            let mut clusters: Vec<Cluster> = Vec::new();
            for (i, embedding) in sig_embeddings.iter().enumerate() {
                let home = clusters
                    .iter_mut()
                    .find(|c| cosine_similarity(&c.centroid, embedding) >= CLUSTER_SIMILARITY);
                match home {
                    Some(cluster) => {
                        // Running mean keeps the centroid cheap to maintain
                        let n = cluster.members as f32;
                        for (c, x) in cluster.centroid.iter_mut().zip(embedding.iter()) {
                            *c = (*c * n + x) / (n + 1.0);
                        }
                        cluster.members += 1;
                    }
                    None => clusters.push(Cluster {
                        representative: i,
                        centroid: embedding.clone(),
                        members: 1,
                    }),
                }
            }

            for cluster in clusters {
                let pattern = Pattern::new(
                    PatternScope::Tenant(tenant.clone()),
                    variants[cluster.representative].clone(),
                    seed.target.clone(),
                    sig_embeddings[cluster.representative].clone(),
                    content_embedding.clone(),
                    SYNTHETIC_CONFIDENCE,
                )
                .synthetic();
                patterns.push(pattern);
            }
        }

        tracing::debug!(
            tenant = %tenant,
            seeds = seeds.len(),
            patterns = patterns.len(),
            "synthesized bootstrap patterns"
        );
        Ok(patterns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::embedder::HashEmbedder;

    fn synthesizer() -> Synthesizer {
        Synthesizer::new(Arc::new(HashEmbedder::new()))
    }

    fn seed() -> SeedExample {
        SeedExample {
            signature: "DR_TIER".to_string(),
            samples: vec!["1".to_string(), "2".to_string(), "3".to_string()],
            target: "business_criticality".to_string(),
        }
    }

    #[test]
    fn variants_cover_case_separator_and_expansion_forms() {
        let variants = Synthesizer::signature_variants("DR_TIER");
        assert!(variants.contains(&"dr tier".to_string()));
        assert!(variants.contains(&"dr-tier".to_string()));
        assert!(variants.contains(&"disaster recovery tier".to_string()));
        // No duplicates
        let unique: std::collections::BTreeSet<_> = variants.iter().collect();
        assert_eq!(unique.len(), variants.len());
    }

    #[test]
    fn synthesized_patterns_are_low_confidence_and_tagged() {
        let tenant = TenantId::new("acme", "wave-1");
        let patterns = synthesizer().synthesize(&tenant, &[seed()]).unwrap();
        assert!(!patterns.is_empty());
        for p in &patterns {
            assert!(p.synthetic);
            assert_eq!(p.confidence, SYNTHETIC_CONFIDENCE);
            assert_eq!(p.target, "business_criticality");
            assert_eq!(p.scope, PatternScope::Tenant(tenant.clone()));
            assert_eq!(p.success_count, 0);
        }
    }

    #[test]
    fn similar_variants_collapse_into_clusters() {
        let tenant = TenantId::new("acme", "wave-1");
        let patterns = synthesizer().synthesize(&tenant, &[seed()]).unwrap();
        let variants = Synthesizer::signature_variants("DR_TIER");
        // The separator/case forms all normalize to the same trigrams, so
        // clustering must produce strictly fewer patterns than variants.
        assert!(
            patterns.len() < variants.len(),
            "expected clustering to collapse {} variants, got {} patterns",
            variants.len(),
            patterns.len()
        );
    }

    #[test]
    fn synthesize_is_deterministic() {
        let tenant = TenantId::new("acme", "wave-1");
        let a = synthesizer().synthesize(&tenant, &[seed()]).unwrap();
        let b = synthesizer().synthesize(&tenant, &[seed()]).unwrap();
        let sigs_a: Vec<_> = a.iter().map(|p| p.source_signature.clone()).collect();
        let sigs_b: Vec<_> = b.iter().map(|p| p.source_signature.clone()).collect();
        assert_eq!(sigs_a, sigs_b);
    }

    #[test]
    fn empty_samples_still_synthesize() {
        let tenant = TenantId::new("acme", "wave-1");
        let seed = SeedExample {
            signature: "owner".to_string(),
            samples: vec![],
            target: "owner_email".to_string(),
        };
        let patterns = synthesizer().synthesize(&tenant, &[seed]).unwrap();
        assert!(!patterns.is_empty());
    }
}
