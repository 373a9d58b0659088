//! Technical debt analysis phase
//!
//! Scores each inventoried asset from its age, end-of-life, and operating
//! system signals. The analysis provider, when reachable, may refine the
//! local scores; when it is not, the local heuristics stand on their own.

use super::traits::{PhaseContext, PhaseError, PhaseExecutor, PhaseOutput};
use crate::flow::{DerivedRecord, PhaseId};
use crate::provider::{analyze_with_retry, AnalysisRequest, RetryPolicy};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use serde_json::{json, Value};
use std::time::Duration;

pub struct DebtAnalysisExecutor;

/// OS strings that are past or near vendor end-of-life.
const EOL_OS_MARKERS: &[&str] = &[
    "2003", "2008", "2012", "centos 6", "centos 7", "rhel 6", "ubuntu 14", "ubuntu 16",
    "aix", "solaris",
];

fn field<'a>(record: &'a DerivedRecord, name: &str) -> Option<&'a Value> {
    record
        .fields
        .get(name)
        .or_else(|| record.fields.get(&format!("raw.{}", name)))
}

/// Heuristic debt score in [0, 1] from whatever signals the asset carries.
fn local_score(record: &DerivedRecord) -> (f32, Vec<String>) {
    let mut score = 0.0f32;
    let mut signals = Vec::new();

    if let Some(os) = field(record, "os").and_then(Value::as_str) {
        let os_lower = os.to_lowercase();
        if EOL_OS_MARKERS.iter().any(|m| os_lower.contains(m)) {
            score += 0.4;
            signals.push(format!("end-of-life os: {}", os));
        }
    }

    let age_years = field(record, "age_years")
        .and_then(Value::as_f64)
        .or_else(|| {
            field(record, "install_year")
                .and_then(Value::as_i64)
                .map(|y| (Utc::now().year() as i64 - y) as f64)
        });
    if let Some(age) = age_years {
        if age > 10.0 {
            score += 0.5;
            signals.push(format!("asset is {:.0} years old", age));
        } else if age > 5.0 {
            score += 0.3;
            signals.push(format!("asset is {:.0} years old", age));
        }
    }

    if field(record, "owner")
        .map(|v| v.is_null() || v.as_str().is_some_and(str::is_empty))
        .unwrap_or(true)
    {
        score += 0.2;
        signals.push("no recorded owner".to_string());
    }

    (score.min(1.0), signals)
}

fn band(score: f32) -> &'static str {
    if score >= 0.6 {
        "high"
    } else if score >= 0.3 {
        "medium"
    } else {
        "low"
    }
}

#[async_trait]
impl PhaseExecutor for DebtAnalysisExecutor {
    fn id(&self) -> PhaseId {
        PhaseId::DebtAnalysis
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutput, PhaseError> {
        ctx.require_artifact(PhaseId::Inventory)?;

        let mut scored: Vec<(String, f32, Vec<String>)> = ctx
            .derived_records
            .iter()
            .map(|record| {
                let name = record
                    .fields
                    .get("name")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| record.id.to_string());
                let (score, signals) = local_score(record);
                (name, score, signals)
            })
            .collect();

        // Provider refinement is best effort; an unreachable or failing
        // provider never fails the phase
        let mut enriched = false;
        if ctx.provider.is_available().await {
            let request = AnalysisRequest {
                operation: "score_debt".to_string(),
                payload: json!({
                    "assets": scored
                        .iter()
                        .map(|(name, score, _)| json!({"name": name, "local_score": score}))
                        .collect::<Vec<_>>(),
                }),
            };
            let policy = RetryPolicy {
                per_attempt_timeout: Duration::from_secs(ctx.config().provider_timeout_secs),
                ..Default::default()
            };
            if let Ok(result) = analyze_with_retry(ctx.provider.as_ref(), request, &policy).await {
                if let Some(overrides) = result.data.get("scores").and_then(Value::as_object) {
                    for (name, score, signals) in scored.iter_mut() {
                        if let Some(adjusted) = overrides.get(name).and_then(Value::as_f64) {
                            *score = (adjusted as f32).clamp(0.0, 1.0);
                            signals.push("provider-adjusted score".to_string());
                        }
                    }
                    enriched = true;
                }
            }
        }

        let assets: Vec<Value> = scored
            .iter()
            .map(|(name, score, signals)| {
                json!({
                    "name": name,
                    "score": score,
                    "band": band(*score),
                    "signals": signals,
                })
            })
            .collect();
        let high = scored.iter().filter(|(_, s, _)| *s >= 0.6).count();
        let mean = if scored.is_empty() {
            0.0
        } else {
            scored.iter().map(|(_, s, _)| s).sum::<f32>() / scored.len() as f32
        };

        tracing::debug!(
            flow = %ctx.flow.id,
            assets = scored.len(),
            high_debt = high,
            enriched,
            "debt analysis finished"
        );

        Ok(PhaseOutput {
            artifact: json!({
                "assets": assets,
                "summary": {
                    "asset_count": scored.len(),
                    "high_debt_count": high,
                    "mean_score": mean,
                    "provider_enriched": enriched,
                },
            }),
            confidence: if enriched { 0.9 } else { 0.7 },
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{fingerprint, DerivedId, DiscoveryFlow, FlowConfig, FlowId, SourceId, TenantId};
    use crate::learn::{HashEmbedder, PatternStore, Suggester, ThresholdManager};
    use crate::provider::MockProvider;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn asset(name: &str, fields: Value) -> DerivedRecord {
        let mut map: BTreeMap<String, Value> = fields
            .as_object()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("name".to_string(), json!(name));
        DerivedRecord {
            id: DerivedId::new(),
            flow_id: FlowId::new(),
            source_ref: SourceId::new(),
            fields: map,
            confidence: 0.9,
            applied_patterns: vec![],
            created_at: Utc::now(),
        }
    }

    fn context(records: Vec<DerivedRecord>, provider: MockProvider) -> PhaseContext {
        let config = FlowConfig::default();
        let flow = DiscoveryFlow::new(
            TenantId::new("acme", "wave-1"),
            config,
            fingerprint(&[], &FlowConfig::default()),
        );
        let mut artifacts = BTreeMap::new();
        artifacts.insert(PhaseId::Inventory, json!({"asset_count": records.len()}));
        PhaseContext {
            flow,
            source_records: vec![],
            derived_records: records,
            artifacts,
            suggester: Arc::new(Suggester::new(
                Arc::new(HashEmbedder::new()),
                Arc::new(PatternStore::open_in_memory().unwrap()),
                Arc::new(ThresholdManager::open_in_memory().unwrap()),
                FlowConfig::default(),
            )),
            provider: Arc::new(provider),
        }
    }

    #[tokio::test]
    async fn eol_os_and_age_drive_the_score_up() {
        let ctx = context(
            vec![
                asset("legacy-01", json!({"os": "Windows Server 2008", "age_years": 12, "owner": "ops"})),
                asset("fresh-01", json!({"os": "Ubuntu 24.04", "age_years": 1, "owner": "ops"})),
            ],
            MockProvider::unavailable(),
        );
        let out = DebtAnalysisExecutor.run(&ctx).await.unwrap();
        let assets = out.artifact["assets"].as_array().unwrap();
        assert_eq!(assets[0]["band"], "high");
        assert_eq!(assets[1]["band"], "low");
        assert_eq!(out.artifact["summary"]["high_debt_count"], 1);
        assert_eq!(out.artifact["summary"]["provider_enriched"], false);
    }

    #[tokio::test]
    async fn missing_owner_is_a_debt_signal() {
        let ctx = context(
            vec![asset("orphan-01", json!({"os": "Ubuntu 24.04"}))],
            MockProvider::unavailable(),
        );
        let out = DebtAnalysisExecutor.run(&ctx).await.unwrap();
        let signals = out.artifact["assets"][0]["signals"].as_array().unwrap();
        assert!(signals.iter().any(|s| s == "no recorded owner"));
    }

    #[tokio::test]
    async fn provider_overrides_local_scores() {
        let provider = MockProvider::new()
            .with_response(json!({"scores": {"legacy-01": 0.95}}), 0.9);
        let ctx = context(
            vec![asset("legacy-01", json!({"os": "AIX", "owner": "ops"}))],
            provider,
        );
        let out = DebtAnalysisExecutor.run(&ctx).await.unwrap();
        let score = out.artifact["assets"][0]["score"].as_f64().unwrap();
        assert!((score - 0.95).abs() < 1e-6);
        assert_eq!(out.artifact["summary"]["provider_enriched"], true);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_local_scores() {
        let provider = MockProvider::new()
            .with_failure(crate::provider::ProviderError::Malformed("bad".into()));
        let ctx = context(
            vec![asset("legacy-01", json!({"os": "Solaris", "owner": "ops"}))],
            provider,
        );
        let out = DebtAnalysisExecutor.run(&ctx).await.unwrap();
        assert_eq!(out.artifact["summary"]["provider_enriched"], false);
        assert!(out.artifact["assets"][0]["score"].as_f64().unwrap() > 0.0);
    }
}
