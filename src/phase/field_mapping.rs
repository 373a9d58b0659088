//! Field mapping phase
//!
//! Maps each distinct source column onto the canonical asset schema using
//! the pattern suggester. Columns with no confident pattern are tried
//! against the analysis provider when one is available, and otherwise left
//! unmapped for the synthesizer and human review.

use super::traits::{PatternOutcome, PhaseContext, PhaseError, PhaseExecutor, PhaseOutput};
use crate::flow::PhaseId;
use crate::learn::thresholds::OperationType;
use crate::learn::Decision;
use crate::provider::{analyze_with_retry, AnalysisRequest, RetryPolicy};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Sample values gathered per column for content embedding.
const SAMPLES_PER_COLUMN: usize = 5;

pub struct FieldMappingExecutor;

/// Pull distinct columns and up to `SAMPLES_PER_COLUMN` example values each
/// from the raw payloads, in stable column order.
fn collect_columns(rows: &[&Value]) -> BTreeMap<String, Vec<String>> {
    let mut columns: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in rows {
        let Some(obj) = row.as_object() else { continue };
        for (key, value) in obj {
            let samples = columns.entry(key.clone()).or_default();
            if samples.len() < SAMPLES_PER_COLUMN && !value.is_null() {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !samples.contains(&text) {
                    samples.push(text);
                }
            }
        }
    }
    columns
}

#[async_trait]
impl PhaseExecutor for FieldMappingExecutor {
    fn id(&self) -> PhaseId {
        PhaseId::FieldMapping
    }

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutput, PhaseError> {
        if ctx.source_records.is_empty() {
            return Err(PhaseError::Validation(
                "flow has no source records to map".to_string(),
            ));
        }

        let payloads: Vec<&Value> = ctx.source_records.iter().map(|r| &r.payload).collect();
        let columns = collect_columns(&payloads);
        let thresholds = ctx
            .suggester
            .thresholds()
            .get(ctx.tenant(), OperationType::FieldMapping)?;

        let mut mappings = serde_json::Map::new();
        let mut unmapped = Vec::new();
        let mut pattern_outcomes = Vec::new();
        let mut confidences = Vec::new();
        let provider_available = ctx.provider.is_available().await;

        for (column, samples) in &columns {
            let suggestions = ctx.suggester.suggest(
                ctx.tenant(),
                OperationType::FieldMapping,
                column,
                samples,
            )?;

            let best = suggestions
                .iter()
                .find(|s| s.decision != Decision::Reject);

            if let Some(s) = best {
                let decision = match s.decision {
                    Decision::AutoApply => "auto_applied",
                    _ => "suggested",
                };
                mappings.insert(
                    column.clone(),
                    json!({
                        "target": s.target,
                        "confidence": s.confidence,
                        "decision": decision,
                        "pattern_id": s.pattern_id.to_string(),
                    }),
                );
                confidences.push(s.confidence);
                if s.decision == Decision::AutoApply {
                    pattern_outcomes.push(PatternOutcome {
                        pattern_id: s.pattern_id,
                        operation: OperationType::FieldMapping,
                        accepted: true,
                    });
                }
                continue;
            }

            // No pattern knows this column; ask the provider for a hint
            if provider_available {
                let policy = RetryPolicy {
                    per_attempt_timeout: Duration::from_secs(ctx.config().provider_timeout_secs),
                    ..Default::default()
                };
                let result = analyze_with_retry(
                    ctx.provider.as_ref(),
                    AnalysisRequest {
                        operation: "map_field".to_string(),
                        payload: json!({"column": column, "samples": samples}),
                    },
                    &policy,
                )
                .await;
                if let Ok(hint) = result {
                    if let Some(target) = hint.data.get("target").and_then(Value::as_str) {
                        if hint.confidence >= thresholds.suggest {
                            mappings.insert(
                                column.clone(),
                                json!({
                                    "target": target,
                                    "confidence": hint.confidence,
                                    "decision": "suggested",
                                    "pattern_id": Value::Null,
                                }),
                            );
                            confidences.push(hint.confidence);
                            continue;
                        }
                    }
                }
            }

            unmapped.push(json!({"column": column, "samples": samples}));
        }

        let confidence = if confidences.is_empty() {
            0.0
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };

        tracing::debug!(
            flow = %ctx.flow.id,
            mapped = mappings.len(),
            unmapped = unmapped.len(),
            "field mapping finished"
        );

        Ok(PhaseOutput {
            artifact: json!({"mappings": mappings, "unmapped": unmapped}),
            confidence,
            drafts: vec![],
            linkage_requests: vec![],
            pattern_outcomes,
        })
    }
}
