//! Cleansing phase
//!
//! Normalizes raw values ahead of inventory: trims whitespace, collapses
//! internal runs, and turns empty strings into nulls. The cleaned rows ride
//! in the artifact so later phases read them without mutating the source
//! records.

use super::traits::{PhaseContext, PhaseError, PhaseExecutor, PhaseOutput};
use crate::flow::PhaseId;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub struct CleansingExecutor;

#[derive(Default)]
struct FixCounts {
    trimmed: u64,
    collapsed: u64,
    emptied: u64,
}

/// Clean one string value, tallying which rules fired.
fn clean_value(raw: &str, counts: &mut FixCounts) -> Value {
    let trimmed = raw.trim();
    if trimmed.len() != raw.len() {
        counts.trimmed += 1;
    }
    if trimmed.is_empty() {
        counts.emptied += 1;
        return Value::Null;
    }
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed != trimmed {
        counts.collapsed += 1;
    }
    Value::String(collapsed)
}

#[async_trait]
impl PhaseExecutor for CleansingExecutor {
    fn id(&self) -> PhaseId {
        PhaseId::Cleansing
    }

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutput, PhaseError> {
        // Mapping must exist even though cleansing applies to all columns;
        // running out of order is a bug, not a degraded mode.
        ctx.require_artifact(PhaseId::FieldMapping)?;

        let mut counts = FixCounts::default();
        let mut rows_touched = 0u64;
        let mut cleaned_rows = Vec::with_capacity(ctx.source_records.len());

        for record in &ctx.source_records {
            let Some(obj) = record.payload.as_object() else {
                return Err(PhaseError::Validation(format!(
                    "source row {} is not a JSON object",
                    record.row_index
                )));
            };
            let before = (counts.trimmed, counts.collapsed, counts.emptied);
            let mut cleaned = Map::new();
            for (key, value) in obj {
                let new_value = match value {
                    Value::String(s) => clean_value(s, &mut counts),
                    other => other.clone(),
                };
                cleaned.insert(key.clone(), new_value);
            }
            if (counts.trimmed, counts.collapsed, counts.emptied) != before {
                rows_touched += 1;
            }
            cleaned_rows.push(json!({
                "row_index": record.row_index,
                "payload": Value::Object(cleaned),
            }));
        }

        tracing::debug!(
            flow = %ctx.flow.id,
            rows_touched,
            "cleansing finished"
        );

        Ok(PhaseOutput {
            artifact: json!({
                "rules": {
                    "trim_whitespace": counts.trimmed,
                    "collapse_whitespace": counts.collapsed,
                    "empty_to_null": counts.emptied,
                },
                "rows_touched": rows_touched,
                "cleaned_rows": cleaned_rows,
            }),
            confidence: 1.0,
            ..Default::default()
        })
    }
}
