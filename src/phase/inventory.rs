//! Inventory phase
//!
//! Projects every cleaned source row through the field-mapping table into a
//! derived asset draft, requesting a linkage for each. The coordinator later
//! mints the derived record ids and commits drafts, links, and artifact in
//! one transaction.

use super::traits::{
    DerivedDraft, LinkageRequest, PhaseContext, PhaseError, PhaseExecutor, PhaseOutput,
};
use crate::flow::PhaseId;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

pub struct InventoryExecutor;

/// One column → target mapping taken from the field-mapping artifact.
struct ColumnMapping {
    target: String,
    confidence: f32,
    pattern_id: Option<String>,
}

fn parse_mappings(artifact: &Value) -> Result<BTreeMap<String, ColumnMapping>, PhaseError> {
    let table = artifact
        .get("mappings")
        .and_then(Value::as_object)
        .ok_or_else(|| PhaseError::Validation("mapping artifact has no mappings table".into()))?;

    let mut mappings = BTreeMap::new();
    for (column, entry) in table {
        let target = entry
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PhaseError::Validation(format!("mapping for column {} has no target", column))
            })?
            .to_string();
        mappings.insert(
            column.clone(),
            ColumnMapping {
                target,
                confidence: entry
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0) as f32,
                pattern_id: entry
                    .get("pattern_id")
                    .and_then(Value::as_str)
                    .map(String::from),
            },
        );
    }
    Ok(mappings)
}

/// Cleaned payloads keyed by row index, from the cleansing artifact.
pub(crate) fn cleaned_payloads(artifact: &Value) -> HashMap<usize, Value> {
    artifact
        .get("cleaned_rows")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|r| {
                    let index = r.get("row_index")?.as_u64()? as usize;
                    Some((index, r.get("payload")?.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl PhaseExecutor for InventoryExecutor {
    fn id(&self) -> PhaseId {
        PhaseId::Inventory
    }

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutput, PhaseError> {
        let mappings = parse_mappings(ctx.require_artifact(PhaseId::FieldMapping)?)?;
        let cleaned = cleaned_payloads(ctx.require_artifact(PhaseId::Cleansing)?);

        let mut drafts = Vec::with_capacity(ctx.source_records.len());
        let mut linkage_requests = Vec::with_capacity(ctx.source_records.len());

        for record in &ctx.source_records {
            let payload = cleaned
                .get(&record.row_index)
                .unwrap_or(&record.payload);
            let Some(obj) = payload.as_object() else {
                return Err(PhaseError::Validation(format!(
                    "row {} is not a JSON object",
                    record.row_index
                )));
            };

            let mut fields = BTreeMap::new();
            let mut applied_patterns = Vec::new();
            let mut confidences = Vec::new();
            for (column, value) in obj {
                match mappings.get(column) {
                    Some(m) => {
                        fields.insert(m.target.clone(), value.clone());
                        confidences.push(m.confidence);
                        if let Some(pid) = &m.pattern_id {
                            if !applied_patterns.contains(pid) {
                                applied_patterns.push(pid.clone());
                            }
                        }
                    }
                    None => {
                        // Unmapped columns survive under their raw name so
                        // nothing imported is silently dropped
                        fields.insert(format!("raw.{}", column), value.clone());
                    }
                }
            }

            let confidence = if confidences.is_empty() {
                0.5
            } else {
                confidences.iter().sum::<f32>() / confidences.len() as f32
            };

            linkage_requests.push(LinkageRequest {
                draft_index: drafts.len(),
                source: record.id,
            });
            drafts.push(DerivedDraft {
                fields,
                confidence,
                applied_patterns,
            });
        }

        let confidence = if drafts.is_empty() {
            0.0
        } else {
            drafts.iter().map(|d| d.confidence).sum::<f32>() / drafts.len() as f32
        };

        tracing::debug!(flow = %ctx.flow.id, assets = drafts.len(), "inventory finished");

        Ok(PhaseOutput {
            artifact: json!({
                "asset_count": drafts.len(),
                "mapped_columns": mappings.len(),
            }),
            confidence,
            drafts,
            linkage_requests,
            pattern_outcomes: vec![],
        })
    }
}
