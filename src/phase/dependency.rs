//! Dependency mapping phase
//!
//! Builds the asset dependency graph from the declared dependency column.
//! The graph is a flat arena: nodes in a vec, edges as index pairs, so no
//! reference cycles and cheap serialization into the artifact.

use super::traits::{PhaseContext, PhaseError, PhaseExecutor, PhaseOutput};
use crate::flow::{DerivedRecord, PhaseId};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;

pub struct DependencyMappingExecutor;

/// Arena-style dependency graph over derived assets.
pub struct DependencyGraph {
    /// Asset display names, indexed by node id.
    pub nodes: Vec<String>,
    /// (from, to) node index pairs.
    pub edges: Vec<(usize, usize)>,
    /// References that named no known asset: (from node index, raw reference).
    pub unresolved: Vec<(usize, String)>,
}

fn display_name(record: &DerivedRecord) -> String {
    record
        .fields
        .get("name")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| record.id.to_string())
}

/// Dependency references declared on one asset, from the mapped field or its
/// raw fallback. Accepts a single string (comma-separated) or an array.
fn declared_refs(record: &DerivedRecord, dependency_field: &str) -> Vec<String> {
    let value = record
        .fields
        .get(dependency_field)
        .or_else(|| record.fields.get(&format!("raw.{}", dependency_field)));
    match value {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

impl DependencyGraph {
    /// Build the graph from derived assets and the configured dependency
    /// column. Self-references are dropped; unknown targets are recorded as
    /// unresolved rather than failing the phase.
    pub fn build(records: &[DerivedRecord], dependency_field: &str) -> Self {
        let nodes: Vec<String> = records.iter().map(display_name).collect();
        let index_by_name: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut edges = Vec::new();
        let mut unresolved = Vec::new();
        for (from, record) in records.iter().enumerate() {
            for reference in declared_refs(record, dependency_field) {
                match index_by_name.get(reference.as_str()) {
                    Some(&to) if to != from => edges.push((from, to)),
                    Some(_) => {} // self-reference
                    None => unresolved.push((from, reference)),
                }
            }
        }
        Self {
            nodes,
            edges,
            unresolved,
        }
    }

    /// Node indices with no incoming edges (nothing depends on them).
    pub fn roots(&self) -> Vec<usize> {
        let mut has_incoming = vec![false; self.nodes.len()];
        for &(_, to) in &self.edges {
            has_incoming[to] = true;
        }
        (0..self.nodes.len()).filter(|&i| !has_incoming[i]).collect()
    }
}

#[async_trait]
impl PhaseExecutor for DependencyMappingExecutor {
    fn id(&self) -> PhaseId {
        PhaseId::DependencyMapping
    }

    fn parallel_safe(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &PhaseContext) -> Result<PhaseOutput, PhaseError> {
        ctx.require_artifact(PhaseId::Inventory)?;

        let graph = DependencyGraph::build(&ctx.derived_records, &ctx.config().dependency_field);

        let edges: Vec<Value> = graph
            .edges
            .iter()
            .map(|&(from, to)| json!({"from": graph.nodes[from], "to": graph.nodes[to]}))
            .collect();
        let unresolved: Vec<Value> = graph
            .unresolved
            .iter()
            .map(|(from, reference)| json!({"from": graph.nodes[*from], "reference": reference}))
            .collect();

        // Confidence degrades with the share of dangling references
        let total_refs = graph.edges.len() + graph.unresolved.len();
        let confidence = if total_refs == 0 {
            1.0
        } else {
            graph.edges.len() as f32 / total_refs as f32
        };

        tracing::debug!(
            flow = %ctx.flow.id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            unresolved = graph.unresolved.len(),
            "dependency mapping finished"
        );

        Ok(PhaseOutput {
            artifact: json!({
                "nodes": graph.nodes,
                "edges": edges,
                "unresolved": unresolved,
                "roots": graph.roots().iter().map(|&i| graph.nodes[i].clone()).collect::<Vec<_>>(),
            }),
            confidence,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{DerivedId, FlowId, SourceId};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn asset(name: &str, depends_on: Value) -> DerivedRecord {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!(name));
        if !depends_on.is_null() {
            fields.insert("depends_on".to_string(), depends_on);
        }
        DerivedRecord {
            id: DerivedId::new(),
            flow_id: FlowId::new(),
            source_ref: SourceId::new(),
            fields,
            confidence: 0.9,
            applied_patterns: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn builds_edges_from_comma_separated_refs() {
        let records = vec![
            asset("web-01", json!("db-01, cache-01")),
            asset("db-01", Value::Null),
            asset("cache-01", Value::Null),
        ];
        let graph = DependencyGraph::build(&records, "depends_on");
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges, vec![(0, 1), (0, 2)]);
        assert!(graph.unresolved.is_empty());
    }

    #[test]
    fn array_refs_and_unresolved_targets() {
        let records = vec![
            asset("web-01", json!(["db-01", "ghost-99"])),
            asset("db-01", Value::Null),
        ];
        let graph = DependencyGraph::build(&records, "depends_on");
        assert_eq!(graph.edges, vec![(0, 1)]);
        assert_eq!(graph.unresolved, vec![(0, "ghost-99".to_string())]);
    }

    #[test]
    fn self_references_are_dropped() {
        let records = vec![asset("web-01", json!("web-01"))];
        let graph = DependencyGraph::build(&records, "depends_on");
        assert!(graph.edges.is_empty());
        assert!(graph.unresolved.is_empty());
    }

    #[test]
    fn roots_have_no_incoming_edges() {
        let records = vec![
            asset("web-01", json!("db-01")),
            asset("db-01", Value::Null),
        ];
        let graph = DependencyGraph::build(&records, "depends_on");
        assert_eq!(graph.roots(), vec![0]);
    }

    #[tokio::test]
    async fn confidence_reflects_unresolved_share() {
        use crate::flow::{fingerprint, DiscoveryFlow, FlowConfig, TenantId};
        use crate::learn::{HashEmbedder, PatternStore, Suggester, ThresholdManager};
        use crate::provider::MockProvider;
        use std::sync::Arc;

        let config = FlowConfig::default();
        let flow = DiscoveryFlow::new(
            TenantId::new("acme", "wave-1"),
            config,
            fingerprint(&[], &FlowConfig::default()),
        );
        let mut artifacts = BTreeMap::new();
        artifacts.insert(PhaseId::Inventory, json!({"asset_count": 2}));
        let ctx = PhaseContext {
            flow,
            source_records: vec![],
            derived_records: vec![
                asset("web-01", json!("db-01, ghost-99")),
                asset("db-01", Value::Null),
            ],
            artifacts,
            suggester: Arc::new(Suggester::new(
                Arc::new(HashEmbedder::new()),
                Arc::new(PatternStore::open_in_memory().unwrap()),
                Arc::new(ThresholdManager::open_in_memory().unwrap()),
                FlowConfig::default(),
            )),
            provider: Arc::new(MockProvider::unavailable()),
        };

        let out = DependencyMappingExecutor.run(&ctx).await.unwrap();
        assert!((out.confidence - 0.5).abs() < 1e-6);
        assert_eq!(out.artifact["unresolved"].as_array().unwrap().len(), 1);
    }
}
