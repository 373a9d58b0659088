//! Shared fixtures for integration tests

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use surveyor::flow::{FlowConfig, FlowStateManager};
use surveyor::learn::{EmbedError, Embedder, PatternStore, Suggester, ThresholdManager};
use surveyor::phase::ExecutorRegistry;
use surveyor::provider::{AnalysisProvider, MockProvider};
use surveyor::storage::{FlowStore, OpenStore, SqliteFlowStore};

/// Embedder returning fixed vectors per exact input, with a far-away
/// default for anything unknown. Lets tests pin similarity relationships
/// instead of relying on trigram overlap.
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    default: Vec<f32>,
}

impl FixedEmbedder {
    pub fn new() -> Self {
        Self {
            vectors: HashMap::new(),
            default: vec![0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }
}

impl Embedder for FixedEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .map(|t| self.vectors.get(*t).cloned().unwrap_or_else(|| self.default.clone()))
            .collect())
    }
}

/// Everything a test needs to drive flows and inspect the stores behind
/// the manager's back.
pub struct Harness {
    pub manager: FlowStateManager,
    pub flow_store: Arc<SqliteFlowStore>,
    pub patterns: Arc<PatternStore>,
    pub thresholds: Arc<ThresholdManager>,
    pub suggester: Arc<Suggester>,
}

pub fn harness_with(
    embedder: Arc<dyn Embedder>,
    registry: ExecutorRegistry,
    provider: Arc<dyn AnalysisProvider>,
) -> Harness {
    let flow_store = Arc::new(SqliteFlowStore::open_in_memory().unwrap());
    let patterns = Arc::new(PatternStore::open_in_memory().unwrap());
    let thresholds = Arc::new(ThresholdManager::open_in_memory().unwrap());
    let suggester = Arc::new(Suggester::new(
        embedder.clone(),
        patterns.clone(),
        thresholds.clone(),
        FlowConfig::default(),
    ));
    let manager = FlowStateManager::new(
        flow_store.clone() as Arc<dyn FlowStore>,
        registry,
        suggester.clone(),
        provider,
        embedder,
    );
    Harness {
        manager,
        flow_store,
        patterns,
        thresholds,
        suggester,
    }
}

pub fn harness(embedder: Arc<dyn Embedder>) -> Harness {
    harness_with(
        embedder,
        ExecutorRegistry::standard(),
        Arc::new(MockProvider::unavailable()),
    )
}

/// Imported rows shaped like a typical infrastructure export.
pub fn sample_rows(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "host": format!("web-{:02}", i),
                "DR_TIER": format!("{}", (i % 3) + 1),
                "os": if i % 2 == 0 { "Ubuntu 22.04" } else { "Windows Server 2008" },
                "owner": "ops",
                "depends_on": if i == 0 { Value::Null } else { json!("web-00") },
            })
        })
        .collect()
}
