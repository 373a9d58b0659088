//! Pattern learning: retrieval ranking, tenant isolation, thresholds,
//! and synthesizer bootstrap

mod common;

use common::{harness, FixedEmbedder};
use serde_json::json;
use std::sync::Arc;
use surveyor::flow::{FlowConfig, TenantId};
use surveyor::learn::thresholds::OperationType;
use surveyor::learn::{Decision, HashEmbedder, Pattern, PatternScope};
use surveyor::learn::embedder::Embedder;

fn tenant() -> TenantId {
    TenantId::new("acme", "wave-1")
}

// === Scenario: a learned synonym maps DR_TIER with high confidence ===

#[tokio::test]
async fn similar_signature_maps_with_high_confidence() {
    let embedder = Arc::new(
        FixedEmbedder::new()
            .with("DR_TIER", vec![1.0, 0.0, 0.0, 0.0])
            .with("DISASTER_RECOVERY_LEVEL", vec![0.98, 0.02, 0.0, 0.0])
            .with("1 | 2 | 3", vec![0.0, 1.0, 0.0, 0.0]),
    );
    let h = harness(embedder.clone());

    // The tenant learned this mapping over earlier engagements
    let mut learned = Pattern::new(
        PatternScope::Tenant(tenant()),
        "DISASTER_RECOVERY_LEVEL",
        "business_criticality",
        embedder.embed("DISASTER_RECOVERY_LEVEL").unwrap(),
        embedder.embed("1 | 2 | 3").unwrap(),
        0.95,
    );
    learned.success_count = 14;
    h.patterns.store(learned).unwrap();

    let samples = vec!["1".to_string(), "2".to_string(), "3".to_string()];
    let suggestions = h
        .suggester
        .suggest(&tenant(), OperationType::FieldMapping, "DR_TIER", &samples)
        .unwrap();

    assert!(!suggestions.is_empty());
    let top = &suggestions[0];
    assert_eq!(top.target, "business_criticality");
    assert!(top.confidence > 0.8, "confidence {}", top.confidence);
    assert_eq!(top.decision, Decision::AutoApply);
}

// === Scenario: equal distances rank by success count, deterministically ===

#[tokio::test]
async fn equidistant_patterns_rank_by_success_count() {
    let embedder = Arc::new(
        FixedEmbedder::new()
            .with("A", vec![1.0, 0.0, 0.0, 0.0])
            .with("B", vec![0.0, 1.0, 0.0, 0.0])
            .with("QUERY", vec![0.7071, 0.7071, 0.0, 0.0])
            .with("", vec![0.0, 0.0, 1.0, 0.0]),
    );
    let h = harness(embedder.clone());

    let content = embedder.embed("").unwrap();
    let mut weak = Pattern::new(
        PatternScope::Tenant(tenant()),
        "A",
        "target_a",
        embedder.embed("A").unwrap(),
        content.clone(),
        0.8,
    );
    weak.success_count = 1;
    let mut strong = Pattern::new(
        PatternScope::Tenant(tenant()),
        "B",
        "target_b",
        embedder.embed("B").unwrap(),
        content,
        0.8,
    );
    strong.success_count = 9;
    h.patterns.store(weak).unwrap();
    h.patterns.store(strong).unwrap();

    for _ in 0..5 {
        let suggestions = h
            .suggester
            .suggest(&tenant(), OperationType::FieldMapping, "QUERY", &[])
            .unwrap();
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].target, "target_b", "higher success count wins");
        assert_eq!(suggestions[1].target, "target_a");
    }
}

// === Scenario: one tenant's patterns never surface for another ===

#[tokio::test]
async fn patterns_do_not_leak_across_tenants() {
    let embedder = Arc::new(HashEmbedder::new());
    let h = harness(embedder.clone());

    let secret = Pattern::new(
        PatternScope::Tenant(TenantId::new("globex", "wave-9")),
        "INTERNAL_CODENAME",
        "secret_target",
        embedder.embed("INTERNAL_CODENAME").unwrap(),
        embedder.embed("x").unwrap(),
        0.99,
    );
    h.patterns.store(secret).unwrap();

    let suggestions = h
        .suggester
        .suggest(
            &tenant(),
            OperationType::FieldMapping,
            "INTERNAL_CODENAME",
            &["x".to_string()],
        )
        .unwrap();
    assert!(
        suggestions.is_empty(),
        "another tenant's pattern surfaced: {:?}",
        suggestions.iter().map(|s| &s.target).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn global_patterns_fill_in_for_new_tenants() {
    let embedder = Arc::new(HashEmbedder::new());
    let h = harness(embedder.clone());

    let global = Pattern::new(
        PatternScope::Global,
        "hostname",
        "name",
        embedder.embed("hostname").unwrap(),
        embedder.embed("web-01").unwrap(),
        0.9,
    );
    h.patterns.store(global).unwrap();

    let suggestions = h
        .suggester
        .suggest(
            &tenant(),
            OperationType::FieldMapping,
            "hostname",
            &["web-01".to_string()],
        )
        .unwrap();
    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].target, "name");
}

// === Scenario: corrections only ever tighten auto-apply ===

#[tokio::test]
async fn corrections_never_lower_auto_apply() {
    let h = harness(Arc::new(HashEmbedder::new()));
    let mut last = h
        .thresholds
        .get(&tenant(), OperationType::FieldMapping)
        .unwrap()
        .auto_apply;

    for i in 0..25 {
        h.suggester
            .learn_correction(
                &tenant(),
                OperationType::FieldMapping,
                None,
                &format!("FIELD_{}", i),
                &["v".to_string()],
                "corrected_target",
            )
            .unwrap();
        let now = h
            .thresholds
            .get(&tenant(), OperationType::FieldMapping)
            .unwrap()
            .auto_apply;
        assert!(now >= last, "auto_apply decreased under corrections");
        last = now;
    }
    assert!(last > 0.90, "sustained corrections should raise auto_apply");

    let history = h
        .thresholds
        .history(&tenant(), OperationType::FieldMapping)
        .unwrap();
    assert!(!history.is_empty());
    assert!(history
        .iter()
        .filter(|a| a.field == "auto_apply")
        .all(|a| a.new_value > a.old_value));
}

// === Scenario: unmapped columns bootstrap synthetic patterns ===

#[tokio::test]
async fn field_mapping_bootstraps_synthetics_that_never_auto_apply() {
    let h = harness(Arc::new(HashEmbedder::new()));
    let rows = vec![
        json!({"ZQ_CUSTOM_77": "alpha"}),
        json!({"ZQ_CUSTOM_77": "beta"}),
    ];
    let id = h
        .manager
        .start_flow(tenant(), rows, FlowConfig::default())
        .unwrap();
    h.manager.advance(&id).await.unwrap();

    let audit = h.patterns.audit_view(&tenant()).unwrap();
    assert!(!audit.is_empty(), "bootstrap produced no patterns");
    assert!(audit.iter().all(|p| p.synthetic && p.success_count == 0));

    // The synthetic now recognizes its own column, but stays below
    // auto-apply until something reinforces it
    let suggestions = h
        .suggester
        .suggest(
            &tenant(),
            OperationType::FieldMapping,
            "ZQ_CUSTOM_77",
            &["alpha".to_string(), "beta".to_string()],
        )
        .unwrap();
    assert!(!suggestions.is_empty());
    assert!(suggestions
        .iter()
        .all(|s| s.decision != Decision::AutoApply));
}

#[tokio::test]
async fn correction_retires_a_repeatedly_wrong_pattern() {
    let embedder = Arc::new(HashEmbedder::new());
    let h = harness(embedder.clone());

    let mut wrong = Pattern::new(
        PatternScope::Tenant(tenant()),
        "TIER",
        "service_tier",
        embedder.embed("TIER").unwrap(),
        embedder.embed("gold").unwrap(),
        0.8,
    );
    wrong.failure_count = 4;
    let wrong_id = h.patterns.store(wrong).unwrap();

    h.suggester
        .learn_correction(
            &tenant(),
            OperationType::FieldMapping,
            Some(&wrong_id),
            "TIER",
            &["gold".to_string()],
            "business_criticality",
        )
        .unwrap();

    let after = h.patterns.get(&wrong_id).unwrap().unwrap();
    assert!(after.retired, "five failures with no successes retires the pattern");

    // Retired pattern no longer competes with the corrected one
    let suggestions = h
        .suggester
        .suggest(
            &tenant(),
            OperationType::FieldMapping,
            "TIER",
            &["gold".to_string()],
        )
        .unwrap();
    assert!(suggestions.iter().all(|s| s.target != "service_tier"));
}
