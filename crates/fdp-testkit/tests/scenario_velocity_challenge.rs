//! Velocity: three transactions on one card inside the hour. The third
//! evaluates `velocity_1h('count') > 2` to true (the in-flight event counts
//! toward its own window) and is challenged.

use fdp_schemas::{Severity, Verdict};
use fdp_scorer::MlScore;
use fdp_testkit::{rule, sample_event, EngineHarness};
use std::time::Duration;

#[tokio::test]
async fn third_rapid_transaction_is_challenged() {
    let h = EngineHarness::new();
    h.load_rules(vec![rule(
        "rule_card_velocity",
        10,
        "velocity_1h('count') > 2",
        0.60,
        Severity::Warn,
    )])
    .expect("rules compile");

    h.scorer.set_score(MlScore {
        score: 0.10,
        model_version: "fraud-v3".into(),
        top_features: vec![],
    });

    // t=0 / t=30s / t=90s, placed so the third lands at "now".
    let base = chrono::Utc::now() - chrono::Duration::seconds(90);
    for (i, offset_secs) in [0i64, 30].into_iter().enumerate() {
        let mut event = sample_event(&format!("evt-s5-{i}"), &format!("idem-s5-{i}"));
        event.amount = 100.0;
        event.timestamp = base + chrono::Duration::seconds(offset_secs);

        let decision = h.engine.score(event).await.expect("score");
        assert_eq!(decision.verdict, Verdict::Allow, "transaction {i} allowed");

        // The counter advances post-decision on a background task.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut third = sample_event("evt-s5-2", "idem-s5-2");
    third.amount = 100.0;
    third.timestamp = base + chrono::Duration::seconds(90);

    let decision = h.engine.score(third).await.expect("score");
    assert_eq!(decision.verdict, Verdict::Challenge);
    assert_eq!(decision.rule_hits, vec!["rule_card_velocity"]);
    assert!(decision.requires_2fa);
}

#[tokio::test]
async fn another_cards_activity_does_not_spill_over() {
    let h = EngineHarness::new();
    h.load_rules(vec![rule(
        "rule_card_velocity",
        10,
        "velocity_1h('count') > 2",
        0.60,
        Severity::Warn,
    )])
    .expect("rules compile");

    // Saturate card A.
    for i in 0..3 {
        let mut event = sample_event(&format!("evt-s5x-{i}"), &format!("idem-s5x-{i}"));
        event.card.card_id = "c-other".into();
        h.engine.score(event).await.expect("score");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Card B's first transaction sees only itself.
    let decision = h
        .engine
        .score(sample_event("evt-s5y", "idem-s5y"))
        .await
        .expect("score");
    assert_eq!(decision.verdict, Verdict::Allow);
    assert!(decision.rule_hits.is_empty());
}
