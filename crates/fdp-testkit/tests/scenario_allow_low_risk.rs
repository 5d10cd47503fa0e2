//! A benign domestic purchase with a low ML score is allowed with no rule
//! hits, and both audit rows plus the published envelope exist.

use fdp_schemas::Verdict;
use fdp_scorer::MlScore;
use fdp_testkit::{sample_event, EngineHarness};

#[tokio::test]
async fn low_risk_purchase_is_allowed() {
    let h = EngineHarness::new();
    h.scorer.set_score(MlScore {
        score: 0.08,
        model_version: "fraud-v3".into(),
        top_features: vec![],
    });

    let decision = h
        .engine
        .score(sample_event("evt-s1", "idem-s1"))
        .await
        .expect("score");

    assert_eq!(decision.verdict, Verdict::Allow);
    assert_eq!(decision.score, 0.08);
    assert!(decision.rule_hits.is_empty());
    assert!(!decision.requires_2fa);
    assert!(!decision.degraded);
    assert_eq!(decision.model_version, "fraud-v3");

    // Audit rows exist for the event and the decision.
    assert_eq!(h.repo.event_count(), 1);
    assert_eq!(h.repo.decision_count(), 1);

    // The envelope reaches the transport, keyed by decision_id.
    h.publisher.drain().await;
    let published = h.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, decision.decision_id.to_string());
    assert_eq!(published[0].1["verdict"], "ALLOW");
    assert_eq!(published[0].1["event_id"], "evt-s1");
}
