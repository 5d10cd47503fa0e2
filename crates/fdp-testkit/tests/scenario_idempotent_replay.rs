//! Idempotency: a replay with the same (tenant, key) after finalize returns
//! the SAME decision — id, verdict, score, rule hits — with latency measured
//! for the replay call, and writes no second audit row.

use fdp_schemas::Verdict;
use fdp_scorer::MlScore;
use fdp_testkit::{sample_event, EngineHarness};

#[tokio::test]
async fn replay_within_ttl_returns_identical_decision() {
    let h = EngineHarness::new();
    h.scorer.set_score(MlScore {
        score: 0.08,
        model_version: "fraud-v3".into(),
        top_features: vec![],
    });

    let first = h
        .engine
        .score(sample_event("evt-s4", "idem-s4"))
        .await
        .expect("first score");

    // Score drift between calls must NOT leak into the replay.
    h.scorer.set_score(MlScore {
        score: 0.99,
        model_version: "fraud-v4".into(),
        top_features: vec![],
    });

    let replay = h
        .engine
        .score(sample_event("evt-s4", "idem-s4"))
        .await
        .expect("replay score");

    assert_eq!(replay.decision_id, first.decision_id);
    assert_eq!(replay.verdict, first.verdict);
    assert_eq!(replay.score, first.score);
    assert_eq!(replay.rule_hits, first.rule_hits);
    assert_eq!(replay.verdict, Verdict::Allow);

    // Exactly one audit row each despite two requests.
    assert_eq!(h.repo.event_count(), 1);
    assert_eq!(h.repo.decision_count(), 1);
}

#[tokio::test]
async fn different_idempotency_keys_decide_independently() {
    let h = EngineHarness::new();

    let a = h
        .engine
        .score(sample_event("evt-s4a", "idem-a"))
        .await
        .expect("score a");
    let b = h
        .engine
        .score(sample_event("evt-s4b", "idem-b"))
        .await
        .expect("score b");

    assert_ne!(a.decision_id, b.decision_id);
    assert_eq!(h.repo.decision_count(), 2);
}

#[tokio::test]
async fn tenant_scopes_the_idempotency_key() {
    let h = EngineHarness::new();

    let a = h
        .engine
        .score(sample_event("evt-s4c", "shared-key"))
        .await
        .expect("score a");

    let mut other_tenant = sample_event("evt-s4d", "shared-key");
    other_tenant.tenant_id = "t-globex".into();
    let b = h.engine.score(other_tenant).await.expect("score b");

    assert_ne!(a.decision_id, b.decision_id);
}
