//! ML outage: the scorer times out, rules stay live with one mild hit. The
//! decision follows the rules score, carries "ml_degraded", and is still
//! written and published.

use fdp_schemas::{Severity, Verdict};
use fdp_scorer::ScorerFailure;
use fdp_testkit::{rule, sample_event, EngineHarness};

#[tokio::test]
async fn ml_timeout_falls_back_to_rules_score() {
    let h = EngineHarness::new();
    h.load_rules(vec![rule(
        "rule_minor_signal",
        10,
        "amount > 10",
        0.20,
        Severity::Info,
    )])
    .expect("rules compile");
    h.scorer.set_failure(ScorerFailure::Timeout);

    let decision = h
        .engine
        .score(sample_event("evt-s6", "idem-s6"))
        .await
        .expect("score");

    assert_eq!(decision.verdict, Verdict::Allow); // 0.20 < 0.50
    assert_eq!(decision.score, 0.20);
    assert_eq!(decision.rule_hits, vec!["rule_minor_signal"]);
    assert!(decision.reasons.contains(&"ml_degraded".to_string()));
    assert!(decision.reasons.contains(&"ml_timeout".to_string()));
    assert!(decision.degraded);
    assert_eq!(decision.model_version, "unavailable");

    // Written and published despite the degradation.
    assert_eq!(h.repo.decision_count(), 1);
    h.publisher.drain().await;
    let published = h.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1["degraded"], true);
}

#[tokio::test]
async fn slow_scorer_is_cut_off_at_the_fanout_deadline() {
    let h = EngineHarness::new();
    // Well past the 30 ms ML deadline.
    h.scorer
        .set_delay(Some(std::time::Duration::from_millis(200)));

    let started = std::time::Instant::now();
    let decision = h
        .engine
        .score(sample_event("evt-s6b", "idem-s6b"))
        .await
        .expect("score");

    assert!(decision.degraded);
    assert!(decision.reasons.contains(&"ml_degraded".to_string()));
    // The branch deadline, not the scorer's sleep, bounds the call.
    assert!(started.elapsed() < std::time::Duration::from_millis(150));
}
