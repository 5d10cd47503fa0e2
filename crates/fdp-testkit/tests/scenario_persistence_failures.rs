//! Persistence failure policy: an event-write failure surfaces to the
//! client with nothing published; a decision-write failure still answers the
//! client and repairs in the background.

use fdp_engine::ScoreError;
use fdp_schemas::Verdict;
use fdp_testkit::{sample_event, EngineHarness};
use std::time::Duration;

#[tokio::test]
async fn event_write_failure_surfaces_and_nothing_publishes() {
    let h = EngineHarness::new();
    h.repo.set_fail_event_writes(true);

    let err = h
        .engine
        .score(sample_event("evt-p1", "idem-p1"))
        .await
        .expect_err("event write failure must surface");

    assert!(matches!(err, ScoreError::Persistence(_)));
    assert_eq!(h.repo.event_count(), 0);
    assert_eq!(h.repo.decision_count(), 0);

    h.publisher.drain().await;
    assert!(h.transport.published().is_empty());
}

#[tokio::test]
async fn decision_write_failure_still_answers_and_repairs() {
    let h = EngineHarness::new();
    h.repo.set_fail_decision_writes(true);

    let decision = h
        .engine
        .score(sample_event("evt-p2", "idem-p2"))
        .await
        .expect("client still gets the decision");

    assert_eq!(decision.verdict, Verdict::Allow);
    assert_eq!(h.repo.event_count(), 1);
    assert_eq!(h.repo.decision_count(), 0, "write failed for now");

    // Publish is NOT held back by the failed write.
    h.publisher.drain().await;
    assert_eq!(h.transport.published().len(), 1);

    // Repository recovers; the queued repair write lands.
    h.repo.set_fail_decision_writes(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.repo.decision_count(), 1);
    assert_eq!(
        h.repo
            .decision_for_event("evt-p2")
            .expect("repaired row")
            .decision_id,
        decision.decision_id
    );
}
