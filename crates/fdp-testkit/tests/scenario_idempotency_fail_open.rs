//! An unreachable idempotency store never blocks scoring: the request is
//! processed fail-open, the error counter increments, and no idempotency
//! record is written.

use fdp_kv::IdempotencyStore;
use fdp_schemas::Verdict;
use fdp_testkit::{sample_event, EngineHarness};

#[tokio::test]
async fn kv_outage_fails_open_and_counts() {
    let h = EngineHarness::new();
    h.kv.set_idempotency_down(true);

    let decision = h
        .engine
        .score(sample_event("evt-fo", "idem-fo"))
        .await
        .expect("score must proceed fail-open");

    assert_eq!(decision.verdict, Verdict::Allow);
    assert_eq!(h.repo.decision_count(), 1);
    assert!(
        h.engine
            .metrics()
            .errors_total
            .with_label_values(&["idempotency_unavailable"])
            .get()
            >= 1
    );

    // No record was reserved or finalized.
    assert_eq!(h.kv.raw_record("t-acme:idem-fo"), None);
}

#[tokio::test]
async fn recovery_restores_idempotent_replays() {
    let h = EngineHarness::new();

    // Outage: two identical requests score independently.
    h.kv.set_idempotency_down(true);
    let a = h
        .engine
        .score(sample_event("evt-fo2", "idem-fo2"))
        .await
        .expect("score a");

    // Store recovers: the next request finalizes, the one after replays.
    h.kv.set_idempotency_down(false);
    let b = h
        .engine
        .score(sample_event("evt-fo2", "idem-fo2"))
        .await
        .expect("score b");
    let c = h
        .engine
        .score(sample_event("evt-fo2", "idem-fo2"))
        .await
        .expect("score c");

    assert_ne!(a.decision_id, b.decision_id, "fail-open rescored");
    assert_eq!(b.decision_id, c.decision_id, "replay after finalize");
    assert_eq!(
        h.kv.lookup("t-acme:idem-fo2").await.unwrap(),
        Some(b.decision_id)
    );
}
