//! Two identical requests racing through the reserve→finalize window may
//! both score, but the system converges: one decisions row per event, and
//! every later replay returns one stable decision id.

use fdp_testkit::{sample_event, EngineHarness};

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_duplicates_converge_to_one_canonical_decision() {
    let h = EngineHarness::new();

    let (a, b) = tokio::join!(
        h.engine.score(sample_event("evt-race", "idem-race")),
        h.engine.score(sample_event("evt-race", "idem-race")),
    );
    let a = a.expect("first racer");
    let b = b.expect("second racer");

    // Exactly one audit row for the event survives the race.
    assert_eq!(h.repo.event_count(), 1);
    assert_eq!(h.repo.decision_count(), 1);

    // Replays after finalize are stable and match one of the racers.
    let replay1 = h
        .engine
        .score(sample_event("evt-race", "idem-race"))
        .await
        .expect("replay 1");
    let replay2 = h
        .engine
        .score(sample_event("evt-race", "idem-race"))
        .await
        .expect("replay 2");

    assert_eq!(replay1.decision_id, replay2.decision_id);
    assert!(
        replay1.decision_id == a.decision_id || replay1.decision_id == b.decision_id,
        "canonical id must come from one of the racers"
    );
    assert_eq!(h.repo.decision_count(), 1);
}
