//! An AML-flagged purchase from a deny-listed IP: the critical rule forces
//! DENY regardless of score and leads the hit list.

use fdp_kv::ListStore;
use fdp_schemas::{ListEntry, ListKind, ListType, Severity, Verdict};
use fdp_scorer::MlScore;
use fdp_testkit::{rule, sample_event, EngineHarness};

#[tokio::test]
async fn critical_rule_and_deny_listed_ip_deny() {
    let h = EngineHarness::new();
    h.load_rules(vec![
        rule("rule_aml_critical", 1, "aml_flag", 0.90, Severity::Critical),
        rule("rule_high_amount", 10, "amount > 1000", 0.40, Severity::Warn),
    ])
    .expect("rules compile");

    h.kv.upsert(&ListEntry {
        list_type: ListType::Deny,
        kind: ListKind::Ip,
        value: "203.0.113.66".into(),
        reason: "fraud ring".into(),
        expires_at: None,
    })
    .await
    .expect("seed deny list");

    h.scorer.set_score(MlScore {
        score: 0.94,
        model_version: "fraud-v3".into(),
        top_features: vec![],
    });

    let mut event = sample_event("evt-s3", "idem-s3");
    event.amount = 2_499.99;
    event.currency = "USD".into();
    event.merchant.country = "RU".into();
    event.context.ip = Some("203.0.113.66".into());
    event.security.aml_flag = true;

    let decision = h.engine.score(event).await.expect("score");

    assert_eq!(decision.verdict, Verdict::Deny);
    assert!(decision.score >= 0.94);
    assert_eq!(decision.rule_hits[0], "rule_aml_critical");
    assert!(decision.rule_hits.contains(&"rule_high_amount".to_string()));
    assert!(!decision.requires_2fa);
}

#[tokio::test]
async fn deny_list_alone_denies_even_with_low_score() {
    let h = EngineHarness::new();
    h.kv.upsert(&ListEntry {
        list_type: ListType::Deny,
        kind: ListKind::Card,
        value: "c-1001".into(),
        reason: "reported stolen".into(),
        expires_at: None,
    })
    .await
    .expect("seed deny list");

    h.scorer.set_score(MlScore {
        score: 0.02,
        model_version: "fraud-v3".into(),
        top_features: vec![],
    });

    let decision = h
        .engine
        .score(sample_event("evt-s3b", "idem-s3b"))
        .await
        .expect("score");

    assert_eq!(decision.verdict, Verdict::Deny);
    assert!(decision
        .reasons
        .contains(&"deny_list_hit:card".to_string()));
}
