//! The process-local token bucket throttles POST /v1/score with a 429 and a
//! retry hint once the burst is spent.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use fdp_daemon::{
    routes,
    state::{AppState, Collaborators, RulesSource},
};
use fdp_kv::MemoryKv;
use fdp_publisher::Transport;
use fdp_rules::CompiledRuleSet;
use fdp_testkit::{CaptureTransport, MemoryRepo, StubScorer};
use http_body_util::BodyExt;
use tower::ServiceExt; // oneshot

fn throttled_state() -> Arc<AppState> {
    let cfg = fdp_config::PlatformConfig::from_lookup(|k| match k {
        "FDP_RATE_LIMIT_RPS" => Some("1".to_string()),
        "FDP_RATE_LIMIT_BURST" => Some("2".to_string()),
        _ => None,
    })
    .expect("config");

    let kv = Arc::new(MemoryKv::new());
    AppState::assemble(
        cfg,
        Collaborators {
            idempotency: Arc::clone(&kv) as _,
            counters: Arc::clone(&kv) as _,
            lists: Arc::clone(&kv) as _,
            repo: Arc::new(MemoryRepo::new()),
            scorer: Arc::new(StubScorer::with_score(0.08)),
        },
        Arc::new(CaptureTransport::new()) as Arc<dyn Transport>,
        RulesSource::None,
        CompiledRuleSet::empty(),
    )
    .expect("state assembles")
}

fn score_request(event_id: &str) -> Request<axum::body::Body> {
    let body = serde_json::json!({
        "event_id": event_id,
        "tenant_id": "t-acme",
        "idempotency_key": format!("idem-{event_id}"),
        "amount": 10.0,
        "currency": "EUR",
        "timestamp": "2025-06-01T10:00:00Z",
        "merchant": {"id": "m-1", "mcc": "5411", "country": "FR"},
        "card": {"card_id": "c-1", "user_id": "u-1", "type": "physical"},
        "context": {"channel": "pos"},
        "security": {"auth_method": "pin", "aml_flag": false}
    });
    Request::builder()
        .method("POST")
        .uri("/v1/score")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn burst_admitted_then_429_with_retry_hint() {
    let state = throttled_state();

    for i in 0..2 {
        let resp = routes::build_router(Arc::clone(&state))
            .oneshot(score_request(&format!("evt-rl-{i}")))
            .await
            .expect("oneshot");
        assert_eq!(resp.status(), StatusCode::OK, "request {i} within burst");
    }

    let resp = routes::build_router(Arc::clone(&state))
        .oneshot(score_request("evt-rl-3"))
        .await
        .expect("oneshot");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    let body = resp.into_body().collect().await.expect("collect").to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(json["error"], "rate_limited");
    assert!(json["retry_after_seconds"].as_u64().unwrap() >= 1);
}
