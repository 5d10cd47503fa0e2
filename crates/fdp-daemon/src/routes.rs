//! Axum router and all HTTP handlers for fdp-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    api_types::{
        HealthResponse, InternalErrorBody, ListRemoveRequest, OkResponse, RateLimitedBody,
        ReadyResponse, ReloadOkResponse, RuleSummary, RulesRejectedBody, RulesResponse,
        SimpleErrorBody, ValidationErrorBody,
    },
    state::{AppState, RulesSource},
};
use fdp_engine::ScoreError;
use fdp_schemas::validate::FieldError;
use fdp_schemas::{ListEntry, TransactionEvent};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/score", post(score))
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/v1/rules", get(rules_summary))
        .route("/v1/rules/reload", post(rules_reload))
        .route("/v1/lists", post(lists_upsert).delete(lists_remove))
        .route("/v1/decisions/:event_id", get(decision_lookup))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /v1/score
// ---------------------------------------------------------------------------

pub(crate) async fn score(
    State(st): State<Arc<AppState>>,
    payload: Result<Json<TransactionEvent>, JsonRejection>,
) -> Response {
    if let Some(limiter) = &st.limiter {
        let admit = limiter.lock().expect("limiter poisoned").try_take();
        if let Err(retry_after_seconds) = admit {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(RateLimitedBody {
                    error: "rate_limited",
                    retry_after_seconds,
                }),
            )
                .into_response();
        }
    }

    // Shape errors (missing fields, bad enum values) are 400s with the same
    // body as domain validation failures.
    let Json(event) = match payload {
        Ok(p) => p,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ValidationErrorBody {
                    error: "validation_error",
                    details: vec![FieldError {
                        field: "body".to_string(),
                        message: rejection.body_text(),
                    }],
                }),
            )
                .into_response();
        }
    };

    match st.engine.score(event).await {
        Ok(decision) => (StatusCode::OK, Json(decision)).into_response(),
        Err(ScoreError::InvalidRequest(v)) => (
            StatusCode::BAD_REQUEST,
            Json(ValidationErrorBody {
                error: "validation_error",
                details: v.details,
            }),
        )
            .into_response(),
        Err(e) => {
            let correlation_id = Uuid::new_v4();
            error!(%correlation_id, kind = e.kind(), error = %e, "scoring request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(InternalErrorBody {
                    error: "internal",
                    correlation_id,
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/ready
// ---------------------------------------------------------------------------

pub(crate) async fn ready(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let components = st.engine.readiness().await;
    let ready = components.all();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadyResponse { ready, components }))
}

// ---------------------------------------------------------------------------
// GET /metrics
// ---------------------------------------------------------------------------

pub(crate) async fn metrics(State(st): State<Arc<AppState>>) -> Response {
    st.publish_dropped
        .set(st.publisher.dropped_oldest() as i64);
    st.publish_backlog.set(st.publisher.backlog() as i64);

    let families = st.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
        error!(error = %e, "metrics encode failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/rules
// ---------------------------------------------------------------------------

pub(crate) async fn rules_summary(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let set = st.rules.load();
    let rules: Vec<RuleSummary> = set
        .rules()
        .map(|r| RuleSummary {
            rule_id: r.rule_id.clone(),
            version: r.version,
            priority: r.priority,
            severity: r.severity,
            enabled: r.enabled,
        })
        .collect();
    (
        StatusCode::OK,
        Json(RulesResponse {
            count: rules.len(),
            loaded_at: set.loaded_at,
            rules,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /v1/rules/reload
// ---------------------------------------------------------------------------

/// Full reparse and atomic swap. A document with any bad rule is rejected
/// whole; the active set stays untouched.
pub(crate) async fn rules_reload(State(st): State<Arc<AppState>>) -> Response {
    let path = match &st.rules_source {
        RulesSource::File(path) => path.clone(),
        RulesSource::None => {
            return (
                StatusCode::CONFLICT,
                Json(SimpleErrorBody {
                    error: "no_rules_source",
                }),
            )
                .into_response();
        }
    };

    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) => {
            error!(path = %path, error = %e, "rules file read failed");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(SimpleErrorBody {
                    error: "rules_unreadable",
                }),
            )
                .into_response();
        }
    };

    let doc: fdp_schemas::RuleSetDoc = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            error!(path = %path, error = %e, "rules file parse failed");
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(SimpleErrorBody {
                    error: "rules_malformed",
                }),
            )
                .into_response();
        }
    };

    match fdp_rules::CompiledRuleSet::compile(&doc, &st.cfg.velocity) {
        Ok(set) => {
            let rules = set.len();
            let loaded_at = set.loaded_at;
            st.rules.swap(set);
            info!(path = %path, rules, "rule set reloaded");
            (
                StatusCode::OK,
                Json(ReloadOkResponse {
                    ok: true,
                    rules,
                    loaded_at,
                }),
            )
                .into_response()
        }
        Err(errors) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(RulesRejectedBody {
                error: "rules_rejected",
                failures: errors.failures,
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/lists  /  DELETE /v1/lists
// ---------------------------------------------------------------------------

pub(crate) async fn lists_upsert(
    State(st): State<Arc<AppState>>,
    Json(entry): Json<ListEntry>,
) -> Response {
    match st.lists.upsert(&entry).await {
        Ok(()) => {
            info!(
                list_type = entry.list_type.as_str(),
                kind = entry.kind.as_str(),
                "list entry upserted"
            );
            (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
        }
        Err(e) => {
            error!(error = %e, "list upsert failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SimpleErrorBody {
                    error: "kv_unavailable",
                }),
            )
                .into_response()
        }
    }
}

pub(crate) async fn lists_remove(
    State(st): State<Arc<AppState>>,
    Json(req): Json<ListRemoveRequest>,
) -> Response {
    match st.lists.remove(req.list_type, req.kind, &req.value).await {
        Ok(()) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => {
            error!(error = %e, "list remove failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SimpleErrorBody {
                    error: "kv_unavailable",
                }),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /v1/decisions/:event_id
// ---------------------------------------------------------------------------

pub(crate) async fn decision_lookup(
    State(st): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Response {
    match st.repo.get_decision_by_event(&event_id).await {
        Ok(Some(decision)) => (StatusCode::OK, Json(decision)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(SimpleErrorBody { error: "not_found" }),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "decision lookup failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(SimpleErrorBody {
                    error: "repository_unavailable",
                }),
            )
                .into_response()
        }
    }
}
