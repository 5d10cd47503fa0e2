//! Response/request bodies for the HTTP surface.

use chrono::{DateTime, Utc};
use fdp_engine::Readiness;
use fdp_rules::CompileFailure;
use fdp_schemas::validate::FieldError;
use fdp_schemas::{ListKind, ListType, Severity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub components: Readiness,
}

#[derive(Serialize)]
pub struct ValidationErrorBody {
    pub error: &'static str,
    pub details: Vec<FieldError>,
}

#[derive(Serialize)]
pub struct RateLimitedBody {
    pub error: &'static str,
    pub retry_after_seconds: u64,
}

#[derive(Serialize)]
pub struct InternalErrorBody {
    pub error: &'static str,
    pub correlation_id: Uuid,
}

#[derive(Serialize)]
pub struct SimpleErrorBody {
    pub error: &'static str,
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Serialize)]
pub struct ReloadOkResponse {
    pub ok: bool,
    pub rules: usize,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct RulesRejectedBody {
    pub error: &'static str,
    pub failures: Vec<CompileFailure>,
}

#[derive(Serialize)]
pub struct RuleSummary {
    pub rule_id: String,
    pub version: u32,
    pub priority: i32,
    pub severity: Severity,
    pub enabled: bool,
}

#[derive(Serialize)]
pub struct RulesResponse {
    pub count: usize,
    pub loaded_at: DateTime<Utc>,
    pub rules: Vec<RuleSummary>,
}

#[derive(Deserialize)]
pub struct ListRemoveRequest {
    pub list_type: ListType,
    pub kind: ListKind,
    pub value: String,
}
