//! Append-only persistence for events and decisions (Postgres via sqlx).
//!
//! `DecisionRepo` is the narrow interface the engine sees; `PgRepo` is the
//! production implementation. Inserts are idempotent on their primary keys
//! and a trigger rejects UPDATE/DELETE on `decisions`, so replays can never
//! mutate audit history.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fdp_schemas::{ActionHint, Decision, Rule, Severity, TransactionEvent, Verdict};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub use fdp_config::ENV_DB_URL;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Persistence failure, split by how the orchestrator must react.
#[derive(Debug, Clone)]
pub enum RepoError {
    /// Connectivity / statement failure. Event-write path surfaces this to
    /// the client; decision-write path enqueues a repair instead.
    Unavailable(String),
    /// The row itself is malformed (decode failures on read).
    Corrupt(String),
}

impl std::fmt::Display for RepoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepoError::Unavailable(msg) => write!(f, "repository unavailable: {msg}"),
            RepoError::Corrupt(msg) => write!(f, "repository row corrupt: {msg}"),
        }
    }
}

impl std::error::Error for RepoError {}

// ---------------------------------------------------------------------------
// Repository interface (C2)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DecisionRepo: Send + Sync {
    /// Append one accepted event. Idempotent: a duplicate `event_id` is a
    /// no-op, never an error.
    async fn insert_event(&self, event: &TransactionEvent) -> Result<(), RepoError>;

    /// Append one decision. Idempotent: a duplicate `decision_id` OR a
    /// second decision for the same `event_id` (the losing side of a
    /// duplicate-request race) is a silent no-op.
    async fn insert_decision(&self, decision: &Decision) -> Result<(), RepoError>;

    async fn get_decision_by_event(&self, event_id: &str) -> Result<Option<Decision>, RepoError>;

    async fn get_decision(&self, decision_id: Uuid) -> Result<Option<Decision>, RepoError>;

    async fn ready(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgRepo {
    pool: PgPool,
}

/// Connect to Postgres using FDP_DATABASE_URL.
pub async fn connect_from_env(max_connections: u32) -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

impl PgRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DecisionRepo for PgRepo {
    async fn insert_event(&self, event: &TransactionEvent) -> Result<(), RepoError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| RepoError::Corrupt(format!("event serialize: {e}")))?;

        sqlx::query(
            r#"
            insert into events (event_id, tenant_id, payload, created_at)
            values ($1, $2, $3, $4)
            on conflict (event_id) do nothing
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.tenant_id)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Unavailable(format!("insert_event: {e}")))?;

        Ok(())
    }

    async fn insert_decision(&self, decision: &Decision) -> Result<(), RepoError> {
        let rule_hits = serde_json::to_value(&decision.rule_hits)
            .map_err(|e| RepoError::Corrupt(format!("rule_hits serialize: {e}")))?;
        let reasons = serde_json::to_value(&decision.reasons)
            .map_err(|e| RepoError::Corrupt(format!("reasons serialize: {e}")))?;

        sqlx::query(
            r#"
            insert into decisions (
              decision_id, event_id, tenant_id, verdict, score, rule_hits,
              reasons, model_version, latency_ms, requires_2fa, degraded, created_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            on conflict do nothing
            "#,
        )
        .bind(decision.decision_id)
        .bind(&decision.event_id)
        .bind(&decision.tenant_id)
        .bind(decision.verdict.as_str())
        .bind(decision.score)
        .bind(&rule_hits)
        .bind(&reasons)
        .bind(&decision.model_version)
        .bind(decision.latency_ms as i64)
        .bind(decision.requires_2fa)
        .bind(decision.degraded)
        .bind(decision.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Unavailable(format!("insert_decision: {e}")))?;

        Ok(())
    }

    async fn get_decision_by_event(&self, event_id: &str) -> Result<Option<Decision>, RepoError> {
        let row = sqlx::query(
            r#"
            select decision_id, event_id, tenant_id, verdict, score, rule_hits,
                   reasons, model_version, latency_ms, requires_2fa, degraded, created_at
            from decisions
            where event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Unavailable(format!("get_decision_by_event: {e}")))?;

        row.map(decode_decision).transpose()
    }

    async fn get_decision(&self, decision_id: Uuid) -> Result<Option<Decision>, RepoError> {
        let row = sqlx::query(
            r#"
            select decision_id, event_id, tenant_id, verdict, score, rule_hits,
                   reasons, model_version, latency_ms, requires_2fa, degraded, created_at
            from decisions
            where decision_id = $1
            "#,
        )
        .bind(decision_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Unavailable(format!("get_decision: {e}")))?;

        row.map(decode_decision).transpose()
    }

    async fn ready(&self) -> bool {
        sqlx::query("select 1").execute(&self.pool).await.is_ok()
    }
}

fn decode_decision(row: PgRow) -> Result<Decision, RepoError> {
    let corrupt = |field: &str| RepoError::Corrupt(format!("decode decisions.{field}"));

    let verdict: String = row.try_get("verdict").map_err(|_| corrupt("verdict"))?;
    let verdict = match verdict.as_str() {
        "ALLOW" => Verdict::Allow,
        "CHALLENGE" => Verdict::Challenge,
        "DENY" => Verdict::Deny,
        other => return Err(RepoError::Corrupt(format!("unknown verdict: {other}"))),
    };

    let rule_hits: serde_json::Value =
        row.try_get("rule_hits").map_err(|_| corrupt("rule_hits"))?;
    let reasons: serde_json::Value = row.try_get("reasons").map_err(|_| corrupt("reasons"))?;
    let latency_ms: i64 = row.try_get("latency_ms").map_err(|_| corrupt("latency_ms"))?;

    Ok(Decision {
        decision_id: row
            .try_get("decision_id")
            .map_err(|_| corrupt("decision_id"))?,
        event_id: row.try_get("event_id").map_err(|_| corrupt("event_id"))?,
        tenant_id: row.try_get("tenant_id").map_err(|_| corrupt("tenant_id"))?,
        verdict,
        score: row.try_get("score").map_err(|_| corrupt("score"))?,
        rule_hits: serde_json::from_value(rule_hits).map_err(|_| corrupt("rule_hits"))?,
        reasons: serde_json::from_value(reasons).map_err(|_| corrupt("reasons"))?,
        model_version: row
            .try_get("model_version")
            .map_err(|_| corrupt("model_version"))?,
        latency_ms: latency_ms.max(0) as u64,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(|_| corrupt("created_at"))?,
        requires_2fa: row
            .try_get("requires_2fa")
            .map_err(|_| corrupt("requires_2fa"))?,
        degraded: row.try_get("degraded").map_err(|_| corrupt("degraded"))?,
    })
}

// ---------------------------------------------------------------------------
// Rule configuration (table source)
// ---------------------------------------------------------------------------

/// Latest enabled version of every active rule. The daemon uses this when no
/// rules file is configured.
pub async fn fetch_active_rules(pool: &PgPool) -> Result<Vec<Rule>> {
    let rows = sqlx::query(
        r#"
        select distinct on (rule_id)
               rule_id, version, enabled, priority, dsl, score,
               action_hint, severity, metadata
        from rules
        where status = 'active' and enabled
        order by rule_id, version desc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("fetch_active_rules failed")?;

    rows.into_iter().map(decode_rule).collect()
}

fn decode_rule(row: PgRow) -> Result<Rule> {
    let action_hint: String = row.try_get("action_hint")?;
    let action_hint = match action_hint.as_str() {
        "ALLOW" => ActionHint::Allow,
        "REVIEW" => ActionHint::Review,
        "CHALLENGE" => ActionHint::Challenge,
        "DENY" => ActionHint::Deny,
        other => anyhow::bail!("unknown action_hint: {other}"),
    };
    let severity: String = row.try_get("severity")?;
    let severity = match severity.as_str() {
        "info" => Severity::Info,
        "warn" => Severity::Warn,
        "critical" => Severity::Critical,
        other => anyhow::bail!("unknown severity: {other}"),
    };
    let version: i32 = row.try_get("version")?;

    Ok(Rule {
        rule_id: row.try_get("rule_id")?,
        version: version.max(0) as u32,
        enabled: row.try_get("enabled")?,
        priority: row.try_get("priority")?,
        condition: row.try_get("dsl")?,
        score: row.try_get("score")?,
        action_hint,
        severity,
        metadata: row.try_get("metadata")?,
    })
}
