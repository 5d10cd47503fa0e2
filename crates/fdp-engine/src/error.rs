//! Orchestrator error taxonomy.
//!
//! Only the failures a client must see become `ScoreError`; every other
//! failure mode (idempotency outage, scorer loss, rules loss, publish
//! failure, budget overrun) degrades inside the engine and surfaces as
//! reasons/flags on the decision plus an `errors_total{kind}` increment.

use fdp_schemas::validate::ValidationErrors;

#[derive(Debug)]
pub enum ScoreError {
    /// Schema violation; rejected before any side effect.
    InvalidRequest(ValidationErrors),
    /// Event write failed: the audit row is a precondition for scoring.
    Persistence(String),
    /// Unclassified failure; mapped to 500 with a correlation id.
    Internal(String),
}

impl ScoreError {
    /// The `errors_total{kind}` label.
    pub fn kind(&self) -> &'static str {
        match self {
            ScoreError::InvalidRequest(_) => "invalid_request",
            ScoreError::Persistence(_) => "persistence_event",
            ScoreError::Internal(_) => "internal",
        }
    }
}

impl std::fmt::Display for ScoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreError::InvalidRequest(v) => write!(f, "{v}"),
            ScoreError::Persistence(msg) => write!(f, "event persistence failed: {msg}"),
            ScoreError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ScoreError {}
