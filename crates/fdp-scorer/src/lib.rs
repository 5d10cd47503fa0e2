//! Remote ML scorer client (C4).
//!
//! `Scorer` is the seam the engine fans out to; `HttpScorer` is the
//! production client. Every failure mode collapses to `ScorerFailure` so the
//! fuser only ever sees "score present" or "score absent with a reason" —
//! scoring problems never propagate as request errors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::timeout;

pub mod breaker;
pub mod features;

pub use breaker::{Admission, Breaker};
pub use features::FeatureVector;

// ---------------------------------------------------------------------------
// Contract types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeight {
    pub name: String,
    pub weight: f64,
}

/// Successful model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlScore {
    pub score: f64,
    pub model_version: String,
    #[serde(default)]
    pub top_features: Vec<FeatureWeight>,
}

/// Why the score is absent. `reason()` is the string the fuser appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScorerFailure {
    Timeout,
    Error(String),
    CircuitOpen,
}

impl ScorerFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            ScorerFailure::Timeout => "ml_timeout",
            ScorerFailure::Error(_) => "ml_error",
            ScorerFailure::CircuitOpen => "ml_circuit_open",
        }
    }
}

impl std::fmt::Display for ScorerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScorerFailure::Timeout => write!(f, "scorer timed out"),
            ScorerFailure::Error(msg) => write!(f, "scorer error: {msg}"),
            ScorerFailure::CircuitOpen => write!(f, "scorer circuit open"),
        }
    }
}

impl std::error::Error for ScorerFailure {}

#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score one feature vector under `deadline`.
    async fn predict(
        &self,
        features: &FeatureVector,
        deadline: Duration,
    ) -> Result<MlScore, ScorerFailure>;

    async fn ready(&self) -> bool;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
    breaker: Mutex<Breaker>,
}

impl HttpScorer {
    pub fn new(url: impl Into<String>, breaker_cfg: &fdp_config::BreakerConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            breaker: Mutex::new(Breaker::new(
                breaker_cfg.failure_threshold,
                Duration::from_millis(breaker_cfg.window_ms),
                Duration::from_millis(breaker_cfg.cooldown_ms),
            )),
        }
    }

    fn admit(&self) -> Admission {
        self.breaker
            .lock()
            .expect("breaker poisoned")
            .admit(Instant::now())
    }

    fn record(&self, outcome: &Result<MlScore, ScorerFailure>) {
        let mut b = self.breaker.lock().expect("breaker poisoned");
        match outcome {
            Ok(_) => b.on_success(),
            Err(_) => b.on_failure(Instant::now()),
        }
    }

    async fn call(&self, features: &FeatureVector, deadline: Duration) -> Result<MlScore, ScorerFailure> {
        let fut = async {
            let resp = self
                .client
                .post(&self.url)
                .json(features)
                .send()
                .await
                .map_err(|e| ScorerFailure::Error(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(ScorerFailure::Error(format!("status {}", resp.status())));
            }

            let mut score: MlScore = resp
                .json()
                .await
                .map_err(|e| ScorerFailure::Error(format!("decode: {e}")))?;
            score.score = score.score.clamp(0.0, 1.0);
            Ok(score)
        };

        match timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(ScorerFailure::Timeout),
        }
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn predict(
        &self,
        features: &FeatureVector,
        deadline: Duration,
    ) -> Result<MlScore, ScorerFailure> {
        if self.admit() == Admission::Reject {
            return Err(ScorerFailure::CircuitOpen);
        }

        let outcome = self.call(features, deadline).await;
        self.record(&outcome);
        if let Err(f) = &outcome {
            tracing::warn!(reason = f.reason(), "ml scoring degraded");
        }
        outcome
    }

    async fn ready(&self) -> bool {
        !self.breaker.lock().expect("breaker poisoned").is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_are_the_fuser_strings() {
        assert_eq!(ScorerFailure::Timeout.reason(), "ml_timeout");
        assert_eq!(ScorerFailure::Error("x".into()).reason(), "ml_error");
        assert_eq!(ScorerFailure::CircuitOpen.reason(), "ml_circuit_open");
    }

    #[test]
    fn score_response_decodes_without_top_features() {
        let raw = r#"{"score": 0.42, "model_version": "fraud-v3"}"#;
        let s: MlScore = serde_json::from_str(raw).unwrap();
        assert_eq!(s.score, 0.42);
        assert!(s.top_features.is_empty());
    }
}
