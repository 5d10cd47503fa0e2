//! Shared fakes and the engine harness for scenario tests.
//!
//! Everything here is deterministic and in-process: a `BTreeMap` repository
//! with failure toggles, a stub scorer, a capturing publish transport, and a
//! fully wired `DecisionEngine` over the in-memory KV twins. The daemon also
//! uses these for dev mode (no database / scorer configured).

use async_trait::async_trait;
use chrono::Utc;
use fdp_config::PlatformConfig;
use fdp_db::{DecisionRepo, RepoError};
use fdp_engine::{DecisionEngine, EngineDeps, EngineMetrics};
use fdp_kv::MemoryKv;
use fdp_publisher::{PublishError, Publisher, Transport};
use fdp_rules::{ActiveRules, CompileErrors, CompiledRuleSet};
use fdp_schemas::{
    ActionHint, AuthMethod, Card, CardType, Channel, Decision, Merchant, RequestContext, Rule,
    RuleSetDoc, Security, Severity, TransactionEvent,
};
use fdp_scorer::{FeatureVector, MlScore, Scorer, ScorerFailure};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MemoryRepo
// ---------------------------------------------------------------------------

/// In-memory twin of the Postgres repository. Append-only by construction:
/// a duplicate insert is a no-op and nothing can mutate a stored row.
#[derive(Default)]
pub struct MemoryRepo {
    events: Mutex<BTreeMap<String, serde_json::Value>>,
    decisions: Mutex<BTreeMap<Uuid, Decision>>,
    by_event: Mutex<BTreeMap<String, Uuid>>,
    fail_event_writes: AtomicBool,
    fail_decision_writes: AtomicBool,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_event_writes(&self, fail: bool) {
        self.fail_event_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_decision_writes(&self, fail: bool) {
        self.fail_decision_writes.store(fail, Ordering::SeqCst);
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.lock().unwrap().len()
    }

    pub fn decision_for_event(&self, event_id: &str) -> Option<Decision> {
        let by_event = self.by_event.lock().unwrap();
        let id = by_event.get(event_id)?;
        self.decisions.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl DecisionRepo for MemoryRepo {
    async fn insert_event(&self, event: &TransactionEvent) -> Result<(), RepoError> {
        if self.fail_event_writes.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("event writes disabled".into()));
        }
        let payload = serde_json::to_value(event)
            .map_err(|e| RepoError::Corrupt(format!("event serialize: {e}")))?;
        self.events
            .lock()
            .unwrap()
            .entry(event.event_id.clone())
            .or_insert(payload);
        Ok(())
    }

    async fn insert_decision(&self, decision: &Decision) -> Result<(), RepoError> {
        if self.fail_decision_writes.load(Ordering::SeqCst) {
            return Err(RepoError::Unavailable("decision writes disabled".into()));
        }
        // Mirrors the unique event index: the losing side of a duplicate
        // race is discarded, and a stored row never changes.
        let mut by_event = self.by_event.lock().unwrap();
        match by_event.get(&decision.event_id) {
            Some(existing) if *existing != decision.decision_id => return Ok(()),
            _ => {}
        }
        by_event.insert(decision.event_id.clone(), decision.decision_id);
        self.decisions
            .lock()
            .unwrap()
            .entry(decision.decision_id)
            .or_insert_with(|| decision.clone());
        Ok(())
    }

    async fn get_decision_by_event(&self, event_id: &str) -> Result<Option<Decision>, RepoError> {
        Ok(self.decision_for_event(event_id))
    }

    async fn get_decision(&self, decision_id: Uuid) -> Result<Option<Decision>, RepoError> {
        Ok(self.decisions.lock().unwrap().get(&decision_id).cloned())
    }

    async fn ready(&self) -> bool {
        !self.fail_event_writes.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// StubScorer
// ---------------------------------------------------------------------------

enum StubResponse {
    Score(MlScore),
    Fail(ScorerFailure),
}

/// Deterministic scorer stand-in. Builder toggles choose the response; an
/// optional delay lets tests exercise the fan-out deadline.
pub struct StubScorer {
    response: Mutex<StubResponse>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicU64,
}

impl StubScorer {
    pub fn with_score(score: f64) -> Self {
        Self {
            response: Mutex::new(StubResponse::Score(MlScore {
                score,
                model_version: "stub-v1".to_string(),
                top_features: vec![],
            })),
            delay: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_failure(failure: ScorerFailure) -> Self {
        Self {
            response: Mutex::new(StubResponse::Fail(failure)),
            delay: Mutex::new(None),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_score(&self, ml: MlScore) {
        *self.response.lock().unwrap() = StubResponse::Score(ml);
    }

    pub fn set_failure(&self, failure: ScorerFailure) {
        *self.response.lock().unwrap() = StubResponse::Fail(failure);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scorer for StubScorer {
    async fn predict(
        &self,
        _features: &FeatureVector,
        _deadline: Duration,
    ) -> Result<MlScore, ScorerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        match &*self.response.lock().unwrap() {
            StubResponse::Score(s) => Ok(s.clone()),
            StubResponse::Fail(f) => Err(f.clone()),
        }
    }

    async fn ready(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// CaptureTransport
// ---------------------------------------------------------------------------

/// Publish transport that records every envelope it is handed.
#[derive(Default)]
pub struct CaptureTransport {
    sent: Mutex<Vec<(String, serde_json::Value)>>,
}

impl CaptureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(key, envelope)` pairs in delivery order.
    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for CaptureTransport {
    async fn send(&self, _topic: &str, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let value = serde_json::from_slice(payload)
            .map_err(|e| PublishError(format!("capture decode: {e}")))?;
        self.sent.lock().unwrap().push((key.to_string(), value));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// A fully wired engine over in-memory collaborators.
pub struct EngineHarness {
    pub cfg: Arc<PlatformConfig>,
    pub kv: Arc<MemoryKv>,
    pub repo: Arc<MemoryRepo>,
    pub scorer: Arc<StubScorer>,
    pub rules: Arc<ActiveRules>,
    pub transport: Arc<CaptureTransport>,
    pub publisher: Arc<Publisher>,
    pub engine: DecisionEngine,
}

impl EngineHarness {
    pub fn new() -> Self {
        Self::with_config(default_config())
    }

    pub fn with_config(cfg: PlatformConfig) -> Self {
        let cfg = Arc::new(cfg);
        let kv = Arc::new(MemoryKv::new());
        let repo = Arc::new(MemoryRepo::new());
        let scorer = Arc::new(StubScorer::with_score(0.05));
        let rules = Arc::new(ActiveRules::default());
        let transport = Arc::new(CaptureTransport::new());
        let publisher = Arc::new(Publisher::spawn(
            Arc::clone(&transport) as Arc<dyn Transport>,
            &cfg.publisher,
        ));

        let deps = EngineDeps {
            idempotency: Arc::clone(&kv) as _,
            counters: Arc::clone(&kv) as _,
            lists: Arc::clone(&kv) as _,
            repo: Arc::clone(&repo) as _,
            scorer: Arc::clone(&scorer) as _,
            rules: Arc::clone(&rules),
            publisher: Arc::clone(&publisher),
        };
        let engine = DecisionEngine::new(deps, Arc::clone(&cfg), EngineMetrics::detached());

        Self {
            cfg,
            kv,
            repo,
            scorer,
            rules,
            transport,
            publisher,
            engine,
        }
    }

    /// Compile and activate a rule set; whole-document rejection applies.
    pub fn load_rules(&self, rules: Vec<Rule>) -> Result<(), CompileErrors> {
        let set = CompiledRuleSet::compile(&RuleSetDoc { rules }, &self.cfg.velocity)?;
        self.rules.swap(set);
        Ok(())
    }
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform defaults (env untouched).
pub fn default_config() -> PlatformConfig {
    PlatformConfig::from_lookup(|_| None).expect("defaults are valid")
}

// ---------------------------------------------------------------------------
// Canonical fixtures
// ---------------------------------------------------------------------------

/// A benign domestic POS purchase; tests mutate what they need.
pub fn sample_event(event_id: &str, idempotency_key: &str) -> TransactionEvent {
    TransactionEvent {
        event_id: event_id.to_string(),
        tenant_id: "t-acme".to_string(),
        idempotency_key: idempotency_key.to_string(),
        amount: 45.50,
        currency: "EUR".to_string(),
        timestamp: Utc::now(),
        merchant: Merchant {
            id: "m-grocer".to_string(),
            mcc: "5411".to_string(),
            country: "FR".to_string(),
            lat: None,
            lon: None,
        },
        card: Card {
            card_id: "c-1001".to_string(),
            user_id: "u-2002".to_string(),
            card_type: CardType::Physical,
        },
        context: RequestContext {
            ip: Some("198.51.100.7".to_string()),
            geo: Some("FR".to_string()),
            device_id: Some("d-3003".to_string()),
            channel: Channel::Pos,
            user_agent: None,
        },
        security: Security {
            auth_method: AuthMethod::Pin,
            aml_flag: false,
        },
        has_initial_2fa: None,
    }
}

/// Rule fixture in the platform's configuration shape.
pub fn rule(id: &str, priority: i32, condition: &str, score: f64, severity: Severity) -> Rule {
    Rule {
        rule_id: id.to_string(),
        version: 1,
        enabled: true,
        priority,
        condition: condition.to_string(),
        score,
        action_hint: ActionHint::Review,
        severity,
        metadata: json!({}),
    }
}
