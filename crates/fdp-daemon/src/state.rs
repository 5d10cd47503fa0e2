//! Shared runtime state for fdp-daemon.
//!
//! `AppState::from_env` wires production collaborators (Redis, Postgres, the
//! HTTP scorer, Kafka when the feature is on) and falls back to the
//! deterministic in-memory twins for anything not configured, so a bare
//! `fdp-daemon` starts and scores locally. `assemble` is the shared
//! constructor; router tests call it with testkit fakes.

use anyhow::{Context, Result};
use fdp_config::PlatformConfig;
use fdp_db::DecisionRepo;
use fdp_engine::{DecisionEngine, EngineDeps, EngineMetrics};
use fdp_kv::{CounterStore, IdempotencyStore, ListStore, MemoryKv, RedisKv};
use fdp_publisher::{Publisher, TracingTransport, Transport};
use fdp_rules::{ActiveRules, CompiledRuleSet};
use fdp_schemas::RuleSetDoc;
use fdp_scorer::{HttpScorer, Scorer};
use fdp_testkit::{MemoryRepo, StubScorer};
use prometheus::Registry;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Copy, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Token bucket (process-local rate limit)
// ---------------------------------------------------------------------------

/// Sustained-rate limiter for POST /v1/score. Refills continuously; a full
/// bucket admits `burst` back-to-back requests.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(per_second: u32, burst: u32) -> Self {
        let capacity = burst.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: per_second.max(1) as f64,
            last: Instant::now(),
        }
    }

    /// Take one token, or report how many seconds until one is available.
    pub fn try_take(&mut self) -> Result<(), u64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - self.tokens) / self.refill_per_sec;
            Err(wait.ceil().max(1.0) as u64)
        }
    }
}

// ---------------------------------------------------------------------------
// Rules source
// ---------------------------------------------------------------------------

/// Where POST /v1/rules/reload re-reads the rule document from.
#[derive(Clone, Debug)]
pub enum RulesSource {
    File(String),
    None,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

pub struct AppState {
    pub engine: DecisionEngine,
    pub repo: Arc<dyn DecisionRepo>,
    pub lists: Arc<dyn ListStore>,
    pub rules: Arc<ActiveRules>,
    pub publisher: Arc<Publisher>,
    pub registry: Registry,
    pub cfg: Arc<PlatformConfig>,
    pub build: BuildInfo,
    pub limiter: Option<Mutex<TokenBucket>>,
    pub rules_source: RulesSource,
    /// Scrape-time gauges fed from the publisher's internal counters.
    pub publish_dropped: prometheus::IntGauge,
    pub publish_backlog: prometheus::IntGauge,
}

/// Collaborator handles `assemble` wires into the engine.
pub struct Collaborators {
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub counters: Arc<dyn CounterStore>,
    pub lists: Arc<dyn ListStore>,
    pub repo: Arc<dyn DecisionRepo>,
    pub scorer: Arc<dyn Scorer>,
}

impl AppState {
    /// Wire the engine and state from explicit parts.
    pub fn assemble(
        cfg: PlatformConfig,
        collab: Collaborators,
        transport: Arc<dyn Transport>,
        rules_source: RulesSource,
        initial_rules: CompiledRuleSet,
    ) -> Result<Arc<Self>> {
        let cfg = Arc::new(cfg);
        let registry = Registry::new();
        let metrics =
            EngineMetrics::register(&registry).context("engine metrics registration failed")?;

        let publish_dropped = prometheus::IntGauge::new(
            "publish_dropped_total",
            "Envelopes dropped from the full publish queue",
        )?;
        let publish_backlog =
            prometheus::IntGauge::new("publish_backlog", "Envelopes waiting to publish")?;
        registry.register(Box::new(publish_dropped.clone()))?;
        registry.register(Box::new(publish_backlog.clone()))?;

        let rules = Arc::new(ActiveRules::new(initial_rules));
        let publisher = Arc::new(Publisher::spawn(transport, &cfg.publisher));

        let deps = EngineDeps {
            idempotency: collab.idempotency,
            counters: collab.counters,
            lists: Arc::clone(&collab.lists),
            repo: Arc::clone(&collab.repo),
            scorer: collab.scorer,
            rules: Arc::clone(&rules),
            publisher: Arc::clone(&publisher),
        };
        let engine = DecisionEngine::new(deps, Arc::clone(&cfg), metrics);

        let limiter = if cfg.rate_limit.per_second > 0 {
            Some(Mutex::new(TokenBucket::new(
                cfg.rate_limit.per_second,
                cfg.rate_limit.burst,
            )))
        } else {
            None
        };

        Ok(Arc::new(Self {
            engine,
            repo: collab.repo,
            lists: collab.lists,
            rules,
            publisher,
            registry,
            cfg,
            build: BuildInfo {
                service: "fdp-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            limiter,
            rules_source,
            publish_dropped,
            publish_backlog,
        }))
    }

    /// Production wiring from environment; in-memory fallbacks for anything
    /// not configured so a bare daemon still starts and scores.
    pub async fn from_env() -> Result<Arc<Self>> {
        let cfg = PlatformConfig::from_env()?;

        let (idempotency, counters, lists): (
            Arc<dyn IdempotencyStore>,
            Arc<dyn CounterStore>,
            Arc<dyn ListStore>,
        ) = match &cfg.redis_url {
            Some(url) => {
                let kv = Arc::new(
                    RedisKv::connect(url)
                        .await
                        .context("redis connection failed")?,
                );
                info!("key-value store: redis");
                (
                    Arc::clone(&kv) as _,
                    Arc::clone(&kv) as _,
                    Arc::clone(&kv) as _,
                )
            }
            None => {
                warn!("FDP_REDIS_URL not set; using in-memory key-value store");
                let kv = Arc::new(MemoryKv::new());
                (
                    Arc::clone(&kv) as _,
                    Arc::clone(&kv) as _,
                    Arc::clone(&kv) as _,
                )
            }
        };

        let repo: Arc<dyn DecisionRepo> = if std::env::var(fdp_db::ENV_DB_URL).is_ok() {
            let pool = fdp_db::connect_from_env(cfg.pools.pg_max_connections).await?;
            fdp_db::migrate(&pool).await?;
            info!("repository: postgres");
            Arc::new(fdp_db::PgRepo::new(pool))
        } else {
            warn!("{} not set; using in-memory repository", fdp_db::ENV_DB_URL);
            Arc::new(MemoryRepo::new())
        };

        let scorer: Arc<dyn Scorer> = match &cfg.scorer_url {
            Some(url) => {
                info!(url = %url, "ml scorer: http");
                Arc::new(HttpScorer::new(url, &cfg.breaker))
            }
            None => {
                warn!("FDP_SCORER_URL not set; using stub scorer");
                Arc::new(StubScorer::with_score(0.05))
            }
        };

        let transport = build_transport();

        let (rules_source, initial_rules) = match &cfg.rules_path {
            Some(path) => {
                let set = load_rules_file(path, &cfg).await?;
                info!(path = %path, rules = set.len(), "rule set loaded");
                (RulesSource::File(path.clone()), set)
            }
            None => {
                warn!("FDP_RULES_PATH not set; starting with an empty rule set");
                (RulesSource::None, CompiledRuleSet::empty())
            }
        };

        Self::assemble(
            cfg,
            Collaborators {
                idempotency,
                counters,
                lists,
                repo,
                scorer,
            },
            transport,
            rules_source,
            initial_rules,
        )
    }
}

/// Read, parse, and compile a rules file; any bad rule rejects the whole
/// document.
pub async fn load_rules_file(path: &str, cfg: &PlatformConfig) -> Result<CompiledRuleSet> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read rules file {path}"))?;
    let doc: RuleSetDoc =
        serde_json::from_str(&raw).with_context(|| format!("parse rules file {path}"))?;
    CompiledRuleSet::compile(&doc, &cfg.velocity)
        .map_err(|e| anyhow::anyhow!("rules file {path} rejected: {e}"))
}

#[cfg(feature = "kafka")]
fn build_transport() -> Arc<dyn Transport> {
    match std::env::var("FDP_KAFKA_BROKERS") {
        Ok(brokers) => match fdp_publisher::kafka::KafkaTransport::new(&brokers) {
            Ok(t) => {
                info!(brokers = %brokers, "publisher transport: kafka");
                Arc::new(t)
            }
            Err(e) => {
                warn!(error = %e, "kafka transport init failed; falling back to log transport");
                Arc::new(TracingTransport)
            }
        },
        Err(_) => {
            warn!("FDP_KAFKA_BROKERS not set; publisher logs envelopes");
            Arc::new(TracingTransport)
        }
    }
}

#[cfg(not(feature = "kafka"))]
fn build_transport() -> Arc<dyn Transport> {
    Arc::new(TracingTransport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_admits_burst_then_throttles() {
        let mut bucket = TokenBucket::new(10, 3);
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_ok());
        assert!(bucket.try_take().is_ok());
        let retry = bucket.try_take().unwrap_err();
        assert!(retry >= 1);
    }
}
