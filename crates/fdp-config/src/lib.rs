//! Environment-driven platform configuration.
//!
//! Every tunable has a production-sensible default; the environment overrides
//! individual values. `PlatformConfig::from_env()` is the only constructor
//! the binaries use. Tests build configs through `from_lookup` with a map so
//! they never touch process environment.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

pub const ENV_DB_URL: &str = "FDP_DATABASE_URL";
pub const ENV_REDIS_URL: &str = "FDP_REDIS_URL";
pub const ENV_SCORER_URL: &str = "FDP_SCORER_URL";
pub const ENV_RULES_PATH: &str = "FDP_RULES_PATH";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Per-call and end-to-end deadlines. All values in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct Deadlines {
    /// End-to-end SLA per scoring request.
    pub total_ms: u64,
    /// Hard cap on the ML ∥ rules fan-out, regardless of remaining SLA.
    pub fanout_cap_ms: u64,
    /// Per-call deadline for the ML scorer.
    pub ml_ms: u64,
    /// Budget for one full rules evaluation.
    pub rules_ms: u64,
    /// Hard timeout per velocity counter read.
    pub velocity_read_ms: u64,
    /// Timeout per idempotency / list round trip.
    pub kv_op_ms: u64,
}

impl Deadlines {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }
    pub fn fanout_cap(&self) -> Duration {
        Duration::from_millis(self.fanout_cap_ms)
    }
    pub fn ml(&self) -> Duration {
        Duration::from_millis(self.ml_ms)
    }
    pub fn rules(&self) -> Duration {
        Duration::from_millis(self.rules_ms)
    }
    pub fn velocity_read(&self) -> Duration {
        Duration::from_millis(self.velocity_read_ms)
    }
    pub fn kv_op(&self) -> Duration {
        Duration::from_millis(self.kv_op_ms)
    }
}

/// Fusion score thresholds. `low ≤ high`, both within [0, 1].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Thresholds {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublisherConfig {
    pub topic: String,
    /// Bounded in-process retry queue; overflow drops oldest.
    pub queue_capacity: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// The streak must fit inside this window to count.
    pub window_ms: u64,
    /// Open duration before a half-open probe is admitted.
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolConfig {
    pub pg_max_connections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second admitted by the daemon. 0 disables.
    pub per_second: u32,
    pub burst: u32,
}

// ---------------------------------------------------------------------------
// Velocity registry
// ---------------------------------------------------------------------------

/// Aggregate kind of a velocity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VelocityKind {
    /// Sum of per-event deltas (e.g. `amount`).
    Sum,
    /// Cardinality of events in the window (e.g. `count`).
    Count,
}

/// Declares the aggregate kind per velocity field. The kind is configuration,
/// never inferred from how a rule happens to read the counter.
#[derive(Debug, Clone, Serialize)]
pub struct VelocityRegistry {
    kinds: BTreeMap<String, VelocityKind>,
}

impl VelocityRegistry {
    /// Built-in registry: `amount` sums, `count` counts.
    pub fn default_registry() -> Self {
        let mut kinds = BTreeMap::new();
        kinds.insert("amount".to_string(), VelocityKind::Sum);
        kinds.insert("count".to_string(), VelocityKind::Count);
        Self { kinds }
    }

    /// Parse `field:kind,field:kind` (e.g. `amount:sum,count:count`).
    pub fn parse(spec: &str) -> Result<Self> {
        let mut kinds = BTreeMap::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (field, kind) = part
                .split_once(':')
                .with_context(|| format!("velocity field spec missing ':': {part}"))?;
            let kind = match kind.trim() {
                "sum" => VelocityKind::Sum,
                "count" => VelocityKind::Count,
                other => bail!("unknown velocity kind: {other}"),
            };
            kinds.insert(field.trim().to_string(), kind);
        }
        if kinds.is_empty() {
            bail!("velocity field spec declared no fields");
        }
        Ok(Self { kinds })
    }

    pub fn kind_of(&self, field: &str) -> Option<VelocityKind> {
        self.kinds.get(field).copied()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, VelocityKind)> {
        self.kinds.iter().map(|(f, k)| (f.as_str(), *k))
    }
}

/// Sliding windows the platform maintains, in seconds.
pub const WINDOW_1H_SECS: u64 = 3_600;
pub const WINDOW_24H_SECS: u64 = 86_400;

// ---------------------------------------------------------------------------
// PlatformConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PlatformConfig {
    pub deadlines: Deadlines,
    pub thresholds: Thresholds,
    /// Idempotency record TTL in seconds (default 24 h).
    pub idempotency_ttl_secs: u64,
    pub publisher: PublisherConfig,
    pub breaker: BreakerConfig,
    pub pools: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub velocity: VelocityRegistry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scorer_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,
}

impl PlatformConfig {
    /// Read configuration from process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Read configuration through an arbitrary lookup (tests pass a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let deadlines = Deadlines {
            total_ms: parse_or(&get, "FDP_TOTAL_DEADLINE_MS", 100)?,
            fanout_cap_ms: parse_or(&get, "FDP_FANOUT_CAP_MS", 80)?,
            ml_ms: parse_or(&get, "FDP_ML_DEADLINE_MS", 30)?,
            rules_ms: parse_or(&get, "FDP_RULES_DEADLINE_MS", 50)?,
            velocity_read_ms: parse_or(&get, "FDP_VELOCITY_READ_TIMEOUT_MS", 5)?,
            kv_op_ms: parse_or(&get, "FDP_KV_OP_TIMEOUT_MS", 10)?,
        };

        let thresholds = Thresholds {
            low: parse_or(&get, "FDP_SCORE_THRESHOLD_LOW", 0.50)?,
            high: parse_or(&get, "FDP_SCORE_THRESHOLD_HIGH", 0.70)?,
        };
        if !(0.0..=1.0).contains(&thresholds.low)
            || !(0.0..=1.0).contains(&thresholds.high)
            || thresholds.low > thresholds.high
        {
            bail!(
                "score thresholds out of order: low={} high={}",
                thresholds.low,
                thresholds.high
            );
        }

        let velocity = match get("FDP_VELOCITY_FIELDS") {
            Some(spec) => VelocityRegistry::parse(&spec)?,
            None => VelocityRegistry::default_registry(),
        };

        Ok(Self {
            deadlines,
            thresholds,
            idempotency_ttl_secs: parse_or(&get, "FDP_IDEMPOTENCY_TTL_SECS", 86_400)?,
            publisher: PublisherConfig {
                topic: get("FDP_PUBLISH_TOPIC").unwrap_or_else(|| "decision_events".to_string()),
                queue_capacity: parse_or(&get, "FDP_PUBLISH_QUEUE_CAPACITY", 1_024)?,
                backoff_base_ms: parse_or(&get, "FDP_PUBLISH_BACKOFF_BASE_MS", 50)?,
                backoff_max_ms: parse_or(&get, "FDP_PUBLISH_BACKOFF_MAX_MS", 5_000)?,
            },
            breaker: BreakerConfig {
                failure_threshold: parse_or(&get, "FDP_BREAKER_FAILURES", 5)?,
                window_ms: parse_or(&get, "FDP_BREAKER_WINDOW_MS", 10_000)?,
                cooldown_ms: parse_or(&get, "FDP_BREAKER_COOLDOWN_MS", 5_000)?,
            },
            pools: PoolConfig {
                pg_max_connections: parse_or(&get, "FDP_PG_MAX_CONNECTIONS", 10)?,
            },
            rate_limit: RateLimitConfig {
                per_second: parse_or(&get, "FDP_RATE_LIMIT_RPS", 0)?,
                burst: parse_or(&get, "FDP_RATE_LIMIT_BURST", 50)?,
            },
            velocity,
            scorer_url: get(ENV_SCORER_URL),
            redis_url: get(ENV_REDIS_URL),
            rules_path: get(ENV_RULES_PATH),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |k| map.get(k).map(|v| v.to_string())
    }

    #[test]
    fn defaults_match_sla_budget() {
        let cfg = PlatformConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.deadlines.total_ms, 100);
        assert_eq!(cfg.deadlines.fanout_cap_ms, 80);
        assert_eq!(cfg.deadlines.ml_ms, 30);
        assert_eq!(cfg.deadlines.rules_ms, 50);
        assert_eq!(cfg.deadlines.velocity_read_ms, 5);
        assert_eq!(cfg.thresholds.low, 0.50);
        assert_eq!(cfg.thresholds.high, 0.70);
        assert_eq!(cfg.idempotency_ttl_secs, 86_400);
        assert_eq!(cfg.publisher.topic, "decision_events");
    }

    #[test]
    fn env_overrides_win() {
        let map = HashMap::from([
            ("FDP_ML_DEADLINE_MS", "15"),
            ("FDP_PUBLISH_TOPIC", "fraud.decisions"),
        ]);
        let cfg = PlatformConfig::from_lookup(lookup(&map)).unwrap();
        assert_eq!(cfg.deadlines.ml_ms, 15);
        assert_eq!(cfg.publisher.topic, "fraud.decisions");
    }

    #[test]
    fn bad_numeric_value_errors_with_key() {
        let map = HashMap::from([("FDP_ML_DEADLINE_MS", "soon")]);
        let err = PlatformConfig::from_lookup(lookup(&map)).unwrap_err();
        assert!(format!("{err:#}").contains("FDP_ML_DEADLINE_MS"));
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let map = HashMap::from([
            ("FDP_SCORE_THRESHOLD_LOW", "0.9"),
            ("FDP_SCORE_THRESHOLD_HIGH", "0.4"),
        ]);
        assert!(PlatformConfig::from_lookup(lookup(&map)).is_err());
    }

    #[test]
    fn velocity_registry_parses_and_rejects() {
        let reg = VelocityRegistry::parse("amount:sum, count:count").unwrap();
        assert_eq!(reg.kind_of("amount"), Some(VelocityKind::Sum));
        assert_eq!(reg.kind_of("count"), Some(VelocityKind::Count));
        assert_eq!(reg.kind_of("other"), None);

        assert!(VelocityRegistry::parse("amount:avg").is_err());
        assert!(VelocityRegistry::parse("").is_err());
    }

    #[test]
    fn default_registry_declares_amount_and_count() {
        let reg = VelocityRegistry::default_registry();
        assert_eq!(reg.kind_of("amount"), Some(VelocityKind::Sum));
        assert_eq!(reg.kind_of("count"), Some(VelocityKind::Count));
    }
}
