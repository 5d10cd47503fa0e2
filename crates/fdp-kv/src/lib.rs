//! Key-value backed stores: idempotency records, velocity counters, and
//! allow/deny lists.
//!
//! The traits here are the narrow seams the engine depends on. `redis`
//! provides the production implementations; `memory` provides deterministic
//! in-process twins used by dev mode and every scenario test.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fdp_config::VelocityKind;
use fdp_schemas::{ListEntry, ListKind, ListType};
use std::time::Duration;
use uuid::Uuid;

pub mod memory;
pub mod redis_store;

pub use memory::MemoryKv;
pub use redis_store::RedisKv;

/// Placeholder written by `reserve` and replaced by `finalize`.
pub const PENDING_SENTINEL: &str = "__pending__";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure talking to the key-value store.
///
/// `Unavailable` is the degrade signal: callers fail open per the
/// orchestrator's error policy rather than propagating it to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    Unavailable(String),
    Corrupt(String),
}

impl std::fmt::Display for KvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KvError::Unavailable(msg) => write!(f, "kv unavailable: {msg}"),
            KvError::Corrupt(msg) => write!(f, "kv data corrupt: {msg}"),
        }
    }
}

impl std::error::Error for KvError {}

// ---------------------------------------------------------------------------
// Idempotency store (C1)
// ---------------------------------------------------------------------------

/// Outcome of an idempotency reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// No prior record (or only an in-flight sentinel): proceed to score.
    /// A concurrent duplicate may also observe `Fresh`; the race is resolved
    /// at `finalize` time by the sentinel CAS.
    Fresh,
    /// A finalized record exists: return the prior decision unchanged.
    Existing(Uuid),
    /// Store unreachable: degrade to fail-open, never block.
    Unavailable,
}

/// Outcome of replacing the sentinel with the real decision id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// The canonical id for this key after the swap. Equals the caller's id
    /// when its CAS won; otherwise the id of the request that won the race.
    Canonical(Uuid),
    Unavailable,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomic check-and-set: write the pending sentinel iff no record exists.
    async fn reserve(&self, key: &str, ttl: Duration) -> Reservation;

    /// CAS the sentinel to `decision_id` under the same TTL, returning the
    /// canonical id for the key.
    async fn finalize(&self, key: &str, decision_id: Uuid, ttl: Duration) -> Finalized;

    /// Read the finalized decision id, if any.
    async fn lookup(&self, key: &str) -> Result<Option<Uuid>, KvError>;

    async fn ready(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Velocity counter store (C5 backing)
// ---------------------------------------------------------------------------

/// Sliding-window counters stored as timestamp-scored sorted sets under
/// `velocity:{window}:{subject}:{field}`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Append `(at, delta)`, trim members older than `at − window`, refresh
    /// the key TTL to the window length.
    async fn record(
        &self,
        subject: &str,
        field: &str,
        window_secs: u64,
        at: DateTime<Utc>,
        delta: f64,
    ) -> Result<(), KvError>;

    /// Aggregate over `[now − window, now]`: sum of deltas for `Sum`,
    /// member cardinality for `Count`.
    async fn read(
        &self,
        subject: &str,
        field: &str,
        window_secs: u64,
        kind: VelocityKind,
        now: DateTime<Utc>,
    ) -> Result<f64, KvError>;

    async fn ready(&self) -> bool;
}

/// Sorted-set key for a `(window, subject, field)` counter.
pub fn velocity_key(window_secs: u64, subject: &str, field: &str) -> String {
    format!("velocity:{window_secs}:{subject}:{field}")
}

// ---------------------------------------------------------------------------
// List store (C5 backing)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ListStore: Send + Sync {
    async fn upsert(&self, entry: &ListEntry) -> Result<(), KvError>;

    async fn remove(&self, list_type: ListType, kind: ListKind, value: &str)
        -> Result<(), KvError>;

    /// True iff `value` is on the list and the entry has not expired.
    async fn is_member(
        &self,
        list_type: ListType,
        kind: ListKind,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, KvError>;

    async fn ready(&self) -> bool;
}

/// Hash key for a `(type, kind)` list.
pub fn list_key(list_type: ListType, kind: ListKind) -> String {
    format!("list:{}:{}", list_type.as_str(), kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_key_layout_is_stable() {
        assert_eq!(
            velocity_key(3_600, "card:c-1", "amount"),
            "velocity:3600:card:c-1:amount"
        );
    }

    #[test]
    fn list_key_layout_is_stable() {
        assert_eq!(list_key(ListType::Deny, ListKind::Ip), "list:deny:ip");
    }
}
