//! Deterministic in-memory implementation of all three store traits.
//!
//! Used by dev mode (no `FDP_REDIS_URL`) and by every scenario test. State
//! lives in `BTreeMap`s behind a single mutex; iteration order is stable.
//! Failure toggles let tests exercise the degrade paths without a network.

use crate::{
    CounterStore, Finalized, IdempotencyStore, KvError, ListStore, Reservation, PENDING_SENTINEL,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fdp_config::VelocityKind;
use fdp_schemas::{ListEntry, ListKind, ListType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    /// idempotency key → (value, expires-at).
    records: BTreeMap<String, (String, Instant)>,
    /// velocity key → [(timestamp, delta)].
    counters: BTreeMap<String, Vec<(DateTime<Utc>, f64)>>,
    /// (type, kind) list key → value → optional expiry.
    lists: BTreeMap<String, BTreeMap<String, Option<DateTime<Utc>>>>,
}

#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
    /// When set, every idempotency operation reports `Unavailable`.
    idempotency_down: AtomicBool,
    /// When set, every counter read errors `Unavailable` (reads only; the
    /// engine's post-decision update path is tested separately).
    counters_down: AtomicBool,
    /// When set, every list membership read errors `Unavailable`.
    lists_down: AtomicBool,
    /// Artificial latency injected into counter reads, for timeout tests.
    counter_read_delay: Mutex<Option<Duration>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_idempotency_down(&self, down: bool) {
        self.idempotency_down.store(down, Ordering::SeqCst);
    }

    pub fn set_counters_down(&self, down: bool) {
        self.counters_down.store(down, Ordering::SeqCst);
    }

    pub fn set_lists_down(&self, down: bool) {
        self.lists_down.store(down, Ordering::SeqCst);
    }

    pub fn set_counter_read_delay(&self, delay: Option<Duration>) {
        *self.counter_read_delay.lock().expect("delay poisoned") = delay;
    }

    /// Raw idempotency value, for assertions.
    pub fn raw_record(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().expect("kv poisoned");
        inner.records.get(key).map(|(v, _)| v.clone())
    }

    fn live_value(inner: &mut Inner, key: &str) -> Option<String> {
        match inner.records.get(key) {
            Some((v, expires)) if *expires > Instant::now() => Some(v.clone()),
            Some(_) => {
                inner.records.remove(key);
                None
            }
            None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// IdempotencyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl IdempotencyStore for MemoryKv {
    async fn reserve(&self, key: &str, ttl: Duration) -> Reservation {
        if self.idempotency_down.load(Ordering::SeqCst) {
            return Reservation::Unavailable;
        }
        let mut inner = self.inner.lock().expect("kv poisoned");
        match Self::live_value(&mut inner, key) {
            None => {
                inner.records.insert(
                    key.to_string(),
                    (PENDING_SENTINEL.to_string(), Instant::now() + ttl),
                );
                Reservation::Fresh
            }
            Some(v) if v == PENDING_SENTINEL => Reservation::Fresh,
            Some(v) => match Uuid::parse_str(&v) {
                Ok(id) => Reservation::Existing(id),
                Err(_) => Reservation::Fresh,
            },
        }
    }

    async fn finalize(&self, key: &str, decision_id: Uuid, ttl: Duration) -> Finalized {
        if self.idempotency_down.load(Ordering::SeqCst) {
            return Finalized::Unavailable;
        }
        let mut inner = self.inner.lock().expect("kv poisoned");
        match Self::live_value(&mut inner, key) {
            Some(v) if v != PENDING_SENTINEL => match Uuid::parse_str(&v) {
                // Another request already finalized: adopt its id.
                Ok(winner) => Finalized::Canonical(winner),
                Err(_) => Finalized::Canonical(decision_id),
            },
            _ => {
                inner.records.insert(
                    key.to_string(),
                    (decision_id.to_string(), Instant::now() + ttl),
                );
                Finalized::Canonical(decision_id)
            }
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<Uuid>, KvError> {
        if self.idempotency_down.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("idempotency store down".into()));
        }
        let mut inner = self.inner.lock().expect("kv poisoned");
        match Self::live_value(&mut inner, key) {
            Some(v) if v == PENDING_SENTINEL => Ok(None),
            Some(v) => Uuid::parse_str(&v)
                .map(Some)
                .map_err(|_| KvError::Corrupt(format!("idempotency value not a uuid: {v}"))),
            None => Ok(None),
        }
    }

    async fn ready(&self) -> bool {
        !self.idempotency_down.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// CounterStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CounterStore for MemoryKv {
    async fn record(
        &self,
        subject: &str,
        field: &str,
        window_secs: u64,
        at: DateTime<Utc>,
        delta: f64,
    ) -> Result<(), KvError> {
        let key = crate::velocity_key(window_secs, subject, field);
        let floor = at - ChronoDuration::seconds(window_secs as i64);
        let mut inner = self.inner.lock().expect("kv poisoned");
        let entries = inner.counters.entry(key).or_default();
        entries.push((at, delta));
        entries.retain(|(ts, _)| *ts >= floor);
        Ok(())
    }

    async fn read(
        &self,
        subject: &str,
        field: &str,
        window_secs: u64,
        kind: VelocityKind,
        now: DateTime<Utc>,
    ) -> Result<f64, KvError> {
        let delay = *self.counter_read_delay.lock().expect("delay poisoned");
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.counters_down.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("counter store down".into()));
        }
        let key = crate::velocity_key(window_secs, subject, field);
        let floor = now - ChronoDuration::seconds(window_secs as i64);
        let inner = self.inner.lock().expect("kv poisoned");
        let entries = match inner.counters.get(&key) {
            Some(e) => e,
            None => return Ok(0.0),
        };
        // Open-ended upper bound, matching the sorted-set range read
        // (floor .. +inf) of the production store.
        let live = entries.iter().filter(|(ts, _)| *ts >= floor);
        Ok(match kind {
            VelocityKind::Sum => live.map(|(_, d)| d).sum(),
            VelocityKind::Count => live.count() as f64,
        })
    }

    async fn ready(&self) -> bool {
        !self.counters_down.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// ListStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ListStore for MemoryKv {
    async fn upsert(&self, entry: &ListEntry) -> Result<(), KvError> {
        let key = crate::list_key(entry.list_type, entry.kind);
        let mut inner = self.inner.lock().expect("kv poisoned");
        inner
            .lists
            .entry(key)
            .or_default()
            .insert(entry.value.clone(), entry.expires_at);
        Ok(())
    }

    async fn remove(
        &self,
        list_type: ListType,
        kind: ListKind,
        value: &str,
    ) -> Result<(), KvError> {
        let key = crate::list_key(list_type, kind);
        let mut inner = self.inner.lock().expect("kv poisoned");
        if let Some(list) = inner.lists.get_mut(&key) {
            list.remove(value);
        }
        Ok(())
    }

    async fn is_member(
        &self,
        list_type: ListType,
        kind: ListKind,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, KvError> {
        if self.lists_down.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("list store down".into()));
        }
        let key = crate::list_key(list_type, kind);
        let inner = self.inner.lock().expect("kv poisoned");
        Ok(match inner.lists.get(&key).and_then(|l| l.get(value)) {
            Some(None) => true,
            Some(Some(expires)) => *expires > now,
            None => false,
        })
    }

    async fn ready(&self) -> bool {
        !self.lists_down.load(Ordering::SeqCst)
    }
}
