//! Redis-backed implementations of the store traits.
//!
//! One `RedisKv` handle (a cloneable `ConnectionManager`) implements all
//! three traits. Every operation maps to a single round trip (reserve,
//! membership, finalize-CAS via Lua) or one pipeline (velocity update).

use crate::{
    list_key, velocity_key, CounterStore, Finalized, IdempotencyStore, KvError, ListStore,
    Reservation, PENDING_SENTINEL,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fdp_config::VelocityKind;
use fdp_schemas::{ListEntry, ListKind, ListType};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Finalize CAS: swap the sentinel for the real id; if another id already
/// won, report it; if the record expired mid-flight, write ours.
const FINALIZE_CAS: &str = r#"
local cur = redis.call('GET', KEYS[1])
if cur == false or cur == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return ARGV[2]
end
return cur
"#;

/// How long a confirmed-absent list membership is cached process-locally.
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(1);

pub struct RedisKv {
    conn: ConnectionManager,
    finalize_script: Script,
    /// Negative cache for list membership: member key → confirmed-absent-at.
    negative: Mutex<HashMap<String, Instant>>,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client =
            redis::Client::open(url).map_err(|e| KvError::Unavailable(format!("open: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| KvError::Unavailable(format!("connect: {e}")))?;
        Ok(Self {
            conn,
            finalize_script: Script::new(FINALIZE_CAS),
            negative: Mutex::new(HashMap::new()),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    fn negative_hit(&self, member_key: &str) -> bool {
        let mut cache = self.negative.lock().expect("negative cache poisoned");
        match cache.get(member_key) {
            Some(at) if at.elapsed() < NEGATIVE_CACHE_TTL => true,
            Some(_) => {
                cache.remove(member_key);
                false
            }
            None => false,
        }
    }

    fn remember_absent(&self, member_key: String) {
        let mut cache = self.negative.lock().expect("negative cache poisoned");
        // Opportunistic sweep keeps the map from growing without bound.
        if cache.len() > 4_096 {
            cache.retain(|_, at| at.elapsed() < NEGATIVE_CACHE_TTL);
        }
        cache.insert(member_key, Instant::now());
    }

    fn forget_absent(&self, member_key: &str) {
        self.negative
            .lock()
            .expect("negative cache poisoned")
            .remove(member_key);
    }
}

// ---------------------------------------------------------------------------
// IdempotencyStore
// ---------------------------------------------------------------------------

#[async_trait]
impl IdempotencyStore for RedisKv {
    async fn reserve(&self, key: &str, ttl: Duration) -> Reservation {
        let mut conn = self.conn();
        let set: Result<Option<String>, _> = redis::cmd("SET")
            .arg(key)
            .arg(PENDING_SENTINEL)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;

        match set {
            Ok(Some(_)) => Reservation::Fresh,
            Ok(None) => {
                // Key exists: a finalized id or a concurrent sentinel.
                match conn.get::<_, Option<String>>(key).await {
                    Ok(Some(v)) if v == PENDING_SENTINEL => Reservation::Fresh,
                    Ok(Some(v)) => match Uuid::parse_str(&v) {
                        Ok(id) => Reservation::Existing(id),
                        Err(_) => {
                            tracing::warn!(key, "idempotency record is not a uuid; treating fresh");
                            Reservation::Fresh
                        }
                    },
                    // Expired between SET NX and GET.
                    Ok(None) => Reservation::Fresh,
                    Err(e) => {
                        tracing::warn!(error = %e, "idempotency readback failed");
                        Reservation::Unavailable
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "idempotency reserve failed");
                Reservation::Unavailable
            }
        }
    }

    async fn finalize(&self, key: &str, decision_id: Uuid, ttl: Duration) -> Finalized {
        let mut conn = self.conn();
        let res: Result<String, _> = self
            .finalize_script
            .key(key)
            .arg(PENDING_SENTINEL)
            .arg(decision_id.to_string())
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await;

        match res {
            Ok(v) => match Uuid::parse_str(&v) {
                Ok(id) => Finalized::Canonical(id),
                Err(_) => {
                    tracing::warn!(key, "finalize returned non-uuid; keeping local id");
                    Finalized::Canonical(decision_id)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "idempotency finalize failed");
                Finalized::Unavailable
            }
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<Uuid>, KvError> {
        let mut conn = self.conn();
        let v: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        match v {
            Some(s) if s == PENDING_SENTINEL => Ok(None),
            Some(s) => Uuid::parse_str(&s)
                .map(Some)
                .map_err(|_| KvError::Corrupt(format!("idempotency value not a uuid: {s}"))),
            None => Ok(None),
        }
    }

    async fn ready(&self) -> bool {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// CounterStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CounterStore for RedisKv {
    async fn record(
        &self,
        subject: &str,
        field: &str,
        window_secs: u64,
        at: DateTime<Utc>,
        delta: f64,
    ) -> Result<(), KvError> {
        let key = velocity_key(window_secs, subject, field);
        let ts = at.timestamp_millis();
        // Member carries its own delta; uniqueness comes from the uuid part.
        let member = format!("{ts}:{}:{delta}", Uuid::new_v4().simple());
        let floor = ts - (window_secs as i64) * 1_000;

        let mut conn = self.conn();
        redis::pipe()
            .cmd("ZADD")
            .arg(&key)
            .arg(ts)
            .arg(member)
            .ignore()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(floor)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(window_secs)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn read(
        &self,
        subject: &str,
        field: &str,
        window_secs: u64,
        kind: VelocityKind,
        now: DateTime<Utc>,
    ) -> Result<f64, KvError> {
        let key = velocity_key(window_secs, subject, field);
        let floor = (now - ChronoDuration::seconds(window_secs as i64)).timestamp_millis();
        let mut conn = self.conn();

        match kind {
            VelocityKind::Count => {
                let n: u64 = redis::cmd("ZCOUNT")
                    .arg(&key)
                    .arg(floor)
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| KvError::Unavailable(e.to_string()))?;
                Ok(n as f64)
            }
            VelocityKind::Sum => {
                let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg(floor)
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| KvError::Unavailable(e.to_string()))?;
                let mut sum = 0.0;
                for m in &members {
                    let delta = m
                        .rsplit(':')
                        .next()
                        .and_then(|d| d.parse::<f64>().ok())
                        .ok_or_else(|| KvError::Corrupt(format!("bad velocity member: {m}")))?;
                    sum += delta;
                }
                Ok(sum)
            }
        }
    }

    async fn ready(&self) -> bool {
        IdempotencyStore::ready(self).await
    }
}

// ---------------------------------------------------------------------------
// ListStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ListStore for RedisKv {
    async fn upsert(&self, entry: &ListEntry) -> Result<(), KvError> {
        let key = list_key(entry.list_type, entry.kind);
        let expiry = entry
            .expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(&key, &entry.value, expiry)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;
        self.forget_absent(&format!("{key}#{}", entry.value));
        Ok(())
    }

    async fn remove(
        &self,
        list_type: ListType,
        kind: ListKind,
        value: &str,
    ) -> Result<(), KvError> {
        let key = list_key(list_type, kind);
        let mut conn = self.conn();
        conn.hdel::<_, _, ()>(&key, value)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))
    }

    async fn is_member(
        &self,
        list_type: ListType,
        kind: ListKind,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, KvError> {
        let key = list_key(list_type, kind);
        let member_key = format!("{key}#{value}");
        if self.negative_hit(&member_key) {
            return Ok(false);
        }

        let mut conn = self.conn();
        let raw: Option<String> = conn
            .hget(&key, value)
            .await
            .map_err(|e| KvError::Unavailable(e.to_string()))?;

        let hit = match raw {
            None => false,
            Some(expiry) if expiry.is_empty() => true,
            Some(expiry) => match DateTime::parse_from_rfc3339(&expiry) {
                Ok(t) if t.with_timezone(&Utc) > now => true,
                Ok(_) => {
                    // Expired entry: evict opportunistically.
                    let _ = conn.hdel::<_, _, ()>(&key, value).await;
                    false
                }
                Err(_) => return Err(KvError::Corrupt(format!("bad list expiry: {expiry}"))),
            },
        };

        if !hit {
            self.remember_absent(member_key);
        }
        Ok(hit)
    }

    async fn ready(&self) -> bool {
        IdempotencyStore::ready(self).await
    }
}
