//! Decision event publishing (C3).
//!
//! `Publisher` owns a bounded in-process queue drained by a background task.
//! Delivery is at-least-once: a failed send is retried with exponential
//! backoff and the envelope stays at the head of the queue. Enqueue never
//! blocks the request path; when the queue is full the OLDEST envelope is
//! dropped and a counter incremented.

use async_trait::async_trait;
use fdp_config::PublisherConfig;
use fdp_schemas::DecisionEnvelope;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[cfg(feature = "kafka")]
pub mod kafka;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PublishError(pub String);

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "publish failed: {}", self.0)
    }
}

impl std::error::Error for PublishError {}

/// One attempt to hand an envelope to the durable topic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// No-broker transport: logs the envelope. Used when the `kafka` feature is
/// off or no broker is configured; keeps the decision path identical.
pub struct TracingTransport;

#[async_trait]
impl Transport for TracingTransport {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        tracing::info!(topic, key, bytes = payload.len(), "decision event published (log transport)");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

struct Queued {
    key: String,
    payload: Vec<u8>,
    attempts: u32,
}

struct Shared {
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
    dropped_oldest: AtomicU64,
    delivered: AtomicU64,
    in_flight: AtomicBool,
    closed: AtomicBool,
}

pub struct Publisher {
    shared: Arc<Shared>,
    capacity: usize,
}

impl Publisher {
    /// Start the drain worker and return the enqueue handle.
    pub fn spawn(transport: Arc<dyn Transport>, cfg: &PublisherConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped_oldest: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let topic = cfg.topic.clone();
        let backoff_base = Duration::from_millis(cfg.backoff_base_ms.max(1));
        let backoff_max = Duration::from_millis(cfg.backoff_max_ms.max(1));

        tokio::spawn(async move {
            drain_loop(worker_shared, transport, topic, backoff_base, backoff_max).await;
        });

        Self {
            shared,
            capacity: cfg.queue_capacity.max(1),
        }
    }

    /// Queue one envelope for delivery. Never blocks; full queue drops the
    /// oldest entry. The only error is a serialization failure.
    pub fn enqueue(&self, envelope: &DecisionEnvelope) -> Result<(), PublishError> {
        let payload =
            serde_json::to_vec(envelope).map_err(|e| PublishError(format!("serialize: {e}")))?;
        let item = Queued {
            key: envelope.decision_id.to_string(),
            payload,
            attempts: 0,
        };

        {
            let mut q = self.shared.queue.lock().expect("publish queue poisoned");
            if q.len() >= self.capacity {
                q.pop_front();
                self.shared.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("publish queue full; dropped oldest envelope");
            }
            q.push_back(item);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn backlog(&self) -> usize {
        self.shared.queue.lock().expect("publish queue poisoned").len()
    }

    pub fn dropped_oldest(&self) -> u64 {
        self.shared.dropped_oldest.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Stop the worker after the queue drains. Tests only; the daemon keeps
    /// publishing for its whole lifetime.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }

    /// Wait until everything queued so far has been handed to the transport.
    pub async fn drain(&self) {
        loop {
            let empty = self.backlog() == 0 && !self.shared.in_flight.load(Ordering::SeqCst);
            if empty {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

async fn drain_loop(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    topic: String,
    backoff_base: Duration,
    backoff_max: Duration,
) {
    loop {
        let item = {
            let mut q = shared.queue.lock().expect("publish queue poisoned");
            q.pop_front()
        };

        match item {
            Some(mut item) => {
                shared.in_flight.store(true, Ordering::SeqCst);
                let res = transport.send(&topic, &item.key, &item.payload).await;
                match res {
                    Ok(()) => {
                        shared.delivered.fetch_add(1, Ordering::Relaxed);
                        shared.in_flight.store(false, Ordering::SeqCst);
                    }
                    Err(e) => {
                        item.attempts = item.attempts.saturating_add(1);
                        let wait = backoff(backoff_base, backoff_max, item.attempts);
                        tracing::warn!(
                            key = %item.key,
                            attempts = item.attempts,
                            backoff_ms = wait.as_millis() as u64,
                            error = %e,
                            "publish failed; will retry"
                        );
                        {
                            let mut q = shared.queue.lock().expect("publish queue poisoned");
                            q.push_front(item);
                        }
                        shared.in_flight.store(false, Ordering::SeqCst);
                        if shared.closed.load(Ordering::SeqCst) {
                            return;
                        }
                        tokio::time::sleep(wait).await;
                    }
                }
            }
            None => {
                if shared.closed.load(Ordering::SeqCst) {
                    return;
                }
                shared.notify.notified().await;
            }
        }
    }
}

/// `base * 2^(attempts-1)`, capped at `max`.
fn backoff(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let wait = base.saturating_mul(1u32 << exp);
    wait.min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fdp_schemas::Verdict;
    use uuid::Uuid;

    fn cfg(capacity: usize) -> PublisherConfig {
        PublisherConfig {
            topic: "decision_events".into(),
            queue_capacity: capacity,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
        }
    }

    fn envelope() -> DecisionEnvelope {
        DecisionEnvelope {
            decision_id: Uuid::new_v4(),
            event_id: "evt-1".into(),
            tenant_id: "t-1".into(),
            verdict: Verdict::Allow,
            score: 0.1,
            rule_hits: vec![],
            model_version: "mv".into(),
            created_at: Utc::now(),
            degraded: None,
        }
    }

    /// Fails the first `fail_first` sends, then succeeds, recording keys.
    struct FlakyTransport {
        fail_first: AtomicU64,
        sent: Mutex<Vec<String>>,
    }

    impl FlakyTransport {
        fn new(fail_first: u64) -> Self {
            Self {
                fail_first: AtomicU64::new(fail_first),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, _topic: &str, key: &str, _payload: &[u8]) -> Result<(), PublishError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(PublishError("broker down".into()));
            }
            self.sent.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_after_transient_failures() {
        let transport = Arc::new(FlakyTransport::new(3));
        let publisher = Publisher::spawn(Arc::clone(&transport) as Arc<dyn Transport>, &cfg(16));

        let env = envelope();
        publisher.enqueue(&env).unwrap();
        publisher.drain().await;

        assert_eq!(publisher.delivered(), 1);
        assert_eq!(
            transport.sent.lock().unwrap().as_slice(),
            &[env.decision_id.to_string()]
        );
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        // Transport that never succeeds keeps the queue saturated.
        let transport = Arc::new(FlakyTransport::new(u64::MAX));
        let publisher = Publisher::spawn(Arc::clone(&transport) as Arc<dyn Transport>, &cfg(2));

        for _ in 0..5 {
            publisher.enqueue(&envelope()).unwrap();
        }

        assert!(publisher.dropped_oldest() >= 2);
        assert!(publisher.backlog() <= 3); // capacity + possibly one in flight
        publisher.close();
    }

    #[tokio::test]
    async fn preserves_order_across_retries() {
        let transport = Arc::new(FlakyTransport::new(2));
        let publisher = Publisher::spawn(Arc::clone(&transport) as Arc<dyn Transport>, &cfg(16));

        let first = envelope();
        let second = envelope();
        publisher.enqueue(&first).unwrap();
        publisher.enqueue(&second).unwrap();
        publisher.drain().await;

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![first.decision_id.to_string(), second.decision_id.to_string()]
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_millis(50);
        let max = Duration::from_millis(500);
        assert_eq!(backoff(base, max, 1), Duration::from_millis(50));
        assert_eq!(backoff(base, max, 2), Duration::from_millis(100));
        assert_eq!(backoff(base, max, 3), Duration::from_millis(200));
        assert_eq!(backoff(base, max, 10), max);
    }
}
