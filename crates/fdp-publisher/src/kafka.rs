//! Kafka transport for the `decision_events` topic.
//!
//! Compiled only with the `kafka` feature so the workspace builds without
//! librdkafka. The producer is idempotence-free by design: the platform
//! promises at-least-once and consumers dedupe on `decision_id`.

use crate::{PublishError, Transport};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;

pub struct KafkaTransport {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaTransport {
    pub fn new(brokers: &str) -> Result<Self, PublishError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| PublishError(format!("kafka producer: {e}")))?;
        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, self.send_timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| PublishError(e.to_string()))
    }
}
