//! Kafka destination dispatcher, gated behind the `dispatch-kafka`
//! feature like the other optional protocol backends. One point per
//! message, keyed by `device_id` so a partitioned topic keeps per-device
//! ordering.

use super::{DispatchOutcome, DispatchPoint, Dispatcher};
use crate::error::{RelayError, Result};
use crate::model::ClientDestination;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;

pub struct KafkaDispatcher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDispatcher {
    pub fn new(destination: &ClientDestination) -> Result<Self> {
        let brokers = destination
            .host
            .clone()
            .ok_or_else(|| RelayError::Config(format!("kafka destination #{} has no broker host", destination.id)))?;
        let topic = destination
            .database_name
            .clone()
            .ok_or_else(|| RelayError::Config(format!("kafka destination #{} has no topic (database_name)", destination.id)))?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| RelayError::Config(format!("failed to build kafka producer: {e}")))?;

        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl Dispatcher for KafkaDispatcher {
    async fn dispatch(&self, points: &[DispatchPoint]) -> Result<DispatchOutcome> {
        if points.is_empty() {
            return Ok(DispatchOutcome::sent("no points to send"));
        }

        let mut failures = 0usize;
        for dp in points {
            let payload = serde_json::json!({
                "device_id": dp.point.device_id,
                "key_name": dp.key_name,
                "ts": dp.point.ts,
                "unit": dp.point.unit,
                "quality": dp.point.quality,
            })
            .to_string();
            let key = dp.point.device_id.to_string();

            let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);
            if self.producer.send(record, Duration::from_secs(5)).await.is_err() {
                failures += 1;
            }
        }

        if failures == 0 {
            Ok(DispatchOutcome::sent(format!("produced {} records to {}", points.len(), self.topic)))
        } else {
            Ok(DispatchOutcome::failed(format!("{failures}/{} records failed to produce", points.len())))
        }
    }
}
