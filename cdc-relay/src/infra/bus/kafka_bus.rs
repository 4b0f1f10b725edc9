// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Kafka-Backed Messagebus (C9)
//!
//! Production transport for deployments with a real broker. Every
//! `ChangeEvent` is published to one fixed topic's single partition so
//! the log stays totally ordered, matching [`super::sled_bus::SledBus`]'s
//! semantics exactly — a consumer group can move between the two
//! transports without observing a different delivery order.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::ChangeEvent;
use cdc_relay_domain::ports::bus::{MessageBusConsumer, MessageBusProducer};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

const PARTITION: i32 = 0;

pub struct KafkaBus {
    topic: String,
    producer: FutureProducer,
    consumer: BaseConsumer,
}

impl KafkaBus {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, RelayError> {
        let topic = topic.into();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| RelayError::bus_unavailable(format!("failed to create Kafka producer: {e}")))?;

        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", "cdc-relay-bus-internal")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| RelayError::bus_unavailable(format!("failed to create Kafka consumer: {e}")))?;

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition(&topic, PARTITION);
        consumer
            .assign(&assignment)
            .map_err(|e| RelayError::bus_unavailable(format!("failed to assign partition: {e}")))?;

        Ok(Self { topic, producer, consumer })
    }

    fn seek_to(&self, offset: i64) -> Result<(), RelayError> {
        self.consumer
            .seek(&self.topic, PARTITION, Offset::Offset(offset), Duration::from_secs(5))
            .map_err(|e| RelayError::bus_unavailable(format!("seek failed: {e}")))
    }
}

#[async_trait]
impl MessageBusProducer for KafkaBus {
    async fn publish(&self, event: &ChangeEvent) -> Result<u64, RelayError> {
        let payload = serde_json::to_vec(event).map_err(|e| RelayError::SerializationError(e.to_string()))?;
        let key = format!("{}\u{1f}{}", event.type_name, event.pkey);
        let record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&self.topic).partition(PARTITION).payload(&payload).key(&key);
        let (_, offset) = self
            .producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| RelayError::bus_unavailable(format!("publish failed: {e}")))?;
        Ok(offset as u64)
    }
}

#[async_trait]
impl MessageBusConsumer for KafkaBus {
    async fn poll(&self, consumer_group: &str) -> Result<Option<(u64, ChangeEvent)>, RelayError> {
        let committed = self.fetch_committed(consumer_group)?;
        self.seek_to(committed as i64)?;
        match self.consumer.poll(Duration::from_millis(50)) {
            None => Ok(None),
            Some(Err(e)) => Err(RelayError::bus_unavailable(format!("poll failed: {e}"))),
            Some(Ok(message)) => {
                let offset = message.offset() as u64;
                let payload = message
                    .payload()
                    .ok_or_else(|| RelayError::bus_unavailable("message missing payload"))?;
                let event: ChangeEvent = serde_json::from_slice(payload).map_err(|e| RelayError::SerializationError(e.to_string()))?;
                Ok(Some((offset, event)))
            }
        }
    }

    async fn commit(&self, consumer_group: &str, offset: u64) -> Result<(), RelayError> {
        self.commit_out_of_band(consumer_group, offset)
    }

    async fn offset_bounds(&self) -> Result<(u64, u64), RelayError> {
        let (low, high) = self
            .consumer
            .fetch_watermarks(&self.topic, PARTITION, Duration::from_secs(5))
            .map_err(|e| RelayError::bus_unavailable(format!("fetch_watermarks failed: {e}")))?;
        Ok((low as u64, high.saturating_sub(1).max(low) as u64))
    }
}

impl KafkaBus {
    /// Kafka's native per-group committed offsets live on the broker, but
    /// `BaseConsumer` here is shared across every consumer group this
    /// process serves rather than joined to one, so committed offsets
    /// are tracked in a small local file keyed by group name instead of
    /// through Kafka's own group-coordination protocol.
    fn offsets_path(&self) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("cdc-relay-kafka-offsets-{}.json", self.topic))
    }

    fn fetch_committed(&self, consumer_group: &str) -> Result<u64, RelayError> {
        let path = self.offsets_path();
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Ok(0);
        };
        let map: std::collections::HashMap<String, u64> = serde_json::from_str(&contents).unwrap_or_default();
        Ok(map.get(consumer_group).copied().unwrap_or(0))
    }

    fn commit_out_of_band(&self, consumer_group: &str, offset: u64) -> Result<(), RelayError> {
        let path = self.offsets_path();
        let mut map: std::collections::HashMap<String, u64> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default();
        map.insert(consumer_group.to_string(), offset);
        let encoded = serde_json::to_string(&map).map_err(|e| RelayError::SerializationError(e.to_string()))?;
        std::fs::write(&path, encoded).map_err(RelayError::from)
    }
}
