// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Embedded Messagebus (C9)
//!
//! An append-only log kept in one sled tree, with a committed offset per
//! consumer group kept in a second. Suitable for development and for
//! single-host deployments that do not need a separate broker process;
//! [`super::kafka_bus::KafkaBus`] is the transport for anything larger.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::ChangeEvent;
use cdc_relay_domain::ports::bus::{MessageBusConsumer, MessageBusProducer};
use async_trait::async_trait;

pub struct SledBus {
    log: sled::Tree,
    offsets: sled::Tree,
}

impl SledBus {
    pub fn open(db: &sled::Db) -> Result<Self, RelayError> {
        let log = db
            .open_tree("bus_log")
            .map_err(|e| RelayError::bus_unavailable(format!("failed to open bus log: {e}")))?;
        let offsets = db
            .open_tree("bus_offsets")
            .map_err(|e| RelayError::bus_unavailable(format!("failed to open bus offsets: {e}")))?;
        Ok(Self { log, offsets })
    }

    fn committed_offset(&self, consumer_group: &str) -> Result<u64, RelayError> {
        match self
            .offsets
            .get(consumer_group.as_bytes())
            .map_err(|e| RelayError::bus_unavailable(e.to_string()))?
        {
            None => Ok(0),
            Some(bytes) => Ok(u64::from_be_bytes(bytes.as_ref().try_into().map_err(|_| {
                RelayError::internal_error("corrupt offset value in bus_offsets")
            })?)),
        }
    }
}

#[async_trait]
impl MessageBusProducer for SledBus {
    async fn publish(&self, event: &ChangeEvent) -> Result<u64, RelayError> {
        let offset = self.log.generate_id().map_err(|e| RelayError::bus_unavailable(e.to_string()))?;
        let encoded = serde_json::to_vec(event).map_err(|e| RelayError::SerializationError(e.to_string()))?;
        self.log
            .insert(offset.to_be_bytes(), encoded)
            .map_err(|e| RelayError::bus_unavailable(e.to_string()))?;
        Ok(offset)
    }
}

#[async_trait]
impl MessageBusConsumer for SledBus {
    async fn poll(&self, consumer_group: &str) -> Result<Option<(u64, ChangeEvent)>, RelayError> {
        let committed = self.committed_offset(consumer_group)?;
        let mut iter = self.log.range((committed + 1).to_be_bytes()..);
        match iter.next() {
            None => Ok(None),
            Some(entry) => {
                let (key, value) = entry.map_err(|e| RelayError::bus_unavailable(e.to_string()))?;
                let offset = u64::from_be_bytes(key.as_ref().try_into().map_err(|_| {
                    RelayError::internal_error("corrupt offset key in bus_log")
                })?);
                let event: ChangeEvent = serde_json::from_slice(&value).map_err(|e| RelayError::SerializationError(e.to_string()))?;
                Ok(Some((offset, event)))
            }
        }
    }

    async fn commit(&self, consumer_group: &str, offset: u64) -> Result<(), RelayError> {
        self.offsets
            .insert(consumer_group.as_bytes(), offset.to_be_bytes().to_vec())
            .map_err(|e| RelayError::bus_unavailable(e.to_string()))?;
        Ok(())
    }

    async fn offset_bounds(&self) -> Result<(u64, u64), RelayError> {
        let first = self.log.first().map_err(|e| RelayError::bus_unavailable(e.to_string()))?;
        let last = self.log.last().map_err(|e| RelayError::bus_unavailable(e.to_string()))?;
        let to_offset = |entry: Option<(sled::IVec, sled::IVec)>| -> Result<u64, RelayError> {
            match entry {
                None => Ok(0),
                Some((key, _)) => Ok(u64::from_be_bytes(
                    key.as_ref().try_into().map_err(|_| RelayError::internal_error("corrupt offset key in bus_log"))?,
                )),
            }
        };
        Ok((to_offset(first)?, to_offset(last)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_relay_domain::value::{PrimaryKeyValue, RemotePkeyValue, TypedValue};

    fn event(pkey: i64) -> ChangeEvent {
        ChangeEvent {
            op: cdc_relay_domain::events::Operation::Added,
            type_name: "user".into(),
            pkey: PrimaryKeyValue::Simple(TypedValue::Int(pkey)),
            remote_pkey: RemotePkeyValue::new(format!("r{pkey}")),
            step: cdc_relay_domain::events::StepCounter::initial(),
            schema_rev: cdc_relay_domain::schema::SchemaRevision::initial(),
            attrs: Default::default(),
            fkeys: Default::default(),
        }
    }

    fn bus() -> SledBus {
        let db = sled::open(tempfile::tempdir().unwrap().keep()).unwrap();
        SledBus::open(&db).unwrap()
    }

    #[tokio::test]
    async fn publish_then_poll_returns_event_once_uncommitted() {
        let bus = bus();
        bus.publish(&event(1)).await.unwrap();
        let (offset, got) = bus.poll("consumers").await.unwrap().unwrap();
        assert_eq!(got, event(1));
        bus.commit("consumers", offset).await.unwrap();
        assert!(bus.poll("consumers").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn separate_consumer_groups_track_independent_offsets() {
        let bus = bus();
        let offset = bus.publish(&event(1)).await.unwrap();
        bus.commit("group-a", offset).await.unwrap();
        assert!(bus.poll("group-a").await.unwrap().is_none());
        assert!(bus.poll("group-b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn offset_bounds_reflects_published_range() {
        let bus = bus();
        bus.publish(&event(1)).await.unwrap();
        bus.publish(&event(2)).await.unwrap();
        let (lo, hi) = bus.offset_bounds().await.unwrap();
        assert!(hi > lo);
    }
}
