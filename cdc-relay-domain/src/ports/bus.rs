// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Messagebus Port (C9)
//!
//! At-least-once FIFO delivery per consumer group. Two implementations
//! live in `cdc_relay::infra::bus`: an embedded, sled-backed transport
//! for development/test and single-host deployments, and an `rdkafka`
//! transport for deployments with a real broker. Both honor the same
//! contract: offsets only commit once a consumer has durably recorded
//! (queued or applied) the event.

use crate::error::RelayError;
use crate::events::ChangeEvent;
use async_trait::async_trait;

/// Producer side of the bus (C8's event emitter).
#[async_trait]
pub trait MessageBusProducer: Send + Sync {
    /// Publish one event, returning the offset it was assigned.
    async fn publish(&self, event: &ChangeEvent) -> Result<u64, RelayError>;
}

/// Consumer side of the bus (C10-C15's consume loop).
#[async_trait]
pub trait MessageBusConsumer: Send + Sync {
    /// Read the next undelivered event for `consumer_group`, if any.
    /// Does not advance the committed offset; call [`Self::commit`] once
    /// the event is durably recorded on the consumer side.
    async fn poll(&self, consumer_group: &str) -> Result<Option<(u64, ChangeEvent)>, RelayError>;

    /// Durably advance `consumer_group`'s committed offset to `offset`.
    async fn commit(&self, consumer_group: &str, offset: u64) -> Result<(), RelayError>;

    /// The oldest and newest offsets currently retained on the bus, used
    /// by initsync (C15) to pick a consistent window.
    async fn offset_bounds(&self) -> Result<(u64, u64), RelayError>;
}
