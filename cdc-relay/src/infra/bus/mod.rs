// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Messagebus transports implementing `MessageBusProducer`/
//! `MessageBusConsumer` (C9): an embedded sled-backed log for
//! development and single-host deployments, and an `rdkafka` transport
//! for deployments with a real broker.

pub mod kafka_bus;
pub mod sled_bus;

pub use kafka_bus::KafkaBus;
pub use sled_bus::SledBus;
