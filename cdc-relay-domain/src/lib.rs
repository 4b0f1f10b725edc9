// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # cdc-relay-domain
//!
//! Pure types and pure algorithms for the relay: the typed value model
//! ([`value`]), the object model ([`object`]), the dataschema
//! ([`schema`]), the wire event model ([`events`]), the error taxonomy
//! ([`error`]), the per-type multi-source merge algorithm ([`merge`]),
//! the integrity evaluator ([`integrity`]), the producer-cache diff
//! algorithm ([`diff`]), and the port traits infrastructure adapters
//! implement ([`ports`]).
//!
//! Nothing in this crate does I/O. Expression evaluation (Tera) and
//! every concrete datasource/bus/target/cache implementation live in
//! the `cdc-relay` crate; process bootstrap concerns live in
//! `cdc-relay-bootstrap`.

pub mod diff;
pub mod error;
pub mod events;
pub mod integrity;
pub mod merge;
pub mod object;
pub mod ports;
pub mod schema;
pub mod value;
