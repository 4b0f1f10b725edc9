// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Port traits (hexagonal-architecture seams) implemented by
//! `cdc_relay::infra`. Everything here is `async_trait` and
//! `Send + Sync` so adapters can be swapped without touching the
//! application layer.

pub mod bus;
pub mod cache;
pub mod datasource;
pub mod target;
