// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Concrete adapters for the port traits declared in
//! `cdc_relay_domain::ports`. Everything with a file handle, a socket, or
//! a database connection lives under this module.

pub mod bus;
pub mod cache;
pub mod config;
pub mod datasource;
pub mod logging;
pub mod metrics;
pub mod target;
