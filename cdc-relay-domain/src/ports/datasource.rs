// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Datasource Driver Port (C4)
//!
//! `DatasourceDriver` is the seam every backend (SQL, flatfile, LDAP,
//! ...) implements in `cdc_relay::infra::datasource`. Parameters are
//! always bound through the backend's native parameter syntax — never
//! string interpolation — so a driver implementation is the one place
//! injection risk from a hostile source row has to be considered.

use crate::error::RelayError;
use crate::value::TypedValue;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One row returned by [`DatasourceDriver::fetch`], column name to value.
pub type SourceRow = BTreeMap<String, TypedValue>;

/// A structured mutation request for a driver whose native protocol is
/// itself structured (LDAP's add/modify/delete entries) rather than a
/// single command string.
#[derive(Debug, Clone)]
pub struct MutationRequest {
    /// Driver-specific command or entry DN.
    pub target: String,
    /// Bound values bound to the backend's native parameter syntax.
    pub values: BTreeMap<String, TypedValue>,
}

/// Port to one configured datasource. Every method is fallible and
/// reconnects transparently on transient failure up to the driver's own
/// retry budget; once that budget is exhausted the driver surfaces
/// [`RelayError::SourceUnavailable`] so the producer can skip it for the
/// cycle rather than block indefinitely (§7).
#[async_trait]
pub trait DatasourceDriver: Send + Sync {
    /// Execute `query` (already rendered, with `params` bound through the
    /// backend's native parameter syntax) and return every matching row.
    async fn fetch(&self, query: &str, params: &BTreeMap<String, TypedValue>) -> Result<Vec<SourceRow>, RelayError>;

    /// Apply an add mutation (consumer target plugin, C11).
    async fn add(&self, request: &MutationRequest) -> Result<(), RelayError>;

    /// Apply a modify mutation (consumer target plugin, C11).
    async fn modify(&self, request: &MutationRequest) -> Result<(), RelayError>;

    /// Apply a delete mutation (consumer target plugin, C11, or trashbin
    /// purge, C14).
    async fn delete(&self, request: &MutationRequest) -> Result<(), RelayError>;

    /// Run a source binding's `commit_one` hook after one event has been
    /// acknowledged by the bus, with `ITEM_FETCHED_VALUES`/
    /// `ITEM_CACHED_VALUES` bound into `params` (§4.6). Default is a no-op
    /// for drivers whose sources declare no commit hook.
    async fn commit_one(&self, command: &str, params: &BTreeMap<String, TypedValue>) -> Result<(), RelayError> {
        let _ = (command, params);
        Ok(())
    }

    /// Run a source binding's `commit_all` hook once per cycle, after
    /// every event for the cycle has been published or the cycle has
    /// aborted, with `FETCHED_VALUES`/`CACHED_VALUES` bound into `params`
    /// (§4.6). Default is a no-op.
    async fn commit_all(&self, command: &str, params: &BTreeMap<String, TypedValue>) -> Result<(), RelayError> {
        let _ = (command, params);
        Ok(())
    }

    /// Human-readable identifier for diagnostics and the control surface
    /// (`ctl status`).
    fn name(&self) -> &str;
}
