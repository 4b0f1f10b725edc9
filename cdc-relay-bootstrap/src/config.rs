// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Bootstrap Configuration Path Resolution
//!
//! Distinct from `cdc_relay::infra::config`'s full layered YAML/TOML loader:
//! this module only resolves *where* the configuration file lives before
//! the application layer takes over, since that decision has to happen
//! before logging or the domain crate's error type exist.

use std::path::{Path, PathBuf};

/// Default config file search locations, in order.
const DEFAULT_SEARCH_PATHS: &[&str] = &["./relay.yaml", "./relay.yml", "/etc/cdc-relay/relay.yaml"];

/// Resolve the effective configuration file path.
///
/// If `explicit` is `Some`, it is used as-is (the caller has already run
/// it through [`crate::cli::SecureArgParser::validate_path`]). Otherwise
/// the default search locations are probed in order.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    DEFAULT_SEARCH_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}
