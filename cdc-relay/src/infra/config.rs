// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Layered Configuration
//!
//! Loads `RelayConfig` from a YAML file, then layers `CDC_RELAY__*`
//! environment variables on top (`CDC_RELAY__METRICS_ADDR`,
//! `CDC_RELAY__BUS__KAFKA__BROKERS`, ...) via the `config` crate.
//! `deny_unknown_fields` on every nested struct turns a typo'd key into
//! a load-time [`RelayError::ConfigInvalid`] instead of a silently
//! ignored setting.

use cdc_relay_domain::error::RelayError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "kind")]
pub enum DatasourceConfig {
    Sql {
        connection_string: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
    Flatfile {
        path: PathBuf,
        key_column: String,
    },
    Ldap {
        url: String,
        bind_dn: String,
        bind_password: String,
        base_dn: String,
    },
}

fn default_max_connections() -> u32 {
    5
}

/// A consumer-side `TargetPlugin` binding, keyed by entity type name in
/// [`RelayConfig::targets`]. Mirrors [`DatasourceConfig`]'s shape on the
/// producer side.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "kind")]
pub enum TargetConfig {
    Flatfile {
        path: PathBuf,
        key_column: String,
    },
    Ldap {
        url: String,
        bind_dn: String,
        bind_password: String,
        dn_template: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "kind")]
pub enum BusConfig {
    /// A sled-backed log opened from a database path that the producer
    /// and every consumer share. sled holds an exclusive file lock per
    /// path, so this only works when every role lives in the same OS
    /// process (as the integration tests do) or when operators are
    /// content with a single-host, single-writer deployment; anything
    /// that needs producer and consumers in separate processes on one
    /// host, let alone separate hosts, needs `kafka` instead.
    Embedded {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Kafka { brokers: String, topic: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertingConfig {
    pub smtp_relay: String,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    #[serde(default = "default_mailtext_maxsize")]
    pub mailtext_maxsize: usize,
    #[serde(default)]
    pub gzip_attachment: bool,
}

fn default_mailtext_maxsize() -> usize {
    64 * 1024
}

/// How the consumer's target-plugin apply pipeline reacts to a foreign
/// key whose parent object has pending errors (C13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyPolicy {
    /// Never block on a parent's error-queue state.
    Disabled,
    /// Block only `removed` events on a parent while its children have
    /// errors; block a child only if it references an errored parent.
    OnRemoveEvent,
    /// Block any event on an object whose foreign-key parent has
    /// pending errors.
    OnEveryEvent,
}

/// Error-queue coalescing policy applied when a new event arrives for a
/// pkey that already has queued events (C12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoremediationMode {
    /// Append every event as-is; never coalesce.
    Disabled,
    /// `added`→`modified` merges to `added`; `modified`→`modified`
    /// merges to `modified`, subject to the partial-processing boundary.
    Conservative,
    /// Superset of `conservative`: also annihilates `added`→`removed`,
    /// folds `removed`→`added` into `modified`, and collapses
    /// `modified`→`removed` to `removed`.
    Maximum,
}

fn default_foreignkeys_policy() -> ForeignKeyPolicy {
    ForeignKeyPolicy::Disabled
}

fn default_autoremediation_mode() -> AutoremediationMode {
    AutoremediationMode::Disabled
}

fn default_trashbin_purge_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub dataschema_path: PathBuf,
    pub state_dir: PathBuf,
    pub datasources: BTreeMap<String, DatasourceConfig>,
    pub bus: BusConfig,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
    pub control_socket_path: PathBuf,
    pub alerting: Option<AlertingConfig>,
    #[serde(default = "default_trashbin_retention_days")]
    pub trashbin_retention_days: i64,
    #[serde(default = "default_error_queue_retry_interval_secs")]
    pub error_queue_retry_interval_secs: u64,
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Consumer group name used for bus offset tracking, the error queue
    /// index, and the cache tree namespace — lets more than one consumer
    /// (e.g. distinct target plugins) share one bus independently.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_foreignkeys_policy")]
    pub foreignkeys_policy: ForeignKeyPolicy,
    #[serde(default = "default_autoremediation_mode")]
    pub autoremediation_mode: AutoremediationMode,
    #[serde(default = "default_trashbin_purge_interval_secs")]
    pub trashbin_purge_interval_secs: u64,
    /// On a consumer's very first run against a given state directory,
    /// apply the dataschema's declared initial sequence before consuming
    /// live events (C15) rather than replaying the bus from offset zero.
    #[serde(default)]
    pub use_first_initsync_sequence: bool,
    /// Consumer-side target plugin bindings, one per entity type name.
    /// Unused by the producer role.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,
}

impl RelayConfig {
    /// Where the embedded bus's sled database lives. Defaults to
    /// `state_dir/bus`, but `bus.path` should be set explicitly to the
    /// same value in every role's config when more than one process
    /// needs to open it, since it is otherwise derived from each
    /// process's own (normally distinct) `state_dir`.
    pub fn bus_db_path(&self) -> PathBuf {
        match &self.bus {
            BusConfig::Embedded { path: Some(path) } => path.clone(),
            _ => self.state_dir.join("bus"),
        }
    }
}

fn default_consumer_group() -> String {
    "default".to_string()
}

fn default_metrics_addr() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}

fn default_trashbin_retention_days() -> i64 {
    30
}

fn default_error_queue_retry_interval_secs() -> u64 {
    60
}

fn default_cycle_interval_secs() -> u64 {
    300
}

/// Load configuration from `path`, layered with `CDC_RELAY__*`
/// environment overrides.
pub fn load(path: &Path) -> Result<RelayConfig, RelayError> {
    let built = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("CDC_RELAY").separator("__"))
        .build()
        .map_err(|e| RelayError::config_invalid(format!("failed to load configuration from {}: {e}", path.display())))?;

    built
        .try_deserialize()
        .map_err(|e| RelayError::config_invalid(format!("configuration at {} is invalid: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_minimal_embedded_bus_config() {
        let file = write_config(
            r#"
dataschema_path: /etc/cdc-relay/dataschema.yaml
state_dir: /var/lib/cdc-relay
control_socket_path: /run/cdc-relay.sock
datasources: {}
bus:
  kind: embedded
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.metrics_addr, default_metrics_addr());
        assert_eq!(config.cycle_interval_secs, 300);
        assert!(matches!(config.bus, BusConfig::Embedded { path: None }));
        assert_eq!(config.bus_db_path(), PathBuf::from("/var/lib/cdc-relay/bus"));
    }

    #[test]
    fn embedded_bus_path_override_is_used_verbatim() {
        let file = write_config(
            r#"
dataschema_path: /etc/cdc-relay/dataschema.yaml
state_dir: /var/lib/cdc-relay/producer
control_socket_path: /run/cdc-relay.sock
datasources: {}
bus:
  kind: embedded
  path: /var/lib/cdc-relay/shared-bus
"#,
        );
        let config = load(file.path()).unwrap();
        assert_eq!(config.bus_db_path(), PathBuf::from("/var/lib/cdc-relay/shared-bus"));
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let file = write_config(
            r#"
dataschema_path: /etc/cdc-relay/dataschema.yaml
state_dir: /var/lib/cdc-relay
control_socket_path: /run/cdc-relay.sock
datasources: {}
bus:
  kind: embedded
totally_unknown_key: true
"#,
        );
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn parses_kafka_bus_variant() {
        let file = write_config(
            r#"
dataschema_path: /etc/cdc-relay/dataschema.yaml
state_dir: /var/lib/cdc-relay
control_socket_path: /run/cdc-relay.sock
datasources: {}
bus:
  kind: kafka
  brokers: "localhost:9092"
  topic: cdc-relay-events
"#,
        );
        let config = load(file.path()).unwrap();
        assert!(matches!(config.bus, BusConfig::Kafka { .. }));
    }
}
