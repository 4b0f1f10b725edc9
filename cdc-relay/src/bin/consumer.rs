// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Consumer process composition root: load configuration, open durable
//! state, build the configured target plugins and bus, bootstrap from
//! initsync if this is a fresh run, then drive the apply/retry/purge
//! tasks (§4.9-§4.13, §5) until a termination signal arrives.

use async_trait::async_trait;
use cdc_relay::consumer::applier::{register_for_every_operation, ApplierDeps, TargetRegistry};
use cdc_relay::consumer::{bootstrap_initsync, run_apply_loop, run_purge_task, run_retry_task, ConsumeDeps};
use cdc_relay::control::{self, ControlHandler, ControlRequest, ControlResponse};
use cdc_relay::infra::config::{self, BusConfig, RelayConfig, TargetConfig};
use cdc_relay::infra::target::{FlatfileTarget, LdapTarget};
use cdc_relay::infra::logging::{self, LogFormat};
use cdc_relay::infra::metrics::{self, RelayMetrics};
use cdc_relay_bootstrap::shutdown::ShutdownCoordinator;
use cdc_relay_bootstrap::{bootstrap_cli, result_to_exit_code, signals, ValidatedCommand};
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::ports::bus::MessageBusConsumer;
use cdc_relay_domain::ports::cache::{CacheStore, ErrorQueueStore, TrashbinStore};
use cdc_relay_domain::ports::target::TargetPlugin;
use cdc_relay_domain::schema::Dataschema;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match bootstrap_cli() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("CLI error: {e}");
            return ExitCode::from(2);
        }
    };
    let plugin_name = match cli.command {
        ValidatedCommand::Consumer { plugin } => plugin,
        _ => {
            eprintln!("cdc-relay-consumer only runs the `consumer` role");
            return ExitCode::from(2);
        }
    };
    if logging::init(LogFormat::Json, cli.verbose).is_err() {
        eprintln!("failed to install logging subscriber");
    }

    result_to_exit_code(run(cli.config, plugin_name).await)
}

async fn run(config_path: Option<std::path::PathBuf>, plugin_name: String) -> Result<(), RelayError> {
    let config_path = cdc_relay_bootstrap::config::resolve_config_path(config_path)
        .ok_or_else(|| RelayError::config_invalid("no configuration file found (pass --config or place relay.yaml in the working directory)"))?;
    let relay_config = config::load(&config_path)?;

    let dataschema_path = relay_config.dataschema_path.clone();
    let dataschema = load_dataschema(&dataschema_path)?;

    let db = sled::open(relay_config.state_dir.join(&plugin_name))
        .map_err(|e| RelayError::internal_error(format!("failed to open state directory: {e}")))?;
    let store = Arc::new(cdc_relay::infra::cache::SledStateStore::from_db(db.clone()));
    let cache: Arc<dyn CacheStore> = store.clone();
    let error_queue: Arc<dyn ErrorQueueStore> = store.clone();
    let trashbin: Arc<dyn TrashbinStore> = store.clone();

    let bus: Arc<dyn MessageBusConsumer> = match &relay_config.bus {
        BusConfig::Embedded { .. } => {
            let bus_db = sled::open(relay_config.bus_db_path())
                .map_err(|e| RelayError::internal_error(format!("failed to open embedded bus database: {e}")))?;
            Arc::new(cdc_relay::infra::bus::SledBus::open(&bus_db)?)
        }
        BusConfig::Kafka { brokers, topic } => Arc::new(cdc_relay::infra::bus::KafkaBus::new(brokers, topic.clone())?),
    };

    let targets = build_targets(&relay_config)?;

    let applier = ApplierDeps {
        cache,
        error_queue,
        trashbin,
        targets,
        foreignkeys_policy: relay_config.foreignkeys_policy,
        autoremediation_mode: relay_config.autoremediation_mode,
        trashbin_retention_days: relay_config.trashbin_retention_days,
    };

    let deps = ConsumeDeps {
        bus,
        consumer_group: format!("{}::{}", relay_config.consumer_group, plugin_name),
        applier,
        dataschema: RwLock::new(dataschema),
        dataschema_path,
    };

    let shutdown = ShutdownCoordinator::default();
    signals::install(shutdown.clone());

    let metrics = Arc::new(RelayMetrics::new()?);
    let metrics_for_serve = metrics.clone();
    let metrics_addr = relay_config.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr, metrics_for_serve).await {
            tracing::error!(error = %e, "metrics endpoint exited");
        }
    });

    let handler: Arc<dyn ControlHandler> = Arc::new(ConsumerControlHandler { cache: store.clone() });
    let control_socket = relay_config.control_socket_path.clone();
    let control_shutdown = shutdown.token();
    let control_handler = handler.clone();
    tokio::spawn(async move {
        if let Err(e) = control::serve(&control_socket, control_handler, control_shutdown).await {
            tracing::error!(error = %e, "control server exited");
        }
    });

    let replayed = bootstrap_initsync(&deps).await?;
    tracing::info!(replayed, "initsync bootstrap complete");

    let idle_poll_interval = Duration::from_secs(relay_config.cycle_interval_secs);
    let retry_interval = Duration::from_secs(relay_config.error_queue_retry_interval_secs);
    let purge_interval = Duration::from_secs(relay_config.trashbin_purge_interval_secs);
    let retention_days = relay_config.trashbin_retention_days;

    tokio::join!(
        run_apply_loop(&deps, shutdown.token(), idle_poll_interval),
        run_retry_task(&deps, shutdown.token(), retry_interval),
        run_purge_task(&deps, shutdown.token(), purge_interval, retention_days),
    );

    shutdown.wait_for_shutdown().await;
    Ok(())
}

fn load_dataschema(path: &std::path::Path) -> Result<Dataschema, RelayError> {
    let contents = std::fs::read_to_string(path).map_err(RelayError::from)?;
    let schema: Dataschema = serde_yaml::from_str(&contents).map_err(|e| RelayError::schema_incompatible(e.to_string()))?;
    schema.validate()?;
    Ok(schema)
}

fn build_targets(config: &RelayConfig) -> Result<TargetRegistry, RelayError> {
    let mut registry = TargetRegistry::new();
    for (type_name, target) in &config.targets {
        let plugin: Arc<dyn TargetPlugin> = match target {
            TargetConfig::Flatfile { path, key_column } => Arc::new(FlatfileTarget::new(type_name.clone(), path.clone(), key_column.clone())),
            TargetConfig::Ldap { url, bind_dn, bind_password, dn_template } => {
                Arc::new(LdapTarget::new(type_name.clone(), url.clone(), bind_dn.clone(), bind_password.clone(), dn_template.clone()))
            }
        };
        register_for_every_operation(&mut registry, type_name, plugin);
    }
    Ok(registry)
}

struct ConsumerControlHandler {
    cache: Arc<cdc_relay::infra::cache::SledStateStore>,
}

#[async_trait]
impl ControlHandler for ConsumerControlHandler {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Status => ControlResponse::ok("consumer running"),
            ControlRequest::Pause | ControlRequest::Resume => ControlResponse::error("pause/resume is not yet implemented for the consumer role"),
            ControlRequest::Reinit => ControlResponse::error("reinit takes effect automatically on the next schema_update marker"),
            ControlRequest::FlushErrorQueue => match self.cache.heads().await {
                Ok(heads) => ControlResponse::ok(format!("{} queue(s) pending; retry task will drain them on its next wake", heads.len())),
                Err(e) => ControlResponse::error(format!("failed to inspect error queue: {e}")),
            },
            ControlRequest::Inspect { type_name, pkey } => match inspect(&self.cache, &type_name, &pkey).await {
                Ok(message) => ControlResponse::ok(message),
                Err(e) => ControlResponse::error(format!("inspect failed: {e}")),
            },
        }
    }
}

async fn inspect(store: &cdc_relay::infra::cache::SledStateStore, type_name: &str, pkey: &str) -> Result<String, RelayError> {
    let objects = store.snapshot(type_name).await?;
    match objects.into_iter().find(|o| o.pkey.to_string() == pkey) {
        Some(object) => Ok(format!("{type_name}/{pkey}: cached, attrs={:?}", object.attrs)),
        None => Ok(format!("{type_name}/{pkey}: not in cache (check error queue / trashbin via status/flush-errorqueue)")),
    }
}
