// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Producer process composition root: load configuration, open durable
//! state, build the configured datasources and bus, and run the
//! fetch/merge/integrity/diff/publish cycle (§4.5/§4.6, §5) until a
//! termination signal arrives.

use async_trait::async_trait;
use cdc_relay::control::{self, ControlHandler, ControlRequest, ControlResponse};
use cdc_relay::infra::config::{self, BusConfig, DatasourceConfig, RelayConfig};
use cdc_relay::infra::datasource::{FlatfileDriver, LdapDriver, SqlDriver};
use cdc_relay::infra::logging::{self, LogFormat};
use cdc_relay::infra::metrics::{self, RelayMetrics};
use cdc_relay::producer::cycle::{DatasourceRegistry, ProducerDeps};
use cdc_relay::producer::{self, ProducerState};
use cdc_relay_bootstrap::shutdown::ShutdownCoordinator;
use cdc_relay_bootstrap::{bootstrap_cli, result_to_exit_code, signals, ValidatedCommand};
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::ports::bus::MessageBusProducer;
use cdc_relay_domain::ports::datasource::DatasourceDriver;
use cdc_relay_domain::schema::Dataschema;
use std::process::ExitCode;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match bootstrap_cli() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("CLI error: {e}");
            return ExitCode::from(2);
        }
    };
    if !matches!(cli.command, ValidatedCommand::Producer) {
        eprintln!("cdc-relay-producer only runs the `producer` role");
        return ExitCode::from(2);
    }
    if logging::init(LogFormat::Json, cli.verbose).is_err() {
        eprintln!("failed to install logging subscriber");
    }

    result_to_exit_code(run(cli.config).await)
}

async fn run(config_path: Option<std::path::PathBuf>) -> Result<(), RelayError> {
    let config_path = cdc_relay_bootstrap::config::resolve_config_path(config_path)
        .ok_or_else(|| RelayError::config_invalid("no configuration file found (pass --config or place relay.yaml in the working directory)"))?;
    let relay_config = config::load(&config_path)?;

    let dataschema = load_dataschema(&relay_config)?;
    let db = sled::open(&relay_config.state_dir).map_err(|e| RelayError::internal_error(format!("failed to open state directory: {e}")))?;
    let cache = Arc::new(cdc_relay::infra::cache::SledStateStore::from_db(db.clone()));
    let state = ProducerState::open(&db)?;

    let datasources = build_datasources(&relay_config).await?;
    let bus: Arc<dyn MessageBusProducer> = match &relay_config.bus {
        BusConfig::Embedded { .. } => {
            let bus_db = sled::open(relay_config.bus_db_path())
                .map_err(|e| RelayError::internal_error(format!("failed to open embedded bus database: {e}")))?;
            Arc::new(cdc_relay::infra::bus::SledBus::open(&bus_db)?)
        }
        BusConfig::Kafka { brokers, topic } => Arc::new(cdc_relay::infra::bus::KafkaBus::new(brokers, topic.clone())?),
    };

    let deps = ProducerDeps {
        dataschema,
        datasources,
        cache,
        bus,
    };
    let step_counter = AtomicU64::new(0);

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

    let handler: Arc<dyn ControlHandler> = Arc::new(ProducerControlHandler {
        last_summary: StdMutex::new(None),
    });
    let control_socket = relay_config.control_socket_path.clone();
    let control_shutdown = shutdown.token();
    let control_handler = handler.clone();
    tokio::spawn(async move {
        if let Err(e) = control::serve(&control_socket, control_handler, control_shutdown).await {
            tracing::error!(error = %e, "control server exited");
        }
    });

    let alert_sender = relay_config
        .alerting
        .as_ref()
        .map(|cfg| cdc_relay::alerting::AlertSender::new(cfg.clone()))
        .transpose()?
        .map(Arc::new);

    let cycle_interval = Duration::from_secs(relay_config.cycle_interval_secs);
    producer::run_loop(&deps, &state, &step_counter, shutdown.token(), cycle_interval, |result| {
        match result {
            Ok(summary) => {
                metrics.events_published.with_label_values(&["*", "*"]).inc_by(summary.published as u64);
                if let Some(sender) = &alert_sender {
                    if !summary.merge_diagnostics.is_empty() || !summary.integrity_diagnostics.is_empty() {
                        let sender = sender.clone();
                        let body_lines: Vec<String> = summary
                            .merge_diagnostics
                            .iter()
                            .map(|d| format!("merge: {d:?}"))
                            .chain(summary.integrity_diagnostics.iter().map(|d| format!("integrity: {d:?}")))
                            .collect();
                        tokio::task::spawn_blocking(move || {
                            let summary = cdc_relay::alerting::AlertSummary {
                                subject: "cdc-relay: cycle diagnostics".to_string(),
                                body_lines,
                                detail: None,
                            };
                            if let Err(e) = sender.send(&summary) {
                                tracing::warn!(error = %e, "failed to send cycle alert");
                            }
                        });
                    }
                }
            }
            Err(_) => {
                metrics.apply_failures.with_label_values(&["*", "cycle"]).inc();
            }
        }
    })
    .await;

    shutdown.wait_for_shutdown().await;
    Ok(())
}

fn load_dataschema(config: &RelayConfig) -> Result<Dataschema, RelayError> {
    let contents = std::fs::read_to_string(&config.dataschema_path).map_err(RelayError::from)?;
    let schema: Dataschema = serde_yaml::from_str(&contents).map_err(|e| RelayError::schema_incompatible(e.to_string()))?;
    schema.validate()?;
    Ok(schema)
}

async fn build_datasources(config: &RelayConfig) -> Result<DatasourceRegistry, RelayError> {
    let mut registry: DatasourceRegistry = DatasourceRegistry::new();
    for (name, datasource) in &config.datasources {
        let driver: Arc<dyn DatasourceDriver> = match datasource {
            DatasourceConfig::Sql { connection_string, max_connections } => {
                Arc::new(SqlDriver::connect(name.clone(), connection_string, *max_connections).await?)
            }
            DatasourceConfig::Flatfile { path, key_column } => Arc::new(FlatfileDriver::new(name.clone(), path.clone(), key_column.clone())),
            DatasourceConfig::Ldap { url, bind_dn, bind_password, base_dn } => {
                Arc::new(LdapDriver::new(name.clone(), url.clone(), bind_dn.clone(), bind_password.clone(), base_dn.clone()))
            }
        };
        registry.insert(name.clone(), driver);
    }
    Ok(registry)
}

struct ProducerControlHandler {
    last_summary: StdMutex<Option<String>>,
}

#[async_trait]
impl ControlHandler for ProducerControlHandler {
    async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Status => {
                let last = self.last_summary.lock().unwrap().clone();
                ControlResponse::ok(last.unwrap_or_else(|| "producer running, no cycle completed yet".to_string()))
            }
            ControlRequest::Pause | ControlRequest::Resume => ControlResponse::error("pause/resume is not yet implemented for the producer role"),
            ControlRequest::Reinit => ControlResponse::error("reinit takes effect automatically on the next dataschema revision change"),
            ControlRequest::FlushErrorQueue => ControlResponse::error("the producer has no error queue; target the consumer process instead"),
            ControlRequest::Inspect { .. } => ControlResponse::error("inspect targets a consumer's cache; target the consumer process instead"),
        }
    }
}
