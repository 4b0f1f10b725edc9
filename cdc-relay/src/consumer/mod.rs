// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Consumer-side orchestration (C9-C15, §5): subscribe, apply, retry,
//! and purge, run as three independent long-lived tasks sharing one
//! [`ConsumeDeps`]. [`bootstrap_initsync`] brings a fresh consumer's
//! state up to the producer's most recent full resync before
//! [`run_apply_loop`] ever sees a live event; [`run_retry_task`] and
//! [`run_purge_task`] wake on their own intervals independently of the
//! apply loop's pace.

pub mod applier;
pub mod error_queue;
pub mod evolver;
pub mod fk_policy;
pub mod initsync;
#[cfg(test)]
pub mod test_support;
pub mod trashbin;

use crate::consumer::applier::{apply_event, ApplierDeps, ApplyOutcome};
use crate::consumer::evolver::{evolve, EvolverDeps};
use cdc_relay_bootstrap::shutdown::CancellationToken;
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::Operation;
use cdc_relay_domain::ports::bus::MessageBusConsumer;
use cdc_relay_domain::ports::target::TargetPlugin;
use cdc_relay_domain::schema::Dataschema;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Everything the three consumer tasks share: the bus handle they all
/// poll or commit against, the dataschema under a lock a `schema_update`
/// marker swaps out from under the apply loop, and the stores/targets
/// [`ApplierDeps`] already bundles.
pub struct ConsumeDeps {
    pub bus: Arc<dyn MessageBusConsumer>,
    pub consumer_group: String,
    pub applier: ApplierDeps,
    pub dataschema: RwLock<Dataschema>,
    pub dataschema_path: PathBuf,
}

impl ConsumeDeps {
    fn evolver_deps(&self) -> EvolverDeps {
        EvolverDeps {
            cache: self.applier.cache.clone(),
            error_queue: self.applier.error_queue.clone(),
            trashbin: self.applier.trashbin.clone(),
        }
    }
}

fn load_dataschema(path: &std::path::Path) -> Result<Dataschema, RelayError> {
    let contents = std::fs::read_to_string(path).map_err(RelayError::from)?;
    let schema: Dataschema = serde_yaml::from_str(&contents).map_err(|e| RelayError::schema_incompatible(e.to_string()))?;
    schema.validate()?;
    Ok(schema)
}

/// Reload the dataschema file, evolve every store from the diff against
/// the schema the consumer was running with, and swap the new schema
/// in. Called once per observed `schema_update` marker (C10).
async fn handle_schema_update(deps: &ConsumeDeps) -> Result<(), RelayError> {
    let fresh = load_dataschema(&deps.dataschema_path)?;
    let plan = {
        let current = deps.dataschema.read().await;
        fresh.diff(&current)
    };
    if !plan.is_empty() {
        evolve(&deps.evolver_deps(), &plan).await?;
    }
    *deps.dataschema.write().await = fresh;
    Ok(())
}

/// Locate the producer's most recent complete initsync bracket and
/// replay it through the apply pipeline before the caller joins the
/// steady-state loop. A brand-new deployment whose producer has not
/// completed a first cycle yet has no bracket to find; the caller joins
/// the steady loop directly and catches up as ordinary events arrive.
pub async fn bootstrap_initsync(deps: &ConsumeDeps) -> Result<usize, RelayError> {
    let Some(window) = initsync::locate_window(deps.bus.as_ref(), &deps.consumer_group).await? else {
        tracing::info!(consumer_group = %deps.consumer_group, "no initsync bracket found; joining live stream");
        return Ok(0);
    };
    tracing::info!(consumer_group = %deps.consumer_group, begin = window.begin_offset, end = window.end_offset, "replaying initsync window");

    let mut applied = Vec::new();
    initsync::replay_window(deps.bus.as_ref(), &deps.consumer_group, window, |event| {
        applied.push(event);
        Ok(())
    })
    .await?;

    let mut count = 0;
    for event in applied {
        if event.op.is_object_change() {
            let now = chrono::Utc::now().naive_utc();
            let schema = deps.dataschema.read().await;
            apply_event(&deps.applier, &schema, &event, false, now).await?;
            count += 1;
        }
    }
    Ok(count)
}

/// Poll the bus for one event, dispatching control markers to
/// `handle_schema_update` and object changes to [`apply_event`], then
/// commit the bus offset. Runs until `shutdown` is cancelled, sleeping
/// `idle_poll_interval` whenever the bus has nothing new.
pub async fn run_apply_loop(deps: &ConsumeDeps, shutdown: CancellationToken, idle_poll_interval: Duration) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let polled = tokio::select! {
            _ = shutdown.cancelled() => return,
            polled = deps.bus.poll(&deps.consumer_group) => polled,
        };

        let (offset, event) = match polled {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(idle_poll_interval) => continue,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "bus poll failed; retrying after idle interval");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(idle_poll_interval) => continue,
                }
            }
        };

        if !event.op.is_object_change() {
            if event.op == Operation::SchemaUpdate {
                if let Err(err) = handle_schema_update(deps).await {
                    tracing::error!(error = %err, "schema evolution failed; leaving offset uncommitted for retry");
                    continue;
                }
            }
            if let Err(err) = deps.bus.commit(&deps.consumer_group, offset).await {
                tracing::error!(error = %err, "failed to commit control marker offset");
            }
            continue;
        }

        let now = chrono::Utc::now().naive_utc();
        let outcome = {
            let schema = deps.dataschema.read().await;
            apply_event(&deps.applier, &schema, &event, false, now).await
        };
        match outcome {
            Ok(outcome) => {
                tracing::debug!(type_name = %event.type_name, pkey = %event.pkey, outcome = ?outcome, "applied event");
                if let Err(err) = deps.bus.commit(&deps.consumer_group, offset).await {
                    tracing::error!(error = %err, "failed to commit applied event offset");
                }
            }
            Err(err) => {
                tracing::error!(error = %err, type_name = %event.type_name, "apply pipeline failed; leaving offset uncommitted for retry");
            }
        }
    }
}

/// Re-drive the FIFO head of every `(type, pkey)` error queue on a fixed
/// interval (C12), stopping as soon as `shutdown` is cancelled.
pub async fn run_retry_task(deps: &ConsumeDeps, shutdown: CancellationToken, retry_interval: Duration) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry_interval) => {}
        }

        let heads = match deps.applier.error_queue.heads().await {
            Ok(heads) => heads,
            Err(err) => {
                tracing::error!(error = %err, "failed to list error queue heads");
                continue;
            }
        };

        for (type_name, pkey, queued) in heads {
            let now = chrono::Utc::now().naive_utc();
            let outcome = {
                let schema = deps.dataschema.read().await;
                apply_event(&deps.applier, &schema, &queued.event, true, now).await
            };
            match outcome {
                Ok(ApplyOutcome::Applied | ApplyOutcome::Idempotent | ApplyOutcome::RestoredFromTrashbin | ApplyOutcome::TrashbinStaged) => {
                    tracing::info!(%type_name, %pkey, "error queue retry succeeded");
                }
                Ok(ApplyOutcome::Blocked { reason }) | Ok(ApplyOutcome::Queued { reason }) => {
                    tracing::debug!(%type_name, %pkey, reason, "error queue retry still blocked");
                }
                Err(err) => {
                    tracing::error!(error = %err, %type_name, %pkey, "error queue retry failed");
                }
            }
        }
    }
}

/// Purge every type's expired trashbin entries on a fixed interval
/// (C14), routing each type's physical delete through whatever target
/// plugin is registered for its `removed` operation.
pub async fn run_purge_task(deps: &ConsumeDeps, shutdown: CancellationToken, purge_interval: Duration, retention_days: i64) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(purge_interval) => {}
        }

        let type_names: Vec<String> = {
            let schema = deps.dataschema.read().await;
            schema.types.iter().map(|t| t.name.clone()).collect()
        };

        for type_name in type_names {
            let Some(plugin) = deps.applier.targets.get(&(type_name.clone(), Operation::Removed)) else {
                continue;
            };
            let now = chrono::Utc::now().naive_utc();
            match trashbin::purge_expired(deps.applier.trashbin.as_ref(), plugin.as_ref() as &dyn TargetPlugin, &type_name, retention_days, now).await {
                Ok(purged) if purged > 0 => tracing::info!(%type_name, purged, "purged expired trashbin entries"),
                Ok(_) => {}
                Err(err) => tracing::error!(error = %err, %type_name, "trashbin purge failed"),
            }
        }
    }
}
