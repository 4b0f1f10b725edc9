// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Producer-side orchestration (C5-C9, §4): fetch, merge, integrity,
//! diff, publish, and commit hooks, run once per cycle by
//! [`cycle::run_cycle`]; [`run_loop`] wraps that with the bus control
//! markers (C9) a fresh consumer's [`crate::consumer::bootstrap_initsync`]
//! depends on and ticks it on a fixed interval.

pub mod cycle;

use crate::producer::cycle::{run_cycle, CycleSummary, ProducerDeps};
use cdc_relay_bootstrap::shutdown::CancellationToken;
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation, StepCounter};
use cdc_relay_domain::ports::bus::MessageBusProducer;
use cdc_relay_domain::schema::SchemaRevision;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

const PRODUCER_STATE_TREE: &str = "_producer_state";
const LAST_SCHEMA_REVISION_KEY: &[u8] = b"last_schema_revision";
const FIRST_CYCLE_DONE_KEY: &[u8] = b"first_cycle_done";

/// Small bookkeeping kept alongside the producer cache: the schema
/// revision last announced with a `schema_update` marker, and whether
/// the producer has ever completed a first cycle, so a restart does not
/// re-bracket the whole dataset with another `initsync_begin`/
/// `initsync_end` pair every time the process comes back up.
pub struct ProducerState {
    tree: sled::Tree,
}

impl ProducerState {
    pub fn open(db: &sled::Db) -> Result<Self, RelayError> {
        let tree = db
            .open_tree(PRODUCER_STATE_TREE)
            .map_err(|e| RelayError::internal_error(format!("failed to open producer state tree: {e}")))?;
        Ok(Self { tree })
    }

    fn last_schema_revision(&self) -> Result<Option<SchemaRevision>, RelayError> {
        match self.tree.get(LAST_SCHEMA_REVISION_KEY).map_err(|e| RelayError::IoError(e.to_string()))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| RelayError::SerializationError(e.to_string()))?)),
        }
    }

    fn store_schema_revision(&self, revision: SchemaRevision) -> Result<(), RelayError> {
        let encoded = serde_json::to_vec(&revision).map_err(|e| RelayError::SerializationError(e.to_string()))?;
        self.tree.insert(LAST_SCHEMA_REVISION_KEY, encoded).map_err(|e| RelayError::IoError(e.to_string()))?;
        Ok(())
    }

    fn first_cycle_done(&self) -> Result<bool, RelayError> {
        Ok(self.tree.get(FIRST_CYCLE_DONE_KEY).map_err(|e| RelayError::IoError(e.to_string()))?.is_some())
    }

    fn mark_first_cycle_done(&self) -> Result<(), RelayError> {
        self.tree.insert(FIRST_CYCLE_DONE_KEY, b"1".as_slice()).map_err(|e| RelayError::IoError(e.to_string()))?;
        Ok(())
    }
}

/// Run one cycle, bracketed by whatever bus control markers the
/// producer's persisted state says are due: `schema_update` when
/// `deps.dataschema.revision` differs from the last one announced, and
/// `initsync_begin`/`initsync_end` around the very first cycle this
/// state directory has ever run (C9, C15).
pub async fn run_cycle_with_markers(deps: &ProducerDeps, state: &ProducerState, step_counter: &AtomicU64) -> Result<CycleSummary, RelayError> {
    if state.last_schema_revision()? != Some(deps.dataschema.revision) {
        let step = StepCounter(step_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
        let marker = ChangeEvent::marker(Operation::SchemaUpdate, deps.dataschema.revision, step);
        deps.bus.publish(&marker).await?;
        state.store_schema_revision(deps.dataschema.revision)?;
    }

    let is_first_cycle = !state.first_cycle_done()?;
    if is_first_cycle {
        let step = StepCounter(step_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
        let marker = ChangeEvent::marker(Operation::InitsyncBegin, deps.dataschema.revision, step);
        deps.bus.publish(&marker).await?;
    }

    let summary = run_cycle(deps, step_counter).await?;

    if is_first_cycle {
        let step = StepCounter(step_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
        let marker = ChangeEvent::marker(Operation::InitsyncEnd, deps.dataschema.revision, step);
        deps.bus.publish(&marker).await?;
        state.mark_first_cycle_done()?;
    }

    Ok(summary)
}

/// Tick [`run_cycle_with_markers`] on `cycle_interval` until `shutdown`
/// is cancelled. `on_summary` is called after every cycle (successful or
/// not) so the caller can update metrics and compose the per-cycle mail
/// alert (§7) without this loop depending on either directly.
pub async fn run_loop<F>(
    deps: &ProducerDeps,
    state: &ProducerState,
    step_counter: &AtomicU64,
    shutdown: CancellationToken,
    cycle_interval: Duration,
    mut on_summary: F,
) where
    F: FnMut(Result<&CycleSummary, &RelayError>),
{
    loop {
        let result = run_cycle_with_markers(deps, state, step_counter).await;
        on_summary(result.as_ref());
        if let Err(err) = &result {
            tracing::error!(error = %err, "producer cycle failed");
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(cycle_interval) => {}
        }
    }
}
