// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Consumer Dataschema Evolver (C10)
//!
//! Brings a consumer's own cache, error queue, and trashbin in line with
//! an [`EvolutionPlan`] before the consume loop resumes processing
//! events against the new dataschema revision. Every step here is local
//! bookkeeping: nothing is emitted back to the bus, since a schema
//! change is announced once by the producer's `schema_update` marker
//! and every consumer evolves independently from that same plan.

use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::ports::cache::{CacheStore, ErrorQueueStore, TrashbinStore};
use cdc_relay_domain::schema::{EvolutionPlan, PrimaryKeySpec};
use cdc_relay_domain::value::PrimaryKeyValue;
use std::sync::Arc;

/// Stores one evolver pass reads and writes. Distinct from
/// [`crate::consumer::applier::ApplierDeps`] — schema evolution never
/// touches a target plugin.
pub struct EvolverDeps {
    pub cache: Arc<dyn CacheStore>,
    pub error_queue: Arc<dyn ErrorQueueStore>,
    pub trashbin: Arc<dyn TrashbinStore>,
}

/// Apply every step of `plan` to `deps`'s stores. Runs to completion
/// before the caller resumes delivering events from the bus.
pub async fn evolve(deps: &EvolverDeps, plan: &EvolutionPlan) -> Result<(), RelayError> {
    for type_name in &plan.removed_types {
        drop_type(deps, type_name).await?;
    }

    for (type_name, removed_attrs) in &plan.attributes_removed {
        drop_attributes(deps, type_name, removed_attrs).await?;
    }

    // `added_types`/`attributes_added` need no action here: a type or
    // attribute absent from the cache is simply absent until the next
    // `added`/`modified` event for it arrives and populates it.

    for (type_name, (_old, new_spec)) in &plan.renamed_primary_keys {
        rekey_type(deps, type_name, new_spec).await?;
    }

    Ok(())
}

/// Drop every cached object, queued error-queue event, and staged
/// trashbin entry belonging to a removed type.
async fn drop_type(deps: &EvolverDeps, type_name: &str) -> Result<(), RelayError> {
    deps.cache.clear_type(type_name).await?;

    for (head_type, pkey, _) in deps.error_queue.heads().await? {
        if head_type == type_name {
            deps.error_queue.replace_queue(type_name, &pkey, Vec::new()).await?;
        }
    }

    // `TrashbinStore` has no "list everything of a type" operation, so
    // `expired()` is reused with a cutoff past any real timestamp to
    // enumerate the full set of staged entries for this type.
    for entry in deps.trashbin.expired(type_name, chrono::NaiveDateTime::MAX).await? {
        deps.trashbin.remove(type_name, &entry.object.remote_pkey).await?;
    }

    Ok(())
}

/// Strip attributes dropped from a surviving type out of every cached
/// object and every queued event still referencing them, so a stale
/// value never leaks into a later diff or retry.
async fn drop_attributes(deps: &EvolverDeps, type_name: &str, removed: &[String]) -> Result<(), RelayError> {
    for mut object in deps.cache.snapshot(type_name).await? {
        let mut changed = false;
        for attr in removed {
            changed |= object.attrs.remove(attr).is_some();
        }
        if changed {
            deps.cache.put(type_name, &object).await?;
        }
    }

    for (head_type, pkey, _) in deps.error_queue.heads().await? {
        if head_type != type_name {
            continue;
        }
        let mut queue = deps.error_queue.queue_snapshot(type_name, &pkey).await?;
        let mut changed = false;
        for queued in &mut queue {
            for attr in removed {
                changed |= queued.event.attrs.remove(attr).is_some();
            }
        }
        if changed {
            deps.error_queue.replace_queue(type_name, &pkey, queue).await?;
        }
    }

    Ok(())
}

/// Recompute every cached object's local primary key from the renamed
/// `PrimaryKeySpec`, matched by `remote_pkey` — the identity that
/// survives a rename — rather than by the old local key.
async fn rekey_type(deps: &EvolverDeps, type_name: &str, new_spec: &PrimaryKeySpec) -> Result<(), RelayError> {
    for mut object in deps.cache.snapshot(type_name).await? {
        let names = new_spec.attribute_names();
        let values: Option<Vec<_>> = names.iter().map(|n| object.attrs.get(*n).cloned()).collect();
        let Some(values) = values else {
            // The renamed key references an attribute this object has
            // never carried; leave its local pkey as-is until a fresh
            // event supplies it.
            continue;
        };
        object.pkey = match new_spec {
            PrimaryKeySpec::Simple(_) => PrimaryKeyValue::Simple(values.into_iter().next().expect("exactly one attribute name")),
            PrimaryKeySpec::Composite(_) => PrimaryKeyValue::Composite(values),
        };
        deps.cache.put(type_name, &object).await?;
    }
    Ok(())
}
