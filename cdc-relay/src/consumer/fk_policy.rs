// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Foreign-Key Policy Engine (C13)
//!
//! Gates step 1 of the applier pipeline: whether an event should be
//! deferred because one of its declared foreign keys points at a parent
//! whose own error queue is non-empty. The dependency graph is just
//! `EntityType::foreign_keys`, read fresh from the live schema on every
//! call rather than cached, since C10 may have just evolved it.

use crate::infra::config::ForeignKeyPolicy;
use cdc_relay_domain::error::RelayError;
use cdc_relay_domain::events::{ChangeEvent, Operation};
use cdc_relay_domain::ports::cache::ErrorQueueStore;
use cdc_relay_domain::schema::Dataschema;

/// `Some(reason)` if `event` should be blocked under `policy`, else
/// `None`.
pub async fn should_block(
    policy: ForeignKeyPolicy,
    schema: &Dataschema,
    error_queue: &dyn ErrorQueueStore,
    event: &ChangeEvent,
) -> Result<Option<String>, RelayError> {
    if policy == ForeignKeyPolicy::Disabled {
        return Ok(None);
    }
    if policy == ForeignKeyPolicy::OnRemoveEvent && event.op != Operation::Removed {
        return Ok(None);
    }

    let Some(entity) = schema.type_named(&event.type_name) else {
        return Ok(None);
    };

    for (attr, fkey) in &entity.foreign_keys {
        let Some(parent_pkey) = event.fkeys.get(attr) else {
            continue;
        };
        let depth = error_queue.queue_len(&fkey.parent_type, parent_pkey).await?;
        if depth > 0 {
            return Ok(Some(format!(
                "blocked by {depth} pending error(s) on parent {}/{}",
                fkey.parent_type, parent_pkey
            )));
        }
    }

    Ok(None)
}
