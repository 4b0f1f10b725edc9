// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Target Plugin Port (C11)
//!
//! A `TargetPlugin` is resolved by `(type, operation)` from a registry
//! populated at consumer startup and is the only place a consumer writes
//! to its downstream system. Reference implementations (flatfile, LDAP)
//! live in `cdc_relay::infra::target`; any third party may implement
//! this trait for their own system without touching the consumer loop.

use crate::error::RelayError;
use crate::events::ChangeEvent;
use async_trait::async_trait;

/// Flags threaded through one apply attempt (§4.9 step 3). A handler
/// that performs more than one non-idempotent mutation against its
/// target raises `is_partially_processed` after the first one, so a
/// later failure in the same attempt is known to have left the target
/// in a partially-applied state — the boundary C12's autoremediation
/// refuses to coalesce across.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyContext {
    /// `true` when this invocation was re-dequeued from the error queue
    /// rather than delivered fresh off the bus.
    pub is_an_error_retry: bool,
    /// Raised by the handler itself once it has performed a mutation it
    /// cannot cleanly retry from scratch.
    pub is_partially_processed: bool,
}

impl ApplyContext {
    pub fn new(is_an_error_retry: bool) -> Self {
        Self {
            is_an_error_retry,
            is_partially_processed: false,
        }
    }

    pub fn mark_partially_processed(&mut self) {
        self.is_partially_processed = true;
    }
}

/// Applies one `ChangeEvent` to a downstream system.
#[async_trait]
pub trait TargetPlugin: Send + Sync {
    /// Apply `event` to this target. `ctx` carries `is_an_error_retry` in
    /// and `is_partially_processed` out.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ApplyRetryable`] for conditions the error
    /// queue should retry (the target was briefly unreachable) and
    /// [`RelayError::ApplyFatal`] for conditions it should not
    /// (the event is malformed for this target's schema).
    async fn apply(&self, event: &ChangeEvent, ctx: &mut ApplyContext) -> Result<(), RelayError>;

    /// Name used to resolve this plugin from consumer configuration and
    /// in diagnostics.
    fn name(&self) -> &str;
}
