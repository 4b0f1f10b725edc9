// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Domain Error Taxonomy
//!
//! `RelayError` is the single error type that crosses every port boundary
//! in the domain crate. Each variant maps to one of the ten failure
//! categories a producer or consumer cycle can hit; [`RelayError::category`]
//! and [`RelayError::is_recoverable`] let the bootstrap layer and the
//! control surface classify a failure without matching on variants
//! directly.

use thiserror::Error;

/// Errors surfaced by the relay's domain and application layers.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// The dataschema or a layered config file failed validation at load
    /// time (unknown keys, forward-referencing merge constraint, malformed
    /// expression, missing required field).
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A datasource driver could not be reached or exhausted its retry
    /// budget for this cycle.
    #[error("datasource unavailable: {0}")]
    SourceUnavailable(String),

    /// An attribute projection (template render or filter) failed for a
    /// row; the row is skipped for this cycle, not fatal.
    #[error("projection failed: {0}")]
    ProjectionError(String),

    /// A per-type merge constraint rejected a row, or the pkey-merge
    /// constraint could not reconcile two sources' rows.
    #[error("merge constraint violated: {0}")]
    MergeConstraintViolated(String),

    /// An integrity constraint rejected a row during evaluation (C6).
    #[error("integrity constraint violated: {0}")]
    IntegrityViolated(String),

    /// The message bus (embedded or broker-backed) could not accept or
    /// deliver an event.
    #[error("message bus unavailable: {0}")]
    BusUnavailable(String),

    /// A consumer's attempt to apply an event to its target failed in a
    /// way judged retryable (the event is queued to the error queue).
    #[error("apply failed, will retry: {0}")]
    ApplyRetryable(String),

    /// A consumer's attempt to apply an event failed in a way judged
    /// non-retryable (the event is queued to the error queue but will not
    /// be retried automatically).
    #[error("apply failed, fatal: {0}")]
    ApplyFatal(String),

    /// The dataschema revision on an incoming event does not match any
    /// revision the consumer knows how to evolve from.
    #[error("schema incompatible: {0}")]
    SchemaIncompatible(String),

    /// The trashbin purge sweep failed to remove an expired entry from
    /// its target.
    #[error("trashbin expiry failed: {0}")]
    TrashbinExpiryFailure(String),

    /// I/O error not otherwise classified above.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Serialization/deserialization error not otherwise classified above.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Catch-all for invariant violations that indicate a bug rather than
    /// an operational condition.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl RelayError {
    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn projection_error(msg: impl Into<String>) -> Self {
        Self::ProjectionError(msg.into())
    }

    pub fn merge_constraint_violated(msg: impl Into<String>) -> Self {
        Self::MergeConstraintViolated(msg.into())
    }

    pub fn integrity_violated(msg: impl Into<String>) -> Self {
        Self::IntegrityViolated(msg.into())
    }

    pub fn bus_unavailable(msg: impl Into<String>) -> Self {
        Self::BusUnavailable(msg.into())
    }

    pub fn apply_retryable(msg: impl Into<String>) -> Self {
        Self::ApplyRetryable(msg.into())
    }

    pub fn apply_fatal(msg: impl Into<String>) -> Self {
        Self::ApplyFatal(msg.into())
    }

    pub fn schema_incompatible(msg: impl Into<String>) -> Self {
        Self::SchemaIncompatible(msg.into())
    }

    pub fn trashbin_expiry_failure(msg: impl Into<String>) -> Self {
        Self::TrashbinExpiryFailure(msg.into())
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }

    /// Whether a caller should retry the operation that produced this
    /// error (transient exit code 1) versus giving up (fatal exit code 2).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::BusUnavailable(_) | Self::ApplyRetryable(_) | Self::IoError(_)
        )
    }

    /// Stable machine-readable category tag, used in log fields and the
    /// `ctl status`/mail-alert summaries.
    pub fn category(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "config_invalid",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::ProjectionError(_) => "projection_error",
            Self::MergeConstraintViolated(_) => "merge_constraint_violated",
            Self::IntegrityViolated(_) => "integrity_violated",
            Self::BusUnavailable(_) => "bus_unavailable",
            Self::ApplyRetryable(_) => "apply_retryable",
            Self::ApplyFatal(_) => "apply_fatal",
            Self::SchemaIncompatible(_) => "schema_incompatible",
            Self::TrashbinExpiryFailure(_) => "trashbin_expiry_failure",
            Self::IoError(_) => "io_error",
            Self::SerializationError(_) => "serialization_error",
            Self::InternalError(_) => "internal_error",
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

// `toml`/`serde_yaml` conversions deliberately live in `cdc_relay::infra::config`,
// not here: choosing a serialization format is an infrastructure concern.
