// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Structured Logging
//!
//! Initializes a process-wide `tracing` subscriber: JSON output in
//! production, a human-readable compact format otherwise, with the
//! level controlled by `RUST_LOG` (falling back to the verbosity the
//! CLI's repeated `-v` flags select).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Output format for the process's log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for ingestion by a log aggregator.
    Json,
    /// Human-readable, for interactive use.
    Pretty,
}

/// Install the global `tracing` subscriber. Must be called exactly once
/// per process, as early as possible in `main`.
pub fn init(format: LogFormat, verbosity: u8) -> Result<(), cdc_relay_domain::error::RelayError> {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer: Box<dyn Layer<_> + Send + Sync> = match format {
        LogFormat::Json => Box::new(tracing_subscriber::fmt::layer().json().with_target(true)),
        LogFormat::Pretty => Box::new(tracing_subscriber::fmt::layer().compact().with_target(false)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| cdc_relay_domain::error::RelayError::internal_error(format!("failed to install logging subscriber: {e}")))
}
