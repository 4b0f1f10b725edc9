// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Bootstrap Module
//!
//! The bootstrap layer sits **outside** the domain/application/infrastructure
//! layers of `cdc-relay` and owns:
//!
//! - **Entry point** argument parsing and validation ([`cli`])
//! - **Platform abstraction** for OS-specific operations ([`platform`])
//! - **Signal handling** for graceful shutdown ([`signals`])
//! - **Shutdown coordination** with a bounded grace period ([`shutdown`])
//! - **Exit code mapping** from a `RelayError` to a process exit status
//!   ([`exit_code`])
//! - **Bootstrap-phase logging**, before the steady-state `tracing`
//!   subscriber is installed ([`logger`])
//! - **Config path resolution**, before the layered YAML/TOML loader in
//!   `cdc_relay::infra::config` takes over ([`config`])
//!
//! ## Usage
//!
//! ```no_run
//! use cdc_relay_bootstrap::{bootstrap_cli, result_to_exit_code};
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     let validated_cli = match bootstrap_cli() {
//!         Ok(cli) => cli,
//!         Err(e) => {
//!             eprintln!("CLI error: {}", e);
//!             return std::process::ExitCode::from(2);
//!         }
//!     };
//!
//!     let result = run_application(validated_cli).await;
//!     result_to_exit_code(result)
//! }
//!
//! async fn run_application(
//!     _cli: cdc_relay_bootstrap::ValidatedCli,
//! ) -> Result<(), cdc_relay_domain::error::RelayError> {
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod exit_code;
pub mod logger;
pub mod platform;
pub mod shutdown;
pub mod signals;

pub use cli::{parse_and_validate, ValidatedCli, ValidatedCommand, ValidatedCtlCommand};
pub use exit_code::{map_error_to_exit_code, result_to_exit_code, ExitCode};

/// Parse and validate process arguments. Clap handles `--help`/`--version`
/// and exits the process directly.
///
/// # Errors
///
/// Returns [`cli::ParseError`] if parsing or security validation fails.
pub fn bootstrap_cli() -> Result<ValidatedCli, cli::ParseError> {
    cli::parse_and_validate()
}
