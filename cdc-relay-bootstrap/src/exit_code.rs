// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Process Exit Codes
//!
//! Maps the outcome of a producer/consumer/control run to the three exit
//! codes the control surface promises: `0` success, `1` transient
//! (retryable) failure, `2` fatal (non-retryable) failure.

use cdc_relay_domain::error::RelayError;
use std::process::ExitCode as StdExitCode;

/// Process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    Transient,
    Fatal,
}

impl From<ExitCode> for StdExitCode {
    fn from(code: ExitCode) -> Self {
        match code {
            ExitCode::Success => StdExitCode::from(0),
            ExitCode::Transient => StdExitCode::from(1),
            ExitCode::Fatal => StdExitCode::from(2),
        }
    }
}

/// Classify a `RelayError` into an exit code.
pub fn map_error_to_exit_code(error: &RelayError) -> ExitCode {
    if error.is_recoverable() {
        ExitCode::Transient
    } else {
        ExitCode::Fatal
    }
}

/// Convert a top-level `Result` into the process's exit code.
pub fn result_to_exit_code(result: Result<(), RelayError>) -> StdExitCode {
    match result {
        Ok(()) => ExitCode::Success.into(),
        Err(e) => {
            tracing::error!(error = %e, category = e.category(), "process exiting with error");
            map_error_to_exit_code(&e).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_map_to_transient() {
        let err = RelayError::source_unavailable("sql-primary");
        assert_eq!(map_error_to_exit_code(&err), ExitCode::Transient);
    }

    #[test]
    fn non_recoverable_errors_map_to_fatal() {
        let err = RelayError::config_invalid("missing dataschema file");
        assert_eq!(map_error_to_exit_code(&err), ExitCode::Fatal);
    }
}
