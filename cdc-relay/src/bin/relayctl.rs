// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! `cdc-relayctl`: sends one [`ControlRequest`] to a running producer or
//! consumer process over its UNIX control socket and prints the reply.
//! The socket path comes from the same relay configuration file the
//! target process was started with.

use cdc_relay::control::{send_command, ControlRequest};
use cdc_relay::infra::config;
use cdc_relay_bootstrap::{bootstrap_cli, result_to_exit_code, ValidatedCommand, ValidatedCtlCommand};
use cdc_relay_domain::error::RelayError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match bootstrap_cli() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("CLI error: {e}");
            return ExitCode::from(2);
        }
    };
    let command = match cli.command {
        ValidatedCommand::Ctl(command) => command,
        _ => {
            eprintln!("cdc-relayctl only runs `ctl` subcommands");
            return ExitCode::from(2);
        }
    };

    result_to_exit_code(run(cli.config, command).await)
}

async fn run(config_path: Option<std::path::PathBuf>, command: ValidatedCtlCommand) -> Result<(), RelayError> {
    let config_path = cdc_relay_bootstrap::config::resolve_config_path(config_path)
        .ok_or_else(|| RelayError::config_invalid("no configuration file found (pass --config or place relay.yaml in the working directory)"))?;
    let relay_config = config::load(&config_path)?;

    let request = match command {
        ValidatedCtlCommand::Status => ControlRequest::Status,
        ValidatedCtlCommand::Pause => ControlRequest::Pause,
        ValidatedCtlCommand::Resume => ControlRequest::Resume,
        ValidatedCtlCommand::Reinit => ControlRequest::Reinit,
        ValidatedCtlCommand::FlushErrorQueue => ControlRequest::FlushErrorQueue,
        ValidatedCtlCommand::Inspect { type_name, pkey } => ControlRequest::Inspect { type_name, pkey },
    };

    let response = send_command(&relay_config.control_socket_path, request).await?;
    println!("{}", response.message);
    if response.ok {
        Ok(())
    } else {
        Err(RelayError::internal_error(response.message))
    }
}
