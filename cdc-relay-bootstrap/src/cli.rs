// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Command-Line Interface Module
//!
//! Bootstrap-layer CLI handling with security-first argument validation.
//!
//! Collapses parsing (clap) and validation into one module: the process
//! role (producer / consumer / control client) is parsed with clap, then
//! every path and free-form string argument is run through
//! [`SecureArgParser`] before the caller ever sees it.
//!
//! ## Security Features
//!
//! - Length limits on arguments and paths
//! - Dangerous-pattern detection (path traversal, shell metacharacters)
//! - Canonical path resolution
//! - Protected system directory rejection
//!
//! ## Dangerous Patterns Detected
//!
//! `..`, `~`, `$`, backticks, `;`, `&`, `|`, `>`, `<`, null bytes,
//! newlines, carriage returns.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAX_ARG_COUNT: usize = 100;
const MAX_ARG_LENGTH: usize = 1000;
const MAX_PATH_LENGTH: usize = 4096;

const DANGEROUS_PATTERNS: &[&str] = &[
    "..", "~", "$", "`", ";", "&", "|", ">", "<", "\n", "\r", "\0",
];

const PROTECTED_DIRS: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// Secure argument parsing errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Too many arguments (max {MAX_ARG_COUNT})")]
    TooManyArguments,

    #[error("Argument too long (max {MAX_ARG_LENGTH} characters): {0}")]
    ArgumentTooLong(String),

    #[error("Dangerous pattern detected in argument: {pattern} in {arg}")]
    DangerousPattern { pattern: String, arg: String },

    #[error("Path exceeds maximum length (max {MAX_PATH_LENGTH})")]
    PathTooLong,

    #[error("Access to protected system directory denied: {0}")]
    ProtectedDirectory(String),

    #[error("Path does not exist: {0}")]
    PathNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid argument value for {arg}: {reason}")]
    InvalidValue { arg: String, reason: String },
}

/// Security-first argument parser.
pub struct SecureArgParser;

impl SecureArgParser {
    /// Validate a single argument for security issues.
    pub fn validate_argument(arg: &str) -> Result<(), ParseError> {
        if arg.len() > MAX_ARG_LENGTH {
            return Err(ParseError::ArgumentTooLong(
                arg.chars().take(50).collect::<String>() + "...",
            ));
        }

        for pattern in DANGEROUS_PATTERNS {
            if arg.contains(pattern) {
                return Err(ParseError::DangerousPattern {
                    pattern: pattern.to_string(),
                    arg: arg.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Validate and canonicalize a path that is expected to already exist
    /// (e.g. a config file).
    pub fn validate_path(path: &str) -> Result<PathBuf, ParseError> {
        Self::validate_argument(path).map_err(|e| match e {
            ParseError::ArgumentTooLong(_) => ParseError::InvalidPath(format!("Path too long: {}", path)),
            ParseError::DangerousPattern { pattern, .. } => {
                ParseError::InvalidPath(format!("Path contains dangerous pattern '{}': {}", pattern, path))
            }
            other => other,
        })?;

        let path_obj = Path::new(path);
        let canonical = path_obj.canonicalize().map_err(|e| {
            if !path_obj.exists() {
                ParseError::PathNotFound(path.to_string())
            } else {
                ParseError::InvalidPath(format!("{}: {}", path, e))
            }
        })?;

        if canonical.to_string_lossy().len() > MAX_PATH_LENGTH {
            return Err(ParseError::PathTooLong);
        }

        for protected in PROTECTED_DIRS {
            if canonical.starts_with(protected) {
                return Err(ParseError::ProtectedDirectory(canonical.display().to_string()));
            }
        }

        Ok(canonical)
    }

    /// Validate a bare numeric argument against an optional range.
    pub fn validate_number<T>(arg_name: &str, value: &str, min: Option<T>, max: Option<T>) -> Result<T, ParseError>
    where
        T: std::str::FromStr + PartialOrd + std::fmt::Display,
    {
        Self::validate_argument(value)?;

        let num = value.parse::<T>().map_err(|_| ParseError::InvalidValue {
            arg: arg_name.to_string(),
            reason: format!("not a valid number: {}", value),
        })?;

        if let Some(min_val) = min {
            if num < min_val {
                return Err(ParseError::InvalidValue {
                    arg: arg_name.to_string(),
                    reason: format!("value {} is less than minimum {}", value, min_val),
                });
            }
        }
        if let Some(max_val) = max {
            if num > max_val {
                return Err(ParseError::InvalidValue {
                    arg: arg_name.to_string(),
                    reason: format!("value {} is greater than maximum {}", value, max_val),
                });
            }
        }

        Ok(num)
    }
}

#[derive(Parser, Debug)]
#[command(name = "cdc-relay", version, about = "Typed change-data-capture relay")]
struct Cli {
    /// Path to the relay YAML/TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the producer process (fetch/merge/diff/publish loop).
    Producer,
    /// Run a consumer process bound to one target plugin.
    Consumer {
        /// Name of the registered target plugin to drive (e.g. "flatfile", "ldap").
        #[arg(long)]
        plugin: String,
    },
    /// Send a control command to a running process over its UNIX socket.
    Ctl {
        #[command(subcommand)]
        command: CtlCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CtlCommands {
    /// Report the current status of the target process.
    Status,
    /// Pause cycle/consume processing.
    Pause,
    /// Resume cycle/consume processing.
    Resume,
    /// Reload the dataschema and reinitialize derived state.
    Reinit,
    /// Flush the error queue, retrying every entry immediately.
    FlushErrorQueue,
    /// Inspect the live cached state of one object.
    Inspect {
        #[arg(long = "type")]
        type_name: String,
        #[arg(long)]
        pkey: String,
    },
}

/// Validated CLI configuration: all paths canonicalized, all values
/// range-checked, before any application code sees them.
#[derive(Debug, Clone)]
pub struct ValidatedCli {
    pub command: ValidatedCommand,
    pub verbose: u8,
    pub config: Option<PathBuf>,
}

/// Validated process role / control command.
#[derive(Debug, Clone)]
pub enum ValidatedCommand {
    Producer,
    Consumer { plugin: String },
    Ctl(ValidatedCtlCommand),
}

#[derive(Debug, Clone)]
pub enum ValidatedCtlCommand {
    Status,
    Pause,
    Resume,
    Reinit,
    FlushErrorQueue,
    Inspect { type_name: String, pkey: String },
}

/// Parse `std::env::args()` and apply security validation in one step.
///
/// # Errors
///
/// Returns [`ParseError`] if any argument fails validation. `--help` and
/// `--version` are handled by clap and exit the process directly.
pub fn parse_and_validate() -> Result<ValidatedCli, ParseError> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > MAX_ARG_COUNT {
        return Err(ParseError::TooManyArguments);
    }
    let cli = Cli::parse();
    validate_cli(cli)
}

fn validate_cli(cli: Cli) -> Result<ValidatedCli, ParseError> {
    let config = if let Some(ref path) = cli.config {
        Some(SecureArgParser::validate_path(&path.to_string_lossy())?)
    } else {
        None
    };

    let command = match cli.command {
        Commands::Producer => ValidatedCommand::Producer,
        Commands::Consumer { plugin } => {
            SecureArgParser::validate_argument(&plugin)?;
            ValidatedCommand::Consumer { plugin }
        }
        Commands::Ctl { command } => ValidatedCommand::Ctl(match command {
            CtlCommands::Status => ValidatedCtlCommand::Status,
            CtlCommands::Pause => ValidatedCtlCommand::Pause,
            CtlCommands::Resume => ValidatedCtlCommand::Resume,
            CtlCommands::Reinit => ValidatedCtlCommand::Reinit,
            CtlCommands::FlushErrorQueue => ValidatedCtlCommand::FlushErrorQueue,
            CtlCommands::Inspect { type_name, pkey } => {
                SecureArgParser::validate_argument(&type_name)?;
                SecureArgParser::validate_argument(&pkey)?;
                ValidatedCtlCommand::Inspect { type_name, pkey }
            }
        }),
    };

    Ok(ValidatedCli {
        command,
        verbose: cli.verbose,
        config,
    })
}
