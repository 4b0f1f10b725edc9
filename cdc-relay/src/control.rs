// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Control Surface
//!
//! A UNIX domain socket carrying newline-delimited JSON requests, served
//! by the running producer/consumer process and driven by the
//! `cdc-relayctl` binary. `status`/`pause`/`resume`/`reinit`/
//! `flush-errorqueue`/`inspect` (the `ctl` subcommands
//! `cdc-relay-bootstrap::cli` parses) all round-trip through this one
//! protocol.

use cdc_relay_bootstrap::shutdown::CancellationToken;
use cdc_relay_domain::error::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Pause,
    Resume,
    Reinit,
    FlushErrorQueue,
    Inspect { type_name: String, pkey: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into() }
    }
}

/// Implemented by the producer/consumer process state, dispatched to
/// from the control server's accept loop.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, request: ControlRequest) -> ControlResponse;
}

/// Serve `ControlRequest`s on `socket_path` until `shutdown` is
/// cancelled. Any stale socket file from a previous, uncleanly-stopped
/// process is removed before binding.
pub async fn serve(socket_path: &Path, handler: Arc<dyn ControlHandler>, shutdown: CancellationToken) -> Result<(), RelayError> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .map_err(|e| RelayError::internal_error(format!("failed to remove stale control socket: {e}")))?;
    }
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| RelayError::internal_error(format!("failed to bind control socket {}: {e}", socket_path.display())))?;
    tracing::info!(path = %socket_path.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("control server shutting down");
                let _ = std::fs::remove_file(socket_path);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| RelayError::internal_error(format!("control accept failed: {e}")))?;
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handler).await {
                        tracing::warn!(error = %e, "control connection failed");
                    }
                });
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handler: Arc<dyn ControlHandler>) -> Result<(), RelayError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await.map_err(RelayError::from)? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => handler.handle(request).await,
            Err(e) => ControlResponse::error(format!("malformed request: {e}")),
        };
        let mut encoded = serde_json::to_vec(&response).map_err(RelayError::from)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await.map_err(RelayError::from)?;
    }
    Ok(())
}

/// Send one request to a running process's control socket and wait for
/// its response, used by `cdc-relayctl`.
pub async fn send_command(socket_path: &Path, request: ControlRequest) -> Result<ControlResponse, RelayError> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| RelayError::internal_error(format!("failed to connect to control socket {}: {e}", socket_path.display())))?;
    let (reader, mut writer) = stream.into_split();
    let mut encoded = serde_json::to_vec(&request).map_err(RelayError::from)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await.map_err(RelayError::from)?;

    let mut lines = BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await
        .map_err(RelayError::from)?
        .ok_or_else(|| RelayError::internal_error("control socket closed before responding"))?;
    serde_json::from_str(&line).map_err(RelayError::from)
}
