// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Signal Handling
//!
//! Wires OS termination signals to a [`ShutdownCoordinator`](crate::shutdown::ShutdownCoordinator):
//! `SIGTERM`/`SIGINT` initiate shutdown, `SIGHUP` is reserved for a future
//! config-reload hook (currently logged and ignored, matching the
//! `reinit` control command's explicit-trigger model instead).

use crate::shutdown::ShutdownCoordinator;

/// Spawn a task that listens for termination signals and drives `coordinator`.
///
/// On Unix this listens for `SIGTERM`, `SIGINT`, and `SIGHUP`. On other
/// platforms only `Ctrl+C` (`SIGINT`-equivalent) is available.
pub fn install(coordinator: ShutdownCoordinator) {
    #[cfg(unix)]
    {
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGHUP handler");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM");
                        coordinator.initiate_shutdown();
                        break;
                    }
                    _ = sigint.recv() => {
                        tracing::info!("received SIGINT");
                        coordinator.initiate_shutdown();
                        break;
                    }
                    _ = sighup.recv() => {
                        tracing::info!("received SIGHUP (reload via the `ctl reinit` command instead)");
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C");
                coordinator.initiate_shutdown();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn install_does_not_panic() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        install(coordinator.clone());
        // Give the listener task a moment to register before the test exits.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!coordinator.is_shutting_down());
    }
}
