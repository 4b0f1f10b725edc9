// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Prometheus Metrics Endpoint
//!
//! A minimal `/metrics` scrape target: a raw `tokio::net::TcpListener`
//! loop that renders the process [`prometheus::Registry`] on every
//! connection. No web framework is pulled in for one read-only text
//! endpoint.

use cdc_relay_domain::error::RelayError;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// Counters and gauges a producer/consumer cycle updates. Held behind an
/// `Arc` so the serving task and the producer/consumer loop share one
/// instance.
pub struct RelayMetrics {
    pub registry: Registry,
    pub events_published: IntCounterVec,
    pub events_applied: IntCounterVec,
    pub apply_failures: IntCounterVec,
    pub error_queue_depth: IntGaugeVec,
    pub cache_size: IntGaugeVec,
}

impl RelayMetrics {
    pub fn new() -> Result<Self, RelayError> {
        let registry = Registry::new();

        let events_published = IntCounterVec::new(
            Opts::new("cdc_relay_events_published_total", "Events published to the bus, by type and operation"),
            &["type", "op"],
        )
        .map_err(metrics_err)?;
        let events_applied = IntCounterVec::new(
            Opts::new("cdc_relay_events_applied_total", "Events successfully applied to a target, by type and operation"),
            &["type", "op"],
        )
        .map_err(metrics_err)?;
        let apply_failures = IntCounterVec::new(
            Opts::new("cdc_relay_apply_failures_total", "Apply failures, by type and error category"),
            &["type", "category"],
        )
        .map_err(metrics_err)?;
        let error_queue_depth = IntGaugeVec::new(
            Opts::new("cdc_relay_error_queue_depth", "Current error queue depth, by type"),
            &["type"],
        )
        .map_err(metrics_err)?;
        let cache_size = IntGaugeVec::new(Opts::new("cdc_relay_cache_size", "Cached object count, by type"), &["type"])
            .map_err(metrics_err)?;

        registry.register(Box::new(events_published.clone())).map_err(metrics_err)?;
        registry.register(Box::new(events_applied.clone())).map_err(metrics_err)?;
        registry.register(Box::new(apply_failures.clone())).map_err(metrics_err)?;
        registry.register(Box::new(error_queue_depth.clone())).map_err(metrics_err)?;
        registry.register(Box::new(cache_size.clone())).map_err(metrics_err)?;

        Ok(Self {
            registry,
            events_published,
            events_applied,
            apply_failures,
            error_queue_depth,
            cache_size,
        })
    }

    fn render(&self) -> Result<Vec<u8>, RelayError> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| RelayError::internal_error(format!("failed to encode metrics: {e}")))?;
        Ok(buffer)
    }
}

fn metrics_err(e: prometheus::Error) -> RelayError {
    RelayError::internal_error(format!("failed to register metric: {e}"))
}

/// Serve `/metrics` on `addr` until the process exits. Intended to be
/// spawned as its own task alongside the producer/consumer main loop.
pub async fn serve(addr: SocketAddr, metrics: Arc<RelayMetrics>) -> Result<(), RelayError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::internal_error(format!("failed to bind metrics endpoint on {addr}: {e}")))?;
    tracing::info!(%addr, "metrics endpoint listening");

    loop {
        let (mut stream, _) = listener
            .accept()
            .await
            .map_err(|e| RelayError::internal_error(format!("metrics accept failed: {e}")))?;
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let body = match metrics.render() {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to render metrics");
                    return;
                }
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                tracing::debug!(error = %e, "metrics response write failed");
                return;
            }
            let _ = stream.write_all(&body).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_gathers_registered_families() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.events_published.with_label_values(&["user", "added"]).inc();
        let rendered = String::from_utf8(metrics.render().unwrap()).unwrap();
        assert!(rendered.contains("cdc_relay_events_published_total"));
    }
}
