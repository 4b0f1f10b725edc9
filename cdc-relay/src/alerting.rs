// /////////////////////////////////////////////////////////////////////////////
// CDC Relay
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Mail Alerting
//!
//! Composes one mail per producer/consumer cycle that had diagnostics
//! worth surfacing (merge/integrity drops, apply failures, error-queue
//! growth). The rendered body is truncated to `mailtext_maxsize`; if a
//! fuller record was requested, it goes out gzip-compressed as an
//! attachment rather than bloating the body an operator reads inline.

use crate::infra::config::AlertingConfig;
use cdc_relay_domain::error::RelayError;
use flate2::write::GzEncoder;
use flate2::Compression;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::io::Write;

/// One cycle's worth of noteworthy events, ready to render into a mail.
#[derive(Debug, Clone)]
pub struct AlertSummary {
    pub subject: String,
    pub body_lines: Vec<String>,
    /// Full, untruncated detail (every diagnostic line), attached
    /// gzip-compressed when `gzip_attachment` is enabled.
    pub detail: Option<String>,
}

pub struct AlertSender {
    config: AlertingConfig,
    transport: SmtpTransport,
}

impl AlertSender {
    pub fn new(config: AlertingConfig) -> Result<Self, RelayError> {
        let mut builder = SmtpTransport::relay(&config.smtp_relay)
            .map_err(|e| RelayError::internal_error(format!("invalid SMTP relay '{}': {e}", config.smtp_relay)))?;
        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            config,
        })
    }

    pub fn send(&self, summary: &AlertSummary) -> Result<(), RelayError> {
        let body = truncate_body(&summary.body_lines.join("\n"), self.config.mailtext_maxsize);

        let mut builder = Message::builder()
            .from(self.config.from_address.parse().map_err(|e| RelayError::internal_error(format!("invalid from address: {e}")))?)
            .subject(&summary.subject);
        for to in &self.config.to_addresses {
            builder = builder.to(to.parse().map_err(|e| RelayError::internal_error(format!("invalid to address '{to}': {e}")))?);
        }

        let message = match (&summary.detail, self.config.gzip_attachment) {
            (Some(detail), true) => {
                let compressed = gzip(detail.as_bytes())?;
                builder
                    .multipart(
                        MultiPart::mixed()
                            .singlepart(SinglePart::plain(body))
                            .singlepart(Attachment::new("detail.log.gz".to_string()).body(compressed, ContentType::parse("application/gzip").unwrap())),
                    )
                    .map_err(|e| RelayError::internal_error(format!("failed to build alert message: {e}")))?
            }
            _ => builder
                .body(body)
                .map_err(|e| RelayError::internal_error(format!("failed to build alert message: {e}")))?,
        };

        self.transport
            .send(&message)
            .map_err(|e| RelayError::internal_error(format!("failed to send alert mail: {e}")))?;
        Ok(())
    }
}

fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let mut cut = max_bytes.min(body.len());
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n\n[... truncated, {} bytes total ...]", &body[..cut], body.len())
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, RelayError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| RelayError::internal_error(format!("gzip failed: {e}")))?;
    encoder.finish().map_err(|e| RelayError::internal_error(format!("gzip failed: {e}")))
}
