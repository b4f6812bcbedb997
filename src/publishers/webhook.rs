//! A publisher that POSTs notification payloads to HTTP webhooks.

use crate::core::{Sink, SinkPublisher};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::{info, warn};

/// Bytes of a non-success response body kept for the log line.
const BODY_PREVIEW_LIMIT: usize = 512;

/// Forwards payloads verbatim as the body of a `POST` request.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
}

impl WebhookPublisher {
    /// Creates a publisher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::config(format!("could not build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// Keeps at most `BODY_PREVIEW_LIMIT` bytes across chunks.
fn append_preview(preview: &mut Vec<u8>, chunk: &[u8]) {
    let room = BODY_PREVIEW_LIMIT.saturating_sub(preview.len());
    preview.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

#[async_trait]
impl SinkPublisher for WebhookPublisher {
    fn name(&self) -> &str {
        "webhook"
    }

    /// A non-2xx answer is logged but still counts as delivered; only
    /// transport failures and unreadable response bodies are errors.
    async fn deliver(&self, channel: &str, sink: &Sink, payload: &str) -> Result<()> {
        let url = match sink {
            Sink::Webhook { url } => url,
            other => {
                return Err(BridgeError::delivery(
                    other,
                    "webhook publisher cannot deliver to a topic",
                ))
            }
        };

        let mut response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_owned())
            .send()
            .await
            .map_err(|e| BridgeError::delivery(sink, e))?;

        let status = response.status();
        // The body is always drained; only a bounded prefix is kept.
        let mut body = Vec::new();
        let mut body_len = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BridgeError::delivery(sink, format!("cannot read response body: {}", e)))?
        {
            body_len += chunk.len();
            append_preview(&mut body, &chunk);
        }

        if status.is_success() {
            info!(channel, url = %url, status = %status, "Delivered notification to webhook");
        } else {
            warn!(
                channel,
                url = %url,
                status = %status,
                body = %String::from_utf8_lossy(&body),
                body_len,
                "Webhook answered with a non-success status"
            );
        }
        Ok(())
    }
}
