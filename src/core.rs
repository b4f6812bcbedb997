//! Core domain types and service traits for pg-bridge
//!
//! This module defines the notification and sink types that flow between the
//! listener, the routing table and the dispatcher, along with the trait
//! contract every delivery backend implements.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const TOPIC_PREFIX: &str = "topic:";

/// One event received from the notification source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// The channel the event was published on.
    pub channel: String,
    /// The opaque payload, forwarded verbatim to every sink.
    pub payload: String,
    /// When the listener received the event.
    pub received_at: DateTime<Utc>,
    /// Backend process id of the notifying session, if the source reports one.
    pub process_id: Option<i32>,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            received_at: Utc::now(),
            process_id: None,
        }
    }
}

/// The kind of a sink, used to pick its publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Topic,
    Webhook,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Topic => "topic",
            SinkKind::Webhook => "webhook",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sink {
    /// A pub/sub topic identifier (an SNS topic ARN).
    Topic { identifier: String },
    /// An HTTP endpoint that receives the payload as a POST body.
    Webhook { url: String },
}

impl Sink {
    /// Parses a sink descriptor.
    ///
    /// `http://` and `https://` descriptors are webhooks. A leading `topic:`
    /// is stripped; anything else is taken verbatim as a topic identifier.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Err(BridgeError::config("sink descriptor is empty"));
        }

        let lower = descriptor.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(Sink::Webhook {
                url: descriptor.to_string(),
            });
        }

        let identifier = descriptor.strip_prefix(TOPIC_PREFIX).unwrap_or(descriptor);
        if identifier.is_empty() {
            return Err(BridgeError::config(format!(
                "sink descriptor '{}' names no topic",
                descriptor
            )));
        }
        Ok(Sink::Topic {
            identifier: identifier.to_string(),
        })
    }

    pub fn kind(&self) -> SinkKind {
        match self {
            Sink::Topic { .. } => SinkKind::Topic,
            Sink::Webhook { .. } => SinkKind::Webhook,
        }
    }

    /// The topic identifier or webhook URL.
    pub fn target(&self) -> &str {
        match self {
            Sink::Topic { identifier } => identifier,
            Sink::Webhook { url } => url,
        }
    }
}

impl fmt::Display for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.target())
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Delivers a payload to one sink.
#[async_trait]
pub trait SinkPublisher: Send + Sync {
    /// A short name for logs and metrics (e.g., "sns", "webhook").
    fn name(&self) -> &str;

    /// Delivers `payload`, received on `channel`, to `sink`.
    ///
    /// # Returns
    /// * `Ok(())` once the sink accepted the request
    /// * `Err(BridgeError::Delivery)` on any transport or service failure
    async fn deliver(&self, channel: &str, sink: &Sink, payload: &str) -> Result<()>;
}

/// The publisher registered for each sink kind.
#[derive(Clone)]
pub struct Publishers {
    pub topic: Arc<dyn SinkPublisher>,
    pub webhook: Arc<dyn SinkPublisher>,
}

impl Publishers {
    pub fn new(topic: Arc<dyn SinkPublisher>, webhook: Arc<dyn SinkPublisher>) -> Self {
        Self { topic, webhook }
    }

    pub fn for_kind(&self, kind: SinkKind) -> &Arc<dyn SinkPublisher> {
        match kind {
            SinkKind::Topic => &self.topic,
            SinkKind::Webhook => &self.webhook,
        }
    }
}

impl fmt::Debug for Publishers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publishers")
            .field("topic", &self.topic.name())
            .field("webhook", &self.webhook.name())
            .finish()
    }
}
