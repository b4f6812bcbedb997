//! Transport seam between the `ListenerManager` and the notification source.
//!
//! A `Connector` opens one connection at a time. The connection is split into
//! a `Session`, used to issue `LISTEN` and ping commands, and an event
//! receiver that yields raw notifications until the connection is lost.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Whether a source error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// I/O failures, closed connections, server restarts.
    Transient,
    /// Bad credentials, unknown database, refused subscription.
    Fatal,
}

/// An error reported by the notification source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct SourceError {
    pub class: ErrorClass,
    pub message: String,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class == ErrorClass::Fatal
    }
}

/// A notification as delivered by the source, before it is timestamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
    pub process_id: Option<i32>,
}

/// Items on a connection's event receiver. An `Err` or a closed receiver both
/// mean the connection is gone.
pub type SourceEvent = Result<RawNotification, SourceError>;

/// An open connection to the notification source.
pub struct SourceConnection {
    pub session: Arc<dyn Session>,
    pub events: mpsc::UnboundedReceiver<SourceEvent>,
}

/// Opens connections to the notification source.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<SourceConnection, SourceError>;
}

/// Commands issued over an open connection.
///
/// Dropping the last reference to a session releases the connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Subscribes the connection to `channel`.
    async fn listen(&self, channel: &str) -> Result<(), SourceError>;

    /// Performs a round trip over the connection.
    async fn ping(&self) -> Result<(), SourceError>;
}
