//! Error types shared by the bridge components.

use thiserror::Error;

/// Errors produced by the listener, routing and delivery layers.
///
/// `Config` and `Subscription` are fatal and stop the process. `Delivery` is
/// confined to the single delivery task that produced it.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Malformed routing input, missing connection info or zero channels.
    #[error("configuration error: {0}")]
    Config(String),

    /// The initial subscription failed, or the source reported a
    /// non-recoverable condition.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// One delivery attempt to one sink failed.
    #[error("delivery to {sink} failed: {cause}")]
    Delivery { sink: String, cause: String },

    /// The liveness probe failed or timed out.
    #[error("probe failed: {0}")]
    Probe(String),
}

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn delivery(sink: impl ToString, cause: impl ToString) -> Self {
        Self::Delivery {
            sink: sink.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Returns `true` for errors that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Subscription(_))
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
