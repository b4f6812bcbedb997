//! Sink publishers.
//!
//! Each publisher implements `SinkPublisher` for one sink kind: `sns` for
//! pub/sub topics and `webhook` for HTTP endpoints.
pub mod sns;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod webhook;

pub use sns::SnsPublisher;
pub use webhook::WebhookPublisher;
