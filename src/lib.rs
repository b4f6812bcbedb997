/// pg-bridge - PostgreSQL LISTEN/NOTIFY to SNS and webhook fan-out
///
/// This library subscribes to PostgreSQL notification channels and forwards
/// each notification to the SNS topics and HTTP webhooks routed to its
/// channel.
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod internal_metrics;
pub mod listener;
pub mod publishers;
pub mod routing;
pub mod task_manager;

// Re-export core types for convenience
pub use crate::core::*;
pub use crate::error::{BridgeError, Result};
