//! A publisher for AWS SNS topics.

use crate::config::SnsConfig;
use crate::core::{Sink, SinkPublisher};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::Client;
use tracing::info;

/// Publishes payloads as SNS messages; the topic identifier is the topic ARN.
#[derive(Debug, Clone)]
pub struct SnsPublisher {
    client: Client,
}

impl SnsPublisher {
    /// Builds a client from the default AWS credential and region chain,
    /// with optional region and endpoint overrides.
    pub async fn from_config(config: &SnsConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;
        Self {
            client: Client::new(&shared_config),
        }
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SinkPublisher for SnsPublisher {
    fn name(&self) -> &str {
        "sns"
    }

    async fn deliver(&self, channel: &str, sink: &Sink, payload: &str) -> Result<()> {
        let topic_arn = match sink {
            Sink::Topic { identifier } => identifier,
            other => {
                return Err(BridgeError::delivery(
                    other,
                    "topic publisher cannot deliver to a webhook",
                ))
            }
        };

        let output = self
            .client
            .publish()
            .topic_arn(topic_arn)
            .message(payload)
            .send()
            .await
            .map_err(|e| BridgeError::delivery(sink, DisplayErrorContext(&e)))?;

        info!(
            channel,
            topic = %topic_arn,
            message_id = output.message_id().unwrap_or_default(),
            "Delivered notification to SNS"
        );
        Ok(())
    }
}
