//! End-to-end routing: notifications from the fake source reach the
//! recording publishers through the real listener and dispatcher.

#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::{app::TestAppBuilder, config_with_routes};
use pg_bridge::{core::Sink, publishers::test_utils::RecordingPublisher};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_notification_fans_out_to_topic_and_webhook() {
    let config = config_with_routes(&["orders topic:arn:x", "orders https://hook/a"]);
    let app = TestAppBuilder::new(config).start().await.unwrap();

    assert!(app.source.notify("orders", "{\"id\":1}"));

    let topics = app.topics.wait_for_attempts(1, WAIT).await;
    let webhooks = app.webhooks.wait_for_attempts(1, WAIT).await;

    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].channel, "orders");
    assert_eq!(topics[0].sink, Sink::Topic { identifier: "arn:x".to_string() });
    assert_eq!(topics[0].payload, "{\"id\":1}");

    assert_eq!(webhooks.len(), 1);
    assert_eq!(webhooks[0].sink, Sink::Webhook { url: "https://hook/a".to_string() });
    assert_eq!(webhooks[0].payload, "{\"id\":1}");

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_unrouted_channel_is_skipped_and_loop_continues() {
    let config = config_with_routes(&["orders topic:arn:x"]);
    let app = TestAppBuilder::new(config).start().await.unwrap();

    // Only routed channels are subscribed, but a stray notification must
    // still be tolerated.
    assert!(app.source.notify("billing", "{}"));
    assert!(app.source.notify("orders", "after"));

    let topics = app.topics.wait_for_attempts(1, WAIT).await;
    assert_eq!(topics.len(), 1);
    assert_eq!(topics[0].payload, "after");
    assert_eq!(app.webhooks.attempt_count(), 0);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_duplicate_routes_deliver_twice() {
    let config = config_with_routes(&["orders https://hook/a", "orders https://hook/a"]);
    let app = TestAppBuilder::new(config).start().await.unwrap();

    app.source.notify("orders", "x");

    let webhooks = app.webhooks.wait_for_attempts(2, WAIT).await;
    assert_eq!(webhooks.len(), 2);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_failing_sink_does_not_block_siblings_or_the_loop() {
    let webhooks = RecordingPublisher::new();
    webhooks.fail_for("https://hook/broken");
    let config = config_with_routes(&[
        "orders https://hook/broken",
        "orders https://hook/ok",
        "billing https://hook/ok",
    ]);
    let app = TestAppBuilder::new(config)
        .with_webhooks(webhooks)
        .start()
        .await
        .unwrap();

    app.source.notify("orders", "1");
    app.source.notify("billing", "2");

    let attempts = app.webhooks.wait_for_attempts(3, WAIT).await;
    assert_eq!(attempts.len(), 3);
    let ok_payloads: Vec<_> = attempts
        .iter()
        .filter(|d| d.sink.target() == "https://hook/ok")
        .map(|d| d.payload.as_str())
        .collect();
    assert!(ok_payloads.contains(&"1"));
    assert!(ok_payloads.contains(&"2"));

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_stuck_webhook_does_not_block_other_channels() {
    let webhooks = RecordingPublisher::gated();
    let config = config_with_routes(&["orders https://hook/slow", "billing topic:arn:billing"]);
    let app = TestAppBuilder::new(config)
        .with_webhooks(webhooks.clone())
        .start()
        .await
        .unwrap();

    app.source.notify("orders", "slow");
    app.source.notify("billing", "fast");

    let topics = app.topics.wait_for_attempts(1, WAIT).await;
    assert_eq!(topics.len(), 1);
    assert_eq!(webhooks.active(), 1);

    webhooks.release(1);
    app.shutdown(WAIT).await.unwrap();
}
