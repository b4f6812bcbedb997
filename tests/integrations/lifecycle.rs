//! Startup, failure and shutdown behaviour of the whole application.

#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::{app::TestAppBuilder, config_with_routes};
use pg_bridge::{
    listener::{test_utils::FakeConnector, SourceError},
    publishers::test_utils::RecordingPublisher,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_subscribes_to_every_routed_channel() {
    let config = config_with_routes(&[
        "orders https://hook/a",
        "billing topic:arn:b",
        "orders topic:arn:c",
    ]);
    let app = TestAppBuilder::new(config).start().await.unwrap();

    let mut channels = app.source.listened_channels();
    channels.sort();
    assert_eq!(channels, vec!["billing", "orders"]);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_failed_subscription_aborts_startup_and_releases_connection() {
    let source = FakeConnector::new();
    source.fail_listen("orders", SourceError::fatal("permission denied for channel"));
    let config = config_with_routes(&["orders https://hook/a"]);

    let result = TestAppBuilder::new(config)
        .with_source(source.clone())
        .start()
        .await;

    let err = result.err().expect("startup should fail");
    assert!(format!("{:#}", err).contains("permission denied"));
    assert!(!source.is_connected());
}

#[tokio::test]
async fn test_fatal_connection_loss_stops_the_app_with_an_error() {
    let config = config_with_routes(&["orders https://hook/a"]);
    let mut app = TestAppBuilder::new(config).start().await.unwrap();

    app.source
        .sever(Some(SourceError::fatal("role \"bridge\" does not exist")));

    let result = app.wait(WAIT).await;
    let err = result.expect_err("a fatal loss must surface as an error");
    assert!(err.to_string().contains("does not exist"));
    assert!(!app.source.is_connected());
}

#[tokio::test]
async fn test_shutdown_releases_the_connection() {
    let config = config_with_routes(&["orders https://hook/a"]);
    let app = TestAppBuilder::new(config).start().await.unwrap();
    let source = app.source.clone();
    assert!(source.is_connected());

    app.shutdown(WAIT).await.unwrap();

    assert!(!source.is_connected());
}

#[tokio::test]
async fn test_stuck_sink_does_not_block_shutdown() {
    let webhooks = RecordingPublisher::gated();
    let mut config = config_with_routes(&["orders https://hook/stuck"]);
    config.dispatch.max_in_flight = 1;
    config.dispatch.drain_timeout_ms = 200;
    let app = TestAppBuilder::new(config)
        .with_webhooks(webhooks.clone())
        .start()
        .await
        .unwrap();
    let source = app.source.clone();

    // More than the listener buffers, with the only delivery slot held.
    for i in 0..1100 {
        assert!(source.notify("orders", &i.to_string()));
    }
    webhooks.wait_for_attempts(1, WAIT).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(webhooks.active(), 1);

    app.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(webhooks.attempt_count(), 1);
    assert!(!source.is_connected());
}

#[tokio::test]
async fn test_health_endpoint_follows_the_listener() {
    let config = config_with_routes(&["orders https://hook/a"]);
    let app = TestAppBuilder::new(config).with_health().start().await.unwrap();
    let url = format!("http://{}/health", app.health_addr.unwrap());

    // The first probe runs as soon as the monitor starts.
    let mut status = 0;
    for _ in 0..20 {
        status = reqwest::get(&url).await.unwrap().status().as_u16();
        if status == 200 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(status, 200);

    app.shutdown(WAIT).await.unwrap();
}
