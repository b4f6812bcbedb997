//! Live integration test against a real PostgreSQL server.
//!
//! Requires a reachable server; the connection string is read from
//! `PG_BRIDGE_LIVE_URL` (default `postgres://postgres@localhost/postgres`).
//!
//! To run this test:
//! `cargo test --test live_postgres --features live-tests -- --nocapture`

use futures::StreamExt;
use pg_bridge::{
    internal_metrics::Metrics,
    listener::{ListenerConfig, ListenerManager, ListenerState, PgConnector},
};
use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio_postgres::NoTls;
use tracing::Span;

fn live_url() -> String {
    std::env::var("PG_BRIDGE_LIVE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/postgres".to_string())
}

#[tokio::test]
async fn test_notifications_arrive_from_postgres() {
    let url = live_url();
    let manager = ListenerManager::new(
        Arc::new(PgConnector::new(&url).unwrap()),
        ListenerConfig::default(),
        Arc::new(Metrics::new_for_test()),
        Span::none(),
    );
    let channels: BTreeSet<String> = ["pg_bridge_live", "Mixed Case"]
        .into_iter()
        .map(String::from)
        .collect();
    manager.start(channels).await.unwrap();
    assert_eq!(manager.state(), ListenerState::Listening);
    manager.probe().await.unwrap();

    let mut notifications = manager.notifications().unwrap();

    let (client, connection) = tokio_postgres::connect(&url, NoTls).await.unwrap();
    tokio::spawn(connection);
    client
        .batch_execute("SELECT pg_notify('pg_bridge_live', '{\"id\":1}'); NOTIFY \"Mixed Case\", 'second';")
        .await
        .unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), notifications.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.channel, "pg_bridge_live");
    assert_eq!(first.payload, "{\"id\":1}");
    assert!(first.process_id.is_some());

    let second = tokio::time::timeout(Duration::from_secs(5), notifications.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.channel, "Mixed Case");
    assert_eq!(second.payload, "second");

    manager.close().await;
    assert_eq!(manager.state(), ListenerState::Disconnected);
}

#[tokio::test]
async fn test_unknown_database_fails_startup() {
    let url = format!("{}_pg_bridge_missing", live_url());
    let manager = ListenerManager::new(
        Arc::new(PgConnector::new(&url).unwrap()),
        ListenerConfig::default(),
        Arc::new(Metrics::new_for_test()),
        Span::none(),
    );

    let result = manager.start(BTreeSet::from(["orders".to_string()])).await;

    assert!(result.is_err());
    assert_eq!(manager.state(), ListenerState::Failed);
    manager.close().await;
}
