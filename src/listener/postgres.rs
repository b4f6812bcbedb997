//! PostgreSQL `LISTEN`/`NOTIFY` connector built on `tokio-postgres`.

use super::source::{Connector, RawNotification, Session, SourceConnection, SourceError};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls};
use tracing::{debug, info, warn};

/// Longest identifier PostgreSQL keeps; longer channel names are truncated
/// by the server.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Opens `tokio-postgres` connections and forwards their notifications.
pub struct PgConnector {
    config: Config,
}

impl PgConnector {
    /// Parses the connection string. A malformed string is a configuration
    /// error, reported before any connection attempt.
    pub fn new(url: &str) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(BridgeError::config("postgres.url value required"));
        }
        let config = url
            .parse::<Config>()
            .map_err(|e| BridgeError::config(format!("invalid postgres.url: {}", e)))?;
        Ok(Self { config })
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<SourceConnection, SourceError> {
        debug!(hosts = ?self.config.get_hosts(), "Connecting to postgres");
        let (client, mut connection) = self.config.connect(NoTls).await.map_err(classify)?;
        info!("Connected to postgres");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Polling the connection both drives the client's queries and
            // yields the asynchronous messages.
            let mut messages =
                Box::pin(futures::stream::poll_fn(move |cx| connection.poll_message(cx)));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let raw = RawNotification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                            process_id: Some(n.process_id()),
                        };
                        if events_tx.send(Ok(raw)).is_err() {
                            break;
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        debug!(notice = %notice.message(), "Postgres notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events_tx.send(Err(classify(e)));
                        break;
                    }
                }
            }
            debug!("Postgres connection task finished");
        });

        Ok(SourceConnection {
            session: Arc::new(PgSession { client }),
            events: events_rx,
        })
    }
}

struct PgSession {
    client: Client,
}

#[async_trait]
impl Session for PgSession {
    async fn listen(&self, channel: &str) -> Result<(), SourceError> {
        if channel.len() > MAX_IDENTIFIER_LEN {
            warn!(
                channel,
                "Channel name exceeds {} bytes and will be truncated by postgres",
                MAX_IDENTIFIER_LEN
            );
        }
        self.client
            .batch_execute(&format!("LISTEN {}", quote_identifier(channel)))
            .await
            .map_err(classify)
    }

    async fn ping(&self) -> Result<(), SourceError> {
        self.client.batch_execute("SELECT 1").await.map_err(classify)
    }
}

/// Quotes a channel name as a SQL identifier.
pub fn quote_identifier(name: &str) -> String {
    let name = name.split('\0').next().unwrap_or_default();
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Sorts a driver error into transient or fatal.
fn classify(err: tokio_postgres::Error) -> SourceError {
    let message = err.to_string();
    match err.code() {
        Some(code) if is_fatal_state(code) => SourceError::fatal(message),
        _ => SourceError::transient(message),
    }
}

/// Authorization failures, unknown databases and privilege or syntax errors
/// will not resolve by reconnecting.
fn is_fatal_state(code: &SqlState) -> bool {
    let code = code.code();
    code.starts_with("28") || code.starts_with("42") || code == SqlState::INVALID_CATALOG_NAME.code()
}
