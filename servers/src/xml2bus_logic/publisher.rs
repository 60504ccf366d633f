//! # Bus Publisher
//!
//! Drains the hand-off queue and forwards each record, in its
//! `"<identifier>;<text>"` wire form, to a Redis stream. Without a bus URL the
//! records are logged instead.
//!
//! A failed publish is retried with the same record after a fixed delay, so a
//! bus outage stalls the queue rather than losing records. Under the `block`
//! overflow policy the stall reaches the connections as backpressure.
//!
//! On shutdown the queue is closed and whatever is still queued gets one
//! delivery attempt each before the publisher exits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio_graceful::ShutdownGuard;

use lib_xml2bus::core::{HandoffQueue, Record};

/// Where published records go.
pub trait BusSink: Send {
    /// Delivers one record. An error leaves the record to be retried.
    fn publish(&mut self, record: &Record) -> impl Future<Output = Result<()>> + Send;
}

/// Logs each record. Used when no bus URL is configured.
#[derive(Debug, Default)]
pub struct LogSink {
    subject: String,
}

impl LogSink {
    pub fn new(subject: impl Into<String>) -> Self {
        Self { subject: subject.into() }
    }
}

impl BusSink for LogSink {
    async fn publish(&mut self, record: &Record) -> Result<()> {
        tracing::info!("Publishing (dry run) to {}: {}", self.subject, record.to_wire());
        Ok(())
    }
}

/// Identity attached to every stream entry.
#[derive(Debug, Clone)]
pub struct StreamIdentity {
    pub subject: String,
    pub cluster_id: String,
    pub client_id: String,
}

/// # Redis Stream Sink
///
/// Appends records with `XADD <subject> * payload <wire> cluster <id> client <id>`.
/// The connection is opened lazily through a [`ConnectionManager`], which
/// re-establishes it after a drop. This covers fire-and-forget publishes too,
/// whose errors never reach the publish loop.
pub struct RedisStreamSink {
    client: redis::Client,
    connection: Option<ConnectionManager>,
    identity: StreamIdentity,
    async_publish: bool,
}

impl RedisStreamSink {
    pub fn new(url: &str, identity: StreamIdentity, async_publish: bool) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("invalid bus URL '{}'", url))?;
        Ok(Self {
            client,
            connection: None,
            identity,
            async_publish,
        })
    }

    async fn connection(&mut self) -> Result<ConnectionManager> {
        if let Some(connection) = &self.connection {
            return Ok(connection.clone());
        }
        let connection = self
            .client
            .get_connection_manager()
            .await
            .context("failed to connect to the bus")?;
        tracing::info!("Connected to bus, publishing to {}", self.identity.subject);
        self.connection = Some(connection.clone());
        Ok(connection)
    }
}

async fn xadd(connection: &mut ConnectionManager, identity: &StreamIdentity, wire: &str) -> Result<String> {
    let fields = [
        ("payload", wire),
        ("cluster", identity.cluster_id.as_str()),
        ("client", identity.client_id.as_str()),
    ];
    let id: String = connection
        .xadd(&identity.subject, "*", &fields[..])
        .await
        .with_context(|| format!("XADD to {} failed", identity.subject))?;
    Ok(id)
}

impl BusSink for RedisStreamSink {
    async fn publish(&mut self, record: &Record) -> Result<()> {
        let mut connection = self.connection().await?;
        let wire = record.to_wire();

        if self.async_publish {
            let identity = self.identity.clone();
            tokio::spawn(async move {
                match xadd(&mut connection, &identity, &wire).await {
                    Ok(id) => tracing::debug!("Received ack for message {}", id),
                    Err(e) => tracing::warn!("Error in async publish of '{}': {:#}", wire, e),
                }
            });
            return Ok(());
        }

        let id = xadd(&mut connection, &self.identity, &wire).await?;
        tracing::debug!("Published '{}' as {}", wire, id);
        Ok(())
    }
}

/// # Run Publisher
///
/// Dequeues records one at a time and hands them to `sink`, retrying each
/// until it is delivered. Stops when the queue is closed and drained, or when
/// the shutdown guard is cancelled, in which case the remaining records are
/// flushed once (see [`flush`]).
pub async fn run<S: BusSink>(queue: Arc<HandoffQueue>, mut sink: S, retry_delay: Duration, shutdown_guard: ShutdownGuard) {
    let mut pending = None;
    'serve: loop {
        let record = tokio::select! {
            biased;
            _ = shutdown_guard.cancelled() => break,
            record = queue.dequeue() => match record {
                Some(record) => record,
                None => break,
            },
        };

        loop {
            match sink.publish(&record).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!("Error publishing {}: {:#}, retrying in {:?}", record, e, retry_delay);
                    tokio::select! {
                        _ = shutdown_guard.cancelled() => {
                            pending = Some(record);
                            break 'serve;
                        }
                        _ = tokio::time::sleep(retry_delay) => {}
                    }
                }
            }
        }
    }

    flush(&queue, &mut sink, pending).await;
}

/// Closes the queue, so sessions stop producing, and gives `pending` plus
/// every record still queued a single delivery attempt. The first failure
/// ends the flush: the bus is down and further attempts would only delay exit.
async fn flush<S: BusSink>(queue: &HandoffQueue, sink: &mut S, pending: Option<Record>) {
    queue.close();

    let mut flushed = 0usize;
    let mut next = match pending {
        Some(record) => Some(record),
        None => queue.dequeue().await,
    };
    while let Some(record) = next {
        if let Err(e) = sink.publish(&record).await {
            tracing::warn!(
                "Publisher stopped with {} records undelivered, starting at {}: {:#}",
                queue.len() + 1,
                record,
                e
            );
            return;
        }
        flushed += 1;
        next = queue.dequeue().await;
    }

    if flushed > 0 {
        tracing::info!("Publisher stopped after flushing {} queued records", flushed);
    } else {
        tracing::info!("Publisher stopped");
    }
}
