//! # Connection Supervisor
//!
//! One `Session` owns one accepted connection for its whole life. It drives the
//! tokenizer, hands each `<Page>` to the page decoder, lets the probe responder
//! answer liveness probes, and pushes every other record into the shared
//! hand-off queue.
//!
//! ## States
//!
//! ```text
//! Reading ──Page start──▶ ElementOpen ──probe──▶ RespondingToProbe ──▶ Reading
//!                                     └─record─▶ Enqueuing ──────────▶ Reading
//! any state ──fatal condition──▶ Closed
//! ```
//!
//! Any error ends the session for good; there are no retries inside a
//! connection and the peer is expected to reconnect. `Session::run` consumes
//! the session, so the transport is shut down and released exactly once on
//! every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{pin_mut, stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;

use crate::core::handoff::{EnqueueOutcome, HandoffQueue, QueueError};
use crate::ingestors::page_decoder::{decode_page, RecordError, PAGE_ELEMENT};
use crate::ingestors::probe::{ProbeError, ProbeResponder, DEFAULT_WRITE_TIMEOUT};
use crate::ingestors::xml_stream::{XmlEvent, XmlStreamError, XmlTokenizer, DEFAULT_MAX_TOKEN_LEN};

/// Per-connection settings, identical for every session of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for writing a probe acknowledgement.
    pub write_timeout: Duration,
    /// Close the connection after this long without a complete event.
    /// `None` keeps silent peers connected forever.
    pub idle_timeout: Option<Duration>,
    /// Largest single XML token accepted from the peer.
    pub max_token_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: None,
            max_token_len: DEFAULT_MAX_TOKEN_LEN,
        }
    }
}

/// Position of a session in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Reading,
    ElementOpen,
    RespondingToProbe,
    Enqueuing,
    Closed,
}

/// The condition that closed a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("token error: {0}")]
    Stream(#[source] XmlStreamError),

    #[error("peer closed the connection")]
    Disconnected,

    #[error("error decoding element: {0}")]
    MalformedRecord(#[from] RecordError),

    #[error("error writing PING response: {0}")]
    ResponseWrite(#[from] ProbeError),

    #[error("no data from peer for {0:?}")]
    IdleTimeout(Duration),

    #[error("hand-off queue unavailable: {0}")]
    Queue(#[from] QueueError),
}

/// Counters kept by one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Records accepted by the hand-off queue.
    pub records: u64,
    /// Probes answered.
    pub probes: u64,
    /// Records dropped by the queue's overflow policy.
    pub dropped: u64,
}

/// What is left of a session once it has closed.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub state: SessionState,
    pub stats: SessionStats,
    pub error: SessionError,
}

/// # Session
///
/// Generic over the read and write halves so it runs on TCP in production and
/// on in-memory pipes in tests.
pub struct Session<R, W> {
    id: u64,
    events: FramedRead<R, XmlTokenizer>,
    writer: W,
    queue: Arc<HandoffQueue>,
    responder: ProbeResponder,
    idle_timeout: Option<Duration>,
    state: SessionState,
    stats: SessionStats,
}

impl Session<OwnedReadHalf, OwnedWriteHalf> {
    /// Wraps an accepted TCP connection.
    pub fn from_tcp(id: u64, stream: TcpStream, queue: Arc<HandoffQueue>, config: &SessionConfig) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(id, reader, writer, queue, config)
    }
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(id: u64, reader: R, writer: W, queue: Arc<HandoffQueue>, config: &SessionConfig) -> Self {
        Self {
            id,
            events: FramedRead::new(reader, XmlTokenizer::with_max_token_len(config.max_token_len)),
            writer,
            queue,
            responder: ProbeResponder::new(config.write_timeout),
            idle_timeout: config.idle_timeout,
            state: SessionState::Reading,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// # Run
    ///
    /// Processes the connection until its first fatal condition, then shuts
    /// the transport down and reports why the session ended.
    pub async fn run(mut self) -> SessionReport {
        let error = loop {
            if let Err(error) = self.step().await {
                break error;
            }
        };

        match &error {
            SessionError::Disconnected => tracing::info!("Session {} closed by peer", self.id),
            other => tracing::warn!("Session {} terminated: {}", self.id, other),
        }

        self.transition(SessionState::Closed);
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!("Session {} shutdown: {}", self.id, e);
        }

        SessionReport {
            id: self.id,
            state: self.state,
            stats: self.stats,
            error,
        }
    }

    /// One pass through the state machine: read events up to the next `Page`
    /// start, decode it, then answer or enqueue the record.
    async fn step(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Reading);
        match self.next_event().await? {
            XmlEvent::Start { name } if name == PAGE_ELEMENT => {}
            _ => return Ok(()),
        }

        self.transition(SessionState::ElementOpen);
        let record = {
            // The idle deadline applies per event, as in `Reading`.
            let limit = self.idle_timeout;
            let events = stream::unfold(&mut self.events, move |events| async move {
                match idle_bounded(limit, events.next()).await {
                    Ok(Some(Ok(event))) => Some((Ok(event), events)),
                    Ok(Some(Err(e))) => Some((Err(SessionError::MalformedRecord(RecordError::Stream(e))), events)),
                    Ok(None) => None,
                    Err(idle) => Some((Err(idle), events)),
                }
            });
            pin_mut!(events);
            decode_page(&mut events).await?
        };
        tracing::info!("Parsed: {}", record);

        if record.is_probe() {
            self.transition(SessionState::RespondingToProbe);
        } else {
            self.transition(SessionState::Enqueuing);
        }
        match self.responder.intercept(record, &mut self.writer).await? {
            None => self.stats.probes += 1,
            Some(record) => match self.queue.enqueue(record).await? {
                EnqueueOutcome::Queued => self.stats.records += 1,
                EnqueueOutcome::Dropped => self.stats.dropped += 1,
            },
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<XmlEvent, SessionError> {
        match idle_bounded(self.idle_timeout, self.events.next()).await? {
            Some(Ok(event)) => Ok(event),
            Some(Err(e)) => Err(SessionError::Stream(e)),
            None => Err(SessionError::Disconnected),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::trace!("Session {}: {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }
}

async fn idle_bounded<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, SessionError> {
    match limit {
        None => Ok(fut.await),
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SessionError::IdleTimeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handoff::OverflowPolicy;
    use crate::core::record::Record;
    use crate::ingestors::probe::PROBE_RESPONSE;
    use tokio::io::{AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

    const PING: &str = "<Page><ID></ID><TagText>___PING___</TagText></Page>";

    fn queue() -> Arc<HandoffQueue> {
        Arc::new(HandoffQueue::new(64, OverflowPolicy::Block).unwrap())
    }

    /// A session on one end of an in-memory pipe; the other end plays the peer.
    fn session_pair(
        queue: &Arc<HandoffQueue>,
        config: SessionConfig,
        pipe_capacity: usize,
    ) -> (Session<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>, DuplexStream) {
        let (ours, peer) = tokio::io::duplex(pipe_capacity);
        let (reader, writer) = tokio::io::split(ours);
        (Session::new(1, reader, writer, Arc::clone(queue), &config), peer)
    }

    #[tokio::test]
    async fn test_probe_record_then_malformed_page() {
        let queue = queue();
        let (session, mut peer) = session_pair(&queue, SessionConfig::default(), 4096);
        assert_eq!(session.state(), SessionState::Reading);

        let input = format!(
            "<?xml version=\"1.0\"?>{}<Page><ID>7</ID><TagText>abc</TagText></Page><Page><TagText>x</TagText></Page><Page><ID>8</ID><TagText>never</TagText></Page>",
            PING
        );
        peer.write_all(input.as_bytes()).await.unwrap();

        let report = session.run().await;
        assert!(matches!(report.error, SessionError::MalformedRecord(RecordError::MissingField("ID"))));
        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.stats, SessionStats { records: 1, probes: 1, dropped: 0 });

        // Exactly one acknowledgement, then the connection is shut down.
        let mut written = String::new();
        peer.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, PROBE_RESPONSE);

        assert_eq!(queue.try_dequeue(), Some(Record::new("7", "abc")));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[tokio::test]
    async fn test_one_record_per_page_amid_other_markup() {
        let queue = queue();
        let (session, mut peer) = session_pair(&queue, SessionConfig::default(), 4096);

        let input = "<Envelope><Status>up</Status><Page><ID>1</ID><TagText>a</TagText><Type>x</Type></Page>\
                     <!-- note --><Other><Page-ish/></Other><Page><ID>2</ID><TagText>b</TagText></Page></Envelope>";
        peer.write_all(input.as_bytes()).await.unwrap();
        drop(peer);

        let report = session.run().await;
        assert!(matches!(report.error, SessionError::Disconnected));
        assert_eq!(report.stats.records, 2);
        assert_eq!(queue.try_dequeue(), Some(Record::new("1", "a")));
        assert_eq!(queue.try_dequeue(), Some(Record::new("2", "b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_probe_write_timeout_stops_processing() {
        let queue = queue();
        let config = SessionConfig {
            write_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        // The pipe cannot hold the acknowledgement and the peer never reads it.
        let (session, mut peer) = session_pair(&queue, config, 16);

        let task = tokio::spawn(session.run());
        for chunk in [PING, "<Page><ID>5</ID><TagText>late</TagText></Page>"] {
            // The second write fails once the session has given up on the peer.
            if peer.write_all(chunk.as_bytes()).await.is_err() {
                break;
            }
        }

        let report = task.await.unwrap();
        assert!(matches!(report.error, SessionError::ResponseWrite(ProbeError::Timeout(_))));
        assert_eq!(report.stats, SessionStats::default());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_closes_session() {
        let queue = queue();
        let (session, mut peer) = session_pair(&queue, SessionConfig::default(), 4096);
        peer.write_all(b"<Page><ID>1</ID><TagText>a</TagText></Page></Stray>").await.unwrap();

        let report = session.run().await;
        assert!(matches!(report.error, SessionError::Stream(XmlStreamError::UnexpectedEnd { .. })));
        assert_eq!(report.stats.records, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let queue = queue();
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(30)),
            ..SessionConfig::default()
        };
        let (session, _peer) = session_pair(&queue, config, 4096);
        let report = session.run().await;
        assert!(matches!(report.error, SessionError::IdleTimeout(_)));
    }

    #[tokio::test]
    async fn test_slow_but_active_peer_is_not_idle() {
        let queue = queue();
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..SessionConfig::default()
        };
        let (session, mut peer) = session_pair(&queue, config, 4096);
        let task = tokio::spawn(session.run());

        // The whole page takes far longer than the idle timeout to arrive,
        // but no gap between bytes comes close to it.
        let page = b"<Page><ID>9</ID><TagText>slow</TagText></Page>";
        for chunk in page.chunks(7) {
            peer.write_all(chunk).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        drop(peer);

        let report = task.await.unwrap();
        assert!(matches!(report.error, SessionError::Disconnected));
        assert_eq!(report.stats.records, 1);
        assert_eq!(queue.try_dequeue(), Some(Record::new("9", "slow")));
    }

    #[tokio::test]
    async fn test_idle_inside_page_times_out() {
        let queue = queue();
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..SessionConfig::default()
        };
        let (session, mut peer) = session_pair(&queue, config, 4096);
        peer.write_all(b"<Page><ID>1</ID>").await.unwrap();

        let report = session.run().await;
        assert!(matches!(report.error, SessionError::IdleTimeout(_)));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_closed_queue_ends_session() {
        let queue = queue();
        queue.close();
        let (session, mut peer) = session_pair(&queue, SessionConfig::default(), 4096);
        peer.write_all(b"<Page><ID>1</ID><TagText>a</TagText></Page>").await.unwrap();

        let report = session.run().await;
        assert!(matches!(report.error, SessionError::Queue(QueueError::Closed)));
    }
}
