//! # Probe Responder
//!
//! The upstream paging system checks liveness by sending an ordinary `<Page>`
//! whose `ID` is empty and whose `TagText` is `___PING___`. It expects a fixed
//! acknowledgement document back on the same connection. Probes are answered
//! here and never reach the hand-off queue.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::core::record::Record;

/// Acknowledgement written verbatim in answer to a probe.
pub const PROBE_RESPONSE: &str =
    "<?xml version=\"1.0\" encoding=\"utf-8\"?> <PageTXSrvResp State=\"7\" PagesInQueue=\"0\" PageOK=\"1\" />";

/// Deadline for writing the acknowledgement.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Failure to deliver a probe acknowledgement. Fatal for the connection.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe response not written within {0:?}")]
    Timeout(Duration),

    #[error("failed to write probe response: {0}")]
    Io(#[from] io::Error),
}

/// # Probe Responder
///
/// Writes the acknowledgement under a deadline that starts when the write is
/// attempted, not when the connection was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResponder {
    write_timeout: Duration,
}

impl Default for ProbeResponder {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT)
    }
}

impl ProbeResponder {
    pub fn new(write_timeout: Duration) -> Self {
        Self { write_timeout }
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// # Intercept
    ///
    /// Answers `record` if it is a probe and consumes it. Any other record is
    /// handed back untouched for the hand-off queue.
    pub async fn intercept<W>(&self, record: Record, writer: &mut W) -> Result<Option<Record>, ProbeError>
    where
        W: AsyncWrite + Unpin,
    {
        if !record.is_probe() {
            return Ok(Some(record));
        }
        tracing::info!("Responding:{}", PROBE_RESPONSE);
        self.respond(writer).await?;
        Ok(None)
    }

    /// Writes and flushes the acknowledgement within the write deadline.
    pub async fn respond<W>(&self, writer: &mut W) -> Result<(), ProbeError>
    where
        W: AsyncWrite + Unpin,
    {
        let write = async {
            writer.write_all(PROBE_RESPONSE.as_bytes()).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(ProbeError::Io),
            Err(_) => Err(ProbeError::Timeout(self.write_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::PROBE_SENTINEL;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_probe_is_answered_and_consumed() {
        let (mut ours, mut peer) = tokio::io::duplex(1024);
        let responder = ProbeResponder::default();

        let passed = responder.intercept(Record::new("", PROBE_SENTINEL), &mut ours).await.unwrap();
        assert_eq!(passed, None);

        let mut received = vec![0u8; PROBE_RESPONSE.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, PROBE_RESPONSE.as_bytes());
    }

    #[tokio::test]
    async fn test_other_records_pass_through_silently() {
        let (mut ours, mut peer) = tokio::io::duplex(1024);
        let responder = ProbeResponder::default();

        let record = Record::new("7", PROBE_SENTINEL);
        let passed = responder.intercept(record.clone(), &mut ours).await.unwrap();
        assert_eq!(passed, Some(record));

        drop(ours);
        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_write_deadline_exceeded() {
        // The peer never reads and the pipe holds less than one response.
        let (mut ours, _peer) = tokio::io::duplex(8);
        let responder = ProbeResponder::new(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let err = responder.respond(&mut ours).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(t) if t == Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_fails() {
        let (mut ours, peer) = tokio::io::duplex(1024);
        drop(peer);
        let err = ProbeResponder::default().respond(&mut ours).await.unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
    }
}
