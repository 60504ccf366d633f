//! # XML Listener
//!
//! Binds the TCP port the paging system connects to and spawns one
//! [`Session`] task per accepted connection. Sessions share nothing but the
//! hand-off queue.
//!
//! Failing to bind is fatal to the caller. What happens on an accept error is
//! set by [`AcceptErrorPolicy`].

use std::fmt;
use std::future::{self, Future};
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::Instrument;

use crate::core::handoff::HandoffQueue;
use crate::ingestors::session::{Session, SessionConfig};

/// Port the upstream paging system connects to by default.
pub const DEFAULT_XML_PORT: u16 = 5051;

/// Pause after a tolerated accept error, so a persistent condition such as
/// descriptor exhaustion does not spin the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind XML listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("error accepting XML connection: {0}")]
    Accept(#[source] io::Error),
}

/// # Accept Error Policy
///
/// - **`Tolerant`** (default): log the error, pause briefly and keep accepting.
/// - **`Strict`**: the first accept error stops the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptErrorPolicy {
    #[default]
    Tolerant,
    Strict,
}

impl FromStr for AcceptErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tolerant" => Ok(AcceptErrorPolicy::Tolerant),
            "strict" => Ok(AcceptErrorPolicy::Strict),
            other => Err(format!("invalid accept error policy '{}': expected 'tolerant' or 'strict'", other)),
        }
    }
}

impl fmt::Display for AcceptErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptErrorPolicy::Tolerant => write!(f, "tolerant"),
            AcceptErrorPolicy::Strict => write!(f, "strict"),
        }
    }
}

/// # XML Listener
///
/// A bound TCP listener plus everything a new session needs.
pub struct XmlListener {
    listener: TcpListener,
    queue: Arc<HandoffQueue>,
    session: SessionConfig,
    accept_errors: AcceptErrorPolicy,
    next_id: u64,
}

impl XmlListener {
    /// Binds `addr` (`host:port`).
    ///
    /// # Errors
    /// [`ListenerError::Bind`] when the address cannot be acquired.
    pub async fn bind(
        addr: &str,
        queue: Arc<HandoffQueue>,
        session: SessionConfig,
        accept_errors: AcceptErrorPolicy,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self {
            listener,
            queue,
            session,
            accept_errors,
            next_id: 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever.
    pub async fn run(self) -> Result<(), ListenerError> {
        self.serve_until(future::pending()).await
    }

    /// # Serve Until
    ///
    /// Accepts connections until `shutdown` completes. Sessions already
    /// running are not cancelled; they end through their own error paths or
    /// when the runtime stops.
    ///
    /// # Errors
    /// [`ListenerError::Accept`] on an accept error under the `Strict` policy.
    pub async fn serve_until<F>(mut self, shutdown: F) -> Result<(), ListenerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("XML listener stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => self.dispatch(socket, peer),
                    Err(e) => match self.accept_errors {
                        AcceptErrorPolicy::Strict => {
                            tracing::error!("Error accepting: {}", e);
                            return Err(ListenerError::Accept(e));
                        }
                        AcceptErrorPolicy::Tolerant => {
                            tracing::warn!("Error accepting: {}, continuing", e);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                },
            }
        }
    }

    fn dispatch(&mut self, socket: tokio::net::TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        tracing::info!("Accepted XML connection {} from {}", id, peer);

        let session = Session::from_tcp(id, socket, Arc::clone(&self.queue), &self.session);
        tokio::spawn(session.run().instrument(tracing::info_span!("session", id, %peer)));
    }
}
