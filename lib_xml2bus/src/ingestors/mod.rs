//! # XML Ingestors Module
//!
//! Everything between the TCP port the paging system connects to and the
//! hand-off queue. Each submodule is one stage of a connection's pipeline.
//!
//! ## Contained Modules:
//! - **`xml_stream`**: An incremental tokenizer that turns raw socket bytes
//!   into element and text events, however the peer chunks its writes.
//! - **`page_decoder`**: Builds a `Record` from the events of one `<Page>`.
//! - **`probe`**: Answers the upstream liveness probe with its fixed
//!   acknowledgement.
//! - **`session`**: The per-connection supervisor tying the stages together.
//! - **`listener`**: Accepts connections and spawns one session per peer.

/// Incremental XML event tokenizer.
pub mod xml_stream;
/// `<Page>` element to `Record` decoding.
pub mod page_decoder;
/// Liveness probe detection and acknowledgement.
pub mod probe;
/// Per-connection state machine.
pub mod session;
/// TCP accept loop.
pub mod listener;

pub use listener::{AcceptErrorPolicy, ListenerError, XmlListener, DEFAULT_XML_PORT};
pub use page_decoder::{decode_page, RecordError};
pub use probe::{ProbeError, ProbeResponder, PROBE_RESPONSE};
pub use session::{Session, SessionConfig, SessionError, SessionReport, SessionState, SessionStats};
pub use xml_stream::{XmlEvent, XmlStreamError, XmlTokenizer};
