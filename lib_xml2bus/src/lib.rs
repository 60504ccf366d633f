//! # lib_xml2bus
//!
//! Receives paging records as a continuous XML stream over TCP and queues
//! them for a message-bus publisher.
//!
//! - **`core`**: the `Record` type and the bounded hand-off queue.
//! - **`ingestors`**: the TCP listener, per-connection sessions and the
//!   streaming XML decoding they run.

#![forbid(unsafe_code)]

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "ingestors")]
pub mod ingestors;
