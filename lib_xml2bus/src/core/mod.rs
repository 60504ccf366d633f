//! # Core Data Module
//!
//! The data that flows from the XML ingestors to the bus publisher:
//!
//! - **`record`**: the two-field `Record` decoded from each `<Page>` element,
//!   the probe pattern and the `"<identifier>;<text>"` wire format.
//! - **`handoff`**: the bounded `HandoffQueue` shared by every connection and
//!   the publisher, with its explicit overflow policy.

/// The decoded page record and its wire format.
pub mod record;
/// The bounded queue between ingestion and publishing.
pub mod handoff;

pub use record::{Record, PROBE_SENTINEL, WIRE_SEPARATOR};
pub use handoff::{EnqueueOutcome, HandoffQueue, OverflowPolicy, QueueError, DEFAULT_QUEUE_CAPACITY};
