//! # Page Record
//!
//! The two-field unit of work extracted from one `<Page>` element. A `Record`
//! is built once by the page decoder and then moved into exactly one sink:
//! the probe responder (when it is a liveness probe) or the hand-off queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// `TagText` value the upstream paging system uses for liveness probes.
pub const PROBE_SENTINEL: &str = "___PING___";

/// Separator between identifier and text in the publisher wire format.
pub const WIRE_SEPARATOR: char = ';';

/// # Record
///
/// One decoded `Page` element. The upstream message also carries a `Type`
/// field which is deliberately not extracted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    /// Content of the `ID` child (the pager pin). May be empty.
    pub identifier: String,
    /// Content of the `TagText` child (the message body).
    pub text: String,
}

impl Record {
    /// Creates a record from its two fields.
    pub fn new(identifier: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            text: text.into(),
        }
    }

    /// Returns `true` for the reserved liveness probe: an empty identifier and
    /// the sentinel text. Probes must never reach the hand-off queue.
    pub fn is_probe(&self) -> bool {
        self.identifier.is_empty() && self.text == PROBE_SENTINEL
    }

    /// Serializes the record as `"<identifier>;<text>"`, the format the
    /// downstream publisher depends on.
    pub fn to_wire(&self) -> String {
        let mut wire = String::with_capacity(self.identifier.len() + self.text.len() + 1);
        wire.push_str(&self.identifier);
        wire.push(WIRE_SEPARATOR);
        wire.push_str(&self.text);
        wire
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin:{};Msg:{}", self.identifier, self.text)
    }
}
