//! # Page Decoder
//!
//! Materialises a [`Record`] from the events of one `<Page>` element. The
//! decoder is handed the event stream right after the `Page` start event and
//! consumes events up to and including the matching end event, never beyond:
//! sibling elements that follow stay in the stream for the supervisor.
//!
//! Only the direct children `ID` and `TagText` are read. Any other child (the
//! upstream also sends `Type`) is skipped, as is character data of nested
//! grandchildren. A repeated field keeps its last value.

use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::core::record::Record;
use crate::ingestors::xml_stream::{XmlEvent, XmlStreamError};

/// Local name of the element carrying one record.
pub const PAGE_ELEMENT: &str = "Page";
/// Child element holding the record identifier.
pub const ID_ELEMENT: &str = "ID";
/// Child element holding the record text.
pub const TEXT_ELEMENT: &str = "TagText";

/// Reasons a `<Page>` element cannot become a record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("<Page> element has no <{0}> child")]
    MissingField(&'static str),

    #[error("stream ended inside <Page> element")]
    Truncated,

    #[error("malformed <Page> element: {0}")]
    Stream(#[from] XmlStreamError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Identifier,
    Text,
}

impl Field {
    fn from_element(name: &str) -> Option<Self> {
        match name {
            ID_ELEMENT => Some(Field::Identifier),
            TEXT_ELEMENT => Some(Field::Text),
            _ => None,
        }
    }
}

/// # Decode Page
///
/// Reads events until the current `Page` element closes and returns the
/// record it holds.
///
/// The error type is the stream's own, so callers can layer their own
/// failures (a per-event deadline, say) onto the event stream and get them
/// back unchanged.
///
/// # Errors
/// - [`RecordError::MissingField`] when `ID` or `TagText` is absent.
/// - [`RecordError::Truncated`] when the stream ends before `</Page>`.
/// - Any error item yielded by `events`.
pub async fn decode_page<S, E>(events: &mut S) -> Result<Record, E>
where
    S: Stream<Item = Result<XmlEvent, E>> + Unpin,
    E: From<RecordError>,
{
    let mut identifier: Option<String> = None;
    let mut text: Option<String> = None;
    // Depth below <Page>: 0 between children, 1 inside a direct child.
    let mut depth = 0usize;
    let mut capture: Option<(Field, String)> = None;

    loop {
        let event = match events.next().await {
            Some(event) => event?,
            None => return Err(RecordError::Truncated.into()),
        };

        match event {
            XmlEvent::Start { name } => {
                if depth == 0 {
                    capture = Field::from_element(&name).map(|field| (field, String::new()));
                }
                depth += 1;
            }
            XmlEvent::Text(data) => {
                if depth == 1 {
                    if let Some((_, value)) = capture.as_mut() {
                        value.push_str(&data);
                    }
                }
            }
            XmlEvent::End { .. } => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
                if depth == 0 {
                    match capture.take() {
                        Some((Field::Identifier, value)) => identifier = Some(value),
                        Some((Field::Text, value)) => text = Some(value),
                        None => {}
                    }
                }
            }
        }
    }

    let identifier = identifier.ok_or(RecordError::MissingField(ID_ELEMENT))?;
    let text = text.ok_or(RecordError::MissingField(TEXT_ELEMENT))?;
    Ok(Record::new(identifier, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::xml_stream::XmlTokenizer;
    use futures_util::{stream, TryStreamExt};
    use tokio_util::codec::FramedRead;

    /// Tokenizes `input`, skips to the first `Page` start and decodes it.
    /// Returns the decoded record and the next event left in the stream.
    async fn decode_from(input: &'static str) -> (Result<Record, RecordError>, Option<XmlEvent>) {
        let mut events = FramedRead::new(input.as_bytes(), XmlTokenizer::new()).map_err(RecordError::from);
        loop {
            match events.next().await {
                Some(Ok(XmlEvent::Start { name })) if name == PAGE_ELEMENT => break,
                Some(Ok(_)) => continue,
                other => panic!("no <Page> in input: {:?}", other),
            }
        }
        let result = decode_page(&mut events).await;
        let next = events.next().await.and_then(Result::ok);
        (result, next)
    }

    #[tokio::test]
    async fn test_decodes_both_fields() {
        let (record, _) = decode_from("<Page><ID>42</ID><TagText>hello</TagText></Page>").await;
        assert_eq!(record.unwrap(), Record::new("42", "hello"));
    }

    #[tokio::test]
    async fn test_field_order_and_unknown_children() {
        let input = "<Page><Type>1</Type><TagText>Code blue</TagText><Extra><ID>9</ID></Extra><ID>7</ID></Page>";
        let (record, _) = decode_from(input).await;
        // <ID> nested inside <Extra> is not a direct child and is ignored.
        assert_eq!(record.unwrap(), Record::new("7", "Code blue"));
    }

    #[tokio::test]
    async fn test_empty_and_self_closing_fields() {
        let (record, _) = decode_from("<Page><ID/><TagText>___PING___</TagText></Page>").await;
        let record = record.unwrap();
        assert_eq!(record, Record::new("", "___PING___"));
        assert!(record.is_probe());

        let (record, _) = decode_from("<Page><ID></ID><TagText></TagText></Page>").await;
        assert_eq!(record.unwrap(), Record::new("", ""));
    }

    #[tokio::test]
    async fn test_grandchild_text_ignored_and_repeat_keeps_last() {
        let input = "<Page><ID>1</ID><ID>2</ID><TagText>a<b>skip</b>c<![CDATA[&d]]></TagText></Page>";
        let (record, _) = decode_from(input).await;
        assert_eq!(record.unwrap(), Record::new("2", "ac&d"));
    }

    #[tokio::test]
    async fn test_stops_at_page_end() {
        let (record, next) = decode_from("<Page><ID>1</ID><TagText>x</TagText></Page><Page>").await;
        assert_eq!(record.unwrap(), Record::new("1", "x"));
        assert_eq!(next, Some(XmlEvent::Start { name: PAGE_ELEMENT.to_string() }));
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let (record, _) = decode_from("<Page><TagText>x</TagText></Page>").await;
        assert!(matches!(record, Err(RecordError::MissingField("ID"))));

        let (record, _) = decode_from("<Page><ID>3</ID></Page>").await;
        assert!(matches!(record, Err(RecordError::MissingField("TagText"))));
    }

    #[tokio::test]
    async fn test_malformed_and_truncated() {
        let (record, _) = decode_from("<Page><ID>1</TagText></Page>").await;
        assert!(matches!(record, Err(RecordError::Stream(XmlStreamError::MismatchedEnd { .. }))));

        let mut events = stream::iter(vec![
            Ok::<_, RecordError>(XmlEvent::Start { name: ID_ELEMENT.to_string() }),
            Ok(XmlEvent::Text("1".to_string())),
        ]);
        assert!(matches!(decode_page(&mut events).await, Err(RecordError::Truncated)));
    }
}
