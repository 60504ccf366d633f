//! # Incremental XML Token Stream
//!
//! Tokenizer for an XML byte stream that never ends. The upstream paging system
//! keeps its connection open forever and writes one `<Page>` element after the
//! other, so there is never a complete document to hand to a DOM parser. The
//! [`XmlTokenizer`] is a `tokio_util::codec::Decoder`: wrapped in a
//! `FramedRead`, it turns the socket into a `Stream` of [`XmlEvent`]s and
//! yields each event as soon as the bytes that complete it have arrived.
//!
//! ## Markup handled
//!
//! - Start tags (attributes are syntax-checked and discarded), self-closing tags
//!   (reported as `Start` then `End`) and end tags, which must match the
//!   innermost open element.
//! - Character data with the predefined entities and character references,
//!   `\r\n` normalised to `\n`. CDATA sections are reported as text.
//! - Comments, processing instructions and `<!...>` declarations are skipped.
//!   An XML declaration naming a non UTF-8 encoding is rejected.
//!
//! Element names are reported by local name only: `<ns:Page>` is `Page`.
//! There is no namespace resolution.
//!
//! ## Errors
//!
//! Every error is terminal for the connection. The tokenizer never tries to
//! resynchronise a corrupted stream.

use std::borrow::Cow;
use std::io;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Largest single token (tag, text run, comment...) accepted by default.
pub const DEFAULT_MAX_TOKEN_LEN: usize = 1024 * 1024;

/// Deepest element nesting accepted before the stream is rejected.
pub const MAX_DEPTH: usize = 256;

/// One structural event in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    /// An element opened. `name` is the local name.
    Start { name: String },
    /// An element closed. `name` is the local name.
    End { name: String },
    /// Character data, entity references resolved.
    Text(String),
}

/// Terminal conditions of an XML byte stream.
#[derive(Debug, Error)]
pub enum XmlStreamError {
    #[error("I/O error on XML stream: {0}")]
    Io(#[from] io::Error),

    #[error("XML syntax error at byte {offset}: {message}")]
    Syntax { offset: u64, message: String },

    #[error("invalid UTF-8 at byte {offset}")]
    InvalidUtf8 { offset: u64 },

    #[error("element <{expected}> closed by </{found}> at byte {offset}")]
    MismatchedEnd { expected: String, found: String, offset: u64 },

    #[error("unexpected end element </{name}> at byte {offset}")]
    UnexpectedEnd { name: String, offset: u64 },

    #[error("unsupported XML encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("XML token exceeds {limit} bytes")]
    TokenTooLarge { limit: usize },

    #[error("XML stream ended inside a token")]
    UnexpectedEof,
}

/// Outcome of scanning the front of the buffer.
enum Scan {
    /// The token at the front is not complete yet.
    Incomplete,
    /// Consume `n` bytes without emitting anything.
    Skip(usize),
    /// Consume `n` bytes and emit the event.
    Emit(usize, XmlEvent),
}

/// Where to pick up scanning an incomplete token once more bytes arrive.
/// Without it every read would rescan the token from its first byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Resume {
    /// Bytes of the token already searched for its terminator.
    offset: usize,
    /// Open quote character at `offset`, for tags and declarations.
    quote: Option<u8>,
    /// Open `[` nesting at `offset`, for declarations.
    brackets: usize,
}

/// # XML Tokenizer
///
/// Per-connection tokenizer state: the stack of open elements, a pending end
/// event for self-closing tags, and the count of bytes consumed so far (used
/// for error offsets).
#[derive(Debug)]
pub struct XmlTokenizer {
    open: Vec<String>,
    pending_end: Option<String>,
    consumed: u64,
    max_token_len: usize,
    resume: Resume,
}

impl Default for XmlTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlTokenizer {
    /// Creates a tokenizer with the default token size limit.
    pub fn new() -> Self {
        Self::with_max_token_len(DEFAULT_MAX_TOKEN_LEN)
    }

    /// Creates a tokenizer rejecting any single token longer than `limit` bytes.
    pub fn with_max_token_len(limit: usize) -> Self {
        Self {
            open: Vec::new(),
            pending_end: None,
            consumed: 0,
            max_token_len: limit.max(1),
            resume: Resume::default(),
        }
    }

    /// Number of currently open elements.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Bytes consumed from the stream so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn syntax(&self, message: impl Into<String>) -> XmlStreamError {
        XmlStreamError::Syntax {
            offset: self.consumed,
            message: message.into(),
        }
    }

    fn utf8<'a>(&self, raw: &'a [u8], base: usize) -> Result<&'a str, XmlStreamError> {
        std::str::from_utf8(raw).map_err(|e| XmlStreamError::InvalidUtf8 {
            offset: self.consumed + (base + e.valid_up_to()) as u64,
        })
    }

    fn scan(&mut self, buf: &[u8]) -> Result<Scan, XmlStreamError> {
        if buf[0] == b'<' {
            self.scan_markup(buf)
        } else {
            self.scan_text(buf)
        }
    }

    fn scan_text(&mut self, buf: &[u8]) -> Result<Scan, XmlStreamError> {
        // A text run ends at the next markup; until it shows up the run may grow.
        let Some(end) = find_byte(buf, b'<', &mut self.resume, 0) else {
            return Ok(Scan::Incomplete);
        };
        let raw = self.utf8(&buf[..end], 0)?;
        if self.open.is_empty() && raw.trim().is_empty() {
            return Ok(Scan::Skip(end));
        }
        let text = unescape(raw).map_err(|message| self.syntax(message))?;
        Ok(Scan::Emit(end, XmlEvent::Text(normalize_newlines(text).into_owned())))
    }

    fn scan_markup(&mut self, buf: &[u8]) -> Result<Scan, XmlStreamError> {
        if buf.len() < 2 {
            return Ok(Scan::Incomplete);
        }
        match buf[1] {
            b'/' => self.scan_end_tag(buf),
            b'?' => self.scan_processing_instruction(buf),
            b'!' => self.scan_bang(buf),
            _ => self.scan_start_tag(buf),
        }
    }

    fn scan_start_tag(&mut self, buf: &[u8]) -> Result<Scan, XmlStreamError> {
        let Some(gt) = find_tag_end(buf, &mut self.resume, 1) else {
            return Ok(Scan::Incomplete);
        };
        let body = self.utf8(&buf[1..gt], 1)?;
        let (body, self_closing) = match body.strip_suffix('/') {
            Some(inner) => (inner, true),
            None => (body, false),
        };
        let qualified = parse_start_tag(body).map_err(|message| self.syntax(message))?;
        let name = local_name(qualified).to_string();

        if self_closing {
            self.pending_end = Some(name.clone());
        } else {
            if self.open.len() >= MAX_DEPTH {
                return Err(self.syntax(format!("element nesting deeper than {}", MAX_DEPTH)));
            }
            self.open.push(qualified.to_string());
        }
        Ok(Scan::Emit(gt + 1, XmlEvent::Start { name }))
    }

    fn scan_end_tag(&mut self, buf: &[u8]) -> Result<Scan, XmlStreamError> {
        let Some(gt) = find_byte(buf, b'>', &mut self.resume, 2) else {
            return Ok(Scan::Incomplete);
        };
        let qualified = self.utf8(&buf[2..gt], 2)?.trim_end();
        if !is_name(qualified) {
            return Err(self.syntax(format!("invalid end element name {:?}", qualified)));
        }
        match self.open.pop() {
            None => Err(XmlStreamError::UnexpectedEnd {
                name: qualified.to_string(),
                offset: self.consumed,
            }),
            Some(expected) if expected != qualified => Err(XmlStreamError::MismatchedEnd {
                expected,
                found: qualified.to_string(),
                offset: self.consumed,
            }),
            Some(_) => Ok(Scan::Emit(
                gt + 1,
                XmlEvent::End {
                    name: local_name(qualified).to_string(),
                },
            )),
        }
    }

    fn scan_processing_instruction(&mut self, buf: &[u8]) -> Result<Scan, XmlStreamError> {
        let Some(close) = find_resumable(buf, b"?>", &mut self.resume, 2) else {
            return Ok(Scan::Incomplete);
        };
        let body = self.utf8(&buf[2..close], 2)?;
        let target = body.split(|c: char| c.is_whitespace()).next().unwrap_or_default();
        if !is_name(target) {
            return Err(self.syntax("processing instruction without a valid target"));
        }
        if target == "xml" {
            if let Some(encoding) = pseudo_attribute(&body[target.len()..], "encoding") {
                if !encoding.eq_ignore_ascii_case("utf-8") {
                    return Err(XmlStreamError::UnsupportedEncoding(encoding.to_string()));
                }
            }
        }
        Ok(Scan::Skip(close + 2))
    }

    fn scan_bang(&mut self, buf: &[u8]) -> Result<Scan, XmlStreamError> {
        const COMMENT: &[u8] = b"<!--";
        const CDATA: &[u8] = b"<![CDATA[";

        // Too short to tell a comment or CDATA section from a declaration.
        if (buf.len() < COMMENT.len() && COMMENT.starts_with(buf))
            || (buf.len() < CDATA.len() && CDATA.starts_with(buf))
        {
            return Ok(Scan::Incomplete);
        }

        if buf.starts_with(COMMENT) {
            let Some(dashes) = find_resumable(buf, b"--", &mut self.resume, COMMENT.len()) else {
                return Ok(Scan::Incomplete);
            };
            return match buf.get(dashes + 2) {
                None => {
                    self.resume.offset = dashes;
                    Ok(Scan::Incomplete)
                }
                Some(b'>') => Ok(Scan::Skip(dashes + 3)),
                Some(_) => Err(self.syntax("invalid sequence \"--\" in comment")),
            };
        }

        if buf.starts_with(CDATA) {
            let Some(close) = find_resumable(buf, b"]]>", &mut self.resume, CDATA.len()) else {
                return Ok(Scan::Incomplete);
            };
            let text = self.utf8(&buf[CDATA.len()..close], CDATA.len())?;
            return Ok(Scan::Emit(close + 3, XmlEvent::Text(normalize_newlines(Cow::Borrowed(text)).into_owned())));
        }

        if buf.get(2) == Some(&b'[') {
            return Err(self.syntax("invalid <![ section"));
        }

        match find_declaration_end(buf, &mut self.resume, 2) {
            Some(gt) => Ok(Scan::Skip(gt + 1)),
            None => Ok(Scan::Incomplete),
        }
    }
}

impl Decoder for XmlTokenizer {
    type Item = XmlEvent;
    type Error = XmlStreamError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<XmlEvent>, XmlStreamError> {
        if let Some(name) = self.pending_end.take() {
            return Ok(Some(XmlEvent::End { name }));
        }
        loop {
            if buf.is_empty() {
                return Ok(None);
            }
            match self.scan(buf)? {
                Scan::Incomplete => {
                    if buf.len() > self.max_token_len {
                        return Err(XmlStreamError::TokenTooLarge {
                            limit: self.max_token_len,
                        });
                    }
                    return Ok(None);
                }
                Scan::Skip(n) => {
                    self.resume = Resume::default();
                    buf.advance(n);
                    self.consumed += n as u64;
                }
                Scan::Emit(n, event) => {
                    self.resume = Resume::default();
                    buf.advance(n);
                    self.consumed += n as u64;
                    return Ok(Some(event));
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<XmlEvent>, XmlStreamError> {
        if let Some(event) = self.decode(buf)? {
            return Ok(Some(event));
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            buf.clear();
            Ok(None)
        } else {
            Err(XmlStreamError::UnexpectedEof)
        }
    }
}

/// Local part of a qualified name: `ns:Page` -> `Page`.
pub fn local_name(qualified: &str) -> &str {
    match qualified.split_once(':') {
        Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => local,
        _ => qualified,
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == ':' || !c.is_ascii()
}

fn is_name_char(c: char) -> bool {
    is_name_start(c) || c.is_ascii_digit() || c == '-' || c == '.'
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) if is_name_start(first) => chars.all(is_name_char),
        _ => false,
    }
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r') || (c >= ' ' && c != '\u{FFFE}' && c != '\u{FFFF}')
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < from + needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// First `byte` at or after `from`, resuming where the last miss stopped.
fn find_byte(buf: &[u8], byte: u8, resume: &mut Resume, from: usize) -> Option<usize> {
    let start = resume.offset.max(from).min(buf.len());
    match buf[start..].iter().position(|&b| b == byte) {
        Some(pos) => Some(start + pos),
        None => {
            resume.offset = buf.len();
            None
        }
    }
}

/// Like [`find`], but a miss records how far the search got. The last
/// `needle.len() - 1` bytes are searched again as they may start a match.
fn find_resumable(buf: &[u8], needle: &[u8], resume: &mut Resume, from: usize) -> Option<usize> {
    let found = find(buf, needle, resume.offset.max(from));
    if found.is_none() {
        resume.offset = buf.len().saturating_sub(needle.len() - 1).max(from);
    }
    found
}

/// Position of the `>` closing a tag, skipping quoted attribute values.
fn find_tag_end(buf: &[u8], resume: &mut Resume, from: usize) -> Option<usize> {
    let mut quote = resume.quote;
    for (i, &b) in buf.iter().enumerate().skip(resume.offset.max(from)) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    resume.offset = buf.len();
    resume.quote = quote;
    None
}

/// Position of the `>` closing a `<!...>` declaration, skipping quoted
/// literals and a bracketed internal subset.
fn find_declaration_end(buf: &[u8], resume: &mut Resume, from: usize) -> Option<usize> {
    let mut quote = resume.quote;
    let mut depth = resume.brackets;
    for (i, &b) in buf.iter().enumerate().skip(resume.offset.max(from)) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b'>' if depth == 0 => return Some(i),
                _ => {}
            },
        }
    }
    resume.offset = buf.len();
    resume.quote = quote;
    resume.brackets = depth;
    None
}

/// Validates a start tag body (without `<`, `>` and a trailing `/`) and
/// returns the qualified element name.
fn parse_start_tag(body: &str) -> Result<&str, String> {
    let name_end = body.find(char::is_whitespace).unwrap_or(body.len());
    let name = &body[..name_end];
    if !is_name(name) {
        return Err(format!("invalid element name {:?}", name));
    }

    let mut rest = &body[name_end..];
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(name);
        }
        let eq = rest
            .find('=')
            .ok_or_else(|| format!("attribute without value in element <{}>", name))?;
        let attr = rest[..eq].trim_end();
        if !is_name(attr) {
            return Err(format!("invalid attribute name {:?} in element <{}>", attr, name));
        }
        let value_part = rest[eq + 1..].trim_start();
        let quote = value_part
            .chars()
            .next()
            .filter(|c| *c == '"' || *c == '\'')
            .ok_or_else(|| format!("unquoted or missing attribute value in element <{}>", name))?;
        let close = value_part[1..]
            .find(quote)
            .ok_or_else(|| format!("unterminated attribute value in element <{}>", name))?;
        let value = &value_part[1..1 + close];
        if value.contains('<') {
            return Err(format!("unescaped < in attribute value of element <{}>", name));
        }
        unescape(value)?;
        rest = &value_part[close + 2..];
    }
}

/// Value of `key="..."` inside an XML declaration.
fn pseudo_attribute<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    let start = content.find(key)? + key.len();
    let rest = content[start..].trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(&rest[..end])
}

/// Resolves entity and character references in character data.
fn unescape(raw: &str) -> Result<Cow<'_, str>, String> {
    if let Some(bad) = raw.chars().find(|c| !is_xml_char(*c)) {
        return Err(format!("illegal character code {:#06x}", bad as u32));
    }
    if !raw.contains('&') {
        return Ok(Cow::Borrowed(raw));
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| "unterminated entity reference".to_string())?;
        let entity = &after[..semi];
        let resolved = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "apos" => Some('\''),
            "quot" => Some('"'),
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32).filter(|c| is_xml_char(*c))
            }
        };
        let ch = resolved.ok_or_else(|| format!("invalid character entity &{};", entity))?;
        out.push(ch);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(Cow::Owned(out))
}

fn normalize_newlines(text: Cow<'_, str>) -> Cow<'_, str> {
    if text.contains('\r') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        text
    }
}
