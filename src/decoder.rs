//! Byte-stream decoder
//!
//! Turns the raw chunks of a streaming response body into [`StreamEvent`]s.
//! Framing is handled by [`EventRecordCodec`] over a `FramedRead`, so a record
//! may arrive split across any number of transport chunks. Each record is then
//! decoded by [`RecordDecoder`], which never fails: anything it cannot make
//! sense of becomes literal text.

use crate::constants::{
    AGENT_DELIBERATING_SENTINEL, DEFAULT_EVENT_PREFIX, IGNORE_SENTINELS, KNOWN_PAYLOAD_TAGS,
    LOADER_END_SENTINEL, LOADER_START_SENTINEL, MAX_PENDING_PAYLOAD_RECORDS, MAX_RECORD_BYTES,
    TERMINAL_TOKENS,
};
use crate::json_repair::{is_json_complete, parse_payload_value};
use crate::types::{ControlMarker, ParleyError, PayloadKind, Result, StreamEvent};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Prefixes, sentinels and payload tags the decoder recognizes.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub event_prefix: String,
    pub terminal_tokens: Vec<String>,
    pub sentinels: Vec<(String, ControlMarker)>,
    pub payload_tags: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        let mut sentinels = vec![
            (LOADER_START_SENTINEL.to_string(), ControlMarker::LoaderStart),
            (LOADER_END_SENTINEL.to_string(), ControlMarker::LoaderEnd),
            (
                AGENT_DELIBERATING_SENTINEL.to_string(),
                ControlMarker::AgentDeliberating,
            ),
        ];
        sentinels.extend(
            IGNORE_SENTINELS
                .iter()
                .map(|s| (s.to_string(), ControlMarker::Ignore)),
        );

        Self {
            event_prefix: DEFAULT_EVENT_PREFIX.to_string(),
            terminal_tokens: TERMINAL_TOKENS.iter().map(|s| s.to_string()).collect(),
            sentinels,
            payload_tags: KNOWN_PAYLOAD_TAGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DecoderConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.event_prefix = prefix.into();
        self
    }

    fn marker_for(&self, body: &str) -> Option<ControlMarker> {
        let trimmed = body.trim();
        if self.terminal_tokens.iter().any(|t| t == trimmed) {
            return Some(ControlMarker::Done);
        }
        self.sentinels
            .iter()
            .find(|(s, _)| s == trimmed)
            .map(|(_, m)| *m)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordCodecError {
    #[error("record exceeded {0} bytes without a delimiter")]
    MaxRecordLengthExceeded(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<RecordCodecError> for ParleyError {
    fn from(e: RecordCodecError) -> Self {
        match e {
            RecordCodecError::Io(io) => ParleyError::Io(io),
            other => ParleyError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

/// Frames event records. A record ends at a newline or where the next event
/// prefix begins, whichever comes first. Both delimiters are decided only once
/// fully buffered, so the output does not depend on chunk boundaries.
pub struct EventRecordCodec {
    prefix: Vec<u8>,
    max_length: usize,
}

impl EventRecordCodec {
    pub fn new(prefix: &str, max_length: usize) -> Self {
        Self {
            prefix: prefix.as_bytes().to_vec(),
            max_length,
        }
    }

    fn next_boundary(&self, buf: &[u8]) -> Option<(usize, usize)> {
        let newline = buf.iter().position(|b| *b == b'\n');
        let next_prefix = if self.prefix.is_empty() || buf.len() <= self.prefix.len() {
            None
        } else {
            buf[1..]
                .windows(self.prefix.len())
                .position(|w| w == self.prefix.as_slice())
                .map(|p| p + 1)
        };

        match (newline, next_prefix) {
            (Some(n), Some(p)) if p < n => Some((p, 0)),
            (Some(n), _) => Some((n, 1)),
            (None, Some(p)) => Some((p, 0)),
            (None, None) => None,
        }
    }

    fn take_record(buf: &mut BytesMut, end: usize, skip: usize) -> String {
        let raw = buf.split_to(end);
        buf.advance(skip);
        let mut record = String::from_utf8_lossy(&raw).into_owned();
        if record.ends_with('\r') {
            record.pop();
        }
        record
    }
}

impl Decoder for EventRecordCodec {
    type Item = String;
    type Error = RecordCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, Self::Error> {
        match self.next_boundary(buf) {
            Some((end, skip)) => Ok(Some(Self::take_record(buf, end, skip))),
            None if buf.len() > self.max_length => {
                Err(RecordCodecError::MaxRecordLengthExceeded(self.max_length))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, Self::Error> {
        if let Some(record) = self.decode(buf)? {
            return Ok(Some(record));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let len = buf.len();
        Ok(Some(Self::take_record(buf, len, 0)))
    }
}

struct PendingPayload {
    /// `None` when the payload was guessed from a leading brace only.
    tag: Option<String>,
    buffer: String,
    records: Vec<String>,
}

/// Decodes framed records into events, carrying payloads that straddle
/// several records.
pub struct RecordDecoder {
    config: DecoderConfig,
    pending: Option<PendingPayload>,
}

impl RecordDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self {
            config,
            pending: None,
        }
    }

    pub fn decode_record(&mut self, record: &str) -> Vec<StreamEvent> {
        let body = match self.strip_prefix(record) {
            Some(b) => b,
            None => {
                if !record.trim().is_empty() {
                    tracing::trace!("[☁️  -> ⚙️ ] Dropping unprefixed record ({} bytes)", record.len());
                }
                return Vec::new();
            }
        };

        // A marker ends any payload still being accumulated.
        if let Some(marker) = self.config.marker_for(body) {
            let mut events = self.finish();
            events.push(StreamEvent::ControlMarker(marker));
            return events;
        }

        if self.pending.is_some() {
            return self.continue_pending(body);
        }

        if let Some(events) = self.try_structured(body) {
            return events;
        }

        text_event(body).into_iter().collect()
    }

    /// Flushes the pending payload, at a marker or once the byte stream is
    /// exhausted. Tagged payloads that never completed are discarded;
    /// brace-guessed ones fall back to text.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        match self.pending.take() {
            Some(PendingPayload { tag: Some(tag), records, .. }) => {
                tracing::warn!(
                    "[☁️  -> ⚙️ ] Discarding unfinished '{}' payload spanning {} records",
                    tag,
                    records.len()
                );
                Vec::new()
            }
            Some(PendingPayload { tag: None, records, .. }) => literal_records(&records),
            None => Vec::new(),
        }
    }

    fn strip_prefix<'a>(&self, record: &'a str) -> Option<&'a str> {
        let prefix = self.config.event_prefix.as_str();
        if let Some(body) = record.strip_prefix(prefix) {
            return Some(body);
        }
        let bare = prefix.trim_end();
        if bare.len() < prefix.len() {
            return record.strip_prefix(bare);
        }
        None
    }

    fn continue_pending(&mut self, body: &str) -> Vec<StreamEvent> {
        let Some(mut pending) = self.pending.take() else {
            return Vec::new();
        };
        pending.records.push(body.to_string());
        match crate::str_utils::first_bracket_offset(body) {
            Some(offset) if pending.buffer.is_empty() => pending.buffer.push_str(&body[offset..]),
            _ => pending.buffer.push_str(body),
        }

        if pending.buffer.is_empty() || !is_json_complete(&pending.buffer) {
            if pending.records.len() >= MAX_PENDING_PAYLOAD_RECORDS {
                tracing::warn!(
                    "[☁️  -> ⚙️ ] Payload exceeded {} records; treating as text",
                    MAX_PENDING_PAYLOAD_RECORDS
                );
                return literal_records(&pending.records);
            }
            self.pending = Some(pending);
            return Vec::new();
        }

        match parse_payload_value(&pending.buffer) {
            Some(value) => match pending.tag {
                Some(tag) => vec![StreamEvent::StructuredPayload(PayloadKind::from_tag(&tag), value)],
                None => match value {
                    Value::Object(map) => classify_object(map),
                    _ => literal_records(&pending.records),
                },
            },
            None => literal_records(&pending.records),
        }
    }

    fn try_structured(&mut self, body: &str) -> Option<Vec<StreamEvent>> {
        let trimmed = body.trim_start();

        if trimmed.starts_with('{') {
            if !is_json_complete(trimmed) {
                self.pending = Some(PendingPayload {
                    tag: None,
                    buffer: trimmed.to_string(),
                    records: vec![body.to_string()],
                });
                return Some(Vec::new());
            }
            if let Some(Value::Object(map)) = parse_payload_value(trimmed) {
                return Some(classify_object(map));
            }
            return None;
        }

        let (text_end, tag, value_start) = self.find_inline_tag(body)?;
        let leading_text = body[..text_end].strip_suffix(',').unwrap_or(&body[..text_end]);
        let raw_value = &body[value_start..];

        let mut events = Vec::new();
        match crate::str_utils::first_bracket_offset(raw_value) {
            Some(offset) => {
                let candidate = &raw_value[offset..];
                if is_json_complete(candidate) {
                    let value = parse_payload_value(candidate)?;
                    events.push(StreamEvent::StructuredPayload(PayloadKind::from_tag(&tag), value));
                } else {
                    self.pending = Some(PendingPayload {
                        tag: Some(tag),
                        buffer: candidate.to_string(),
                        records: vec![body.to_string()],
                    });
                }
            }
            None => {
                self.pending = Some(PendingPayload {
                    tag: Some(tag),
                    buffer: String::new(),
                    records: vec![body.to_string()],
                });
            }
        }

        // The text that carried the payload goes after it, so the citations
        // it references are already known.
        events.extend(text_event(leading_text));
        Some(events)
    }

    /// Locates `tag:` (optionally quoted) for a known tag. Returns the end of
    /// the text preceding it, the tag, and where the value starts.
    fn find_inline_tag(&self, body: &str) -> Option<(usize, String, usize)> {
        let mut best: Option<(usize, String, usize)> = None;
        for tag in &self.config.payload_tags {
            for (idx, _) in body.match_indices(tag.as_str()) {
                let before = &body[..idx];
                let (text_end, boundary_ok) = match before.chars().last() {
                    None => (idx, true),
                    Some(q @ ('"' | '\'')) => {
                        let start = idx - q.len_utf8();
                        let prev = body[..start].chars().last();
                        (start, prev.is_none_or(is_tag_boundary))
                    }
                    Some(c) => (idx, is_tag_boundary(c)),
                };
                if !boundary_ok {
                    continue;
                }

                let after = &body[idx + tag.len()..];
                let after_quote = after
                    .strip_prefix('"')
                    .or_else(|| after.strip_prefix('\''))
                    .unwrap_or(after);
                let after_ws = after_quote.trim_start();
                let Some(rest) = after_ws.strip_prefix(':') else {
                    continue;
                };
                let value = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
                if !(value.is_empty() || value.starts_with('[') || value.starts_with('{')) {
                    continue;
                }
                let value_start = body.len() - rest.len();

                if best.as_ref().is_none_or(|(end, _, _)| text_end < *end) {
                    best = Some((text_end, tag.clone(), value_start));
                }
                break;
            }
        }
        best
    }
}

fn is_tag_boundary(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '{' | ';' | '|')
}

fn literal_records(records: &[String]) -> Vec<StreamEvent> {
    records.iter().filter_map(|r| text_event(r)).collect()
}

fn text_event(body: &str) -> Option<StreamEvent> {
    let text = decode_text(body);
    if text.is_empty() {
        None
    } else {
        Some(StreamEvent::Text(text))
    }
}

/// Classifies a decoded JSON object. Error objects become upstream errors;
/// `{"type": ..}` envelopes use their type as tag; otherwise each key is its
/// own payload.
pub fn classify_object(mut map: serde_json::Map<String, Value>) -> Vec<StreamEvent> {
    if let Some(error) = map.get("error") {
        let status = error
            .get("code")
            .or_else(|| error.get("status"))
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok());
        let message = match error.get("message").and_then(|m| m.as_str()) {
            Some(m) => m.to_string(),
            None => match error.as_str() {
                Some(s) => s.to_string(),
                None => error.to_string(),
            },
        };
        return vec![StreamEvent::UpstreamError { status, message }];
    }

    if let Some(Value::String(tag)) = map.remove("type") {
        let value = match map.remove("data") {
            Some(data) => data,
            None => Value::Object(map),
        };
        return vec![StreamEvent::StructuredPayload(PayloadKind::from_tag(&tag), value)];
    }

    map.into_iter()
        .map(|(key, value)| StreamEvent::StructuredPayload(PayloadKind::from_tag(&key), value))
        .collect()
}

/// Applies byte-literal unwrapping and then UTF-8 reinterpretation.
/// Clean text passes through unchanged.
pub fn decode_text(body: &str) -> String {
    let unwrapped = match unwrap_byte_literal(body) {
        Some(s) => s,
        None => body.to_string(),
    };
    reinterpret_utf8(&unwrapped)
}

/// Unwraps `b'..'`, `b".."` and JSON-quoted strings that contain escapes.
pub fn unwrap_byte_literal(body: &str) -> Option<String> {
    let trimmed = body.trim();
    for quote in ['\'', '"'] {
        let open = format!("b{}", quote);
        if trimmed.len() >= 3 && trimmed.starts_with(&open) && trimmed.ends_with(quote) {
            return Some(unescape(&trimmed[2..trimmed.len() - 1]));
        }
    }

    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.contains('\\') {
        if let Ok(s) = serde_json::from_str::<String>(trimmed) {
            return Some(s);
        }
        return Some(unescape(&trimmed[1..trimmed.len() - 1]));
    }

    None
}

fn unescape(inner: &str) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('x') => {
                let hex: String = chars.clone().take(2).collect();
                match u8::from_str_radix(&hex, 16) {
                    Ok(byte) if hex.len() == 2 => {
                        chars.nth(1);
                        out.push(char::from(byte));
                    }
                    _ => out.push_str("\\x"),
                }
            }
            Some('u') => {
                let hex: String = chars.clone().take(4).collect();
                match u32::from_str_radix(&hex, 16) {
                    Ok(code) if hex.len() == 4 => {
                        chars.nth(3);
                        out.push(decode_code_unit(code, &mut chars));
                    }
                    _ => out.push_str("\\u"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

fn decode_code_unit(code: u32, chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> char {
    if (0xD800..0xDC00).contains(&code) {
        let lookahead: String = chars.clone().take(6).collect();
        if let Some(low_hex) = lookahead.strip_prefix("\\u") {
            if let Ok(low) = u32::from_str_radix(low_hex, 16) {
                if (0xDC00..0xE000).contains(&low) {
                    chars.nth(5);
                    let combined = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
                    return char::from_u32(combined).unwrap_or(char::REPLACEMENT_CHARACTER);
                }
            }
        }
    }
    char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// Text pushed through an 8-bit-safe channel arrives as one char per byte.
/// When every char fits in a byte and those bytes form valid UTF-8, the
/// UTF-8 reading wins.
pub fn reinterpret_utf8(text: &str) -> String {
    let mut has_high = false;
    let mut bytes = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        if code > 0xFF {
            return text.to_string();
        }
        if code >= 0x80 {
            has_high = true;
        }
        bytes.push(code as u8);
    }
    if !has_high {
        return text.to_string();
    }
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => text.to_string(),
    }
}

struct DecodeState<S> {
    framed: FramedRead<StreamReader<S, Bytes>, EventRecordCodec>,
    decoder: RecordDecoder,
    queue: VecDeque<StreamEvent>,
    done: bool,
}

/// Lazily decodes a response body into events. The stream ends after an
/// explicit terminal token or when the body ends; a transport failure is
/// yielded once as an error and ends the stream.
pub fn decode_stream<S>(body: S, config: DecoderConfig) -> impl Stream<Item = Result<StreamEvent>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Unpin + Send,
{
    let codec = EventRecordCodec::new(&config.event_prefix, MAX_RECORD_BYTES);
    let state = DecodeState {
        framed: FramedRead::new(StreamReader::new(body), codec),
        decoder: RecordDecoder::new(config),
        queue: VecDeque::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.queue.pop_front() {
                if event == StreamEvent::ControlMarker(ControlMarker::Done) {
                    tracing::debug!("[☁️  -> ⚙️ ] Stream end marker received");
                    st.done = true;
                    st.queue.clear();
                }
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.framed.next().await {
                Some(Ok(record)) => {
                    let events = st.decoder.decode_record(&record);
                    st.queue.extend(events);
                }
                Some(Err(e)) => {
                    tracing::error!("[☁️  -> ⚙️ ] Record framing error: {}", e);
                    st.done = true;
                    return Some((Err(ParleyError::from(e).into()), st));
                }
                None => {
                    st.done = true;
                    let tail = st.decoder.finish();
                    st.queue.extend(tail);
                }
            }
        }
    })
}
