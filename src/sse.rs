//! Incremental Server-Sent Events decoding.
//!
//! The hub streams answers as `event:` / `data:` lines. Reads can split a
//! line (or a multi-byte character) anywhere, so the parser keeps the
//! unterminated tail in a byte buffer and only decodes complete lines.

use crate::error::{ChatError, ChatResult};
use futures::{Stream, StreamExt, stream};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Event name given to frames that carry no discriminator at all.
pub const DEFAULT_EVENT: &str = "message";

/// Where the frame discriminator lives for a given deployment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FramingMode {
    /// `event:` lines name every following `data:` line.
    EventLine,
    /// The JSON payload names itself through a `type` or `event` field.
    PayloadField,
    /// Payload field when present, otherwise the current `event:` name.
    #[default]
    Auto,
}

impl FramingMode {
    fn resolve(self, current_event: Option<&str>, payload: &Value) -> String {
        let from_payload = || {
            ["type", "event"]
                .iter()
                .find_map(|key| payload.get(*key).and_then(Value::as_str))
                .filter(|name| !name.is_empty())
        };
        let name = match self {
            FramingMode::EventLine => current_event,
            FramingMode::PayloadField => from_payload(),
            FramingMode::Auto => from_payload().or(current_event),
        };
        name.unwrap_or(DEFAULT_EVENT).to_string()
    }
}

impl FromStr for FramingMode {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" | "event_line" | "event-line" => Ok(FramingMode::EventLine),
            "payload" | "payload_field" | "payload-field" => Ok(FramingMode::PayloadField),
            "auto" | "" => Ok(FramingMode::Auto),
            other => Err(ChatError::Config(format!("unknown framing mode '{other}'"))),
        }
    }
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FramingMode::EventLine => "event",
            FramingMode::PayloadField => "payload",
            FramingMode::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// One decoded event plus its JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamFrame {
    pub event: String,
    pub payload: Value,
}

impl StreamFrame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

pub struct SseParser {
    mode: FramingMode,
    buffer: Vec<u8>,
    current_event: Option<String>,
}

impl SseParser {
    pub fn new(mode: FramingMode) -> Self {
        Self {
            mode,
            buffer: Vec::new(),
            current_event: None,
        }
    }

    /// Appends `chunk` and returns every frame completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        let mut scanned = self.buffer.len();
        self.buffer.extend_from_slice(chunk);

        while let Some(offset) = self.buffer[scanned..].iter().position(|b| *b == b'\n') {
            let end = scanned + offset;
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            scanned = 0;

            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(frame) = self.parse_line(line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Ends the stream. An unterminated trailing line is dropped, never parsed.
    pub fn finish(&mut self) {
        if !self.buffer.is_empty() {
            tracing::debug!(
                bytes = self.buffer.len(),
                "discarding unterminated SSE line at end of stream"
            );
            self.buffer.clear();
        }
        self.current_event = None;
    }

    fn parse_line(&mut self, line: &str) -> Option<StreamFrame> {
        if let Some(name) = line.strip_prefix("event:") {
            let name = name.trim();
            self.current_event = (!name.is_empty()).then(|| name.to_string());
            return None;
        }

        let data = line.strip_prefix("data:")?.trim();
        if is_placeholder(data) {
            return None;
        }

        let payload = match serde_json::from_str::<Value>(data) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                tracing::debug!(data, "ignoring non-object SSE payload");
                return None;
            }
            Err(err) => {
                tracing::debug!(data, %err, "ignoring unparseable SSE payload");
                return None;
            }
        };

        let event = self.mode.resolve(self.current_event.as_deref(), &payload);
        Some(StreamFrame { event, payload })
    }
}

fn is_placeholder(data: &str) -> bool {
    matches!(data, "" | "{}" | "[DONE]")
}

/// Lazily turns a byte stream into frames. A read error is yielded once and
/// ends the sequence.
pub fn frame_stream<S, B>(
    bytes: S,
    mode: FramingMode,
) -> impl Stream<Item = ChatResult<StreamFrame>> + Send
where
    S: Stream<Item = ChatResult<B>> + Send + Unpin,
    B: AsRef<[u8]>,
{
    struct State<S> {
        bytes: S,
        parser: SseParser,
        pending: VecDeque<StreamFrame>,
        finished: bool,
    }

    let state = State {
        bytes,
        parser: SseParser::new(mode),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((Ok(frame), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let frames = state.parser.feed(chunk.as_ref());
                    state.pending.extend(frames);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.parser.finish();
                    state.finished = true;
                }
            }
        }
    })
}
