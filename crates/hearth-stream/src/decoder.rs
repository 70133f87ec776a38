//! Server-sent-event framing and typed event decoding.
//!
//! Bytes arrive in arbitrary chunks; `SseDecoder` cuts them into complete
//! frames and `decode_frame` maps each frame to exactly one `StreamEvent`.
//! `decode_byte_stream` glues both together for a live connection.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::StreamExt as _;
use futures::stream;
use tracing::{debug, warn};

use crate::errors::{DecodeError, TransportError};
use crate::event::{FinalizationStats, StreamEvent};
use crate::throughput::ThroughputEstimator;

/// One complete server-sent-event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }
}

/// Cuts a byte stream into frames. Input after the last blank line stays
/// buffered until its frame is terminated.
#[derive(Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    /// Appends a chunk and returns every frame it completed, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((end, separator)) = next_boundary(&self.pending[consumed..]) {
            frames.extend(parse_sse_frame(&self.pending[consumed..consumed + end]));
            consumed += end + separator;
        }
        self.pending.drain(..consumed);
        frames
    }

    /// Parses whatever is left once the connection closes.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.pending);
        parse_sse_frame(&rest)
    }
}

/// Offset and length of the first blank-line separator (`\n\n` or `\r\n\r\n`).
fn next_boundary(bytes: &[u8]) -> Option<(usize, usize)> {
    bytes
        .windows(2)
        .enumerate()
        .find_map(|(at, pair)| match pair {
            [b'\n', b'\n'] => Some((at, 2)),
            [b'\r', b'\n'] if bytes[at + 2..].starts_with(b"\r\n") => Some((at, 4)),
            _ => None,
        })
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data: Option<String> = None;
    for line in text.lines() {
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match (field, data.as_mut()) {
            ("event", _) => event = Some(value.to_string()),
            ("data", Some(buf)) => {
                buf.push('\n');
                buf.push_str(value);
            }
            ("data", None) => data = Some(value.to_string()),
            // Comments (empty field name) and unknown fields.
            _ => {}
        }
    }
    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.unwrap_or_default(),
    })
}

/// Turns cumulative `thinking` payloads back into fragments.
///
/// The assistant API resends the whole reasoning trace with every `thinking`
/// event. A payload that extends everything seen so far yields only its new
/// suffix; any other payload is taken as a fragment.
#[derive(Debug, Default)]
struct ReasoningDeltas {
    seen: String,
}

impl ReasoningDeltas {
    fn delta(&mut self, content: String) -> Option<String> {
        if !self.seen.is_empty() && content.starts_with(self.seen.as_str()) {
            let suffix = content[self.seen.len()..].to_string();
            self.seen = content;
            return (!suffix.is_empty()).then_some(suffix);
        }
        self.seen.push_str(&content);
        (!content.is_empty()).then_some(content)
    }
}

#[derive(serde::Deserialize)]
struct ThinkingPayload {
    content: String,
}

#[derive(serde::Deserialize)]
struct TokenPayload {
    content: String,
    #[serde(default)]
    tokens_per_second: Option<f64>,
}

#[derive(serde::Deserialize)]
struct DonePayload {
    total_tokens: u64,
    duration_ms: u64,
    #[serde(default, alias = "avg_tokens_per_second")]
    avg_tps: Option<f64>,
}

#[derive(serde::Deserialize)]
struct ErrorPayload {
    message: String,
}

/// Returns true for frames that carry nothing to decode: `[DONE]` sentinels and
/// data-less keep-alives such as `event: ping`. A bare `done`/`error` tag is not
/// filler; it still has to end the turn.
pub fn is_filler(frame: &SseFrame) -> bool {
    let data = frame.data.trim();
    if !data.is_empty() && data != "[DONE]" {
        return false;
    }
    !matches!(frame.event.as_deref(), Some("done" | "error"))
}

/// Decodes one frame into a `StreamEvent`.
///
/// The tag comes from the `event:` line, or from a JSON `type` field when the
/// frame has no explicit event name.
pub fn decode_frame(frame: &SseFrame) -> Result<StreamEvent, DecodeError> {
    let value: Option<serde_json::Value> = serde_json::from_str(&frame.data).ok();
    let tag = match frame.event.as_deref().filter(|e| *e != "message") {
        Some(tag) => tag.to_string(),
        None => value
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
            .ok_or(DecodeError::MissingTag)?,
    };
    let Some(value) = value else {
        return Err(DecodeError::payload(&tag, "data is not valid JSON"));
    };

    match tag.as_str() {
        "thinking" => {
            let payload: ThinkingPayload = parse_payload(&tag, value)?;
            Ok(StreamEvent::Thinking {
                text: payload.content,
            })
        }
        "token" => {
            let payload: TokenPayload = parse_payload(&tag, value)?;
            Ok(StreamEvent::Token {
                text: payload.content,
                tokens_per_second: payload.tokens_per_second,
            })
        }
        "done" => {
            let payload: DonePayload = parse_payload(&tag, value)?;
            let avg_tokens_per_second = payload.avg_tps.unwrap_or_else(|| {
                ThroughputEstimator::new().finalize(payload.total_tokens, payload.duration_ms)
            });
            Ok(StreamEvent::Done(FinalizationStats {
                total_tokens: payload.total_tokens,
                duration_ms: payload.duration_ms,
                avg_tokens_per_second,
            }))
        }
        "error" => {
            let payload: ErrorPayload = parse_payload(&tag, value)?;
            Ok(StreamEvent::Error {
                message: payload.message,
            })
        }
        _ => Err(DecodeError::UnknownTag { tag }),
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    tag: &str,
    value: serde_json::Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::payload(tag, e.to_string()))
}

/// Like `decode_frame`, but a malformed frame becomes a synthetic `error` event.
pub fn decode_frame_or_error(frame: &SseFrame) -> StreamEvent {
    decode_frame(frame).unwrap_or_else(|err| {
        warn!(error = %err, "malformed stream frame");
        StreamEvent::error(format!("malformed stream event: {err}"))
    })
}

/// Turns a raw byte stream into an ordered stream of events.
///
/// The stream ends right after the first terminal event, so nothing that
/// follows `done`/`error` on the wire is ever yielded. Cumulative `thinking`
/// payloads are reduced to their new suffix. Read failures are yielded as a
/// final `TransportError`.
pub fn decode_byte_stream<S, B, E>(
    bytes_stream: S,
) -> impl futures::Stream<Item = Result<StreamEvent, TransportError>> + Send
where
    S: futures::Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    struct State<T> {
        bytes_stream: T,
        decoder: SseDecoder,
        pending: VecDeque<StreamEvent>,
        reasoning: ReasoningDeltas,
        done: bool,
    }

    impl<T> State<T> {
        fn enqueue(&mut self, frame: &SseFrame) {
            if self.done || is_filler(frame) {
                return;
            }
            let event = match decode_frame_or_error(frame) {
                StreamEvent::Thinking { text } => match self.reasoning.delta(text) {
                    Some(text) => StreamEvent::Thinking { text },
                    None => return,
                },
                event => event,
            };
            debug!(tag = event.tag(), "decoded stream event");
            if event.is_terminal() {
                self.done = true;
            }
            self.pending.push_back(event);
        }
    }

    stream::try_unfold(
        State {
            bytes_stream,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            reasoning: ReasoningDeltas::default(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push_chunk(chunk.as_ref()) {
                            state.enqueue(&frame);
                        }
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::read(e.to_string()));
                    }
                    None => {
                        if let Some(frame) = state.decoder.finish() {
                            state.enqueue(&frame);
                        }
                        // Whatever was queued drains first; then the stream ends.
                        if state.pending.is_empty() {
                            return Ok(None);
                        }
                        state.done = true;
                    }
                }
            }
        },
    )
}
