/// A transport unit that could not be turned into a `StreamEvent`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The unit named an event variant this decoder does not know.
    #[error("unknown stream event tag: {tag}")]
    UnknownTag { tag: String },
    /// The unit carried no tag at all (no `event:` line and no JSON `type`).
    #[error("stream event has no tag")]
    MissingTag,
    /// The payload was not valid JSON or lacked a required field.
    #[error("malformed `{tag}` payload: {message}")]
    Payload { tag: String, message: String },
}

impl DecodeError {
    pub(crate) fn payload(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Payload {
            tag: tag.into(),
            message: message.into(),
        }
    }
}

/// Connection-level failure reported by a generation endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be sent or the connection was refused.
    #[error("connect failed: {message}")]
    Connect { message: String },
    /// The endpoint answered with a non-success HTTP status.
    #[error("endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// The connection dropped or a read failed mid-stream.
    #[error("stream read failed: {message}")]
    Read { message: String },
    /// Opening the stream took longer than the configured bound.
    #[error("timed out opening stream after {elapsed_ms} ms")]
    OpenTimeout { elapsed_ms: u64 },
}

impl TransportError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }
}

/// An event arrived for a turn that has already reached a terminal state.
///
/// Never recovered from: the offending event is dropped and the turn is left
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("protocol violation: `{event}` received after the turn was {state}")]
pub struct ProtocolViolation {
    pub event: &'static str,
    pub state: &'static str,
}

/// Why a turn failed. Cancellation is not a failure; see `Termination::Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum TurnFailure {
    /// The backend sent an `error` event (including decode errors surfaced as one).
    #[error("upstream failure: {message}")]
    Upstream { message: String },
    /// The connection failed before or during streaming.
    #[error("transport failure: {message}")]
    Transport { message: String },
    /// The stream ended without any terminal event.
    #[error("protocol failure: {message}")]
    Protocol { message: String },
}

impl From<&TransportError> for TurnFailure {
    fn from(err: &TransportError) -> Self {
        TurnFailure::Transport {
            message: err.to_string(),
        }
    }
}

/// Errors returned by the `Supervisor` API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// A turn is still open; finish or cancel it first.
    #[error("a response is already streaming (turn {turn_id})")]
    AlreadyStreaming { turn_id: uuid::Uuid },
    /// Invalid user input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Invalid supervisor or endpoint configuration.
    #[error("config error: {0}")]
    Config(String),
}

/// Failure returned by a `HistorySink`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("history append failed: {0}")]
pub struct HistoryError(pub String);
