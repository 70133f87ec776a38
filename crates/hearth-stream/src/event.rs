/// Aggregate statistics carried by a `done` event.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FinalizationStats {
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub avg_tokens_per_second: f64,
}

/// Typed events produced by the decoder for one streaming turn.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Reasoning-trace fragment.
    Thinking { text: String },
    /// Answer fragment, optionally with the backend's current rate.
    Token {
        text: String,
        tokens_per_second: Option<f64>,
    },
    /// Terminal success event.
    Done(FinalizationStats),
    /// Terminal failure event.
    Error { message: String },
}

impl StreamEvent {
    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    pub fn token(text: impl Into<String>) -> Self {
        Self::Token {
            text: text.into(),
            tokens_per_second: None,
        }
    }

    pub fn token_with_rate(text: impl Into<String>, tokens_per_second: f64) -> Self {
        Self::Token {
            text: text.into(),
            tokens_per_second: Some(tokens_per_second),
        }
    }

    pub fn done(total_tokens: u64, duration_ms: u64, avg_tokens_per_second: f64) -> Self {
        Self::Done(FinalizationStats {
            total_tokens,
            duration_ms,
            avg_tokens_per_second,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Returns true for `Done` and `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error { .. })
    }

    /// Wire tag of the variant.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::Token { .. } => "token",
            Self::Done(_) => "done",
            Self::Error { .. } => "error",
        }
    }
}
