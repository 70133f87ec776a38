use crate::errors::ProtocolViolation;
use crate::event::StreamEvent;
use crate::throughput::accepted_rate;

/// Mutable in-progress state of exactly one streaming turn.
///
/// Answer and reasoning text only ever grow. Once a terminal event has been
/// applied (or the turn was cancelled) every further `apply` is rejected with
/// a `ProtocolViolation` and leaves the turn untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct Accumulator {
    answer_text: String,
    reasoning_text: String,
    current_rate: Option<f64>,
    is_active: bool,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Accumulator {
    pub fn new() -> Self {
        Self {
            answer_text: String::new(),
            reasoning_text: String::new(),
            current_rate: None,
            is_active: true,
        }
    }

    /// Applies one event in arrival order.
    pub fn apply(&mut self, event: &StreamEvent) -> Result<(), ProtocolViolation> {
        if !self.is_active {
            return Err(ProtocolViolation {
                event: event.tag(),
                state: "finished",
            });
        }
        match event {
            StreamEvent::Thinking { text } => self.reasoning_text.push_str(text),
            StreamEvent::Token {
                text,
                tokens_per_second,
            } => {
                self.answer_text.push_str(text);
                if let Some(rate) = tokens_per_second.and_then(accepted_rate) {
                    self.current_rate = Some(rate);
                }
            }
            StreamEvent::Done(_) | StreamEvent::Error { .. } => self.is_active = false,
        }
        Ok(())
    }

    /// Marks the turn inactive without a terminal event.
    pub(crate) fn deactivate(&mut self) {
        self.is_active = false;
    }

    pub fn answer_text(&self) -> &str {
        &self.answer_text
    }

    pub fn reasoning_text(&self) -> &str {
        &self.reasoning_text
    }

    pub fn current_rate(&self) -> Option<f64> {
        self.current_rate
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Consumes the turn, returning `(answer_text, reasoning_text)`.
    pub fn into_texts(self) -> (String, String) {
        (self.answer_text, self.reasoning_text)
    }
}
