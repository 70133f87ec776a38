use std::time::Duration;

/// What happens to text that streamed in before a failure or cancellation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialContentPolicy {
    /// Commit non-empty partial text, tagged as abnormally terminated.
    #[default]
    Preserve,
    /// Drop everything unless the turn completed with `done`.
    Discard,
}

/// Behaviour options for a `Supervisor`.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SupervisorConfig {
    pub partial_content: PartialContentPolicy,
    /// Upper bound on opening the event stream; `None` waits indefinitely.
    pub open_timeout: Option<Duration>,
    /// Conversation id forwarded to the generation endpoint.
    pub conversation_id: Option<String>,
}

impl SupervisorConfig {
    pub fn partial_content(mut self, policy: PartialContentPolicy) -> Self {
        self.partial_content = policy;
        self
    }

    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }
}
