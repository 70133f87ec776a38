use std::sync::{Arc, Mutex};

use crate::errors::HistoryError;
use crate::message::FinalizedMessage;

/// Append-only receiver of finalized messages (for example the memory store).
#[async_trait::async_trait]
pub trait HistorySink: Send + Sync {
    async fn append(&self, message: FinalizedMessage) -> Result<(), HistoryError>;
}

/// Shared in-memory history, mostly useful for tests and the CLI.
#[derive(Clone, Default)]
pub struct MemoryHistory {
    messages: Arc<Mutex<Vec<FinalizedMessage>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far, oldest first.
    pub fn messages(&self) -> Vec<FinalizedMessage> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl HistorySink for MemoryHistory {
    async fn append(&self, message: FinalizedMessage) -> Result<(), HistoryError> {
        let mut guard = self
            .messages
            .lock()
            .map_err(|_| HistoryError("memory history lock poisoned".into()))?;
        guard.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_history_keeps_append_order() {
        let history = MemoryHistory::new();
        history
            .append(FinalizedMessage::user("first"))
            .await
            .expect("append");
        history
            .append(FinalizedMessage::user("second"))
            .await
            .expect("append");
        let contents: Vec<String> = history.messages().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(history.len(), 2);
    }
}
