use chrono::{DateTime, Utc};

use crate::errors::TurnFailure;
use crate::event::FinalizationStats;

/// Author of a history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// How the turn that produced a message ended.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// Normal completion (and every user-authored message).
    Completed,
    /// The stream failed; the content is whatever arrived before the failure.
    Failed { failure: TurnFailure },
    /// The user cancelled; the content is whatever arrived before that.
    Cancelled,
}

impl Termination {
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// Immutable conversation history entry.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FinalizedMessage {
    pub id: uuid::Uuid,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub termination: Termination,
    /// Present only when the turn ended with `done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FinalizationStats>,
}

impl FinalizedMessage {
    /// A user-authored message, appended before its turn starts streaming.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            reasoning_text: None,
            created_at: Utc::now(),
            termination: Termination::Completed,
            stats: None,
        }
    }

    /// An assistant reply built from a turn's accumulated text.
    ///
    /// Empty reasoning is stored as `None`.
    pub fn assistant(
        id: uuid::Uuid,
        content: String,
        reasoning_text: String,
        termination: Termination,
        stats: Option<FinalizationStats>,
    ) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content,
            reasoning_text: Some(reasoning_text).filter(|r| !r.is_empty()),
            created_at: Utc::now(),
            termination,
            stats,
        }
    }
}
