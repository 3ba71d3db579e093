//! Histórico da conversa de uma sessão, só em memória.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only, ordered message log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationLog {
    entries: Vec<ConversationEntry>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Empty agent texts are skipped (status polls
    /// usually carry none).
    pub fn push(&mut self, role: Role, text: impl Into<String>) -> Option<&ConversationEntry> {
        let text = text.into();
        if role == Role::Agent && text.trim().is_empty() {
            return None;
        }
        self.entries.push(ConversationEntry {
            id: Uuid::new_v4(),
            role,
            text,
            timestamp: Utc::now(),
        });
        self.entries.last()
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
