use serde::{Deserialize, Serialize};

/// Speaker of one conversation message. The set is closed: unknown roles
/// fail deserialization before any backend call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ConversationMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ConversationMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Body of `POST /api/chat`: the full ordered conversation so far.
#[derive(Debug, Deserialize, Serialize)]
pub struct ChatReqInput {
    pub messages: Vec<ConversationMessage>,
}
