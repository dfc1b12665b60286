//! Chat prompt rendering and token estimates.

use crate::loader::format::ModelFormat;
use serde::{Deserialize, Serialize};

/// Words-to-tokens factor for packed model tokenizers.
pub const PACKED_TOKENS_PER_WORD: f64 = 1.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Render `Role: content` turns, skipping empty messages, ending with an open
/// assistant turn.
pub fn format_chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let content = message.content.trim();
        if content.is_empty() {
            continue;
        }
        prompt.push_str(message.role.prefix());
        prompt.push_str(": ");
        prompt.push_str(content);
        prompt.push('\n');
    }
    prompt.push_str("Assistant: ");
    prompt
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

fn estimate_tokens(text: &str, format: Option<ModelFormat>) -> u32 {
    let words = text.split_whitespace().count() as f64;
    match format {
        Some(ModelFormat::Packed) => (words * PACKED_TOKENS_PER_WORD) as u32,
        _ => words as u32,
    }
}

pub fn estimate_usage(prompt: &str, completion: &str, format: Option<ModelFormat>) -> Usage {
    let prompt_tokens = estimate_tokens(prompt, format);
    let completion_tokens = estimate_tokens(completion, format);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}
