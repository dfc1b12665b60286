//! Templated reply used when every attempt was rejected.

const GREETINGS: [&str; 4] = ["hello", "hi", "hey", "greetings"];

pub const GREETING_REPLY: &str = "Hello! I'm here to help you. How can I assist you today?";
pub const QUESTION_REPLY: &str =
    "I understand your question. Let me help you with that. Could you please provide more details?";
pub const ACKNOWLEDGE_REPLY: &str = "I see what you're asking about. Let me provide you with a helpful response. What specific information are you looking for?";
pub const EMPTY_REPLY: &str = "I'm here to help! Please let me know what you'd like assistance with.";

/// Last `User:` line of the prompt, without the prefix.
fn last_user_utterance(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .rev()
        .map(str::trim_start)
        .find_map(|line| line.strip_prefix("User:"))
        .map(str::trim)
}

fn is_greeting(text: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric())
        .any(|word| GREETINGS.iter().any(|g| word.eq_ignore_ascii_case(g)))
}

pub fn fallback_response(prompt: &str) -> &'static str {
    match last_user_utterance(prompt) {
        None => EMPTY_REPLY,
        Some(text) if is_greeting(text) => GREETING_REPLY,
        Some(text) if text.contains('?') => QUESTION_REPLY,
        Some(_) => ACKNOWLEDGE_REPLY,
    }
}
