//! Response acceptance.

/// Control tokens that must never reach the caller.
pub const CONTROL_SENTINELS: [&str; 2] = ["<|eot_id|>", "<|end_of_text|>"];

/// Canned phrases rejected on exact (trimmed) match.
pub const REJECTED_PHRASES: [&str; 3] = [
    "I am [Your Name]",
    "I will be happy to help you",
    "Whether it's a specific topic",
];

/// Drop trailing control sentinels (and the whitespace around them).
pub fn strip_sentinels(response: &str) -> &str {
    let mut text = response.trim_end();
    while let Some(rest) = CONTROL_SENTINELS
        .iter()
        .find_map(|s| text.strip_suffix(s))
    {
        text = rest.trim_end();
    }
    text
}

pub trait ResponseValidator: Send + Sync {
    fn is_valid(&self, response: &str) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl ResponseValidator for DefaultValidator {
    fn is_valid(&self, response: &str) -> bool {
        let trimmed = response.trim();
        if trimmed.is_empty() {
            return false;
        }
        !CONTROL_SENTINELS.contains(&trimmed) && !REJECTED_PHRASES.contains(&trimmed)
    }
}
