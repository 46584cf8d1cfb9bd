/// Input checks applied before anything reaches the chat core
use crate::error::{ChatError, Result};

pub const NAME_MIN_CHARS: usize = 2;
pub const NAME_MAX_CHARS: usize = 20;
pub const MESSAGE_MAX_CHARS: usize = 300;

/// Returns the trimmed name
pub fn validate_display_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    let len = name.chars().count();
    if len < NAME_MIN_CHARS {
        return Err(ChatError::Validation(format!(
            "Name must be at least {} characters",
            NAME_MIN_CHARS
        )));
    }
    if len > NAME_MAX_CHARS {
        return Err(ChatError::Validation(format!(
            "Name must be at most {} characters",
            NAME_MAX_CHARS
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ') {
        return Err(ChatError::Validation(
            "Name can only contain letters, numbers, and spaces".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Returns the trimmed message text
pub fn validate_message(raw: &str) -> Result<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ChatError::Validation("Message cannot be empty".to_string()));
    }
    if text.chars().count() > MESSAGE_MAX_CHARS {
        return Err(ChatError::Validation(format!(
            "Message must be at most {} characters",
            MESSAGE_MAX_CHARS
        )));
    }
    Ok(text.to_string())
}
