//! Client-side input validation, applied before any network round-trip.

pub const MAX_MESSAGE_LENGTH: usize = 4000;
pub const MAX_CHANNEL_NAME_LENGTH: usize = 100;
pub const MAX_SERVER_NAME_LENGTH: usize = 100;

pub fn validate_message_content(content: &str) -> Result<(), String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("Message content is required".into());
    }
    if trimmed.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(format!(
            "Message content must be {} characters or less",
            MAX_MESSAGE_LENGTH
        ));
    }
    Ok(())
}

pub fn validate_channel_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Channel name is required".into());
    }
    if trimmed.chars().count() > MAX_CHANNEL_NAME_LENGTH {
        return Err(format!(
            "Channel name must be at most {} characters",
            MAX_CHANNEL_NAME_LENGTH
        ));
    }
    Ok(())
}

pub fn validate_server_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("Server name is required".into());
    }
    if trimmed.chars().count() > MAX_SERVER_NAME_LENGTH {
        return Err(format!(
            "Server name must be at most {} characters",
            MAX_SERVER_NAME_LENGTH
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_content_limits() {
        assert!(validate_message_content("hello").is_ok());
        assert!(validate_message_content("   ").is_err());
        assert!(validate_message_content(&"a".repeat(MAX_MESSAGE_LENGTH)).is_ok());
        assert!(validate_message_content(&"a".repeat(MAX_MESSAGE_LENGTH + 1)).is_err());
    }

    #[test]
    fn content_is_counted_in_chars_not_bytes() {
        // 4000 multi-byte chars are still within the limit
        assert!(validate_message_content(&"ä".repeat(MAX_MESSAGE_LENGTH)).is_ok());
    }

    #[test]
    fn name_limits() {
        assert!(validate_channel_name("general").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name(&"x".repeat(101)).is_err());
        assert!(validate_server_name("my server").is_ok());
        assert!(validate_server_name(&"x".repeat(101)).is_err());
    }
}
