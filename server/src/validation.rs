use queue_core::{validate_text, MAX_TEXT_LENGTH};

use crate::error::ApiError;

/// Maximum username length accepted from chat sources
const MAX_USERNAME_LENGTH: usize = 64;

/// Validate a message submitted through the API before it reaches the queue
pub fn validate_message_request(text: &str, username: &str) -> Result<(), ApiError> {
    validate_text(text, MAX_TEXT_LENGTH)?;

    let username = username.trim();
    if username.is_empty() {
        return Err(ApiError::InvalidInput("Username cannot be empty".to_string()));
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(ApiError::InvalidInput(format!(
            "Username too long (max {} characters)",
            MAX_USERNAME_LENGTH
        )));
    }
    if username.chars().any(char::is_control) {
        return Err(ApiError::InvalidInput(
            "Username contains control characters".to_string(),
        ));
    }

    Ok(())
}
