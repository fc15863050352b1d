use crate::error::Rejection;

/// Default maximum length of a chat message accepted for speech
pub const MAX_TEXT_LENGTH: usize = 500;

/// Validate raw message text before voice extraction
pub fn validate_text(text: &str, max_length: usize) -> Result<(), Rejection> {
    if text.trim().is_empty() {
        return Err(Rejection::EmptyText);
    }
    if text.chars().count() > max_length {
        return Err(Rejection::TextTooLong { max: max_length });
    }
    Ok(())
}

/// Validate language code format (e.g., en_US, de_DE, or just en).
/// An empty code means "backend default" and is accepted.
pub fn is_valid_language_code(code: &str) -> bool {
    if code.is_empty() {
        return true;
    }
    let parts: Vec<&str> = code.split('_').collect();
    match parts.len() {
        1 => parts[0].len() == 2 && parts[0].chars().all(|c| c.is_ascii_lowercase()),
        2 => {
            parts[0].len() == 2
                && parts[0].chars().all(|c| c.is_ascii_lowercase())
                && parts[1].len() == 2
                && parts[1].chars().all(|c| c.is_ascii_uppercase())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_text_valid() {
        assert!(validate_text("Hello", MAX_TEXT_LENGTH).is_ok());
    }

    #[test]
    fn test_validate_text_empty() {
        assert_eq!(validate_text("", MAX_TEXT_LENGTH), Err(Rejection::EmptyText));
        assert_eq!(validate_text("   ", MAX_TEXT_LENGTH), Err(Rejection::EmptyText));
    }

    #[test]
    fn test_validate_text_too_long() {
        let long_text = "a".repeat(MAX_TEXT_LENGTH + 1);
        let result = validate_text(&long_text, MAX_TEXT_LENGTH);
        assert_eq!(result, Err(Rejection::TextTooLong { max: MAX_TEXT_LENGTH }));
        assert!(result.unwrap_err().to_string().contains("too long"));
    }

    #[test]
    fn test_language_codes() {
        assert!(is_valid_language_code(""));
        assert!(is_valid_language_code("en"));
        assert!(is_valid_language_code("en_US"));
        assert!(!is_valid_language_code("invalid"));
        assert!(!is_valid_language_code("INVALID"));
        assert!(!is_valid_language_code("en_us"));
    }
}
