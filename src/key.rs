//! Cache key validation.

use crate::error::{Error, Result};

/// Longest key the memcached text protocol accepts.
pub const MAX_KEY_LENGTH: usize = 250;

/// Validate a key before it is offloaded.
///
/// An empty key is always rejected. With `verify` set, keys longer than
/// [`MAX_KEY_LENGTH`] and keys containing ASCII whitespace or control bytes
/// are rejected as well.
pub fn validate_key(key: &[u8], verify: bool) -> Result<()> {
    if key.is_empty() {
        return Err(Error::ValidationError("key must not be empty".to_string()));
    }

    if !verify {
        return Ok(());
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::ValidationError(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }

    if let Some(pos) = key
        .iter()
        .position(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(Error::ValidationError(format!(
            "key contains an invalid byte 0x{:02x} at offset {}",
            key[pos], pos
        )));
    }

    Ok(())
}

/// Printable form of a key for log lines.
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            validate_key(b"", false),
            Err(Error::ValidationError(_))
        ));
        assert!(validate_key(b"", true).is_err());
    }

    #[test]
    fn test_valid_key() {
        validate_key(b"user:42", true).expect("Failed to validate key");
    }

    #[test]
    fn test_key_length_limit() {
        let key = vec![b'k'; MAX_KEY_LENGTH];
        validate_key(&key, true).expect("Failed to validate key");

        let key = vec![b'k'; MAX_KEY_LENGTH + 1];
        assert!(validate_key(&key, true).is_err());
        // Verification disabled lets long keys through
        validate_key(&key, false).expect("Failed to validate key");
    }

    #[test]
    fn test_key_whitespace_rejected() {
        assert!(validate_key(b"has space", true).is_err());
        assert!(validate_key(b"line\nbreak", true).is_err());
        assert!(validate_key(b"nul\0", true).is_err());
        validate_key(b"has space", false).expect("Failed to validate key");
    }
}
