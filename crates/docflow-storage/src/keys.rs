//! Storage key validation and encoding shared by all backends.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::traits::{StorageError, StorageResult};

/// Everything except RFC 3986 unreserved characters and `/`.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode a key for use in an S3 copy source, leaving `/` as is.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, COPY_SOURCE).to_string()
}

/// `{bucket}/{encoded key}` reference for a server-side copy.
pub fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, encode_key(key))
}

/// Reject keys that are empty, absolute, or contain `..` segments or NUL.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.starts_with('/') || key.contains('\0') {
        return Err(StorageError::InvalidKey(format!(
            "Storage key contains invalid characters: {}",
            key
        )));
    }
    if key.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(StorageError::InvalidKey(format!(
            "Storage key escapes its area: {}",
            key
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_keeps_slashes() {
        assert_eq!(
            copy_source("staging", "users/42/my report (v2).pdf"),
            "staging/users/42/my%20report%20%28v2%29.pdf"
        );
    }

    #[test]
    fn encode_key_escapes_reserved_and_unicode() {
        assert_eq!(encode_key("a+b&c=d"), "a%2Bb%26c%3Dd");
        assert_eq!(encode_key("é.png"), "%C3%A9.png");
        assert_eq!(encode_key("plain-key_1.~txt"), "plain-key_1.~txt");
    }

    #[test]
    fn validate_key_rejects_traversal() {
        assert!(validate_key("uploads/a.pdf").is_ok());
        assert!(validate_key("uploads/..hidden").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("uploads/../../etc").is_err());
        assert!(validate_key("a\\..\\b").is_err());
    }
}
