//! Storage engine: buckets, objects and multipart uploads on the local
//! filesystem.
//!
//! [`local::ObjectStore`] owns buckets and objects;
//! [`multipart::MultipartManager`] tracks in-flight uploads and publishes
//! completed ones through the store.

pub mod blob;
pub mod local;
pub mod multipart;
pub mod types;

pub use local::{ObjectReader, ObjectStore};
pub use multipart::MultipartManager;

use crate::errors::StoreError;

/// Maximum object key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Highest valid multipart part number.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Validate that a bucket name conforms to S3 naming rules.
///
/// Rules:
/// - 3-63 characters long
/// - Only lowercase letters, numbers, hyphens, and periods
/// - Must begin and end with a letter or number
/// - Cannot be formatted as an IP address (e.g., 192.168.5.4)
///
/// These also keep every name safe to use as a directory name.
pub fn validate_bucket_name(name: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidBucketName {
        name: name.to_string(),
    };

    if !(3..=63).contains(&name.len()) {
        return Err(invalid());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'.')
    {
        return Err(invalid());
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(invalid());
    }
    if name.contains("..") || looks_like_ip(name) {
        return Err(invalid());
    }
    Ok(())
}

/// Check whether a string looks like an IPv4 address (e.g., "192.168.5.4").
fn looks_like_ip(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| p.parse::<u8>().is_ok())
}

/// Keys are opaque, but must be non-empty and at most [`MAX_KEY_LEN`] bytes.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey {
            reason: "key must not be empty",
        });
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLong);
    }
    Ok(())
}

pub fn validate_part_number(part_number: u32) -> Result<(), StoreError> {
    if (1..=MAX_PART_NUMBER).contains(&part_number) {
        Ok(())
    } else {
        Err(StoreError::InvalidPartNumber { part_number })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_bucket_names() {
        for name in ["abc", "my-bucket", "my.bucket.2024", "0-numbers-first", "a".repeat(63).as_str()] {
            assert!(validate_bucket_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_invalid_bucket_names() {
        for name in [
            "",
            ".",
            "..",
            "ab",
            "a".repeat(64).as_str(),
            "My-Bucket",
            "has_underscore",
            "a/b",
            "a\\b",
            "-leading",
            "trailing-",
            ".dot",
            "double..dot",
            "192.168.5.4",
        ] {
            assert!(
                matches!(validate_bucket_name(name), Err(StoreError::InvalidBucketName { .. })),
                "{name}"
            );
        }
    }

    #[test]
    fn test_part_number_range() {
        assert!(validate_part_number(1).is_ok());
        assert!(validate_part_number(MAX_PART_NUMBER).is_ok());
        assert!(matches!(
            validate_part_number(0),
            Err(StoreError::InvalidPartNumber { part_number: 0 })
        ));
        assert!(validate_part_number(MAX_PART_NUMBER + 1).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("a").is_ok());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
        assert!(matches!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)), Err(StoreError::KeyTooLong)));
        assert!(matches!(validate_key(""), Err(StoreError::InvalidKey { .. })));
    }
}
