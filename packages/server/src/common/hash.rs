//! Hashing helpers for api keys and cache keys.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of arbitrary input.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stored hash for a raw API key. Raw keys never touch the database.
pub fn api_key_hash(raw_key: &str) -> String {
    sha256_hex(raw_key)
}

/// Deterministic profile-cache key for a normalized profile URL.
pub fn cache_key(normalized_url: &str) -> String {
    sha256_hex(normalized_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic_and_hex() {
        let a = sha256_hex("hello");
        let b = sha256_hex("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_inputs_hash_differently() {
        assert_ne!(cache_key("https://instagram.com/a"), cache_key("https://instagram.com/b"));
    }
}
