//! Identifier generation.
//!
//! Connection ids and channel tokens travel inside URL paths, so both are
//! URL-safe base64 without padding. Short ids are the stable, non-reversible
//! aliases used for log lines and on-disk owner folders.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of a [`short_id`].
pub const SHORT_ID_LEN: usize = 10;

/// Generate a fresh unguessable identifier (two v4 UUIDs, 244 random bits).
pub fn create_id() -> String {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    bytes[16..].copy_from_slice(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// First ten characters of base64url(SHA-256(id)).
pub fn short_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(SHORT_ID_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_id_is_url_safe_and_unique() {
        let a = create_id();
        let b = create_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_short_id_is_stable() {
        let id = create_id();
        assert_eq!(short_id(&id), short_id(&id));
        assert_eq!(short_id(&id).len(), SHORT_ID_LEN);
    }

    #[test]
    fn test_short_id_known_value() {
        // sha256("abc") = ba7816bf...
        assert_eq!(short_id("abc"), "ungWv48Bz-");
    }
}
