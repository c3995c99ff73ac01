//! WireGuard key-shape validation: 32-byte values, base64-encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// `true` if `s` decodes as standard base64 to exactly 32 bytes — the shape
/// of a WireGuard public, private, or preshared key. This is a shape check
/// only; it does not verify the bytes form a valid Curve25519 point.
pub fn is_valid_key_shape(s: &str) -> bool {
    match STANDARD.decode(s) {
        Ok(bytes) => bytes.len() == 32,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        let short = STANDARD.encode([0u8; 16]);
        assert!(!is_valid_key_shape(&short));
    }

    #[test]
    fn accepts_32_bytes() {
        let key = STANDARD.encode([7u8; 32]);
        assert!(is_valid_key_shape(&key));
    }

    #[test]
    fn rejects_non_base64() {
        assert!(!is_valid_key_shape("not base64 at all!!"));
    }
}
