//! WireGuard key handling: clamped Curve25519 private keys and public key
//! derivation, both base64-encoded the way `wg` expects them.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to decode base64 key: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Generate a WireGuard private key: 32 random bytes, clamped per
/// Curve25519, base64-encoded.
pub fn generate_private_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
    BASE64.encode(bytes)
}

/// Derive the public key (Curve25519 scalar-base-mult) from a base64
/// private key. Matches `wg pubkey`.
pub fn private_to_public(private_b64: &str) -> Result<String, KeyError> {
    let bytes = BASE64.decode(private_b64)?;
    let len = bytes.len();
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength(len))?;
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(BASE64.encode(public.as_bytes()))
}

pub fn generate_keypair() -> Result<(String, String), KeyError> {
    let private = generate_private_key();
    let public = private_to_public(&private)?;
    Ok((private, public))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_clamped() {
        for _ in 0..8 {
            let key = generate_private_key();
            let bytes = BASE64.decode(&key).unwrap();
            assert_eq!(bytes.len(), 32);
            assert_eq!(bytes[0] & 7, 0);
            assert_eq!(bytes[31] & 128, 0);
            assert_eq!(bytes[31] & 64, 64);
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let (private, public) = generate_keypair().unwrap();
        assert_eq!(private_to_public(&private).unwrap(), public);
        let decoded = BASE64.decode(&public).unwrap();
        assert_eq!(decoded.len(), 32);
        // A different private key yields a different public key.
        let (other_private, other_public) = generate_keypair().unwrap();
        assert_ne!(private, other_private);
        assert_ne!(public, other_public);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            private_to_public("not base64!!!"),
            Err(KeyError::Decode(_))
        ));
        let short = BASE64.encode([0u8; 16]);
        assert!(matches!(
            private_to_public(&short),
            Err(KeyError::InvalidLength(16))
        ));
    }
}
