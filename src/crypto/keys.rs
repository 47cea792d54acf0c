// src/crypto/keys.rs
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

pub type PublicKeyBytes = [u8; 32];
pub type SignatureBytes = [u8; 64];

/// Verify a signature over `msg` using a 32-byte Ed25519 public key.
/// Returns `true` if the signature verifies; malformed keys never verify.
pub fn verify_bytes(pubkey: &PublicKeyBytes, msg: &[u8], sig: &SignatureBytes) -> bool {
    let vk = match VerifyingKey::from_bytes(pubkey) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let sig = Signature::from_bytes(sig);
    vk.verify(msg, &sig).is_ok()
}

/// Sign `msg` with a 32-byte secret seed.
pub fn sign_bytes(secret_seed: &[u8; 32], msg: &[u8]) -> SignatureBytes {
    let sk = SigningKey::from_bytes(secret_seed);
    sk.sign(msg).to_bytes()
}

/// Derive the verifying (public) key bytes from a 32-byte seed.
pub fn public_from_seed(seed: &[u8; 32]) -> PublicKeyBytes {
    let sk = SigningKey::from_bytes(seed);
    VerifyingKey::from(&sk).to_bytes()
}

/// Parse a hex public key, with or without `0x`.
pub fn parse_public_key(hex_str: &str) -> Option<PublicKeyBytes> {
    let raw = hex::decode(hex_str.trim_start_matches("0x")).ok()?;
    raw.as_slice().try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let seed = [42u8; 32];
        let pk = public_from_seed(&seed);
        let sig = sign_bytes(&seed, b"hello census");
        assert!(verify_bytes(&pk, b"hello census", &sig));
        assert!(!verify_bytes(&pk, b"other message", &sig));
        assert!(!verify_bytes(&public_from_seed(&[7u8; 32]), b"hello census", &sig));
    }

    #[test]
    fn parse_public_key_accepts_prefix() {
        let pk = public_from_seed(&[1u8; 32]);
        let h = hex::encode(pk);
        assert_eq!(parse_public_key(&h), Some(pk));
        assert_eq!(parse_public_key(&format!("0x{}", h)), Some(pk));
        assert_eq!(parse_public_key("abcd"), None);
    }
}
