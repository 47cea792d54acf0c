// src/crypto/mod.rs
pub mod keys;

use crate::types::{ChainId, Hash, KeyHash, ProcessId, HASH_LEN};
use sha2::{Digest, Sha256};

pub use keys::{
    parse_public_key, public_from_seed, sign_bytes, verify_bytes, PublicKeyBytes, SignatureBytes,
};

pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Census tree key of a voter.
pub fn key_hash(pubkey: &PublicKeyBytes) -> KeyHash {
    sha256(pubkey)
}

/// Hash a vote signature must cover: H(chainID || processID || voteBytes).
/// Field order is fixed; both ids are big-endian u64.
pub fn binding_hash(chain_id: ChainId, process_id: ProcessId, vote_bytes: &[u8]) -> Hash {
    let mut h = Sha256::new();
    h.update(chain_id.to_be_bytes());
    h.update(process_id.to_be_bytes());
    h.update(vote_bytes);
    h.finalize().into()
}

/// Encode a vote value as 32 little-endian bytes.
pub fn vote_bytes_from_value(value: u64) -> Vec<u8> {
    let mut out = vec![0u8; HASH_LEN];
    out[..8].copy_from_slice(&value.to_le_bytes());
    out
}

/// Decode 32 little-endian vote bytes; `None` unless the value fits in u64.
pub fn vote_value_from_bytes(bytes: &[u8]) -> Option<u64> {
    if bytes.len() != HASH_LEN || bytes[8..].iter().any(|b| *b != 0) {
        return None;
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[..8]);
    Some(u64::from_le_bytes(low))
}

/// Sign a vote for `(chain_id, process_id)` with a voter seed.
pub fn sign_vote(
    seed: &[u8; 32],
    chain_id: ChainId,
    process_id: ProcessId,
    vote_bytes: &[u8],
) -> SignatureBytes {
    sign_bytes(seed, &binding_hash(chain_id, process_id, vote_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_hash_covers_every_field() {
        let v = vote_bytes_from_value(1);
        let base = binding_hash(5, 101, &v);
        assert_ne!(base, binding_hash(6, 101, &v));
        assert_ne!(base, binding_hash(5, 102, &v));
        assert_ne!(base, binding_hash(5, 101, &vote_bytes_from_value(0)));
        // ids are not interchangeable
        assert_ne!(binding_hash(1, 2, &v), binding_hash(2, 1, &v));
    }

    #[test]
    fn vote_value_encoding() {
        assert_eq!(vote_value_from_bytes(&vote_bytes_from_value(0)), Some(0));
        assert_eq!(vote_value_from_bytes(&vote_bytes_from_value(u64::MAX)), Some(u64::MAX));
        let mut wide = vote_bytes_from_value(1);
        wide[20] = 1;
        assert_eq!(vote_value_from_bytes(&wide), None);
        assert_eq!(vote_value_from_bytes(&[1u8; 8]), None);
    }

    #[test]
    fn signed_vote_verifies_against_binding_hash() {
        let seed = [9u8; 32];
        let v = vote_bytes_from_value(1);
        let sig = sign_vote(&seed, 5, 101, &v);
        let pk = public_from_seed(&seed);
        assert!(verify_bytes(&pk, &binding_hash(5, 101, &v), &sig));
        assert!(!verify_bytes(&pk, &binding_hash(5, 102, &v), &sig));
    }
}
