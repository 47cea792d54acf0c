// src/census/tree.rs
//! Compact sparse Merkle tree over `(key hash -> weight)`.
//!
//! Leaves are addressed by the bits of their 32-byte key hash, most significant
//! bit first. A leaf is stored at the shallowest depth where its prefix is
//! unique, empty subtrees hash to `ZERO_HASH`, so the shape (and the root)
//! depends only on the set of leaves, never on insertion order. Proof length is
//! the depth of the leaf, not a function of the key space.

use crate::types::{Hash, KeyHash, HASH_LEN, ZERO_HASH};
use sha2::{Digest, Sha256};

/// Maximum depth of a leaf (one level per key-hash bit).
pub const MAX_DEPTH: usize = HASH_LEN * 8;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(key: &KeyHash, weight: u64) -> Hash {
    let mut h = Sha256::new();
    // leaf domain separation prefix 0x00
    h.update([LEAF_PREFIX]);
    h.update(key);
    h.update(weight.to_be_bytes());
    h.finalize().into()
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = Sha256::new();
    // internal node domain separation prefix 0x01
    h.update([NODE_PREFIX]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Bit `depth` of `key`, MSB first.
fn bit(key: &KeyHash, depth: usize) -> bool {
    (key[depth / 8] >> (7 - (depth % 8))) & 1 == 1
}

#[derive(Debug, Clone, Default)]
pub struct SparseTree {
    /// sorted by key hash, keys unique
    leaves: Vec<(KeyHash, u64)>,
}

impl SparseTree {
    /// Build from unique keys; order of the input does not matter.
    pub fn from_leaves<I: IntoIterator<Item = (KeyHash, u64)>>(leaves: I) -> Self {
        let mut leaves: Vec<(KeyHash, u64)> = leaves.into_iter().collect();
        leaves.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        leaves.dedup_by(|a, b| a.0 == b.0);
        Self { leaves }
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn root(&self) -> Hash {
        subtree_hash(&self.leaves, 0)
    }

    /// Weight and authentication path of `key`, or `None` if the key is not a leaf.
    pub fn proof(&self, key: &KeyHash) -> Option<(u64, Vec<Hash>)> {
        let mut slice: &[(KeyHash, u64)] = &self.leaves;
        let mut siblings = Vec::new();
        let mut depth = 0;
        loop {
            match slice {
                [] => return None,
                [(k, w)] => {
                    return if k == key { Some((*w, siblings)) } else { None };
                }
                _ => {
                    let (left, right) = split(slice, depth);
                    if bit(key, depth) {
                        siblings.push(subtree_hash(left, depth + 1));
                        slice = right;
                    } else {
                        siblings.push(subtree_hash(right, depth + 1));
                        slice = left;
                    }
                    depth += 1;
                }
            }
        }
    }
}

/// Partition a sorted slice by the bit at `depth`; zeros sort first.
fn split(slice: &[(KeyHash, u64)], depth: usize) -> (&[(KeyHash, u64)], &[(KeyHash, u64)]) {
    let idx = slice.partition_point(|(k, _)| !bit(k, depth));
    slice.split_at(idx)
}

fn subtree_hash(slice: &[(KeyHash, u64)], depth: usize) -> Hash {
    match slice {
        [] => ZERO_HASH,
        [(k, w)] => leaf_hash(k, *w),
        _ => {
            // distinct keys always diverge before MAX_DEPTH
            debug_assert!(depth < MAX_DEPTH);
            let (left, right) = split(slice, depth);
            node_hash(&subtree_hash(left, depth + 1), &subtree_hash(right, depth + 1))
        }
    }
}

/// Fold an authentication path back to a root. `None` if the path is longer
/// than the tree can be deep.
pub fn compute_root(key: &KeyHash, weight: u64, siblings: &[Hash]) -> Option<Hash> {
    if siblings.len() > MAX_DEPTH {
        return None;
    }
    let mut current = leaf_hash(key, weight);
    for (depth, sibling) in siblings.iter().enumerate().rev() {
        current = if bit(key, depth) {
            node_hash(sibling, &current)
        } else {
            node_hash(&current, sibling)
        };
    }
    Some(current)
}

pub fn verify_proof(key: &KeyHash, weight: u64, siblings: &[Hash], root: &Hash) -> bool {
    compute_root(key, weight, siblings).as_ref() == Some(root)
}
