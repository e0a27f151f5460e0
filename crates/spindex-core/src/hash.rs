//! SHA-256 helpers.

use sha2::{Digest, Sha256};

use crate::types::Hash256;

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Double SHA-256, the block and transaction hash function.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    Hash256(Sha256::digest(Sha256::digest(data)).into())
}

/// Hash the concatenation of two hashes (a merkle tree node).
pub fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    double_sha256(&buf)
}
