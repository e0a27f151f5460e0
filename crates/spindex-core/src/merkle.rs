//! Bitcoin-style double-SHA256 merkle trees.
//!
//! Odd-length layers are padded by duplicating the last element. Branches
//! are listed deepest pairing first, so a verifier folds them from the leaf
//! up with [`root_from_branch`].
//!
//! [`MerkleCache`] keeps one intermediate level of a large tree (the header
//! chain) so checkpoint proofs only hash one segment of leaves plus the
//! cached level instead of the whole chain.

use thiserror::Error;

use crate::error::IndexError;
use crate::hash::hash_pair;
use crate::types::Hash256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("no hashes")] Empty,
    #[error("index {index} out of range for {count} hashes")] IndexOutOfRange { index: usize, count: usize },
    #[error("branch length {requested} shorter than natural length {natural}")] LengthTooShort { requested: u32, natural: u32 },
    #[error("leaf hashes inconsistent with cached level")] Inconsistent,
}

/// Number of branch elements needed for `hash_count` leaves: `ceil(log2(n))`.
pub fn branch_length(hash_count: usize) -> u32 {
    if hash_count <= 1 {
        return 0;
    }
    usize::BITS - (hash_count - 1).leading_zeros()
}

/// Depth of a tree over `hash_count` leaves, counting the leaf layer.
pub fn tree_depth(hash_count: usize) -> u32 {
    branch_length(hash_count) + 1
}

/// Return the branch for the leaf at `index` and the tree root.
///
/// `length` forces a branch of at least the natural length, which is how a
/// partial segment is hashed as if padded to a full power of two.
pub fn branch_and_root(
    hashes: &[Hash256],
    index: usize,
    length: Option<u32>,
) -> Result<(Vec<Hash256>, Hash256), MerkleError> {
    if hashes.is_empty() {
        return Err(MerkleError::Empty);
    }
    if index >= hashes.len() {
        return Err(MerkleError::IndexOutOfRange { index, count: hashes.len() });
    }
    let natural = branch_length(hashes.len());
    let length = length.unwrap_or(natural);
    if length < natural {
        return Err(MerkleError::LengthTooShort { requested: length, natural });
    }

    let mut layer = hashes.to_vec();
    let mut index = index;
    let mut branch = Vec::with_capacity(length as usize);
    for _ in 0..length {
        if layer.len() & 1 == 1 {
            layer.push(layer[layer.len() - 1]);
        }
        branch.push(layer[index ^ 1]);
        index >>= 1;
        layer = layer.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }
    Ok((branch, layer[0]))
}

/// Merkle root of `hashes`. [`Hash256::ZERO`] for an empty slice.
pub fn merkle_root(hashes: &[Hash256]) -> Hash256 {
    branch_and_root(hashes, 0, None)
        .map(|(_, root)| root)
        .unwrap_or(Hash256::ZERO)
}

/// Fold a branch from a leaf up to the root it commits to.
pub fn root_from_branch(leaf: Hash256, index: usize, branch: &[Hash256]) -> Hash256 {
    let mut hash = leaf;
    let mut index = index;
    for elt in branch {
        hash = if index & 1 == 1 { hash_pair(elt, &hash) } else { hash_pair(&hash, elt) };
        index >>= 1;
    }
    hash
}

/// Roots of consecutive segments of `1 << depth_higher` leaves.
pub fn level(hashes: &[Hash256], depth_higher: u32) -> Vec<Hash256> {
    let size = 1usize << depth_higher;
    hashes
        .chunks(size)
        .filter_map(|chunk| branch_and_root(chunk, 0, Some(depth_higher)).ok())
        .map(|(_, root)| root)
        .collect()
}

/// Combine a segment branch and a level branch into a full branch.
pub fn branch_and_root_from_level(
    level: &[Hash256],
    leaf_hashes: &[Hash256],
    index: usize,
    depth_higher: u32,
) -> Result<(Vec<Hash256>, Hash256), MerkleError> {
    let leaf_index = (index >> depth_higher) << depth_higher;
    let (mut branch, leaf_root) =
        branch_and_root(leaf_hashes, index - leaf_index, Some(depth_higher))?;
    let level_index = index >> depth_higher;
    let (level_branch, root) = branch_and_root(level, level_index, None)?;
    if leaf_root != level[level_index] {
        return Err(MerkleError::Inconsistent);
    }
    branch.extend(level_branch);
    Ok((branch, root))
}

/// Source of leaf hashes for a [`MerkleCache`]: `(start, count) -> hashes`.
pub trait LeafSource {
    fn leaf_hashes(&self, start: usize, count: usize) -> Result<Vec<Hash256>, IndexError>;
}

impl<F> LeafSource for F
where
    F: Fn(usize, usize) -> Result<Vec<Hash256>, IndexError>,
{
    fn leaf_hashes(&self, start: usize, count: usize) -> Result<Vec<Hash256>, IndexError> {
        self(start, count)
    }
}

/// Cached intermediate level of a growing merkle tree.
#[derive(Clone, Debug)]
pub struct MerkleCache {
    depth_higher: u32,
    level: Vec<Hash256>,
    length: usize,
}

impl MerkleCache {
    /// Build the cache over the first `length` leaves (at least one).
    pub fn new(length: usize, source: &impl LeafSource) -> Result<Self, IndexError> {
        if length == 0 {
            return Err(MerkleError::Empty.into());
        }
        let depth_higher = tree_depth(length) / 2;
        let hashes = source.leaf_hashes(0, length)?;
        Ok(Self { depth_higher, level: level(&hashes, depth_higher), length })
    }

    /// Number of leaves covered.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn segment_length(&self) -> usize {
        1 << self.depth_higher
    }

    fn leaf_start(&self, index: usize) -> usize {
        (index >> self.depth_higher) << self.depth_higher
    }

    fn extend_to(&mut self, length: usize, source: &impl LeafSource) -> Result<(), IndexError> {
        if length <= self.length {
            return Ok(());
        }
        let start = self.leaf_start(self.length);
        let hashes = source.leaf_hashes(start, length - start)?;
        self.level.truncate(start >> self.depth_higher);
        self.level.extend(level(&hashes, self.depth_higher));
        self.length = length;
        Ok(())
    }

    fn level_for(&self, length: usize, source: &impl LeafSource) -> Result<Vec<Hash256>, IndexError> {
        let mut out = self.level[..length >> self.depth_higher].to_vec();
        let leaf_start = self.leaf_start(length);
        let count = self.segment_length().min(length - leaf_start);
        if count > 0 {
            let hashes = source.leaf_hashes(leaf_start, count)?;
            out.extend(level(&hashes, self.depth_higher));
        }
        Ok(out)
    }

    /// Forget leaves at and beyond `length`, rounded down to a segment start.
    pub fn truncate(&mut self, length: usize) {
        if length >= self.length {
            return;
        }
        let length = self.leaf_start(length);
        self.length = length;
        self.level.truncate(length >> self.depth_higher);
    }

    /// Branch and root for leaf `index` of the tree over the first `length`
    /// leaves.
    pub fn branch_and_root(
        &mut self,
        length: usize,
        index: usize,
        source: &impl LeafSource,
    ) -> Result<(Vec<Hash256>, Hash256), IndexError> {
        if index >= length {
            return Err(MerkleError::IndexOutOfRange { index, count: length }.into());
        }
        self.extend_to(length, source)?;
        let leaf_start = self.leaf_start(index);
        let count = self.segment_length().min(length - leaf_start);
        let leaf_hashes = source.leaf_hashes(leaf_start, count)?;
        if length < self.segment_length() {
            return Ok(branch_and_root(&leaf_hashes, index, None)?);
        }
        let level = self.level_for(length, source)?;
        Ok(branch_and_root_from_level(&level, &leaf_hashes, index, self.depth_higher)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::double_sha256;

    fn leaves(n: usize) -> Vec<Hash256> {
        (0..n as u32).map(|i| double_sha256(&i.to_le_bytes())).collect()
    }

    fn source(hashes: Vec<Hash256>) -> impl Fn(usize, usize) -> Result<Vec<Hash256>, IndexError> {
        move |start, count| Ok(hashes[start..start + count].to_vec())
    }

    #[test]
    fn branch_lengths() {
        assert_eq!(branch_length(1), 0);
        assert_eq!(branch_length(2), 1);
        assert_eq!(branch_length(3), 2);
        assert_eq!(branch_length(8), 3);
        assert_eq!(branch_length(9), 4);
        assert_eq!(tree_depth(9), 5);
    }

    #[test]
    fn single_leaf_is_root() {
        let h = leaves(1);
        assert_eq!(merkle_root(&h), h[0]);
        let (branch, root) = branch_and_root(&h, 0, None).unwrap();
        assert!(branch.is_empty());
        assert_eq!(root, h[0]);
    }

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
        assert_eq!(branch_and_root(&[], 0, None), Err(MerkleError::Empty));
    }

    #[test]
    fn odd_layer_duplicates_last() {
        let h = leaves(3);
        let expected = hash_pair(&hash_pair(&h[0], &h[1]), &hash_pair(&h[2], &h[2]));
        assert_eq!(merkle_root(&h), expected);
    }

    #[test]
    fn every_branch_folds_to_root() {
        for n in 1..40 {
            let h = leaves(n);
            let root = merkle_root(&h);
            for (i, leaf) in h.iter().enumerate() {
                let (branch, r) = branch_and_root(&h, i, None).unwrap();
                assert_eq!(r, root);
                assert_eq!(branch.len() as u32, branch_length(n));
                assert_eq!(root_from_branch(*leaf, i, &branch), root, "n={n} i={i}");
            }
        }
    }

    #[test]
    fn index_out_of_range() {
        let h = leaves(4);
        assert_eq!(
            branch_and_root(&h, 4, None),
            Err(MerkleError::IndexOutOfRange { index: 4, count: 4 })
        );
    }

    #[test]
    fn forced_length_too_short() {
        let h = leaves(5);
        assert!(matches!(branch_and_root(&h, 0, Some(2)), Err(MerkleError::LengthTooShort { .. })));
    }

    // ------------------------------------------------------------------
    // MerkleCache
    // ------------------------------------------------------------------

    #[test]
    fn cache_matches_direct_computation() {
        let all = leaves(300);
        let src = source(all.clone());
        let mut cache = MerkleCache::new(100, &src).unwrap();
        for length in [1usize, 2, 7, 64, 99, 100, 101, 150, 257, 300] {
            for index in [0, length / 2, length - 1] {
                let expected = branch_and_root(&all[..length], index, None).unwrap();
                let got = cache.branch_and_root(length, index, &src).unwrap();
                assert_eq!(got, expected, "length={length} index={index}");
            }
        }
        assert_eq!(cache.len(), 300);
    }

    #[test]
    fn cache_truncate_then_regrow_with_new_leaves() {
        let mut all = leaves(120);
        let mut cache = MerkleCache::new(120, &source(all.clone())).unwrap();
        cache.truncate(90);
        assert!(cache.len() <= 90);

        // Replace the tail, as a reorg would.
        for (i, h) in all.iter_mut().enumerate().skip(90) {
            *h = double_sha256(&(i as u64 + 1_000_000).to_le_bytes());
        }
        let src = source(all.clone());
        let expected = branch_and_root(&all, 100, None).unwrap();
        assert_eq!(cache.branch_and_root(120, 100, &src).unwrap(), expected);
    }

    #[test]
    fn cache_rejects_index_past_length() {
        let src = source(leaves(10));
        let mut cache = MerkleCache::new(10, &src).unwrap();
        assert!(cache.branch_and_root(5, 5, &src).is_err());
    }
}
