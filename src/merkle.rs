//! SHA-256 Merkle commitments. Leaves are digests; a node is the hash of its
//! two children, the last node of an odd level is paired with itself.

use ark_bls12_381::Fr;
use ark_ff::{BigInteger, PrimeField};

use crate::hash::digest_sha2;

pub type Hash = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Sibling hashes from the leaf level up.
    pub path: Vec<Hash>,
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    pub levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    pub fn new(leaves: Vec<Hash>) -> Self {
        let mut levels = vec![leaves];
        while let Some(level) = levels.last().filter(|level| level.len() > 1) {
            let next = level
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn get_proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));
        let mut current = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = level.get(current ^ 1).unwrap_or(&level[current]);
            path.push(*sibling);
            current /= 2;
        }
        Some(MerkleProof { path })
    }
}

/// Checks `leaf` at `index` against `root`. Left/right order at every level
/// comes from the index bits, never from the proof.
pub fn verify_merkle_proof(leaf: &Hash, index: usize, proof: &MerkleProof, root: &Hash) -> bool {
    let mut current = *leaf;
    let mut position = index;
    for sibling in &proof.path {
        current = if position % 2 == 1 {
            hash_pair(sibling, &current)
        } else {
            hash_pair(&current, sibling)
        };
        position /= 2;
    }
    position == 0 && current == *root
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(left);
    combined[32..].copy_from_slice(right);
    digest_sha2(&combined)
}

/// Leaf committing to a row of field elements, each as 32 little-endian
/// bytes.
pub fn hash_leaf(values: &[Fr]) -> Hash {
    let mut bytes = Vec::with_capacity(32 * values.len());
    for value in values {
        bytes.extend_from_slice(&value.into_bigint().to_bytes_le());
    }
    digest_sha2(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(count: u64) -> Vec<Hash> {
        (1..=count).map(|i| digest_sha2(&i.to_le_bytes())).collect()
    }

    #[test]
    fn test_merkle_proof_verification() {
        let tree = MerkleTree::new(leaves(4));
        let root = tree.root();
        for (i, leaf) in leaves(4).iter().enumerate() {
            let proof = tree.get_proof(i).unwrap();
            assert_eq!(proof.path.len(), 2);
            assert!(verify_merkle_proof(leaf, i, &proof, &root));
        }
    }

    #[test]
    fn test_merkle_proof_odd_leaves() {
        let tree = MerkleTree::new(leaves(3));
        let root = tree.root();
        for (i, leaf) in leaves(3).iter().enumerate() {
            let proof = tree.get_proof(i).unwrap();
            assert!(verify_merkle_proof(leaf, i, &proof, &root));
        }
    }

    #[test]
    fn test_merkle_proof_single_leaf() {
        let tree = MerkleTree::new(leaves(1));
        let proof = tree.get_proof(0).unwrap();
        assert!(proof.path.is_empty());
        assert!(verify_merkle_proof(&leaves(1)[0], 0, &proof, &tree.root()));
        assert!(tree.get_proof(1).is_none());
    }

    #[test]
    fn test_wrong_index_is_rejected() {
        let tree = MerkleTree::new(leaves(8));
        let root = tree.root();
        let proof = tree.get_proof(2).unwrap();
        assert!(!verify_merkle_proof(&leaves(8)[2], 3, &proof, &root));
        assert!(!verify_merkle_proof(&leaves(8)[2], 2 + 8, &proof, &root));
        assert!(!verify_merkle_proof(&leaves(8)[3], 2, &proof, &root));
    }

    #[test]
    fn test_leaf_encoding_is_positional() {
        let a = hash_leaf(&[Fr::from(1u64), Fr::from(2u64)]);
        let b = hash_leaf(&[Fr::from(2u64), Fr::from(1u64)]);
        assert_ne!(a, b);
    }
}
