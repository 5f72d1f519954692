//! Merkle tree over opaque byte leaves, used to commit to the member
//! proofs of a batch. Leaf order is significant: reordering changes the root.

use serde::{Deserialize, Serialize};

use crate::crypto::sha256;

/// Which side of the running hash a sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Vec<u8>,
    pub side: Side,
}

/// Inclusion proof for one leaf, ordered from the leaf layer up to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: usize,
    pub steps: Vec<ProofStep>,
}

#[derive(Debug, Clone)]
pub struct MerkleAggregator {
    leaf_count: usize,
    layers: Vec<Vec<Vec<u8>>>,
}

impl MerkleAggregator {
    /// Build the tree. Leaves are hashed individually, then each layer is
    /// paired left-to-right; an odd node out is paired with itself.
    pub fn new<L: AsRef<[u8]>>(leaves: &[L]) -> Self {
        if leaves.is_empty() {
            return Self {
                leaf_count: 0,
                layers: vec![vec![sha256(&[])]],
            };
        }

        let mut current: Vec<Vec<u8>> = leaves.iter().map(|leaf| sha256(leaf.as_ref())).collect();
        let mut layers = Vec::new();

        while current.len() > 1 {
            let next: Vec<Vec<u8>> = current
                .chunks(2)
                .map(|chunk| {
                    let left = &chunk[0];
                    let right = chunk.get(1).unwrap_or(left); // Duplicate last node if odd number
                    sha256(&[left.as_slice(), right.as_slice()].concat())
                })
                .collect();
            layers.push(current);
            current = next;
        }
        layers.push(current);

        Self {
            leaf_count: leaves.len(),
            layers,
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Get Merkle root hash
    pub fn root(&self) -> &[u8] {
        // layers always holds at least the root layer
        &self.layers[self.layers.len() - 1][0]
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Inclusion proof for the leaf at `index`, or `None` if out of range.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count {
            return None;
        }

        let mut steps = Vec::with_capacity(self.layers.len().saturating_sub(1));
        let mut current_index = index;

        for layer in &self.layers[..self.layers.len() - 1] {
            let step = if current_index % 2 == 0 {
                // Sibling to the right, or ourselves when the layer is odd
                let sibling = layer
                    .get(current_index + 1)
                    .unwrap_or(&layer[current_index]);
                ProofStep {
                    sibling: sibling.clone(),
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    sibling: layer[current_index - 1].clone(),
                    side: Side::Left,
                }
            };
            steps.push(step);
            current_index /= 2;
        }

        Some(MerkleProof {
            leaf_index: index,
            steps,
        })
    }

    /// Recompute the path from `leaf` and compare against `root`.
    pub fn verify(leaf: &[u8], proof: &MerkleProof, root: &[u8]) -> bool {
        let mut current = sha256(leaf);

        for step in &proof.steps {
            let combined = match step.side {
                Side::Left => [step.sibling.as_slice(), current.as_slice()].concat(),
                Side::Right => [current.as_slice(), step.sibling.as_slice()].concat(),
            };
            current = sha256(&combined);
        }

        current == root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{}", i).into_bytes()).collect()
    }

    #[test]
    fn test_empty_tree_root_is_hash_of_empty() {
        let tree = MerkleAggregator::new::<Vec<u8>>(&[]);
        assert_eq!(tree.root(), sha256(&[]).as_slice());
        assert!(tree.proof(0).is_none());
    }

    #[test]
    fn test_single_leaf_root_is_leaf_hash() {
        let tree = MerkleAggregator::new(&leaves(1));
        assert_eq!(tree.root(), sha256(b"leaf-0").as_slice());

        let proof = tree.proof(0).unwrap();
        assert!(proof.steps.is_empty());
        assert!(MerkleAggregator::verify(b"leaf-0", &proof, tree.root()));
    }

    #[test]
    fn test_every_leaf_verifies() {
        for n in 1..=9 {
            let data = leaves(n);
            let tree = MerkleAggregator::new(&data);
            for (i, leaf) in data.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(
                    MerkleAggregator::verify(leaf, &proof, tree.root()),
                    "leaf {} of {} failed",
                    i,
                    n
                );
            }
        }
    }

    #[test]
    fn test_odd_layer_duplicates_last_node() {
        let data = leaves(3);
        let tree = MerkleAggregator::new(&data);

        let h: Vec<Vec<u8>> = data.iter().map(|l| sha256(l)).collect();
        let left = sha256(&[h[0].as_slice(), h[1].as_slice()].concat());
        let right = sha256(&[h[2].as_slice(), h[2].as_slice()].concat());
        let expected = sha256(&[left.as_slice(), right.as_slice()].concat());

        assert_eq!(tree.root(), expected.as_slice());
    }

    #[test]
    fn test_mutating_a_leaf_changes_root() {
        let data = leaves(5);
        let root = MerkleAggregator::new(&data).root().to_vec();

        for i in 0..data.len() {
            let mut mutated = data.clone();
            mutated[i].push(b'!');
            assert_ne!(MerkleAggregator::new(&mutated).root(), root.as_slice());
        }
    }

    #[test]
    fn test_swapped_side_fails_verification() {
        let data = leaves(4);
        let tree = MerkleAggregator::new(&data);
        let mut proof = tree.proof(1).unwrap();
        proof.steps[0].side = Side::Right;

        assert!(!MerkleAggregator::verify(&data[1], &proof, tree.root()));
    }

    #[test]
    fn test_wrong_leaf_fails_verification() {
        let data = leaves(4);
        let tree = MerkleAggregator::new(&data);
        let proof = tree.proof(2).unwrap();

        assert!(!MerkleAggregator::verify(&data[3], &proof, tree.root()));
    }
}
