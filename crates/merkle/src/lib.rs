//! Binary Merkle trees over ordered leaf hashes.
//!
//! Used for three distinct anchors that must agree across every node:
//! snapshot manifests, the catalog root, and per-block transaction roots.
//! The construction is fixed: levels pair adjacent nodes left-to-right, an
//! odd level duplicates its last node, and a parent is the SHA-256 of its
//! children's raw 32-byte digests (never their hex form). An empty leaf
//! list has the well-known all-zero root.

use serde::{Deserialize, Serialize};
use snapmesh_primitives::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MerkleError {
    #[error("leaf index {index} out of range for {leaf_count} leaves")]
    IndexOutOfRange { index: usize, leaf_count: usize },
}

/// Which side of the running hash a proof sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One sibling on the path from a leaf to the root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: Hash,
    pub side: Side,
}

/// Inclusion proof for a single leaf, ordered leaf-to-root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub steps: Vec<ProofStep>,
}

impl Proof {
    /// Recomputes the root from `leaf` and compares against `root`.
    ///
    /// Pure and side-effect free. Fails closed: any mismatch in the path,
    /// the sides, the index, or the claimed leaf count yields `false`.
    #[must_use]
    pub fn verify(&self, root: &Hash, leaf: &Hash, index: usize, leaf_count: usize) -> bool {
        if index >= leaf_count {
            return false;
        }

        if self.steps.len() != depth_for(leaf_count) {
            return false;
        }

        let mut current = *leaf;
        let mut position = index;

        for step in &self.steps {
            // A node at an even position hashes with the sibling on its
            // right, odd with the one on its left. A proof whose sides
            // disagree with the index is forged.
            let expected = if position % 2 == 0 {
                Side::Right
            } else {
                Side::Left
            };
            if step.side != expected {
                return false;
            }

            current = match step.side {
                Side::Left => Hash::combine(&step.hash, &current),
                Side::Right => Hash::combine(&current, &step.hash),
            };
            position /= 2;
        }

        current == *root
    }
}

/// A fully materialized tree, kept level by level.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Builds the tree bottom-up. Empty input produces the sentinel root.
    #[must_use]
    pub fn build(leaves: &[Hash]) -> Self {
        if leaves.is_empty() {
            return Self { levels: Vec::new() };
        }

        let mut levels = vec![leaves.to_vec()];

        while levels[levels.len() - 1].len() > 1 {
            let mut current = levels[levels.len() - 1].clone();

            if current.len() % 2 == 1 {
                let last = current[current.len() - 1];
                current.push(last);
            }

            let next = current
                .chunks(2)
                .map(|pair| Hash::combine(&pair[0], &pair[1]))
                .collect();

            levels.push(next);
        }

        Self { levels }
    }

    /// Convenience for callers that only need the root.
    #[must_use]
    pub fn root_of(leaves: &[Hash]) -> Hash {
        Self::build(leaves).root()
    }

    #[must_use]
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or(Hash::ZERO)
    }

    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Generates the inclusion proof for the leaf at `index`.
    pub fn prove(&self, index: usize) -> Result<Proof, MerkleError> {
        let leaf_count = self.leaf_count();

        if index >= leaf_count {
            return Err(MerkleError::IndexOutOfRange { index, leaf_count });
        }

        let mut steps = Vec::new();
        let mut position = index;

        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling_index, side) = if position % 2 == 0 {
                (position + 1, Side::Right)
            } else {
                (position - 1, Side::Left)
            };

            // The duplicated last node is its own sibling.
            let sibling = level.get(sibling_index).unwrap_or(&level[position]);

            steps.push(ProofStep {
                hash: *sibling,
                side,
            });
            position /= 2;
        }

        Ok(Proof { steps })
    }
}

/// Number of pairing levels above the leaves for a tree of `leaf_count`.
fn depth_for(leaf_count: usize) -> usize {
    if leaf_count <= 1 {
        return 0;
    }

    let mut depth = 0;
    let mut width = leaf_count;
    while width > 1 {
        width = (width + 1) / 2;
        depth += 1;
    }

    depth
}
