//! Canonical catalog root.
//!
//! Anti-entropy compares replicas by this single hash, so the enumeration
//! and byte layout below are pinned: any divergence between nodes makes
//! identical logical state hash differently and breaks convergence
//! detection.
//!
//! Leaf enumeration: namespaces in [`Namespace::ALL`] order, then present
//! ids in ascending lexicographic order. Leaf preimage, all fields
//! length-prefixed with `u32` little-endian lengths:
//!
//! ```text
//! ns || 0x1f || id || 0x1f
//!   then for each field in ascending order:
//!     len(field) || field || len(value) || value
//!     || timestamp_nanos (u64 LE) || len(origin) || origin
//! ```
//!
//! Only registers of present ids contribute; tombstoned entities drop out
//! of the root entirely.

use sha2::{Digest, Sha256};
use snapmesh_merkle::MerkleTree;
use snapmesh_primitives::{Hash, Namespace};

use crate::state::CatalogState;

pub(crate) fn catalog_root(state: &CatalogState) -> Hash {
    let mut leaves = Vec::new();

    for ns in Namespace::ALL {
        let Some(namespace) = state.namespace(ns) else {
            continue;
        };

        for id in namespace.set.elements() {
            let mut hasher = Sha256::new();

            hasher.update(ns.as_str().as_bytes());
            hasher.update([0x1f]);
            hasher.update(id.as_bytes());
            hasher.update([0x1f]);

            if let Some(registers) = namespace.fields.get(id) {
                for (field, register) in registers {
                    update_prefixed(&mut hasher, field.as_bytes());
                    update_prefixed(&mut hasher, register.value.as_bytes());
                    hasher.update(register.timestamp_nanos.to_le_bytes());
                    update_prefixed(&mut hasher, register.origin.as_bytes());
                }
            }

            leaves.push(Hash::from_bytes(hasher.finalize().into()));
        }
    }

    MerkleTree::root_of(&leaves)
}

fn update_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_le_bytes());
    hasher.update(bytes);
}
