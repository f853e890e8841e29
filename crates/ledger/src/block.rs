//! Blocks and their header hashing.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snapmesh_merkle::MerkleTree;
use snapmesh_primitives::{Hash, NodeId};

use crate::serde_base64;
use crate::transaction::Transaction;

/// One validator's countersignature over a block's header hash.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct BlockSignature {
    pub validator: NodeId,
    #[serde(with = "serde_base64")]
    pub signature: Vec<u8>,
}

/// Everything the block hash covers. Signatures live outside: they sign
/// this hash and therefore cannot be part of its preimage.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_block_hash: Hash,
    pub tx_merkle_root: Hash,
    pub proposer_id: NodeId,
    pub timestamp: u64,
}

impl BlockHeader {
    #[must_use]
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.prev_block_hash.as_bytes());
        hasher.update(self.tx_merkle_root.as_bytes());
        hasher.update(self.proposer_id.as_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        Hash::from_bytes(hasher.finalize().into())
    }
}

#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Block {
    pub height: u64,
    pub prev_block_hash: Hash,
    pub transactions: Vec<Transaction>,
    pub tx_merkle_root: Hash,
    pub proposer_id: NodeId,
    pub timestamp: u64,
    pub signatures: Vec<BlockSignature>,
}

impl Block {
    /// Root over the transactions in proposer order.
    #[must_use]
    pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
        let leaves: Vec<_> = transactions.iter().map(Transaction::leaf_hash).collect();
        MerkleTree::root_of(&leaves)
    }

    #[must_use]
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            height: self.height,
            prev_block_hash: self.prev_block_hash,
            tx_merkle_root: self.tx_merkle_root,
            proposer_id: self.proposer_id.clone(),
            timestamp: self.timestamp,
        }
    }

    #[must_use]
    pub fn hash(&self) -> Hash {
        self.header().hash()
    }
}

#[cfg(test)]
mod tests {
    use rand::thread_rng;
    use snapmesh_crypto::ValidatorSigner;

    use super::*;
    use crate::transaction::{TxBody, TxKind};

    fn sample_block() -> Block {
        let signer = ValidatorSigner::random(&mut thread_rng());
        let tx = Transaction::new_signed(
            TxKind::SnapshotRegister,
            TxBody {
                entity_id: "snap1".to_owned(),
                manifest_root: Hash::digest(b"root"),
            },
            NodeId::new("v1").unwrap(),
            &signer,
        );

        let tx_merkle_root = Block::compute_tx_root(std::slice::from_ref(&tx));

        Block {
            height: 1,
            prev_block_hash: Hash::ZERO,
            transactions: vec![tx],
            tx_merkle_root,
            proposer_id: NodeId::new("v1").unwrap(),
            timestamp: 1_700_000_000_000_000_000,
            signatures: Vec::new(),
        }
    }

    #[test]
    fn hash_excludes_signatures() {
        let mut block = sample_block();
        let before = block.hash();

        block.signatures.push(BlockSignature {
            validator: NodeId::new("v2").unwrap(),
            signature: vec![0; 64],
        });

        assert_eq!(block.hash(), before);
    }

    #[test]
    fn hash_covers_every_header_field() {
        let block = sample_block();
        let baseline = block.hash();

        let mut changed = block.clone();
        changed.height = 2;
        assert_ne!(changed.hash(), baseline);

        let mut changed = block.clone();
        changed.prev_block_hash = Hash::digest(b"other");
        assert_ne!(changed.hash(), baseline);

        let mut changed = block.clone();
        changed.tx_merkle_root = Hash::digest(b"other root");
        assert_ne!(changed.hash(), baseline);

        let mut changed = block.clone();
        changed.proposer_id = NodeId::new("v9").unwrap();
        assert_ne!(changed.hash(), baseline);

        let mut changed = block;
        changed.timestamp += 1;
        assert_ne!(changed.hash(), baseline);
    }

    #[test]
    fn empty_tx_list_has_sentinel_root() {
        assert_eq!(Block::compute_tx_root(&[]), Hash::ZERO);
    }

    #[test]
    fn wire_form_uses_hex_hashes_and_base64_signatures() {
        let mut block = sample_block();
        block.signatures.push(BlockSignature {
            validator: NodeId::new("v2").unwrap(),
            signature: vec![0xab; 64],
        });

        let json = serde_json::to_value(&block).unwrap();

        let root = json["tx_merkle_root"].as_str().unwrap();
        assert_eq!(root.len(), 64);
        assert!(root.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));

        let prev = json["prev_block_hash"].as_str().unwrap();
        assert_eq!(prev, Hash::ZERO.to_string());

        let signature = json["signatures"][0]["signature"].as_str().unwrap();
        assert!(signature.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));

        let parsed: Block = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn tx_root_is_order_sensitive() {
        let signer = ValidatorSigner::random(&mut thread_rng());
        let make = |id: &str| {
            Transaction::new_signed(
                TxKind::SnapshotRegister,
                TxBody {
                    entity_id: id.to_owned(),
                    manifest_root: Hash::digest(id.as_bytes()),
                },
                NodeId::new("v1").unwrap(),
                &signer,
            )
        };

        let a = make("snap-a");
        let b = make("snap-b");

        assert_ne!(
            Block::compute_tx_root(&[a.clone(), b.clone()]),
            Block::compute_tx_root(&[b, a])
        );
    }
}
