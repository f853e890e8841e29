//! Global consensus ledger.
//!
//! A fixed validator set maintains an append-only chain of snapshot
//! registration transactions. Consensus is one shot per block: the
//! round-robin proposer assembles a block over its transaction pool,
//! validators countersign after independent validation, and the block
//! commits only under a Byzantine quorum of distinct valid signatures.
//! Committed transactions are provable to third parties through Merkle
//! inclusion proofs anchored in the signed block header.

use snapmesh_primitives::Hash;
use thiserror::Error;

mod block;
mod pool;
mod replica;
mod store;
mod transaction;

pub use block::{Block, BlockHeader, BlockSignature};
pub use replica::{LedgerReplica, TxProof, ValidatorInfo, ValidatorSet};
pub use transaction::{Transaction, TxBody, TxKind};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// A signature failed to verify. Never retried.
    #[error("signature verification failed for {0}")]
    InvalidSignature(String),

    #[error("block needs {need} validator signatures, has {got} valid")]
    QuorumNotReached { got: usize, need: usize },

    /// Malformed transaction or block; rejected and the sender noted.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("block does not extend the local tip (expected height {expected}, got {got})")]
    ChainMismatch { expected: u64, got: u64 },

    #[error("transaction {0} not found in the chain")]
    TxNotFound(Hash),

    #[error("transaction pool is full")]
    PoolFull,

    #[error("unknown validator {0}")]
    UnknownValidator(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt ledger store: {0}")]
    Corrupt(String),
}

pub(crate) mod serde_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
