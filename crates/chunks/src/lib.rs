//! Content-addressed chunk storage.
//!
//! [`Chunker`] decomposes a byte stream into fixed-size chunks addressed by
//! the SHA-256 of their plaintext. [`ChunkStore`] persists those chunks on
//! disk, optionally sealed under a store-scoped AEAD key, and re-verifies
//! the content address on every read.

use snapmesh_primitives::Hash;
use thiserror::Error;

mod chunker;
mod index;
mod store;

pub use chunker::{Chunk, Chunker, DEFAULT_CHUNK_SIZE};
pub use index::ChunkMeta;
pub use store::{ChunkStore, ChunkStoreStats};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChunkError {
    #[error("chunk {0} not found")]
    NotFound(Hash),

    /// The stored bytes no longer hash to their address, or decryption
    /// failed. Never retried: retrying masks corruption.
    #[error("chunk {hash} failed integrity verification")]
    Integrity { hash: Hash },

    #[error("encryption requested but the store has no key")]
    NoEncryptionKey,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt chunk index: {0}")]
    Index(#[from] serde_json::Error),
}

impl ChunkError {
    /// Transient errors are worth a bounded retry; everything else is not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
