//! Fixed-size stream chunking.

use async_stream::try_stream;
use futures_util::Stream;
use snapmesh_primitives::Hash;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ChunkError;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// One chunk of a source stream, addressed by its plaintext hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub hash: Hash,
    pub data: Vec<u8>,
}

/// Splits a byte stream into chunks of at most `chunk_size` bytes.
///
/// The split is a pure function of the input bytes: identical input yields
/// identical chunk sequences (and therefore identical manifests) on every
/// node. The final chunk may be short; empty input yields no chunks at all,
/// which manifests as the all-zero Merkle root downstream.
#[derive(Clone, Copy, Debug)]
pub struct Chunker {
    chunk_size: usize,
}

impl Chunker {
    /// `chunk_size` must be non-zero.
    #[must_use]
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self { chunk_size }
    }

    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Streams `(hash, bytes)` chunks off `reader` until EOF.
    pub fn split<R>(&self, mut reader: R) -> impl Stream<Item = Result<Chunk, ChunkError>>
    where
        R: AsyncRead + Unpin,
    {
        let chunk_size = self.chunk_size;

        try_stream! {
            loop {
                let mut data = Vec::with_capacity(chunk_size.min(1024 * 1024));
                let mut remaining = chunk_size;

                while remaining > 0 {
                    let read = (&mut reader)
                        .take(remaining as u64)
                        .read_buf(&mut data)
                        .await?;

                    if read == 0 {
                        break;
                    }
                    remaining -= read;
                }

                if data.is_empty() {
                    break;
                }

                let hash = Hash::digest(&data);
                yield Chunk { hash, data };
            }
        }
    }
}
