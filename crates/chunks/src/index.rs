//! Side index mapping chunk hashes to their stored metadata.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use snapmesh_primitives::Hash;

use crate::ChunkError;

pub const INDEX_FILE: &str = "index.json";

/// Metadata recorded alongside every stored chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Plaintext size; the on-disk file is larger when sealed.
    pub size: u64,
    pub encrypted: bool,
    pub created_at: u64,
}

impl ChunkMeta {
    pub(crate) fn new(size: u64, encrypted: bool) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        Self {
            size,
            encrypted,
            created_at,
        }
    }
}

/// In-memory view of the index file; rewritten atomically on mutation.
#[derive(Debug, Default)]
pub(crate) struct ChunkIndex {
    path: Utf8PathBuf,
    entries: HashMap<Hash, ChunkMeta>,
}

impl ChunkIndex {
    pub(crate) fn load(dir: &Utf8Path) -> Result<Self, ChunkError> {
        let path = dir.join(INDEX_FILE);

        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self { path, entries })
    }

    pub(crate) fn get(&self, hash: &Hash) -> Option<ChunkMeta> {
        self.entries.get(hash).copied()
    }

    pub(crate) fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub(crate) fn insert(&mut self, hash: Hash, meta: ChunkMeta) -> Result<(), ChunkError> {
        let _previous = self.entries.insert(hash, meta);
        self.persist()
    }

    pub(crate) fn remove(&mut self, hash: &Hash) -> Result<Option<ChunkMeta>, ChunkError> {
        let removed = self.entries.remove(hash);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&Hash, &ChunkMeta)> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Write-then-rename so a crash never leaves a torn index behind.
    fn persist(&self) -> Result<(), ChunkError> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.entries)?;

        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;

        Ok(())
    }
}
