//! On-disk content-addressed chunk store.

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use parking_lot::Mutex;
use snapmesh_crypto::ChunkKey;
use snapmesh_primitives::Hash;
use tokio::fs;
use tracing::{debug, warn};

use crate::index::{ChunkIndex, ChunkMeta};
use crate::ChunkError;

const CHUNKS_DIR: &str = "chunks";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkStoreStats {
    pub chunks: usize,
    pub total_bytes: u64,
    pub encrypted: usize,
}

/// Stores one file per chunk under `<root>/chunks/<hex>`, with a side index
/// recording plaintext size, encryption flag and creation time.
///
/// All operations are safe to call concurrently. Concurrent puts of the
/// same hash coalesce into a single on-disk write; every caller sees
/// success. Callers only ever see plaintext; the sealed on-disk form
/// never crosses the API.
#[derive(Debug)]
pub struct ChunkStore {
    chunks_dir: Utf8PathBuf,
    key: Option<ChunkKey>,
    index: Mutex<ChunkIndex>,
    pins: Mutex<HashMap<Hash, u64>>,
    write_locks: DashMap<Hash, Arc<tokio::sync::Mutex<()>>>,
}

impl ChunkStore {
    pub async fn open(
        root: impl AsRef<Utf8Path>,
        key: Option<ChunkKey>,
    ) -> Result<Self, ChunkError> {
        let root = root.as_ref();
        let chunks_dir = root.join(CHUNKS_DIR);

        fs::create_dir_all(&chunks_dir).await?;
        let index = ChunkIndex::load(root)?;

        Ok(Self {
            chunks_dir,
            key,
            index: Mutex::new(index),
            pins: Mutex::new(HashMap::new()),
            write_locks: DashMap::new(),
        })
    }

    /// Stores `plaintext` under its content address and returns it.
    ///
    /// Idempotent: a hash that is already present skips the write entirely.
    pub async fn put(&self, plaintext: Vec<u8>, encrypt: bool) -> Result<Hash, ChunkError> {
        let hash = Hash::digest(&plaintext);

        if self.index.lock().contains(&hash) {
            return Ok(hash);
        }

        let lock = self
            .write_locks
            .entry(hash)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        // A racing writer may have finished while we waited.
        if self.index.lock().contains(&hash) {
            drop(guard);
            return Ok(hash);
        }

        let size = plaintext.len() as u64;
        let stored = if encrypt {
            let key = self.key.as_ref().ok_or(ChunkError::NoEncryptionKey)?;
            key.seal(plaintext)
                .map_err(|_| ChunkError::Integrity { hash })?
        } else {
            plaintext
        };

        let path = self.chunk_path(&hash);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &stored).await?;
        fs::rename(&tmp, &path).await?;

        self.index.lock().insert(hash, ChunkMeta::new(size, encrypt))?;

        drop(guard);
        let _removed = self.write_locks.remove(&hash);

        debug!(%hash, size, encrypted = encrypt, "chunk stored");

        Ok(hash)
    }

    /// Retrieves the plaintext stored under `hash`.
    ///
    /// The bytes are unsealed if needed and re-hashed before they are
    /// returned; a mismatch is an integrity failure, not a value.
    pub async fn get(&self, hash: &Hash) -> Result<Vec<u8>, ChunkError> {
        let meta = self
            .index
            .lock()
            .get(hash)
            .ok_or(ChunkError::NotFound(*hash))?;

        let stored = fs::read(self.chunk_path(hash)).await?;

        let plaintext = if meta.encrypted {
            let key = self.key.as_ref().ok_or(ChunkError::NoEncryptionKey)?;
            key.open(&stored).map_err(|_| {
                warn!(%hash, "chunk failed to unseal");
                ChunkError::Integrity { hash: *hash }
            })?
        } else {
            stored
        };

        if Hash::digest(&plaintext) != *hash {
            warn!(%hash, "chunk content does not match its address");
            return Err(ChunkError::Integrity { hash: *hash });
        }

        Ok(plaintext)
    }

    /// Whether a present blob still round-trips to its address.
    ///
    /// Absent blobs report `false`; only unexpected I/O failures error.
    pub async fn verify(&self, hash: &Hash) -> Result<bool, ChunkError> {
        match self.get(hash).await {
            Ok(_) => Ok(true),
            Err(ChunkError::Integrity { .. } | ChunkError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn delete(&self, hash: &Hash) -> Result<(), ChunkError> {
        if self.index.lock().remove(hash)?.is_none() {
            return Err(ChunkError::NotFound(*hash));
        }

        match fs::remove_file(self.chunk_path(hash)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    #[must_use]
    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.lock().contains(hash)
    }

    #[must_use]
    pub fn meta(&self, hash: &Hash) -> Option<ChunkMeta> {
        self.index.lock().get(hash)
    }

    /// Marks `hash` as referenced by a live snapshot.
    ///
    /// Reference counts are the hook a future collector sweeps against;
    /// collection itself lives outside the store.
    pub fn pin(&self, hash: &Hash) {
        *self.pins.lock().entry(*hash).or_insert(0) += 1;
    }

    pub fn unpin(&self, hash: &Hash) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(hash) {
            *count -= 1;
            if *count == 0 {
                let _removed = pins.remove(hash);
            }
        }
    }

    #[must_use]
    pub fn refs(&self, hash: &Hash) -> u64 {
        self.pins.lock().get(hash).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> ChunkStoreStats {
        let index = self.index.lock();

        let mut stats = ChunkStoreStats {
            chunks: index.len(),
            ..Default::default()
        };

        for (_, meta) in index.entries() {
            stats.total_bytes += meta.size;
            if meta.encrypted {
                stats.encrypted += 1;
            }
        }

        stats
    }

    fn chunk_path(&self, hash: &Hash) -> Utf8PathBuf {
        self.chunks_dir.join(hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use rand::{thread_rng, RngCore};

    use super::*;

    fn temp_root(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    async fn open_plain(dir: &tempfile::TempDir) -> ChunkStore {
        ChunkStore::open(temp_root(dir), None).await.unwrap()
    }

    async fn open_encrypted(dir: &tempfile::TempDir) -> ChunkStore {
        ChunkStore::open(temp_root(dir), Some(ChunkKey::new([0; 32])))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        let hash = store.put(b"some chunk".to_vec(), false).await.unwrap();

        assert_eq!(hash, Hash::digest(b"some chunk"));
        assert_eq!(store.get(&hash).await.unwrap(), b"some chunk");
    }

    #[tokio::test]
    async fn encrypted_round_trip_hides_plaintext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_encrypted(&dir).await;

        let payload = b"sealed chunk bytes".to_vec();
        let hash = store.put(payload.clone(), true).await.unwrap();

        // Address is still the plaintext hash.
        assert_eq!(hash, Hash::digest(&payload));
        assert_eq!(store.get(&hash).await.unwrap(), payload);

        let on_disk = std::fs::read(dir.path().join("chunks").join(hash.to_string())).unwrap();
        assert_ne!(on_disk, payload);
        assert!(on_disk.len() > payload.len());
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        let first = store.put(b"same bytes".to_vec(), false).await.unwrap();
        let second = store.put(b"same bytes".to_vec(), false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.stats().chunks, 1);
    }

    #[tokio::test]
    async fn concurrent_puts_of_same_hash_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(open_plain(&dir).await);

        let payload = vec![0x5a; 4096];
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let payload = payload.clone();
                tokio::spawn(async move { store.put(payload, false).await })
            })
            .collect();

        let mut hashes = Vec::new();
        for task in tasks {
            hashes.push(task.await.unwrap().unwrap());
        }

        assert!(hashes.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.stats().chunks, 1);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        let missing = Hash::digest(b"never stored");

        assert!(matches!(
            store.get(&missing).await,
            Err(ChunkError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tampered_chunk_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        let hash = store.put(b"original".to_vec(), false).await.unwrap();

        let path = dir.path().join("chunks").join(hash.to_string());
        std::fs::write(&path, b"originaX").unwrap();

        assert!(matches!(
            store.get(&hash).await,
            Err(ChunkError::Integrity { .. })
        ));
        assert!(!store.verify(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_encrypted(&dir).await;

        let hash = store.put(b"sealed payload".to_vec(), true).await.unwrap();

        let path = dir.path().join("chunks").join(hash.to_string());
        let mut sealed = std::fs::read(&path).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        std::fs::write(&path, sealed).unwrap();

        assert!(matches!(
            store.get(&hash).await,
            Err(ChunkError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn verify_tracks_get_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        let hash = store.put(b"verifiable".to_vec(), false).await.unwrap();

        assert!(store.verify(&hash).await.unwrap());
        assert!(!store.verify(&Hash::digest(b"absent")).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_blob_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        let hash = store.put(b"short lived".to_vec(), false).await.unwrap();
        store.delete(&hash).await.unwrap();

        assert!(!store.contains(&hash));
        assert!(matches!(
            store.get(&hash).await,
            Err(ChunkError::NotFound(_))
        ));
        assert!(matches!(
            store.delete(&hash).await,
            Err(ChunkError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn encryption_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        assert!(matches!(
            store.put(b"nope".to_vec(), true).await,
            Err(ChunkError::NoEncryptionKey)
        ));
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let root = temp_root(&dir);

        let hash = {
            let store = ChunkStore::open(&root, None).await.unwrap();
            store.put(b"durable".to_vec(), false).await.unwrap()
        };

        let reopened = ChunkStore::open(&root, None).await.unwrap();
        assert!(reopened.contains(&hash));
        assert_eq!(reopened.get(&hash).await.unwrap(), b"durable");
    }

    #[tokio::test]
    async fn pins_count_references() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_plain(&dir).await;

        let hash = store.put(b"pinned".to_vec(), false).await.unwrap();

        store.pin(&hash);
        store.pin(&hash);
        assert_eq!(store.refs(&hash), 2);

        store.unpin(&hash);
        store.unpin(&hash);
        assert_eq!(store.refs(&hash), 0);
    }

    #[tokio::test]
    async fn large_random_payload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_encrypted(&dir).await;

        let mut payload = vec![0; 1 << 20];
        thread_rng().fill_bytes(&mut payload);

        let hash = store.put(payload.clone(), true).await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), payload);
    }
}
