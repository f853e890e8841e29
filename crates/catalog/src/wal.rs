//! Write-ahead log and checkpoints for catalog durability.
//!
//! Record framing is a `u32` little-endian length followed by the borsh
//! bytes of one [`Delta`]. Recovery loads the latest checkpoint, then
//! replays the log tail; a torn trailing record (crash mid-append) is
//! tolerated and discarded.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::delta::Delta;
use crate::state::CatalogState;
use crate::CatalogError;

const LOG_FILE: &str = "catalog.log";
const CHECKPOINT_FILE: &str = "checkpoint.bin";

#[derive(Debug)]
pub(crate) struct DeltaLog {
    dir: Utf8PathBuf,
    file: File,
}

impl DeltaLog {
    pub(crate) fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, CatalogError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;

        Ok(Self { dir, file })
    }

    /// Appends one delta and flushes it to stable storage before returning.
    pub(crate) fn append(&mut self, delta: &Delta) -> Result<(), CatalogError> {
        let bytes =
            borsh::to_vec(delta).map_err(|err| CatalogError::Corrupt(err.to_string()))?;

        self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;

        Ok(())
    }

    /// Persists a full-state checkpoint and truncates the log.
    pub(crate) fn checkpoint(&mut self, state: &CatalogState) -> Result<(), CatalogError> {
        let path = self.dir.join(CHECKPOINT_FILE);
        let tmp = path.with_extension("bin.tmp");

        let bytes =
            borsh::to_vec(state).map_err(|err| CatalogError::Corrupt(err.to_string()))?;

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &path)?;

        self.file.set_len(0)?;
        let _position = self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;

        Ok(())
    }

    pub(crate) fn load_checkpoint(dir: &Utf8Path) -> Result<Option<CatalogState>, CatalogError> {
        match std::fs::read(dir.join(CHECKPOINT_FILE)) {
            Ok(bytes) => {
                let state = borsh::from_slice(&bytes)
                    .map_err(|err| CatalogError::Corrupt(format!("checkpoint: {err}")))?;
                Ok(Some(state))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads every intact record in the log.
    pub(crate) fn read_log(dir: &Utf8Path) -> Result<Vec<Delta>, CatalogError> {
        let mut file = match File::open(dir.join(LOG_FILE)) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut deltas = Vec::new();

        loop {
            let mut len_bytes = [0; 4];
            match file.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut bytes = vec![0; len];
            match file.read_exact(&mut bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    warn!("discarding torn trailing log record");
                    break;
                }
                Err(err) => return Err(err.into()),
            }

            let delta = borsh::from_slice(&bytes)
                .map_err(|err| CatalogError::Corrupt(format!("log record: {err}")))?;
            deltas.push(delta);
        }

        Ok(deltas)
    }
}
