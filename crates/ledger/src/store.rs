//! Append-only block storage.
//!
//! Records are a `u32` little-endian length followed by borsh bytes of one
//! block. Every append is fsynced before it is acknowledged; a commit is
//! only reported once its block is on stable storage.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::block::Block;
use crate::LedgerError;

const LEDGER_FILE: &str = "ledger.log";

#[derive(Debug)]
pub(crate) struct LedgerStore {
    file: File,
}

impl LedgerStore {
    pub(crate) fn open(dir: impl Into<Utf8PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LEDGER_FILE))?;

        Ok(Self { file })
    }

    pub(crate) fn append(&mut self, block: &Block) -> Result<(), LedgerError> {
        let bytes = borsh::to_vec(block).map_err(|err| LedgerError::Corrupt(err.to_string()))?;

        self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(&bytes)?;
        self.file.sync_all()?;

        Ok(())
    }

    /// Reads the chain back; a torn trailing record is discarded.
    pub(crate) fn read_chain(dir: &Utf8Path) -> Result<Vec<Block>, LedgerError> {
        let mut file = match File::open(dir.join(LEDGER_FILE)) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut blocks = Vec::new();

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
                    warn!("discarding torn trailing ledger record");
                    break;
                }
                Err(err) => return Err(err.into()),
            }

            let block = borsh::from_slice(&bytes)
                .map_err(|err| LedgerError::Corrupt(format!("block record: {err}")))?;
            blocks.push(block);
        }

        Ok(blocks)
    }
}
