//! Append-only block log persisted as line-delimited JSON records.
//!
//! `block.db` holds one `BlockRecord` per line in application order, which
//! makes the on-disk order the replay order. There is no index; both scan
//! directions are linear. That is acceptable because reads serve peer
//! backfill and debugging, not the hot path.

use crate::core::block::BlockRecord;
use crate::types::hash::Hash;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tinychain_derive::Error;

#[derive(Debug, Error)]
pub enum BlockStoreError {
    /// Reading or writing the log failed.
    #[error("block store io failure: {0}")]
    Io(String),
    /// A persisted line does not parse as a block record.
    #[error("corrupt block record at line {line}: {reason}")]
    CorruptRecord { line: usize, reason: String },
}

/// Handle on a `block.db` file.
///
/// Cheap to clone: appends open the file per call with `O_APPEND`, and every
/// reader opens its own handle, so clones never share file state.
#[derive(Clone, Debug)]
pub struct BlockStore {
    path: PathBuf,
}

impl BlockStore {
    pub fn new(datadir: &Path) -> Self {
        Self {
            path: datadir.join("block.db"),
        }
    }

    /// Appends one record as a JSON line and syncs it to disk.
    ///
    /// The sync keeps the persisted chain crash-consistent; losing unpersisted
    /// mempool transactions on a crash is acceptable, losing blocks is not.
    pub fn append(&self, record: &BlockRecord) -> Result<(), BlockStoreError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| BlockStoreError::Io(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| BlockStoreError::Io(e.to_string()))
    }

    /// Returns up to `n` records that were appended after the record keyed
    /// `from`, in insertion order.
    ///
    /// A zero `from` starts at the beginning of the log; an unknown `from`
    /// yields nothing.
    pub fn get_blocks_after(
        &self,
        from: Hash,
        n: usize,
    ) -> Result<Vec<BlockRecord>, BlockStoreError> {
        let mut out = Vec::new();
        let mut found = from.is_zero();

        self.scan(|record| {
            if found {
                out.push(record);
                out.len() < n
            } else {
                found = record.hash == from;
                true
            }
        })?;

        Ok(out)
    }

    /// Returns the `n` records appended immediately before the record keyed
    /// `until`, in insertion order.
    ///
    /// A zero `until` returns the last `n` records of the log; an unknown
    /// `until` yields nothing.
    pub fn get_blocks_before(
        &self,
        until: Hash,
        n: usize,
    ) -> Result<Vec<BlockRecord>, BlockStoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }

        // Tail-buffered window over a single forward pass.
        let mut window: Vec<BlockRecord> = Vec::new();
        let mut found = false;

        self.scan(|record| {
            if record.hash == until {
                found = true;
                return false;
            }
            if window.len() == n {
                window.remove(0);
            }
            window.push(record);
            true
        })?;

        if found || until.is_zero() {
            Ok(window)
        } else {
            Ok(Vec::new())
        }
    }

    /// Truncates the log.
    pub fn reset(&self) -> Result<(), BlockStoreError> {
        if self.path.exists() {
            File::create(&self.path).map_err(|e| BlockStoreError::Io(e.to_string()))?;
        }
        Ok(())
    }

    /// Streams records to `visit` until it returns false or the log ends.
    /// A missing file is an empty log.
    fn scan(
        &self,
        mut visit: impl FnMut(BlockRecord) -> bool,
    ) -> Result<(), BlockStoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(BlockStoreError::Io(e.to_string())),
        };

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| BlockStoreError::Io(e.to_string()))?;
            if line.is_empty() {
                continue;
            }
            let record: BlockRecord =
                serde_json::from_str(&line).map_err(|e| BlockStoreError::CorruptRecord {
                    line: index + 1,
                    reason: e.to_string(),
                })?;
            if !visit(record) {
                return Ok(());
            }
        }
        Ok(())
    }
}
