//! Sequential WAL reader with corruption detection
//!
//! Every entry's CRC32C is verified and sequences must be gapless. A partial
//! frame at the very end of the file is a torn write from a crash mid-append:
//! it is reported through [`WalReader::torn_tail`] and reading stops there.
//! Anything else that fails to decode is an error.

use crate::entry::{WalEntry, WalError};
use std::fs;
use std::io;
use std::path::Path;

pub struct WalReader {
    data: Vec<u8>,
    pos: usize,
    last_sequence: Option<u64>,
    torn_tail: usize,
}

impl WalReader {
    /// Read the whole WAL file into memory. A missing file reads as empty.
    pub fn open(path: &Path) -> Result<Self, WalError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            last_sequence: None,
            torn_tail: 0,
        }
    }

    /// Read the next entry.
    ///
    /// Returns `None` at the end of the valid data.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>, WalError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let offset = self.pos as u64;
        let (entry, consumed) = match WalEntry::from_bytes(&self.data[self.pos..], offset) {
            Ok(decoded) => decoded,
            Err(WalError::Truncated { .. }) => {
                self.torn_tail = self.data.len() - self.pos;
                tracing::warn!(
                    offset,
                    bytes = self.torn_tail,
                    "Ignoring torn entry at end of WAL"
                );
                self.pos = self.data.len();
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !entry.verify_checksum() {
            return Err(WalError::ChecksumMismatch {
                offset,
                sequence: entry.sequence,
            });
        }

        let expected = self.last_sequence.map_or(1, |s| s + 1);
        if entry.sequence != expected {
            return Err(WalError::SequenceGap {
                expected,
                got: entry.sequence,
            });
        }

        self.pos += consumed;
        self.last_sequence = Some(entry.sequence);
        Ok(Some(entry))
    }

    /// Read all remaining entries.
    pub fn read_all(&mut self) -> Result<Vec<WalEntry>, WalError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Number of trailing bytes that did not form a whole entry.
    pub fn torn_tail(&self) -> usize {
        self.torn_tail
    }

    /// Length of the prefix made of whole, verified entries read so far.
    pub fn valid_len(&self) -> u64 {
        (self.pos - self.torn_tail.min(self.pos)) as u64
    }
}
