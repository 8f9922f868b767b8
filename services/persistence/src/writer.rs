//! Append-only WAL writer

use crate::entry::{WalEntry, WalError};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Controls when `fsync` (durable write) is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every append.
    EveryWrite,
    /// Fsync every N appends. Data is still handed to the OS on every append.
    EveryN(usize),
}

/// File operations the writer needs. Implemented for [`File`].
pub trait WalSink: Write {
    /// Cut the file back to `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn sync_data(&mut self) -> io::Result<()>;

    fn sync_all(&mut self) -> io::Result<()>;
}

impl WalSink for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_data(&mut self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self)
    }
}

/// Appends entries to a single WAL file, assigning gapless sequence numbers.
///
/// An append either lands whole or leaves the file as it was: on failure the
/// partial frame is truncated away and the sequence is not consumed. If the
/// truncation itself fails the writer refuses every later append.
pub struct WalWriter<S: WalSink = File> {
    sink: S,
    /// Length of the file up to the last complete entry
    len: u64,
    next_sequence: u64,
    fsync_policy: FsyncPolicy,
    writes_since_fsync: usize,
    poisoned: bool,
}

impl WalWriter<File> {
    /// Open (or create) the WAL file for appending.
    ///
    /// `next_sequence` is the sequence the next append will carry; after
    /// recovery that is `last_sequence + 1`.
    pub fn open(
        path: impl AsRef<Path>,
        next_sequence: u64,
        fsync_policy: FsyncPolicy,
    ) -> Result<Self, WalError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        tracing::debug!(path = %path.display(), next_sequence, len, "WAL opened for append");

        Ok(Self::with_sink(file, len, next_sequence, fsync_policy))
    }
}

impl<S: WalSink> WalWriter<S> {
    fn with_sink(sink: S, len: u64, next_sequence: u64, fsync_policy: FsyncPolicy) -> Self {
        Self {
            sink,
            len,
            next_sequence,
            fsync_policy,
            writes_since_fsync: 0,
            poisoned: false,
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append a new entry and return it.
    ///
    /// On error nothing of the entry remains in the file and the same
    /// sequence is used by the next append.
    pub fn append(
        &mut self,
        timestamp: i64,
        kind: &str,
        payload: Vec<u8>,
    ) -> Result<WalEntry, WalError> {
        if self.poisoned {
            return Err(WalError::Poisoned);
        }
        let entry = WalEntry::new(self.next_sequence, timestamp, kind, payload);
        let bytes = entry.to_bytes()?;

        if let Err(e) = self.write_frame(&bytes) {
            self.rollback();
            return Err(e.into());
        }

        self.len += bytes.len() as u64;
        self.next_sequence += 1;
        Ok(entry)
    }

    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sink.write_all(bytes)?;
        self.sink.flush()?;

        let should_fsync = match self.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync + 1 >= n,
        };
        if should_fsync {
            self.sink.sync_data()?;
            self.writes_since_fsync = 0;
        } else {
            self.writes_since_fsync += 1;
        }
        Ok(())
    }

    fn rollback(&mut self) {
        if let Err(e) = self.sink.truncate(self.len) {
            tracing::error!(len = self.len, error = %e, "WAL rollback failed, refusing further appends");
            self.poisoned = true;
        } else {
            tracing::warn!(
                len = self.len,
                sequence = self.next_sequence,
                "Failed WAL append rolled back"
            );
        }
    }

    /// Force flush + fsync (used before shutdown).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.sink.flush()?;
        self.sink.sync_all()?;
        self.writes_since_fsync = 0;
        Ok(())
    }
}
