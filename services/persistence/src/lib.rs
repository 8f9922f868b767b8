//! Write-ahead log for the exchange engine
//!
//! A single append-only file of checksummed entries. The engine appends one
//! entry per accepted state change and replays the file on startup to rebuild
//! its in-memory state before the gateway accepts traffic.
//!
//! # Binary Format (per entry)
//! ```text
//! [body_len:  u32]
//! [sequence:  u64]
//! [timestamp: i64]
//! [kind_len:  u16][kind: bytes]
//! [payload_len: u32][payload: bytes]
//! [checksum:  u32]  // CRC32C over sequence+timestamp+kind+payload
//! ```
//! All integers are little endian.

pub mod entry;
pub mod reader;
pub mod writer;

pub use entry::{WalEntry, WalError};
pub use reader::WalReader;
pub use writer::{FsyncPolicy, WalWriter};
