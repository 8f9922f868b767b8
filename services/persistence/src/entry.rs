//! WAL entry codec with CRC32C integrity check

use crc32c::crc32c;
use std::io;
use thiserror::Error;

/// Upper bound on a single entry body; anything larger is treated as corruption.
const MAX_BODY_LEN: usize = 16 * 1024 * 1024;

/// 8 (seq) + 8 (ts) + 2 (kind_len) + 4 (payload_len) + 4 (crc)
const MIN_BODY_LEN: usize = 26;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Not enough bytes for a whole entry. At the end of a file this is a
    /// torn write rather than corruption.
    #[error("Truncated entry: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Corrupt entry at byte offset {offset}: {detail}")]
    Corrupt { offset: u64, detail: String },

    #[error("Checksum mismatch at byte offset {offset}: entry seq={sequence}")]
    ChecksumMismatch { offset: u64, sequence: u64 },

    #[error("Sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Entry kind too long: {0} bytes")]
    KindTooLong(usize),

    /// A failed append could not be rolled back; the file tail is unknown.
    #[error("WAL writer is unusable after a failed rollback")]
    Poisoned,
}

// ── WAL Entry ───────────────────────────────────────────────────────

/// A single persisted state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Gapless, monotonic sequence number starting at 1
    pub sequence: u64,
    /// Unix nanoseconds at which the change was accepted
    pub timestamp: i64,
    /// Event kind, e.g. `OrderPlaced`
    pub kind: String,
    /// Opaque payload; the engine owns its encoding
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl WalEntry {
    /// Create a new entry, computing the CRC32C checksum automatically.
    pub fn new(sequence: u64, timestamp: i64, kind: impl Into<String>, payload: Vec<u8>) -> Self {
        let kind = kind.into();
        let checksum = Self::compute_checksum(sequence, timestamp, &kind, &payload);
        Self {
            sequence,
            timestamp,
            kind,
            payload,
            checksum,
        }
    }

    pub fn compute_checksum(sequence: u64, timestamp: i64, kind: &str, payload: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(16 + kind.len() + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&timestamp.to_le_bytes());
        buf.extend_from_slice(kind.as_bytes());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::compute_checksum(self.sequence, self.timestamp, &self.kind, &self.payload)
    }

    /// Serialize to the on-disk frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WalError> {
        let kind_bytes = self.kind.as_bytes();
        let kind_len =
            u16::try_from(kind_bytes.len()).map_err(|_| WalError::KindTooLong(kind_bytes.len()))?;
        let body_len = MIN_BODY_LEN + kind_bytes.len() + self.payload.len();

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&kind_len.to_le_bytes());
        buf.extend_from_slice(kind_bytes);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        Ok(buf)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// Returns `(entry, bytes_consumed)`. `offset` is only used for error
    /// reporting. The checksum is not verified here; see [`verify_checksum`].
    ///
    /// [`verify_checksum`]: WalEntry::verify_checksum
    pub fn from_bytes(data: &[u8], offset: u64) -> Result<(Self, usize), WalError> {
        let mut pos = 0usize;
        let body_len = u32::from_le_bytes(take::<4>(data, &mut pos)?) as usize;

        if !(MIN_BODY_LEN..=MAX_BODY_LEN).contains(&body_len) {
            return Err(WalError::Corrupt {
                offset,
                detail: format!("implausible body length {}", body_len),
            });
        }

        let total = 4 + body_len;
        if data.len() < total {
            return Err(WalError::Truncated {
                needed: total,
                available: data.len(),
            });
        }

        let body = &data[4..total];
        let mut pos = 0usize;
        let corrupt = |detail: String| WalError::Corrupt { offset, detail };

        let sequence = u64::from_le_bytes(take::<8>(body, &mut pos)?);
        let timestamp = i64::from_le_bytes(take::<8>(body, &mut pos)?);
        let kind_len = u16::from_le_bytes(take::<2>(body, &mut pos)?) as usize;

        if pos + kind_len > body.len() {
            return Err(corrupt(format!(
                "kind_len {} exceeds remaining body ({} bytes)",
                kind_len,
                body.len() - pos
            )));
        }
        let kind = String::from_utf8(body[pos..pos + kind_len].to_vec())
            .map_err(|e| corrupt(e.to_string()))?;
        pos += kind_len;

        let payload_len = u32::from_le_bytes(take::<4>(body, &mut pos)?) as usize;
        if pos + payload_len + 4 != body.len() {
            return Err(corrupt(format!(
                "payload_len {} does not match body length {}",
                payload_len, body_len
            )));
        }
        let payload = body[pos..pos + payload_len].to_vec();
        pos += payload_len;

        let checksum = u32::from_le_bytes(take::<4>(body, &mut pos)?);

        Ok((
            Self {
                sequence,
                timestamp,
                kind,
                payload,
                checksum,
            },
            total,
        ))
    }
}

fn take<const N: usize>(data: &[u8], pos: &mut usize) -> Result<[u8; N], WalError> {
    let end = *pos + N;
    let mut out = [0u8; N];
    match data.get(*pos..end) {
        Some(bytes) => {
            out.copy_from_slice(bytes);
            *pos = end;
            Ok(out)
        }
        None => Err(WalError::Truncated {
            needed: end,
            available: data.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(seq: u64) -> WalEntry {
        WalEntry::new(
            seq,
            1_708_123_456_789_000_000 + seq as i64,
            "OrderPlaced",
            br#"{"order_id":"x"}"#.to_vec(),
        )
    }

    #[test]
    fn test_checksum_detects_tamper() {
        let mut entry = sample_entry(1);
        assert!(entry.verify_checksum());
        entry.payload = vec![99, 98, 97];
        assert!(!entry.verify_checksum());
    }

    #[test]
    fn test_decode_consumes_exactly_one_frame() {
        let mut bytes = sample_entry(7).to_bytes().unwrap();
        let first_len = bytes.len();
        bytes.extend(sample_entry(8).to_bytes().unwrap());

        let (decoded, consumed) = WalEntry::from_bytes(&bytes, 0).unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(decoded, sample_entry(7));
    }

    #[test]
    fn test_partial_frame_is_truncated_not_corrupt() {
        let bytes = sample_entry(1).to_bytes().unwrap();
        let result = WalEntry::from_bytes(&bytes[..bytes.len() - 3], 0);
        assert!(matches!(result, Err(WalError::Truncated { .. })));

        let result = WalEntry::from_bytes(&bytes[..2], 0);
        assert!(matches!(result, Err(WalError::Truncated { .. })));
    }

    #[test]
    fn test_implausible_length_is_corrupt() {
        let mut bytes = sample_entry(1).to_bytes().unwrap();
        bytes[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            WalEntry::from_bytes(&bytes, 40),
            Err(WalError::Corrupt { offset: 40, .. })
        ));
    }

    #[test]
    fn test_mismatched_payload_len_is_corrupt() {
        let mut bytes = sample_entry(1).to_bytes().unwrap();
        // payload_len sits after body_len(4) + seq(8) + ts(8) + kind_len(2) + kind(11)
        let at = 4 + 8 + 8 + 2 + "OrderPlaced".len();
        bytes[at..at + 4].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            WalEntry::from_bytes(&bytes, 0),
            Err(WalError::Corrupt { .. })
        ));
    }
}
