//! Length-prefixed, checksummed on-disk record format.
//!
//! Layout per record: `[body_len: u32 LE][crc32(body): u32 LE][body]`, where
//! `body` is the `bincode` encoding of a [`StoredRecord`]. The discriminator
//! lives inside `body` rather than the fixed header so that corrupt-length
//! detection (via the checksum) and forward-compatible payload dispatch are
//! independent concerns.

use serde::{Deserialize, Serialize};

use crate::task::{SpoolPayload, SubmissionTask};

const HEADER_LEN: usize = 8;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    discriminator: u8,
    handle: String,
    first_attempt_unix_nanos: u128,
    attempts: u32,
    payload: Vec<u8>,
}

/// Serializes `task` into a framed, checksummed record ready to append.
pub fn encode<T: SpoolPayload>(task: &SubmissionTask<T>) -> Vec<u8> {
    let first_attempt_unix_nanos = task
        .first_attempt
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let payload =
        bincode::serialize(&task.payload).expect("SpoolPayload serialization cannot fail");
    let record = StoredRecord {
        discriminator: T::DISCRIMINATOR,
        handle: task.handle.clone(),
        first_attempt_unix_nanos,
        attempts: task.attempts,
        payload,
    };
    let body = bincode::serialize(&record).expect("StoredRecord serialization cannot fail");
    let crc = crc32fast::hash(&body);
    let mut framed = Vec::with_capacity(HEADER_LEN + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&crc.to_le_bytes());
    framed.extend_from_slice(&body);
    framed
}

/// Outcome of scanning a segment's bytes for records.
pub struct ScanResult<T> {
    pub records: Vec<(SubmissionTask<T>, usize)>,
    pub corrupt_records: u64,
    /// Byte offset at which scanning stopped. Equals `bytes.len()` unless a
    /// checksum mismatch truncated the scan early.
    pub consumed: usize,
}

/// Decodes every whole record in `bytes`, starting at `start_offset`.
///
/// A record whose discriminator does not match `T::DISCRIMINATOR` is counted
/// as corrupt and skipped (its bytes are still consumed, since the length
/// header is still trustworthy). A checksum mismatch is NOT recoverable —
/// scanning stops at that point and the remaining bytes are left unconsumed.
pub fn scan<T: SpoolPayload>(bytes: &[u8], start_offset: usize) -> ScanResult<T> {
    let mut offset = start_offset;
    let mut records = Vec::new();
    let mut corrupt_records = 0u64;

    loop {
        if bytes.len() < offset + HEADER_LEN {
            break;
        }
        let body_len =
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        let crc_expected = u32::from_le_bytes(bytes[offset + 4..offset + 8].try_into().unwrap());
        let body_start = offset + HEADER_LEN;
        let body_end = body_start + body_len;
        if bytes.len() < body_end {
            break;
        }
        let body = &bytes[body_start..body_end];
        if crc32fast::hash(body) != crc_expected {
            break;
        }
        let record_len = HEADER_LEN + body_len;
        match bincode::deserialize::<StoredRecord>(body) {
            Ok(record) if record.discriminator == T::DISCRIMINATOR => {
                match bincode::deserialize::<T>(&record.payload) {
                    Ok(payload) => {
                        let first_attempt = std::time::UNIX_EPOCH
                            + std::time::Duration::from_nanos(
                                record.first_attempt_unix_nanos.min(u64::MAX as u128) as u64,
                            );
                        records.push((
                            SubmissionTask {
                                payload,
                                handle: record.handle,
                                first_attempt,
                                attempts: record.attempts,
                            },
                            record_len,
                        ));
                    }
                    Err(_) => corrupt_records += 1,
                }
            }
            _ => corrupt_records += 1,
        }
        offset += record_len;
    }

    ScanResult {
        records,
        corrupt_records,
        consumed: offset,
    }
}
