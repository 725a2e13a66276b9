//! Append-only command log.
//!
//! A segment is a sequence of records, each a little-endian `u32` length
//! followed by that many bytes of CBOR. A torn tail (crash mid-append) or a
//! damaged record ends the readable part of a segment.

use liveworld_kernel::Command;
use serde::{Deserialize, Serialize};

use crate::codec::{cbor_deserialize, cbor_serialize};
use crate::error::PersistError;

pub const LOG_SCHEMA_VERSION: u32 = 1;

/// Records larger than this are treated as damage rather than allocated.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub commit: u64,
    pub command: Command,
}

/// Where and why reading a segment stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStop {
    pub segment: String,
    pub offset: usize,
    pub reason: String,
}

/// Readable records of one segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentRead {
    pub records: Vec<LogRecord>,
    pub stop: Option<LogStop>,
}

/// Segment key for records after `snapshot_commit`.
pub fn segment_key(first_commit: u64) -> String {
    format!("log/{first_commit:020}.log")
}

pub fn encode_record(record: &LogRecord) -> Result<Vec<u8>, PersistError> {
    let body = cbor_serialize(record)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_RECORD_LEN)
        .ok_or_else(|| PersistError::Encode(format!("log record of {} bytes", body.len())))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn read_segment(segment: &str, bytes: &[u8]) -> SegmentRead {
    let mut read = SegmentRead::default();
    let mut offset = 0;
    let stop = |offset: usize, reason: String| LogStop {
        segment: segment.to_string(),
        offset,
        reason,
    };
    while offset < bytes.len() {
        let Some((len, rest)) = bytes[offset..].split_first_chunk::<4>() else {
            read.stop = Some(stop(offset, "torn length prefix".into()));
            break;
        };
        let len = u32::from_le_bytes(*len) as usize;
        if len > MAX_RECORD_LEN {
            read.stop = Some(stop(offset, format!("record length {len} out of range")));
            break;
        }
        let Some(body) = rest.get(..len) else {
            read.stop = Some(stop(offset, "torn record".into()));
            break;
        };
        match cbor_deserialize::<LogRecord>(body) {
            Ok(record) => read.records.push(record),
            Err(err) => {
                read.stop = Some(stop(offset, err.to_string()));
                break;
            }
        }
        offset += 4 + len;
    }
    read
}
