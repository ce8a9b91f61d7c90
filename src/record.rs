//! # On-Disk Record Layout
//!
//! Each persisted log is appended to `<dir>/<yyyymmdd>` (UTC day) as
//! `0x01, time:u32, level:u16, size:u16, content[size], 0xFF`, integers
//! big-endian. The head and tail tag bytes are advisory boundaries only:
//! content is raw bytes and may contain either value, so the scanner
//! parses structurally and falls back to byte-wise resynchronisation when
//! a record fails to validate (for example after a torn write that left a
//! lone tail tag behind).

use crate::protocol::LogLevel;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Marks the likely start of a record.
pub const RECORD_HEAD_TAG: u8 = 0x01;
/// Marks the likely end of a record; also written alone after a failed
/// record write so a scanner can restart cleanly.
pub const RECORD_TAIL_TAG: u8 = 0xFF;

/// Fixed bytes around the content: head tag + time + level + size + tail tag.
pub const RECORD_OVERHEAD: usize = 1 + 4 + 2 + 2 + 1;

/// One log as recovered from a dated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub time: u32,
    pub level: LogLevel,
    pub content: Vec<u8>,
}

/// Frame a record for appending.
pub fn encode_record(time: u32, level: LogLevel, content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RECORD_OVERHEAD + content.len());
    buf.push(RECORD_HEAD_TAG);
    buf.extend_from_slice(&time.to_be_bytes());
    buf.extend_from_slice(&level.as_u16().to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.extend_from_slice(content);
    buf.push(RECORD_TAIL_TAG);
    buf
}

/// Current UTC day as `yyyymmdd`; one file per day.
pub fn current_date() -> String {
    Utc::now().format("%Y%m%d").to_string()
}

/// Path of the dated file for `date` under `dir`.
pub fn dated_file_name(dir: &Path, date: &str) -> PathBuf {
    dir.join(date)
}

/// Best-effort scan of a dated file's bytes.
///
/// A candidate record is accepted when its head tag, level, declared size
/// and tail tag all line up; anything else advances the cursor one byte
/// and retries, which skips torn writes and stray tag bytes.
pub fn scan_records(bytes: &[u8]) -> Vec<DiskRecord> {
    let mut records = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] != RECORD_HEAD_TAG {
            pos += 1;
            continue;
        }
        let fixed_end = pos + RECORD_OVERHEAD - 1;
        if fixed_end > bytes.len() {
            break;
        }
        let time = u32::from_be_bytes(bytes[pos + 1..pos + 5].try_into().unwrap());
        let level_raw = u16::from_be_bytes(bytes[pos + 5..pos + 7].try_into().unwrap());
        let size = u16::from_be_bytes(bytes[pos + 7..pos + 9].try_into().unwrap()) as usize;
        let end = pos + RECORD_OVERHEAD + size;
        let level = match LogLevel::try_from(level_raw) {
            Ok(level) => level,
            Err(_) => {
                pos += 1;
                continue;
            }
        };
        if end > bytes.len() || bytes[end - 1] != RECORD_TAIL_TAG {
            pos += 1;
            continue;
        }
        records.push(DiskRecord {
            time,
            level,
            content: bytes[pos + 9..end - 1].to_vec(),
        });
        pos = end;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_bytes_are_tag_bracketed_big_endian() {
        let bytes = encode_record(42, LogLevel::Info, b"hello");
        let mut expected = vec![
            0x01, // head tag
            0x00, 0x00, 0x00, 0x2A, // time
            0x00, 0x00, // level info
            0x00, 0x05, // size
        ];
        expected.extend_from_slice(b"hello");
        expected.push(0xFF);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn scan_recovers_consecutive_records() {
        let mut file = encode_record(1, LogLevel::Info, b"first");
        file.extend_from_slice(&encode_record(2, LogLevel::Error, b"second"));
        let records = scan_records(&file);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, b"first");
        assert_eq!(records[1].level, LogLevel::Error);
    }

    #[test]
    fn scan_steps_over_a_lone_tail_tag() {
        let mut file = encode_record(1, LogLevel::Info, b"ok");
        file.push(RECORD_TAIL_TAG); // torn write marker
        file.extend_from_slice(&encode_record(2, LogLevel::Info, b"after"));
        let records = scan_records(&file);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].content, b"after");
    }

    #[test]
    fn content_may_contain_both_tag_bytes() {
        let tricky = [RECORD_HEAD_TAG, RECORD_TAIL_TAG, 0x41, RECORD_TAIL_TAG];
        let file = encode_record(7, LogLevel::Debug, &tricky);
        let records = scan_records(&file);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, tricky);
    }

    #[test]
    fn truncated_trailing_record_is_ignored() {
        let mut file = encode_record(1, LogLevel::Info, b"whole");
        let partial = encode_record(2, LogLevel::Info, b"partial");
        file.extend_from_slice(&partial[..partial.len() - 3]);
        let records = scan_records(&file);
        assert_eq!(records.len(), 1);
    }
}
