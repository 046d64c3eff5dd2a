//! Resumable parser for the GET_FILE_LIST record stream.
//!
//! The stream may open with `0xFF 0xFF` and a u32 total count. Each record is
//!
//! ```text
//! version:u8  name_len:u24  name  length:u32  skip[6]  signature[16]
//! ```
//!
//! and records may be split anywhere across frames, so [`FileListParser::feed`]
//! keeps partial input until the next chunk arrives.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::protocol::{FILE_LIST_HEADER, FILE_RECORD_SKIP_LEN, FILE_SIGNATURE_LEN};

/// Header: marker + u32 count.
const HEADER_LEN: usize = 6;
/// Fixed part before the name: version + u24 name length.
const RECORD_PREFIX_LEN: usize = 4;
/// Fixed part after the name.
const RECORD_SUFFIX_LEN: usize = 4 + FILE_RECORD_SKIP_LEN + FILE_SIGNATURE_LEN;
/// WAV header size for the PCM formats.
const WAV_HEADER_LEN: u32 = 44;

/// One recording stored on the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Size in bytes.
    pub length: u32,
    pub version: u8,
    /// Hex-encoded signature.
    pub signature: String,
    /// Seconds, derived from length and format version.
    pub duration: f64,
    /// Parsed from the file name when it follows a known pattern.
    pub recorded_at: Option<NaiveDateTime>,
}

/// Recording length in seconds for a given format version.
pub fn duration_secs(version: u8, length: u32) -> f64 {
    let len = f64::from(length);
    match version {
        1 => (f64::from(length / 32)) * 2.0,
        2 => f64::from(length.saturating_sub(WAV_HEADER_LEN)) / (48_000.0 * 2.0),
        3 => f64::from(length.saturating_sub(WAV_HEADER_LEN)) / (24_000.0 * 2.0),
        5 => len / 12_000.0,
        _ => len / (16_000.0 * 2.0),
    }
}

/// Recording start time encoded in names like `2025May12-114141-Rec44.hda`
/// or `20250512114141REC12.wav`.
pub fn parse_recording_time(name: &str) -> Option<NaiveDateTime> {
    ["%Y%b%d-%H%M%S", "%Y%m%d%H%M%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_and_remainder(name, fmt).ok())
        .map(|(t, _)| t)
}

#[derive(Debug, Default)]
pub struct FileListParser {
    buf: Vec<u8>,
    header_checked: bool,
    expected_total: Option<u32>,
    entries: Vec<FileEntry>,
}

impl FileListParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and parse every complete record. Returns how many new
    /// entries were produced.
    pub fn feed(&mut self, chunk: &[u8]) -> usize {
        self.buf.extend_from_slice(chunk);
        if !self.header_checked && !self.read_header() {
            return 0;
        }
        let before = self.entries.len();
        let mut pos = 0;
        while let Some((entry, used)) = parse_record(&self.buf[pos..]) {
            self.entries.push(entry);
            pos += used;
        }
        self.buf.drain(..pos);
        self.entries.len() - before
    }

    /// Returns false while there are too few bytes to decide.
    fn read_header(&mut self) -> bool {
        if self.buf.is_empty() || self.buf == [FILE_LIST_HEADER[0]] {
            return false;
        }
        if self.buf.starts_with(&FILE_LIST_HEADER) {
            let Some(count) = self.buf.get(2..HEADER_LEN) else {
                return false;
            };
            let total = u32::from_be_bytes([count[0], count[1], count[2], count[3]]);
            log::debug!("file list announces {total} entries");
            self.expected_total = Some(total);
            self.buf.drain(..HEADER_LEN);
        }
        self.header_checked = true;
        true
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<FileEntry> {
        self.entries
    }

    /// Count from the stream header, if the device sent one.
    pub fn expected_total(&self) -> Option<u32> {
        self.expected_total
    }

    /// True once the announced count has been reached. Without a header,
    /// `fallback_total` is the target.
    pub fn is_complete(&self, fallback_total: Option<u32>) -> bool {
        self.expected_total
            .or(fallback_total)
            .is_some_and(|total| self.entries.len() as u64 >= u64::from(total))
    }

    /// Bytes of an unfinished record still buffered.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

fn parse_record(buf: &[u8]) -> Option<(FileEntry, usize)> {
    let prefix = buf.get(..RECORD_PREFIX_LEN)?;
    let version = prefix[0];
    let name_len = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]) as usize;
    let total = RECORD_PREFIX_LEN + name_len + RECORD_SUFFIX_LEN;
    let record = buf.get(..total)?;

    let name_bytes = &record[RECORD_PREFIX_LEN..RECORD_PREFIX_LEN + name_len];
    let name = String::from_utf8_lossy(name_bytes)
        .trim_end_matches('\0')
        .to_string();
    let rest = &record[RECORD_PREFIX_LEN + name_len..];
    let length = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
    let signature: String = rest[4 + FILE_RECORD_SKIP_LEN..]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();

    let entry = FileEntry {
        recorded_at: parse_recording_time(&name),
        duration: duration_secs(version, length),
        name,
        length,
        version,
        signature,
    };
    Some((entry, total))
}

/// Encode one record. The inverse of the parser, used by the device mock in tests.
#[doc(hidden)]
pub fn encode_record(
    version: u8,
    name: &str,
    length: u32,
    signature: [u8; FILE_SIGNATURE_LEN],
) -> Vec<u8> {
    let name_len = (name.len() as u32).to_be_bytes();
    let mut out = Vec::with_capacity(RECORD_PREFIX_LEN + name.len() + RECORD_SUFFIX_LEN);
    out.push(version);
    out.extend_from_slice(&name_len[1..]);
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&[0; FILE_RECORD_SKIP_LEN]);
    out.extend_from_slice(&signature);
    out
}

/// Encode the optional count header.
#[doc(hidden)]
pub fn encode_header(total: u32) -> Vec<u8> {
    let mut out = FILE_LIST_HEADER.to_vec();
    out.extend_from_slice(&total.to_be_bytes());
    out
}
