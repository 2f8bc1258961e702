//! Changelog files
//!
//! A changelog is the durable source of truth of one metadata store: an
//! append-only sequence of framed records behind a small file header.
//!
//! File header:
//! ```text
//! +---------+---------+------+---------+------------+------+
//! | Magic   | Version | Rsvd | Content | User flags | Rsvd |
//! | 4B      | 1B      | 1B   | 2B      | 2B         | 2B   |
//! +---------+---------+------+---------+------------+------+
//! ```
//!
//! Record format:
//! ```text
//! +-------+------+------+--------+---------+--------+
//! | Magic | Kind | Size | CRC32C | Payload | CRC32C |
//! | 2B    | 1B   | 2B   | 4B     | var     | 4B     |
//! +-------+------+------+--------+---------+--------+
//! ```
//!
//! Both checksum halves hold the same value: the CRC32C of the payload
//! followed by the kind and size bytes. Keeping two copies lets the repair
//! routine tell a damaged checksum from a damaged payload.

mod compact;
mod file;
mod repair;

pub use compact::{CompactStage, CompactStats, CompactingFeedback, LogManager};
pub use file::{ChangeLogFile, OpenFlags};
pub use repair::{RepairFeedback, RepairStats};

use nslog_common::checksum::record_checksum;
use nslog_common::{Error, Result};
use std::fmt;

/// Changelog file magic number
pub const LOG_MAGIC: u32 = 0x4C43_534E; // "NSCL"

/// Changelog format version written by this crate
pub const LOG_VERSION: u8 = 1;

/// File header size
pub const HEADER_SIZE: usize = 12;

/// Record magic number
pub const RECORD_MAGIC: u16 = 0x524E; // "NR"

/// Record header size (magic + kind + size + checksum)
pub const RECORD_HEADER_SIZE: usize = 9;

/// Record trailer size (checksum)
pub const RECORD_TRAILER_SIZE: usize = 4;

/// Largest payload a record can carry
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Header user flag: the log was produced by compaction
pub const LOG_FLAG_COMPACTED: u16 = 0x0001;

/// Kind of a changelog record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Full serialized entity, keyed by its leading id
    Update = 1,
    /// Only the id of a removed entity
    Delete = 2,
    /// Written to a log after it was compacted into a new file
    CompactStamp = 3,
}

impl RecordKind {
    pub const ALL: [Self; 3] = [Self::Update, Self::Delete, Self::CompactStamp];

    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            3 => Some(Self::CompactStamp),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::CompactStamp => "COMPACT_STAMP",
        };
        f.write_str(name)
    }
}

/// What kind of entities a changelog holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContentKind {
    /// Container (directory) records
    Container = 0x434F,
    /// File records
    File = 0x4649,
}

impl ContentKind {
    #[must_use]
    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x434F => Some(Self::Container),
            0x4649 => Some(Self::File),
            _ => None,
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => f.write_str("container"),
            Self::File => f.write_str("file"),
        }
    }
}

/// Decoded file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub version: u8,
    pub content: ContentKind,
    pub user_flags: u16,
}

impl LogHeader {
    #[must_use]
    pub const fn new(content: ContentKind) -> Self {
        Self {
            version: LOG_VERSION,
            content,
            user_flags: 0,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        buf[4] = self.version;
        buf[6..8].copy_from_slice(&(self.content as u16).to_le_bytes());
        buf[8..10].copy_from_slice(&self.user_flags.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corruption(0, "changelog header truncated"));
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != LOG_MAGIC {
            return Err(Error::corruption(0, "not a changelog file (bad magic)"));
        }
        let version = data[4];
        if version != LOG_VERSION {
            return Err(Error::corruption(
                0,
                format!("unsupported changelog version {version}"),
            ));
        }
        let content = u16::from_le_bytes([data[6], data[7]]);
        let content = ContentKind::from_u16(content).ok_or_else(|| {
            Error::corruption(0, format!("unknown content flag {content:#06x}"))
        })?;
        Ok(Self {
            version,
            content,
            user_flags: u16::from_le_bytes([data[8], data[9]]),
        })
    }

    /// Whether the log was produced by compaction
    #[must_use]
    pub const fn is_compacted(&self) -> bool {
        self.user_flags & LOG_FLAG_COMPACTED != 0
    }
}

/// Returned by scanners to continue or end a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Outcome of a scan or follow pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Records handed to the scanner
    pub records: u64,
    /// Offset following the last record handed to the scanner
    pub next_offset: u64,
    /// The scanner asked to stop
    pub stopped: bool,
    /// Unreadable bytes skipped in tolerant mode
    pub skipped_bytes: u64,
}

/// Decoded fixed part of a record frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub magic: u16,
    pub kind: u8,
    pub size: u16,
    pub checksum: u32,
}

impl FrameHeader {
    pub(crate) fn parse(raw: &[u8]) -> Self {
        Self {
            magic: u16::from_le_bytes([raw[0], raw[1]]),
            kind: raw[2],
            size: u16::from_le_bytes([raw[3], raw[4]]),
            checksum: u32::from_le_bytes([raw[5], raw[6], raw[7], raw[8]]),
        }
    }

    /// Total frame length including header and trailer
    pub(crate) fn frame_len(&self) -> usize {
        RECORD_HEADER_SIZE + usize::from(self.size) + RECORD_TRAILER_SIZE
    }
}

/// Encode a complete record frame
pub(crate) fn encode_frame(kind: RecordKind, payload: &[u8]) -> Result<Vec<u8>> {
    let size = u16::try_from(payload.len()).map_err(|_| Error::SizeExceeded {
        needed: payload.len(),
        available: MAX_PAYLOAD_SIZE,
    })?;
    let checksum = record_checksum(payload, kind as u8, size);

    let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_TRAILER_SIZE);
    frame.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    frame.push(kind as u8);
    frame.extend_from_slice(&size.to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&checksum.to_le_bytes());
    Ok(frame)
}

/// Validate a complete frame held in memory, returning its kind
pub(crate) fn check_frame(
    offset: u64,
    header: &FrameHeader,
    payload: &[u8],
    trailer: u32,
) -> Result<RecordKind> {
    if header.magic != RECORD_MAGIC {
        return Err(Error::corruption(offset, "bad record magic"));
    }
    let kind = RecordKind::from_u8(header.kind)
        .ok_or_else(|| Error::corruption(offset, format!("unknown record kind {}", header.kind)))?;
    let expected = record_checksum(payload, header.kind, header.size);
    if header.checksum != expected || trailer != expected {
        return Err(Error::corruption(offset, "record checksum mismatch"));
    }
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = LogHeader::new(ContentKind::File);
        header.user_flags = LOG_FLAG_COMPACTED;

        let parsed = LogHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_compacted());
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert!(LogHeader::from_bytes(&[0u8; 4]).is_err());
        assert!(LogHeader::from_bytes(&[0u8; HEADER_SIZE]).is_err());

        let mut raw = LogHeader::new(ContentKind::Container).to_bytes();
        raw[6] = 0xFF;
        assert!(LogHeader::from_bytes(&raw).is_err());
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(RecordKind::Delete, &42u64.to_le_bytes()).unwrap();
        assert_eq!(frame.len(), RECORD_HEADER_SIZE + 8 + RECORD_TRAILER_SIZE);

        let header = FrameHeader::parse(&frame);
        assert_eq!(header.magic, RECORD_MAGIC);
        assert_eq!(header.kind, RecordKind::Delete as u8);
        assert_eq!(header.size, 8);
        assert_eq!(header.frame_len(), frame.len());

        let payload = &frame[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + 8];
        let trailer = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
        assert_eq!(
            check_frame(0, &header, payload, trailer).unwrap(),
            RecordKind::Delete
        );
    }

    #[test]
    fn test_frame_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            encode_frame(RecordKind::Update, &payload),
            Err(Error::SizeExceeded { .. })
        ));
    }
}
