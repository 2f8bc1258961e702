//! Offline changelog repair
//!
//! Copies every record that is intact or that can be rebuilt from a single
//! damaged field into a fresh log. A record is rebuilt when exactly one of
//! these is wrong: the magic or kind byte, the size field, or one checksum
//! half. Anything worse is skipped byte by byte until the next position that
//! holds a valid or fixable record.

use super::{
    ChangeLogFile, ContentKind, FrameHeader, LogHeader, OpenFlags, RecordKind, HEADER_SIZE,
    MAX_PAYLOAD_SIZE, RECORD_HEADER_SIZE, RECORD_MAGIC, RECORD_TRAILER_SIZE,
};
use crate::buffer::Buffer;
use nslog_common::checksum::{compute_crc32c, extend_crc32c, seal_record_checksum};
use nslog_common::{Error, Result};
use serde::Serialize;
use std::ops::Range;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How often (in scanned records) progress is reported
const FEEDBACK_INTERVAL: u64 = 1000;

/// Counters collected while repairing a log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairStats {
    /// Size of the damaged log
    pub bytes_total: u64,
    /// Bytes that ended up in the repaired log (as found on disk)
    pub bytes_accepted: u64,
    /// Bytes dropped because no record could be recovered from them
    pub bytes_discarded: u64,
    /// Records found, healthy or fixed
    pub scanned: u64,
    /// Records copied without change
    pub healthy: u64,
    /// Records whose magic or kind byte was rebuilt
    pub fixed_wrong_magic: u64,
    /// Records whose size field was rebuilt
    pub fixed_wrong_size: u64,
    /// Records with one bad checksum half
    pub fixed_wrong_checksum: u64,
    /// Damaged regions that could not be recovered
    pub not_fixed: u64,
    /// Wall-clock time spent
    pub elapsed: Duration,
}

/// Progress sink for long repairs
pub trait RepairFeedback {
    fn report_progress(&mut self, stats: &RepairStats);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fix {
    Healthy,
    Magic,
    Size,
    Checksum,
}

struct Recovered {
    kind: RecordKind,
    payload: Range<usize>,
    /// Bytes the record occupied in the damaged log
    span: usize,
    fix: Fix,
}

impl ChangeLogFile {
    /// Rebuild `old` into a new log at `new`
    ///
    /// The damaged log is read whole and never modified. The new log takes
    /// the content kind and user flags of the old one; when the old header is
    /// itself damaged the content flag alone is enough to proceed.
    pub fn repair(
        old: impl AsRef<Path>,
        new: impl AsRef<Path>,
        stats: &mut RepairStats,
        mut feedback: Option<&mut dyn RepairFeedback>,
    ) -> Result<()> {
        let start = Instant::now();
        let old = old.as_ref();
        let data = std::fs::read(old)?;
        stats.bytes_total = data.len() as u64;

        if data.len() < HEADER_SIZE {
            return Err(Error::corruption(0, "changelog header truncated"));
        }

        let (content, user_flags) = match LogHeader::from_bytes(&data) {
            Ok(header) => (header.content, header.user_flags),
            Err(e) => {
                let flag = u16::from_le_bytes([data[6], data[7]]);
                let content = ContentKind::from_u16(flag).ok_or(e)?;
                warn!(
                    "header of {:?} is damaged, continuing as a {} log",
                    old, content
                );
                (content, 0)
            }
        };

        let out = ChangeLogFile::open(new, OpenFlags::CREATE | OpenFlags::TRUNCATE, content)?
            .with_sync_on_write(false);
        if user_flags != 0 {
            out.set_user_flags(user_flags)?;
        }
        stats.bytes_accepted += HEADER_SIZE as u64;

        let mut pos = HEADER_SIZE;
        let mut in_damage = false;
        let mut payload = Buffer::new();

        while pos < data.len() {
            let Some(record) = recover_at(&data, pos) else {
                if !in_damage {
                    warn!("unrecoverable data at offset {} of {:?}", pos, old);
                    stats.not_fixed += 1;
                    in_damage = true;
                }
                stats.bytes_discarded += 1;
                pos += 1;
                continue;
            };

            in_damage = false;
            stats.scanned += 1;
            match record.fix {
                Fix::Healthy => stats.healthy += 1,
                Fix::Magic => stats.fixed_wrong_magic += 1,
                Fix::Size => stats.fixed_wrong_size += 1,
                Fix::Checksum => stats.fixed_wrong_checksum += 1,
            }

            payload.clear();
            payload.put_data(&data[record.payload]);
            out.store_record(record.kind, &payload)?;

            stats.bytes_accepted += record.span as u64;
            pos += record.span;

            if stats.scanned % FEEDBACK_INTERVAL == 0 {
                if let Some(feedback) = feedback.as_deref_mut() {
                    stats.elapsed = start.elapsed();
                    feedback.report_progress(stats);
                }
            }
        }

        out.sync()?;
        stats.elapsed = start.elapsed();
        if let Some(feedback) = feedback {
            feedback.report_progress(stats);
        }

        info!(
            "repaired {:?}: {} records ({} healthy, {} magic, {} size, {} checksum), {} not fixed, {} bytes discarded",
            old,
            stats.scanned,
            stats.healthy,
            stats.fixed_wrong_magic,
            stats.fixed_wrong_size,
            stats.fixed_wrong_checksum,
            stats.not_fixed,
            stats.bytes_discarded
        );
        Ok(())
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Try to read or rebuild a record starting at `pos`
fn recover_at(data: &[u8], pos: usize) -> Option<Recovered> {
    if data.len() - pos < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE {
        return None;
    }

    let header = FrameHeader::parse(&data[pos..pos + RECORD_HEADER_SIZE]);
    let magic_ok = header.magic == RECORD_MAGIC;
    let payload_start = pos + RECORD_HEADER_SIZE;
    let size = usize::from(header.size);
    let span = header.frame_len();

    if payload_start + size + RECORD_TRAILER_SIZE <= data.len() {
        let tail = read_u32(data, payload_start + size);

        // Cheap rejection for garbage that does not even look like a frame
        if !magic_ok && header.checksum != tail {
            return None;
        }

        let payload = payload_start..payload_start + size;
        let payload_crc = compute_crc32c(&data[payload.clone()]);

        if let Some(kind) = RecordKind::from_u8(header.kind) {
            let computed = seal_record_checksum(payload_crc, header.kind, header.size);
            let head_ok = computed == header.checksum;
            let tail_ok = computed == tail;

            let fix = match (magic_ok, head_ok, tail_ok) {
                (true, true, true) => Some(Fix::Healthy),
                (true, true, false) | (true, false, true) => Some(Fix::Checksum),
                (false, true, true) => Some(Fix::Magic),
                _ => None,
            };
            if let Some(fix) = fix {
                return Some(Recovered {
                    kind,
                    payload,
                    span,
                    fix,
                });
            }
        }

        if !magic_ok {
            return None;
        }

        // Damaged kind: the one kind that validates both halves
        if header.checksum == tail {
            for kind in RecordKind::ALL {
                if kind as u8 == header.kind {
                    continue;
                }
                if seal_record_checksum(payload_crc, kind as u8, header.size) == header.checksum {
                    return Some(Recovered {
                        kind,
                        payload,
                        span,
                        fix: Fix::Magic,
                    });
                }
            }
        }
    } else if !magic_ok {
        return None;
    }

    recover_size(data, pos, &header)
}

/// Look for the tail checksum matching the head when the size field is bad
fn recover_size(data: &[u8], pos: usize, header: &FrameHeader) -> Option<Recovered> {
    let kind = RecordKind::from_u8(header.kind)?;
    let payload_start = pos + RECORD_HEADER_SIZE;
    let last = (payload_start + MAX_PAYLOAD_SIZE).min(data.len() - RECORD_TRAILER_SIZE);

    let mut running = 0u32;
    for q in payload_start..=last {
        let len = q - payload_start;
        if len != usize::from(header.size) && read_u32(data, q) == header.checksum {
            // len <= MAX_PAYLOAD_SIZE by construction of `last`
            let size = len as u16;
            if seal_record_checksum(running, kind as u8, size) == header.checksum {
                return Some(Recovered {
                    kind,
                    payload: payload_start..q,
                    span: RECORD_HEADER_SIZE + len + RECORD_TRAILER_SIZE,
                    fix: Fix::Size,
                });
            }
        }
        running = extend_crc32c(running, &data[q..=q]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ScanControl, LOG_FLAG_COMPACTED};
    use rand::Rng;
    use tempfile::tempdir;

    const RECORDS: u64 = 20;

    /// Builds a log of UPDATE records and returns each record's offset
    fn build_log(path: &Path) -> Vec<u64> {
        let log = ChangeLogFile::create(path, ContentKind::File).unwrap();
        (1..=RECORDS)
            .map(|id| {
                let mut buf = Buffer::new();
                buf.put_u64(id);
                buf.put_data(b"abcdefgh");
                log.store_record(RecordKind::Update, &buf).unwrap()
            })
            .collect()
    }

    fn corrupt(path: &Path, f: impl FnOnce(&mut Vec<u8>)) {
        let mut raw = std::fs::read(path).unwrap();
        f(&mut raw);
        std::fs::write(path, &raw).unwrap();
    }

    fn repaired_ids(path: &Path) -> Vec<(RecordKind, u64)> {
        let log = ChangeLogFile::open_read_only(path, ContentKind::File).unwrap();
        let mut ids = vec![];
        log.scan_all_records(|_, kind, buf| {
            ids.push((kind, buf.grab_u64(0)?));
            Ok(ScanControl::Continue)
        })
        .unwrap();
        ids
    }

    fn repair(old: &Path, new: &Path) -> RepairStats {
        let mut stats = RepairStats::default();
        ChangeLogFile::repair(old, new, &mut stats, None).unwrap();
        stats
    }

    #[test]
    fn test_repair_healthy_log() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        build_log(&old);

        let stats = repair(&old, &new);
        assert_eq!(stats.scanned, RECORDS);
        assert_eq!(stats.healthy, RECORDS);
        assert_eq!(stats.not_fixed, 0);
        assert_eq!(stats.bytes_discarded, 0);
        assert_eq!(stats.bytes_accepted, stats.bytes_total);
        assert_eq!(std::fs::read(&old).unwrap(), std::fs::read(&new).unwrap());
    }

    #[test]
    fn test_repair_wrong_magic() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        let offsets = build_log(&old);

        corrupt(&old, |raw| raw[offsets[3] as usize] ^= 0x5A);

        let stats = repair(&old, &new);
        assert_eq!(stats.fixed_wrong_magic, 1);
        assert_eq!(stats.healthy, RECORDS - 1);
        assert_eq!(stats.not_fixed, 0);
        assert_eq!(repaired_ids(&new).len(), RECORDS as usize);
    }

    #[test]
    fn test_repair_wrong_kind() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        let offsets = build_log(&old);

        corrupt(&old, |raw| raw[offsets[7] as usize + 2] = 0x77);

        let stats = repair(&old, &new);
        assert_eq!(stats.fixed_wrong_magic, 1);
        let ids = repaired_ids(&new);
        assert_eq!(ids[7], (RecordKind::Update, 8));
    }

    #[test]
    fn test_repair_wrong_size() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        let offsets = build_log(&old);

        corrupt(&old, |raw| raw[offsets[5] as usize + 3] = 3);

        let stats = repair(&old, &new);
        assert_eq!(stats.fixed_wrong_size, 1);
        assert_eq!(stats.not_fixed, 0);
        let ids: Vec<u64> = repaired_ids(&new).into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, (1..=RECORDS).collect::<Vec<_>>());
    }

    #[test]
    fn test_repair_one_checksum_half() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        let offsets = build_log(&old);

        // head half of record 2, tail half of record 10
        corrupt(&old, |raw| {
            raw[offsets[1] as usize + 6] ^= 0xFF;
            let tail = offsets[10] as usize - 1;
            raw[tail] ^= 0xFF;
        });

        let stats = repair(&old, &new);
        assert_eq!(stats.fixed_wrong_checksum, 2);
        assert_eq!(stats.scanned, RECORDS);
        assert_eq!(repaired_ids(&new).len(), RECORDS as usize);
    }

    #[test]
    fn test_repair_double_corruption_not_fixed() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        let offsets = build_log(&old);

        // payload byte and head checksum of the same record
        corrupt(&old, |raw| {
            let at = offsets[4] as usize;
            raw[at + RECORD_HEADER_SIZE + 10] ^= 0x01;
            raw[at + 5] ^= 0x01;
        });

        let stats = repair(&old, &new);
        assert_eq!(stats.not_fixed, 1);
        assert_eq!(stats.scanned, RECORDS - 1);
        assert_eq!(stats.bytes_discarded, offsets[5] - offsets[4]);
        assert_eq!(
            stats.bytes_accepted + stats.bytes_discarded,
            stats.bytes_total
        );
        let ids: Vec<u64> = repaired_ids(&new).into_iter().map(|(_, id)| id).collect();
        assert!(!ids.contains(&5));
    }

    #[test]
    fn test_repair_truncated_tail() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        build_log(&old);

        corrupt(&old, |raw| {
            let len = raw.len();
            raw.truncate(len - 5);
        });

        let stats = repair(&old, &new);
        assert_eq!(stats.scanned, RECORDS - 1);
        assert_eq!(stats.not_fixed, 1);
        assert!(stats.bytes_discarded > 0);
    }

    #[test]
    fn test_repair_damaged_header() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        build_log(&old);
        corrupt(&old, |raw| raw[0] = 0);

        let stats = repair(&old, &new);
        assert_eq!(stats.healthy, RECORDS);

        // a header with no usable content flag cannot be repaired
        corrupt(&old, |raw| {
            raw[6] = 0;
            raw[7] = 0;
        });
        let mut stats = RepairStats::default();
        assert!(ChangeLogFile::repair(&old, &new, &mut stats, None).is_err());
    }

    #[test]
    fn test_repair_keeps_user_flags() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        build_log(&old);
        ChangeLogFile::open(&old, OpenFlags::APPEND, ContentKind::File)
            .unwrap()
            .set_user_flags(LOG_FLAG_COMPACTED)
            .unwrap();

        repair(&old, &new);
        let log = ChangeLogFile::open_read_only(&new, ContentKind::File).unwrap();
        assert!(log.header().is_compacted());
    }

    #[test]
    fn test_repair_random_single_byte_damage() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        let offsets = build_log(&old);
        let end = std::fs::metadata(&old).unwrap().len() as usize;

        let mut rng = rand::thread_rng();
        let at = rng.gen_range(offsets[0] as usize..end);
        corrupt(&old, |raw| raw[at] ^= 0x80);

        // one damaged byte never costs more than one record
        let stats = repair(&old, &new);
        assert!(stats.scanned >= RECORDS - 1);
        assert!(stats.not_fixed <= 1);
        assert!(!std::fs::read(&old).unwrap().is_empty());
    }

    struct Counter(u32);

    impl RepairFeedback for Counter {
        fn report_progress(&mut self, _stats: &RepairStats) {
            self.0 += 1;
        }
    }

    #[test]
    fn test_repair_reports_progress() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old.mdlog");
        let new = dir.path().join("new.mdlog");
        build_log(&old);

        let mut counter = Counter(0);
        let mut stats = RepairStats::default();
        ChangeLogFile::repair(&old, &new, &mut stats, Some(&mut counter)).unwrap();
        assert!(counter.0 >= 1);
    }
}
