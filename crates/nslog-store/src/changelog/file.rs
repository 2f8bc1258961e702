//! Append-only changelog file
//!
//! One writer appends framed records with positional writes; any number of
//! readers use positional reads, so scanning never disturbs the writer.
//! Corruption met during an ordinary scan is fatal; the only place that
//! recovers damaged records is the offline repair routine.

use super::{
    check_frame, encode_frame, ContentKind, FrameHeader, LogHeader, RecordKind, ScanControl,
    ScanSummary, HEADER_SIZE, RECORD_HEADER_SIZE, RECORD_MAGIC, RECORD_TRAILER_SIZE,
};
use crate::buffer::Buffer;
use nslog_common::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::ops::BitOr;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Flags controlling how a changelog is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u8);

impl OpenFlags {
    /// Open for scanning and random reads only
    pub const READ_ONLY: Self = Self(0x01);
    /// Discard existing content
    pub const TRUNCATE: Self = Self(0x02);
    /// Create the file if it does not exist
    pub const CREATE: Self = Self(0x04);
    /// Open an existing file for appending
    pub const APPEND: Self = Self(0x08);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How a scan treats damaged or incomplete frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    /// Any damage is an error
    Strict,
    /// Skip damaged frames by resyncing on the next record magic
    Tolerant,
    /// An incomplete trailing frame ends the pass quietly
    Follow,
}

enum FrameRead {
    Record { kind: RecordKind, next: u64 },
    Incomplete,
    End,
}

/// Append-only changelog
pub struct ChangeLogFile {
    /// Path the log was opened from
    path: PathBuf,
    /// File handle (positional I/O only)
    file: File,
    /// Decoded header
    header: Mutex<LogHeader>,
    /// Opened for writing
    writable: bool,
    /// Sync after every record
    sync_on_write: bool,
    /// Offset where the next record goes
    size: AtomicU64,
    /// Serializes appends
    write_lock: Mutex<()>,
}

impl ChangeLogFile {
    /// Open (or create) a changelog holding `content` records
    pub fn open(path: impl AsRef<Path>, flags: OpenFlags, content: ContentKind) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let read_only = flags.contains(OpenFlags::READ_ONLY);

        if read_only && (flags.contains(OpenFlags::TRUNCATE) || flags.contains(OpenFlags::CREATE)) {
            return Err(Error::invalid_state(
                "a read-only changelog cannot be created or truncated",
            ));
        }

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
            if flags.contains(OpenFlags::CREATE) {
                options.create(true);
            }
            if flags.contains(OpenFlags::TRUNCATE) {
                options.truncate(true);
            }
        }

        let file = options.open(&path)?;
        let len = file.metadata()?.len();

        let header = if len == 0 {
            if read_only {
                return Err(Error::corruption(0, "changelog is empty"));
            }
            let header = LogHeader::new(content);
            file.write_all_at(&header.to_bytes(), 0)?;
            header
        } else {
            let mut raw = [0u8; HEADER_SIZE];
            read_exact_at(&file, &mut raw, 0)?;
            let header = LogHeader::from_bytes(&raw)?;
            if header.content != content {
                return Err(Error::corruption(
                    0,
                    format!(
                        "changelog holds {} records, expected {}",
                        header.content, content
                    ),
                ));
            }
            header
        };

        debug!(
            "opened {} changelog {:?} ({} bytes, flags {:#x})",
            content, path, len, header.user_flags
        );

        Ok(Self {
            path,
            file,
            header: Mutex::new(header),
            writable: !read_only,
            sync_on_write: true,
            size: AtomicU64::new(len.max(HEADER_SIZE as u64)),
            write_lock: Mutex::new(()),
        })
    }

    /// Read the header of a log without opening it as a changelog
    pub fn probe(path: impl AsRef<Path>) -> Result<LogHeader> {
        let file = File::open(path)?;
        let mut raw = [0u8; HEADER_SIZE];
        read_exact_at(&file, &mut raw, 0)?;
        LogHeader::from_bytes(&raw)
    }

    /// Create a fresh, empty log (truncating any existing file)
    pub fn create(path: impl AsRef<Path>, content: ContentKind) -> Result<Self> {
        Self::open(path, OpenFlags::CREATE | OpenFlags::TRUNCATE, content)
    }

    /// Open an existing log for scanning only
    pub fn open_read_only(path: impl AsRef<Path>, content: ContentKind) -> Result<Self> {
        Self::open(path, OpenFlags::READ_ONLY, content)
    }

    /// Enable or disable the per-record fsync
    #[must_use]
    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    /// Append a record, returning its offset
    pub fn store_record(&self, kind: RecordKind, buffer: &Buffer) -> Result<u64> {
        if !self.writable {
            return Err(Error::invalid_state(format!(
                "changelog {:?} is open read-only",
                self.path
            )));
        }

        let frame = encode_frame(kind, buffer.as_slice())?;

        let _guard = self.write_lock.lock();
        let offset = self.size.load(Ordering::SeqCst);
        self.file.write_all_at(&frame, offset)?;
        if self.sync_on_write {
            self.file.sync_data()?;
        }
        self.size.store(offset + frame.len() as u64, Ordering::SeqCst);

        Ok(offset)
    }

    /// Read the record at `offset` into `buffer`
    pub fn read_record(&self, offset: u64, buffer: &mut Buffer) -> Result<RecordKind> {
        let end = self.current_len()?;
        match self.read_frame(offset, end, buffer)? {
            FrameRead::Record { kind, .. } => Ok(kind),
            FrameRead::Incomplete | FrameRead::End => {
                Err(Error::corruption(offset, "no complete record at offset"))
            }
        }
    }

    /// Visit every record from the start of the log
    pub fn scan_all_records<F>(&self, scanner: F) -> Result<ScanSummary>
    where
        F: FnMut(u64, RecordKind, &Buffer) -> Result<ScanControl>,
    {
        self.scan(HEADER_SIZE as u64, ScanMode::Strict, scanner)
    }

    /// Visit every record from `start`; in tolerant mode damaged frames are
    /// skipped instead of failing the scan
    pub fn scan_records_from<F>(
        &self,
        start: u64,
        tolerate_corruption: bool,
        scanner: F,
    ) -> Result<ScanSummary>
    where
        F: FnMut(u64, RecordKind, &Buffer) -> Result<ScanControl>,
    {
        let mode = if tolerate_corruption {
            ScanMode::Tolerant
        } else {
            ScanMode::Strict
        };
        self.scan(start, mode, scanner)
    }

    /// Visit the records appended since `start`
    ///
    /// Meant to be called repeatedly by a follower; a partially written
    /// trailing record ends the pass and is picked up by the next call. The
    /// returned `next_offset` is where the next call should resume.
    pub fn follow<F>(&self, start: u64, scanner: F) -> Result<ScanSummary>
    where
        F: FnMut(u64, RecordKind, &Buffer) -> Result<ScanControl>,
    {
        self.scan(start, ScanMode::Follow, scanner)
    }

    fn scan<F>(&self, start: u64, mode: ScanMode, mut scanner: F) -> Result<ScanSummary>
    where
        F: FnMut(u64, RecordKind, &Buffer) -> Result<ScanControl>,
    {
        let end = self.current_len()?;
        let mut offset = start.max(HEADER_SIZE as u64);
        let mut buffer = Buffer::with_capacity(4096);
        let mut summary = ScanSummary {
            next_offset: offset,
            ..Default::default()
        };

        loop {
            match self.read_frame(offset, end, &mut buffer) {
                Ok(FrameRead::End) => break,
                Ok(FrameRead::Record { kind, next }) => {
                    summary.records += 1;
                    let control = scanner(offset, kind, &buffer)?;
                    offset = next;
                    if control == ScanControl::Stop {
                        summary.stopped = true;
                        break;
                    }
                }
                Ok(FrameRead::Incomplete) => match mode {
                    ScanMode::Follow => break,
                    ScanMode::Tolerant => {
                        warn!(
                            "skipping {} bytes of incomplete record at offset {} in {:?}",
                            end - offset,
                            offset,
                            self.path
                        );
                        summary.skipped_bytes += end - offset;
                        offset = end;
                        break;
                    }
                    ScanMode::Strict => {
                        return Err(Error::corruption(offset, "truncated record"));
                    }
                },
                Err(e) if mode == ScanMode::Tolerant && e.is_corruption() => {
                    let resume = self.find_next_record(offset + 1, end)?;
                    warn!(
                        "skipping {} unreadable bytes at offset {} in {:?}: {}",
                        resume - offset,
                        offset,
                        self.path,
                        e
                    );
                    summary.skipped_bytes += resume - offset;
                    offset = resume;
                }
                Err(e) => return Err(e),
            }
        }

        summary.next_offset = offset;
        Ok(summary)
    }

    fn read_frame(&self, offset: u64, end: u64, buffer: &mut Buffer) -> Result<FrameRead> {
        if offset >= end {
            return Ok(FrameRead::End);
        }
        if offset + RECORD_HEADER_SIZE as u64 > end {
            return Ok(FrameRead::Incomplete);
        }

        let mut raw = [0u8; RECORD_HEADER_SIZE];
        read_exact_at(&self.file, &mut raw, offset)?;
        let header = FrameHeader::parse(&raw);
        if header.magic != RECORD_MAGIC {
            return Err(Error::corruption(offset, "bad record magic"));
        }

        let next = offset + header.frame_len() as u64;
        if next > end {
            return Ok(FrameRead::Incomplete);
        }

        buffer.clear();
        buffer.resize(usize::from(header.size));
        read_exact_at(
            &self.file,
            buffer.as_mut_slice(),
            offset + RECORD_HEADER_SIZE as u64,
        )?;

        let mut trailer = [0u8; RECORD_TRAILER_SIZE];
        read_exact_at(&self.file, &mut trailer, next - RECORD_TRAILER_SIZE as u64)?;

        let kind = check_frame(offset, &header, buffer.as_slice(), u32::from_le_bytes(trailer))?;
        Ok(FrameRead::Record { kind, next })
    }

    /// First offset after `from` holding a valid record, or `end`
    fn find_next_record(&self, from: u64, end: u64) -> Result<u64> {
        const CHUNK: usize = 64 * 1024;
        let magic = RECORD_MAGIC.to_le_bytes();
        let mut chunk = vec![0u8; CHUNK];
        let mut scratch = Buffer::new();
        let mut pos = from;

        while pos + 1 < end {
            let want = CHUNK.min((end - pos) as usize);
            read_exact_at(&self.file, &mut chunk[..want], pos)?;

            for i in 0..want.saturating_sub(1) {
                if chunk[i] == magic[0] && chunk[i + 1] == magic[1] {
                    let candidate = pos + i as u64;
                    let frame = self.read_frame(candidate, end, &mut scratch);
                    if let Ok(FrameRead::Record { .. }) = frame {
                        return Ok(candidate);
                    }
                }
            }
            // overlap by one byte so a magic split across chunks is seen
            pos += (want as u64).saturating_sub(1).max(1);
        }

        Ok(end)
    }

    /// Replace the header user flags
    pub fn set_user_flags(&self, flags: u16) -> Result<()> {
        if !self.writable {
            return Err(Error::invalid_state("cannot set flags on a read-only changelog"));
        }
        let mut header = self.header.lock();
        let mut updated = *header;
        updated.user_flags = flags;
        self.file.write_all_at(&updated.to_bytes(), 0)?;
        *header = updated;
        Ok(())
    }

    /// Header user flags
    #[must_use]
    pub fn user_flags(&self) -> u16 {
        self.header.lock().user_flags
    }

    /// Decoded header
    #[must_use]
    pub fn header(&self) -> LogHeader {
        *self.header.lock()
    }

    /// Content kind of the log
    #[must_use]
    pub fn content(&self) -> ContentKind {
        self.header.lock().content
    }

    /// Offset where the next record will be appended
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    /// Current length of the file on disk
    pub fn current_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Inode of the open file; tells a renamed-over path from the open handle
    pub fn inode(&self) -> Result<u64> {
        Ok(self.file.metadata()?.ino())
    }

    /// Whether records can be appended
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Flush the log to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Path the log was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut the log back to `offset`, dropping a record that must not stay
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::invalid_state(format!(
                "changelog {:?} is open read-only",
                self.path
            )));
        }
        let _guard = self.write_lock.lock();
        self.file.set_len(offset)?;
        self.file.sync_all()?;
        self.size.store(offset, Ordering::SeqCst);
        Ok(())
    }

    /// Move the log file to `path`; the open handle stays valid
    pub fn rename_to(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::rename(&self.path, path)?;
        self.path = path.to_path_buf();
        Ok(())
    }
}

fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::corruption(offset, "unexpected end of changelog")
        } else {
            Error::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::LOG_FLAG_COMPACTED;
    use tempfile::tempdir;

    fn id_payload(id: u64, extra: &[u8]) -> Buffer {
        let mut buf = Buffer::new();
        buf.put_u64(id);
        buf.put_data(extra);
        buf
    }

    #[test]
    fn test_store_and_read_record() {
        let dir = tempdir().unwrap();
        let log = ChangeLogFile::create(dir.path().join("f.mdlog"), ContentKind::File).unwrap();

        let first = log.store_record(RecordKind::Update, &id_payload(1, b"one")).unwrap();
        let second = log.store_record(RecordKind::Delete, &id_payload(1, b"")).unwrap();
        assert_eq!(first, HEADER_SIZE as u64);
        assert!(second > first);

        let mut buf = Buffer::new();
        assert_eq!(log.read_record(first, &mut buf).unwrap(), RecordKind::Update);
        assert_eq!(buf.grab_u64(0).unwrap(), 1);
        assert_eq!(buf.grab_data(8, 3).unwrap(), b"one");

        assert_eq!(log.read_record(second, &mut buf).unwrap(), RecordKind::Delete);
        assert_eq!(buf.len(), 8);

        // Not a record boundary
        assert!(log.read_record(first + 1, &mut buf).unwrap_err().is_corruption());
    }

    #[test]
    fn test_scan_all_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.mdlog");
        {
            let log = ChangeLogFile::create(&path, ContentKind::Container).unwrap();
            for id in 1..=10 {
                log.store_record(RecordKind::Update, &id_payload(id, b"x")).unwrap();
            }
        }

        let log = ChangeLogFile::open_read_only(&path, ContentKind::Container).unwrap();
        let mut ids = vec![];
        let summary = log
            .scan_all_records(|_, kind, buf| {
                assert_eq!(kind, RecordKind::Update);
                ids.push(buf.grab_u64(0)?);
                Ok(ScanControl::Continue)
            })
            .unwrap();

        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
        assert_eq!(summary.records, 10);
        assert_eq!(summary.next_offset, log.current_len().unwrap());
        assert!(!summary.stopped);
    }

    #[test]
    fn test_scan_stops_on_request() {
        let dir = tempdir().unwrap();
        let log = ChangeLogFile::create(dir.path().join("f.mdlog"), ContentKind::File).unwrap();
        log.store_record(RecordKind::Update, &id_payload(1, b"")).unwrap();
        let mut stamp = Buffer::new();
        stamp.put_u64(0);
        log.store_record(RecordKind::CompactStamp, &stamp).unwrap();
        log.store_record(RecordKind::Update, &id_payload(2, b"")).unwrap();

        let summary = log
            .scan_all_records(|_, kind, _| {
                Ok(if kind == RecordKind::CompactStamp {
                    ScanControl::Stop
                } else {
                    ScanControl::Continue
                })
            })
            .unwrap();

        assert!(summary.stopped);
        assert_eq!(summary.records, 2);
    }

    #[test]
    fn test_open_wrong_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.mdlog");
        ChangeLogFile::create(&path, ContentKind::File).unwrap();

        let err = ChangeLogFile::open(&path, OpenFlags::APPEND, ContentKind::Container)
            .err()
            .unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_open_missing_and_garbage() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.mdlog");
        assert!(matches!(
            ChangeLogFile::open_read_only(&missing, ContentKind::File),
            Err(Error::Io(_))
        ));

        let garbage = dir.path().join("garbage.mdlog");
        std::fs::write(&garbage, b"definitely not a changelog").unwrap();
        assert!(ChangeLogFile::open_read_only(&garbage, ContentKind::File)
            .err()
            .unwrap()
            .is_corruption());
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.mdlog");
        ChangeLogFile::create(&path, ContentKind::File).unwrap();

        let log = ChangeLogFile::open_read_only(&path, ContentKind::File).unwrap();
        assert!(matches!(
            log.store_record(RecordKind::Update, &id_payload(1, b"")),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_reopen_appends_after_existing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.mdlog");
        {
            let log = ChangeLogFile::create(&path, ContentKind::File).unwrap();
            log.store_record(RecordKind::Update, &id_payload(1, b"a")).unwrap();
        }

        let flags = OpenFlags::CREATE | OpenFlags::APPEND;
        let log = ChangeLogFile::open(&path, flags, ContentKind::File).unwrap();
        let before = log.size();
        let offset = log.store_record(RecordKind::Update, &id_payload(2, b"b")).unwrap();
        assert_eq!(offset, before);

        let summary = log.scan_all_records(|_, _, _| Ok(ScanControl::Continue)).unwrap();
        assert_eq!(summary.records, 2);
    }

    #[test]
    fn test_corruption_is_fatal_in_strict_scan() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.mdlog");
        let second;
        {
            let log = ChangeLogFile::create(&path, ContentKind::File).unwrap();
            log.store_record(RecordKind::Update, &id_payload(1, b"aaaa")).unwrap();
            second = log.store_record(RecordKind::Update, &id_payload(2, b"bbbb")).unwrap();
            log.store_record(RecordKind::Update, &id_payload(3, b"cccc")).unwrap();
        }

        // flip a payload byte of the second record
        let mut raw = std::fs::read(&path).unwrap();
        raw[second as usize + RECORD_HEADER_SIZE + 9] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let log = ChangeLogFile::open_read_only(&path, ContentKind::File).unwrap();
        let err = log.scan_all_records(|_, _, _| Ok(ScanControl::Continue)).unwrap_err();
        assert!(matches!(err, Error::Corruption { offset, .. } if offset == second));

        // tolerant mode skips the damaged record
        let mut ids = vec![];
        let summary = log
            .scan_records_from(0, true, |_, _, buf| {
                ids.push(buf.grab_u64(0)?);
                Ok(ScanControl::Continue)
            })
            .unwrap();
        assert_eq!(ids, vec![1, 3]);
        assert!(summary.skipped_bytes > 0);
    }

    #[test]
    fn test_follow_waits_for_incomplete_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.mdlog");
        let writer = ChangeLogFile::create(&path, ContentKind::File).unwrap();
        writer.store_record(RecordKind::Update, &id_payload(1, b"x")).unwrap();

        let reader = ChangeLogFile::open_read_only(&path, ContentKind::File).unwrap();
        let first = reader.follow(0, |_, _, _| Ok(ScanControl::Continue)).unwrap();
        assert_eq!(first.records, 1);

        // simulate a half-written frame at the end of the log
        let frame = encode_frame(RecordKind::Update, id_payload(2, b"y").as_slice()).unwrap();
        let raw_file = OpenOptions::new().write(true).open(&path).unwrap();
        raw_file.write_all_at(&frame[..6], first.next_offset).unwrap();

        let second = reader.follow(first.next_offset, |_, _, _| Ok(ScanControl::Continue)).unwrap();
        assert_eq!(second.records, 0);
        assert_eq!(second.next_offset, first.next_offset);

        raw_file.write_all_at(&frame, first.next_offset).unwrap();
        let third = reader.follow(second.next_offset, |_, _, buf| {
            assert_eq!(buf.grab_u64(0)?, 2);
            Ok(ScanControl::Continue)
        })
        .unwrap();
        assert_eq!(third.records, 1);
    }

    #[test]
    fn test_user_flags_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.mdlog");
        {
            let log = ChangeLogFile::create(&path, ContentKind::File).unwrap();
            log.set_user_flags(LOG_FLAG_COMPACTED).unwrap();
        }
        let log = ChangeLogFile::open_read_only(&path, ContentKind::File).unwrap();
        assert_eq!(log.user_flags(), LOG_FLAG_COMPACTED);
        assert_eq!(ChangeLogFile::probe(&path).unwrap(), log.header());
        assert!(log.header().is_compacted());
    }
}
