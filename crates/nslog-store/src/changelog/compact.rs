//! Changelog compaction
//!
//! A compacted log holds exactly one UPDATE per live id, copied unchanged
//! from the source log in original order. The source is only ever read.

use super::{ChangeLogFile, OpenFlags, RecordKind, ScanControl, LOG_FLAG_COMPACTED};
use crate::buffer::Buffer;
use nslog_common::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Stages of a compaction run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactStage {
    /// Scanning the source log for the latest version of each id
    InitialScan,
    /// Ordering the surviving records
    CopyPreparation,
    /// Writing survivors to the new log
    RecordCopying,
}

/// Counters of a compaction run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompactStats {
    /// Records visited in the source log
    pub records_total: u64,
    /// UPDATE records visited
    pub records_updated: u64,
    /// DELETE records visited
    pub records_deleted: u64,
    /// Ids alive at the end of the scan
    pub records_kept: u64,
    /// Records written to the new log
    pub records_written: u64,
    /// Wall-clock time spent
    pub elapsed: Duration,
}

/// Progress sink for compaction
pub trait CompactingFeedback {
    fn report_stage(&mut self, _stage: CompactStage) {}

    fn report_progress(&mut self, _stats: &CompactStats) {}
}

/// How often (in records) copy progress is reported
const FEEDBACK_INTERVAL: u64 = 10_000;

/// Offline and online compaction entry points
pub struct LogManager;

impl LogManager {
    /// Compact the log at `old` into a fresh log at `new`
    pub fn compact_log(
        old: impl AsRef<Path>,
        new: impl AsRef<Path>,
        feedback: Option<&mut dyn CompactingFeedback>,
    ) -> Result<CompactStats> {
        let start = Instant::now();
        let old = old.as_ref();
        let new = new.as_ref();
        let content = ChangeLogFile::probe(old)?.content;

        let source = ChangeLogFile::open_read_only(old, content)?;
        let target = ChangeLogFile::open(new, OpenFlags::CREATE | OpenFlags::TRUNCATE, content)?
            .with_sync_on_write(false);

        let mut stats = CompactStats::default();
        Self::compact_range(&source, &target, u64::MAX, &mut stats, feedback)?;
        stats.elapsed = start.elapsed();

        info!(
            "compacted {:?} into {:?}: {} records, {} kept in {:?}",
            old,
            new,
            stats.records_total,
            stats.records_kept,
            stats.elapsed
        );
        Ok(stats)
    }

    /// Compact the records of `old` found before offset `upto` into `new`
    ///
    /// Returns the offset of every surviving id in the new log.
    pub fn compact_range(
        old: &ChangeLogFile,
        new: &ChangeLogFile,
        upto: u64,
        stats: &mut CompactStats,
        mut feedback: Option<&mut dyn CompactingFeedback>,
    ) -> Result<HashMap<u64, u64>> {
        let start = Instant::now();

        if let Some(feedback) = feedback.as_deref_mut() {
            feedback.report_stage(CompactStage::InitialScan);
        }

        let mut latest: HashMap<u64, u64> = HashMap::new();
        old.scan_all_records(|offset, kind, buffer| {
            if offset >= upto {
                return Ok(ScanControl::Stop);
            }
            stats.records_total += 1;
            match kind {
                RecordKind::Update => {
                    stats.records_updated += 1;
                    latest.insert(buffer.grab_u64(0)?, offset);
                }
                RecordKind::Delete => {
                    stats.records_deleted += 1;
                    latest.remove(&buffer.grab_u64(0)?);
                }
                RecordKind::CompactStamp => {}
            }
            Ok(ScanControl::Continue)
        })?;

        if let Some(feedback) = feedback.as_deref_mut() {
            feedback.report_stage(CompactStage::CopyPreparation);
        }

        let mut survivors: Vec<(u64, u64)> = latest
            .into_iter()
            .map(|(id, offset)| (offset, id))
            .collect();
        survivors.sort_unstable();
        stats.records_kept = survivors.len() as u64;

        if let Some(feedback) = feedback.as_deref_mut() {
            feedback.report_stage(CompactStage::RecordCopying);
        }

        new.set_user_flags(new.user_flags() | LOG_FLAG_COMPACTED)?;

        let mut offsets = HashMap::with_capacity(survivors.len());
        let mut buffer = Buffer::new();
        for (offset, id) in survivors {
            let kind = old.read_record(offset, &mut buffer)?;
            let new_offset = new.store_record(kind, &buffer)?;
            offsets.insert(id, new_offset);
            stats.records_written += 1;

            if stats.records_written % FEEDBACK_INTERVAL == 0 {
                if let Some(feedback) = feedback.as_deref_mut() {
                    stats.elapsed = start.elapsed();
                    feedback.report_progress(stats);
                }
            }
        }
        new.sync()?;

        stats.elapsed = start.elapsed();
        if let Some(feedback) = feedback {
            feedback.report_progress(stats);
        }

        debug!(
            "compacted {} records of {:?} up to offset {}",
            stats.records_written,
            old.path(),
            upto
        );
        Ok(offsets)
    }
}
