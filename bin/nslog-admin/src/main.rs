//! nslog admin - offline maintenance of changelog files
//!
//! None of the commands touch the source log; repair and compaction always
//! write a new file next to it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nslog_store::changelog::HEADER_SIZE;
use nslog_store::{
    Buffer, ChangeLogFile, CompactStage, CompactStats, CompactingFeedback, ContainerMd,
    ContentKind, FileMd, LogManager, MdRecord, RecordKind, RepairFeedback, RepairStats,
    ScanControl, StoreToken,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nslog-admin")]
#[command(about = "Inspect, repair and compact nslog changelogs")]
#[command(version)]
struct Args {
    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rebuild a damaged log into a new file
    Repair {
        /// Damaged log
        old: PathBuf,
        /// Where to write the repaired log
        new: PathBuf,
    },
    /// Write a log holding only the latest version of every live entry
    Compact {
        /// Source log
        old: PathBuf,
        /// Where to write the compacted log
        new: PathBuf,
    },
    /// Print one line per record
    Dump {
        /// Log to read
        log: PathBuf,
        /// Skip damaged frames instead of stopping at the first one
        #[arg(long)]
        tolerant: bool,
    },
    /// Print the header and record counts
    Stat {
        /// Log to read
        log: PathBuf,
    },
}

/// Logs repair progress through tracing
struct RepairProgress;

impl RepairFeedback for RepairProgress {
    fn report_progress(&mut self, stats: &RepairStats) {
        info!(
            "repair: {}/{} bytes, {} records",
            stats.bytes_accepted + stats.bytes_discarded,
            stats.bytes_total,
            stats.scanned
        );
    }
}

/// Prints stage changes and logs copy progress
struct CompactProgress {
    quiet: bool,
}

impl CompactingFeedback for CompactProgress {
    fn report_stage(&mut self, stage: CompactStage) {
        if !self.quiet {
            let label = match stage {
                CompactStage::InitialScan => "scanning source log",
                CompactStage::CopyPreparation => "sorting surviving records",
                CompactStage::RecordCopying => "copying records",
            };
            println!("[compact] {label}");
        }
    }

    fn report_progress(&mut self, stats: &CompactStats) {
        info!(
            "compact: {} of {} records written",
            stats.records_written, stats.records_kept
        );
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Commands::Repair { old, new } => repair(&old, &new, args.json),
        Commands::Compact { old, new } => compact(&old, &new, args.json),
        Commands::Dump { log, tolerant } => dump(&log, tolerant, args.json),
        Commands::Stat { log } => stat(&log, args.json),
    }
}

fn repair(old: &Path, new: &Path, as_json: bool) -> Result<()> {
    let mut stats = RepairStats::default();
    let mut progress = RepairProgress;
    ChangeLogFile::repair(old, new, &mut stats, Some(&mut progress))
        .with_context(|| format!("repairing {}", old.display()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Repair of {}", old.display());
    println!("=========");
    println!("Bytes total:        {}", stats.bytes_total);
    println!("Bytes accepted:     {}", stats.bytes_accepted);
    println!("Bytes discarded:    {}", stats.bytes_discarded);
    println!("Records scanned:    {}", stats.scanned);
    println!("Healthy:            {}", stats.healthy);
    println!("Fixed (magic/kind): {}", stats.fixed_wrong_magic);
    println!("Fixed (size):       {}", stats.fixed_wrong_size);
    println!("Fixed (checksum):   {}", stats.fixed_wrong_checksum);
    println!("Not fixed:          {}", stats.not_fixed);
    println!("Elapsed:            {:?}", stats.elapsed);
    Ok(())
}

fn compact(old: &Path, new: &Path, as_json: bool) -> Result<()> {
    let mut progress = CompactProgress { quiet: as_json };
    let stats = LogManager::compact_log(old, new, Some(&mut progress))
        .with_context(|| format!("compacting {}", old.display()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("Records total:   {}", stats.records_total);
    println!("Updates:         {}", stats.records_updated);
    println!("Deletes:         {}", stats.records_deleted);
    println!("Kept:            {}", stats.records_kept);
    println!("Written:         {}", stats.records_written);
    println!("Elapsed:         {:?}", stats.elapsed);
    Ok(())
}

fn describe(content: ContentKind, buffer: &Buffer) -> nslog_common::Result<serde_json::Value> {
    let token = StoreToken::next();
    let value = match content {
        ContentKind::Container => {
            let md = ContainerMd::deserialize(buffer, token)?;
            json!({
                "id": md.id,
                "parent": md.parent_id,
                "name": md.name,
                "flags": md.flags,
                "mtime": md.mtime.to_string(),
                "xattrs": md.xattrs,
            })
        }
        ContentKind::File => {
            let md = FileMd::deserialize(buffer, token)?;
            json!({
                "id": md.id,
                "container": md.container_id,
                "name": md.name,
                "size": md.size,
                "locations": md.locations(),
                "unlinked": md.unlinked_locations(),
                "mtime": md.mtime.to_string(),
            })
        }
    };
    Ok(value)
}

fn dump(log: &Path, tolerant: bool, as_json: bool) -> Result<()> {
    let header = ChangeLogFile::probe(log).with_context(|| format!("reading {}", log.display()))?;
    let file = ChangeLogFile::open_read_only(log, header.content)?;

    let summary = file.scan_records_from(
        HEADER_SIZE as u64,
        tolerant,
        |offset, kind, buffer| {
            let line = match kind {
                RecordKind::Update => {
                    let md = describe(header.content, buffer)?;
                    json!({ "offset": offset, "kind": kind.to_string(), "md": md })
                }
                RecordKind::Delete => {
                    let id = buffer.grab_u64(0)?;
                    json!({ "offset": offset, "kind": kind.to_string(), "id": id })
                }
                RecordKind::CompactStamp => {
                    let next = buffer.grab_u64(0)?;
                    json!({ "offset": offset, "kind": kind.to_string(), "next_offset": next })
                }
            };
            if as_json {
                println!("{line}");
            } else {
                let detail = ["md", "id", "next_offset"]
                    .iter()
                    .find_map(|key| line.get(*key))
                    .cloned()
                    .unwrap_or_default();
                println!("{offset:>12} {:<13} {detail}", kind.to_string());
            }
            Ok(ScanControl::Continue)
        },
    )?;

    if summary.skipped_bytes > 0 {
        eprintln!("skipped {} unreadable bytes", summary.skipped_bytes);
    }
    Ok(())
}

fn stat(log: &Path, as_json: bool) -> Result<()> {
    let header = ChangeLogFile::probe(log).with_context(|| format!("reading {}", log.display()))?;
    let file = ChangeLogFile::open_read_only(log, header.content)?;

    let mut counts: HashMap<RecordKind, u64> = HashMap::new();
    let mut live: HashSet<u64> = HashSet::new();
    let summary = file.scan_all_records(|_, kind, buffer| {
        *counts.entry(kind).or_default() += 1;
        match kind {
            RecordKind::Update => {
                live.insert(buffer.grab_u64(0)?);
            }
            RecordKind::Delete => {
                live.remove(&buffer.grab_u64(0)?);
            }
            RecordKind::CompactStamp => {}
        }
        Ok(ScanControl::Continue)
    })?;
    let count = |kind| counts.get(&kind).copied().unwrap_or(0);

    if as_json {
        let value = json!({
            "path": log.display().to_string(),
            "content": header.content.to_string(),
            "version": header.version,
            "compacted": header.is_compacted(),
            "size": file.size(),
            "records": summary.records,
            "updates": count(RecordKind::Update),
            "deletes": count(RecordKind::Delete),
            "compact_stamps": count(RecordKind::CompactStamp),
            "live_entries": live.len(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("Log:            {}", log.display());
    println!("Content:        {}", header.content);
    println!("Version:        {}", header.version);
    println!("Compacted:      {}", header.is_compacted());
    println!("Size:           {} bytes", file.size());
    println!("Records:        {}", summary.records);
    println!("  updates:      {}", count(RecordKind::Update));
    println!("  deletes:      {}", count(RecordKind::Delete));
    println!("  stamps:       {}", count(RecordKind::CompactStamp));
    println!("Live entries:   {}", live.len());
    Ok(())
}
