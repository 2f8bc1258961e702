//! Changelog-backed id store shared by both metadata services
//!
//! Holds the entity map and the changelog handle behind one lock and
//! implements everything that does not depend on the entity kind: boot
//! scan, appends, tailing a master's log and live compaction.

use super::follower::{Follow, FollowerHandle};
use super::{NamespaceLock, ServicePhase};
use crate::buffer::Buffer;
use crate::changelog::{
    ChangeLogFile, CompactStats, LogManager, OpenFlags, RecordKind, ScanControl,
};
use crate::md::{MdRecord, StoreToken};
use nslog_common::{Error, Result, StoreConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Stored version of an entity
#[derive(Debug)]
pub(crate) struct Entry<T> {
    pub md: Arc<T>,
    /// Offset of the latest UPDATE, `None` until first persisted
    pub offset: Option<u64>,
}

/// Where a slave resumes tailing
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FollowCursor {
    pub offset: u64,
    /// The log was compacted; reopen the path before reading on
    pub reopen: bool,
}

pub(crate) struct StoreState<T> {
    pub phase: ServicePhase,
    pub config: Option<StoreConfig>,
    pub log: Option<Arc<ChangeLogFile>>,
    pub entries: HashMap<u64, Entry<T>>,
    pub next_id: u64,
    pub cursor: FollowCursor,
}

impl<T: MdRecord> StoreState<T> {
    pub fn is_slave(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.slave_mode)
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        if self.phase == ServicePhase::Initialized {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "{} store is {:?}",
                T::CONTENT,
                self.phase
            )))
        }
    }

    /// The log, provided this store may be mutated
    pub fn ensure_writable(&self) -> Result<&Arc<ChangeLogFile>> {
        self.ensure_initialized()?;
        if self.is_slave() {
            return Err(Error::invalid_state(format!(
                "{} store is a read-only slave",
                T::CONTENT
            )));
        }
        self.log
            .as_ref()
            .ok_or_else(|| Error::invalid_state("changelog is not open"))
    }

    pub fn entry(&self, id: u64) -> Result<&Entry<T>> {
        self.entries
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("{} #{id}", T::CONTENT)))
    }

    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn append_update(&self, md: &T) -> Result<u64> {
        let log = self.ensure_writable()?;
        let mut buffer = Buffer::with_capacity(256);
        md.serialize(&mut buffer)?;
        log.store_record(RecordKind::Update, &buffer)
    }

    pub fn append_delete(&self, id: u64) -> Result<u64> {
        let log = self.ensure_writable()?;
        let mut buffer = Buffer::with_capacity(8);
        buffer.put_u64(id);
        log.store_record(RecordKind::Delete, &buffer)
    }

    /// Persisted entities
    pub fn persisted(&self) -> impl Iterator<Item = &Arc<T>> {
        self.entries
            .values()
            .filter(|e| e.offset.is_some())
            .map(|e| &e.md)
    }
}

/// Records read by one follower pass
pub(crate) struct Staged<T> {
    /// Latest version of each updated id and the offset it was read at
    pub updated: BTreeMap<u64, (u64, T)>,
    pub deleted: BTreeSet<u64>,
    cursor: FollowCursor,
    log: Option<Arc<ChangeLogFile>>,
    max_id: u64,
}

impl<T> Staged<T> {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// State carried between the phases of a live compaction
pub struct CompactingData {
    new_path: PathBuf,
    upto: u64,
    source: Arc<ChangeLogFile>,
    target: ChangeLogFile,
    offsets: HashMap<u64, u64>,
    stats: CompactStats,
}

impl CompactingData {
    /// Offset in the old log up to which records are compacted offline
    #[must_use]
    pub fn upto(&self) -> u64 {
        self.upto
    }

    #[must_use]
    pub fn stats(&self) -> &CompactStats {
        &self.stats
    }
}

pub(crate) struct LogStore<T> {
    pub token: StoreToken,
    pub state: RwLock<StoreState<T>>,
    follower: Mutex<Option<FollowerHandle>>,
    namespace: Mutex<Option<NamespaceLock>>,
}

impl<T: MdRecord> LogStore<T> {
    pub fn new() -> Self {
        Self {
            token: StoreToken::next(),
            state: RwLock::new(StoreState {
                phase: ServicePhase::Unconfigured,
                config: None,
                log: None,
                entries: HashMap::new(),
                next_id: 1,
                cursor: FollowCursor::default(),
            }),
            follower: Mutex::new(None),
            namespace: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> ServicePhase {
        self.state.read().phase
    }

    pub fn is_slave(&self) -> bool {
        self.state.read().is_slave()
    }

    pub fn configure(&self, config: StoreConfig) -> Result<()> {
        let mut state = self.state.write();
        match state.phase {
            ServicePhase::Unconfigured | ServicePhase::Configured => {
                state.config = Some(config);
                state.phase = ServicePhase::Configured;
                Ok(())
            }
            phase => Err(Error::invalid_state(format!(
                "cannot configure a {} store that is {:?}",
                T::CONTENT,
                phase
            ))),
        }
    }

    /// Scan the changelog and load the latest version of every id
    ///
    /// The store is left Configured; the owning service wires navigation
    /// and then marks it Initialized.
    pub fn load(&self) -> Result<()> {
        let started = Instant::now();
        let config = {
            let state = self.state.read();
            if state.phase != ServicePhase::Configured {
                return Err(Error::invalid_state(format!(
                    "{} store must be configured before initialization",
                    T::CONTENT
                )));
            }
            state
                .config
                .clone()
                .ok_or_else(|| Error::invalid_state("missing store configuration"))?
        };

        let log = if config.slave_mode {
            ChangeLogFile::open_read_only(&config.changelog_path, T::CONTENT)?
        } else {
            ChangeLogFile::open(
                &config.changelog_path,
                OpenFlags::CREATE | OpenFlags::APPEND,
                T::CONTENT,
            )?
            .with_sync_on_write(config.sync_on_write)
        };

        let mut latest: HashMap<u64, u64> = HashMap::new();
        let mut max_id = 0u64;
        let mut stamp = None;
        let summary = log.scan_all_records(|offset, kind, buffer| {
            match kind {
                RecordKind::Update => {
                    let id = buffer.grab_u64(0)?;
                    max_id = max_id.max(id);
                    latest.insert(id, offset);
                }
                RecordKind::Delete => {
                    let id = buffer.grab_u64(0)?;
                    max_id = max_id.max(id);
                    latest.remove(&id);
                }
                RecordKind::CompactStamp if config.slave_mode => {
                    stamp = Some(buffer.grab_u64(0)?);
                    return Ok(ScanControl::Stop);
                }
                RecordKind::CompactStamp => {}
            }
            Ok(ScanControl::Continue)
        })?;

        let mut entries = HashMap::with_capacity(latest.len());
        let mut buffer = Buffer::new();
        for (id, offset) in latest {
            log.read_record(offset, &mut buffer)?;
            let md = T::deserialize(&buffer, self.token)
                .map_err(|e| Error::corruption(offset, format!("undecodable record: {e}")))?;
            entries.insert(
                id,
                Entry {
                    md: Arc::new(md),
                    offset: Some(offset),
                },
            );
        }

        info!(
            "loaded {} {} records from {:?} ({} scanned) in {:?}",
            entries.len(),
            T::CONTENT,
            config.changelog_path,
            summary.records,
            started.elapsed()
        );

        let mut state = self.state.write();
        state.log = Some(Arc::new(log));
        state.entries = entries;
        state.next_id = max_id + 1;
        state.cursor = FollowCursor {
            offset: stamp.unwrap_or(summary.next_offset),
            reopen: stamp.is_some(),
        };
        Ok(())
    }

    /// Drop what `load` read after the rest of the boot failed
    pub fn abort_boot(&self) {
        let mut state = self.state.write();
        state.log = None;
        state.entries.clear();
        state.next_id = 1;
        state.cursor = FollowCursor::default();
        state.phase = ServicePhase::Configured;
    }

    pub fn finalize(&self) {
        self.stop_following();
        let mut state = self.state.write();
        state.log = None;
        state.entries.clear();
        state.phase = ServicePhase::Finalized;
    }

    pub fn start_following<S: Follow>(
        &self,
        name: &str,
        service: &Arc<S>,
        lock: NamespaceLock,
    ) -> Result<()> {
        let interval = {
            let state = self.state.read();
            state.ensure_initialized()?;
            if !state.is_slave() {
                return Err(Error::invalid_state(format!(
                    "{} store is not a slave",
                    T::CONTENT
                )));
            }
            state
                .config
                .as_ref()
                .map(StoreConfig::poll_interval)
                .unwrap_or_default()
        };

        let mut follower = self.follower.lock();
        if follower.is_some() {
            return Err(Error::invalid_state(format!(
                "{} store is already following",
                T::CONTENT
            )));
        }
        *self.namespace.lock() = Some(lock);
        *follower = Some(FollowerHandle::spawn(name, Arc::downgrade(service), interval)?);
        Ok(())
    }

    pub fn stop_following(&self) {
        let follower = self.follower.lock().take();
        if let Some(follower) = follower {
            follower.stop();
        }
    }

    pub fn namespace_lock(&self) -> Option<NamespaceLock> {
        self.namespace.lock().clone()
    }

    /// Read what the master appended since the last pass
    ///
    /// A damaged record ends the pass; everything read before it is still
    /// returned and the cursor stays on the damaged record.
    pub fn fetch_updates(&self) -> Result<Staged<T>> {
        let (mut log, mut cursor, path) = {
            let state = self.state.read();
            state.ensure_initialized()?;
            let log = state
                .log
                .clone()
                .ok_or_else(|| Error::invalid_state("changelog is not open"))?;
            let path = state
                .config
                .as_ref()
                .map(|c| c.changelog_path.clone())
                .ok_or_else(|| Error::invalid_state("missing store configuration"))?;
            (log, state.cursor, path)
        };

        let mut staged = Staged {
            updated: BTreeMap::new(),
            deleted: BTreeSet::new(),
            cursor,
            log: None,
            max_id: 0,
        };

        if cursor.reopen {
            match self.reopen(&log, &path)? {
                Some(reopened) => {
                    debug!("{} follower switched to compacted log {:?}", T::CONTENT, path);
                    log = reopened;
                    cursor.reopen = false;
                    staged.log = Some(log.clone());
                    staged.cursor = cursor;
                }
                // the master has not renamed the compacted log yet
                None => return Ok(staged),
            }
        }

        let mut stamp = None;
        let token = self.token;
        let result = log.follow(cursor.offset, |offset, kind, buffer| {
            let id = buffer
                .grab_u64(0)
                .map_err(|e| Error::corruption(offset, e.to_string()))?;
            match kind {
                RecordKind::Update => {
                    let md = T::deserialize(buffer, token)
                        .map_err(|e| Error::corruption(offset, e.to_string()))?;
                    staged.max_id = staged.max_id.max(id);
                    staged.deleted.remove(&id);
                    staged.updated.insert(id, (offset, md));
                }
                RecordKind::Delete => {
                    staged.max_id = staged.max_id.max(id);
                    staged.updated.remove(&id);
                    staged.deleted.insert(id);
                }
                RecordKind::CompactStamp => {
                    stamp = Some(id);
                    return Ok(ScanControl::Stop);
                }
            }
            Ok(ScanControl::Continue)
        });

        match result {
            Ok(summary) => {
                staged.cursor.offset = summary.next_offset;
            }
            Err(Error::Corruption { offset, reason }) => {
                error!(
                    "{} follower stopped at damaged record at offset {} of {:?}: {}",
                    T::CONTENT,
                    offset,
                    path,
                    reason
                );
                staged.cursor.offset = offset;
            }
            Err(e) => return Err(e),
        }

        if let Some(next) = stamp {
            staged.cursor = FollowCursor {
                offset: next,
                reopen: true,
            };
        }
        Ok(staged)
    }

    fn reopen(&self, current: &ChangeLogFile, path: &Path) -> Result<Option<Arc<ChangeLogFile>>> {
        let candidate = ChangeLogFile::open_read_only(path, T::CONTENT)?;
        if candidate.inode()? == current.inode()? {
            return Ok(None);
        }
        Ok(Some(Arc::new(candidate)))
    }

    /// Record the progress of a follower pass
    pub fn advance_cursor(state: &mut StoreState<T>, staged: &mut Staged<T>) {
        state.cursor = staged.cursor;
        if let Some(log) = staged.log.take() {
            state.log = Some(log);
        }
        state.next_id = state.next_id.max(staged.max_id + 1);
    }

    pub fn compact_prepare(&self, new_path: &Path) -> Result<CompactingData> {
        let state = self.state.read();
        let source = state.ensure_writable()?.clone();
        let upto = source.size();
        let target = ChangeLogFile::create(new_path, T::CONTENT)?.with_sync_on_write(false);

        debug!(
            "preparing compaction of {:?} up to offset {} into {:?}",
            source.path(),
            upto,
            new_path
        );
        Ok(CompactingData {
            new_path: new_path.to_path_buf(),
            upto,
            source,
            target,
            offsets: HashMap::new(),
            stats: CompactStats::default(),
        })
    }

    pub fn compact(data: &mut CompactingData) -> Result<()> {
        data.offsets = LogManager::compact_range(
            &data.source,
            &data.target,
            data.upto,
            &mut data.stats,
            None,
        )?;
        Ok(())
    }

    pub fn compact_commit(&self, data: CompactingData, autorepair: bool) -> Result<CompactStats> {
        let mut state = self.state.write();
        let log = state.ensure_writable()?.clone();
        if !Arc::ptr_eq(&log, &data.source) {
            return Err(Error::invalid_state(
                "changelog was switched since the compaction was prepared",
            ));
        }
        let config = state
            .config
            .clone()
            .ok_or_else(|| Error::invalid_state("missing store configuration"))?;

        let CompactingData {
            new_path,
            upto,
            target,
            mut offsets,
            mut stats,
            ..
        } = data;

        // records appended while the compaction ran
        let tail = log.scan_records_from(upto, autorepair, |_, kind, buffer| {
            match kind {
                RecordKind::Update => {
                    let id = buffer.grab_u64(0)?;
                    offsets.insert(id, target.store_record(kind, buffer)?);
                }
                RecordKind::Delete => {
                    let id = buffer.grab_u64(0)?;
                    target.store_record(kind, buffer)?;
                    offsets.remove(&id);
                }
                RecordKind::CompactStamp => {}
            }
            Ok(ScanControl::Continue)
        })?;
        target.sync()?;
        stats.records_total += tail.records;

        let next_offset = target.size();
        drop(target);
        let mut reopened = ChangeLogFile::open(&new_path, OpenFlags::APPEND, T::CONTENT)?
            .with_sync_on_write(config.sync_on_write);

        // slaves switch logs at the stamp, so it must not outlive a failed switch
        let mark = log.size();
        let mut stamp = Buffer::with_capacity(8);
        stamp.put_u64(next_offset);
        let switched = log
            .store_record(RecordKind::CompactStamp, &stamp)
            .and_then(|_| log.sync())
            .and_then(|()| reopened.rename_to(&config.changelog_path));
        if let Err(e) = switched {
            error!(
                "compaction of {:?} failed at the switch, dropping the stamp: {}",
                config.changelog_path, e
            );
            log.truncate_to(mark)?;
            return Err(e);
        }
        state.log = Some(Arc::new(reopened));

        for (id, entry) in &mut state.entries {
            if entry.offset.is_some() {
                entry.offset = offsets.get(id).copied();
            }
        }

        info!(
            "switched {} store to compacted log {:?}: {} records kept, {} tail records, {} bytes skipped",
            T::CONTENT,
            config.changelog_path,
            offsets.len(),
            tail.records,
            tail.skipped_bytes
        );
        Ok(stats)
    }
}
