//! Metadata services
//!
//! Each service owns one changelog and an id-indexed in-memory copy of the
//! entities it holds. A master appends every mutation to its log; a slave
//! tails the log written by a master and applies what it reads.
//!
//! Lock order: namespace lock, then file service, then container service.
//! Change listeners run with no service lock held.

mod container_svc;
mod log_store;
mod file_svc;
mod follower;

pub use log_store::CompactingData;
pub use container_svc::ContainerMdSvc;
pub use file_svc::FileMdSvc;

use crate::md::{ContainerMd, FileMd};
use nslog_common::{ContainerId, Error, FileId, LocationId, Result, StoreConfig, Timespec};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;

/// Lock shared by everything that reads or writes the namespace as a whole
pub type NamespaceLock = Arc<RwLock<()>>;

/// Create a fresh namespace lock
#[must_use]
pub fn new_namespace_lock() -> NamespaceLock {
    Arc::new(RwLock::new(()))
}

/// Lifecycle of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Unconfigured,
    Configured,
    Initialized,
    Finalized,
}

/// Kind of a container change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerChange {
    Created,
    Updated,
    Deleted,
    MTimeChange,
}

/// A container change delivered to listeners
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    /// Current version (the last one for deletions)
    pub container: Arc<ContainerMd>,
    /// Version replaced by this change
    pub previous: Option<Arc<ContainerMd>>,
    pub change: ContainerChange,
}

/// Kind of a file change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Created,
    Updated,
    Deleted,
    SizeChange { delta: i64 },
    LocationAdded(LocationId),
    LocationReplaced { from: LocationId, to: LocationId },
    LocationUnlinked(LocationId),
    LocationRemoved(LocationId),
}

/// A file change delivered to listeners
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Current version (the last one for deletions)
    pub file: Arc<FileMd>,
    /// Version replaced by this change
    pub previous: Option<Arc<FileMd>>,
    pub change: FileChange,
}

/// Receives container changes
pub trait ContainerMdChangeListener: Send + Sync {
    fn container_md_changed(&self, event: &ContainerEvent);
}

/// Receives file changes
pub trait FileMdChangeListener: Send + Sync {
    fn file_md_changed(&self, event: &FileEvent);
}

/// Store of container metadata
pub trait ContainerMdService: Send + Sync {
    /// Apply configuration; allowed until the service is initialized
    fn configure(&self, config: StoreConfig) -> Result<()>;

    /// Load the changelog and build the in-memory tree
    fn initialize(&self) -> Result<()>;

    /// Stop following and release the changelog
    fn finalize(&self) -> Result<()>;

    /// Start tailing the changelog (slave only)
    fn start_slave(self: Arc<Self>, lock: NamespaceLock) -> Result<()>;

    /// Stop tailing the changelog
    fn stop_slave(&self) -> Result<()>;

    fn is_slave(&self) -> bool;

    fn phase(&self) -> ServicePhase;

    fn get_container(&self, id: ContainerId) -> Result<Arc<ContainerMd>>;

    /// Allocate an id and return an unpersisted container
    fn create_container(&self) -> Result<ContainerMd>;

    /// Persist a container and keep the parent's child map in sync
    fn update_store(&self, md: &ContainerMd) -> Result<()>;

    /// Remove an empty container
    fn remove_container(&self, id: ContainerId) -> Result<()>;

    /// Register a file name in a container's child map (in memory)
    fn attach_file(&self, container: ContainerId, name: &str, file: FileId) -> Result<()>;

    /// Drop a file name from a container's child map if it maps to `file`
    fn detach_file(&self, container: ContainerId, name: &str, file: FileId);

    /// Adjust the in-memory subtree size of a container
    fn adjust_tree_size(&self, id: ContainerId, delta: i64) -> Result<()>;

    /// Advance the in-memory sync time; false when `time` was not newer
    fn advance_tmtime(&self, id: ContainerId, time: Timespec) -> Result<bool>;

    fn add_change_listener(&self, listener: Arc<dyn ContainerMdChangeListener>);

    /// Call `visitor` for every persisted container
    fn visit(&self, visitor: &mut dyn FnMut(&ContainerMd));

    fn num_containers(&self) -> u64;

    /// Id the next created container will get
    fn first_free_id(&self) -> u64;

    /// Start a live compaction into `new_path`
    fn compact_prepare(&self, new_path: &Path) -> Result<CompactingData>;

    /// Copy the records captured by `compact_prepare` (no lock held)
    fn compact(&self, data: &mut CompactingData) -> Result<()>;

    /// Copy the tail and switch to the compacted log
    fn compact_commit(&self, data: CompactingData, autorepair: bool) -> Result<()>;
}

/// Store of file metadata
pub trait FileMdService: Send + Sync {
    fn configure(&self, config: StoreConfig) -> Result<()>;

    /// Wire the container store files attach to
    fn set_container_service(&self, containers: Arc<dyn ContainerMdService>);

    fn initialize(&self) -> Result<()>;

    fn finalize(&self) -> Result<()>;

    fn start_slave(self: Arc<Self>, lock: NamespaceLock) -> Result<()>;

    fn stop_slave(&self) -> Result<()>;

    fn is_slave(&self) -> bool;

    fn phase(&self) -> ServicePhase;

    fn get_file(&self, id: FileId) -> Result<Arc<FileMd>>;

    /// Allocate an id and return an unpersisted file
    fn create_file(&self) -> Result<FileMd>;

    /// Persist a file and keep its container's child map in sync
    fn update_store(&self, md: &FileMd) -> Result<()>;

    fn remove_file(&self, id: FileId) -> Result<()>;

    fn add_change_listener(&self, listener: Arc<dyn FileMdChangeListener>);

    /// Call `visitor` for every persisted file
    fn visit(&self, visitor: &mut dyn FnMut(&FileMd));

    fn num_files(&self) -> u64;

    fn first_free_id(&self) -> u64;

    fn compact_prepare(&self, new_path: &Path) -> Result<CompactingData>;

    fn compact(&self, data: &mut CompactingData) -> Result<()>;

    fn compact_commit(&self, data: CompactingData, autorepair: bool) -> Result<()>;
}

/// Name of the directory holding recovered entries
pub const LOST_FOUND: &str = "lost+found";

/// Where a recovered entry is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// Parent missing; keyed by the missing parent id
    Orphan(ContainerId),
    /// Name taken in the parent; keyed by the parent id
    NameConflict(ContainerId),
}

impl Recovery {
    pub(crate) fn path(self) -> [String; 3] {
        match self {
            Self::Orphan(parent) => [
                LOST_FOUND.to_string(),
                "orphans".to_string(),
                parent.to_string(),
            ],
            Self::NameConflict(parent) => [
                LOST_FOUND.to_string(),
                "name_conflicts".to_string(),
                parent.to_string(),
            ],
        }
    }
}

/// Names are single path components
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::invalid_state(format!("invalid name {name:?}")));
    }
    Ok(())
}

/// Find or create the container at `path` below the root
pub(crate) fn ensure_container_path(
    containers: &dyn ContainerMdService,
    path: &[String],
) -> Result<ContainerId> {
    let mut current = containers.get_container(nslog_common::ROOT_CONTAINER_ID)?;
    for name in path {
        current = match current.find_container(name) {
            Some(id) => containers.get_container(id)?,
            None => {
                let mut md = containers.create_container()?;
                md.parent_id = current.id;
                md.name.clone_from(name);
                md.mode = 0o700;
                containers.update_store(&md)?;
                containers.get_container(md.id)?
            }
        };
    }
    Ok(current.id)
}

/// Events describing the step from `previous` to `current`
pub(crate) fn container_changes(
    previous: Option<&ContainerMd>,
    current: &ContainerMd,
    created: bool,
) -> Vec<ContainerChange> {
    if created {
        return vec![ContainerChange::Created];
    }
    let mut changes = vec![ContainerChange::Updated];
    if previous.is_some_and(|p| p.mtime != current.mtime) {
        changes.push(ContainerChange::MTimeChange);
    }
    changes
}

/// Events describing the step from `previous` to `current`
///
/// Active locations that disappeared without being unlinked are paired in
/// order with newly added ones and reported as replacements.
pub(crate) fn file_changes(
    previous: Option<&FileMd>,
    current: &FileMd,
    created: bool,
) -> Vec<FileChange> {
    let mut changes = vec![if created {
        FileChange::Created
    } else {
        FileChange::Updated
    }];

    let (prev_size, prev_active, prev_unlinked): (u64, &[LocationId], &[LocationId]) =
        match previous {
            Some(p) => (p.size, p.locations(), p.unlinked_locations()),
            None => (0, &[], &[]),
        };

    if prev_size != current.size {
        // sizes are far below i64::MAX in practice
        let delta = current.size as i64 - prev_size as i64;
        changes.push(FileChange::SizeChange { delta });
    }

    let added: Vec<LocationId> = current
        .locations()
        .iter()
        .copied()
        .filter(|l| !prev_active.contains(l))
        .collect();
    let (unlinked, gone): (Vec<LocationId>, Vec<LocationId>) = prev_active
        .iter()
        .copied()
        .filter(|l| !current.has_location(*l))
        .partition(|l| current.has_unlinked_location(*l));

    changes.extend(unlinked.into_iter().map(FileChange::LocationUnlinked));

    let mut added = added.into_iter();
    let mut gone = gone.into_iter();
    loop {
        match (gone.next(), added.next()) {
            (Some(from), Some(to)) => changes.push(FileChange::LocationReplaced { from, to }),
            (Some(from), None) => changes.push(FileChange::LocationRemoved(from)),
            (None, Some(to)) => changes.push(FileChange::LocationAdded(to)),
            (None, None) => break,
        }
    }

    changes.extend(
        prev_unlinked
            .iter()
            .copied()
            .filter(|l| !current.has_unlinked_location(*l) && !current.has_location(*l))
            .map(FileChange::LocationRemoved),
    );

    changes
}
