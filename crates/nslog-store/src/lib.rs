//! nslog Store - Changelog-backed hierarchical namespace
//!
//! This crate implements the metadata store including:
//! - Append-only changelog files with offline repair
//! - Offline and live log compaction
//! - Container and file metadata with their binary codec
//! - Id-indexed metadata services with master/slave replication
//! - A path-addressed view over both services
//! - Quota, location, subtree-size and sync-time accounting

pub mod accounting;
pub mod buffer;
pub mod changelog;
pub mod md;
pub mod namespace;
pub mod svc;
pub mod view;

// Re-exports
pub use accounting::{
    ContainerAccounting, FileSystemView, QuotaNode, QuotaStats, SyncTimeAccounting, Usage,
};
pub use buffer::{Buffer, BufferReader};
pub use changelog::{
    ChangeLogFile, CompactStage, CompactStats, CompactingFeedback, ContentKind, LogHeader,
    LogManager, OpenFlags, RecordKind, RepairFeedback, RepairStats, ScanControl, ScanSummary,
};
pub use md::{ContainerMd, FileMd, MdRecord, StoreToken};
pub use namespace::Namespace;
pub use svc::{
    ContainerChange, ContainerEvent, ContainerMdChangeListener, ContainerMdService,
    ContainerMdSvc, FileChange, FileEvent, FileMdChangeListener, FileMdService, FileMdSvc,
    NamespaceLock, ServicePhase, new_namespace_lock,
};
pub use view::{HierarchicalView, NamespaceView};
