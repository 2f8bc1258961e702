//! Derived accounting maintained from change events
//!
//! Every listener here is fed synchronously by the metadata services and
//! can be rebuilt from a full visit after boot.

mod container_accounting;
mod fs_view;
mod quota;
mod sync_time;

pub use container_accounting::ContainerAccounting;
pub use fs_view::FileSystemView;
pub use quota::{replica_size, QuotaNode, QuotaStats, SizeMapper, Usage};
pub use sync_time::SyncTimeAccounting;

/// Bound on ancestor walks, guarding against cycles
pub const MAX_TREE_DEPTH: usize = 255;
