//! Path-addressed view over the container and file services
//!
//! The services only know ids; this layer resolves `/`-separated paths by
//! walking the child maps from the root and derives paths back from the
//! parent chain. Paths are never stored.

mod hierarchical;

pub use hierarchical::HierarchicalView;

use crate::accounting::QuotaNode;
use crate::md::{ContainerMd, FileMd};
use nslog_common::Result;
use std::sync::Arc;

/// Namespace operations addressed by path
///
/// Objects returned by the getters are shared snapshots; clone one into an
/// owned value to modify it and hand it back through an `update_*` call.
pub trait NamespaceView: Send + Sync {
    fn get_file(&self, uri: &str) -> Result<Arc<FileMd>>;

    /// Create and persist an empty file owned by `uid`/`gid`
    fn create_file(&self, uri: &str, uid: u32, gid: u32) -> Result<FileMd>;

    fn update_file_store(&self, file: &FileMd) -> Result<()>;

    /// Detach a file from the namespace, keeping it addressable by id
    ///
    /// Active replicas move to the unlinked list.
    fn unlink_file(&self, uri: &str) -> Result<()>;

    /// Delete a file that holds no replicas
    fn remove_file(&self, file: &FileMd) -> Result<()>;

    fn get_container(&self, uri: &str) -> Result<Arc<ContainerMd>>;

    /// Create a container, and its missing parents when `create_parents`
    fn create_container(&self, uri: &str, create_parents: bool) -> Result<ContainerMd>;

    fn update_container_store(&self, container: &ContainerMd) -> Result<()>;

    fn remove_container(&self, uri: &str, recursive: bool) -> Result<()>;

    /// Path of a container, ending with `/`
    fn get_uri_container(&self, container: &ContainerMd) -> Result<String>;

    /// Path of an attached file
    fn get_uri_file(&self, file: &FileMd) -> Result<String>;

    /// Quota node of `container`, or of its nearest ancestor when `search`
    fn get_quota_node(&self, container: &ContainerMd, search: bool) -> Result<Arc<QuotaNode>>;

    fn register_quota_node(&self, container: &ContainerMd) -> Result<Arc<QuotaNode>>;

    fn remove_quota_node(&self, container: &ContainerMd) -> Result<()>;

    fn rename_container(&self, container: &ContainerMd, new_name: &str) -> Result<()>;

    fn rename_file(&self, file: &FileMd, new_name: &str) -> Result<()>;
}
