//! Per-user and per-group usage of quota subtrees
//!
//! A quota node is a container carrying the quota flag. Every attached
//! file is charged to the nearest quota node above it, keyed by its uid and
//! its gid. Nodes follow the flag: setting it moves the usage of the
//! subtree out of the enclosing node, clearing it folds the usage back.

use super::MAX_TREE_DEPTH;
use crate::md::{ContainerMd, FileMd};
use crate::svc::{
    ContainerChange, ContainerEvent, ContainerMdChangeListener, ContainerMdService, FileChange,
    FileEvent, FileMdChangeListener, FileMdService,
};
use nslog_common::{layout, ContainerId, Error, Result, ROOT_CONTAINER_ID};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Maps a file to the physical bytes it occupies
pub type SizeMapper = Arc<dyn Fn(&FileMd) -> u64 + Send + Sync>;

/// Default mapper: logical size times the number of stripes
#[must_use]
pub fn replica_size(file: &FileMd) -> u64 {
    file.size.saturating_mul(layout::stripe_count(file.layout_id))
}

/// Usage counters of one uid or gid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    /// Logical bytes
    pub space: u64,
    /// Bytes including replicas
    pub physical_space: u64,
    /// Number of files
    pub files: u64,
}

impl Usage {
    fn add(&mut self, other: Usage) {
        self.space = self.space.saturating_add(other.space);
        self.physical_space = self.physical_space.saturating_add(other.physical_space);
        self.files = self.files.saturating_add(other.files);
    }

    fn sub(&mut self, other: Usage) {
        self.space = self.space.saturating_sub(other.space);
        self.physical_space = self.physical_space.saturating_sub(other.physical_space);
        self.files = self.files.saturating_sub(other.files);
    }

    fn is_zero(&self) -> bool {
        *self == Usage::default()
    }
}

#[derive(Debug, Default)]
struct NodeUsage {
    users: HashMap<u32, Usage>,
    groups: HashMap<u32, Usage>,
}

fn charge(map: &mut HashMap<u32, Usage>, key: u32, usage: Usage, add: bool) {
    let entry = map.entry(key).or_default();
    if add {
        entry.add(usage);
    } else {
        entry.sub(usage);
    }
    if entry.is_zero() {
        map.remove(&key);
    }
}

/// Usage of one quota subtree
#[derive(Debug)]
pub struct QuotaNode {
    container: ContainerId,
    usage: Mutex<NodeUsage>,
}

impl QuotaNode {
    fn new(container: ContainerId) -> Self {
        Self {
            container,
            usage: Mutex::new(NodeUsage::default()),
        }
    }

    /// Container this node accounts for
    pub fn container_id(&self) -> ContainerId {
        self.container
    }

    pub fn user_usage(&self, uid: u32) -> Usage {
        self.usage.lock().users.get(&uid).copied().unwrap_or_default()
    }

    pub fn group_usage(&self, gid: u32) -> Usage {
        self.usage.lock().groups.get(&gid).copied().unwrap_or_default()
    }

    /// Usage of every uid with a non-zero count, by uid
    pub fn users(&self) -> Vec<(u32, Usage)> {
        let mut users: Vec<_> = self.usage.lock().users.iter().map(|(k, v)| (*k, *v)).collect();
        users.sort_unstable_by_key(|(uid, _)| *uid);
        users
    }

    /// Usage of every gid with a non-zero count, by gid
    pub fn groups(&self) -> Vec<(u32, Usage)> {
        let mut groups: Vec<_> = self.usage.lock().groups.iter().map(|(k, v)| (*k, *v)).collect();
        groups.sort_unstable_by_key(|(gid, _)| *gid);
        groups
    }

    /// Usage summed over all users
    pub fn total(&self) -> Usage {
        let mut total = Usage::default();
        for usage in self.usage.lock().users.values() {
            total.add(*usage);
        }
        total
    }

    pub(crate) fn add_file(&self, file: &FileMd, physical: u64) {
        self.apply(file, physical, true);
    }

    pub(crate) fn remove_file(&self, file: &FileMd, physical: u64) {
        self.apply(file, physical, false);
    }

    fn apply(&self, file: &FileMd, physical: u64, add: bool) {
        let usage = Usage {
            space: file.size,
            physical_space: physical,
            files: 1,
        };
        let mut node = self.usage.lock();
        charge(&mut node.users, file.uid, usage, add);
        charge(&mut node.groups, file.gid, usage, add);
    }

    /// Fold the counters of `other` into this node
    pub(crate) fn absorb(&self, other: &QuotaNode) {
        let other = std::mem::take(&mut *other.usage.lock());
        let mut node = self.usage.lock();
        for (uid, usage) in other.users {
            charge(&mut node.users, uid, usage, true);
        }
        for (gid, usage) in other.groups {
            charge(&mut node.groups, gid, usage, true);
        }
    }
}

/// Registry of quota nodes, fed by file change events
pub struct QuotaStats {
    nodes: RwLock<HashMap<ContainerId, Arc<QuotaNode>>>,
    size_mapper: SizeMapper,
    containers: RwLock<Option<Weak<dyn ContainerMdService>>>,
    files: RwLock<Option<Weak<dyn FileMdService>>>,
}

impl Default for QuotaStats {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaStats {
    /// Registry using [`replica_size`] for physical sizes
    #[must_use]
    pub fn new() -> Self {
        Self::with_size_mapper(Arc::new(replica_size))
    }

    #[must_use]
    pub fn with_size_mapper(size_mapper: SizeMapper) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            size_mapper,
            containers: RwLock::new(None),
            files: RwLock::new(None),
        }
    }

    /// Container service used to find the quota node of a file
    pub fn set_container_service(&self, containers: Weak<dyn ContainerMdService>) {
        *self.containers.write() = Some(containers);
    }

    /// File service used to seed nodes registered after boot
    pub fn set_file_service(&self, files: Weak<dyn FileMdService>) {
        *self.files.write() = Some(files);
    }

    /// Physical size of `file` under the configured mapper
    pub fn physical_size(&self, file: &FileMd) -> u64 {
        (self.size_mapper)(file)
    }

    pub fn get(&self, container: ContainerId) -> Option<Arc<QuotaNode>> {
        self.nodes.read().get(&container).cloned()
    }

    /// Create an empty node for `container`
    pub fn register(&self, container: ContainerId) -> Result<Arc<QuotaNode>> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&container) {
            return Err(Error::already_exists(format!(
                "quota node for container {container}"
            )));
        }
        let node = Arc::new(QuotaNode::new(container));
        nodes.insert(container, node.clone());
        debug!("registered quota node {}", container);
        Ok(node)
    }

    pub fn remove(&self, container: ContainerId) -> Result<Arc<QuotaNode>> {
        self.nodes
            .write()
            .remove(&container)
            .ok_or_else(|| Error::not_found(format!("quota node for container {container}")))
    }

    /// Ids of all registered nodes, ascending
    pub fn node_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&self) {
        self.nodes.write().clear();
    }

    /// Recompute every node from the flagged containers and attached files
    pub fn rebuild(&self, containers: &dyn ContainerMdService, files: &dyn FileMdService) {
        self.clear();
        let mut registered = 0usize;
        containers.visit(&mut |md| {
            if md.is_quota_node() && self.register(md.id).is_ok() {
                registered += 1;
            }
        });
        files.visit(&mut |md| self.charge_file(md, true));
        debug!("rebuilt {} quota nodes", registered);
    }

    /// Nearest node at or above `container`
    pub fn find_node(&self, container: ContainerId) -> Option<Arc<QuotaNode>> {
        let containers = self.containers.read().as_ref()?.upgrade()?;
        let mut current = container;
        for _ in 0..MAX_TREE_DEPTH {
            let md = containers.get_container(current).ok()?;
            if md.is_quota_node() {
                if let Some(node) = self.get(current) {
                    return Some(node);
                }
            }
            if current == ROOT_CONTAINER_ID {
                return None;
            }
            current = md.parent_id;
        }
        warn!("no quota lookup result for container {}: tree too deep", container);
        None
    }

    /// Register a node for a freshly flagged container and move the usage
    /// of its subtree out of the enclosing node
    fn attach_node(&self, container: &ContainerMd) {
        let services = (
            self.containers.read().as_ref().and_then(Weak::upgrade),
            self.files.read().as_ref().and_then(Weak::upgrade),
        );
        let (Some(containers), Some(files)) = services else {
            return;
        };
        let enclosing = if container.is_root() {
            None
        } else {
            self.find_node(container.parent_id)
        };
        let Ok(node) = self.register(container.id) else {
            return;
        };

        let mut charged = 0usize;
        let mut stack = vec![container.id];
        while let Some(id) = stack.pop() {
            let Ok(md) = containers.get_container(id) else {
                continue;
            };
            if id != container.id && md.is_quota_node() {
                continue;
            }
            for (_, file) in md.files() {
                let Ok(file) = files.get_file(file) else {
                    continue;
                };
                let physical = self.physical_size(&file);
                node.add_file(&file, physical);
                if let Some(enclosing) = &enclosing {
                    enclosing.remove_file(&file, physical);
                }
                charged += 1;
            }
            stack.extend(md.containers().map(|(_, child)| child));
        }
        debug!("quota node {} seeded with {} files", container.id, charged);
    }

    /// Drop the node of an unflagged container, folding its usage into the
    /// enclosing node
    fn detach_node(&self, container: &ContainerMd) {
        let Ok(node) = self.remove(container.id) else {
            return;
        };
        if container.is_root() {
            return;
        }
        if let Some(enclosing) = self.find_node(container.parent_id) {
            enclosing.absorb(&node);
        }
    }

    fn charge_file(&self, file: &FileMd, add: bool) {
        if !file.is_attached() {
            return;
        }
        let Some(node) = self.find_node(file.container_id) else {
            return;
        };
        let physical = self.physical_size(file);
        if add {
            node.add_file(file, physical);
        } else {
            node.remove_file(file, physical);
        }
    }
}

impl FileMdChangeListener for QuotaStats {
    fn file_md_changed(&self, event: &FileEvent) {
        match event.change {
            FileChange::Created => self.charge_file(&event.file, true),
            FileChange::Updated => {
                if let Some(previous) = &event.previous {
                    self.charge_file(previous, false);
                }
                self.charge_file(&event.file, true);
            }
            FileChange::Deleted => self.charge_file(&event.file, false),
            _ => {}
        }
    }
}

impl ContainerMdChangeListener for QuotaStats {
    fn container_md_changed(&self, event: &ContainerEvent) {
        let container = &event.container;
        let registered = self.get(container.id).is_some();
        match event.change {
            ContainerChange::Created | ContainerChange::Updated => {
                if container.is_quota_node() && !registered {
                    self.attach_node(container);
                } else if !container.is_quota_node() && registered {
                    self.detach_node(container);
                }
            }
            ContainerChange::Deleted if registered => {
                let _ = self.remove(container.id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::StoreToken;

    fn file(uid: u32, gid: u32, size: u64) -> FileMd {
        let mut md = FileMd::new(7, StoreToken::next());
        md.uid = uid;
        md.gid = gid;
        md.size = size;
        md.layout_id = layout::replica(2);
        md
    }

    #[test]
    fn test_node_counters() {
        let node = QuotaNode::new(5);
        let f = file(100, 10, 1000);
        node.add_file(&f, replica_size(&f));
        node.add_file(&file(101, 10, 24), 24);

        assert_eq!(
            node.user_usage(100),
            Usage {
                space: 1000,
                physical_space: 2000,
                files: 1
            }
        );
        assert_eq!(node.group_usage(10).space, 1024);
        assert_eq!(node.group_usage(10).files, 2);
        assert_eq!(node.total().files, 2);

        node.remove_file(&f, 2000);
        assert_eq!(node.user_usage(100), Usage::default());
        assert_eq!(node.users(), vec![(101, node.user_usage(101))]);
    }

    #[test]
    fn test_absorb_moves_counters() {
        let parent = QuotaNode::new(1);
        let child = QuotaNode::new(2);
        parent.add_file(&file(1, 1, 10), 10);
        child.add_file(&file(1, 1, 5), 5);
        child.add_file(&file(2, 1, 5), 5);

        parent.absorb(&child);
        assert_eq!(parent.user_usage(1).space, 15);
        assert_eq!(parent.user_usage(2).files, 1);
        assert_eq!(parent.group_usage(1).files, 3);
        assert!(child.users().is_empty());
    }

    #[test]
    fn test_registry() {
        let stats = QuotaStats::new();
        stats.register(4).unwrap();
        assert!(matches!(stats.register(4), Err(Error::AlreadyExists(_))));
        stats.register(2).unwrap();
        assert_eq!(stats.node_ids(), vec![2, 4]);
        assert!(stats.remove(4).is_ok());
        assert!(stats.remove(4).unwrap_err().is_not_found());
        // no container service: nothing can be resolved
        assert!(stats.find_node(2).is_none());
    }

    #[test]
    fn test_custom_size_mapper() {
        let stats = QuotaStats::with_size_mapper(Arc::new(|f: &FileMd| f.size * 3));
        assert_eq!(stats.physical_size(&file(0, 0, 7)), 21);
        assert_eq!(replica_size(&file(0, 0, 7)), 14);
    }
}
