use super::NamespaceView;
use crate::accounting::{QuotaNode, QuotaStats, MAX_TREE_DEPTH};
use crate::md::{ContainerMd, FileMd};
use crate::svc::{ContainerMdService, FileMdService, NamespaceLock};
use nslog_common::{ContainerId, Error, Result, Timespec, ROOT_CONTAINER_ID};
use std::sync::Arc;
use tracing::{debug, warn};

fn segments(uri: &str) -> Vec<&str> {
    uri.split('/').filter(|s| !s.is_empty()).collect()
}

/// Split a path into its parent segments and final name
fn split_last(uri: &str) -> Result<(Vec<&str>, &str)> {
    let mut segs = segments(uri);
    let name = segs
        .pop()
        .ok_or_else(|| Error::invalid_state(format!("path {uri:?} has no final component")))?;
    Ok((segs, name))
}

/// POSIX-like tree over the metadata services
pub struct HierarchicalView {
    containers: Arc<dyn ContainerMdService>,
    files: Arc<dyn FileMdService>,
    quota: Arc<QuotaStats>,
    lock: NamespaceLock,
}

impl HierarchicalView {
    pub fn new(
        containers: Arc<dyn ContainerMdService>,
        files: Arc<dyn FileMdService>,
        quota: Arc<QuotaStats>,
        lock: NamespaceLock,
    ) -> Self {
        Self {
            containers,
            files,
            quota,
            lock,
        }
    }

    pub fn container_service(&self) -> &Arc<dyn ContainerMdService> {
        &self.containers
    }

    pub fn file_service(&self) -> &Arc<dyn FileMdService> {
        &self.files
    }

    pub fn quota_stats(&self) -> &Arc<QuotaStats> {
        &self.quota
    }

    /// Lock shared with the services' followers
    pub fn namespace_lock(&self) -> &NamespaceLock {
        &self.lock
    }

    fn walk(&self, segments: &[&str]) -> Result<Arc<ContainerMd>> {
        let mut current = self.containers.get_container(ROOT_CONTAINER_ID)?;
        for name in segments {
            let id = current.find_container(name).ok_or_else(|| {
                Error::not_found(format!("no container {name:?} in container {}", current.id))
            })?;
            current = self.containers.get_container(id)?;
        }
        Ok(current)
    }

    fn find_file(&self, uri: &str) -> Result<(Arc<ContainerMd>, Arc<FileMd>)> {
        let (parent, name) = split_last(uri)?;
        let parent = self.walk(&parent)?;
        let id = parent
            .find_file(name)
            .ok_or_else(|| Error::not_found(format!("file {uri:?}")))?;
        let file = self.files.get_file(id)?;
        Ok((parent, file))
    }

    fn touch(&self, id: ContainerId, time: Timespec) -> Result<()> {
        let mut md = (*self.containers.get_container(id)?).clone();
        if md.mtime >= time {
            return Ok(());
        }
        md.mtime = time;
        self.containers.update_store(&md)
    }

    fn container_uri(&self, id: ContainerId) -> Result<String> {
        let mut current = self.containers.get_container(id)?;
        let mut names: Vec<String> = Vec::new();
        let limit = self.containers.num_containers() + 1;
        for _ in 0..=limit {
            if current.is_root() {
                let mut uri = String::from("/");
                for name in names.iter().rev() {
                    uri.push_str(name);
                    uri.push('/');
                }
                return Ok(uri);
            }
            names.push(current.name.clone());
            current = self.containers.get_container(current.parent_id)?;
        }
        Err(Error::invalid_state(format!(
            "container {id} is not connected to the root"
        )))
    }

    /// Nearest registered quota node at or above `start`
    fn nearest_quota_node(&self, start: ContainerId) -> Result<Option<Arc<QuotaNode>>> {
        let mut current = self.containers.get_container(start)?;
        for _ in 0..MAX_TREE_DEPTH {
            if current.is_quota_node() {
                if let Some(node) = self.quota.get(current.id) {
                    return Ok(Some(node));
                }
            }
            if current.is_root() {
                break;
            }
            current = self.containers.get_container(current.parent_id)?;
        }
        Ok(None)
    }

    /// Delete `top` and everything below it, children before parents
    fn remove_subtree(&self, top: ContainerId) -> Result<()> {
        let mut stack = vec![(top, false)];
        while let Some((id, expanded)) = stack.pop() {
            let md = self.containers.get_container(id)?;
            if !expanded {
                stack.push((id, true));
                stack.extend(md.containers().map(|(_, child)| (child, false)));
                continue;
            }
            for (_, file) in md.files() {
                self.files.remove_file(file)?;
            }
            self.containers.remove_container(id)?;
        }
        Ok(())
    }
}

impl NamespaceView for HierarchicalView {
    fn get_file(&self, uri: &str) -> Result<Arc<FileMd>> {
        let _ns = self.lock.read();
        Ok(self.find_file(uri)?.1)
    }

    fn create_file(&self, uri: &str, uid: u32, gid: u32) -> Result<FileMd> {
        let _ns = self.lock.write();
        let (parent, name) = split_last(uri)?;
        let parent = self.walk(&parent)?;
        if parent.find_container(name).is_some() || parent.find_file(name).is_some() {
            return Err(Error::already_exists(uri));
        }

        let now = Timespec::now();
        let mut md = self.files.create_file()?;
        md.name = name.to_string();
        md.container_id = parent.id;
        md.uid = uid;
        md.gid = gid;
        md.ctime = now;
        md.mtime = now;
        if let Err(e) = self.files.update_store(&md) {
            if let Err(cleanup) = self.files.remove_file(md.id) {
                warn!("failed to drop unstored file {}: {}", md.id, cleanup);
            }
            return Err(e);
        }
        self.touch(parent.id, now)?;
        debug!("created file {} as {:?}", md.id, uri);
        Ok(md)
    }

    fn update_file_store(&self, file: &FileMd) -> Result<()> {
        let _ns = self.lock.write();
        if file.is_attached() {
            let parent = self.containers.get_container(file.container_id)?;
            if parent.find_container(&file.name).is_some() {
                return Err(Error::already_exists(format!(
                    "container {:?} in container {}",
                    file.name, parent.id
                )));
            }
        }
        self.files.update_store(file)
    }

    fn unlink_file(&self, uri: &str) -> Result<()> {
        let _ns = self.lock.write();
        let (parent, file) = self.find_file(uri)?;
        let mut md = (*file).clone();
        md.container_id = 0;
        md.unlink_all_locations();
        self.files.update_store(&md)?;
        self.touch(parent.id, Timespec::now())
    }

    fn remove_file(&self, file: &FileMd) -> Result<()> {
        let _ns = self.lock.write();
        let current = self.files.get_file(file.id)?;
        if current.num_locations() > 0 || current.num_unlinked_locations() > 0 {
            return Err(Error::invalid_state(format!(
                "file {} still has {} replicas and {} pending deletions",
                current.id,
                current.num_locations(),
                current.num_unlinked_locations()
            )));
        }
        self.files.remove_file(current.id)?;
        if current.is_attached() {
            self.touch(current.container_id, Timespec::now())?;
        }
        Ok(())
    }

    fn get_container(&self, uri: &str) -> Result<Arc<ContainerMd>> {
        let _ns = self.lock.read();
        self.walk(&segments(uri))
    }

    fn create_container(&self, uri: &str, create_parents: bool) -> Result<ContainerMd> {
        let _ns = self.lock.write();
        let segs = segments(uri);
        if segs.is_empty() {
            return Err(Error::already_exists("/"));
        }

        let mut current = self.containers.get_container(ROOT_CONTAINER_ID)?;
        let mut depth = 0;
        while let Some(id) = segs.get(depth).and_then(|name| current.find_container(name)) {
            current = self.containers.get_container(id)?;
            depth += 1;
        }
        if depth == segs.len() {
            return Err(Error::already_exists(uri));
        }
        if !create_parents && depth + 1 < segs.len() {
            return Err(Error::not_found(format!(
                "parent {:?} of {uri:?}",
                segs[depth]
            )));
        }

        let now = Timespec::now();
        let first_parent = current.id;
        for name in &segs[depth..] {
            if current.find_file(name).is_some() {
                return Err(Error::already_exists(format!(
                    "file {name:?} in container {}",
                    current.id
                )));
            }
            let mut md = self.containers.create_container()?;
            md.parent_id = current.id;
            md.name = (*name).to_string();
            md.uid = current.uid;
            md.gid = current.gid;
            md.mode = current.mode;
            md.ctime = now;
            md.mtime = now;
            md.tmtime = now;
            if let Err(e) = self.containers.update_store(&md) {
                if let Err(cleanup) = self.containers.remove_container(md.id) {
                    warn!("failed to drop unstored container {}: {}", md.id, cleanup);
                }
                return Err(e);
            }
            current = self.containers.get_container(md.id)?;
        }
        self.touch(first_parent, now)?;
        debug!("created container {} as {:?}", current.id, uri);
        Ok((*current).clone())
    }

    fn update_container_store(&self, container: &ContainerMd) -> Result<()> {
        let _ns = self.lock.write();
        if !container.is_root() {
            let parent = self.containers.get_container(container.parent_id)?;
            if parent.find_file(&container.name).is_some() {
                return Err(Error::already_exists(format!(
                    "file {:?} in container {}",
                    container.name, parent.id
                )));
            }
        }
        self.containers.update_store(container)
    }

    fn remove_container(&self, uri: &str, recursive: bool) -> Result<()> {
        let _ns = self.lock.write();
        let segs = segments(uri);
        if segs.is_empty() {
            return Err(Error::PermissionDenied("cannot remove the root container".into()));
        }
        let md = self.walk(&segs)?;
        if !md.is_empty() && !recursive {
            return Err(Error::NotEmpty(uri.to_string()));
        }
        self.remove_subtree(md.id)?;
        self.touch(md.parent_id, Timespec::now())?;
        debug!("removed container {} at {:?}", md.id, uri);
        Ok(())
    }

    fn get_uri_container(&self, container: &ContainerMd) -> Result<String> {
        let _ns = self.lock.read();
        self.container_uri(container.id)
    }

    fn get_uri_file(&self, file: &FileMd) -> Result<String> {
        let _ns = self.lock.read();
        let current = self.files.get_file(file.id)?;
        if !current.is_attached() {
            return Err(Error::not_found(format!("file {} is detached", file.id)));
        }
        let mut uri = self.container_uri(current.container_id)?;
        uri.push_str(&current.name);
        Ok(uri)
    }

    fn get_quota_node(&self, container: &ContainerMd, search: bool) -> Result<Arc<QuotaNode>> {
        let _ns = self.lock.read();
        let current = self.containers.get_container(container.id)?;
        let node = if search {
            self.nearest_quota_node(current.id)?
        } else if current.is_quota_node() {
            self.quota.get(current.id)
        } else {
            None
        };
        node.ok_or_else(|| Error::not_found(format!("quota node for container {}", container.id)))
    }

    fn register_quota_node(&self, container: &ContainerMd) -> Result<Arc<QuotaNode>> {
        let _ns = self.lock.write();
        let current = self.containers.get_container(container.id)?;
        if current.is_quota_node() {
            return Err(Error::already_exists(format!(
                "quota node for container {}",
                current.id
            )));
        }
        let mut md = (*current).clone();
        md.set_quota_node(true);
        self.containers.update_store(&md)?;
        self.quota
            .get(md.id)
            .ok_or_else(|| Error::invalid_state("quota accounting is not listening"))
    }

    fn remove_quota_node(&self, container: &ContainerMd) -> Result<()> {
        let _ns = self.lock.write();
        let current = self.containers.get_container(container.id)?;
        if !current.is_quota_node() {
            return Err(Error::not_found(format!(
                "quota node for container {}",
                current.id
            )));
        }
        let mut md = (*current).clone();
        md.set_quota_node(false);
        self.containers.update_store(&md)
    }

    fn rename_container(&self, container: &ContainerMd, new_name: &str) -> Result<()> {
        let _ns = self.lock.write();
        let current = self.containers.get_container(container.id)?;
        if current.is_root() {
            return Err(Error::PermissionDenied("cannot rename the root container".into()));
        }
        let parent = self.containers.get_container(current.parent_id)?;
        if parent.find_file(new_name).is_some() {
            return Err(Error::already_exists(format!(
                "file {new_name:?} in container {}",
                parent.id
            )));
        }
        let mut md = (*current).clone();
        md.name = new_name.to_string();
        self.containers.update_store(&md)?;
        self.touch(parent.id, Timespec::now())
    }

    fn rename_file(&self, file: &FileMd, new_name: &str) -> Result<()> {
        let _ns = self.lock.write();
        let current = self.files.get_file(file.id)?;
        if !current.is_attached() {
            return Err(Error::not_found(format!("file {} is detached", file.id)));
        }
        let parent = self.containers.get_container(current.container_id)?;
        if parent.find_container(new_name).is_some() {
            return Err(Error::already_exists(format!(
                "container {new_name:?} in container {}",
                parent.id
            )));
        }
        let mut md = (*current).clone();
        md.name = new_name.to_string();
        self.files.update_store(&md)?;
        self.touch(parent.id, Timespec::now())
    }
}
