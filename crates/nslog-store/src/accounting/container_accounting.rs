//! Subtree size accounting
//!
//! Keeps `tree_size` of every container equal to the bytes of all files
//! below it. The counters live in memory only and are rebuilt at boot.

use super::MAX_TREE_DEPTH;
use crate::svc::{
    ContainerChange, ContainerEvent, ContainerMdChangeListener, ContainerMdService, FileChange,
    FileEvent, FileMdChangeListener, FileMdService,
};
use nslog_common::ContainerId;
use std::sync::Weak;
use tracing::{debug, warn};

pub struct ContainerAccounting {
    containers: Weak<dyn ContainerMdService>,
}

impl ContainerAccounting {
    #[must_use]
    pub fn new(containers: Weak<dyn ContainerMdService>) -> Self {
        Self { containers }
    }

    /// Add `delta` to `start` and each of its ancestors
    fn propagate(&self, start: ContainerId, delta: i64) {
        if delta == 0 {
            return;
        }
        let Some(containers) = self.containers.upgrade() else {
            return;
        };
        propagate_size(&*containers, start, delta);
    }

    /// Reset every counter and recompute from the attached files
    pub fn rebuild(containers: &dyn ContainerMdService, files: &dyn FileMdService) {
        let mut resets = Vec::new();
        containers.visit(&mut |md| {
            if md.tree_size != 0 {
                resets.push((md.id, md.tree_size));
            }
        });
        for (id, size) in resets {
            if let Err(e) = containers.adjust_tree_size(id, -(size as i64)) {
                warn!("could not reset tree size of container {}: {}", id, e);
            }
        }

        let mut sizes = Vec::new();
        files.visit(&mut |md| {
            if md.is_attached() && md.size > 0 {
                sizes.push((md.container_id, md.size as i64));
            }
        });
        let count = sizes.len();
        for (container, size) in sizes {
            propagate_size(containers, container, size);
        }
        debug!("tree sizes rebuilt from {} files", count);
    }
}

fn propagate_size(containers: &dyn ContainerMdService, start: ContainerId, delta: i64) {
    let mut current = start;
    for _ in 0..MAX_TREE_DEPTH {
        if containers.adjust_tree_size(current, delta).is_err() {
            return;
        }
        let Ok(md) = containers.get_container(current) else {
            return;
        };
        if md.is_root() {
            return;
        }
        current = md.parent_id;
    }
    warn!(
        "tree size propagation from {} stopped at depth {}",
        start, MAX_TREE_DEPTH
    );
}

impl FileMdChangeListener for ContainerAccounting {
    fn file_md_changed(&self, event: &FileEvent) {
        let file = &event.file;
        match event.change {
            FileChange::SizeChange { delta } if file.is_attached() => {
                self.propagate(file.container_id, delta);
            }
            FileChange::Updated => {
                // a move carries the old size; the size change follows separately
                let Some(previous) = &event.previous else {
                    return;
                };
                if previous.container_id == file.container_id {
                    return;
                }
                let size = previous.size as i64;
                if previous.is_attached() {
                    self.propagate(previous.container_id, -size);
                }
                if file.is_attached() {
                    self.propagate(file.container_id, size);
                }
            }
            FileChange::Deleted if file.is_attached() => {
                self.propagate(file.container_id, -(file.size as i64));
            }
            _ => {}
        }
    }
}

impl ContainerMdChangeListener for ContainerAccounting {
    fn container_md_changed(&self, event: &ContainerEvent) {
        if event.change != ContainerChange::Updated {
            return;
        }
        let Some(previous) = &event.previous else {
            return;
        };
        let current = &event.container;
        if previous.parent_id == current.parent_id || current.tree_size == 0 {
            return;
        }
        let size = current.tree_size as i64;
        self.propagate(previous.parent_id, -size);
        self.propagate(current.parent_id, size);
    }
}

