//! Sync time propagation
//!
//! When a container marked with the propagation attribute changes its
//! mtime, the new time is pushed into its own tmtime and then into each
//! ancestor while the ancestor is marked too and actually moves forward.

use super::MAX_TREE_DEPTH;
use crate::svc::{ContainerChange, ContainerEvent, ContainerMdChangeListener, ContainerMdService};
use nslog_common::{ContainerId, Timespec};
use std::sync::Weak;
use tracing::trace;

pub struct SyncTimeAccounting {
    containers: Weak<dyn ContainerMdService>,
}

impl SyncTimeAccounting {
    #[must_use]
    pub fn new(containers: Weak<dyn ContainerMdService>) -> Self {
        Self { containers }
    }

    /// Returns the number of containers whose tmtime moved
    pub fn propagate(&self, start: ContainerId, time: Timespec) -> usize {
        let Some(containers) = self.containers.upgrade() else {
            return 0;
        };
        let mut current = start;
        let mut updated = 0;
        for _ in 0..MAX_TREE_DEPTH {
            match containers.advance_tmtime(current, time) {
                Ok(true) => updated += 1,
                _ => break,
            }
            let Ok(md) = containers.get_container(current) else {
                break;
            };
            if md.is_root() {
                break;
            }
            match containers.get_container(md.parent_id) {
                Ok(parent) if parent.propagates_sync_time() => current = parent.id,
                _ => break,
            }
        }
        trace!("sync time {} propagated over {} containers", time, updated);
        updated
    }
}

impl ContainerMdChangeListener for SyncTimeAccounting {
    fn container_md_changed(&self, event: &ContainerEvent) {
        if event.change == ContainerChange::MTimeChange && event.container.propagates_sync_time() {
            self.propagate(event.container.id, event.container.mtime);
        }
    }
}
