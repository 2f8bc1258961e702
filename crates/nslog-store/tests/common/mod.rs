//! Helpers shared by the integration tests

#![allow(dead_code)]

use nslog_common::NamespaceConfig;
use nslog_store::{ContainerMdService, FileMdService, Namespace};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

pub fn boot(dir: &Path) -> Namespace {
    Namespace::boot(NamespaceConfig::in_dir(dir)).unwrap()
}

pub fn boot_slave(dir: &Path) -> Namespace {
    Namespace::boot(NamespaceConfig::slave_in_dir(dir)).unwrap()
}

/// Every persisted attribute plus the derived subtree size, one line per
/// object
pub fn snapshot(ns: &Namespace) -> Vec<String> {
    let mut lines = Vec::new();
    ns.containers().visit(&mut |c| {
        lines.push(format!(
            "c {} parent={} {:?} flags={} mode={:o} uid={} gid={} ctime={} mtime={} xattrs={:?} tree={} children={:?}/{:?}",
            c.id,
            c.parent_id,
            c.name,
            c.flags,
            c.mode,
            c.uid,
            c.gid,
            c.ctime,
            c.mtime,
            c.xattrs,
            c.tree_size,
            c.containers().collect::<Vec<_>>(),
            c.files().collect::<Vec<_>>(),
        ));
    });
    ns.files().visit(&mut |f| {
        lines.push(format!(
            "f {} container={} {:?} size={} uid={} gid={} layout={} mtime={} locations={:?} unlinked={:?} checksum={:?} xattrs={:?}",
            f.id,
            f.container_id,
            f.name,
            f.size,
            f.uid,
            f.gid,
            f.layout_id,
            f.mtime,
            f.locations(),
            f.unlinked_locations(),
            f.checksum(),
            f.xattrs,
        ));
    });
    lines
}

/// Poll `cond` until it holds or ten seconds pass
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
