//! Wiring of the services, accounting listeners and view

use crate::accounting::{ContainerAccounting, FileSystemView, QuotaStats, SyncTimeAccounting};
use crate::svc::{
    new_namespace_lock, ContainerMdService, ContainerMdSvc, FileMdService, FileMdSvc,
    NamespaceLock,
};
use crate::view::HierarchicalView;
use nslog_common::{Error, NamespaceConfig, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// A booted namespace: both metadata services, their accounting and the
/// path-addressed view over them
///
/// In slave mode the services follow the master's logs from background
/// threads until [`Namespace::shutdown`] (or drop).
pub struct Namespace {
    config: NamespaceConfig,
    lock: NamespaceLock,
    containers: Arc<ContainerMdSvc>,
    files: Arc<FileMdSvc>,
    quota: Arc<QuotaStats>,
    fs_view: Arc<FileSystemView>,
    view: HierarchicalView,
}

impl Namespace {
    /// Load both logs, rebuild derived accounting and start following when
    /// configured as a slave
    pub fn boot(config: NamespaceConfig) -> Result<Self> {
        if config.containers.slave_mode != config.files.slave_mode {
            return Err(Error::ConfigInvalid {
                key: "slave_mode".into(),
                value: "container and file stores disagree".into(),
            });
        }
        let started = Instant::now();
        let lock = new_namespace_lock();

        let containers = Arc::new(ContainerMdSvc::new());
        containers.configure(config.containers.clone())?;
        let files = Arc::new(FileMdSvc::new());
        files.configure(config.files.clone())?;

        let container_svc: Arc<dyn ContainerMdService> = containers.clone();
        files.set_container_service(container_svc.clone());

        containers.initialize()?;
        files.initialize()?;

        let file_svc: Arc<dyn FileMdService> = files.clone();
        let quota = Arc::new(QuotaStats::new());
        quota.set_container_service(Arc::downgrade(&container_svc));
        quota.set_file_service(Arc::downgrade(&file_svc));
        let fs_view = Arc::new(FileSystemView::new());
        let accounting = Arc::new(ContainerAccounting::new(Arc::downgrade(&container_svc)));
        let sync_time = Arc::new(SyncTimeAccounting::new(Arc::downgrade(&container_svc)));

        ContainerAccounting::rebuild(&*containers, &*files);
        quota.rebuild(&*containers, &*files);
        fs_view.rebuild(&*files);

        containers.add_change_listener(quota.clone());
        containers.add_change_listener(accounting.clone());
        containers.add_change_listener(sync_time);
        files.add_change_listener(quota.clone());
        files.add_change_listener(fs_view.clone());
        files.add_change_listener(accounting);

        if config.is_slave() {
            containers.clone().start_slave(lock.clone())?;
            files.clone().start_slave(lock.clone())?;
        }

        let view = HierarchicalView::new(container_svc, file_svc, quota.clone(), lock.clone());
        info!(
            "namespace booted in {:?}: {} containers, {} files ({})",
            started.elapsed(),
            containers.num_containers(),
            files.num_files(),
            if config.is_slave() { "slave" } else { "master" }
        );

        Ok(Self {
            config,
            lock,
            containers,
            files,
            quota,
            fs_view,
            view,
        })
    }

    pub fn view(&self) -> &HierarchicalView {
        &self.view
    }

    pub fn containers(&self) -> &Arc<ContainerMdSvc> {
        &self.containers
    }

    pub fn files(&self) -> &Arc<FileMdSvc> {
        &self.files
    }

    pub fn quota_stats(&self) -> &Arc<QuotaStats> {
        &self.quota
    }

    pub fn file_system_view(&self) -> &Arc<FileSystemView> {
        &self.fs_view
    }

    pub fn namespace_lock(&self) -> &NamespaceLock {
        &self.lock
    }

    pub fn is_slave(&self) -> bool {
        self.config.is_slave()
    }

    /// Compact both logs while the namespace stays online
    ///
    /// The copy phase runs without any lock; only the final switch to the
    /// compacted file is exclusive.
    pub fn compact(&self, autorepair: bool) -> Result<()> {
        let path = compacting_path(&self.config.containers.changelog_path);
        let mut data = self.containers.compact_prepare(&path)?;
        self.containers.compact(&mut data)?;
        self.containers.compact_commit(data, autorepair)?;

        let path = compacting_path(&self.config.files.changelog_path);
        let mut data = self.files.compact_prepare(&path)?;
        self.files.compact(&mut data)?;
        self.files.compact_commit(data, autorepair)
    }

    /// Stop followers and release both logs
    pub fn shutdown(self) -> Result<()> {
        if self.is_slave() {
            self.files.stop_slave()?;
            self.containers.stop_slave()?;
        }
        self.files.finalize()?;
        self.containers.finalize()?;
        info!("namespace shut down");
        Ok(())
    }
}

fn compacting_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".compacting");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nslog_common::StoreConfig;

    #[test]
    fn test_compacting_path() {
        assert_eq!(
            compacting_path(Path::new("/ns/files.mdlog")),
            PathBuf::from("/ns/files.mdlog.compacting")
        );
    }

    #[test]
    fn test_mixed_roles_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NamespaceConfig::in_dir(dir.path());
        config.files = StoreConfig::slave(dir.path().join("files.mdlog"));
        assert!(matches!(
            Namespace::boot(config),
            Err(Error::ConfigInvalid { .. })
        ));
    }
}
