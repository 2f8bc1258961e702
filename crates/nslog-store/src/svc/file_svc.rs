//! File metadata service

use super::follower::Follow;
use super::log_store::{Entry, LogStore};
use super::{
    ensure_container_path, file_changes, CompactingData, ContainerMdService, FileChange, FileEvent,
    FileMdChangeListener, FileMdService, NamespaceLock, Recovery, ServicePhase, validate_name,
};
use crate::md::{FileMd, MdRecord};
use nslog_common::{Error, FileId, Result, StoreConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Changelog-backed file store
///
/// Files are linked into their container's child map through the container
/// service, which must be set before the service is initialized.
pub struct FileMdSvc {
    store: LogStore<FileMd>,
    containers: RwLock<Option<Arc<dyn ContainerMdService>>>,
    listeners: RwLock<Vec<Arc<dyn FileMdChangeListener>>>,
    /// Slave only: files whose container is not known yet, with the version
    /// listeners last heard about
    pending_attach: Mutex<BTreeMap<FileId, Option<Arc<FileMd>>>>,
}

impl Default for FileMdSvc {
    fn default() -> Self {
        Self::new()
    }
}

impl FileMdSvc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: LogStore::new(),
            containers: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            pending_attach: Mutex::new(BTreeMap::new()),
        }
    }

    fn containers(&self) -> Result<Arc<dyn ContainerMdService>> {
        self.containers
            .read()
            .clone()
            .ok_or_else(|| Error::invalid_state("file service has no container service"))
    }

    fn fire(&self, events: Vec<FileEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for event in &events {
            for listener in &listeners {
                listener.file_md_changed(event);
            }
        }
    }

    fn events_for(
        previous: Option<Arc<FileMd>>,
        current: &Arc<FileMd>,
        created: bool,
    ) -> impl Iterator<Item = FileEvent> + '_ {
        file_changes(previous.as_deref(), current, created)
            .into_iter()
            .map(move |change| FileEvent {
                file: current.clone(),
                previous: previous.clone(),
                change,
            })
    }

    fn place_in_lost_found(
        &self,
        containers: &dyn ContainerMdService,
        id: FileId,
        recovery: Recovery,
    ) -> Result<()> {
        let dir = ensure_container_path(containers, &recovery.path())?;
        let mut md = (*self.get_file(id)?).clone();
        warn!(
            "placing file {} ({:?}) in lost+found: {:?}",
            id, md.name, recovery
        );
        md.name = format!("{}.{}", md.name, md.id);
        md.container_id = dir;
        self.update_store(&md)
    }

    fn apply_updates(&self) -> Result<()> {
        let containers = self.containers()?;
        let mut staged = self.store.fetch_updates()?;
        let lock = self
            .store
            .namespace_lock()
            .ok_or_else(|| Error::invalid_state("slave follows without a namespace lock"))?;
        let _namespace = lock.write();

        let mut events = Vec::new();
        {
            let mut state = self.store.state.write();
            let mut pending = self.pending_attach.lock();

            for id in &staged.deleted {
                let announced = pending.remove(id);
                if let Some(entry) = state.entries.remove(id) {
                    if entry.md.is_attached() {
                        containers.detach_file(entry.md.container_id, &entry.md.name, *id);
                    }
                    if let Some(file) = announced.unwrap_or(Some(entry.md)) {
                        events.push(FileEvent {
                            file,
                            previous: None,
                            change: FileChange::Deleted,
                        });
                    }
                }
            }

            for (id, (offset, md)) in std::mem::take(&mut staged.updated) {
                let previous = state.entries.get(&id).map(|e| e.md.clone());
                let md = Arc::new(md);
                let relink = previous
                    .as_ref()
                    .is_none_or(|p| p.container_id != md.container_id || p.name != md.name);
                if relink {
                    if let Some(previous) = previous.as_ref().filter(|p| p.is_attached()) {
                        containers.detach_file(previous.container_id, &previous.name, id);
                    }
                }
                state.entries.insert(
                    id,
                    Entry {
                        md: md.clone(),
                        offset: Some(offset),
                    },
                );
                // listeners hear about a file once it is linked
                if relink || pending.contains_key(&id) {
                    pending.entry(id).or_insert(previous);
                } else {
                    events.extend(Self::events_for(previous, &md, false));
                }
            }

            for id in pending.keys().copied().collect::<Vec<_>>() {
                let Some(md) = state.entries.get(&id).map(|e| e.md.clone()) else {
                    pending.remove(&id);
                    continue;
                };
                if md.is_attached() {
                    match containers.attach_file(md.container_id, &md.name, id) {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => warn!("slave cannot attach file {}: {}", id, e),
                    }
                }
                let announced = pending.remove(&id).flatten();
                let created = announced.is_none();
                events.extend(Self::events_for(announced, &md, created));
            }

            LogStore::advance_cursor(&mut state, &mut staged);
        }

        if !events.is_empty() {
            debug!("file follower applied {} changes", events.len());
        }
        self.fire(events);
        Ok(())
    }

    /// Wire up a freshly loaded store and mark it Initialized
    ///
    /// Lost+found placement goes through the regular mutations, so the
    /// phase is set first and `initialize` rolls it back on failure.
    fn boot(&self, containers: &Arc<dyn ContainerMdService>) -> Result<()> {
        let slave = self.store.is_slave();

        let recoveries = {
            let mut state = self.store.state.write();
            state.phase = ServicePhase::Initialized;

            let mut files: Vec<&Arc<FileMd>> = state.persisted().collect();
            files.sort_unstable_by_key(|md| md.id);

            let mut recoveries = Vec::new();
            for md in files.into_iter().filter(|md| md.is_attached()) {
                match containers.attach_file(md.container_id, &md.name, md.id) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        recoveries.push((md.id, Recovery::Orphan(md.container_id)));
                    }
                    Err(Error::AlreadyExists(_)) => {
                        recoveries.push((md.id, Recovery::NameConflict(md.container_id)));
                    }
                    Err(e) => return Err(e),
                }
            }
            recoveries
        };

        if slave {
            let mut pending = self.pending_attach.lock();
            for (id, recovery) in recoveries {
                match recovery {
                    Recovery::Orphan(_) => {
                        pending.insert(id, None);
                    }
                    Recovery::NameConflict(container) => {
                        warn!("slave leaves file {} unattached: name taken in {}", id, container);
                    }
                }
            }
        } else {
            for (id, recovery) in recoveries {
                self.place_in_lost_found(&**containers, id, recovery)?;
            }
        }

        info!(
            "file service initialized ({} files, {})",
            self.num_files(),
            if slave { "slave" } else { "master" }
        );
        Ok(())
    }
}

impl Follow for FileMdSvc {
    fn follow_cycle(&self) -> Result<()> {
        self.apply_updates()
    }
}

impl FileMdService for FileMdSvc {
    fn configure(&self, config: StoreConfig) -> Result<()> {
        self.store.configure(config)
    }

    fn set_container_service(&self, containers: Arc<dyn ContainerMdService>) {
        *self.containers.write() = Some(containers);
    }

    fn initialize(&self) -> Result<()> {
        let containers = self.containers()?;
        if containers.phase() != ServicePhase::Initialized {
            return Err(Error::invalid_state(
                "container service must be initialized before the file service",
            ));
        }
        self.store.load()?;
        self.boot(&containers).inspect_err(|_| {
            self.store.abort_boot();
            self.pending_attach.lock().clear();
        })
    }

    fn finalize(&self) -> Result<()> {
        self.store.finalize();
        self.pending_attach.lock().clear();
        Ok(())
    }

    fn start_slave(self: Arc<Self>, lock: NamespaceLock) -> Result<()> {
        self.containers()?;
        self.store.start_following("files", &self, lock)
    }

    fn stop_slave(&self) -> Result<()> {
        self.store.stop_following();
        Ok(())
    }

    fn is_slave(&self) -> bool {
        self.store.is_slave()
    }

    fn phase(&self) -> ServicePhase {
        self.store.phase()
    }

    fn get_file(&self, id: FileId) -> Result<Arc<FileMd>> {
        let state = self.store.state.read();
        state.ensure_initialized()?;
        Ok(state.entry(id)?.md.clone())
    }

    fn create_file(&self) -> Result<FileMd> {
        let mut state = self.store.state.write();
        state.ensure_writable()?;
        let id = state.allocate_id();
        let md = FileMd::new(id, self.store.token);
        state.entries.insert(
            id,
            Entry {
                md: Arc::new(md.clone()),
                offset: None,
            },
        );
        Ok(md)
    }

    fn update_store(&self, md: &FileMd) -> Result<()> {
        let containers = self.containers()?;
        let events: Vec<FileEvent> = {
            let mut state = self.store.state.write();
            state.ensure_writable()?;
            if md.owner() != Some(self.store.token) {
                return Err(Error::invalid_state(format!(
                    "file {} does not belong to this store",
                    md.id
                )));
            }

            let entry = state.entry(md.id)?;
            let previous = entry.md.clone();
            let created = entry.offset.is_none();
            let moved = created
                || previous.container_id != md.container_id
                || previous.name != md.name;

            if moved && md.is_attached() {
                validate_name(&md.name)?;
                let container = containers.get_container(md.container_id)?;
                if container.find_file(&md.name).is_some_and(|f| f != md.id) {
                    return Err(Error::already_exists(format!(
                        "{:?} in container {}",
                        md.name, md.container_id
                    )));
                }
            }

            let offset = state.append_update(md)?;

            if moved {
                if !created && previous.is_attached() {
                    containers.detach_file(previous.container_id, &previous.name, md.id);
                }
                if md.is_attached() {
                    if let Err(e) = containers.attach_file(md.container_id, &md.name, md.id) {
                        warn!("stored file {} but could not link it: {}", md.id, e);
                    }
                }
            }

            debug!(
                "stored file {} ({:?}) at offset {}",
                md.id, md.name, offset
            );

            let current = Arc::new(md.clone());
            state.entries.insert(
                md.id,
                Entry {
                    md: current.clone(),
                    offset: Some(offset),
                },
            );

            let previous = (!created).then_some(previous);
            Self::events_for(previous, &current, created).collect()
        };

        self.fire(events);
        Ok(())
    }

    fn remove_file(&self, id: FileId) -> Result<()> {
        let containers = self.containers()?;
        let event = {
            let mut state = self.store.state.write();
            state.ensure_writable()?;
            let entry = state.entry(id)?;
            let md = entry.md.clone();
            let persisted = entry.offset.is_some();

            if persisted {
                state.append_delete(id)?;
            }
            state.entries.remove(&id);
            if persisted && md.is_attached() {
                containers.detach_file(md.container_id, &md.name, id);
            }
            debug!("removed file {} ({:?})", id, md.name);

            persisted.then(|| FileEvent {
                file: md,
                previous: None,
                change: FileChange::Deleted,
            })
        };

        self.fire(event.into_iter().collect());
        Ok(())
    }

    fn add_change_listener(&self, listener: Arc<dyn FileMdChangeListener>) {
        self.listeners.write().push(listener);
    }

    fn visit(&self, visitor: &mut dyn FnMut(&FileMd)) {
        let mut snapshot: Vec<Arc<FileMd>> = self.store.state.read().persisted().cloned().collect();
        snapshot.sort_unstable_by_key(|md| md.id);
        for md in &snapshot {
            visitor(md);
        }
    }

    fn num_files(&self) -> u64 {
        self.store.state.read().persisted().count() as u64
    }

    fn first_free_id(&self) -> u64 {
        self.store.state.read().next_id
    }

    fn compact_prepare(&self, new_path: &Path) -> Result<CompactingData> {
        self.store.compact_prepare(new_path)
    }

    fn compact(&self, data: &mut CompactingData) -> Result<()> {
        LogStore::<FileMd>::compact(data)
    }

    fn compact_commit(&self, data: CompactingData, autorepair: bool) -> Result<()> {
        let stats = self.store.compact_commit(data, autorepair)?;
        info!(
            "file log compacted: {} records scanned, {} kept in {:?}",
            stats.records_total, stats.records_kept, stats.elapsed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::changelog::{ChangeLogFile, ContentKind, RecordKind};
    use crate::md::StoreToken;
    use crate::svc::ContainerMdSvc;
    use nslog_common::{ContainerId, ROOT_CONTAINER_ID};
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        containers_path: PathBuf,
        files_path: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            Self {
                containers_path: dir.path().join("directories.mdlog"),
                files_path: dir.path().join("files.mdlog"),
                _dir: dir,
            }
        }

        fn boot(&self) -> (Arc<ContainerMdSvc>, Arc<FileMdSvc>) {
            let containers = Arc::new(ContainerMdSvc::new());
            containers
                .configure(StoreConfig::new(&self.containers_path))
                .unwrap();
            containers.initialize().unwrap();

            let files = Arc::new(FileMdSvc::new());
            files.configure(StoreConfig::new(&self.files_path)).unwrap();
            files.set_container_service(containers.clone());
            files.initialize().unwrap();
            (containers, files)
        }
    }

    fn touch(files: &FileMdSvc, container: ContainerId, name: &str) -> FileId {
        let mut md = files.create_file().unwrap();
        md.container_id = container;
        md.name = name.to_string();
        files.update_store(&md).unwrap();
        md.id
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<FileChange>>);

    impl FileMdChangeListener for Recorder {
        fn file_md_changed(&self, event: &FileEvent) {
            self.0.lock().push(event.change);
        }
    }

    #[test]
    fn test_create_links_into_container() {
        let fx = Fixture::new();
        let (containers, files) = fx.boot();
        let id = touch(&files, ROOT_CONTAINER_ID, "f");

        let root = containers.get_container(ROOT_CONTAINER_ID).unwrap();
        assert_eq!(root.find_file("f"), Some(id));
        assert_eq!(files.get_file(id).unwrap().name, "f");
        assert_eq!(files.num_files(), 1);
    }

    #[test]
    fn test_file_name_collision() {
        let fx = Fixture::new();
        let (_containers, files) = fx.boot();
        touch(&files, ROOT_CONTAINER_ID, "f");

        let mut dup = files.create_file().unwrap();
        dup.container_id = ROOT_CONTAINER_ID;
        dup.name = "f".into();
        assert!(matches!(files.update_store(&dup), Err(Error::AlreadyExists(_))));

        dup.container_id = 999;
        assert!(files.update_store(&dup).unwrap_err().is_not_found());
    }

    #[test]
    fn test_move_and_detach() {
        let fx = Fixture::new();
        let (containers, files) = fx.boot();
        let mut dir = containers.create_container().unwrap();
        dir.parent_id = ROOT_CONTAINER_ID;
        dir.name = "d".into();
        containers.update_store(&dir).unwrap();

        let id = touch(&files, ROOT_CONTAINER_ID, "f");
        let mut md = (*files.get_file(id).unwrap()).clone();
        md.container_id = dir.id;
        md.name = "g".into();
        files.update_store(&md).unwrap();

        assert!(containers.get_container(ROOT_CONTAINER_ID).unwrap().find_file("f").is_none());
        assert_eq!(containers.get_container(dir.id).unwrap().find_file("g"), Some(id));

        md.container_id = 0;
        files.update_store(&md).unwrap();
        assert!(containers.get_container(dir.id).unwrap().is_empty());
        assert!(!files.get_file(id).unwrap().is_attached());
    }

    #[test]
    fn test_restart_reattaches_files() {
        let fx = Fixture::new();
        let id = {
            let (_containers, files) = fx.boot();
            let id = touch(&files, ROOT_CONTAINER_ID, "keep");
            let gone = touch(&files, ROOT_CONTAINER_ID, "gone");
            files.remove_file(gone).unwrap();
            id
        };

        let (containers, files) = fx.boot();
        let root = containers.get_container(ROOT_CONTAINER_ID).unwrap();
        assert_eq!(root.find_file("keep"), Some(id));
        assert!(root.find_file("gone").is_none());
        assert_eq!(files.num_files(), 1);
        assert_eq!(files.first_free_id(), id + 2);
    }

    #[test]
    fn test_orphan_file_goes_to_lost_found() {
        let fx = Fixture::new();
        drop(fx.boot());
        {
            let log = ChangeLogFile::open(
                &fx.files_path,
                crate::changelog::OpenFlags::APPEND,
                ContentKind::File,
            )
            .unwrap();
            let mut md = FileMd::new(1, StoreToken::next());
            md.container_id = 55;
            md.name = "lost".into();
            let mut buf = Buffer::new();
            md.serialize(&mut buf).unwrap();
            log.store_record(RecordKind::Update, &buf).unwrap();
        }

        let (containers, files) = fx.boot();
        let md = files.get_file(1).unwrap();
        assert_eq!(md.name, "lost.1");
        let dir = containers.get_container(md.container_id).unwrap();
        assert_eq!(dir.name, "55");
        assert_eq!(dir.find_file("lost.1"), Some(1));
    }

    #[test]
    fn test_location_events() {
        let fx = Fixture::new();
        let (_containers, files) = fx.boot();
        let recorder = Arc::new(Recorder::default());
        files.add_change_listener(recorder.clone());

        let mut md = files.create_file().unwrap();
        md.container_id = ROOT_CONTAINER_ID;
        md.name = "f".into();
        md.size = 100;
        md.add_location(5);
        files.update_store(&md).unwrap();

        md.unlink_location(5);
        files.update_store(&md).unwrap();
        md.remove_location(5);
        files.update_store(&md).unwrap();
        files.remove_file(md.id).unwrap();

        assert_eq!(
            *recorder.0.lock(),
            vec![
                FileChange::Created,
                FileChange::SizeChange { delta: 100 },
                FileChange::LocationAdded(5),
                FileChange::Updated,
                FileChange::LocationUnlinked(5),
                FileChange::Updated,
                FileChange::LocationRemoved(5),
                FileChange::Deleted,
            ]
        );
    }

    #[test]
    fn test_requires_container_service() {
        let fx = Fixture::new();
        let files = FileMdSvc::new();
        files.configure(StoreConfig::new(&fx.files_path)).unwrap();
        assert!(matches!(files.initialize(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_slave_is_read_only() {
        let fx = Fixture::new();
        drop(fx.boot());

        let containers = Arc::new(ContainerMdSvc::new());
        containers
            .configure(StoreConfig::slave(&fx.containers_path))
            .unwrap();
        containers.initialize().unwrap();
        let files = Arc::new(FileMdSvc::new());
        files.configure(StoreConfig::slave(&fx.files_path)).unwrap();
        files.set_container_service(containers.clone());
        files.initialize().unwrap();

        assert!(matches!(files.create_file(), Err(Error::InvalidState(_))));
        assert!(matches!(containers.create_container(), Err(Error::InvalidState(_))));
    }
}
