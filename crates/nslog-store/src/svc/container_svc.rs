//! Container metadata service

use super::follower::Follow;
use super::log_store::{Entry, LogStore, StoreState};
use super::{
    container_changes, ensure_container_path, validate_name, CompactingData, ContainerChange,
    ContainerEvent, ContainerMdChangeListener, ContainerMdService, NamespaceLock, Recovery,
    ServicePhase,
};
use crate::md::{ContainerMd, MdRecord};
use nslog_common::{ContainerId, Error, FileId, Result, StoreConfig, Timespec, ROOT_CONTAINER_ID};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Work a slave could not finish in the cycle that read it
#[derive(Default)]
struct SlavePending {
    /// Deleted containers that still had children
    deletes: BTreeSet<ContainerId>,
    /// Containers whose parent is not known yet
    attach: BTreeSet<ContainerId>,
}

/// Changelog-backed container store
pub struct ContainerMdSvc {
    store: LogStore<ContainerMd>,
    listeners: RwLock<Vec<Arc<dyn ContainerMdChangeListener>>>,
    pending: Mutex<SlavePending>,
}

impl Default for ContainerMdSvc {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerMdSvc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: LogStore::new(),
            listeners: RwLock::new(Vec::new()),
            pending: Mutex::new(SlavePending::default()),
        }
    }

    fn fire(&self, events: Vec<ContainerEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for event in &events {
            for listener in &listeners {
                listener.container_md_changed(event);
            }
        }
    }

    /// Move a container recovered at boot below lost+found
    fn place_in_lost_found(&self, id: ContainerId, recovery: Recovery) -> Result<()> {
        let dir = ensure_container_path(self, &recovery.path())?;
        let mut md = (*self.get_container(id)?).clone();
        warn!(
            "placing container {} ({:?}) in lost+found: {:?}",
            id, md.name, recovery
        );
        md.name = format!("{}.{}", md.name, md.id);
        md.parent_id = dir;
        self.update_store(&md)
    }

    /// Apply deletions whose containers have become empty
    fn apply_pending_deletes(
        state: &mut StoreState<ContainerMd>,
        pending: &mut SlavePending,
        events: &mut Vec<ContainerEvent>,
    ) {
        loop {
            let mut progress = false;
            for id in pending.deletes.clone() {
                let removable = match state.entries.get(&id) {
                    None => {
                        pending.deletes.remove(&id);
                        continue;
                    }
                    Some(entry) => entry.md.is_empty(),
                };
                if !removable {
                    continue;
                }
                if let Some(entry) = state.entries.remove(&id) {
                    detach_container(state, entry.md.parent_id, &entry.md.name, id);
                    events.push(ContainerEvent {
                        container: entry.md,
                        previous: None,
                        change: ContainerChange::Deleted,
                    });
                }
                pending.deletes.remove(&id);
                progress = true;
            }
            if !progress {
                break;
            }
        }
    }

    fn apply_updates(&self) -> Result<()> {
        let mut staged = self.store.fetch_updates()?;
        let lock = self
            .store
            .namespace_lock()
            .ok_or_else(|| Error::invalid_state("slave follows without a namespace lock"))?;
        let _namespace = lock.write();

        let mut events = Vec::new();
        {
            let mut state = self.store.state.write();
            let mut pending = self.pending.lock();

            pending.deletes.extend(staged.deleted.iter().copied());
            Self::apply_pending_deletes(&mut state, &mut pending, &mut events);

            let mut moved = Vec::new();
            for (id, (offset, mut md)) in std::mem::take(&mut staged.updated) {
                let previous = state.entries.get(&id).map(|e| e.md.clone());
                if let Some(previous) = &previous {
                    md.adopt_navigation(previous);
                }
                let md = Arc::new(md);
                let relink = previous
                    .as_ref()
                    .is_none_or(|p| p.parent_id != md.parent_id || p.name != md.name);
                state.entries.insert(
                    id,
                    Entry {
                        md: md.clone(),
                        offset: Some(offset),
                    },
                );

                for change in container_changes(previous.as_deref(), &md, previous.is_none()) {
                    events.push(ContainerEvent {
                        container: md.clone(),
                        previous: previous.clone(),
                        change,
                    });
                }
                if relink {
                    moved.push((id, previous));
                }
            }

            for (id, previous) in &moved {
                if let Some(previous) = previous {
                    detach_container(&mut state, previous.parent_id, &previous.name, *id);
                }
            }
            pending.attach.extend(moved.iter().map(|(id, _)| *id));

            for id in pending.attach.clone() {
                let Some(entry) = state.entries.get(&id) else {
                    pending.attach.remove(&id);
                    continue;
                };
                if id == ROOT_CONTAINER_ID {
                    pending.attach.remove(&id);
                    continue;
                }
                let (parent, name) = (entry.md.parent_id, entry.md.name.clone());
                if !state.entries.contains_key(&parent) {
                    continue;
                }
                if !attach_container(&mut state, parent, &name, id) {
                    warn!(
                        "slave cannot attach container {} as {:?} in {}: name taken",
                        id, name, parent
                    );
                }
                pending.attach.remove(&id);
            }

            // deletions unblocked by the moves above
            Self::apply_pending_deletes(&mut state, &mut pending, &mut events);
            LogStore::advance_cursor(&mut state, &mut staged);
        }

        if !events.is_empty() {
            debug!("container follower applied {} changes", events.len());
        }
        self.fire(events);
        Ok(())
    }

    /// Wire up a freshly loaded store and mark it Initialized
    ///
    /// Lost+found placement goes through the regular mutations, so the
    /// phase is set first and `initialize` rolls it back on failure.
    fn boot(&self) -> Result<()> {
        let slave = self.store.is_slave();

        let recoveries = {
            let mut state = self.store.state.write();
            state.phase = ServicePhase::Initialized;

            if !slave && !state.entries.contains_key(&ROOT_CONTAINER_ID) {
                let mut root = ContainerMd::new(ROOT_CONTAINER_ID, self.store.token);
                root.parent_id = ROOT_CONTAINER_ID;
                let offset = state.append_update(&root)?;
                state.entries.insert(
                    ROOT_CONTAINER_ID,
                    Entry {
                        md: Arc::new(root),
                        offset: Some(offset),
                    },
                );
                state.next_id = state.next_id.max(ROOT_CONTAINER_ID + 1);
                info!("created root container");
            }

            wire_tree(&mut state)
        };

        if slave {
            let mut pending = self.pending.lock();
            for (id, recovery) in recoveries {
                match recovery {
                    Recovery::Orphan(_) => {
                        pending.attach.insert(id);
                    }
                    Recovery::NameConflict(parent) => {
                        warn!("slave leaves container {} unattached: name taken in {}", id, parent);
                    }
                }
            }
        } else {
            for (id, recovery) in recoveries {
                self.place_in_lost_found(id, recovery)?;
            }
        }

        info!(
            "container service initialized ({} containers, {})",
            self.num_containers(),
            if slave { "slave" } else { "master" }
        );
        Ok(())
    }
}

fn detach_container(
    state: &mut StoreState<ContainerMd>,
    parent: ContainerId,
    name: &str,
    id: ContainerId,
) {
    if parent == id {
        return;
    }
    if let Some(entry) = state.entries.get_mut(&parent) {
        if entry.md.find_container(name) == Some(id) {
            Arc::make_mut(&mut entry.md).remove_container(name);
        }
    }
}

/// Link `id` into its parent's child map; false when the name is taken
fn attach_container(
    state: &mut StoreState<ContainerMd>,
    parent: ContainerId,
    name: &str,
    id: ContainerId,
) -> bool {
    let Some(entry) = state.entries.get_mut(&parent) else {
        return false;
    };
    match entry.md.find_container(name) {
        Some(existing) => existing == id,
        None => Arc::make_mut(&mut entry.md).add_container(name, id),
    }
}

/// Whether placing `id` below `parent` would make it its own ancestor
fn creates_cycle(state: &StoreState<ContainerMd>, parent: ContainerId, id: ContainerId) -> bool {
    let mut current = parent;
    for _ in 0..=state.entries.len() {
        if current == id {
            return true;
        }
        if current == ROOT_CONTAINER_ID {
            return false;
        }
        match state.entries.get(&current) {
            Some(entry) => current = entry.md.parent_id,
            None => return false,
        }
    }
    true
}

/// Link every loaded container to its parent, breadth first from the root
///
/// Returns the containers that need to be moved to lost+found: those whose
/// name is already taken in their parent and the topmost container of every
/// subtree that cannot be reached from the root.
fn wire_tree(state: &mut StoreState<ContainerMd>) -> Vec<(ContainerId, Recovery)> {
    let mut children: HashMap<ContainerId, Vec<ContainerId>> = HashMap::new();
    for (id, entry) in &state.entries {
        if *id != ROOT_CONTAINER_ID {
            children.entry(entry.md.parent_id).or_default().push(*id);
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut reached = HashSet::new();
    let mut recoveries = Vec::new();

    if state.entries.contains_key(&ROOT_CONTAINER_ID) {
        attach_subtree(state, &children, &mut reached, &mut recoveries, ROOT_CONTAINER_ID);
    }

    let mut orphans = Vec::new();
    loop {
        let mut unreached: Vec<ContainerId> = state
            .entries
            .keys()
            .copied()
            .filter(|id| !reached.contains(id))
            .collect();
        if unreached.is_empty() {
            break;
        }
        unreached.sort_unstable();

        // topmost first; a cycle has no topmost member, take its lowest id
        let pick = unreached
            .iter()
            .copied()
            .find(|id| {
                state
                    .entries
                    .get(id)
                    .is_some_and(|e| !state.entries.contains_key(&e.md.parent_id))
            })
            .unwrap_or(unreached[0]);
        let parent = state
            .entries
            .get(&pick)
            .map_or(0, |entry| entry.md.parent_id);
        orphans.push((pick, Recovery::Orphan(parent)));
        attach_subtree(state, &children, &mut reached, &mut recoveries, pick);
    }

    recoveries.extend(orphans);
    recoveries
}

fn attach_subtree(
    state: &mut StoreState<ContainerMd>,
    children: &HashMap<ContainerId, Vec<ContainerId>>,
    reached: &mut HashSet<ContainerId>,
    recoveries: &mut Vec<(ContainerId, Recovery)>,
    start: ContainerId,
) {
    let mut queue = VecDeque::from([start]);
    reached.insert(start);
    while let Some(parent) = queue.pop_front() {
        let Some(kids) = children.get(&parent) else {
            continue;
        };
        for &child in kids {
            if !reached.insert(child) {
                continue;
            }
            let name = match state.entries.get(&child) {
                Some(entry) => entry.md.name.clone(),
                None => continue,
            };
            if !attach_container(state, parent, &name, child) {
                recoveries.push((child, Recovery::NameConflict(parent)));
            }
            queue.push_back(child);
        }
    }
}

impl Follow for ContainerMdSvc {
    fn follow_cycle(&self) -> Result<()> {
        self.apply_updates()
    }
}

impl ContainerMdService for ContainerMdSvc {
    fn configure(&self, config: StoreConfig) -> Result<()> {
        self.store.configure(config)
    }

    fn initialize(&self) -> Result<()> {
        self.store.load()?;
        self.boot().inspect_err(|_| {
            self.store.abort_boot();
            *self.pending.lock() = SlavePending::default();
        })
    }

    fn finalize(&self) -> Result<()> {
        self.store.finalize();
        *self.pending.lock() = SlavePending::default();
        Ok(())
    }

    fn start_slave(self: Arc<Self>, lock: NamespaceLock) -> Result<()> {
        self.store.start_following("containers", &self, lock)
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

    fn get_container(&self, id: ContainerId) -> Result<Arc<ContainerMd>> {
        let state = self.store.state.read();
        state.ensure_initialized()?;
        Ok(state.entry(id)?.md.clone())
    }

    fn create_container(&self) -> Result<ContainerMd> {
        let mut state = self.store.state.write();
        state.ensure_writable()?;
        let id = state.allocate_id();
        let md = ContainerMd::new(id, self.store.token);
        state.entries.insert(
            id,
            Entry {
                md: Arc::new(md.clone()),
                offset: None,
            },
        );
        Ok(md)
    }

    fn update_store(&self, md: &ContainerMd) -> Result<()> {
        let events = {
            let mut state = self.store.state.write();
            state.ensure_writable()?;
            if md.owner() != Some(self.store.token) {
                return Err(Error::invalid_state(format!(
                    "container {} does not belong to this store",
                    md.id
                )));
            }

            let entry = state.entry(md.id)?;
            let previous = entry.md.clone();
            let created = entry.offset.is_none();

            let mut current = md.clone();
            current.adopt_navigation(&previous);
            let moved = if current.is_root() {
                current.parent_id = ROOT_CONTAINER_ID;
                false
            } else {
                created
                    || previous.parent_id != current.parent_id
                    || previous.name != current.name
            };

            if moved {
                validate_name(&current.name)?;
                let parent = state.entry(current.parent_id)?;
                if parent.md.find_container(&current.name).is_some_and(|c| c != current.id) {
                    return Err(Error::already_exists(format!(
                        "{:?} in container {}",
                        current.name, current.parent_id
                    )));
                }
                if creates_cycle(&state, current.parent_id, current.id) {
                    return Err(Error::invalid_state(format!(
                        "container {} cannot move below its own subtree",
                        current.id
                    )));
                }
            }

            let offset = state.append_update(&current)?;

            if moved {
                if !created {
                    detach_container(&mut state, previous.parent_id, &previous.name, current.id);
                }
                attach_container(&mut state, current.parent_id, &current.name, current.id);
            }

            debug!(
                "stored container {} ({:?}) at offset {}",
                current.id, current.name, offset
            );

            let current = Arc::new(current);
            state.entries.insert(
                current.id,
                Entry {
                    md: current.clone(),
                    offset: Some(offset),
                },
            );

            let previous = (!created).then_some(previous);
            container_changes(previous.as_deref(), &current, created)
                .into_iter()
                .map(|change| ContainerEvent {
                    container: current.clone(),
                    previous: previous.clone(),
                    change,
                })
                .collect::<Vec<_>>()
        };

        self.fire(events);
        Ok(())
    }

    fn remove_container(&self, id: ContainerId) -> Result<()> {
        let event = {
            let mut state = self.store.state.write();
            state.ensure_writable()?;
            if id == ROOT_CONTAINER_ID {
                return Err(Error::PermissionDenied("cannot remove the root container".into()));
            }
            let entry = state.entry(id)?;
            if !entry.md.is_empty() {
                return Err(Error::NotEmpty(format!("container {id}")));
            }
            let md = entry.md.clone();
            let persisted = entry.offset.is_some();

            if persisted {
                state.append_delete(id)?;
            }
            state.entries.remove(&id);
            if persisted {
                detach_container(&mut state, md.parent_id, &md.name, id);
            }
            debug!("removed container {} ({:?})", id, md.name);

            persisted.then(|| ContainerEvent {
                container: md,
                previous: None,
                change: ContainerChange::Deleted,
            })
        };

        self.fire(event.into_iter().collect());
        Ok(())
    }

    fn attach_file(&self, container: ContainerId, name: &str, file: FileId) -> Result<()> {
        let mut state = self.store.state.write();
        state.ensure_initialized()?;
        let entry = state
            .entries
            .get_mut(&container)
            .ok_or_else(|| Error::not_found(format!("container #{container}")))?;
        match entry.md.find_file(name) {
            Some(existing) if existing == file => Ok(()),
            Some(_) => Err(Error::already_exists(format!(
                "file {name:?} in container {container}"
            ))),
            None => {
                Arc::make_mut(&mut entry.md).add_file(name, file);
                Ok(())
            }
        }
    }

    fn detach_file(&self, container: ContainerId, name: &str, file: FileId) {
        let mut state = self.store.state.write();
        if let Some(entry) = state.entries.get_mut(&container) {
            if entry.md.find_file(name) == Some(file) {
                Arc::make_mut(&mut entry.md).remove_file(name);
            }
        }
    }

    fn adjust_tree_size(&self, id: ContainerId, delta: i64) -> Result<()> {
        let mut state = self.store.state.write();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("container #{id}")))?;
        let md = Arc::make_mut(&mut entry.md);
        md.tree_size = md.tree_size.saturating_add_signed(delta);
        Ok(())
    }

    fn advance_tmtime(&self, id: ContainerId, time: Timespec) -> Result<bool> {
        let mut state = self.store.state.write();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("container #{id}")))?;
        if time <= entry.md.tmtime {
            return Ok(false);
        }
        Ok(Arc::make_mut(&mut entry.md).set_tmtime(time))
    }

    fn add_change_listener(&self, listener: Arc<dyn ContainerMdChangeListener>) {
        self.listeners.write().push(listener);
    }

    fn visit(&self, visitor: &mut dyn FnMut(&ContainerMd)) {
        let mut snapshot: Vec<Arc<ContainerMd>> =
            self.store.state.read().persisted().cloned().collect();
        snapshot.sort_unstable_by_key(|md| md.id);
        for md in &snapshot {
            visitor(md);
        }
    }

    fn num_containers(&self) -> u64 {
        self.store.state.read().persisted().count() as u64
    }

    fn first_free_id(&self) -> u64 {
        self.store.state.read().next_id
    }

    fn compact_prepare(&self, new_path: &Path) -> Result<CompactingData> {
        self.store.compact_prepare(new_path)
    }

    fn compact(&self, data: &mut CompactingData) -> Result<()> {
        LogStore::<ContainerMd>::compact(data)
    }

    fn compact_commit(&self, data: CompactingData, autorepair: bool) -> Result<()> {
        let stats = self.store.compact_commit(data, autorepair)?;
        info!(
            "container log compacted: {} records scanned, {} kept in {:?}",
            stats.records_total, stats.records_kept, stats.elapsed
        );
        Ok(())
    }
}
