//! Index of files by replica location

use crate::md::FileMd;
use crate::svc::{FileChange, FileEvent, FileMdChangeListener, FileMdService};
use nslog_common::{FileId, LocationId};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use tracing::debug;

#[derive(Debug, Default)]
struct LocationIndex {
    /// Files with an active replica, indexed by location id
    resident: Vec<BTreeSet<FileId>>,
    /// Files with a replica waiting for deletion, indexed by location id
    unlinked: Vec<BTreeSet<FileId>>,
    /// Attached files without any active replica
    no_replicas: BTreeSet<FileId>,
}

fn slot(sets: &mut Vec<BTreeSet<FileId>>, location: LocationId) -> &mut BTreeSet<FileId> {
    let index = location as usize;
    if sets.len() <= index {
        sets.resize_with(index + 1, BTreeSet::new);
    }
    &mut sets[index]
}

impl LocationIndex {
    fn drop_from(sets: &mut [BTreeSet<FileId>], location: LocationId, id: FileId) {
        if let Some(set) = sets.get_mut(location as usize) {
            set.remove(&id);
        }
    }

    fn track_replicas(&mut self, file: &FileMd) {
        if file.is_attached() && file.num_locations() == 0 {
            self.no_replicas.insert(file.id);
        } else {
            self.no_replicas.remove(&file.id);
        }
    }

    fn forget(&mut self, file: &FileMd) {
        for location in file.locations() {
            Self::drop_from(&mut self.resident, *location, file.id);
        }
        for location in file.unlinked_locations() {
            Self::drop_from(&mut self.unlinked, *location, file.id);
        }
        self.no_replicas.remove(&file.id);
    }

    fn insert(&mut self, file: &FileMd) {
        for location in file.locations() {
            slot(&mut self.resident, *location).insert(file.id);
        }
        for location in file.unlinked_locations() {
            slot(&mut self.unlinked, *location).insert(file.id);
        }
        self.track_replicas(file);
    }
}

/// Per-location sets of resident and pending-deletion files
#[derive(Debug, Default)]
pub struct FileSystemView {
    index: RwLock<LocationIndex>,
}

impl FileSystemView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Files with an active replica on `location`
    pub fn file_list(&self, location: LocationId) -> BTreeSet<FileId> {
        self.index
            .read()
            .resident
            .get(location as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Files with a replica on `location` waiting to be deleted
    pub fn unlinked_file_list(&self, location: LocationId) -> BTreeSet<FileId> {
        self.index
            .read()
            .unlinked
            .get(location as usize)
            .cloned()
            .unwrap_or_default()
    }

    pub fn no_replica_files(&self) -> BTreeSet<FileId> {
        self.index.read().no_replicas.clone()
    }

    /// Size of the location table (highest seen location id plus one)
    pub fn num_locations(&self) -> usize {
        let index = self.index.read();
        index.resident.len().max(index.unlinked.len())
    }

    /// Rebuild the index from every file of `files`
    pub fn rebuild(&self, files: &dyn FileMdService) {
        let mut index = LocationIndex::default();
        let mut count = 0u64;
        files.visit(&mut |md| {
            index.insert(md);
            count += 1;
        });
        *self.index.write() = index;
        debug!("file system view rebuilt from {} files", count);
    }
}

impl FileMdChangeListener for FileSystemView {
    fn file_md_changed(&self, event: &FileEvent) {
        let file = &event.file;
        let mut index = self.index.write();
        match event.change {
            FileChange::Deleted => {
                index.forget(file);
                return;
            }
            FileChange::LocationAdded(location) => {
                slot(&mut index.resident, location).insert(file.id);
            }
            FileChange::LocationReplaced { from, to } => {
                LocationIndex::drop_from(&mut index.resident, from, file.id);
                slot(&mut index.resident, to).insert(file.id);
            }
            FileChange::LocationUnlinked(location) => {
                LocationIndex::drop_from(&mut index.resident, location, file.id);
                slot(&mut index.unlinked, location).insert(file.id);
            }
            FileChange::LocationRemoved(location) => {
                LocationIndex::drop_from(&mut index.resident, location, file.id);
                LocationIndex::drop_from(&mut index.unlinked, location, file.id);
            }
            FileChange::Created | FileChange::Updated | FileChange::SizeChange { .. } => {}
        }
        index.track_replicas(file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::StoreToken;
    use crate::svc::file_changes;
    use std::sync::Arc;

    fn feed(view: &FileSystemView, previous: Option<&FileMd>, current: &FileMd, created: bool) {
        let file = Arc::new(current.clone());
        let previous = previous.map(|p| Arc::new(p.clone()));
        for change in file_changes(previous.as_deref(), current, created) {
            view.file_md_changed(&FileEvent {
                file: file.clone(),
                previous: previous.clone(),
                change,
            });
        }
    }

    #[test]
    fn test_location_lifecycle() {
        let view = FileSystemView::new();
        let mut md = FileMd::new(3, StoreToken::next());
        md.container_id = 1;
        feed(&view, None, &md, true);
        assert!(view.no_replica_files().contains(&3));

        let prev = md.clone();
        md.add_location(7);
        feed(&view, Some(&prev), &md, false);
        assert!(view.file_list(7).contains(&3));
        assert!(view.no_replica_files().is_empty());
        assert_eq!(view.num_locations(), 8);

        let prev = md.clone();
        md.replace_location(0, 2).unwrap();
        feed(&view, Some(&prev), &md, false);
        assert!(view.file_list(7).is_empty());
        assert!(view.file_list(2).contains(&3));

        let prev = md.clone();
        md.unlink_location(2);
        feed(&view, Some(&prev), &md, false);
        assert!(view.file_list(2).is_empty());
        assert!(view.unlinked_file_list(2).contains(&3));
        assert!(view.no_replica_files().contains(&3));

        let prev = md.clone();
        md.remove_location(2);
        feed(&view, Some(&prev), &md, false);
        assert!(view.unlinked_file_list(2).is_empty());
    }

    #[test]
    fn test_deleted_file_is_forgotten() {
        let view = FileSystemView::new();
        let mut md = FileMd::new(9, StoreToken::next());
        md.container_id = 1;
        md.add_location(1);
        md.add_location(4);
        feed(&view, None, &md, true);
        let prev = md.clone();
        md.unlink_location(4);
        feed(&view, Some(&prev), &md, false);
        assert!(view.file_list(1).contains(&9));
        assert!(view.unlinked_file_list(4).contains(&9));

        view.file_md_changed(&FileEvent {
            file: Arc::new(md),
            previous: None,
            change: FileChange::Deleted,
        });
        assert!(view.file_list(1).is_empty());
        assert!(view.unlinked_file_list(4).is_empty());
        assert!(view.no_replica_files().is_empty());
    }

    #[test]
    fn test_unknown_location_is_empty() {
        let view = FileSystemView::new();
        assert!(view.file_list(1000).is_empty());
        assert_eq!(view.num_locations(), 0);
    }
}
