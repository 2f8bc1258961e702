//! Container (directory) metadata

use super::{grab_xattrs, put_xattrs, MdRecord, StoreToken};
use crate::buffer::Buffer;
use crate::changelog::ContentKind;
use nslog_common::{
    ContainerId, Error, FileId, Result, Timespec, MTIME_PROPAGATION_ATTR, QUOTA_NODE_FLAG,
    ROOT_CONTAINER_ID,
};
use std::collections::BTreeMap;

/// Container metadata
///
/// The child maps hold ids only and are never persisted; the container
/// service rebuilds them at boot and keeps them in sync afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerMd {
    /// Container id
    pub id: ContainerId,
    /// Parent container id (the root is its own parent)
    pub parent_id: ContainerId,
    /// Flag bits (see [`QUOTA_NODE_FLAG`])
    pub flags: u16,
    /// Creation time
    pub ctime: Timespec,
    /// Modification time
    pub mtime: Timespec,
    /// Sync time, propagated up the tree
    pub tmtime: Timespec,
    /// Name within the parent
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub acl_id: u32,
    /// Extended attributes
    pub xattrs: BTreeMap<String, String>,
    /// Bytes held by the subtree (in memory only)
    pub tree_size: u64,
    containers: BTreeMap<String, ContainerId>,
    files: BTreeMap<String, FileId>,
    owner: Option<StoreToken>,
}

impl ContainerMd {
    /// Create an empty container owned by `owner`
    #[must_use]
    pub fn new(id: ContainerId, owner: StoreToken) -> Self {
        let now = Timespec::now();
        Self {
            id,
            parent_id: 0,
            flags: 0,
            ctime: now,
            mtime: now,
            tmtime: now,
            name: String::new(),
            uid: 0,
            gid: 0,
            mode: 0o755,
            acl_id: 0,
            xattrs: BTreeMap::new(),
            tree_size: 0,
            containers: BTreeMap::new(),
            files: BTreeMap::new(),
            owner: Some(owner),
        }
    }

    /// Copy that can be inspected but never persisted
    #[must_use]
    pub fn read_only_copy(&self) -> Self {
        let mut copy = self.clone();
        copy.owner = None;
        copy
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.id == ROOT_CONTAINER_ID
    }

    #[must_use]
    pub fn is_quota_node(&self) -> bool {
        self.flags & QUOTA_NODE_FLAG != 0
    }

    pub fn set_quota_node(&mut self, enabled: bool) {
        if enabled {
            self.flags |= QUOTA_NODE_FLAG;
        } else {
            self.flags &= !QUOTA_NODE_FLAG;
        }
    }

    /// Whether sync-time propagation is enabled here
    #[must_use]
    pub fn propagates_sync_time(&self) -> bool {
        self.xattrs.contains_key(MTIME_PROPAGATION_ATTR)
    }

    /// Advance the sync time; returns false when `time` is not newer
    pub fn set_tmtime(&mut self, time: Timespec) -> bool {
        if time > self.tmtime {
            self.tmtime = time;
            true
        } else {
            false
        }
    }

    pub fn set_xattr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.xattrs.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get_xattr(&self, key: &str) -> Option<&str> {
        self.xattrs.get(key).map(String::as_str)
    }

    pub fn remove_xattr(&mut self, key: &str) -> Option<String> {
        self.xattrs.remove(key)
    }

    /// Look up a child container by name
    #[must_use]
    pub fn find_container(&self, name: &str) -> Option<ContainerId> {
        self.containers.get(name).copied()
    }

    /// Look up a child file by name
    #[must_use]
    pub fn find_file(&self, name: &str) -> Option<FileId> {
        self.files.get(name).copied()
    }

    /// Register a child container; false if the name is taken
    pub fn add_container(&mut self, name: &str, id: ContainerId) -> bool {
        if self.containers.contains_key(name) {
            return false;
        }
        self.containers.insert(name.to_string(), id);
        true
    }

    /// Drop a child container entry
    pub fn remove_container(&mut self, name: &str) -> Option<ContainerId> {
        self.containers.remove(name)
    }

    /// Register a child file; false if the name is taken
    pub fn add_file(&mut self, name: &str, id: FileId) -> bool {
        if self.files.contains_key(name) {
            return false;
        }
        self.files.insert(name.to_string(), id);
        true
    }

    /// Drop a child file entry
    pub fn remove_file(&mut self, name: &str) -> Option<FileId> {
        self.files.remove(name)
    }

    /// Child containers in name order
    pub fn containers(&self) -> impl Iterator<Item = (&str, ContainerId)> {
        self.containers.iter().map(|(name, id)| (name.as_str(), *id))
    }

    /// Child files in name order
    pub fn files(&self) -> impl Iterator<Item = (&str, FileId)> {
        self.files.iter().map(|(name, id)| (name.as_str(), *id))
    }

    #[must_use]
    pub fn num_containers(&self) -> usize {
        self.containers.len()
    }

    #[must_use]
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.files.is_empty()
    }

    /// Drop both child maps
    pub fn clear_children(&mut self) {
        self.containers.clear();
        self.files.clear();
    }
}

impl MdRecord for ContainerMd {
    const CONTENT: ContentKind = ContentKind::Container;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> u64 {
        self.parent_id
    }

    fn owner(&self) -> Option<StoreToken> {
        self.owner
    }

    fn serialize(&self, buffer: &mut Buffer) -> Result<()> {
        if self.owner.is_none() {
            return Err(Error::invalid_state(format!(
                "container {} is a read-only copy",
                self.id
            )));
        }

        buffer.put_u64(self.id);
        buffer.put_u64(self.parent_id);
        buffer.put_u16(self.flags);
        buffer.put_u64(self.ctime.sec);
        buffer.put_u64(self.ctime.nsec);
        buffer.put_u32(self.uid);
        buffer.put_u32(self.gid);
        buffer.put_u32(self.mode);
        buffer.put_u32(self.acl_id);
        buffer.put_string(&self.name)?;
        put_xattrs(buffer, &self.xattrs)?;

        // trailer
        buffer.put_u64(self.mtime.sec);
        buffer.put_u64(self.mtime.nsec);
        buffer.put_u64(self.tmtime.sec);
        buffer.put_u64(self.tmtime.nsec);
        Ok(())
    }

    fn deserialize(buffer: &Buffer, owner: StoreToken) -> Result<Self> {
        let mut reader = buffer.reader();

        let id = reader.u64()?;
        let parent_id = reader.u64()?;
        let flags = reader.u16()?;
        let ctime = Timespec::new(reader.u64()?, reader.u64()?);
        let uid = reader.u32()?;
        let gid = reader.u32()?;
        let mode = reader.u32()?;
        let acl_id = reader.u32()?;
        let name = reader.string()?;
        let xattrs = grab_xattrs(&mut reader)?;

        // Records written before the trailer existed end here
        let (mtime, tmtime) = if reader.remaining() == 0 {
            (ctime, ctime)
        } else {
            let mtime = Timespec::new(reader.u64()?, reader.u64()?);
            let tmtime = Timespec::new(reader.u64()?, reader.u64()?);
            (mtime, tmtime)
        };

        Ok(Self {
            id,
            parent_id,
            flags,
            ctime,
            mtime,
            tmtime,
            name,
            uid,
            gid,
            mode,
            acl_id,
            xattrs,
            tree_size: 0,
            containers: BTreeMap::new(),
            files: BTreeMap::new(),
            owner: Some(owner),
        })
    }

    fn adopt_navigation(&mut self, previous: &Self) {
        self.containers.clone_from(&previous.containers);
        self.files.clone_from(&previous.files);
        self.tree_size = previous.tree_size;
        self.tmtime = self.tmtime.max(previous.tmtime);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(owner: StoreToken) -> ContainerMd {
        let mut md = ContainerMd::new(42, owner);
        md.parent_id = 7;
        md.name = "photos".to_string();
        md.uid = 1000;
        md.gid = 100;
        md.mode = 0o750;
        md.acl_id = 3;
        md.ctime = Timespec::new(1_700_000_000, 12);
        md.mtime = Timespec::new(1_700_000_100, 34);
        md.tmtime = Timespec::new(1_700_000_200, 56);
        md.set_quota_node(true);
        md.set_xattr("user.tag", "blue");
        md.set_xattr(MTIME_PROPAGATION_ATTR, "1");
        md
    }

    #[test]
    fn test_container_codec_roundtrip() {
        let owner = StoreToken::next();
        let md = sample(owner);

        let mut buf = Buffer::new();
        md.serialize(&mut buf).unwrap();
        assert_eq!(buf.grab_u64(0).unwrap(), 42);

        let decoded = ContainerMd::deserialize(&buf, owner).unwrap();
        assert_eq!(decoded, md);
        assert!(decoded.is_quota_node());
        assert!(decoded.propagates_sync_time());
    }

    #[test]
    fn test_container_without_trailer() {
        let owner = StoreToken::next();
        let md = sample(owner);
        let mut buf = Buffer::new();
        md.serialize(&mut buf).unwrap();

        // strip mtime and tmtime
        let short = Buffer::from_slice(&buf.as_slice()[..buf.len() - 32]);
        let decoded = ContainerMd::deserialize(&short, owner).unwrap();
        assert_eq!(decoded.mtime, md.ctime);
        assert_eq!(decoded.tmtime, md.ctime);
        assert_eq!(decoded.name, md.name);

        // a partial trailer is a short read
        let partial = Buffer::from_slice(&buf.as_slice()[..buf.len() - 8]);
        assert!(matches!(
            ContainerMd::deserialize(&partial, owner),
            Err(Error::SizeExceeded { .. })
        ));
    }

    #[test]
    fn test_container_truncated_record() {
        let owner = StoreToken::next();
        let mut buf = Buffer::new();
        sample(owner).serialize(&mut buf).unwrap();

        for len in [0, 8, 30, 50] {
            let short = Buffer::from_slice(&buf.as_slice()[..len]);
            assert!(ContainerMd::deserialize(&short, owner).is_err());
        }
    }

    #[test]
    fn test_read_only_copy_refuses_serialize() {
        let md = sample(StoreToken::next()).read_only_copy();
        assert!(md.owner().is_none());
        let mut buf = Buffer::new();
        assert!(matches!(
            md.serialize(&mut buf),
            Err(Error::InvalidState(_))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_children_not_serialized() {
        let owner = StoreToken::next();
        let mut md = sample(owner);
        assert!(md.add_container("a", 100));
        assert!(!md.add_container("a", 101));
        assert!(md.add_file("a", 200));
        assert_eq!(md.find_container("a"), Some(100));
        assert_eq!(md.find_file("a"), Some(200));

        let mut buf = Buffer::new();
        md.serialize(&mut buf).unwrap();
        let mut decoded = ContainerMd::deserialize(&buf, owner).unwrap();
        assert!(decoded.is_empty());

        decoded.adopt_navigation(&md);
        assert_eq!(decoded.num_containers(), 1);
        assert_eq!(decoded.num_files(), 1);

        assert_eq!(md.remove_file("a"), Some(200));
        assert_eq!(md.remove_container("a"), Some(100));
        assert!(md.is_empty());
    }

    #[test]
    fn test_set_tmtime_only_moves_forward() {
        let mut md = sample(StoreToken::next());
        let current = md.tmtime;
        assert!(!md.set_tmtime(Timespec::new(1, 0)));
        assert_eq!(md.tmtime, current);
        assert!(md.set_tmtime(Timespec::new(current.sec + 1, 0)));
    }
}
