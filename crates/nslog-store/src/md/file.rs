//! File metadata

use super::{grab_xattrs, put_xattrs, MdRecord, StoreToken};
use crate::buffer::Buffer;
use crate::changelog::ContentKind;
use nslog_common::{layout, ContainerId, Error, FileId, LocationId, Result, Timespec};
use std::collections::BTreeMap;

/// Largest checksum a file can carry
pub const MAX_CHECKSUM_SIZE: usize = u8::MAX as usize;

/// File metadata
///
/// A location id is either active (a replica exists there), unlinked
/// (the replica awaits deletion) or absent; never both at once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileMd {
    pub id: FileId,
    pub ctime: Timespec,
    pub mtime: Timespec,
    /// Logical size in bytes
    pub size: u64,
    /// Parent container (0 when detached)
    pub container_id: ContainerId,
    pub uid: u32,
    pub gid: u32,
    /// Placement layout (see [`layout`])
    pub layout_id: u32,
    pub flags: u16,
    /// Name within the parent
    pub name: String,
    /// Symbolic link target
    pub link: Option<String>,
    pub xattrs: BTreeMap<String, String>,
    locations: Vec<LocationId>,
    unlinked: Vec<LocationId>,
    checksum: Vec<u8>,
    owner: Option<StoreToken>,
}

impl FileMd {
    /// Create an empty file owned by `owner`
    #[must_use]
    pub fn new(id: FileId, owner: StoreToken) -> Self {
        let now = Timespec::now();
        Self {
            id,
            ctime: now,
            mtime: now,
            size: 0,
            container_id: 0,
            uid: 0,
            gid: 0,
            layout_id: layout::replica(1),
            flags: 0,
            name: String::new(),
            link: None,
            xattrs: BTreeMap::new(),
            locations: Vec::new(),
            unlinked: Vec::new(),
            checksum: Vec::new(),
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

    /// Whether the file is attached to a container
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.container_id != 0
    }

    #[must_use]
    pub fn is_link(&self) -> bool {
        self.link.is_some()
    }

    #[must_use]
    pub fn checksum(&self) -> &[u8] {
        &self.checksum
    }

    pub fn set_checksum(&mut self, checksum: &[u8]) -> Result<()> {
        if checksum.len() > MAX_CHECKSUM_SIZE {
            return Err(Error::SizeExceeded {
                needed: checksum.len(),
                available: MAX_CHECKSUM_SIZE,
            });
        }
        self.checksum = checksum.to_vec();
        Ok(())
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

    /// Active locations in insertion order
    #[must_use]
    pub fn locations(&self) -> &[LocationId] {
        &self.locations
    }

    /// Locations awaiting deletion
    #[must_use]
    pub fn unlinked_locations(&self) -> &[LocationId] {
        &self.unlinked
    }

    #[must_use]
    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    #[must_use]
    pub fn num_unlinked_locations(&self) -> usize {
        self.unlinked.len()
    }

    #[must_use]
    pub fn has_location(&self, location: LocationId) -> bool {
        self.locations.contains(&location)
    }

    #[must_use]
    pub fn has_unlinked_location(&self, location: LocationId) -> bool {
        self.unlinked.contains(&location)
    }

    /// Add an active replica; a pending deletion at the same location is
    /// cancelled
    pub fn add_location(&mut self, location: LocationId) {
        self.unlinked.retain(|l| *l != location);
        if !self.has_location(location) {
            self.locations.push(location);
        }
    }

    /// Replace the active location at `index`, returning the old one
    ///
    /// A location that is already active at another index is rejected.
    pub fn replace_location(&mut self, index: usize, location: LocationId) -> Result<LocationId> {
        if self
            .locations
            .iter()
            .position(|l| *l == location)
            .is_some_and(|at| at != index)
        {
            return Err(Error::already_exists(format!(
                "location {location} of file {}",
                self.id
            )));
        }
        let Some(slot) = self.locations.get_mut(index) else {
            return Err(Error::not_found(format!(
                "location index {index} of file {}",
                self.id
            )));
        };
        let previous = std::mem::replace(slot, location);
        self.unlinked.retain(|l| *l != location);
        Ok(previous)
    }

    /// Move an active location to the unlinked list
    pub fn unlink_location(&mut self, location: LocationId) -> bool {
        let Some(index) = self.locations.iter().position(|l| *l == location) else {
            return false;
        };
        self.locations.remove(index);
        if !self.has_unlinked_location(location) {
            self.unlinked.push(location);
        }
        true
    }

    /// Move every active location to the unlinked list
    pub fn unlink_all_locations(&mut self) {
        for location in std::mem::take(&mut self.locations) {
            if !self.unlinked.contains(&location) {
                self.unlinked.push(location);
            }
        }
    }

    /// Forget an unlinked location (the replica is gone)
    pub fn remove_location(&mut self, location: LocationId) -> bool {
        let before = self.unlinked.len();
        self.unlinked.retain(|l| *l != location);
        self.unlinked.len() != before
    }

    /// Forget every unlinked location
    pub fn remove_all_locations(&mut self) {
        self.unlinked.clear();
    }

    /// Space used including replicas
    #[must_use]
    pub fn physical_size(&self) -> u64 {
        self.size.saturating_mul(layout::stripe_count(self.layout_id))
    }
}

fn put_locations(buffer: &mut Buffer, locations: &[LocationId]) -> Result<()> {
    let count = u16::try_from(locations.len()).map_err(|_| Error::SizeExceeded {
        needed: locations.len(),
        available: usize::from(u16::MAX),
    })?;
    buffer.put_u16(count);
    for location in locations {
        buffer.put_u32(*location);
    }
    Ok(())
}

impl MdRecord for FileMd {
    const CONTENT: ContentKind = ContentKind::File;

    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> u64 {
        self.container_id
    }

    fn owner(&self) -> Option<StoreToken> {
        self.owner
    }

    fn serialize(&self, buffer: &mut Buffer) -> Result<()> {
        if self.owner.is_none() {
            return Err(Error::invalid_state(format!(
                "file {} is a read-only copy",
                self.id
            )));
        }

        buffer.put_u64(self.id);
        buffer.put_u64(self.ctime.sec);
        buffer.put_u64(self.ctime.nsec);
        buffer.put_u64(self.mtime.sec);
        buffer.put_u64(self.mtime.nsec);
        buffer.put_u64(self.size);
        buffer.put_u64(self.container_id);
        buffer.put_u32(self.uid);
        buffer.put_u32(self.gid);
        buffer.put_u32(self.layout_id);
        buffer.put_u16(self.flags);
        buffer.put_string(&self.name)?;
        buffer.put_string(self.link.as_deref().unwrap_or_default())?;
        put_locations(buffer, &self.locations)?;
        put_locations(buffer, &self.unlinked)?;
        // checksum length always fits, see set_checksum
        buffer.put_u8(self.checksum.len() as u8);
        buffer.put_data(&self.checksum);
        put_xattrs(buffer, &self.xattrs)
    }

    fn deserialize(buffer: &Buffer, owner: StoreToken) -> Result<Self> {
        let mut reader = buffer.reader();

        let id = reader.u64()?;
        let ctime = Timespec::new(reader.u64()?, reader.u64()?);
        let mtime = Timespec::new(reader.u64()?, reader.u64()?);
        let size = reader.u64()?;
        let container_id = reader.u64()?;
        let uid = reader.u32()?;
        let gid = reader.u32()?;
        let layout_id = reader.u32()?;
        let flags = reader.u16()?;
        let name = reader.string()?;
        let link = Some(reader.string()?).filter(|l| !l.is_empty());

        let count = reader.u16()?;
        let locations = (0..count)
            .map(|_| reader.u32())
            .collect::<Result<Vec<_>>>()?;
        let count = reader.u16()?;
        let unlinked = (0..count)
            .map(|_| reader.u32())
            .collect::<Result<Vec<_>>>()?;

        let checksum_len = usize::from(reader.u8()?);
        let checksum = reader.bytes(checksum_len)?.to_vec();
        let xattrs = grab_xattrs(&mut reader)?;

        Ok(Self {
            id,
            ctime,
            mtime,
            size,
            container_id,
            uid,
            gid,
            layout_id,
            flags,
            name,
            link,
            xattrs,
            locations,
            unlinked,
            checksum,
            owner: Some(owner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sample(owner: StoreToken) -> FileMd {
        let mut md = FileMd::new(77, owner);
        md.container_id = 5;
        md.name = "report.pdf".to_string();
        md.size = 4096;
        md.uid = 1000;
        md.gid = 100;
        md.layout_id = layout::replica(2);
        md.flags = 0o644;
        md.ctime = Timespec::new(1_700_000_000, 1);
        md.mtime = Timespec::new(1_700_000_001, 2);
        md.add_location(3);
        md.add_location(9);
        md.unlink_location(9);
        md.add_location(11);
        md.set_checksum(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
        md.set_xattr("user.origin", "scanner");
        md
    }

    #[test]
    fn test_file_codec_roundtrip() {
        let owner = StoreToken::next();
        let md = sample(owner);

        let mut buf = Buffer::new();
        md.serialize(&mut buf).unwrap();
        assert_eq!(buf.grab_u64(0).unwrap(), 77);

        let decoded = FileMd::deserialize(&buf, owner).unwrap();
        assert_eq!(decoded, md);
        assert_eq!(decoded.locations(), &[3, 11]);
        assert_eq!(decoded.unlinked_locations(), &[9]);
        assert!(decoded.link.is_none());
    }

    #[test]
    fn test_file_codec_random_attributes() {
        let owner = StoreToken::next();
        let mut rng = rand::thread_rng();

        for _ in 0..32 {
            let mut md = FileMd::new(rng.gen_range(1..u64::MAX), owner);
            md.size = rng.r#gen();
            md.container_id = rng.r#gen();
            md.uid = rng.r#gen();
            md.gid = rng.r#gen();
            md.layout_id = rng.r#gen();
            md.name = format!("f{}", rng.gen_range(0..1_000_000));
            if rng.gen_bool(0.5) {
                md.link = Some("/target".to_string());
            }
            for _ in 0..rng.gen_range(0..8) {
                md.add_location(rng.gen_range(1..64));
            }
            let checksum: Vec<u8> = (0..rng.gen_range(0..=32)).map(|_| rng.r#gen()).collect();
            md.set_checksum(&checksum).unwrap();

            let mut buf = Buffer::new();
            md.serialize(&mut buf).unwrap();
            assert_eq!(FileMd::deserialize(&buf, owner).unwrap(), md);
        }
    }

    #[test]
    fn test_file_truncated_record() {
        let owner = StoreToken::next();
        let mut buf = Buffer::new();
        sample(owner).serialize(&mut buf).unwrap();

        let short = Buffer::from_slice(&buf.as_slice()[..buf.len() - 1]);
        assert!(matches!(
            FileMd::deserialize(&short, owner),
            Err(Error::SizeExceeded { .. })
        ));
    }

    #[test]
    fn test_file_invalid_utf8_name() {
        let owner = StoreToken::next();
        let mut md = sample(owner);
        md.name = "ab".to_string();
        let mut buf = Buffer::new();
        md.serialize(&mut buf).unwrap();

        // name bytes follow the fixed part (70 bytes) and its length prefix
        buf.as_mut_slice()[72] = 0xff;
        assert!(FileMd::deserialize(&buf, owner).unwrap_err().is_corruption());
    }

    #[test]
    fn test_location_lifecycle() {
        let mut md = FileMd::new(1, StoreToken::next());
        md.add_location(1);
        md.add_location(2);
        md.add_location(2);
        assert_eq!(md.locations(), &[1, 2]);

        assert!(md.unlink_location(1));
        assert!(!md.unlink_location(1));
        assert!(md.has_unlinked_location(1));
        assert!(!md.has_location(1));

        // re-adding cancels the pending deletion
        md.add_location(1);
        assert!(md.has_location(1));
        assert!(!md.has_unlinked_location(1));

        assert_eq!(md.replace_location(0, 7).unwrap(), 2);
        assert_eq!(md.locations(), &[7, 1]);
        assert!(md.replace_location(5, 8).unwrap_err().is_not_found());
        // a location stays active at one index only
        assert!(matches!(md.replace_location(0, 1), Err(Error::AlreadyExists(_))));
        assert_eq!(md.replace_location(1, 1).unwrap(), 1);
        assert_eq!(md.locations(), &[7, 1]);

        md.unlink_all_locations();
        assert_eq!(md.num_locations(), 0);
        assert_eq!(md.num_unlinked_locations(), 2);

        assert!(md.remove_location(7));
        assert!(!md.remove_location(7));
        md.remove_all_locations();
        assert_eq!(md.num_unlinked_locations(), 0);
    }

    #[test]
    fn test_checksum_limit() {
        let mut md = FileMd::new(1, StoreToken::next());
        assert!(md.set_checksum(&[0u8; MAX_CHECKSUM_SIZE]).is_ok());
        assert!(md.set_checksum(&[0u8; MAX_CHECKSUM_SIZE + 1]).is_err());
    }

    #[test]
    fn test_physical_size() {
        let mut md = FileMd::new(1, StoreToken::next());
        md.size = 100;
        md.layout_id = layout::replica(3);
        assert_eq!(md.physical_size(), 300);
    }
}
