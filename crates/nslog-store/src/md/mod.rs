//! Persisted metadata entities
//!
//! Both entity kinds serialize into the payload of an UPDATE record. The
//! first eight bytes of every payload are the entity id, which is all the
//! changelog layer ever looks at.

mod container;
mod file;

pub use container::ContainerMd;
pub use file::FileMd;

use crate::buffer::{Buffer, BufferReader};
use crate::changelog::ContentKind;
use nslog_common::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies the store instance an object belongs to
///
/// Objects produced by a service carry its token; a read-only copy carries
/// none and cannot be persisted anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StoreToken(u64);

impl StoreToken {
    /// Allocate a token unique within this process
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// An entity that lives in a changelog
pub trait MdRecord: Clone + Send + Sync + 'static {
    /// Content kind of the log holding this entity
    const CONTENT: ContentKind;

    /// Entity id
    fn id(&self) -> u64;

    /// Name within the parent container
    fn name(&self) -> &str;

    /// Id of the parent container (0 when detached)
    fn parent(&self) -> u64;

    /// Store that owns this object
    fn owner(&self) -> Option<StoreToken>;

    /// Encode into `buffer`
    fn serialize(&self, buffer: &mut Buffer) -> Result<()>;

    /// Decode a fresh object owned by `owner`
    fn deserialize(buffer: &Buffer, owner: StoreToken) -> Result<Self>;

    /// Carry over in-memory state that is not persisted
    fn adopt_navigation(&mut self, _previous: &Self) {}
}

pub(crate) fn put_xattrs(buffer: &mut Buffer, xattrs: &BTreeMap<String, String>) -> Result<()> {
    let count = u16::try_from(xattrs.len()).map_err(|_| nslog_common::Error::SizeExceeded {
        needed: xattrs.len(),
        available: usize::from(u16::MAX),
    })?;
    buffer.put_u16(count);
    for (key, value) in xattrs {
        buffer.put_string(key)?;
        buffer.put_string(value)?;
    }
    Ok(())
}

pub(crate) fn grab_xattrs(reader: &mut BufferReader<'_>) -> Result<BTreeMap<String, String>> {
    let count = reader.u16()?;
    let mut xattrs = BTreeMap::new();
    for _ in 0..count {
        let key = reader.string()?;
        let value = reader.string()?;
        xattrs.insert(key, value);
    }
    Ok(xattrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_tokens_are_unique() {
        let a = StoreToken::next();
        let b = StoreToken::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_xattrs_roundtrip() {
        let mut xattrs = BTreeMap::new();
        xattrs.insert("user.a".to_string(), "1".to_string());
        xattrs.insert("sys.b".to_string(), String::new());

        let mut buf = Buffer::new();
        put_xattrs(&mut buf, &xattrs).unwrap();
        let mut reader = buf.reader();
        assert_eq!(grab_xattrs(&mut reader).unwrap(), xattrs);
        assert_eq!(reader.remaining(), 0);
    }
}
