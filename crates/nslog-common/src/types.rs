//! Core type definitions for nslog
//!
//! Identifiers, timestamps and the small amount of layout arithmetic shared
//! by the store and the accounting layer.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a container (directory)
pub type ContainerId = u64;

/// Identifier of a file
pub type FileId = u64;

/// Identifier of a replica location (file system)
pub type LocationId = u32;

/// Id of the root container; the root is its own parent
pub const ROOT_CONTAINER_ID: ContainerId = 1;

/// Container flag marking a quota accounting root
pub const QUOTA_NODE_FLAG: u16 = 0x10;

/// Extended attribute enabling sync-time propagation on a container
pub const MTIME_PROPAGATION_ATTR: &str = "sys.mtime.propagation";

/// Seconds and nanoseconds since the Unix epoch
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
)]
#[display("{sec}.{nsec:09}")]
pub struct Timespec {
    /// Whole seconds
    pub sec: u64,
    /// Nanoseconds within the second
    pub nsec: u64,
}

impl Timespec {
    /// Create a timestamp
    #[must_use]
    pub const fn new(sec: u64, nsec: u64) -> Self {
        Self { sec, nsec }
    }

    /// Current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs(),
            nsec: u64::from(elapsed.subsec_nanos()),
        }
    }

    /// Whether this is the zero timestamp
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}

/// Layout id helpers
///
/// A layout id packs the placement scheme of a file; bits 8..16 hold the
/// number of stripes minus one.
pub mod layout {
    /// Build a layout id for a plain replica layout with `stripes` copies
    #[must_use]
    pub const fn replica(stripes: u8) -> u32 {
        let stripes = if stripes == 0 { 1 } else { stripes };
        ((stripes as u32 - 1) & 0xff) << 8
    }

    /// Number of stripes encoded in a layout id
    #[must_use]
    pub const fn stripe_count(layout_id: u32) -> u64 {
        (((layout_id >> 8) & 0xff) + 1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timespec_ordering() {
        let a = Timespec::new(10, 5);
        let b = Timespec::new(10, 6);
        let c = Timespec::new(11, 0);
        assert!(a < b && b < c);
        assert!(Timespec::default().is_zero());
        assert_eq!(a.to_string(), "10.000000005");
    }

    #[test]
    fn test_timespec_now() {
        let now = Timespec::now();
        assert!(now.sec > 1_600_000_000);
        assert!(now.nsec < 1_000_000_000);
    }

    #[test]
    fn test_layout_stripes() {
        assert_eq!(layout::stripe_count(0), 1);
        assert_eq!(layout::stripe_count(layout::replica(2)), 2);
        assert_eq!(layout::stripe_count(layout::replica(0)), 1);
        assert_eq!(layout::stripe_count(layout::replica(255)), 255);
    }
}
