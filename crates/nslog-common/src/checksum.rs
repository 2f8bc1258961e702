//! Checksum utilities for nslog
//!
//! Changelog records carry a CRC32C over their payload followed by the
//! frame's kind and size bytes. The payload-first order lets the repair
//! routine extend the checksum one byte at a time while searching for a
//! record's true length.

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Extend a running CRC32C with more data
#[inline]
#[must_use]
pub fn extend_crc32c(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Checksum of a changelog record: payload first, then `[kind, size]`
#[must_use]
pub fn record_checksum(payload: &[u8], kind: u8, size: u16) -> u32 {
    seal_record_checksum(compute_crc32c(payload), kind, size)
}

/// Finish a record checksum from the CRC of its payload
#[inline]
#[must_use]
pub fn seal_record_checksum(payload_crc: u32, kind: u8, size: u16) -> u32 {
    let size = size.to_le_bytes();
    extend_crc32c(payload_crc, &[kind, size[0], size[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_record_checksum() {
        let payload = b"some serialized entity";

        let mut running = 0;
        for byte in payload {
            running = extend_crc32c(running, std::slice::from_ref(byte));
        }

        assert_eq!(
            seal_record_checksum(running, 1, payload.len() as u16),
            record_checksum(payload, 1, payload.len() as u16)
        );
    }

    #[test]
    fn test_record_checksum_covers_frame() {
        let payload = b"payload";
        let base = record_checksum(payload, 1, 7);
        assert_ne!(base, record_checksum(payload, 2, 7));
        assert_ne!(base, record_checksum(payload, 1, 8));
    }
}
