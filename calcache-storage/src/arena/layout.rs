//! Byte layout of one published view inside a sub-arena.
//!
//! All integers are little-endian and every reference is a `u32` offset from
//! the start of the sub-arena, so the same bytes are valid at whatever
//! address a process maps the segment.
//!
//! ```text
//! 0        ViewHeader (64 B)
//! records  CalendarRecord[calendar_count] (48 B each)
//! ...      per calendar: xuid bytes, name bytes, i32 days, u32 page map
//! id_idx   (i64 id, u32 record, u32 pad)[calendar_count], sorted by id
//! name_idx u32 record[calendar_count], sorted by name bytes
//! xuid_idx u32 record[calendar_count], sorted by normalized xuid bytes
//! ```

/// Magic value at the start of every built view.
pub const VIEW_MAGIC: u32 = 0x4341_4C56;

/// Sentinel stored for "no timestamp".
pub const NO_TIMESTAMP: i64 = i64::MIN;

// ============================================================================
// VIEW HEADER
// ============================================================================

pub const HEADER_LEN: usize = 64;

pub mod header {
    pub const MAGIC: usize = 0;
    pub const CALENDAR_COUNT: usize = 4;
    pub const VERSION: usize = 8;
    pub const BREAKPOINT_COUNT: usize = 16;
    pub const WATERMARK_MICROS: usize = 24;
    pub const LOADED_AT_MICROS: usize = 32;
    pub const RECORDS_OFF: usize = 40;
    pub const ID_INDEX_OFF: usize = 44;
    pub const NAME_INDEX_OFF: usize = 48;
    pub const XUID_INDEX_OFF: usize = 52;
    pub const USED_BYTES: usize = 56;
}

// ============================================================================
// CALENDAR RECORD
// ============================================================================

pub const RECORD_LEN: usize = 48;

pub mod record {
    pub const ID: usize = 0;
    pub const XUID_OFF: usize = 8;
    pub const XUID_LEN: usize = 12;
    pub const NAME_OFF: usize = 16;
    pub const NAME_LEN: usize = 20;
    pub const DAYS_OFF: usize = 24;
    pub const DAYS_LEN: usize = 28;
    pub const PAGE_SIZE: usize = 32;
    pub const FIRST_PAGE: usize = 36;
    pub const PAGE_MAP_OFF: usize = 40;
    pub const PAGE_MAP_LEN: usize = 44;
}

// ============================================================================
// INDEX ENTRIES
// ============================================================================

pub const ID_ENTRY_LEN: usize = 16;
pub const LABEL_ENTRY_LEN: usize = 4;
pub const DAY_LEN: usize = 4;
pub const PAGE_ENTRY_LEN: usize = 4;

// ============================================================================
// CODEC
// ============================================================================

pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

pub fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(buf)
}

pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

pub fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(buf)
}

pub fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub fn write_i64(bytes: &mut [u8], offset: usize, value: i64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_is_little_endian() {
        let mut bytes = [0u8; 16];
        write_u32(&mut bytes, 0, 0x0102_0304);
        assert_eq!(&bytes[..4], &[4, 3, 2, 1]);
        write_i64(&mut bytes, 8, -2);
        assert_eq!(read_i64(&bytes, 8), -2);
        assert_eq!(read_u32(&bytes, 0), 0x0102_0304);
    }

    #[test]
    fn test_header_fields_fit() {
        assert!(header::USED_BYTES + 4 <= HEADER_LEN);
        assert!(record::PAGE_MAP_LEN + 4 <= RECORD_LEN);
    }
}
