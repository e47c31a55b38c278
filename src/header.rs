use serde::Serialize;

use crate::error::{BtreeError, Result};

pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the file header on page 1.
pub const HEADER_SIZE: usize = 100;

// Fixed header offsets used by the engine when patching page 1 in place.
pub const HDR_PAGE_SIZE: usize = 16;
pub const HDR_CHANGE_COUNTER: usize = 24;
pub const HDR_DB_SIZE: usize = 28;
pub const HDR_FREELIST_HEAD: usize = 32;
pub const HDR_FREELIST_COUNT: usize = 36;
pub const HDR_AUTO_VACUUM: usize = 52; // 36 + 4*4
pub const HDR_INCR_VACUUM: usize = 64; // 36 + 7*4
pub const HDR_LARGEST_ROOT: usize = 88; // spare metadata slot, see DESIGN.md
pub const HDR_VERSION_VALID_FOR: usize = 92;

/// Auto-vacuum operating mode, stored at header offset 52.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AutoVacuum {
    Off,
    Full,
    Incremental,
}

impl AutoVacuum {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(AutoVacuum::Off),
            1 => Some(AutoVacuum::Full),
            2 => Some(AutoVacuum::Incremental),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            AutoVacuum::Off => 0,
            AutoVacuum::Full => 1,
            AutoVacuum::Incremental => 2,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != AutoVacuum::Off
    }
}

/// The 100-byte database header at the start of page 1.
#[derive(Debug, Clone, Serialize)]
pub struct DbHeader {
    /// Database page size in bytes (power of 2, 512-65536)
    pub page_size: u32,
    /// File format write version (1 = legacy, 2 = WAL)
    pub file_format_write: u8,
    /// File format read version
    pub file_format_read: u8,
    /// Bytes of unused space at end of each page
    pub reserved_bytes_per_page: u8,
    /// Maximum embedded payload fraction (must be 64)
    pub max_payload_fraction: u8,
    /// Minimum embedded payload fraction (must be 32)
    pub min_payload_fraction: u8,
    /// Leaf payload fraction (must be 32)
    pub leaf_payload_fraction: u8,
    /// File change counter
    pub file_change_counter: u32,
    /// Size of database in pages
    pub database_size_pages: u32,
    /// Page number of first freelist trunk page
    pub first_freelist_page: u32,
    /// Total number of freelist pages
    pub freelist_page_count: u32,
    /// Schema cookie
    pub schema_cookie: u32,
    /// Schema format number
    pub schema_format: u32,
    /// Default page cache size
    pub default_cache_size: u32,
    /// Auto-vacuum mode (header offset 52)
    pub auto_vacuum: AutoVacuum,
    /// Text encoding (opaque to this layer)
    pub text_encoding: u32,
    /// User version
    pub user_version: u32,
    /// Incremental-vacuum flag (header offset 64)
    pub incremental_vacuum: u32,
    /// Application ID
    pub application_id: u32,
    /// Largest B-tree root page (auto-vacuum root bookkeeping)
    pub largest_root_page: u32,
    /// Version-valid-for number; must match the change counter for the
    /// in-header database size to be trusted
    pub version_valid_for: u32,
    /// Library version number of the last writer
    pub sqlite_version: u32,
}

impl DbHeader {
    /// Header for a freshly created database.
    pub fn new(page_size: u32, reserved: u8, auto_vacuum: AutoVacuum) -> Self {
        DbHeader {
            page_size,
            file_format_write: 1,
            file_format_read: 1,
            reserved_bytes_per_page: reserved,
            max_payload_fraction: 64,
            min_payload_fraction: 32,
            leaf_payload_fraction: 32,
            file_change_counter: 0,
            database_size_pages: 1,
            first_freelist_page: 0,
            freelist_page_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: 0,
            auto_vacuum,
            text_encoding: 1,
            user_version: 0,
            incremental_vacuum: u32::from(auto_vacuum == AutoVacuum::Incremental),
            application_id: 0,
            largest_root_page: 0,
            version_valid_for: 0,
            sqlite_version: 0,
        }
    }

    /// Get the usable page size (page_size - reserved_bytes_per_page)
    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserved_bytes_per_page as u32
    }

    /// The in-header database size is only meaningful when the
    /// version-valid-for counter matches the change counter.
    pub fn db_size_valid(&self) -> bool {
        self.database_size_pages > 0 && self.version_valid_for == self.file_change_counter
    }
}

/// Parse the 100-byte database header.
pub fn parse_db_header(data: &[u8]) -> Result<DbHeader> {
    if data.len() < HEADER_SIZE {
        return Err(BtreeError::corrupt("database header too short"));
    }

    if &data[0..16] != SQLITE_MAGIC {
        return Err(BtreeError::corrupt("bad magic"));
    }

    // Page size (bytes 16-17); the value 1 encodes 65536
    let page_size_raw = u16::from_be_bytes([data[16], data[17]]);
    let page_size = if page_size_raw == 1 {
        65536
    } else {
        page_size_raw as u32
    };
    if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(BtreeError::corrupt("bad page size"));
    }

    let reserved_bytes_per_page = data[20];
    if page_size - (reserved_bytes_per_page as u32) < 480 {
        return Err(BtreeError::corrupt("usable size below 480"));
    }

    let max_payload_fraction = data[21];
    let min_payload_fraction = data[22];
    let leaf_payload_fraction = data[23];
    if max_payload_fraction != 64 || min_payload_fraction != 32 || leaf_payload_fraction != 32 {
        return Err(BtreeError::corrupt("bad payload fractions"));
    }

    let auto_vacuum_raw = u32::from_be_bytes([data[52], data[53], data[54], data[55]]);
    let auto_vacuum = AutoVacuum::from_u32(auto_vacuum_raw)
        .ok_or(BtreeError::corrupt("bad auto-vacuum mode"))?;

    Ok(DbHeader {
        page_size,
        file_format_write: data[18],
        file_format_read: data[19],
        reserved_bytes_per_page,
        max_payload_fraction,
        min_payload_fraction,
        leaf_payload_fraction,
        file_change_counter: u32::from_be_bytes([data[24], data[25], data[26], data[27]]),
        database_size_pages: u32::from_be_bytes([data[28], data[29], data[30], data[31]]),
        first_freelist_page: u32::from_be_bytes([data[32], data[33], data[34], data[35]]),
        freelist_page_count: u32::from_be_bytes([data[36], data[37], data[38], data[39]]),
        schema_cookie: u32::from_be_bytes([data[40], data[41], data[42], data[43]]),
        schema_format: u32::from_be_bytes([data[44], data[45], data[46], data[47]]),
        default_cache_size: u32::from_be_bytes([data[48], data[49], data[50], data[51]]),
        auto_vacuum,
        text_encoding: u32::from_be_bytes([data[56], data[57], data[58], data[59]]),
        user_version: u32::from_be_bytes([data[60], data[61], data[62], data[63]]),
        incremental_vacuum: u32::from_be_bytes([data[64], data[65], data[66], data[67]]),
        application_id: u32::from_be_bytes([data[68], data[69], data[70], data[71]]),
        largest_root_page: u32::from_be_bytes([data[88], data[89], data[90], data[91]]),
        version_valid_for: u32::from_be_bytes([data[92], data[93], data[94], data[95]]),
        sqlite_version: u32::from_be_bytes([data[96], data[97], data[98], data[99]]),
    })
}

/// Serialize the header into the first 100 bytes of a page 1 buffer.
pub fn write_db_header(data: &mut [u8], hdr: &DbHeader) {
    data[0..16].copy_from_slice(SQLITE_MAGIC);
    let page_size_raw: u16 = if hdr.page_size == 65536 {
        1
    } else {
        hdr.page_size as u16
    };
    data[16..18].copy_from_slice(&page_size_raw.to_be_bytes());
    data[18] = hdr.file_format_write;
    data[19] = hdr.file_format_read;
    data[20] = hdr.reserved_bytes_per_page;
    data[21] = hdr.max_payload_fraction;
    data[22] = hdr.min_payload_fraction;
    data[23] = hdr.leaf_payload_fraction;
    data[24..28].copy_from_slice(&hdr.file_change_counter.to_be_bytes());
    data[28..32].copy_from_slice(&hdr.database_size_pages.to_be_bytes());
    data[32..36].copy_from_slice(&hdr.first_freelist_page.to_be_bytes());
    data[36..40].copy_from_slice(&hdr.freelist_page_count.to_be_bytes());
    data[40..44].copy_from_slice(&hdr.schema_cookie.to_be_bytes());
    data[44..48].copy_from_slice(&hdr.schema_format.to_be_bytes());
    data[48..52].copy_from_slice(&hdr.default_cache_size.to_be_bytes());
    data[52..56].copy_from_slice(&hdr.auto_vacuum.as_u32().to_be_bytes());
    data[56..60].copy_from_slice(&hdr.text_encoding.to_be_bytes());
    data[60..64].copy_from_slice(&hdr.user_version.to_be_bytes());
    data[64..68].copy_from_slice(&hdr.incremental_vacuum.to_be_bytes());
    data[68..72].copy_from_slice(&hdr.application_id.to_be_bytes());
    data[72..88].fill(0);
    data[88..92].copy_from_slice(&hdr.largest_root_page.to_be_bytes());
    data[92..96].copy_from_slice(&hdr.version_valid_for.to_be_bytes());
    data[96..100].copy_from_slice(&hdr.sqlite_version.to_be_bytes());
}

/// Read a big-endian u32 field out of a page buffer.
pub fn get_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Write a big-endian u32 field into a page buffer.
pub fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Read a big-endian u16 field out of a page buffer.
pub fn get_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

/// Write a big-endian u16 field into a page buffer.
pub fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_magic() {
        let data = [0u8; 100];
        assert!(matches!(
            parse_db_header(&data),
            Err(BtreeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_too_short() {
        let data = [0u8; 50];
        assert!(matches!(
            parse_db_header(&data),
            Err(BtreeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_round_trip() {
        let mut hdr = DbHeader::new(4096, 0, AutoVacuum::Incremental);
        hdr.file_change_counter = 7;
        hdr.version_valid_for = 7;
        hdr.database_size_pages = 42;
        hdr.first_freelist_page = 9;
        hdr.freelist_page_count = 3;
        hdr.largest_root_page = 5;

        let mut data = vec![0u8; 4096];
        write_db_header(&mut data, &hdr);
        let parsed = parse_db_header(&data).unwrap();

        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.auto_vacuum, AutoVacuum::Incremental);
        assert_eq!(parsed.incremental_vacuum, 1);
        assert_eq!(parsed.database_size_pages, 42);
        assert_eq!(parsed.first_freelist_page, 9);
        assert_eq!(parsed.freelist_page_count, 3);
        assert_eq!(parsed.largest_root_page, 5);
        assert!(parsed.db_size_valid());
    }

    #[test]
    fn test_page_size_65536_encoded_as_1() {
        let hdr = DbHeader::new(65536, 0, AutoVacuum::Off);
        let mut data = vec![0u8; HEADER_SIZE];
        write_db_header(&mut data, &hdr);
        assert_eq!(get_u16(&data, HDR_PAGE_SIZE), 1);
        assert_eq!(parse_db_header(&data).unwrap().page_size, 65536);
    }
}
