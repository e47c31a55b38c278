use crate::error::{BtreeError, Result};
use crate::header::{get_u16, get_u32, put_u16, put_u32, HEADER_SIZE};
use crate::pager::Pgno;
use crate::varint::{parse_signed_varint, parse_varint};

/// Maximum depth of any B-tree path held by a cursor.
pub const MAX_DEPTH: usize = 20;

// Page header field offsets, relative to the header start.
pub const PF_TYPE: usize = 0;
pub const PF_FREEBLOCK: usize = 1;
pub const PF_NCELL: usize = 3;
pub const PF_CONTENT: usize = 5;
pub const PF_FRAG: usize = 7;
pub const PF_RIGHT_CHILD: usize = 8;

/// Page type flags as stored in the first byte of the page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Interior index B-tree page (0x02)
    InteriorIndex,
    /// Interior table B-tree page (0x05)
    InteriorTable,
    /// Leaf index B-tree page (0x0a)
    LeafIndex,
    /// Leaf table B-tree page (0x0d)
    LeafTable,
}

impl PageType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(PageType::InteriorIndex),
            0x05 => Some(PageType::InteriorTable),
            0x0a => Some(PageType::LeafIndex),
            0x0d => Some(PageType::LeafTable),
            _ => None,
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            PageType::InteriorIndex => 0x02,
            PageType::InteriorTable => 0x05,
            PageType::LeafIndex => 0x0a,
            PageType::LeafTable => 0x0d,
        }
    }

    pub fn is_interior(self) -> bool {
        matches!(self, PageType::InteriorIndex | PageType::InteriorTable)
    }

    pub fn is_leaf(self) -> bool {
        !self.is_interior()
    }

    pub fn is_table(self) -> bool {
        matches!(self, PageType::InteriorTable | PageType::LeafTable)
    }

    pub fn is_index(self) -> bool {
        !self.is_table()
    }

    pub fn header_size(self) -> usize {
        if self.is_interior() {
            12
        } else {
            8
        }
    }

    /// The leaf page type for the same tree kind.
    pub fn as_leaf(self) -> PageType {
        if self.is_table() {
            PageType::LeafTable
        } else {
            PageType::LeafIndex
        }
    }

    /// The interior page type for the same tree kind.
    pub fn as_interior(self) -> PageType {
        if self.is_table() {
            PageType::InteriorTable
        } else {
            PageType::InteriorIndex
        }
    }
}

/// Offset of the B-tree page header: 100 on page 1, 0 elsewhere.
pub fn page_hdr_offset(pgno: Pgno) -> usize {
    if pgno == 1 {
        HEADER_SIZE
    } else {
        0
    }
}

/// Inline payload limits for a page type.
///
/// Changing these formulas breaks file-format compatibility.
pub fn payload_limits(page_type: PageType, usable: u32) -> (u32, u32) {
    let min_local = (usable - 12) * 32 / 255 - 23;
    let max_local = if page_type == PageType::LeafTable {
        usable - 35
    } else {
        (usable - 12) * 64 / 255 - 23
    };
    (max_local, min_local)
}

/// How many payload bytes stay on the page for a payload of `n_payload`
/// bytes. The local portion is chosen to minimise wasted space on the
/// overflow pages while staying within `[min_local, max_local]`.
pub fn local_payload_size(max_local: u32, min_local: u32, usable: u32, n_payload: u32) -> u32 {
    if n_payload <= max_local {
        return n_payload;
    }
    let surplus = min_local + (n_payload - min_local) % (usable - 4);
    if surplus <= max_local {
        surplus
    } else {
        min_local
    }
}

/// Decoded form of one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CellInfo {
    /// Rowid for table pages; unused for index pages
    pub key: i64,
    /// Total payload bytes, including any overflow
    pub n_payload: u32,
    /// Payload bytes stored on this page
    pub n_local: u32,
    /// Page offset of the first local payload byte
    pub payload_offset: usize,
    /// Total bytes the cell occupies on this page (minimum 4)
    pub n_size: u16,
    /// First overflow page, or 0 when the payload is fully local
    pub overflow: Pgno,
}

/// A derived, value-typed view of one B-tree page. The raw bytes stay with
/// the pager; a `MemPage` is re-derived whenever a page is fetched and is
/// never held across a call that can restructure the page.
#[derive(Debug, Clone, Copy)]
pub struct MemPage {
    pub pgno: Pgno,
    pub page_type: PageType,
    /// 100 on page 1, 0 elsewhere
    pub hdr: usize,
    pub n_cell: u16,
    pub first_freeblock: u16,
    /// First byte of the cell content area; 65536 is representable
    pub cell_content: u32,
    pub frag: u8,
    /// Total free bytes: gap + freeblocks + fragments
    pub n_free: u32,
    pub usable: u32,
    pub max_local: u32,
    pub min_local: u32,
}

impl MemPage {
    /// Decode and validate a page. Fails with `Corrupt` when the header,
    /// the cell count, the content offset, or the freeblock chain is
    /// inconsistent.
    pub fn init(pgno: Pgno, data: &[u8], usable: u32) -> Result<Self> {
        let hdr = page_hdr_offset(pgno);
        if data.len() < hdr + 8 || (data.len() as u32) < usable {
            return Err(BtreeError::corrupt("page buffer too small"));
        }

        let page_type = PageType::from_byte(data[hdr + PF_TYPE])
            .ok_or(BtreeError::corrupt("bad page type flag"))?;
        let first_freeblock = get_u16(data, hdr + PF_FREEBLOCK);
        let n_cell = get_u16(data, hdr + PF_NCELL);
        let raw_content = get_u16(data, hdr + PF_CONTENT);
        let cell_content = if raw_content == 0 {
            65536
        } else {
            raw_content as u32
        };
        let frag = data[hdr + PF_FRAG];

        let cell_ptr = hdr + page_type.header_size();
        let ptr_end = cell_ptr + 2 * n_cell as usize;
        if (ptr_end as u32) > cell_content || cell_content > usable {
            return Err(BtreeError::corrupt("cell content offset"));
        }

        // Walk the freeblock chain: ascending, non-overlapping, inside the
        // content area.
        let mut free = 0u32;
        let mut pc = first_freeblock as u32;
        let mut prev_end = cell_content;
        while pc != 0 {
            if pc < prev_end || pc + 4 > usable {
                return Err(BtreeError::corrupt("freeblock chain"));
            }
            let next = get_u16(data, pc as usize) as u32;
            let size = get_u16(data, pc as usize + 2) as u32;
            if size < 4 || pc + size > usable {
                return Err(BtreeError::corrupt("freeblock size"));
            }
            if next != 0 && next < pc + size {
                return Err(BtreeError::corrupt("freeblock order"));
            }
            free += size;
            prev_end = pc + size;
            pc = next;
        }

        let gap = cell_content - ptr_end as u32;
        let n_free = gap + free + frag as u32;
        if n_free > usable {
            return Err(BtreeError::corrupt("free byte count"));
        }

        let (max_local, min_local) = payload_limits(page_type, usable);

        Ok(MemPage {
            pgno,
            page_type,
            hdr,
            n_cell,
            first_freeblock,
            cell_content,
            frag,
            n_free,
            usable,
            max_local,
            min_local,
        })
    }

    /// Offset of the cell pointer array.
    pub fn cell_ptr_offset(&self) -> usize {
        self.hdr + self.page_type.header_size()
    }

    /// The unallocated gap between the pointer array and the content area.
    pub fn gap(&self) -> u32 {
        self.cell_content - (self.cell_ptr_offset() + 2 * self.n_cell as usize) as u32
    }

    /// Page offset of cell `i`'s content.
    pub fn cell_offset(&self, data: &[u8], i: u16) -> Result<usize> {
        if i >= self.n_cell {
            return Err(BtreeError::corrupt("cell index out of range"));
        }
        let ptr = self.cell_ptr_offset() + 2 * i as usize;
        let offset = get_u16(data, ptr) as usize;
        if (offset as u32) < self.cell_content.min(self.usable) || offset as u32 >= self.usable {
            return Err(BtreeError::corrupt("cell pointer"));
        }
        Ok(offset)
    }

    pub fn set_cell_offset(&self, data: &mut [u8], i: u16, offset: u16) {
        let ptr = self.cell_ptr_offset() + 2 * i as usize;
        put_u16(data, ptr, offset);
    }

    /// Rightmost child pointer of an interior page.
    pub fn right_child(&self, data: &[u8]) -> Pgno {
        get_u32(data, self.hdr + PF_RIGHT_CHILD)
    }

    pub fn set_right_child(&self, data: &mut [u8], child: Pgno) {
        put_u32(data, self.hdr + PF_RIGHT_CHILD, child);
    }

    // Write-through header mutators; the descriptor stays in sync with
    // the buffer.

    pub fn set_n_cell(&mut self, data: &mut [u8], n: u16) {
        self.n_cell = n;
        put_u16(data, self.hdr + PF_NCELL, n);
    }

    pub fn set_first_freeblock(&mut self, data: &mut [u8], offset: u16) {
        self.first_freeblock = offset;
        put_u16(data, self.hdr + PF_FREEBLOCK, offset);
    }

    pub fn set_cell_content(&mut self, data: &mut [u8], offset: u32) {
        self.cell_content = offset;
        // 65536 is stored as 0
        put_u16(data, self.hdr + PF_CONTENT, offset as u16);
    }

    pub fn set_frag(&mut self, data: &mut [u8], frag: u8) {
        self.frag = frag;
        data[self.hdr + PF_FRAG] = frag;
    }

    /// Decode the cell at page offset `offset`.
    pub fn parse_cell(&self, data: &[u8], offset: usize) -> Result<CellInfo> {
        if offset + 4 > data.len() {
            return Err(BtreeError::corrupt("cell extends past page"));
        }
        let mut info = CellInfo::default();
        let mut pos = offset;

        match self.page_type {
            PageType::InteriorTable => {
                let (key, n) = parse_signed_varint(&data[pos + 4..])?;
                info.key = key;
                info.payload_offset = pos + 4 + n;
                info.n_size = (4 + n).max(4) as u16;
                return Ok(info);
            }
            PageType::InteriorIndex => {
                pos += 4;
            }
            _ => {}
        }

        let (n_payload, n) = parse_varint(&data[pos..])?;
        if n_payload > u32::MAX as u64 {
            return Err(BtreeError::corrupt("payload size"));
        }
        pos += n;
        if self.page_type == PageType::LeafTable {
            let (key, n) = parse_signed_varint(&data[pos..])?;
            info.key = key;
            pos += n;
        }
        info.n_payload = n_payload as u32;
        info.payload_offset = pos;
        info.n_local = local_payload_size(
            self.max_local,
            self.min_local,
            self.usable,
            info.n_payload,
        );

        let header = (pos - offset) as u32;
        if info.n_local == info.n_payload {
            info.n_size = (header + info.n_payload).max(4) as u16;
        } else {
            let ovfl_at = pos + info.n_local as usize;
            if ovfl_at + 4 > data.len() {
                return Err(BtreeError::corrupt("overflow pointer past page"));
            }
            info.overflow = get_u32(data, ovfl_at);
            info.n_size = (header + info.n_local + 4) as u16;
        }
        Ok(info)
    }

    /// Total on-page size of the cell at `offset`, without building a full
    /// `CellInfo`. Agrees with `parse_cell(..).n_size` on all inputs.
    pub fn cell_size(&self, data: &[u8], offset: usize) -> Result<u16> {
        let size = self.cell_size_inner(data, offset)?;
        #[cfg(debug_assertions)]
        {
            if let Ok(info) = self.parse_cell(data, offset) {
                debug_assert_eq!(size, info.n_size);
            }
        }
        Ok(size)
    }

    fn cell_size_inner(&self, data: &[u8], offset: usize) -> Result<u16> {
        if offset + 4 > data.len() {
            return Err(BtreeError::corrupt("cell extends past page"));
        }
        let mut pos = offset;
        match self.page_type {
            PageType::InteriorTable => {
                let (_, n) = parse_varint(&data[pos + 4..])?;
                return Ok(((4 + n).max(4)) as u16);
            }
            PageType::InteriorIndex => pos += 4,
            _ => {}
        }
        let (n_payload, n) = parse_varint(&data[pos..])?;
        pos += n;
        if self.page_type == PageType::LeafTable {
            let (_, n) = parse_varint(&data[pos..])?;
            pos += n;
        }
        let n_payload = n_payload.min(u32::MAX as u64) as u32;
        let n_local = local_payload_size(self.max_local, self.min_local, self.usable, n_payload);
        let header = (pos - offset) as u32;
        let size = if n_local == n_payload {
            (header + n_payload).max(4)
        } else {
            header + n_local + 4
        };
        Ok(size as u16)
    }

    /// Left child pointer of the cell at `offset` (interior pages only).
    pub fn cell_left_child(&self, data: &[u8], offset: usize) -> Pgno {
        get_u32(data, offset)
    }

    pub fn set_cell_left_child(&self, data: &mut [u8], offset: usize, child: Pgno) {
        put_u32(data, offset, child);
    }
}

/// Format a raw buffer as an empty page of the given type and return its
/// descriptor. The content area starts at the usable end.
pub fn zero_page(pgno: Pgno, data: &mut [u8], page_type: PageType, usable: u32) -> MemPage {
    let hdr = page_hdr_offset(pgno);
    data[hdr + PF_TYPE] = page_type.flag();
    put_u16(data, hdr + PF_FREEBLOCK, 0);
    put_u16(data, hdr + PF_NCELL, 0);
    // 65536 is stored as 0; the cast does that on its own
    put_u16(data, hdr + PF_CONTENT, usable as u16);
    data[hdr + PF_FRAG] = 0;
    if page_type.is_interior() {
        put_u32(data, hdr + PF_RIGHT_CHILD, 0);
    }

    let (max_local, min_local) = payload_limits(page_type, usable);
    let ptr_end = (hdr + page_type.header_size()) as u32;
    MemPage {
        pgno,
        page_type,
        hdr,
        n_cell: 0,
        first_freeblock: 0,
        cell_content: usable,
        frag: 0,
        n_free: usable - ptr_end,
        usable,
        max_local,
        min_local,
    }
}

/// Exact encoded length of a standalone cell, without the 4-byte
/// allocation minimum. Copies rounded up to the minimum carry stale tail
/// bytes; builders that prepend a child pointer trim with this first.
pub fn cell_bytes_len(page_type: PageType, cell: &[u8], usable: u32) -> Result<usize> {
    let mut pos = 0usize;
    match page_type {
        PageType::InteriorTable => {
            let (_, n) = parse_varint(&cell[4..])?;
            return Ok(4 + n);
        }
        PageType::InteriorIndex => pos = 4,
        _ => {}
    }
    let (n_payload, n) = parse_varint(&cell[pos..])?;
    pos += n;
    if page_type == PageType::LeafTable {
        let (_, n) = parse_varint(&cell[pos..])?;
        pos += n;
    }
    let n_payload = n_payload.min(u32::MAX as u64) as u32;
    let (max_local, min_local) = payload_limits(page_type, usable);
    let n_local = local_payload_size(max_local, min_local, usable, n_payload);
    let ovfl = if n_local < n_payload { 4 } else { 0 };
    Ok(pos + n_local as usize + ovfl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::write_varint;

    const USABLE: u32 = 512;

    #[test]
    fn test_zero_page_round_trip() {
        let mut data = vec![0u8; USABLE as usize];
        let pg = zero_page(2, &mut data, PageType::LeafTable, USABLE);
        assert_eq!(pg.n_cell, 0);
        assert_eq!(pg.cell_content, USABLE);
        assert_eq!(pg.n_free, USABLE - 8);

        let parsed = MemPage::init(2, &data, USABLE).unwrap();
        assert_eq!(parsed.page_type, PageType::LeafTable);
        assert_eq!(parsed.n_free, pg.n_free);
    }

    #[test]
    fn test_zero_page_65536_content_offset() {
        let mut data = vec![0u8; 65536];
        let pg = zero_page(2, &mut data, PageType::LeafIndex, 65536);
        assert_eq!(pg.cell_content, 65536);
        // Stored as 0 on disk
        assert_eq!(get_u16(&data, PF_CONTENT), 0);
        let parsed = MemPage::init(2, &data, 65536).unwrap();
        assert_eq!(parsed.cell_content, 65536);
    }

    #[test]
    fn test_init_rejects_bad_flag() {
        let mut data = vec![0u8; USABLE as usize];
        data[0] = 7;
        assert!(matches!(
            MemPage::init(2, &data, USABLE),
            Err(BtreeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_init_rejects_descending_freeblocks() {
        let mut data = vec![0u8; USABLE as usize];
        let mut pg = zero_page(2, &mut data, PageType::LeafTable, USABLE);
        pg.set_cell_content(&mut data, 100);
        // Chain 300 -> 200 is out of order
        put_u16(&mut data, PF_FREEBLOCK, 300);
        put_u16(&mut data, 300, 200);
        put_u16(&mut data, 302, 8);
        assert!(MemPage::init(2, &data, USABLE).is_err());
    }

    #[test]
    fn test_parse_leaf_table_cell() {
        let mut data = vec![0u8; USABLE as usize];
        let mut pg = zero_page(2, &mut data, PageType::LeafTable, USABLE);

        // Hand-place a cell: payload size 3, rowid 7, payload "abc"
        let off = 400usize;
        let mut pos = off;
        pos += write_varint(&mut data[pos..], 3);
        pos += write_varint(&mut data[pos..], 7);
        data[pos..pos + 3].copy_from_slice(b"abc");
        pg.set_cell_content(&mut data, off as u32);
        pg.set_n_cell(&mut data, 1);
        pg.set_cell_offset(&mut data, 0, off as u16);

        let pg = MemPage::init(2, &data, USABLE).unwrap();
        let info = pg.parse_cell(&data, off).unwrap();
        assert_eq!(info.key, 7);
        assert_eq!(info.n_payload, 3);
        assert_eq!(info.n_local, 3);
        assert_eq!(info.n_size, 5);
        assert_eq!(info.overflow, 0);
        assert_eq!(pg.cell_size(&data, off).unwrap(), info.n_size);
    }

    #[test]
    fn test_minimum_cell_size_is_four() {
        let mut data = vec![0u8; USABLE as usize];
        let pg = zero_page(2, &mut data, PageType::LeafTable, USABLE);
        // Payload size 0, rowid 1: two header bytes, computed size 2
        let off = 500usize;
        data[off] = 0;
        data[off + 1] = 1;
        let info = pg.parse_cell(&data, off).unwrap();
        assert_eq!(info.n_size, 4);
        assert_eq!(pg.cell_size(&data, off).unwrap(), 4);
    }

    #[test]
    fn test_payload_spill_boundaries() {
        let (max_local, min_local) = payload_limits(PageType::LeafTable, 4096);
        assert_eq!(max_local, 4096 - 35);
        // At the boundary everything stays local
        assert_eq!(
            local_payload_size(max_local, min_local, 4096, max_local),
            max_local
        );
        // One byte over spills
        let local = local_payload_size(max_local, min_local, 4096, max_local + 1);
        assert!(local < max_local + 1);
        assert!(local >= min_local && local <= max_local);
    }

    #[test]
    fn test_spill_fills_overflow_pages_exactly() {
        let usable = 4096u32;
        let (max_local, min_local) = payload_limits(PageType::LeafTable, usable);
        let n_payload = 20000u32;
        let surplus = min_local + (n_payload - min_local) % (usable - 4);
        let expect = if surplus <= max_local { surplus } else { min_local };
        assert_eq!(
            local_payload_size(max_local, min_local, usable, n_payload),
            expect
        );
    }

    #[test]
    fn test_interior_table_cell() {
        let mut data = vec![0u8; USABLE as usize];
        let pg = zero_page(2, &mut data, PageType::InteriorTable, USABLE);
        let off = 480usize;
        put_u32(&mut data, off, 9);
        let n = write_varint(&mut data[off + 4..], 300);
        let info = pg.parse_cell(&data, off).unwrap();
        assert_eq!(info.key, 300);
        assert_eq!(info.n_size as usize, 4 + n);
        assert_eq!(pg.cell_left_child(&data, off), 9);
    }
}
