//! Payloads that do not fit inline: overflow-chain construction, access,
//! and teardown.
//!
//! An overflow page holds the next page number in its first 4 bytes (zero
//! terminates the chain) and payload in the remaining `usable - 4`.

use log::trace;

use crate::error::{BtreeError, Result};
use crate::freelist::AllocMode;
use crate::header::{get_u32, put_u32};
use crate::page::{local_payload_size, payload_limits, MemPage, PageType};
use crate::pager::Pgno;
use crate::vacuum::PtrmapType;
use crate::varint::push_varint;
use crate::BtShared;

/// Direction of a payload access.
pub(crate) enum Access<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Access<'_> {
    fn len(&self) -> usize {
        match self {
            Access::Read(b) => b.len(),
            Access::Write(b) => b.len(),
        }
    }
}

impl BtShared {
    /// Build a complete leaf cell for `payload`, spilling to a fresh
    /// overflow chain when it exceeds the page's inline limit.
    /// `parent_pgno` is the page the cell is destined for; the pointer map
    /// records the chain head against it.
    pub(crate) fn fill_in_cell(
        &mut self,
        page_type: PageType,
        parent_pgno: Pgno,
        rowid: i64,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let (max_local, min_local) = payload_limits(page_type, self.usable);
        let n_payload = payload.len() as u32;
        let n_local = local_payload_size(max_local, min_local, self.usable, n_payload) as usize;

        let mut cell = Vec::with_capacity(n_local + 18);
        push_varint(&mut cell, n_payload as u64);
        if page_type == PageType::LeafTable {
            push_varint(&mut cell, rowid as u64);
        }
        cell.extend_from_slice(&payload[..n_local]);

        if n_local < payload.len() {
            let first = self.build_overflow_chain(parent_pgno, &payload[n_local..])?;
            cell.extend_from_slice(&first.to_be_bytes());
        }
        Ok(cell)
    }

    fn build_overflow_chain(&mut self, parent_pgno: Pgno, mut rest: &[u8]) -> Result<Pgno> {
        let per_page = (self.usable - 4) as usize;
        let mut first: Pgno = 0;
        let mut prev: Pgno = 0;

        while !rest.is_empty() {
            let ovfl = self.allocate_page(AllocMode::Any)?;
            if self.auto_vacuum.is_enabled() {
                if prev == 0 {
                    self.ptrmap_put(ovfl, PtrmapType::Overflow1, parent_pgno)?;
                } else {
                    self.ptrmap_put(ovfl, PtrmapType::Overflow2, prev)?;
                }
            }

            let chunk = rest.len().min(per_page);
            let data = self.new_page_buffer(ovfl)?;
            put_u32(data, 0, 0);
            data[4..4 + chunk].copy_from_slice(&rest[..chunk]);
            rest = &rest[chunk..];

            if prev != 0 {
                let prev_data = self.pager.get_mut(prev)?;
                put_u32(prev_data, 0, ovfl);
            } else {
                first = ovfl;
            }
            prev = ovfl;
        }
        trace!("overflow chain for page {} starts at {}", parent_pgno, first);
        Ok(first)
    }

    /// Free the overflow chain (if any) of the cell at `cell_offset` and
    /// return the cell's on-page size.
    pub(crate) fn clear_cell(&mut self, pgno: Pgno, cell_offset: usize) -> Result<u16> {
        let data = self.pager.get(pgno)?;
        let pg = MemPage::init(pgno, data, self.usable)?;
        let info = pg.parse_cell(data, cell_offset)?;
        if info.overflow == 0 {
            return Ok(info.n_size);
        }

        let per_page = self.usable - 4;
        let mut expected = (info.n_payload - info.n_local).div_ceil(per_page);
        let mut cur = info.overflow;
        while cur != 0 {
            if expected == 0 {
                return Err(BtreeError::corrupt("overflow chain too long"));
            }
            if cur < 2 || cur > self.pager.page_count() {
                return Err(BtreeError::corrupt("overflow page out of range"));
            }
            let next = get_u32(self.pager.get(cur)?, 0);
            self.free_page(cur)?;
            cur = next;
            expected -= 1;
        }
        if expected != 0 {
            return Err(BtreeError::corrupt("overflow chain too short"));
        }
        Ok(info.n_size)
    }

    /// The page holding overflow index `target` of the chain starting at
    /// `first`, walking through `cache` (which is extended as pages are
    /// visited). Under auto-vacuum, skipped links are guessed as
    /// `current + 1` and confirmed against the pointer map, avoiding the
    /// page reads.
    fn overflow_page_at(
        &mut self,
        first: Pgno,
        cache: &mut Vec<Pgno>,
        target: usize,
    ) -> Result<Pgno> {
        if cache.is_empty() {
            cache.push(first);
        }
        if let Some(&pgno) = cache.get(target) {
            return Ok(pgno);
        }
        let mut i = cache.len() - 1;
        let mut cur = cache[i];
        while i < target {
            let mut next = 0;
            if self.auto_vacuum.is_enabled() {
                let guess = cur + 1;
                if guess <= self.pager.page_count() && !self.is_ptrmap_page(guess) {
                    if let Ok((PtrmapType::Overflow2, parent)) = self.ptrmap_get(guess) {
                        if parent == cur {
                            next = guess;
                        }
                    }
                }
            }
            if next == 0 {
                next = get_u32(self.pager.get(cur)?, 0);
            }
            if next == 0 {
                return Err(BtreeError::corrupt("overflow chain ends early"));
            }
            cache.push(next);
            cur = next;
            i += 1;
        }
        Ok(cur)
    }

    /// Read or write `buf.len()` payload bytes of the cell at
    /// `(pgno, cell_offset)`, starting `offset` bytes into the payload and
    /// spanning the overflow chain as needed.
    ///
    /// The direct-read fast path (bypassing the page cache) is taken for a
    /// whole-page read when no write transaction is open, the page has no
    /// reserved tail, and at least 4 bytes of already-produced output
    /// precede the destination; those bytes are scratch space for the
    /// page's next-pointer and are restored before returning.
    pub(crate) fn access_payload(
        &mut self,
        pgno: Pgno,
        cell_offset: usize,
        cache: &mut Vec<Pgno>,
        offset: u32,
        mut buf: Access<'_>,
    ) -> Result<()> {
        let amt = buf.len() as u32;
        let data = self.pager.get(pgno)?;
        let pg = MemPage::init(pgno, data, self.usable)?;
        let info = pg.parse_cell(data, cell_offset)?;
        if offset.checked_add(amt).map_or(true, |e| e > info.n_payload) {
            return Err(BtreeError::corrupt("payload access out of range"));
        }

        let mut pos = 0usize; // progress through buf
        let mut offset = offset;

        // Local portion first
        if offset < info.n_local {
            let n = ((info.n_local - offset) as usize).min(buf.len());
            let at = info.payload_offset + offset as usize;
            match &mut buf {
                Access::Read(out) => {
                    let data = self.pager.get(pgno)?;
                    out[..n].copy_from_slice(&data[at..at + n]);
                }
                Access::Write(src) => {
                    let data = self.pager.get_mut(pgno)?;
                    data[at..at + n].copy_from_slice(&src[..n]);
                }
            }
            pos += n;
            offset += n as u32;
        }

        if pos == buf.len() {
            return Ok(());
        }

        let per_page = self.usable - 4;
        let page_size = self.pager.page_size();
        while pos < buf.len() {
            let rel = offset - info.n_local;
            let index = (rel / per_page) as usize;
            let in_page = (rel % per_page) as usize;
            let n = (per_page as usize - in_page).min(buf.len() - pos);
            let ovfl = self.overflow_page_at(info.overflow, cache, index)?;

            let mut done = false;
            if let Access::Read(out) = &mut buf {
                // Fast path: a full page read with scratch room before it
                if in_page == 0
                    && n == per_page as usize
                    && pos >= 4
                    && self.usable == page_size
                {
                    let start = pos - 4;
                    let mut saved = [0u8; 4];
                    saved.copy_from_slice(&out[start..pos]);
                    if self.pager.read_direct(ovfl, &mut out[start..]) {
                        let next = get_u32(&out[start..], 0);
                        out[start..pos].copy_from_slice(&saved);
                        if cache.len() == index + 1 && next != 0 {
                            cache.push(next);
                        }
                        done = true;
                    }
                }
                if !done {
                    let data = self.pager.get(ovfl)?;
                    out[pos..pos + n].copy_from_slice(&data[4 + in_page..4 + in_page + n]);
                }
            } else if let Access::Write(src) = &buf {
                let data = self.pager.get_mut(ovfl)?;
                data[4 + in_page..4 + in_page + n].copy_from_slice(&src[pos..pos + n]);
            }

            pos += n;
            offset += n as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::AutoVacuum;
    use crate::space::insert_cell;
    use crate::BtShared;

    const PAGE: u32 = 512;

    fn shared() -> BtShared {
        BtShared::new_for_test(PAGE, AutoVacuum::Off)
    }

    /// Make a fresh leaf-table page and return its number.
    fn new_leaf(bt: &mut BtShared) -> Pgno {
        let pgno = bt.allocate_page(AllocMode::Any).unwrap();
        let usable = bt.usable;
        let data = bt.pager.get_mut(pgno).unwrap();
        crate::page::zero_page(pgno, data, PageType::LeafTable, usable);
        pgno
    }

    fn place_cell(bt: &mut BtShared, pgno: Pgno, cell: &[u8]) -> usize {
        let usable = bt.usable;
        let data = bt.pager.get_mut(pgno).unwrap();
        let mut pg = MemPage::init(pgno, data, usable).unwrap();
        assert!(insert_cell(&mut pg, data, 0, cell, false).unwrap());
        pg.cell_offset(data, 0).unwrap()
    }

    #[test]
    fn test_small_payload_stays_local() {
        let mut bt = shared();
        let leaf = new_leaf(&mut bt);
        let cell = bt
            .fill_in_cell(PageType::LeafTable, leaf, 1, &[7u8; 40])
            .unwrap();
        let offset = place_cell(&mut bt, leaf, &cell);

        let data = bt.pager.get(leaf).unwrap();
        let pg = MemPage::init(leaf, data, bt.usable).unwrap();
        let info = pg.parse_cell(data, offset).unwrap();
        assert_eq!(info.overflow, 0);
        assert_eq!(info.n_local, 40);
    }

    #[test]
    fn test_overflow_chain_length() {
        let mut bt = shared();
        let leaf = new_leaf(&mut bt);
        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let before = bt.pager.page_count();
        let cell = bt
            .fill_in_cell(PageType::LeafTable, leaf, 42, &payload)
            .unwrap();
        let offset = place_cell(&mut bt, leaf, &cell);

        let data = bt.pager.get(leaf).unwrap();
        let pg = MemPage::init(leaf, data, bt.usable).unwrap();
        let info = pg.parse_cell(data, offset).unwrap();
        assert_ne!(info.overflow, 0);

        // Expected chain length for the spilled remainder
        let spilled = payload.len() as u32 - info.n_local;
        let expect = spilled.div_ceil(bt.usable - 4);
        assert_eq!(bt.pager.page_count() - before, expect);
        let _ = offset;
    }

    #[test]
    fn test_payload_round_trip_through_chain() {
        let mut bt = shared();
        let leaf = new_leaf(&mut bt);
        let payload: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
        let cell = bt
            .fill_in_cell(PageType::LeafTable, leaf, 1, &payload)
            .unwrap();
        let offset = place_cell(&mut bt, leaf, &cell);

        let mut cache = Vec::new();
        let mut out = vec![0u8; payload.len()];
        bt.access_payload(leaf, offset, &mut cache, 0, Access::Read(&mut out))
            .unwrap();
        assert_eq!(out, payload);

        // Sub-range read somewhere in the middle of the chain
        let mut mid = vec![0u8; 600];
        bt.access_payload(leaf, offset, &mut cache, 900, Access::Read(&mut mid))
            .unwrap();
        assert_eq!(mid[..], payload[900..1500]);
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_payload_write_through_chain() {
        let mut bt = shared();
        let leaf = new_leaf(&mut bt);
        let payload = vec![0u8; 2500];
        let cell = bt
            .fill_in_cell(PageType::LeafTable, leaf, 1, &payload)
            .unwrap();
        let offset = place_cell(&mut bt, leaf, &cell);

        let patch: Vec<u8> = (0..1000u32).map(|i| (i % 199) as u8 + 1).collect();
        let mut cache = Vec::new();
        bt.access_payload(leaf, offset, &mut cache, 700, Access::Write(&patch))
            .unwrap();

        let mut out = vec![0u8; 2500];
        bt.access_payload(leaf, offset, &mut cache, 0, Access::Read(&mut out))
            .unwrap();
        assert_eq!(out[..700], vec![0u8; 700][..]);
        assert_eq!(out[700..1700], patch[..]);
        assert_eq!(out[1700..], vec![0u8; 800][..]);
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let mut bt = shared();
        let leaf = new_leaf(&mut bt);
        let cell = bt
            .fill_in_cell(PageType::LeafTable, leaf, 1, &[1u8; 40])
            .unwrap();
        let offset = place_cell(&mut bt, leaf, &cell);
        let mut out = vec![0u8; 8];
        assert!(bt
            .access_payload(leaf, offset, &mut Vec::new(), 38, Access::Read(&mut out))
            .is_err());
    }

    #[test]
    fn test_clear_cell_frees_chain() {
        let mut bt = shared();
        let leaf = new_leaf(&mut bt);
        let payload = vec![9u8; 2000];
        let cell = bt
            .fill_in_cell(PageType::LeafTable, leaf, 1, &payload)
            .unwrap();
        let offset = place_cell(&mut bt, leaf, &cell);

        let free_before = bt
            .hdr_get32(crate::header::HDR_FREELIST_COUNT)
            .unwrap();
        bt.clear_cell(leaf, offset).unwrap();
        let free_after = bt.hdr_get32(crate::header::HDR_FREELIST_COUNT).unwrap();

        let data = bt.pager.get(leaf).unwrap();
        let pg = MemPage::init(leaf, data, bt.usable).unwrap();
        let info = pg.parse_cell(data, offset).unwrap();
        let spilled = info.n_payload - info.n_local;
        assert_eq!(free_after - free_before, spilled.div_ceil(bt.usable - 4));
    }

    #[test]
    fn test_autovacuum_chain_records_ptrmap() {
        let mut bt = BtShared::new_for_test(PAGE, AutoVacuum::Incremental);
        let leaf = new_leaf(&mut bt);
        let payload = vec![3u8; 1500];
        let cell = bt
            .fill_in_cell(PageType::LeafTable, leaf, 1, &payload)
            .unwrap();
        let offset = place_cell(&mut bt, leaf, &cell);

        let data = bt.pager.get(leaf).unwrap();
        let pg = MemPage::init(leaf, data, bt.usable).unwrap();
        let info = pg.parse_cell(data, offset).unwrap();

        assert_eq!(
            bt.ptrmap_get(info.overflow).unwrap(),
            (PtrmapType::Overflow1, leaf)
        );
        let next = get_u32(bt.pager.get(info.overflow).unwrap(), 0);
        assert_eq!(
            bt.ptrmap_get(next).unwrap(),
            (PtrmapType::Overflow2, info.overflow)
        );
    }
}
