//! Auto-vacuum: the pointer map and the file-shrinking steps.
//!
//! Under auto-vacuum, every `(usable/5)+1` pages the next page is a
//! pointer-map page: a dense array of 5-byte entries (type byte plus
//! 4-byte parent page) covering the pages that follow it.

use log::debug;

use crate::error::{BtreeError, Result};
use crate::freelist::AllocMode;
use crate::header::{
    get_u32, put_u32, HDR_FREELIST_COUNT, HDR_FREELIST_HEAD, HDR_LARGEST_ROOT,
};
use crate::page::MemPage;
use crate::pager::Pgno;
use crate::BtShared;

/// What a pointer-map entry says about a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrmapType {
    /// A B-tree root; the parent field is zero
    RootPage,
    /// On the free-list
    FreePage,
    /// First page of an overflow chain; parent is the B-tree page whose
    /// cell points at it
    Overflow1,
    /// Later page of an overflow chain; parent is the previous page
    Overflow2,
    /// Child of a B-tree interior page
    Btree,
}

impl PtrmapType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PtrmapType::RootPage),
            2 => Some(PtrmapType::FreePage),
            3 => Some(PtrmapType::Overflow1),
            4 => Some(PtrmapType::Overflow2),
            5 => Some(PtrmapType::Btree),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PtrmapType::RootPage => 1,
            PtrmapType::FreePage => 2,
            PtrmapType::Overflow1 => 3,
            PtrmapType::Overflow2 => 4,
            PtrmapType::Btree => 5,
        }
    }
}

impl BtShared {
    /// Pages covered by one pointer-map page, plus the map page itself.
    fn pages_per_map(&self) -> u32 {
        self.usable / 5 + 1
    }

    /// The pointer-map page holding the entry for `pgno`.
    pub(crate) fn ptrmap_pgno(&self, pgno: Pgno) -> Pgno {
        let group = pgno.saturating_sub(2) / self.pages_per_map();
        let mut map = group * self.pages_per_map() + 2;
        if map == self.pending_page() {
            map += 1;
        }
        map
    }

    /// Whether `pgno` is itself a pointer-map page.
    pub(crate) fn is_ptrmap_page(&self, pgno: Pgno) -> bool {
        pgno >= 2 && self.ptrmap_pgno(pgno) == pgno
    }

    /// Record `(kind, parent)` for `pgno` in the pointer map.
    pub(crate) fn ptrmap_put(&mut self, pgno: Pgno, kind: PtrmapType, parent: Pgno) -> Result<()> {
        if pgno < 2 {
            return Err(BtreeError::corrupt("pointer-map key"));
        }
        let map = self.ptrmap_pgno(pgno);
        if map == pgno {
            return Err(BtreeError::corrupt("pointer-map entry for map page"));
        }
        let offset = 5 * (pgno - map - 1) as usize;
        let data = self.pager.get_mut(map)?;
        if offset + 5 > data.len() {
            return Err(BtreeError::corrupt("pointer-map offset"));
        }
        data[offset] = kind.as_u8();
        put_u32(data, offset + 1, parent);
        Ok(())
    }

    /// Look up the pointer-map entry for `pgno`.
    pub(crate) fn ptrmap_get(&mut self, pgno: Pgno) -> Result<(PtrmapType, Pgno)> {
        if pgno < 2 {
            return Err(BtreeError::corrupt("pointer-map key"));
        }
        let map = self.ptrmap_pgno(pgno);
        if map == pgno {
            return Err(BtreeError::corrupt("pointer-map entry for map page"));
        }
        let offset = 5 * (pgno - map - 1) as usize;
        let data = self.pager.get(map)?;
        if offset + 5 > data.len() {
            return Err(BtreeError::corrupt("pointer-map offset"));
        }
        let kind = PtrmapType::from_u8(data[offset])
            .ok_or(BtreeError::corrupt("pointer-map entry type"))?;
        let parent = get_u32(data, offset + 1);
        Ok((kind, parent))
    }

    /// Refresh the pointer-map entries for everything `pgno` points at:
    /// child pages and first overflow pages of its cells, plus the
    /// rightmost child.
    pub(crate) fn set_child_ptrmaps(&mut self, pgno: Pgno) -> Result<()> {
        let data = self.pager.snapshot(pgno)?;
        let pg = MemPage::init(pgno, &data, self.usable)?;
        for i in 0..pg.n_cell {
            let offset = pg.cell_offset(&data, i)?;
            if pg.page_type.is_interior() {
                let child = pg.cell_left_child(&data, offset);
                self.ptrmap_put(child, PtrmapType::Btree, pgno)?;
            }
            let info = pg.parse_cell(&data, offset)?;
            if info.overflow != 0 {
                self.ptrmap_put(info.overflow, PtrmapType::Overflow1, pgno)?;
            }
        }
        if pg.page_type.is_interior() {
            let right = pg.right_child(&data);
            self.ptrmap_put(right, PtrmapType::Btree, pgno)?;
        }
        Ok(())
    }

    /// Point the parent's reference at `from` to `to` instead: either a
    /// child pointer of an interior page or the rightmost pointer.
    fn rewrite_child_ptr(&mut self, parent: Pgno, from: Pgno, to: Pgno) -> Result<()> {
        let data = self.pager.snapshot(parent)?;
        let pg = MemPage::init(parent, &data, self.usable)?;
        for i in 0..pg.n_cell {
            let offset = pg.cell_offset(&data, i)?;
            if pg.cell_left_child(&data, offset) == from {
                let live = self.pager.get_mut(parent)?;
                pg.set_cell_left_child(live, offset, to);
                return Ok(());
            }
        }
        if pg.right_child(&data) == from {
            let live = self.pager.get_mut(parent)?;
            pg.set_right_child(live, to);
            return Ok(());
        }
        Err(BtreeError::corrupt("relocated page not referenced by parent"))
    }

    /// Rewrite the overflow pointer of the cell on `parent` that points at
    /// `from`.
    fn rewrite_overflow_ptr(&mut self, parent: Pgno, from: Pgno, to: Pgno) -> Result<()> {
        let data = self.pager.snapshot(parent)?;
        let pg = MemPage::init(parent, &data, self.usable)?;
        for i in 0..pg.n_cell {
            let offset = pg.cell_offset(&data, i)?;
            let info = pg.parse_cell(&data, offset)?;
            if info.overflow == from {
                let at = info.payload_offset + info.n_local as usize;
                let live = self.pager.get_mut(parent)?;
                put_u32(live, at, to);
                return Ok(());
            }
        }
        Err(BtreeError::corrupt("relocated overflow not referenced"))
    }

    /// Move the page at `from` into the free slot `to`, rewriting every
    /// pointer into `from` and the affected pointer-map entries.
    pub(crate) fn relocate_page(
        &mut self,
        from: Pgno,
        kind: PtrmapType,
        parent: Pgno,
        to: Pgno,
    ) -> Result<()> {
        debug!("relocate page {} -> {} ({:?})", from, to, kind);
        self.pager.move_page(from, to)?;

        match kind {
            PtrmapType::Btree | PtrmapType::RootPage => {
                if kind == PtrmapType::Btree {
                    self.rewrite_child_ptr(parent, from, to)?;
                }
                self.set_child_ptrmaps(to)?;
                if kind == PtrmapType::RootPage {
                    // Root bookkeeping follows the page
                    let largest = self.hdr_get32(HDR_LARGEST_ROOT)?;
                    if largest == from {
                        self.hdr_put32(HDR_LARGEST_ROOT, to)?;
                    }
                }
            }
            PtrmapType::Overflow1 => {
                self.rewrite_overflow_ptr(parent, from, to)?;
                self.relink_overflow_successor(to)?;
            }
            PtrmapType::Overflow2 => {
                let prev = self.pager.get_mut(parent)?;
                put_u32(prev, 0, to);
                self.relink_overflow_successor(to)?;
            }
            PtrmapType::FreePage => {
                return Err(BtreeError::corrupt("relocating a free page"));
            }
        }
        self.ptrmap_put(to, kind, parent)?;
        Ok(())
    }

    fn relink_overflow_successor(&mut self, pgno: Pgno) -> Result<()> {
        let next = get_u32(self.pager.get(pgno)?, 0);
        if next != 0 {
            self.ptrmap_put(next, PtrmapType::Overflow2, pgno)?;
        }
        Ok(())
    }

    /// Predicted database size after a full vacuum, accounting for the
    /// pointer-map pages freed as the file shrinks and skipping the
    /// pending-byte page.
    pub(crate) fn final_db_size(&self, n_orig: Pgno, n_free: Pgno) -> Pgno {
        let n_entry = (self.usable / 5) as i64;
        let n_ptrmap = (n_free as i64 - n_orig as i64
            + self.ptrmap_pgno(n_orig) as i64
            + n_entry)
            / n_entry;
        let mut n_fin = n_orig as i64 - n_free as i64 - n_ptrmap;
        let pending = self.pending_page() as i64;
        if n_orig as i64 > pending && n_fin < pending {
            n_fin -= 1;
        }
        while n_fin > 0 && (self.is_ptrmap_page(n_fin as Pgno) || n_fin == pending) {
            n_fin -= 1;
        }
        n_fin.max(1) as Pgno
    }

    /// One step of vacuuming: detach the last page of the file and shrink
    /// by one. `commit` steers replacement allocation below `n_fin` for
    /// commit-time compaction.
    pub(crate) fn incr_vacuum_step(&mut self, n_fin: Pgno, commit: bool) -> Result<()> {
        let last = self.pager.page_count();
        if last <= n_fin {
            return Err(BtreeError::Done);
        }

        if last != self.pending_page() && !self.is_ptrmap_page(last) {
            let n_free = self.hdr_get32(HDR_FREELIST_COUNT)?;
            if n_free == 0 {
                return Err(BtreeError::Done);
            }
            let (kind, parent) = self.ptrmap_get(last)?;
            if kind == PtrmapType::FreePage {
                // Pop it straight off the free-list
                let got = self.allocate_page(AllocMode::Exact(last))?;
                debug_assert_eq!(got, last);
            } else {
                let bound = if commit { n_fin } else { last - 1 };
                let target = self.allocate_page(AllocMode::Le(bound))?;
                self.relocate_page(last, kind, parent, target)?;
            }
        }

        self.pager.set_page_count(last - 1)?;
        Ok(())
    }

    /// One user-visible incremental-vacuum step. Returns `Done` when the
    /// file is as small as the free-list allows.
    pub(crate) fn incr_vacuum(&mut self) -> Result<()> {
        let n_orig = self.pager.page_count();
        let n_free = self.hdr_get32(HDR_FREELIST_COUNT)?;
        let n_fin = self.final_db_size(n_orig, n_free);
        if n_free == 0 || n_orig <= n_fin {
            return Err(BtreeError::Done);
        }
        self.incr_vacuum_step(n_fin, false)
    }

    /// Commit-time compaction for full auto-vacuum: relocate everything
    /// above the final size, then drop the whole free-list.
    pub(crate) fn auto_vacuum_commit(&mut self) -> Result<()> {
        let n_orig = self.pager.page_count();
        let n_free = self.hdr_get32(HDR_FREELIST_COUNT)?;
        if n_free == 0 {
            return Ok(());
        }
        let n_fin = self.final_db_size(n_orig, n_free);
        if n_fin > n_orig {
            return Err(BtreeError::corrupt("vacuum size prediction"));
        }
        debug!("auto-vacuum commit: {} -> {} pages", n_orig, n_fin);
        while self.pager.page_count() > n_fin {
            match self.incr_vacuum_step(n_fin, true) {
                Ok(()) => {}
                Err(BtreeError::Done) => break,
                Err(e) => return Err(e),
            }
        }
        self.hdr_put32(HDR_FREELIST_HEAD, 0)?;
        self.hdr_put32(HDR_FREELIST_COUNT, 0)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::AutoVacuum;
    use crate::BtShared;

    fn shared() -> BtShared {
        BtShared::new_for_test(512, AutoVacuum::Incremental)
    }

    #[test]
    fn test_ptrmap_page_placement() {
        let bt = shared();
        // usable 512: one map page covers 102 pages, so maps sit at 2,
        // 105, 208, ...
        assert!(bt.is_ptrmap_page(2));
        assert!(!bt.is_ptrmap_page(3));
        assert_eq!(bt.ptrmap_pgno(3), 2);
        assert_eq!(bt.ptrmap_pgno(104), 2);
        assert!(bt.is_ptrmap_page(105));
        assert_eq!(bt.ptrmap_pgno(106), 105);
    }

    #[test]
    fn test_ptrmap_round_trip() {
        let mut bt = shared();
        // The first allocation creates the map page at 2 and lands on 3
        let pgno = bt.allocate_page(crate::freelist::AllocMode::Any).unwrap();
        assert_eq!(pgno, 3);
        bt.ptrmap_put(pgno, PtrmapType::RootPage, 0).unwrap();
        assert_eq!(bt.ptrmap_get(pgno).unwrap(), (PtrmapType::RootPage, 0));
        bt.ptrmap_put(pgno, PtrmapType::Overflow2, 9).unwrap();
        assert_eq!(bt.ptrmap_get(pgno).unwrap(), (PtrmapType::Overflow2, 9));
    }

    #[test]
    fn test_ptrmap_rejects_map_page_key() {
        let mut bt = shared();
        assert!(bt.ptrmap_put(2, PtrmapType::Btree, 1).is_err());
        assert!(bt.ptrmap_get(2).is_err());
    }

    #[test]
    fn test_allocation_skips_ptrmap_pages() {
        let mut bt = shared();
        // Fresh auto-vacuum database: page 1 only. The first allocation
        // creates the map page at 2 in passing; none may land on a map
        // page.
        for _ in 0..120 {
            let pgno = bt.allocate_page(crate::freelist::AllocMode::Any).unwrap();
            assert!(!bt.is_ptrmap_page(pgno), "allocated map page {pgno}");
        }
        // The second map page was created in passing
        assert!(bt.pager.page_count() >= 105);
    }

    #[test]
    fn test_final_db_size_small_file() {
        let bt = shared();
        // 50-page file with 10 free pages: no map page is crossed going
        // down, so only the free pages vanish
        let n_fin = bt.final_db_size(50, 10);
        assert_eq!(n_fin, 40);
    }

    #[test]
    fn test_final_db_size_drops_map_page() {
        let bt = shared();
        // Shrinking from 110 below the map page at 105 frees that map
        // page as well
        let n_fin = bt.final_db_size(110, 10);
        assert!(n_fin < 100);
        assert!(!bt.is_ptrmap_page(n_fin));
    }

    #[test]
    fn test_incr_vacuum_done_when_no_free_pages() {
        let mut bt = shared();
        assert!(matches!(bt.incr_vacuum(), Err(BtreeError::Done)));
    }

    #[test]
    fn test_incr_vacuum_pops_trailing_free_page() {
        let mut bt = shared();
        let a = bt.allocate_page(crate::freelist::AllocMode::Any).unwrap();
        bt.ptrmap_put(a, PtrmapType::RootPage, 0).unwrap();
        let b = bt.allocate_page(crate::freelist::AllocMode::Any).unwrap();
        bt.free_page(b).unwrap();

        let before = bt.pager.page_count();
        bt.incr_vacuum().unwrap();
        assert_eq!(bt.pager.page_count(), before - 1);
        assert_eq!(bt.hdr_get32(HDR_FREELIST_COUNT).unwrap(), 0);
        assert!(matches!(bt.incr_vacuum(), Err(BtreeError::Done)));
    }
}
