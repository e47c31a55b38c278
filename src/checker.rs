//! Read-only structural verification of the whole file: page coverage,
//! tree shape, rowid order, overflow chain lengths, free-list accounting,
//! and pointer-map agreement.

use serde::Serialize;

use crate::error::Result;
use crate::header::{get_u16, get_u32, HDR_FREELIST_COUNT, HDR_FREELIST_HEAD};
use crate::page::{MemPage, MAX_DEPTH};
use crate::pager::Pgno;
use crate::vacuum::PtrmapType;
use crate::BtShared;

/// Result of an integrity check.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub errors: Vec<String>,
    pub pages_checked: u32,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Checker {
    /// Reference count per page; every page must end at exactly one
    refs: Vec<u32>,
    errors: Vec<String>,
    max_errors: usize,
}

impl Checker {
    fn error(&mut self, msg: String) {
        if self.errors.len() < self.max_errors {
            self.errors.push(msg);
        }
    }

    fn full(&self) -> bool {
        self.errors.len() >= self.max_errors
    }

    /// Mark a reference to `pgno`; complains about out-of-range and
    /// doubly-referenced pages. Returns false when the page should not be
    /// descended into again.
    fn reference(&mut self, pgno: Pgno, context: &str) -> bool {
        if pgno == 0 || pgno as usize >= self.refs.len() {
            self.error(format!("{context}: page {pgno} out of range"));
            return false;
        }
        self.refs[pgno as usize] += 1;
        if self.refs[pgno as usize] > 1 {
            self.error(format!("{context}: page {pgno} referenced more than once"));
            return false;
        }
        true
    }
}

impl BtShared {
    /// Walk the free-list, marking every trunk and leaf.
    fn check_freelist(&mut self, ck: &mut Checker) -> Result<()> {
        let expected = self.hdr_get32(HDR_FREELIST_COUNT)?;
        let mut seen = 0u32;
        let mut trunk = self.hdr_get32(HDR_FREELIST_HEAD)?;

        while trunk != 0 && !ck.full() {
            if !ck.reference(trunk, "free-list trunk") {
                break;
            }
            seen += 1;
            if self.auto_vacuum.is_enabled() {
                self.check_ptrmap_entry(ck, trunk, PtrmapType::FreePage, 0)?;
            }
            let (next, leaves) = {
                let data = self.pager.get(trunk)?;
                let k = get_u32(data, 4);
                if k > self.usable / 4 - 2 {
                    ck.error(format!("free-list trunk {trunk}: bad leaf count {k}"));
                    return Ok(());
                }
                let leaves: Vec<Pgno> =
                    (0..k as usize).map(|i| get_u32(data, 8 + 4 * i)).collect();
                (get_u32(data, 0), leaves)
            };
            for leaf in leaves {
                ck.reference(leaf, "free-list leaf");
                seen += 1;
                if self.auto_vacuum.is_enabled() {
                    self.check_ptrmap_entry(ck, leaf, PtrmapType::FreePage, 0)?;
                }
            }
            trunk = next;
        }
        if seen != expected {
            ck.error(format!(
                "free-list holds {seen} pages but the header says {expected}"
            ));
        }
        Ok(())
    }

    fn check_ptrmap_entry(
        &mut self,
        ck: &mut Checker,
        pgno: Pgno,
        kind: PtrmapType,
        parent: Pgno,
    ) -> Result<()> {
        match self.ptrmap_get(pgno) {
            Ok((k, p)) if k == kind && p == parent => {}
            Ok((k, p)) => ck.error(format!(
                "page {pgno}: pointer map says ({k:?}, {p}) but the tree says ({kind:?}, {parent})"
            )),
            Err(_) => ck.error(format!("page {pgno}: pointer-map entry unreadable")),
        }
        Ok(())
    }

    /// Verify that cells, freeblocks, and fragments tile the content area
    /// exactly and agree with the derived free-byte count.
    fn check_coverage(&mut self, ck: &mut Checker, pg: &MemPage, data: &[u8]) -> Result<()> {
        let mut spans: Vec<(u32, u32)> = Vec::with_capacity(pg.n_cell as usize + 4);
        for i in 0..pg.n_cell {
            let offset = pg.cell_offset(data, i)? as u32;
            let size = pg.cell_size(data, offset as usize)? as u32;
            spans.push((offset, size));
        }
        let mut pc = pg.first_freeblock as u32;
        while pc != 0 {
            let next = get_u16(data, pc as usize) as u32;
            let size = get_u16(data, pc as usize + 2) as u32;
            spans.push((pc, size));
            pc = next;
        }
        spans.sort_unstable();

        let mut cursor = pg.cell_content;
        let mut frag = 0u32;
        for (start, size) in spans {
            if start < cursor {
                ck.error(format!(
                    "page {}: overlapping allocations at offset {start}",
                    pg.pgno
                ));
                return Ok(());
            }
            frag += start - cursor;
            cursor = start + size;
        }
        if cursor > pg.usable {
            ck.error(format!("page {}: content extends past usable area", pg.pgno));
            return Ok(());
        }
        frag += pg.usable - cursor;
        if frag != pg.frag as u32 {
            ck.error(format!(
                "page {}: {frag} fragment bytes on page, header says {}",
                pg.pgno, pg.frag
            ));
        }
        Ok(())
    }

    /// Recursive tree walk. Returns the leaf depth below this page and
    /// the rowid range it covers (table trees).
    #[allow(clippy::too_many_arguments)]
    fn check_tree_page(
        &mut self,
        ck: &mut Checker,
        pgno: Pgno,
        parent: Option<Pgno>,
        is_root: bool,
        depth: usize,
        min_rowid: Option<i64>,
        max_rowid: Option<i64>,
    ) -> Result<usize> {
        if ck.full() || !ck.reference(pgno, "tree page") {
            return Ok(depth);
        }
        if depth > MAX_DEPTH {
            ck.error(format!("page {pgno}: tree deeper than {MAX_DEPTH}"));
            return Ok(depth);
        }
        if self.auto_vacuum.is_enabled() {
            if is_root {
                self.check_ptrmap_entry(ck, pgno, PtrmapType::RootPage, 0)?;
            } else if let Some(parent) = parent {
                self.check_ptrmap_entry(ck, pgno, PtrmapType::Btree, parent)?;
            }
        }

        let data = self.pager.snapshot(pgno)?;
        let pg = match MemPage::init(pgno, &data, self.usable) {
            Ok(pg) => pg,
            Err(e) => {
                ck.error(format!("page {pgno}: {e}"));
                return Ok(depth);
            }
        };
        self.check_coverage(ck, &pg, &data)?;

        let mut child_depth: Option<usize> = None;
        let mut prev_rowid = min_rowid;

        for i in 0..pg.n_cell {
            let offset = match pg.cell_offset(&data, i) {
                Ok(o) => o,
                Err(e) => {
                    ck.error(format!("page {pgno} cell {i}: {e}"));
                    continue;
                }
            };
            let info = match pg.parse_cell(&data, offset) {
                Ok(info) => info,
                Err(e) => {
                    ck.error(format!("page {pgno} cell {i}: {e}"));
                    continue;
                }
            };

            if pg.page_type.is_table() {
                if let Some(prev) = prev_rowid {
                    let ordered = if pg.page_type.is_leaf() {
                        info.key > prev || (i == 0 && info.key >= prev)
                    } else {
                        info.key >= prev
                    };
                    if !ordered {
                        ck.error(format!(
                            "page {pgno} cell {i}: rowid {} out of order after {prev}",
                            info.key
                        ));
                    }
                }
                prev_rowid = Some(info.key);
                if let Some(max) = max_rowid {
                    if info.key > max {
                        ck.error(format!(
                            "page {pgno} cell {i}: rowid {} above parent divider {max}",
                            info.key
                        ));
                    }
                }
            }

            if info.overflow != 0 {
                self.check_overflow_chain(ck, pgno, &info)?;
            }

            if pg.page_type.is_interior() {
                let child = pg.cell_left_child(&data, offset);
                let d = self.check_tree_page(
                    ck,
                    child,
                    Some(pgno),
                    false,
                    depth + 1,
                    if i == 0 { min_rowid } else { prev_rowid },
                    if pg.page_type.is_table() {
                        Some(info.key)
                    } else {
                        max_rowid
                    },
                )?;
                match child_depth {
                    None => child_depth = Some(d),
                    Some(cd) if cd == d => {}
                    Some(cd) => ck.error(format!(
                        "page {pgno}: child {child} at depth {d}, siblings at {cd}"
                    )),
                }
            }
        }

        if pg.page_type.is_interior() {
            let right = pg.right_child(&data);
            let d =
                self.check_tree_page(ck, right, Some(pgno), false, depth + 1, prev_rowid, max_rowid)?;
            if let Some(cd) = child_depth {
                if cd != d {
                    ck.error(format!(
                        "page {pgno}: rightmost child {right} at depth {d}, siblings at {cd}"
                    ));
                }
            }
            Ok(d)
        } else {
            Ok(depth)
        }
    }

    fn check_overflow_chain(
        &mut self,
        ck: &mut Checker,
        owner: Pgno,
        info: &crate::page::CellInfo,
    ) -> Result<()> {
        let per_page = self.usable - 4;
        let expected = (info.n_payload - info.n_local).div_ceil(per_page);
        let mut cur = info.overflow;
        let mut prev = owner;
        let mut count = 0u32;

        while cur != 0 && count < expected && !ck.full() {
            if !ck.reference(cur, "overflow page") {
                return Ok(());
            }
            if self.auto_vacuum.is_enabled() {
                let kind = if count == 0 {
                    PtrmapType::Overflow1
                } else {
                    PtrmapType::Overflow2
                };
                self.check_ptrmap_entry(ck, cur, kind, prev)?;
            }
            let next = get_u32(self.pager.get(cur)?, 0);
            prev = cur;
            cur = next;
            count += 1;
        }
        if count != expected || cur != 0 {
            ck.error(format!(
                "page {owner}: overflow chain has {count} pages, expected {expected}"
            ));
        }
        Ok(())
    }

    /// Verify the structures rooted at `roots` plus the free-list, then
    /// flag any page that is neither referenced nor free.
    pub(crate) fn integrity_check(
        &mut self,
        roots: &[Pgno],
        max_errors: usize,
    ) -> Result<CheckReport> {
        let n_page = self.pager.page_count();
        let mut ck = Checker {
            refs: vec![0; n_page as usize + 1],
            errors: Vec::new(),
            max_errors: max_errors.max(1),
        };

        // Page 1 belongs to the header / schema tree; pointer-map pages
        // and the pending-byte page are accounted for up front.
        if self.auto_vacuum.is_enabled() {
            for pgno in 2..=n_page {
                if self.is_ptrmap_page(pgno) {
                    ck.reference(pgno, "pointer map");
                }
            }
        }
        let pending = self.pending_page();
        if pending <= n_page {
            ck.reference(pending, "pending-byte page");
        }

        self.check_freelist(&mut ck)?;

        for &root in roots {
            if root == 0 || root > n_page {
                ck.error(format!("root page {root} out of range"));
                continue;
            }
            self.check_tree_page(&mut ck, root, None, true, 0, None, None)?;
        }

        for pgno in 1..=n_page {
            let refs = ck.refs[pgno as usize];
            if refs == 0 && !roots.contains(&pgno) && pgno != 1 {
                ck.error(format!(
                    "page {pgno} is never used (not in any tree or the free-list)"
                ));
            }
        }

        Ok(CheckReport {
            errors: ck.errors,
            pages_checked: n_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Entry;
    use crate::header::AutoVacuum;
    use crate::page::PageType;

    fn populated(av: AutoVacuum) -> (BtShared, Pgno) {
        let mut bt = BtShared::new_for_test(512, av);
        let root = bt.btree_create_root(PageType::LeafTable).unwrap();
        let cur = bt.open_cursor(root, true, None).unwrap();
        let payload = [4u8; 60];
        for rowid in 1..=80i64 {
            bt.cursor_insert(cur, &Entry::Table { rowid, data: &payload }, true, None, false)
                .unwrap();
        }
        bt.close_cursor(cur);
        (bt, root)
    }

    #[test]
    fn test_clean_tree_passes() {
        let (mut bt, root) = populated(AutoVacuum::Off);
        let report = bt.integrity_check(&[root], 100).unwrap();
        assert!(report.ok(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn test_clean_autovacuum_tree_passes() {
        let (mut bt, root) = populated(AutoVacuum::Incremental);
        let report = bt.integrity_check(&[root], 100).unwrap();
        assert!(report.ok(), "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn test_detects_cell_count_corruption() {
        let (mut bt, root) = populated(AutoVacuum::Off);
        // Inflate the cell count of the root page
        {
            let data = bt.pager.get_mut(root).unwrap();
            let pg = MemPage::init(root, data, bt.usable).unwrap();
            let hdr = pg.hdr;
            let bad = pg.n_cell + 7;
            crate::header::put_u16(data, hdr + crate::page::PF_NCELL, bad);
        }
        let report = bt.integrity_check(&[root], 100).unwrap();
        assert!(!report.ok());
    }

    #[test]
    fn test_detects_rowid_disorder() {
        let (mut bt, root) = populated(AutoVacuum::Off);
        // Find a leaf and swap two cell pointers
        let leaf = {
            let data = bt.pager.snapshot(root).unwrap();
            let pg = MemPage::init(root, &data, bt.usable).unwrap();
            if pg.page_type.is_interior() {
                let off = pg.cell_offset(&data, 0).unwrap();
                pg.cell_left_child(&data, off)
            } else {
                root
            }
        };
        {
            let usable = bt.usable;
            let data = bt.pager.get_mut(leaf).unwrap();
            let pg = MemPage::init(leaf, data, usable).unwrap();
            assert!(pg.n_cell >= 2);
            let a = pg.cell_offset(data, 0).unwrap() as u16;
            let b = pg.cell_offset(data, 1).unwrap() as u16;
            pg.set_cell_offset(data, 0, b);
            pg.set_cell_offset(data, 1, a);
        }
        let report = bt.integrity_check(&[root], 100).unwrap();
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("out of order")));
    }

    #[test]
    fn test_detects_orphan_page() {
        let (mut bt, root) = populated(AutoVacuum::Off);
        // Grow the file by a page nothing references
        let n = bt.pager.page_count();
        bt.pager.set_page_count(n + 1).unwrap();
        bt.pager.get_mut_unused(n + 1).unwrap();
        let report = bt.integrity_check(&[root], 100).unwrap();
        assert!(report.errors.iter().any(|e| e.contains("never used")));
    }

    #[test]
    fn test_detects_freelist_count_mismatch() {
        let (mut bt, root) = populated(AutoVacuum::Off);
        let n = bt.hdr_get32(HDR_FREELIST_COUNT).unwrap();
        bt.hdr_put32(HDR_FREELIST_COUNT, n + 3).unwrap();
        let report = bt.integrity_check(&[root], 100).unwrap();
        assert!(report.errors.iter().any(|e| e.contains("free-list")));
    }
}
