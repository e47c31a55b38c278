//! Whole-page allocation: the trunk+leaf free-list and file extension.
//!
//! A trunk page stores the next trunk's page number at offset 0, a leaf
//! count at offset 4, then that many 4-byte leaf page numbers from offset
//! 8. Leaves are pages of arbitrary content awaiting reuse.

use log::debug;

use crate::error::{BtreeError, Result};
use crate::header::{get_u32, put_u32, HDR_FREELIST_COUNT, HDR_FREELIST_HEAD};
use crate::pager::Pgno;
use crate::vacuum::PtrmapType;
use crate::BtShared;

/// Placement preference for `allocate_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Any free page; first leaf of the first trunk, or the trunk itself
    Any,
    /// Exactly this page, which the caller knows to be free
    Exact(Pgno),
    /// Any free page numbered at or below this bound
    Le(Pgno),
}

struct Trunk {
    pgno: Pgno,
    next: Pgno,
    leaves: Vec<Pgno>,
}

impl BtShared {
    fn read_trunk(&mut self, pgno: Pgno) -> Result<Trunk> {
        let max_leaves = self.usable / 4 - 2;
        let data = self.pager.get(pgno)?;
        let next = get_u32(data, 0);
        let k = get_u32(data, 4);
        if k > max_leaves {
            return Err(BtreeError::corrupt("trunk leaf count"));
        }
        let leaves = (0..k as usize)
            .map(|i| get_u32(data, 8 + 4 * i))
            .collect();
        Ok(Trunk { pgno, next, leaves })
    }

    fn write_trunk(&mut self, trunk: &Trunk) -> Result<()> {
        let data = self.pager.get_mut(trunk.pgno)?;
        put_u32(data, 0, trunk.next);
        put_u32(data, 4, trunk.leaves.len() as u32);
        for (i, &leaf) in trunk.leaves.iter().enumerate() {
            put_u32(data, 8 + 4 * i, leaf);
        }
        Ok(())
    }

    fn set_trunk_link(&mut self, prev: Option<Pgno>, next: Pgno) -> Result<()> {
        match prev {
            Some(p) => {
                let data = self.pager.get_mut(p)?;
                put_u32(data, 0, next);
            }
            None => self.hdr_put32(HDR_FREELIST_HEAD, next)?,
        }
        Ok(())
    }

    /// Take `trunk` itself off the list as the allocated page. A trunk
    /// that still carries leaves promotes its first leaf to replace it.
    fn allocate_trunk(&mut self, prev: Option<Pgno>, trunk: &Trunk) -> Result<()> {
        if trunk.leaves.is_empty() {
            self.set_trunk_link(prev, trunk.next)?;
        } else {
            let replacement = Trunk {
                pgno: trunk.leaves[0],
                next: trunk.next,
                leaves: trunk.leaves[1..].to_vec(),
            };
            self.write_trunk(&replacement)?;
            self.set_trunk_link(prev, replacement.pgno)?;
        }
        Ok(())
    }

    fn take_from_freelist(&mut self, mode: AllocMode) -> Result<Option<Pgno>> {
        let mut prev: Option<Pgno> = None;
        let mut trunk_pgno = self.hdr_get32(HDR_FREELIST_HEAD)?;

        while trunk_pgno != 0 {
            if trunk_pgno > self.pager.page_count() {
                return Err(BtreeError::corrupt("trunk page out of range"));
            }
            let trunk = self.read_trunk(trunk_pgno)?;

            // The trunk page itself satisfies an exact request, and an
            // Any request when it carries no leaves.
            let want_trunk = match mode {
                AllocMode::Exact(nearby) => trunk.pgno == nearby,
                AllocMode::Any => trunk.leaves.is_empty(),
                AllocMode::Le(_) => false,
            };
            if want_trunk {
                self.allocate_trunk(prev, &trunk)?;
                return Ok(Some(trunk.pgno));
            }

            let found = trunk.leaves.iter().position(|&leaf| match mode {
                AllocMode::Any => true,
                AllocMode::Exact(nearby) => leaf == nearby,
                AllocMode::Le(bound) => leaf <= bound,
            });
            if let Some(i) = found {
                let leaf = trunk.leaves[i];
                if leaf < 2 || leaf > self.pager.page_count() {
                    return Err(BtreeError::corrupt("free-list leaf out of range"));
                }
                let mut updated = trunk;
                updated.leaves.remove(i);
                self.write_trunk(&updated)?;
                return Ok(Some(leaf));
            }

            // A bounded request falls back to the trunk itself, promoting
            // its first leaf (if any) to keep the chain intact
            if let AllocMode::Le(bound) = mode {
                if trunk.pgno <= bound {
                    self.allocate_trunk(prev, &trunk)?;
                    return Ok(Some(trunk.pgno));
                }
            }

            prev = Some(trunk.pgno);
            trunk_pgno = trunk.next;
        }
        Ok(None)
    }

    /// Allocate a page, preferring the free-list and extending the file
    /// otherwise. Pointer-map pages and the pending-byte page are skipped
    /// silently when the file grows.
    pub(crate) fn allocate_page(&mut self, mode: AllocMode) -> Result<Pgno> {
        let n_free = self.hdr_get32(HDR_FREELIST_COUNT)?;
        if n_free > 0 {
            if let Some(pgno) = self.take_from_freelist(mode)? {
                self.hdr_put32(HDR_FREELIST_COUNT, n_free - 1)?;
                debug!("allocated page {} from free-list", pgno);
                return Ok(pgno);
            }
        }
        match mode {
            // The caller established these pages were free; a miss means
            // the list and the pointer map disagree.
            AllocMode::Exact(_) | AllocMode::Le(_) => {
                return Err(BtreeError::corrupt("requested free page not on list"))
            }
            AllocMode::Any => {}
        }

        // Extend the file
        if self.pager.page_count() >= Pgno::MAX - 2 {
            return Err(BtreeError::Full);
        }
        let mut pgno = self.pager.page_count() + 1;
        if pgno == self.pending_page() {
            self.pager.set_page_count(pgno)?;
            pgno += 1;
        }
        if self.auto_vacuum.is_enabled() && self.ptrmap_pgno(pgno) == pgno {
            // The pointer-map page comes first, then the data page
            self.pager.set_page_count(pgno)?;
            self.pager.get_mut_unused(pgno)?.fill(0);
            pgno += 1;
            if pgno == self.pending_page() {
                self.pager.set_page_count(pgno)?;
                pgno += 1;
            }
        }
        self.pager.set_page_count(pgno)?;
        self.pager.get_mut_unused(pgno)?.fill(0);
        debug!("extended file to page {}", pgno);
        Ok(pgno)
    }

    /// Historically-conservative cap on leaves per trunk, retained for
    /// file compatibility.
    pub(crate) fn max_trunk_leaves(&self) -> u32 {
        self.usable / 4 - 8
    }

    /// Put `pgno` on the free-list.
    pub(crate) fn free_page(&mut self, pgno: Pgno) -> Result<()> {
        if pgno < 2 || pgno > self.pager.page_count() || pgno == self.pending_page() {
            return Err(BtreeError::corrupt("freeing invalid page"));
        }

        let n_free = self.hdr_get32(HDR_FREELIST_COUNT)?;
        self.hdr_put32(HDR_FREELIST_COUNT, n_free + 1)?;

        if self.secure_delete {
            self.pager.get_mut(pgno)?.fill(0);
        }
        if self.auto_vacuum.is_enabled() {
            self.ptrmap_put(pgno, PtrmapType::FreePage, 0)?;
        }
        // A read of this page inside the transaction can no longer be
        // skipped; its content now matters for rollback.
        self.has_content.insert(pgno);

        let head = self.hdr_get32(HDR_FREELIST_HEAD)?;
        if head == 0 {
            self.write_trunk(&Trunk {
                pgno,
                next: 0,
                leaves: Vec::new(),
            })?;
            self.hdr_put32(HDR_FREELIST_HEAD, pgno)?;
            debug!("page {} becomes first free-list trunk", pgno);
            return Ok(());
        }

        let trunk = self.read_trunk(head)?;
        if (trunk.leaves.len() as u32) < self.max_trunk_leaves() {
            let k = trunk.leaves.len();
            let data = self.pager.get_mut(head)?;
            put_u32(data, 4, k as u32 + 1);
            put_u32(data, 8 + 4 * k, pgno);
            debug!("page {} freed as leaf of trunk {}", pgno, head);
        } else {
            self.write_trunk(&Trunk {
                pgno,
                next: head,
                leaves: Vec::new(),
            })?;
            self.hdr_put32(HDR_FREELIST_HEAD, pgno)?;
            debug!("page {} becomes new first trunk before {}", pgno, head);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::AutoVacuum;
    use crate::BtShared;

    fn shared() -> BtShared {
        BtShared::new_for_test(512, AutoVacuum::Off)
    }

    #[test]
    fn test_extend_when_freelist_empty() {
        let mut bt = shared();
        let before = bt.pager.page_count();
        let pgno = bt.allocate_page(AllocMode::Any).unwrap();
        assert_eq!(pgno, before + 1);
        assert_eq!(bt.pager.page_count(), before + 1);
    }

    #[test]
    fn test_free_then_reuse() {
        let mut bt = shared();
        let a = bt.allocate_page(AllocMode::Any).unwrap();
        let b = bt.allocate_page(AllocMode::Any).unwrap();
        bt.free_page(a).unwrap();
        assert_eq!(bt.hdr_get32(HDR_FREELIST_COUNT).unwrap(), 1);
        assert_eq!(bt.hdr_get32(HDR_FREELIST_HEAD).unwrap(), a);

        // The freed page was promoted to trunk; an Any allocation takes it
        let again = bt.allocate_page(AllocMode::Any).unwrap();
        assert_eq!(again, a);
        assert_eq!(bt.hdr_get32(HDR_FREELIST_COUNT).unwrap(), 0);
        assert_eq!(bt.hdr_get32(HDR_FREELIST_HEAD).unwrap(), 0);
        let _ = b;
    }

    #[test]
    fn test_leaves_attach_to_trunk() {
        let mut bt = shared();
        let pages: Vec<Pgno> = (0..4)
            .map(|_| bt.allocate_page(AllocMode::Any).unwrap())
            .collect();
        for &p in &pages {
            bt.free_page(p).unwrap();
        }
        // First freed page is the trunk, the rest its leaves
        assert_eq!(bt.hdr_get32(HDR_FREELIST_HEAD).unwrap(), pages[0]);
        let trunk = bt.read_trunk(pages[0]).unwrap();
        assert_eq!(trunk.leaves, pages[1..].to_vec());
        assert_eq!(bt.hdr_get32(HDR_FREELIST_COUNT).unwrap(), 4);
    }

    #[test]
    fn test_exact_allocation_finds_leaf() {
        let mut bt = shared();
        let pages: Vec<Pgno> = (0..4)
            .map(|_| bt.allocate_page(AllocMode::Any).unwrap())
            .collect();
        for &p in &pages {
            bt.free_page(p).unwrap();
        }
        let want = pages[2];
        assert_eq!(bt.allocate_page(AllocMode::Exact(want)).unwrap(), want);
        let trunk = bt.read_trunk(pages[0]).unwrap();
        assert!(!trunk.leaves.contains(&want));
        assert_eq!(bt.hdr_get32(HDR_FREELIST_COUNT).unwrap(), 3);
    }

    #[test]
    fn test_exact_allocation_of_trunk_promotes_leaf() {
        let mut bt = shared();
        let pages: Vec<Pgno> = (0..3)
            .map(|_| bt.allocate_page(AllocMode::Any).unwrap())
            .collect();
        for &p in &pages {
            bt.free_page(p).unwrap();
        }
        // pages[0] is the trunk with leaves pages[1], pages[2]
        assert_eq!(bt.allocate_page(AllocMode::Exact(pages[0])).unwrap(), pages[0]);
        assert_eq!(bt.hdr_get32(HDR_FREELIST_HEAD).unwrap(), pages[1]);
        let trunk = bt.read_trunk(pages[1]).unwrap();
        assert_eq!(trunk.leaves, vec![pages[2]]);
    }

    #[test]
    fn test_le_allocation_respects_bound() {
        let mut bt = shared();
        let pages: Vec<Pgno> = (0..4)
            .map(|_| bt.allocate_page(AllocMode::Any).unwrap())
            .collect();
        for &p in &pages[1..] {
            bt.free_page(p).unwrap();
        }
        let bound = pages[2];
        let got = bt.allocate_page(AllocMode::Le(bound)).unwrap();
        assert!(got <= bound);
    }

    #[test]
    fn test_exact_miss_is_corrupt() {
        let mut bt = shared();
        let a = bt.allocate_page(AllocMode::Any).unwrap();
        bt.free_page(a).unwrap();
        assert!(matches!(
            bt.allocate_page(AllocMode::Exact(a + 10)),
            Err(BtreeError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_trunk_overflow_starts_new_trunk() {
        let mut bt = shared();
        let cap = bt.max_trunk_leaves() as usize;
        let pages: Vec<Pgno> = (0..cap + 2)
            .map(|_| bt.allocate_page(AllocMode::Any).unwrap())
            .collect();
        for &p in &pages {
            bt.free_page(p).unwrap();
        }
        // pages[0] filled with `cap` leaves, then pages[cap+1] became the
        // new first trunk pointing at pages[0]
        let head = bt.hdr_get32(HDR_FREELIST_HEAD).unwrap();
        assert_eq!(head, pages[cap + 1]);
        let new_trunk = bt.read_trunk(head).unwrap();
        assert_eq!(new_trunk.next, pages[0]);
        let old_trunk = bt.read_trunk(pages[0]).unwrap();
        assert_eq!(old_trunk.leaves.len(), cap);
    }
}
