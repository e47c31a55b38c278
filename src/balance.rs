//! Tree balancing: splitting overfull pages, merging underfull ones, and
//! redistributing cells across up to three siblings.
//!
//! Pages are value types here: every output page is rebuilt from an
//! assembled cell array, so the in-place editing order constraints of an
//! incremental approach never arise.

use log::{debug, trace};

use crate::error::{BtreeError, Result};
use crate::freelist::AllocMode;
use crate::header::get_u32;
use crate::page::{zero_page, MemPage, PageType};
use crate::pager::Pgno;
use crate::space::insert_cell;
use crate::vacuum::PtrmapType;
use crate::varint::{parse_varint, push_varint};
use crate::BtShared;

/// Sibling window width for the general rebalance.
const NB: usize = 3;

impl BtShared {
    /// Rebalance the tree along the cursor's current path, from the leaf
    /// upward, until every touched page is neither overfull nor below the
    /// minimum fill. On failure the cursor is invalidated and the caller
    /// must roll back before writing again.
    pub(crate) fn balance(&mut self, id: usize) -> Result<()> {
        let mut path = self.cur(id)?.stack.clone();
        if path.is_empty() {
            return Ok(());
        }
        let result = self.balance_path(&mut path);
        if result.is_err() {
            let cur = self.cur_mut(id)?;
            cur.stack.clear();
            cur.info = None;
            cur.ovfl_cache.clear();
            cur.saved_key = None;
            cur.state = crate::cursor::CursorState::Invalid;
        }
        result
    }

    fn balance_path(&mut self, path: &mut Vec<(Pgno, u16)>) -> Result<()> {
        let mut level = path.len() - 1;
        loop {
            let pgno = path[level].0;
            let has_overlay = self.pending.contains_key(&pgno);

            if level == 0 {
                if !has_overlay {
                    break;
                }
                let child = self.balance_deeper(pgno)?;
                path.insert(1, (child, 0));
                path[0].1 = 0;
                level = 1;
                continue;
            }

            let pg = self.load_page(pgno)?;
            let underfull = pg.n_free as u64 * 3 > self.usable as u64 * 2;
            if !has_overlay && !underfull {
                // An ancestor may still carry an overlay (a divider that
                // did not fit); keep ascending until everything settles
                let ancestors_pending = path[..level]
                    .iter()
                    .any(|(p, _)| self.pending.contains_key(p));
                if !ancestors_pending {
                    break;
                }
                level -= 1;
                continue;
            }

            if has_overlay && self.can_balance_quick(path, level, &pg)? {
                self.balance_quick(path, level)?;
            } else {
                self.balance_nonroot(path, level)?;
            }
            level -= 1;
        }
        debug_assert!(self.pending.is_empty());
        Ok(())
    }

    /// Logical cell sequence of a page: its physical cells with any
    /// pending overlay spliced in at the recorded positions.
    fn merged_cells(&mut self, pgno: Pgno, overlay: &[(u16, Vec<u8>)]) -> Result<Vec<Vec<u8>>> {
        let data = self.pager.snapshot(pgno)?;
        let pg = MemPage::init(pgno, &data, self.usable)?;
        let total = pg.n_cell as usize + overlay.len();
        let mut out = Vec::with_capacity(total);
        let mut ov = overlay.iter().peekable();
        let mut phys: u16 = 0;
        for logical in 0..total {
            if let Some((idx, cell)) = ov.peek() {
                if *idx as usize <= logical {
                    out.push(cell.clone());
                    ov.next();
                    continue;
                }
            }
            if phys >= pg.n_cell {
                return Err(BtreeError::corrupt("overlay index out of range"));
            }
            let offset = pg.cell_offset(&data, phys)?;
            let size = pg.cell_size(&data, offset)?;
            out.push(data[offset..offset + size as usize].to_vec());
            phys += 1;
        }
        Ok(out)
    }

    /// Format `pgno` as a fresh page of `page_type` holding `cells` in
    /// order. Fails if they do not fit; callers pack within capacity.
    fn rebuild_page(
        &mut self,
        pgno: Pgno,
        page_type: PageType,
        cells: &[Vec<u8>],
        right_child: Option<Pgno>,
    ) -> Result<()> {
        let usable = self.usable;
        let secure = self.secure_delete;
        let data = self.new_page_buffer(pgno)?;
        if secure {
            data.fill(0);
        }
        let mut pg = zero_page(pgno, data, page_type, usable);
        for (i, cell) in cells.iter().enumerate() {
            if !insert_cell(&mut pg, data, i as u16, cell, secure)? {
                return Err(BtreeError::corrupt("rebuilt page overfull"));
            }
        }
        if let Some(right) = right_child {
            pg.set_right_child(data, right);
        }
        Ok(())
    }

    /// When the root itself cannot hold its cells, push its entire
    /// content down into a fresh child and turn the root into an interior
    /// page with that sole child. The root's page number never changes.
    fn balance_deeper(&mut self, root: Pgno) -> Result<Pgno> {
        let overlay = self.pending.remove(&root).unwrap_or_default();
        let cells = self.merged_cells(root, &overlay)?;
        let usable = self.usable;
        let (root_type, old_right) = {
            let data = self.pager.get(root)?;
            let pg = MemPage::init(root, data, usable)?;
            let right = if pg.page_type.is_interior() {
                Some(pg.right_child(data))
            } else {
                None
            };
            (pg.page_type, right)
        };

        let child = self.allocate_page(AllocMode::Any)?;
        debug!("balance_deeper: root {} grows child {}", root, child);

        // Seed the child empty, then feed the cells through the overlay
        // path; what does not fit becomes the child's pending overlay and
        // the general rebalance picks it up.
        self.rebuild_page(child, root_type, &[], old_right)?;
        for (i, cell) in cells.into_iter().enumerate() {
            self.insert_cell_or_overlay(child, i as u16, cell)?;
        }

        {
            let data = self.pager.get_mut(root)?;
            let mut pg = zero_page(root, data, root_type.as_interior(), usable);
            pg.set_right_child(data, child);
        }
        if self.auto_vacuum.is_enabled() {
            self.ptrmap_put(child, PtrmapType::Btree, root)?;
            self.set_child_ptrmaps(child)?;
        }
        Ok(child)
    }

    /// The append fast path is legal when a lone overflow cell lands past
    /// the last cell of the rightmost leaf of a table tree, under a
    /// non-root parent.
    fn can_balance_quick(
        &mut self,
        path: &[(Pgno, u16)],
        level: usize,
        pg: &MemPage,
    ) -> Result<bool> {
        if level < 2 || pg.page_type != PageType::LeafTable || pg.n_cell == 0 {
            return Ok(false);
        }
        let overlay = match self.pending.get(&pg.pgno) {
            Some(o) => o,
            None => return Ok(false),
        };
        if overlay.len() != 1 || overlay[0].0 != pg.n_cell {
            return Ok(false);
        }
        let (parent_pgno, parent_idx) = path[level - 1];
        if self.pending.contains_key(&parent_pgno) {
            return Ok(false);
        }
        let parent = self.load_page(parent_pgno)?;
        Ok(parent_idx == parent.n_cell)
    }

    /// Append fast path: put the overflowing cell on a brand-new
    /// rightmost leaf and add one divider to the parent.
    fn balance_quick(&mut self, path: &[(Pgno, u16)], level: usize) -> Result<()> {
        let pgno = path[level].0;
        let (parent_pgno, parent_idx) = path[level - 1];
        let mut overlay = self
            .pending
            .remove(&pgno)
            .ok_or(BtreeError::corrupt("missing overflow cell"))?;
        let (_, cell) = overlay.pop().ok_or(BtreeError::corrupt("missing overflow cell"))?;

        let new_pgno = self.allocate_page(AllocMode::Any)?;
        trace!("balance_quick: new rightmost leaf {}", new_pgno);
        self.rebuild_page(new_pgno, PageType::LeafTable, &[cell.clone()], None)?;

        // Divider keyed by the old page's largest rowid, still pointing
        // at the old page
        let largest = {
            let data = self.pager.get(pgno)?;
            let pg = MemPage::init(pgno, data, self.usable)?;
            let offset = pg.cell_offset(data, pg.n_cell - 1)?;
            pg.parse_cell(data, offset)?.key
        };
        let mut divider = Vec::with_capacity(13);
        divider.extend_from_slice(&pgno.to_be_bytes());
        push_varint(&mut divider, largest as u64);

        {
            let data = self.pager.get_mut(parent_pgno)?;
            let pg = MemPage::init(parent_pgno, data, self.usable)?;
            pg.set_right_child(data, new_pgno);
        }
        self.insert_cell_or_overlay(parent_pgno, parent_idx, divider)?;

        if self.auto_vacuum.is_enabled() {
            self.ptrmap_put(new_pgno, PtrmapType::Btree, parent_pgno)?;
            let data = self.pager.snapshot(new_pgno)?;
            let pg = MemPage::init(new_pgno, &data, self.usable)?;
            let offset = pg.cell_offset(&data, 0)?;
            let info = pg.parse_cell(&data, offset)?;
            if info.overflow != 0 {
                self.ptrmap_put(info.overflow, PtrmapType::Overflow1, new_pgno)?;
            }
        }
        Ok(())
    }

    /// General rebalance of the page at `level` together with up to two
    /// neighbours: gather every cell (and the dividers between them),
    /// repack greedily, shuffle the boundaries rightward, renumber the
    /// output pages ascending, rebuild them, and rewrite the parent's
    /// dividers.
    fn balance_nonroot(&mut self, path: &[(Pgno, u16)], level: usize) -> Result<()> {
        let usable = self.usable;
        let tree_root = path[0].0;
        let (parent_pgno, parent_idx) = path[level - 1];

        // Parent's logical view
        let parent_overlay = self.pending.remove(&parent_pgno).unwrap_or_default();
        let parent_cells = self.merged_cells(parent_pgno, &parent_overlay)?;
        let n_logical = parent_cells.len();
        let (parent_type, parent_right) = {
            let data = self.pager.get(parent_pgno)?;
            let pg = MemPage::init(parent_pgno, data, usable)?;
            if pg.page_type.is_leaf() {
                return Err(BtreeError::corrupt("leaf page has children"));
            }
            (pg.page_type, pg.right_child(data))
        };
        let logical_child = |cells: &[Vec<u8>], i: usize| -> Pgno {
            if i < cells.len() {
                get_u32(&cells[i], 0)
            } else {
                parent_right
            }
        };

        // Sibling window around the focal child
        let i = parent_idx as usize;
        let start = (i.saturating_sub(1)).min((n_logical + 1).saturating_sub(NB));
        let n_old = NB.min(n_logical + 1 - start);

        // Gather cells in key order: each sibling's cells, with the
        // divider between siblings spliced in (dropped for leaf-data
        // trees, child pointer rewritten for interior trees).
        let mut old_pgnos = Vec::with_capacity(n_old);
        let mut cells: Vec<Vec<u8>> = Vec::new();
        let mut child_type: Option<PageType> = None;
        let mut rights: Vec<Pgno> = Vec::with_capacity(n_old);
        for s in 0..n_old {
            let cpgno = logical_child(&parent_cells, start + s);
            if cpgno < 1 || cpgno > self.pager.page_count() {
                return Err(BtreeError::corrupt("child pointer out of range"));
            }
            old_pgnos.push(cpgno);
            let overlay = self.pending.remove(&cpgno).unwrap_or_default();
            let (ctype, right) = {
                let data = self.pager.get(cpgno)?;
                let pg = MemPage::init(cpgno, data, usable)?;
                let right = if pg.page_type.is_interior() {
                    pg.right_child(data)
                } else {
                    0
                };
                (pg.page_type, right)
            };
            match child_type {
                None => child_type = Some(ctype),
                Some(t) if t == ctype => {}
                Some(_) => return Err(BtreeError::corrupt("sibling page types differ")),
            }
            rights.push(right);
            cells.extend(self.merged_cells(cpgno, &overlay)?);

            if s < n_old - 1 {
                let divider = &parent_cells[start + s];
                if ctype == PageType::LeafTable {
                    // Regenerated from rowids on the way back up
                } else if ctype.is_leaf() {
                    // Strip the child pointer for leaf destinations
                    cells.push(divider[4..].to_vec());
                } else {
                    let mut d = divider.clone();
                    d[..4].copy_from_slice(&rights[s].to_be_bytes());
                    cells.push(d);
                }
            }
        }
        let child_type = child_type.ok_or(BtreeError::corrupt("no siblings"))?;
        let leaf_data = child_type == PageType::LeafTable;
        let interior = child_type.is_interior();
        let last_right = *rights.last().unwrap_or(&0);

        // Greedy packing into runs of at most usable-12 bytes
        let sizes: Vec<usize> = cells.iter().map(|c| c.len().max(4) + 2).collect();
        let limit = usable as usize - 12;
        let min_run = if leaf_data { 1 } else { 2 };
        let mut bounds = vec![0usize];
        let mut acc = 0usize;
        let mut count = 0usize;
        for (idx, &sz) in sizes.iter().enumerate() {
            if count >= min_run && acc + sz > limit {
                bounds.push(idx);
                acc = 0;
                count = 0;
            }
            acc += sz;
            count += 1;
        }
        bounds.push(cells.len());
        let k = bounds.len() - 1;

        // Shuffle boundaries rightward so right-hand siblings come out at
        // least as full
        let run_size = |bounds: &[usize], r: usize, sizes: &[usize]| -> usize {
            sizes[bounds[r]..bounds[r + 1]].iter().sum()
        };
        for r in (1..k).rev() {
            loop {
                let sz_right = run_size(&bounds, r, &sizes);
                let moving = bounds[r].checked_sub(1).map(|d| sizes[d]).unwrap_or(0);
                if bounds[r] <= bounds[r - 1] + min_run {
                    break;
                }
                let sz_left = run_size(&bounds, r - 1, &sizes);
                let should_move =
                    sz_right == 0 || sz_right + moving <= sz_left.saturating_sub(moving);
                if !should_move || sz_right + moving > limit {
                    break;
                }
                bounds[r] -= 1;
            }
        }

        // Page numbers: reuse the old siblings, allocate extras, free
        // leftovers, then assign ascending (small k, selection sort)
        let mut new_pgnos: Vec<Pgno> = old_pgnos[..k.min(n_old)].to_vec();
        for _ in n_old..k {
            new_pgnos.push(self.allocate_page(AllocMode::Any)?);
        }
        for s in k..n_old {
            self.free_page(old_pgnos[s])?;
        }
        for a in 0..new_pgnos.len() {
            let mut min = a;
            for b in a + 1..new_pgnos.len() {
                if new_pgnos[b] < new_pgnos[min] {
                    min = b;
                }
            }
            new_pgnos.swap(a, min);
        }
        debug!(
            "balance_nonroot: page {} level {}: {} siblings -> {:?}",
            path[level].0, level, n_old, new_pgnos
        );

        // Build each output page and collect the new dividers
        let mut dividers: Vec<Vec<u8>> = Vec::with_capacity(k.saturating_sub(1));
        for r in 0..k {
            let last = bounds[r + 1];
            let (content_end, right_child) = if r < k - 1 {
                if leaf_data {
                    (last, None)
                } else if interior {
                    // Boundary cell promotes to the parent; its child
                    // pointer becomes this page's right child
                    (last - 1, Some(get_u32(&cells[last - 1], 0)))
                } else {
                    (last - 1, None)
                }
            } else {
                (last, if interior { Some(last_right) } else { None })
            };

            self.rebuild_page(new_pgnos[r], child_type, &cells[bounds[r]..content_end], right_child)?;

            if r < k - 1 {
                let mut divider = Vec::new();
                divider.extend_from_slice(&new_pgnos[r].to_be_bytes());
                if leaf_data {
                    // Divider rowid is the left run's largest key
                    let cell = &cells[last - 1];
                    let (n_payload, n) = parse_varint(cell)?;
                    let _ = n_payload;
                    let (rowid, _) = parse_varint(&cell[n..])?;
                    push_varint(&mut divider, rowid);
                } else if interior {
                    divider.extend_from_slice(&cells[last - 1][4..]);
                } else {
                    let cell = &cells[last - 1];
                    let exact = crate::page::cell_bytes_len(child_type, cell, usable)?;
                    divider.extend_from_slice(&cell[..exact]);
                }
                dividers.push(divider);
            }
        }

        // Rewrite the parent: old dividers out, new dividers in, and the
        // edge pointer to the last sibling fixed up.
        let mut new_parent: Vec<Vec<u8>> = Vec::with_capacity(n_logical + k - n_old);
        new_parent.extend_from_slice(&parent_cells[..start]);
        new_parent.extend(dividers);
        new_parent.extend_from_slice(&parent_cells[start + n_old - 1..]);
        let window_has_right_edge = start + n_old - 1 == n_logical;

        // Root collapse: when the root would be left holding nothing but
        // a pointer to a single child, the child's content moves up into
        // the root instead and the tree loses a level. Page 1 carries the
        // file header, so the content must also fit there.
        if k == 1 && parent_pgno == tree_root && new_parent.is_empty() && window_has_right_edge {
            let total: usize = sizes.iter().sum();
            let hdr = crate::page::page_hdr_offset(tree_root);
            if total + hdr + 12 <= usable as usize {
                self.rebuild_page(
                    tree_root,
                    child_type,
                    &cells,
                    if interior { Some(last_right) } else { None },
                )?;
                self.free_page(new_pgnos[0])?;
                if self.auto_vacuum.is_enabled() {
                    self.set_child_ptrmaps(tree_root)?;
                }
                debug!("tree at root {} lost a level", tree_root);
                return Ok(());
            }
        }

        let new_right = if window_has_right_edge {
            new_pgnos[k - 1]
        } else {
            let after = start + k - 1;
            new_parent[after][..4].copy_from_slice(&new_pgnos[k - 1].to_be_bytes());
            parent_right
        };

        self.rebuild_parent(parent_pgno, parent_type, new_parent, new_right)?;

        if self.auto_vacuum.is_enabled() {
            for &pgno in &new_pgnos {
                self.ptrmap_put(pgno, PtrmapType::Btree, parent_pgno)?;
                self.set_child_ptrmaps(pgno)?;
            }
            self.set_child_ptrmaps(parent_pgno)?;
        }
        Ok(())
    }

    /// Rebuild the parent from its new logical cell list; cells that no
    /// longer fit become the parent's pending overlay for the next level
    /// of the balance loop.
    fn rebuild_parent(
        &mut self,
        pgno: Pgno,
        page_type: PageType,
        cells: Vec<Vec<u8>>,
        right: Pgno,
    ) -> Result<()> {
        let usable = self.usable;
        let secure = self.secure_delete;
        {
            let data = self.pager.get_mut(pgno)?;
            if secure {
                let hdr = crate::page::page_hdr_offset(pgno);
                data[hdr..].fill(0);
            }
            let mut pg = zero_page(pgno, data, page_type, usable);
            pg.set_right_child(data, right);
        }
        for (i, cell) in cells.into_iter().enumerate() {
            self.insert_cell_or_overlay(pgno, i as u16, cell)?;
        }
        Ok(())
    }
}
