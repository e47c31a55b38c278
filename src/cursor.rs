//! Cursors: stateful positions within one B-tree, holding the path from
//! the root down to the current cell.

use std::cmp::Ordering;

use log::trace;

use crate::error::{BtreeError, Result};
use crate::overflow::Access;
use crate::page::{CellInfo, MemPage, PageType, MAX_DEPTH};
use crate::pager::Pgno;
use crate::record::{compare_records, KeyInfo};
use crate::space::{drop_cell, insert_cell};
use crate::vacuum::PtrmapType;
use crate::BtShared;

/// Cursor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Not positioned on any entry
    Invalid,
    /// Positioned on an entry
    Valid,
    /// Position saved across a mutation; re-seek before use
    RequiresSeek,
    /// Tripped; every operation reports the stored error
    Fault,
    /// Restored next to a vanished entry; the next move may be a no-op
    SkipNext,
}

pub(crate) const CF_WRITABLE: u8 = 0x01;
pub(crate) const CF_VALID_NKEY: u8 = 0x02;
pub(crate) const CF_VALID_OVFL: u8 = 0x04;
pub(crate) const CF_AT_LAST: u8 = 0x08;
pub(crate) const CF_INCRBLOB: u8 = 0x10;

/// A key saved while a cursor sits in `RequiresSeek`.
#[derive(Debug, Clone)]
pub(crate) enum SavedKey {
    Rowid(i64),
    Record(Vec<u8>),
}

/// A key to position a cursor at.
#[derive(Debug, Clone, Copy)]
pub enum SeekKey<'a> {
    /// Table trees: the integer rowid
    Rowid(i64),
    /// Index trees: a packed record
    Record(&'a [u8]),
}

/// An entry to insert.
#[derive(Debug, Clone, Copy)]
pub enum Entry<'a> {
    Table { rowid: i64, data: &'a [u8] },
    Index { record: &'a [u8] },
}

impl<'a> Entry<'a> {
    pub(crate) fn seek_key(&self) -> SeekKey<'a> {
        match *self {
            Entry::Table { rowid, .. } => SeekKey::Rowid(rowid),
            Entry::Index { record } => SeekKey::Record(record),
        }
    }
}

#[derive(Debug)]
pub(crate) struct BtCursor {
    pub root: Pgno,
    pub flags: u8,
    pub state: CursorState,
    /// Root-to-current path of (page, cell index) pairs
    pub stack: Vec<(Pgno, u16)>,
    pub info: Option<CellInfo>,
    /// Present on index-tree cursors
    pub key_info: Option<KeyInfo>,
    pub saved_key: Option<SavedKey>,
    /// Pending move suppression after a restore: sign of the seek result
    pub skip: i8,
    /// Lazily-populated overflow page numbers of the current cell
    pub ovfl_cache: Vec<Pgno>,
}

impl BtCursor {
    pub(crate) fn new(root: Pgno, writable: bool, key_info: Option<KeyInfo>) -> Self {
        BtCursor {
            root,
            flags: if writable { CF_WRITABLE } else { 0 },
            state: CursorState::Invalid,
            stack: Vec::new(),
            info: None,
            key_info,
            saved_key: None,
            skip: 0,
            ovfl_cache: Vec::new(),
        }
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.flags & CF_WRITABLE != 0
    }

    fn clear_position_caches(&mut self) {
        self.info = None;
        self.ovfl_cache.clear();
        self.flags &= !(CF_VALID_NKEY | CF_VALID_OVFL | CF_AT_LAST);
    }
}

impl BtShared {
    pub(crate) fn cur(&self, id: usize) -> Result<&BtCursor> {
        self.cursors
            .get(id)
            .and_then(Option::as_ref)
            .ok_or(BtreeError::Abort)
    }

    pub(crate) fn cur_mut(&mut self, id: usize) -> Result<&mut BtCursor> {
        self.cursors
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or(BtreeError::Abort)
    }

    /// Fetch and decode a page's descriptor.
    pub(crate) fn load_page(&mut self, pgno: Pgno) -> Result<MemPage> {
        let usable = self.usable;
        let data = self.pager.get(pgno)?;
        MemPage::init(pgno, data, usable)
    }

    fn check_fault(&self, id: usize) -> Result<()> {
        if self.cur(id)?.state == CursorState::Fault {
            return Err(BtreeError::Abort);
        }
        Ok(())
    }

    /// Release the path and sit on the root. Descends through an empty
    /// interior root into its sole child (the schema root's "virtual
    /// root" case).
    fn move_to_root(&mut self, id: usize) -> Result<MemPage> {
        let root = self.cur(id)?.root;
        let mut pg = self.load_page(root)?;
        {
            let cur = self.cur_mut(id)?;
            cur.stack.clear();
            cur.stack.push((root, 0));
            cur.clear_position_caches();
            cur.state = CursorState::Invalid;
        }
        if pg.n_cell == 0 && pg.page_type.is_interior() {
            if root != 1 {
                return Err(BtreeError::corrupt("empty interior root"));
            }
            let child = {
                let data = self.pager.get(root)?;
                pg.right_child(data)
            };
            pg = self.move_to_child(id, child)?;
        }
        // Tree kind must agree with the cursor's comparator
        let is_index = self.cur(id)?.key_info.is_some();
        if pg.page_type.is_table() == is_index {
            return Err(BtreeError::corrupt("tree kind mismatch"));
        }
        Ok(pg)
    }

    fn move_to_child(&mut self, id: usize, child: Pgno) -> Result<MemPage> {
        {
            let cur = self.cur_mut(id)?;
            if cur.stack.len() >= MAX_DEPTH {
                return Err(BtreeError::corrupt("tree deeper than cursor limit"));
            }
            cur.stack.push((child, 0));
            cur.info = None;
            cur.ovfl_cache.clear();
        }
        self.load_page(child)
    }

    /// Descend along left children to the first entry below the current
    /// position.
    fn move_to_leftmost(&mut self, id: usize) -> Result<()> {
        loop {
            let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
            let pg = self.load_page(pgno)?;
            if pg.page_type.is_leaf() {
                break;
            }
            let child = {
                let data = self.pager.get(pgno)?;
                let offset = pg.cell_offset(data, idx)?;
                pg.cell_left_child(data, offset)
            };
            self.move_to_child(id, child)?;
        }
        self.cur_mut(id)?.state = CursorState::Valid;
        Ok(())
    }

    /// Descend along rightmost children; ends on the last cell of the
    /// rightmost leaf.
    fn move_to_rightmost(&mut self, id: usize) -> Result<()> {
        loop {
            let (pgno, _) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
            let pg = self.load_page(pgno)?;
            if pg.page_type.is_leaf() {
                let cur = self.cur_mut(id)?;
                let top = cur.stack.last_mut().ok_or(BtreeError::Abort)?;
                top.1 = pg.n_cell.saturating_sub(1);
                cur.state = CursorState::Valid;
                return Ok(());
            }
            let child = {
                let data = self.pager.get(pgno)?;
                pg.right_child(data)
            };
            let cur = self.cur_mut(id)?;
            let top = cur.stack.last_mut().ok_or(BtreeError::Abort)?;
            top.1 = pg.n_cell;
            self.move_to_child(id, child)?;
        }
    }

    /// Position on the first entry. Returns false for an empty tree.
    pub(crate) fn cursor_first(&mut self, id: usize) -> Result<bool> {
        self.check_fault(id)?;
        let pg = self.move_to_root(id)?;
        if pg.n_cell == 0 {
            self.cur_mut(id)?.state = CursorState::Invalid;
            return Ok(false);
        }
        self.move_to_leftmost(id)?;
        Ok(true)
    }

    /// Position on the last entry. Returns false for an empty tree.
    pub(crate) fn cursor_last(&mut self, id: usize) -> Result<bool> {
        self.check_fault(id)?;
        let pg = self.move_to_root(id)?;
        if pg.n_cell == 0 {
            self.cur_mut(id)?.state = CursorState::Invalid;
            return Ok(false);
        }
        self.move_to_rightmost(id)?;
        let info = self.cursor_cell_info(id)?;
        let cur = self.cur_mut(id)?;
        cur.info = Some(info);
        cur.flags |= CF_AT_LAST | CF_VALID_NKEY;
        Ok(true)
    }

    /// Advance to the next entry. Returns false at the end of the tree.
    pub(crate) fn cursor_next(&mut self, id: usize) -> Result<bool> {
        self.check_fault(id)?;
        match self.cur(id)?.state {
            CursorState::Invalid => return Ok(false),
            CursorState::RequiresSeek => {
                self.cursor_restore(id)?;
            }
            _ => {}
        }
        let cur = self.cur_mut(id)?;
        if cur.state == CursorState::SkipNext {
            cur.state = CursorState::Valid;
            let skip = cur.skip;
            cur.skip = 0;
            if skip > 0 {
                // Already on the entry that follows the saved position
                return Ok(true);
            }
        }
        if self.cur(id)?.state != CursorState::Valid {
            return Ok(false);
        }
        self.cur_mut(id)?.clear_position_caches();

        loop {
            let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
            let pg = self.load_page(pgno)?;
            let idx = idx + 1;
            self.cur_mut(id)?.stack.last_mut().ok_or(BtreeError::Abort)?.1 = idx;

            if idx >= pg.n_cell {
                if pg.page_type.is_interior() {
                    // All cells consumed; the right subtree is next
                    let child = {
                        let data = self.pager.get(pgno)?;
                        pg.right_child(data)
                    };
                    self.move_to_child(id, child)?;
                    self.move_to_leftmost(id)?;
                    return Ok(true);
                }
                // Ascend to the first unexhausted ancestor
                loop {
                    let cur = self.cur_mut(id)?;
                    if cur.stack.len() == 1 {
                        cur.state = CursorState::Invalid;
                        return Ok(false);
                    }
                    cur.stack.pop();
                    let (ppgno, pidx) = *cur.stack.last().ok_or(BtreeError::Abort)?;
                    let ppg = self.load_page(ppgno)?;
                    if pidx < ppg.n_cell {
                        break;
                    }
                }
                let is_index = self.cur(id)?.key_info.is_some();
                if is_index {
                    // The ancestor's divider is itself an entry
                    self.cur_mut(id)?.state = CursorState::Valid;
                    return Ok(true);
                }
                // Table dividers are not entries; keep moving
                continue;
            }

            if pg.page_type.is_leaf() {
                self.cur_mut(id)?.state = CursorState::Valid;
                return Ok(true);
            }
            // Interior with cells remaining: the next entries live under
            // the left child of the new index
            self.move_to_leftmost(id)?;
            return Ok(true);
        }
    }

    /// Step back to the previous entry. Returns false at the start.
    pub(crate) fn cursor_previous(&mut self, id: usize) -> Result<bool> {
        self.check_fault(id)?;
        match self.cur(id)?.state {
            CursorState::Invalid => return Ok(false),
            CursorState::RequiresSeek => {
                self.cursor_restore(id)?;
            }
            _ => {}
        }
        let cur = self.cur_mut(id)?;
        if cur.state == CursorState::SkipNext {
            cur.state = CursorState::Valid;
            let skip = cur.skip;
            cur.skip = 0;
            if skip < 0 {
                return Ok(true);
            }
        }
        if self.cur(id)?.state != CursorState::Valid {
            return Ok(false);
        }
        self.cur_mut(id)?.clear_position_caches();

        let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
        let pg = self.load_page(pgno)?;

        if pg.page_type.is_interior() {
            // From an index interior entry, the predecessor is the
            // maximum of its left subtree
            let child = {
                let data = self.pager.get(pgno)?;
                let offset = pg.cell_offset(data, idx)?;
                pg.cell_left_child(data, offset)
            };
            self.move_to_child(id, child)?;
            self.move_to_rightmost(id)?;
            return Ok(true);
        }

        // Ascend while at index zero, then step one cell back
        loop {
            let cur = self.cur_mut(id)?;
            let top = cur.stack.last_mut().ok_or(BtreeError::Abort)?;
            if top.1 > 0 {
                top.1 -= 1;
                break;
            }
            if cur.stack.len() == 1 {
                cur.state = CursorState::Invalid;
                return Ok(false);
            }
            cur.stack.pop();
        }

        let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
        let pg = self.load_page(pgno)?;
        if pg.page_type.is_leaf() || self.cur(id)?.key_info.is_some() {
            // A leaf cell, or an index divider, is itself the entry
            self.cur_mut(id)?.state = CursorState::Valid;
            return Ok(true);
        }
        // Table interior: the previous entry is the maximum of the
        // subtree left of the divider
        let child = {
            let data = self.pager.get(pgno)?;
            let offset = pg.cell_offset(data, idx)?;
            pg.cell_left_child(data, offset)
        };
        self.move_to_child(id, child)?;
        self.move_to_rightmost(id)?;
        Ok(true)
    }

    /// Assemble the full payload of the current cell into a buffer.
    fn assemble_payload(&mut self, pgno: Pgno, offset: usize, n_payload: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n_payload as usize];
        let mut cache = Vec::new();
        self.access_payload(pgno, offset, &mut cache, 0, Access::Read(&mut out))?;
        Ok(out)
    }

    /// Compare the cell at `(pgno, idx)` against a seek key. Returns the
    /// ordering of cell vs key.
    fn compare_cell(
        &mut self,
        pg: &MemPage,
        idx: u16,
        key: &SeekKey<'_>,
        key_info: &Option<KeyInfo>,
    ) -> Result<Ordering> {
        let (offset, info) = {
            let data = self.pager.get(pg.pgno)?;
            let offset = pg.cell_offset(data, idx)?;
            (offset, pg.parse_cell(data, offset)?)
        };
        match key {
            SeekKey::Rowid(rowid) => Ok(info.key.cmp(rowid)),
            SeekKey::Record(record) => {
                let ki = key_info.clone().unwrap_or_default();
                if info.n_local == info.n_payload {
                    // Fully local: compare against the inline bytes
                    let data = self.pager.get(pg.pgno)?;
                    let local =
                        &data[info.payload_offset..info.payload_offset + info.n_local as usize];
                    compare_records(local, record, &ki)
                } else {
                    let full = self.assemble_payload(pg.pgno, offset, info.n_payload)?;
                    compare_records(&full, record, &ki)
                }
            }
        }
    }

    /// Binary-search the tree for `key`. Leaves the cursor on the leaf (or
    /// index interior entry) where the key lives or would be inserted and
    /// returns the ordering of that cell relative to the key: negative
    /// when the cursor entry is smaller, zero on an exact hit.
    pub(crate) fn cursor_seek(&mut self, id: usize, key: &SeekKey<'_>, bias_right: bool) -> Result<i8> {
        self.check_fault(id)?;

        // A cursor known to sit on the largest entry can answer an
        // append-style probe without searching. Valid only because every
        // mutation path saves other cursors first.
        if let SeekKey::Rowid(rowid) = key {
            let cur = self.cur(id)?;
            if cur.state == CursorState::Valid
                && cur.flags & (CF_AT_LAST | CF_VALID_NKEY) == (CF_AT_LAST | CF_VALID_NKEY)
            {
                if let Some(info) = &cur.info {
                    if info.key < *rowid {
                        return Ok(-1);
                    }
                    if info.key == *rowid {
                        return Ok(0);
                    }
                }
            }
        }

        let key_info = self.cur(id)?.key_info.clone();
        let mut pg = self.move_to_root(id)?;
        if pg.n_cell == 0 {
            // Empty tree: cursor parks on the (leaf) root at index 0
            self.cur_mut(id)?.state = CursorState::Invalid;
            return Ok(-1);
        }

        loop {
            if pg.n_cell == 0 {
                // Only an empty root may have no cells, and that case was
                // handled above
                return Err(BtreeError::corrupt("empty page below root"));
            }
            let mut lo: i32 = 0;
            let mut hi: i32 = pg.n_cell as i32 - 1;
            let mut idx: i32 = if bias_right { hi } else { (lo + hi) / 2 };
            let mut last_cmp = Ordering::Less;

            while lo <= hi {
                let ord = self.compare_cell(&pg, idx as u16, key, &key_info)?;
                last_cmp = ord;
                match ord {
                    Ordering::Equal => {
                        if pg.page_type == PageType::InteriorTable {
                            // The divider equals the key: the row is the
                            // maximum of the left subtree
                            lo = idx;
                            break;
                        }
                        let cur = self.cur_mut(id)?;
                        cur.stack.last_mut().ok_or(BtreeError::Abort)?.1 = idx as u16;
                        cur.state = CursorState::Valid;
                        cur.clear_position_caches();
                        return Ok(0);
                    }
                    Ordering::Less => lo = idx + 1,
                    Ordering::Greater => hi = idx - 1,
                }
                idx = (lo + hi) / 2;
            }

            if pg.page_type.is_leaf() {
                // Park on the last probed cell
                let probed = if last_cmp == Ordering::Less { lo - 1 } else { lo };
                let probed = probed.clamp(0, pg.n_cell as i32 - 1) as u16;
                let cur = self.cur_mut(id)?;
                cur.stack.last_mut().ok_or(BtreeError::Abort)?.1 = probed;
                cur.state = CursorState::Valid;
                cur.clear_position_caches();
                return Ok(match last_cmp {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                });
            }

            // Descend: child `lo` (the rightmost pointer when lo == n_cell)
            let child = {
                let data = self.pager.get(pg.pgno)?;
                if lo >= pg.n_cell as i32 {
                    pg.right_child(data)
                } else {
                    let offset = pg.cell_offset(data, lo as u16)?;
                    pg.cell_left_child(data, offset)
                }
            };
            self.cur_mut(id)?.stack.last_mut().ok_or(BtreeError::Abort)?.1 =
                lo.min(pg.n_cell as i32) as u16;
            pg = self.move_to_child(id, child)?;
        }
    }

    /// Decoded info for the current cell, cached on the cursor. A
    /// `SkipNext` cursor sits on a real cell and is readable too.
    pub(crate) fn cursor_cell_info(&mut self, id: usize) -> Result<CellInfo> {
        let state = self.cur(id)?.state;
        if state != CursorState::Valid && state != CursorState::SkipNext {
            return Err(BtreeError::Abort);
        }
        if let Some(info) = self.cur(id)?.info {
            return Ok(info);
        }
        let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
        let pg = self.load_page(pgno)?;
        let info = {
            let data = self.pager.get(pgno)?;
            let offset = pg.cell_offset(data, idx)?;
            pg.parse_cell(data, offset)?
        };
        let cur = self.cur_mut(id)?;
        cur.info = Some(info);
        cur.flags |= CF_VALID_NKEY;
        Ok(info)
    }

    /// Read `buf.len()` payload bytes of the current entry at `offset`.
    pub(crate) fn cursor_read_payload(
        &mut self,
        id: usize,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        let info = self.cursor_cell_info(id)?;
        let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
        let cell_offset = {
            let pg = self.load_page(pgno)?;
            let data = self.pager.get(pgno)?;
            pg.cell_offset(data, idx)?
        };
        let _ = info;
        let mut cache = std::mem::take(&mut self.cur_mut(id)?.ovfl_cache);
        let res = self.access_payload(pgno, cell_offset, &mut cache, offset, Access::Read(buf));
        let cur = self.cur_mut(id)?;
        cur.ovfl_cache = cache;
        if !cur.ovfl_cache.is_empty() {
            cur.flags |= CF_VALID_OVFL;
        }
        res
    }

    /// Overwrite payload bytes of the current entry in place without
    /// changing its size; the incremental-blob write path.
    pub(crate) fn cursor_write_payload(
        &mut self,
        id: usize,
        offset: u32,
        buf: &[u8],
    ) -> Result<()> {
        if self.cur(id)?.flags & CF_WRITABLE == 0 {
            return Err(BtreeError::ReadOnly);
        }
        let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
        if self.cur(id)?.state != CursorState::Valid {
            return Err(BtreeError::Abort);
        }
        let cell_offset = {
            let pg = self.load_page(pgno)?;
            let data = self.pager.get(pgno)?;
            pg.cell_offset(data, idx)?
        };
        let mut cache = std::mem::take(&mut self.cur_mut(id)?.ovfl_cache);
        let res = self.access_payload(pgno, cell_offset, &mut cache, offset, Access::Write(buf));
        let cur = self.cur_mut(id)?;
        cur.ovfl_cache = cache;
        cur.flags |= CF_INCRBLOB;
        res
    }

    /// Record the logical position of every cursor on `root` (except
    /// `except`) and release their page references. `root == 0` saves
    /// cursors on every tree.
    pub(crate) fn save_all_cursors(&mut self, root: Pgno, except: Option<usize>) -> Result<()> {
        let ids: Vec<usize> = (0..self.cursors.len())
            .filter(|&i| self.cursors[i].is_some())
            .filter(|&i| Some(i) != except)
            .filter(|&i| {
                root == 0
                    || self.cursors[i]
                        .as_ref()
                        .map(|c| c.root == root)
                        .unwrap_or(false)
            })
            .collect();
        for id in ids {
            self.save_cursor_position(id)?;
        }
        Ok(())
    }

    pub(crate) fn save_cursor_position(&mut self, id: usize) -> Result<()> {
        let state = self.cur(id)?.state;
        if state != CursorState::Valid && state != CursorState::SkipNext {
            if state == CursorState::Invalid {
                let cur = self.cur_mut(id)?;
                cur.stack.clear();
            }
            return Ok(());
        }
        let was_skip = state == CursorState::SkipNext;
        if was_skip {
            // The position itself is real; keep the pending skip
            self.cur_mut(id)?.state = CursorState::Valid;
        }
        let info = self.cursor_cell_info(id)?;
        let saved = if self.cur(id)?.key_info.is_none() {
            SavedKey::Rowid(info.key)
        } else {
            let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
            let cell_offset = {
                let pg = self.load_page(pgno)?;
                let data = self.pager.get(pgno)?;
                pg.cell_offset(data, idx)?
            };
            SavedKey::Record(self.assemble_payload(pgno, cell_offset, info.n_payload)?)
        };
        let cur = self.cur_mut(id)?;
        cur.saved_key = Some(saved);
        cur.stack.clear();
        cur.clear_position_caches();
        if !was_skip {
            cur.skip = 0;
        }
        cur.state = CursorState::RequiresSeek;
        trace!("saved cursor {} position", id);
        Ok(())
    }

    /// Re-seek a saved cursor. Ends in `SkipNext`: when the entry is gone
    /// the cursor sits beside where it was, and the sign of the seek
    /// result tells the next move whether it is already done.
    pub(crate) fn cursor_restore(&mut self, id: usize) -> Result<()> {
        match self.cur(id)?.state {
            CursorState::Fault => return Err(BtreeError::Abort),
            CursorState::RequiresSeek => {}
            _ => return Ok(()),
        }
        let saved = self
            .cur_mut(id)?
            .saved_key
            .take()
            .ok_or(BtreeError::Abort)?;
        let res = match &saved {
            SavedKey::Rowid(rowid) => self.cursor_seek(id, &SeekKey::Rowid(*rowid), false)?,
            SavedKey::Record(rec) => self.cursor_seek(id, &SeekKey::Record(rec), false)?,
        };
        let cur = self.cur_mut(id)?;
        if cur.state == CursorState::Valid {
            cur.state = CursorState::SkipNext;
            // A skip pending from before the save wins over an exact hit
            if cur.skip == 0 {
                cur.skip = res;
            }
        }
        Ok(())
    }

    /// True when the cursor has been moved off its entry since the caller
    /// last positioned it.
    pub(crate) fn cursor_has_moved(&self, id: usize) -> Result<bool> {
        Ok(self.cur(id)?.state != CursorState::Valid)
    }

    /// Trip a cursor: release its pages and make every subsequent
    /// operation fail until it is repositioned or closed.
    pub(crate) fn trip_cursor(&mut self, id: usize) -> Result<()> {
        let cur = self.cur_mut(id)?;
        cur.stack.clear();
        cur.clear_position_caches();
        cur.saved_key = None;
        cur.state = CursorState::Fault;
        Ok(())
    }

    /// Insert an entry at the cursor's tree. `seek_hint` carries the
    /// result of a seek for the same key the caller just did; `append`
    /// biases the search toward the high end.
    pub(crate) fn cursor_insert(
        &mut self,
        id: usize,
        entry: &Entry<'_>,
        append: bool,
        seek_hint: Option<i8>,
        save_position: bool,
    ) -> Result<()> {
        self.check_fault(id)?;
        if !self.cur(id)?.is_writable() {
            return Err(BtreeError::ReadOnly);
        }
        let root = self.cur(id)?.root;
        self.save_all_cursors(root, Some(id))?;

        let mut loc = match seek_hint {
            Some(r) => r,
            None => self.cursor_seek(id, &entry.seek_key(), append)?,
        };

        if loc == 0 {
            // Replacing an existing entry. An index hit may sit on an
            // interior page; route it through delete and re-seek.
            let on_interior = {
                let (pgno, _) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
                self.load_page(pgno)?.page_type.is_interior()
            };
            if on_interior {
                self.cursor_delete(id, false)?;
                loc = self.cursor_seek(id, &entry.seek_key(), append)?;
                if loc == 0 {
                    return Err(BtreeError::corrupt("deleted entry still present"));
                }
            } else {
                let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
                let offset = {
                    let pg = self.load_page(pgno)?;
                    let data = self.pager.get(pgno)?;
                    pg.cell_offset(data, idx)?
                };
                self.clear_cell(pgno, offset)?;
                let usable = self.usable;
                let secure = self.secure_delete;
                let data = self.pager.get_mut(pgno)?;
                let mut pg = MemPage::init(pgno, data, usable)?;
                drop_cell(&mut pg, data, idx, secure)?;
            }
        }

        let (pgno, mut idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
        let pg = self.load_page(pgno)?;
        if pg.page_type.is_interior() {
            return Err(BtreeError::corrupt("insert position not on a leaf"));
        }

        let (rowid, payload) = match *entry {
            Entry::Table { rowid, data } => (rowid, data),
            Entry::Index { record } => (0, record),
        };
        let cell = self.fill_in_cell(pg.page_type, pgno, rowid, payload)?;

        if loc < 0 && pg.n_cell > 0 {
            idx += 1;
        }
        trace!("insert on page {} at index {}", pgno, idx);

        let fit = self.insert_cell_or_overlay(pgno, idx, cell)?;
        if !fit {
            self.cur_mut(id)?.stack.last_mut().ok_or(BtreeError::Abort)?.1 = idx;
            self.balance(id)?;
            let cur = self.cur_mut(id)?;
            cur.stack.clear();
            cur.clear_position_caches();
            if save_position {
                cur.saved_key = Some(match *entry {
                    Entry::Table { rowid, .. } => SavedKey::Rowid(rowid),
                    Entry::Index { record } => SavedKey::Record(record.to_vec()),
                });
                cur.state = CursorState::RequiresSeek;
            } else {
                cur.state = CursorState::Invalid;
            }
        } else {
            let cur = self.cur_mut(id)?;
            cur.stack.last_mut().ok_or(BtreeError::Abort)?.1 = idx;
            cur.state = CursorState::Valid;
            cur.clear_position_caches();
        }
        Ok(())
    }

    /// Delete the entry under the cursor. On an interior index position
    /// the divider is replaced with its leaf predecessor before the leaf
    /// is rebalanced.
    pub(crate) fn cursor_delete(&mut self, id: usize, save_position: bool) -> Result<()> {
        self.check_fault(id)?;
        if !self.cur(id)?.is_writable() {
            return Err(BtreeError::ReadOnly);
        }
        if self.cur(id)?.state == CursorState::RequiresSeek {
            self.cursor_restore(id)?;
            let cur = self.cur_mut(id)?;
            if cur.state == CursorState::SkipNext {
                if cur.skip != 0 {
                    return Err(BtreeError::Abort);
                }
                cur.state = CursorState::Valid;
            }
        }
        if self.cur(id)?.state != CursorState::Valid {
            return Err(BtreeError::Abort);
        }

        let root = self.cur(id)?.root;
        let info = self.cursor_cell_info(id)?;
        let saved = if save_position {
            let cur = self.cur(id)?;
            Some(if cur.key_info.is_none() {
                SavedKey::Rowid(info.key)
            } else {
                let (pgno, idx) = *cur.stack.last().ok_or(BtreeError::Abort)?;
                let cell_offset = {
                    let pg = self.load_page(pgno)?;
                    let data = self.pager.get(pgno)?;
                    pg.cell_offset(data, idx)?
                };
                SavedKey::Record(self.assemble_payload(pgno, cell_offset, info.n_payload)?)
            })
        } else {
            None
        };
        self.save_all_cursors(root, Some(id))?;

        let (pgno, idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
        let pg = self.load_page(pgno)?;
        let usable = self.usable;
        let secure = self.secure_delete;

        if pg.page_type.is_interior() {
            // Fetch the predecessor: rightmost leaf cell of the left
            // subtree.
            let (left_child, divider_offset) = {
                let data = self.pager.get(pgno)?;
                let offset = pg.cell_offset(data, idx)?;
                (pg.cell_left_child(data, offset), offset)
            };
            self.move_to_child(id, left_child)?;
            self.move_to_rightmost(id)?;

            let (leaf_pgno, leaf_idx) = *self.cur(id)?.stack.last().ok_or(BtreeError::Abort)?;
            let leaf_pg = self.load_page(leaf_pgno)?;
            if leaf_pg.n_cell == 0 {
                return Err(BtreeError::corrupt("empty leaf under interior entry"));
            }
            let (leaf_cell, leaf_info) = {
                let data = self.pager.get(leaf_pgno)?;
                let offset = leaf_pg.cell_offset(data, leaf_idx)?;
                let info = leaf_pg.parse_cell(data, offset)?;
                let size = leaf_pg.cell_size(data, offset)?;
                let mut cell = data[offset..offset + size as usize].to_vec();
                // Trim the allocation-minimum padding before the child
                // pointer is prepended
                cell.truncate(crate::page::cell_bytes_len(
                    leaf_pg.page_type,
                    &cell,
                    usable,
                )?);
                (cell, info)
            };

            // Swap the divider out for the predecessor
            self.clear_cell(pgno, divider_offset)?;
            {
                let data = self.pager.get_mut(pgno)?;
                let mut ipg = MemPage::init(pgno, data, usable)?;
                drop_cell(&mut ipg, data, idx, secure)?;
            }
            let mut divider = Vec::with_capacity(leaf_cell.len() + 4);
            divider.extend_from_slice(&left_child.to_be_bytes());
            divider.extend_from_slice(&leaf_cell);
            self.insert_cell_or_overlay(pgno, idx, divider)?;
            if self.auto_vacuum.is_enabled() && leaf_info.overflow != 0 {
                // The chain now hangs off the interior page
                self.ptrmap_put(leaf_info.overflow, PtrmapType::Overflow1, pgno)?;
            }

            // Drop the promoted cell from the leaf without touching its
            // overflow chain; the divider owns it now.
            {
                let data = self.pager.get_mut(leaf_pgno)?;
                let mut lpg = MemPage::init(leaf_pgno, data, usable)?;
                drop_cell(&mut lpg, data, leaf_idx, secure)?;
            }
        } else {
            let offset = {
                let data = self.pager.get(pgno)?;
                pg.cell_offset(data, idx)?
            };
            self.clear_cell(pgno, offset)?;
            let data = self.pager.get_mut(pgno)?;
            let mut lpg = MemPage::init(pgno, data, usable)?;
            drop_cell(&mut lpg, data, idx, secure)?;
        }

        self.balance(id)?;
        let cur = self.cur_mut(id)?;
        cur.stack.clear();
        cur.clear_position_caches();
        match saved {
            Some(key) => {
                cur.saved_key = Some(key);
                cur.state = CursorState::RequiresSeek;
            }
            None => cur.state = CursorState::Invalid,
        }
        Ok(())
    }

    /// Insert a cell into a page, or park it in the page's pending
    /// overlay when it does not fit (or the page already has an overlay).
    /// Returns whether it landed on the page.
    pub(crate) fn insert_cell_or_overlay(
        &mut self,
        pgno: Pgno,
        idx: u16,
        cell: Vec<u8>,
    ) -> Result<bool> {
        if self.pending.contains_key(&pgno) {
            self.push_overlay(pgno, idx, cell);
            return Ok(false);
        }
        let usable = self.usable;
        let secure = self.secure_delete;
        let data = self.pager.get_mut(pgno)?;
        let mut pg = MemPage::init(pgno, data, usable)?;
        if insert_cell(&mut pg, data, idx, &cell, secure)? {
            Ok(true)
        } else {
            self.push_overlay(pgno, idx, cell);
            Ok(false)
        }
    }

    fn push_overlay(&mut self, pgno: Pgno, idx: u16, cell: Vec<u8>) {
        let overlay = self.pending.entry(pgno).or_default();
        let at = overlay.partition_point(|(i, _)| *i <= idx);
        overlay.insert(at, (idx, cell));
        trace!("page {} overlay now {} cells", pgno, overlay.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::AutoVacuum;
    use crate::BtShared;

    fn table_shared() -> (BtShared, Pgno) {
        let mut bt = BtShared::new_for_test(512, AutoVacuum::Off);
        let root = bt.btree_create_root(PageType::LeafTable).unwrap();
        (bt, root)
    }

    fn insert_row(bt: &mut BtShared, cur: usize, rowid: i64, data: &[u8]) {
        bt.cursor_insert(cur, &Entry::Table { rowid, data }, false, None, false)
            .unwrap();
    }

    #[test]
    fn test_empty_tree_first_last() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, false, None).unwrap();
        assert!(!bt.cursor_first(cur).unwrap());
        assert!(!bt.cursor_last(cur).unwrap());
        assert!(!bt.cursor_next(cur).unwrap());
    }

    #[test]
    fn test_single_page_iteration() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, true, None).unwrap();
        for rowid in [5i64, 1, 3, 2, 4] {
            insert_row(&mut bt, cur, rowid, b"val");
        }
        assert!(bt.cursor_first(cur).unwrap());
        let mut seen = Vec::new();
        loop {
            seen.push(bt.cursor_cell_info(cur).unwrap().key);
            if !bt.cursor_next(cur).unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_backward_iteration() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, true, None).unwrap();
        for rowid in 1..=5i64 {
            insert_row(&mut bt, cur, rowid, b"x");
        }
        assert!(bt.cursor_last(cur).unwrap());
        let mut seen = Vec::new();
        loop {
            seen.push(bt.cursor_cell_info(cur).unwrap().key);
            if !bt.cursor_previous(cur).unwrap() {
                break;
            }
        }
        assert_eq!(seen, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_seek_results() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, true, None).unwrap();
        for rowid in [10i64, 20, 30] {
            insert_row(&mut bt, cur, rowid, b"x");
        }
        assert_eq!(bt.cursor_seek(cur, &SeekKey::Rowid(20), false).unwrap(), 0);
        let res = bt.cursor_seek(cur, &SeekKey::Rowid(25), false).unwrap();
        assert_ne!(res, 0);
        let key = bt.cursor_cell_info(cur).unwrap().key;
        // Cursor parks beside the missing key, on 20 or 30 depending on
        // the comparison direction
        if res < 0 {
            assert_eq!(key, 20);
        } else {
            assert_eq!(key, 30);
        }
    }

    #[test]
    fn test_seek_empty_tree() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, false, None).unwrap();
        assert_eq!(bt.cursor_seek(cur, &SeekKey::Rowid(1), false).unwrap(), -1);
        assert_eq!(bt.cur(cur).unwrap().state, CursorState::Invalid);
    }

    #[test]
    fn test_replace_same_rowid() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, true, None).unwrap();
        insert_row(&mut bt, cur, 7, b"old");
        insert_row(&mut bt, cur, 7, b"newer");
        assert!(bt.cursor_first(cur).unwrap());
        let info = bt.cursor_cell_info(cur).unwrap();
        assert_eq!(info.key, 7);
        assert_eq!(info.n_payload, 5);
        assert!(!bt.cursor_next(cur).unwrap());
    }

    #[test]
    fn test_delete_and_skipnext() {
        let (mut bt, root) = table_shared();
        let writer = bt.open_cursor(root, true, None).unwrap();
        for rowid in 99..=102i64 {
            insert_row(&mut bt, writer, rowid, b"payload");
        }
        // Reader parks on 100, then the writer deletes it
        let reader = bt.open_cursor(root, false, None).unwrap();
        assert_eq!(
            bt.cursor_seek(reader, &SeekKey::Rowid(100), false).unwrap(),
            0
        );
        assert_eq!(bt.cursor_seek(writer, &SeekKey::Rowid(100), false).unwrap(), 0);
        bt.cursor_delete(writer, false).unwrap();

        assert!(bt.cursor_has_moved(reader).unwrap());
        // Restore leaves the reader in SkipNext beside the gone entry
        bt.cursor_restore(reader).unwrap();
        assert_eq!(bt.cur(reader).unwrap().state, CursorState::SkipNext);
        assert!(bt.cursor_next(reader).unwrap());
        assert_eq!(bt.cursor_cell_info(reader).unwrap().key, 101);
    }

    #[test]
    fn test_saved_cursor_restores_after_reinsert() {
        let (mut bt, root) = table_shared();
        let writer = bt.open_cursor(root, true, None).unwrap();
        for rowid in 99..=102i64 {
            insert_row(&mut bt, writer, rowid, b"payload");
        }
        let reader = bt.open_cursor(root, false, None).unwrap();
        assert_eq!(
            bt.cursor_seek(reader, &SeekKey::Rowid(100), false).unwrap(),
            0
        );
        assert_eq!(bt.cursor_seek(writer, &SeekKey::Rowid(100), false).unwrap(), 0);
        bt.cursor_delete(writer, false).unwrap();
        insert_row(&mut bt, writer, 100, b"other");

        assert!(bt.cursor_has_moved(reader).unwrap());
        // The entry is back; next from the restored position moves to 101
        assert!(bt.cursor_next(reader).unwrap());
        assert_eq!(bt.cursor_cell_info(reader).unwrap().key, 101);
    }

    #[test]
    fn test_tripped_cursor_returns_abort() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, true, None).unwrap();
        insert_row(&mut bt, cur, 1, b"x");
        bt.trip_cursor(cur).unwrap();
        assert!(matches!(bt.cursor_first(cur), Err(BtreeError::Abort)));
        assert!(matches!(bt.cursor_next(cur), Err(BtreeError::Abort)));
    }

    #[test]
    fn test_at_last_append_shortcut() {
        let (mut bt, root) = table_shared();
        let cur = bt.open_cursor(root, true, None).unwrap();
        for rowid in 1..=4i64 {
            insert_row(&mut bt, cur, rowid, b"x");
        }
        assert!(bt.cursor_last(cur).unwrap());
        // The cached last key answers without a tree descent
        assert_eq!(bt.cursor_seek(cur, &SeekKey::Rowid(100), false).unwrap(), -1);
        assert_eq!(bt.cursor_seek(cur, &SeekKey::Rowid(4), false).unwrap(), 0);
    }

    #[test]
    fn test_index_tree_insert_and_seek() {
        let mut bt = BtShared::new_for_test(512, AutoVacuum::Off);
        let root = bt.btree_create_root(PageType::LeafIndex).unwrap();
        let ki = KeyInfo::new(1);
        let cur = bt.open_cursor(root, true, Some(ki)).unwrap();

        let records: Vec<Vec<u8>> = [30i64, 10, 20]
            .iter()
            .map(|&v| crate::record::build_int_record(&[v]))
            .collect();
        for rec in &records {
            bt.cursor_insert(cur, &Entry::Index { record: rec }, false, None, false)
                .unwrap();
        }

        let probe = crate::record::build_int_record(&[20]);
        assert_eq!(
            bt.cursor_seek(cur, &SeekKey::Record(&probe), false).unwrap(),
            0
        );

        // Forward order is by record comparison
        assert!(bt.cursor_first(cur).unwrap());
        let mut sizes = Vec::new();
        loop {
            sizes.push(bt.cursor_cell_info(cur).unwrap().n_payload);
            if !bt.cursor_next(cur).unwrap() {
                break;
            }
        }
        assert_eq!(sizes.len(), 3);
    }
}
