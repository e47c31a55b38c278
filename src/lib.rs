//! An on-disk B-tree storage engine: tables and indices as multi-way
//! balanced trees of fixed-size pages over a transactional pager, served
//! to the layer above through cursors.

pub mod checker;
pub mod cursor;
pub mod error;
pub mod header;
pub mod page;
pub mod pager;
pub mod record;
pub mod varint;

mod balance;
mod freelist;
mod overflow;
mod space;
mod vacuum;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use log::debug;
use serde::Serialize;

pub use checker::CheckReport;
pub use cursor::{CursorState, Entry, SeekKey};
pub use error::{BtreeError, Result};
pub use header::AutoVacuum;
pub use pager::Pgno;
pub use record::KeyInfo;

use cursor::BtCursor;
use header::{
    parse_db_header, write_db_header, DbHeader, HDR_CHANGE_COUNTER, HDR_DB_SIZE,
    HDR_LARGEST_ROOT, HDR_VERSION_VALID_FOR,
};
use page::{zero_page, MemPage, PageType, MAX_DEPTH};
use pager::{pending_byte_page, Pager};

/// Transaction state of a handle or of the shared tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransState {
    None,
    Read,
    Write,
}

/// Kind of tree created by `create_table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Rowid-keyed table tree; payloads live on leaves
    IntKey,
    /// Index tree keyed by packed records
    Index,
}

/// Savepoint operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointOp {
    Release,
    Rollback,
}

const BTS_EXCLUSIVE: u8 = 0x01;
const BTS_PENDING: u8 = 0x02;

/// One granted shared-cache table lock.
#[derive(Debug)]
pub(crate) struct BtLock {
    pub handle: u64,
    pub root: Pgno,
    pub exclusive: bool,
}

/// State shared by every handle open on the same database: the pager, the
/// cursor slab, the lock table, and the transaction bookkeeping.
pub struct BtShared {
    pub(crate) pager: Pager,
    pub(crate) usable: u32,
    pub(crate) auto_vacuum: AutoVacuum,
    pub(crate) secure_delete: bool,
    pub(crate) in_transaction: TransState,
    pub(crate) n_transaction: u32,
    pub(crate) writer: Option<u64>,
    pub(crate) bts_flags: u8,
    pub(crate) cursors: Vec<Option<BtCursor>>,
    pub(crate) locks: Vec<BtLock>,
    /// Free-list leaves touched inside the current write transaction;
    /// their content matters for rollback, so reads may not be skipped.
    pub(crate) has_content: HashSet<Pgno>,
    /// Cells that did not fit their page, keyed by page, waiting for the
    /// balancer. Always empty between mutations.
    pub(crate) pending: HashMap<Pgno, Vec<(u16, Vec<u8>)>>,
    next_handle: u64,
}

impl BtShared {
    fn from_pager(mut pager: Pager, opts: &OpenOptions) -> Result<BtShared> {
        let (usable, auto_vacuum, secure_delete) = if pager.page_count() > 0 {
            let hdr = parse_db_header(pager.get(1)?)?;
            (hdr.usable_size(), hdr.auto_vacuum, opts.secure_delete)
        } else {
            let page_size = pager.page_size();
            if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
                return Err(BtreeError::corrupt("page size"));
            }
            let usable = page_size - opts.reserved_bytes as u32;
            if usable < 480 {
                return Err(BtreeError::corrupt("usable size below 480"));
            }
            (usable, opts.auto_vacuum, opts.secure_delete)
        };
        Ok(BtShared {
            pager,
            usable,
            auto_vacuum,
            secure_delete,
            in_transaction: TransState::None,
            n_transaction: 0,
            writer: None,
            bts_flags: 0,
            cursors: Vec::new(),
            locks: Vec::new(),
            has_content: HashSet::new(),
            pending: HashMap::new(),
            next_handle: 1,
        })
    }

    pub(crate) fn hdr_get32(&mut self, offset: usize) -> Result<u32> {
        Ok(header::get_u32(self.pager.get(1)?, offset))
    }

    pub(crate) fn hdr_put32(&mut self, offset: usize, value: u32) -> Result<()> {
        header::put_u32(self.pager.get_mut(1)?, offset, value);
        Ok(())
    }

    pub(crate) fn pending_page(&self) -> Pgno {
        pending_byte_page(self.pager.page_size())
    }

    /// Writable buffer for a page being given fresh content. The disk
    /// read is skipped unless the page was freed inside this transaction.
    pub(crate) fn new_page_buffer(&mut self, pgno: Pgno) -> Result<&mut Vec<u8>> {
        if self.has_content.contains(&pgno) {
            self.pager.get_mut(pgno)
        } else {
            self.pager.get_mut_unused(pgno)
        }
    }

    /// First write transaction against an empty file formats page 1: the
    /// database header plus the empty schema tree.
    fn init_new_db(&mut self) -> Result<()> {
        if self.pager.page_count() > 0 {
            return Ok(());
        }
        let page_size = self.pager.page_size();
        let reserved = (page_size - self.usable) as u8;
        let hdr = DbHeader::new(page_size, reserved, self.auto_vacuum);
        self.pager.set_page_count(1)?;
        let data = self.pager.get_mut_unused(1)?;
        write_db_header(data, &hdr);
        zero_page(1, data, PageType::LeafTable, self.usable);
        debug!("initialised new database, page size {}", page_size);
        Ok(())
    }

    /// Bring the header's change counter and size fields up to date ahead
    /// of a commit.
    fn sync_header(&mut self) -> Result<()> {
        let n = self.pager.page_count();
        let counter = self.hdr_get32(HDR_CHANGE_COUNTER)?.wrapping_add(1);
        self.hdr_put32(HDR_CHANGE_COUNTER, counter)?;
        self.hdr_put32(HDR_DB_SIZE, n)?;
        self.hdr_put32(HDR_VERSION_VALID_FOR, counter)?;
        Ok(())
    }

    /// Allocate and format the root page of a new tree.
    pub(crate) fn btree_create_root(&mut self, page_type: PageType) -> Result<Pgno> {
        let pgno = self.allocate_page(freelist::AllocMode::Any)?;
        let usable = self.usable;
        {
            let data = self.new_page_buffer(pgno)?;
            data.fill(0);
            zero_page(pgno, data, page_type, usable);
        }
        if self.auto_vacuum.is_enabled() {
            self.ptrmap_put(pgno, vacuum::PtrmapType::RootPage, 0)?;
            let largest = self.hdr_get32(HDR_LARGEST_ROOT)?;
            if pgno > largest {
                self.hdr_put32(HDR_LARGEST_ROOT, pgno)?;
            }
        }
        debug!("created tree root {}", pgno);
        Ok(pgno)
    }

    pub(crate) fn open_cursor(
        &mut self,
        root: Pgno,
        writable: bool,
        key_info: Option<KeyInfo>,
    ) -> Result<usize> {
        if root == 0 || root > self.pager.page_count() {
            return Err(BtreeError::corrupt("cursor root out of range"));
        }
        if writable && self.in_transaction != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        let cursor = BtCursor::new(root, writable, key_info);
        for (i, slot) in self.cursors.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(cursor);
                return Ok(i);
            }
        }
        self.cursors.push(Some(cursor));
        Ok(self.cursors.len() - 1)
    }

    pub(crate) fn close_cursor(&mut self, id: usize) {
        if let Some(slot) = self.cursors.get_mut(id) {
            *slot = None;
        }
        while matches!(self.cursors.last(), Some(None)) {
            self.cursors.pop();
        }
    }

    /// Trip writable cursors and save the positions of read cursors, as
    /// rollback requires.
    fn rollback_cursors(&mut self) -> Result<()> {
        for id in 0..self.cursors.len() {
            let Some(cur) = self.cursors[id].as_ref() else {
                continue;
            };
            if cur.is_writable() {
                self.trip_cursor(id)?;
            } else {
                self.save_cursor_position(id)?;
            }
        }
        Ok(())
    }

    /// Delete every entry of the tree at `root`, freeing all its pages
    /// except the root itself (left as an empty leaf). Returns the number
    /// of entries removed.
    pub(crate) fn clear_table(&mut self, root: Pgno) -> Result<i64> {
        self.save_all_cursors(root, None)?;
        let mut count = 0i64;
        self.clear_tree_page(root, false, &mut count, 0)?;
        debug!("cleared tree {}: {} entries", root, count);
        Ok(count)
    }

    fn clear_tree_page(
        &mut self,
        pgno: Pgno,
        free: bool,
        count: &mut i64,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(BtreeError::corrupt("tree deeper than cursor limit"));
        }
        let data = self.pager.snapshot(pgno)?;
        let pg = MemPage::init(pgno, &data, self.usable)?;
        let countable = pg.page_type.is_leaf() || pg.page_type == PageType::InteriorIndex;

        for i in 0..pg.n_cell {
            let offset = pg.cell_offset(&data, i)?;
            if pg.page_type.is_interior() {
                let child = pg.cell_left_child(&data, offset);
                self.clear_tree_page(child, true, count, depth + 1)?;
            }
            self.clear_cell(pgno, offset)?;
            if countable {
                *count += 1;
            }
        }
        if pg.page_type.is_interior() {
            self.clear_tree_page(pg.right_child(&data), true, count, depth + 1)?;
        }

        if free {
            self.free_page(pgno)?;
        } else {
            let usable = self.usable;
            let leaf_type = pg.page_type.as_leaf();
            let data = self.pager.get_mut(pgno)?;
            zero_page(pgno, data, leaf_type, usable);
        }
        Ok(())
    }

    /// Remove the tree at `root` entirely. Under auto-vacuum the
    /// highest-numbered root is relocated into the freed slot; the page
    /// number it vacated is returned so the schema layer can re-point
    /// that table (zero when nothing moved).
    pub(crate) fn drop_table(&mut self, root: Pgno) -> Result<Pgno> {
        if root < 2 {
            return Err(BtreeError::corrupt("cannot drop the schema tree"));
        }
        if self.cursors.iter().flatten().any(|c| c.root == root) {
            return Err(BtreeError::Locked { root });
        }
        let mut count = 0i64;
        self.clear_tree_page(root, false, &mut count, 0)?;

        if !self.auto_vacuum.is_enabled() {
            self.free_page(root)?;
            return Ok(0);
        }

        let max_root = self.hdr_get32(HDR_LARGEST_ROOT)?;
        let moved = if max_root <= root {
            self.free_page(root)?;
            0
        } else {
            let (kind, _) = self.ptrmap_get(max_root)?;
            if kind != vacuum::PtrmapType::RootPage {
                return Err(BtreeError::corrupt("largest-root bookkeeping"));
            }
            self.relocate_page(max_root, vacuum::PtrmapType::RootPage, 0, root)?;
            self.free_page(max_root)?;
            max_root
        };

        let mut new_max = max_root.saturating_sub(1).max(1);
        while new_max > 1 && (self.is_ptrmap_page(new_max) || new_max == self.pending_page()) {
            new_max -= 1;
        }
        self.hdr_put32(HDR_LARGEST_ROOT, new_max)?;
        Ok(moved)
    }

    /// Count the entries in a tree by walking it.
    pub(crate) fn count_entries(&mut self, root: Pgno) -> Result<i64> {
        let key_info = {
            let data = self.pager.get(root)?;
            let pg = MemPage::init(root, data, self.usable)?;
            if pg.page_type.is_index() {
                Some(KeyInfo::default())
            } else {
                None
            }
        };
        let id = self.open_cursor(root, false, key_info)?;
        let mut count = 0i64;
        let mut more = self.cursor_first(id)?;
        while more {
            count += 1;
            more = self.cursor_next(id)?;
        }
        self.close_cursor(id);
        Ok(count)
    }

    fn get_meta(&mut self, idx: usize) -> Result<u32> {
        if idx > 15 {
            return Err(BtreeError::corrupt("metadata slot"));
        }
        self.hdr_get32(36 + 4 * idx)
    }

    fn update_meta(&mut self, idx: usize, value: u32) -> Result<()> {
        if idx == 0 || idx > 15 {
            return Err(BtreeError::corrupt("metadata slot"));
        }
        self.hdr_put32(36 + 4 * idx, value)
    }

    // Shared-cache table locks.

    /// Would granting `handle` a lock on `root` violate the lock rules?
    pub(crate) fn query_table_lock(
        &self,
        handle: u64,
        root: Pgno,
        exclusive: bool,
        read_uncommitted: bool,
    ) -> Result<()> {
        // Read-uncommitted handles bypass read locks entirely
        if read_uncommitted && !exclusive {
            return Ok(());
        }
        // A write lock on the schema root satisfies any write request
        if exclusive
            && self
                .locks
                .iter()
                .any(|l| l.handle == handle && l.root == 1 && l.exclusive)
        {
            return Ok(());
        }
        for lock in &self.locks {
            if lock.root == root && lock.handle != handle && (exclusive || lock.exclusive) {
                return Err(BtreeError::LockedSharedCache { root });
            }
        }
        Ok(())
    }

    pub(crate) fn lock_table(&mut self, handle: u64, root: Pgno, exclusive: bool) {
        for lock in &mut self.locks {
            if lock.handle == handle && lock.root == root {
                lock.exclusive |= exclusive;
                return;
            }
        }
        self.locks.push(BtLock {
            handle,
            root,
            exclusive,
        });
    }

    fn unlock_all(&mut self, handle: u64) {
        self.locks.retain(|l| l.handle != handle);
        if self.writer == Some(handle) {
            self.writer = None;
            self.bts_flags &= !(BTS_PENDING | BTS_EXCLUSIVE);
            self.has_content.clear();
            self.pending.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(page_size: u32, auto_vacuum: AutoVacuum) -> BtShared {
        let pager = Pager::open_memory(page_size);
        let opts = OpenOptions {
            auto_vacuum,
            ..OpenOptions::default()
        };
        let mut bt = BtShared::from_pager(pager, &opts).expect("fresh shared state");
        bt.pager.begin_write().expect("in-memory write tx");
        bt.init_new_db().expect("database init");
        bt.in_transaction = TransState::Write;
        bt
    }
}

/// Options for opening a database.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub page_size: u32,
    pub reserved_bytes: u8,
    pub auto_vacuum: AutoVacuum,
    pub secure_delete: bool,
    pub read_only: bool,
    /// Attach to an existing open database on the same path instead of
    /// failing with `Constraint`
    pub shared_cache: bool,
    /// Take the exclusive flag on write transactions, blocking new
    /// readers until commit
    pub exclusive: bool,
    pub cache_size: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            page_size: 4096,
            reserved_bytes: 0,
            auto_vacuum: AutoVacuum::Off,
            secure_delete: false,
            read_only: false,
            shared_cache: false,
            exclusive: false,
            cache_size: 2000,
        }
    }
}

/// Registry of shared B-trees keyed by path. A process-wide (per-thread)
/// instance backs `Btree::open`; tests construct private registries.
#[derive(Default)]
pub struct Registry {
    inner: RefCell<HashMap<PathBuf, Weak<RefCell<BtShared>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    fn open(&self, path: &Path, opts: &OpenOptions) -> Result<Rc<RefCell<BtShared>>> {
        let key = path.to_path_buf();
        let mut map = self.inner.borrow_mut();
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            if !opts.shared_cache {
                return Err(BtreeError::Constraint);
            }
            return Ok(existing);
        }
        let pager = Pager::open(path, opts.page_size, opts.read_only)?;
        let mut shared = BtShared::from_pager(pager, opts)?;
        shared.pager.set_cache_size(opts.cache_size);
        let rc = Rc::new(RefCell::new(shared));
        map.insert(key, Rc::downgrade(&rc));
        Ok(rc)
    }
}

thread_local! {
    static GLOBAL_REGISTRY: Registry = Registry::new();
}

/// A connection handle onto one B-tree file.
pub struct Btree {
    shared: Rc<RefCell<BtShared>>,
    handle: u64,
    in_trans: TransState,
    read_uncommitted: bool,
    exclusive: bool,
    busy_handler: Option<Box<dyn FnMut(u32) -> bool>>,
}

impl Btree {
    /// Open a database file through the per-thread shared-cache registry.
    pub fn open(path: impl AsRef<Path>, opts: OpenOptions) -> Result<Btree> {
        GLOBAL_REGISTRY.with(|reg| Btree::open_with_registry(path.as_ref(), opts, reg))
    }

    /// Open through an explicit registry; used by tests that need an
    /// isolated shared cache.
    pub fn open_with_registry(path: &Path, opts: OpenOptions, registry: &Registry) -> Result<Btree> {
        let shared = registry.open(path, &opts)?;
        let handle = {
            let mut sh = shared.borrow_mut();
            let id = sh.next_handle;
            sh.next_handle += 1;
            id
        };
        Ok(Btree {
            shared,
            handle,
            in_trans: TransState::None,
            read_uncommitted: false,
            exclusive: opts.exclusive,
            busy_handler: None,
        })
    }

    /// Open an ephemeral in-memory database.
    pub fn open_in_memory(opts: OpenOptions) -> Result<Btree> {
        let pager = Pager::open_memory(opts.page_size);
        let shared = BtShared::from_pager(pager, &opts)?;
        Ok(Btree {
            shared: Rc::new(RefCell::new(shared)),
            handle: 1,
            in_trans: TransState::None,
            read_uncommitted: false,
            exclusive: opts.exclusive,
            busy_handler: None,
        })
    }

    pub fn set_busy_handler(&mut self, handler: Box<dyn FnMut(u32) -> bool>) {
        self.busy_handler = Some(handler);
    }

    /// Install a busy handler that retries the given number of times
    /// before giving up.
    pub fn set_busy_timeout(&mut self, retries: u32) {
        self.busy_handler = Some(Box::new(move |attempt| attempt < retries));
    }

    pub fn set_read_uncommitted(&mut self, yes: bool) {
        self.read_uncommitted = yes;
    }

    pub fn trans_state(&self) -> TransState {
        self.in_trans
    }

    pub fn page_count(&self) -> Pgno {
        self.shared.borrow().pager.page_count()
    }

    pub fn page_size(&self) -> u32 {
        self.shared.borrow().pager.page_size()
    }

    /// Begin (or upgrade to) a transaction. Busy conflicts run through
    /// the busy handler, except when this handle already holds a read
    /// transaction: then `Busy` returns at once to avoid a deadlock.
    pub fn begin_trans(&mut self, write: bool) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            match self.try_begin(write) {
                Err(BtreeError::Busy) => {
                    if self.in_trans != TransState::None {
                        return Err(BtreeError::Busy);
                    }
                    let retry = match &mut self.busy_handler {
                        Some(handler) => handler(attempts),
                        None => false,
                    };
                    attempts += 1;
                    if !retry {
                        return Err(BtreeError::Busy);
                    }
                }
                other => return other,
            }
        }
    }

    fn try_begin(&mut self, write: bool) -> Result<()> {
        let mut sh = self.shared.borrow_mut();
        if write && sh.pager.is_read_only() {
            return Err(BtreeError::ReadOnly);
        }
        if self.in_trans == TransState::Write || (self.in_trans == TransState::Read && !write) {
            return Ok(());
        }
        // A pending or exclusive writer blocks new transactions;
        // read-uncommitted readers slip past the pending flag only
        let gated = sh.bts_flags & BTS_EXCLUSIVE != 0
            || (sh.bts_flags & BTS_PENDING != 0 && !(self.read_uncommitted && !write));
        if self.in_trans == TransState::None && gated && sh.writer != Some(self.handle) {
            return Err(BtreeError::Busy);
        }
        if write && sh.writer.is_some() && sh.writer != Some(self.handle) {
            return Err(BtreeError::Busy);
        }

        // Every transaction reads the schema: take the page-1 lock
        sh.query_table_lock(self.handle, 1, false, self.read_uncommitted)?;

        if write {
            sh.pager.begin_write()?;
            sh.init_new_db()?;
            sh.writer = Some(self.handle);
            sh.in_transaction = TransState::Write;
            sh.bts_flags |= BTS_PENDING;
            if self.exclusive {
                sh.bts_flags |= BTS_EXCLUSIVE;
            }
        } else if sh.in_transaction == TransState::None {
            sh.in_transaction = TransState::Read;
        }
        if self.in_trans == TransState::None {
            sh.n_transaction += 1;
        }
        sh.lock_table(self.handle, 1, false);
        self.in_trans = if write {
            TransState::Write
        } else {
            TransState::Read
        };
        debug!(
            "handle {} begins {:?} transaction",
            self.handle, self.in_trans
        );
        Ok(())
    }

    /// First half of a commit: auto-vacuum if configured, header sync,
    /// and the journal flush. `master_journal` is accepted for interface
    /// compatibility; this pager keeps its journal in memory.
    pub fn commit_phase_one(&mut self, master_journal: Option<&str>) -> Result<()> {
        let _ = master_journal;
        if self.in_trans != TransState::Write {
            return Ok(());
        }
        let mut sh = self.shared.borrow_mut();
        if sh
            .cursors
            .iter()
            .flatten()
            .any(|c| c.is_writable() && c.state == CursorState::Fault)
        {
            return Err(BtreeError::Abort);
        }
        if !sh.pending.is_empty() {
            return Err(BtreeError::corrupt("unbalanced cells at commit"));
        }
        if sh.auto_vacuum == AutoVacuum::Full {
            sh.auto_vacuum_commit()?;
        }
        sh.sync_header()?;
        sh.pager.commit_phase_one()
    }

    /// Second half: finalise the journal and fall back to a read
    /// transaction.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        if self.in_trans != TransState::Write {
            return Ok(());
        }
        let mut sh = self.shared.borrow_mut();
        sh.pager.commit_phase_two()?;
        sh.has_content.clear();
        sh.writer = None;
        sh.bts_flags &= !(BTS_PENDING | BTS_EXCLUSIVE);
        sh.in_transaction = TransState::Read;
        let handle = self.handle;
        for lock in sh.locks.iter_mut().filter(|l| l.handle == handle) {
            lock.exclusive = false;
        }
        self.in_trans = TransState::Read;
        Ok(())
    }

    /// Commit and close the transaction entirely.
    pub fn commit(&mut self) -> Result<()> {
        self.commit_phase_one(None)?;
        self.commit_phase_two()?;
        self.end_transaction();
        Ok(())
    }

    /// Abandon the transaction. Write cursors are tripped (subsequent
    /// operations return `Abort`); read cursors have their positions
    /// saved and re-seek transparently.
    pub fn rollback(&mut self) -> Result<()> {
        if self.in_trans == TransState::Write {
            let mut sh = self.shared.borrow_mut();
            sh.rollback_cursors()?;
            sh.pending.clear();
            sh.pager.rollback();
            sh.has_content.clear();
        }
        self.end_transaction();
        Ok(())
    }

    fn end_transaction(&mut self) {
        let mut sh = self.shared.borrow_mut();
        if self.in_trans != TransState::None {
            sh.n_transaction = sh.n_transaction.saturating_sub(1);
            if sh.n_transaction == 0 {
                sh.in_transaction = TransState::None;
            }
        }
        let handle = self.handle;
        sh.unlock_all(handle);
        self.in_trans = TransState::None;
    }

    /// Open a nested savepoint inside a write transaction.
    pub fn open_savepoint(&mut self) -> Result<usize> {
        if self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        Ok(self.shared.borrow_mut().pager.open_savepoint())
    }

    /// Release or roll back a savepoint. Index `-1` with `Rollback`
    /// undoes the whole transaction while keeping it (and its locks)
    /// open.
    pub fn savepoint(&mut self, op: SavepointOp, index: i32) -> Result<()> {
        if self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        let mut sh = self.shared.borrow_mut();
        match op {
            SavepointOp::Release => {
                if index < 0 {
                    return Err(BtreeError::corrupt("savepoint index"));
                }
                sh.pager.release_savepoint(index as usize);
            }
            SavepointOp::Rollback => {
                sh.rollback_cursors()?;
                sh.pending.clear();
                if index < 0 {
                    sh.pager.rollback_keep_open();
                } else {
                    sh.pager.rollback_savepoint(index as usize);
                }
            }
        }
        Ok(())
    }

    /// Open a cursor on the tree rooted at `root`. Index trees take the
    /// comparator description; table trees pass `None`.
    pub fn open_cursor(
        &mut self,
        root: Pgno,
        writable: bool,
        key_info: Option<KeyInfo>,
    ) -> Result<Cursor> {
        if self.in_trans == TransState::None {
            self.begin_trans(false)?;
        }
        if writable && self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        let mut sh = self.shared.borrow_mut();
        sh.query_table_lock(self.handle, root, writable, self.read_uncommitted)?;
        if !(self.read_uncommitted && !writable) {
            sh.lock_table(self.handle, root, writable);
        }
        let id = sh.open_cursor(root, writable, key_info)?;
        Ok(Cursor {
            shared: Rc::clone(&self.shared),
            id,
        })
    }

    /// Create a new empty tree and return its root page number.
    pub fn create_table(&mut self, kind: TableKind) -> Result<Pgno> {
        if self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        let page_type = match kind {
            TableKind::IntKey => PageType::LeafTable,
            TableKind::Index => PageType::LeafIndex,
        };
        self.shared.borrow_mut().btree_create_root(page_type)
    }

    /// Delete every row of a tree; the root page stays. Returns the
    /// number of entries removed.
    pub fn clear_table(&mut self, root: Pgno) -> Result<i64> {
        if self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        self.shared.borrow_mut().clear_table(root)
    }

    /// Remove a tree entirely. Returns the page number of the root that
    /// was moved into the freed slot under auto-vacuum (zero otherwise).
    pub fn drop_table(&mut self, root: Pgno) -> Result<Pgno> {
        if self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        self.shared.borrow_mut().drop_table(root)
    }

    /// Number of entries in the tree at `root`.
    pub fn entry_count(&mut self, root: Pgno) -> Result<i64> {
        if self.in_trans == TransState::None {
            self.begin_trans(false)?;
        }
        self.shared.borrow_mut().count_entries(root)
    }

    /// Read one of the header metadata slots (schema cookie and friends).
    pub fn get_meta(&mut self, idx: usize) -> Result<u32> {
        if self.in_trans == TransState::None {
            self.begin_trans(false)?;
        }
        self.shared.borrow_mut().get_meta(idx)
    }

    /// Update a header metadata slot.
    pub fn update_meta(&mut self, idx: usize, value: u32) -> Result<()> {
        if self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        self.shared.borrow_mut().update_meta(idx, value)
    }

    /// One incremental-vacuum step. `Done` signals there is nothing left
    /// to reclaim.
    pub fn incr_vacuum(&mut self) -> Result<()> {
        if self.in_trans != TransState::Write {
            return Err(BtreeError::ReadOnly);
        }
        let mut sh = self.shared.borrow_mut();
        if !sh.auto_vacuum.is_enabled() {
            return Err(BtreeError::Done);
        }
        sh.incr_vacuum()
    }

    /// Structural verification of the trees rooted at `roots` plus the
    /// free-list and, under auto-vacuum, the pointer map.
    pub fn integrity_check(&mut self, roots: &[Pgno], max_errors: usize) -> Result<CheckReport> {
        if self.in_trans == TransState::None {
            self.begin_trans(false)?;
        }
        self.shared.borrow_mut().integrity_check(roots, max_errors)
    }

    /// Shape statistics for one tree; the inspection surface behind the
    /// CLI.
    pub fn tree_stats(&mut self, root: Pgno) -> Result<TreeStats> {
        if self.in_trans == TransState::None {
            self.begin_trans(false)?;
        }
        let mut sh = self.shared.borrow_mut();
        let mut stats = TreeStats {
            root,
            ..TreeStats::default()
        };
        collect_tree_stats(&mut sh, root, 0, &mut stats)?;
        Ok(stats)
    }

    /// Parsed copy of the database header.
    pub fn header(&mut self) -> Result<DbHeader> {
        if self.in_trans == TransState::None {
            self.begin_trans(false)?;
        }
        let mut sh = self.shared.borrow_mut();
        let data = sh.pager.get(1)?;
        parse_db_header(data)
    }
}

impl Drop for Btree {
    fn drop(&mut self) {
        if self.in_trans == TransState::Write {
            let _ = self.rollback();
        } else if self.in_trans == TransState::Read {
            self.end_transaction();
        }
    }
}

/// Shape statistics for one tree.
#[derive(Debug, Default, Clone, Serialize)]
pub struct TreeStats {
    pub root: Pgno,
    pub depth: usize,
    pub interior_pages: u32,
    pub leaf_pages: u32,
    pub overflow_pages: u32,
    pub cells: u64,
}

fn collect_tree_stats(
    sh: &mut BtShared,
    pgno: Pgno,
    depth: usize,
    stats: &mut TreeStats,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(BtreeError::corrupt("tree deeper than cursor limit"));
    }
    let data = sh.pager.snapshot(pgno)?;
    let pg = MemPage::init(pgno, &data, sh.usable)?;
    stats.depth = stats.depth.max(depth + 1);
    stats.cells += pg.n_cell as u64;
    if pg.page_type.is_interior() {
        stats.interior_pages += 1;
    } else {
        stats.leaf_pages += 1;
    }
    for i in 0..pg.n_cell {
        let offset = pg.cell_offset(&data, i)?;
        let info = pg.parse_cell(&data, offset)?;
        if info.overflow != 0 {
            let per_page = sh.usable - 4;
            stats.overflow_pages += (info.n_payload - info.n_local).div_ceil(per_page);
        }
        if pg.page_type.is_interior() {
            let child = pg.cell_left_child(&data, offset);
            collect_tree_stats(sh, child, depth + 1, stats)?;
        }
    }
    if pg.page_type.is_interior() {
        let right = pg.right_child(&data);
        collect_tree_stats(sh, right, depth + 1, stats)?;
    }
    Ok(())
}

/// A stateful position within one tree. Dropping the cursor closes it.
pub struct Cursor {
    shared: Rc<RefCell<BtShared>>,
    id: usize,
}

impl Cursor {
    fn ensure_positioned(&self, sh: &mut BtShared) -> Result<()> {
        if sh.cur(self.id)?.state == CursorState::RequiresSeek {
            sh.cursor_restore(self.id)?;
        }
        Ok(())
    }

    /// Move to the first entry; false when the tree is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.shared.borrow_mut().cursor_first(self.id)
    }

    /// Move to the last entry; false when the tree is empty.
    pub fn last(&mut self) -> Result<bool> {
        self.shared.borrow_mut().cursor_last(self.id)
    }

    /// Advance; false once the entries are exhausted.
    pub fn next(&mut self) -> Result<bool> {
        self.shared.borrow_mut().cursor_next(self.id)
    }

    /// Step backward; false at the start of the tree.
    pub fn previous(&mut self) -> Result<bool> {
        self.shared.borrow_mut().cursor_previous(self.id)
    }

    /// Position at `key`. Returns the ordering of the landing cell
    /// relative to the key: negative (smaller), zero (exact), positive
    /// (larger).
    pub fn seek(&mut self, key: SeekKey<'_>, bias_right: bool) -> Result<i8> {
        self.shared.borrow_mut().cursor_seek(self.id, &key, bias_right)
    }

    /// Rowid of the current entry for table trees; the key record size
    /// for index trees.
    pub fn key_size(&mut self) -> Result<i64> {
        let mut sh = self.shared.borrow_mut();
        self.ensure_positioned(&mut sh)?;
        let info = sh.cursor_cell_info(self.id)?;
        if sh.cur(self.id)?.key_info.is_none() {
            Ok(info.key)
        } else {
            Ok(info.n_payload as i64)
        }
    }

    /// Payload size of the current entry.
    pub fn data_size(&mut self) -> Result<u32> {
        let mut sh = self.shared.borrow_mut();
        self.ensure_positioned(&mut sh)?;
        Ok(sh.cursor_cell_info(self.id)?.n_payload)
    }

    /// Read key-record bytes (index trees).
    pub fn read_key(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let mut sh = self.shared.borrow_mut();
        self.ensure_positioned(&mut sh)?;
        sh.cursor_read_payload(self.id, offset, buf)
    }

    /// Read payload bytes (table trees).
    pub fn read_data(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let mut sh = self.shared.borrow_mut();
        self.ensure_positioned(&mut sh)?;
        sh.cursor_read_payload(self.id, offset, buf)
    }

    /// Overwrite payload bytes in place without resizing; the incremental
    /// blob write path.
    pub fn write_data(&mut self, offset: u32, buf: &[u8]) -> Result<()> {
        let mut sh = self.shared.borrow_mut();
        self.ensure_positioned(&mut sh)?;
        sh.cursor_write_payload(self.id, offset, buf)
    }

    /// Insert an entry. `append` biases the initial probe toward the high
    /// end; `seek_hint` carries the result of a seek for the same key the
    /// caller already performed; `save_position` re-seeks the cursor to
    /// the new entry after any rebalance instead of invalidating it.
    pub fn insert(
        &mut self,
        entry: Entry<'_>,
        append: bool,
        seek_hint: Option<i8>,
        save_position: bool,
    ) -> Result<()> {
        self.shared
            .borrow_mut()
            .cursor_insert(self.id, &entry, append, seek_hint, save_position)
    }

    /// Delete the current entry. With `save_position` the cursor re-seeks
    /// next to the deleted key afterwards.
    pub fn delete(&mut self, save_position: bool) -> Result<()> {
        self.shared.borrow_mut().cursor_delete(self.id, save_position)
    }

    /// Whether the cursor was moved off its entry by another cursor's
    /// mutation (or never positioned).
    pub fn has_moved(&self) -> Result<bool> {
        self.shared.borrow().cursor_has_moved(self.id)
    }

    /// Explicitly re-seek a saved cursor.
    pub fn restore(&mut self) -> Result<()> {
        self.shared.borrow_mut().cursor_restore(self.id)
    }

    /// Current state, for callers that want to inspect the lifecycle.
    pub fn state(&self) -> CursorState {
        self.shared
            .borrow()
            .cur(self.id)
            .map(|c| c.state)
            .unwrap_or(CursorState::Fault)
    }

    /// Close the cursor, releasing its slot. Dropping does the same.
    pub fn close(self) {}
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.shared.borrow_mut().close_cursor(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db(opts: OpenOptions) -> Btree {
        Btree::open_in_memory(opts).unwrap()
    }

    fn opts_with_page(page_size: u32) -> OpenOptions {
        OpenOptions {
            page_size,
            ..OpenOptions::default()
        }
    }

    /// Append 1..=1000 then iterate them back with a fresh cursor.
    #[test]
    fn scenario_append_and_iterate() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        let payload = [0x5Au8; 50];
        {
            let mut cur = db.open_cursor(root, true, None).unwrap();
            for rowid in 1..=1000i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: &payload,
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }
        db.commit().unwrap();

        db.begin_trans(false).unwrap();
        let mut cur = db.open_cursor(root, false, None).unwrap();
        assert!(cur.first().unwrap());
        for expect in 1..=1000i64 {
            assert_eq!(cur.key_size().unwrap(), expect);
            let more = cur.next().unwrap();
            assert_eq!(more, expect != 1000);
        }
        // One more advance stays at the end
        assert!(!cur.next().unwrap());
    }

    /// A 20000-byte payload on a 4096-byte page spills by the documented
    /// formula and reads back intact through its chain.
    #[test]
    fn scenario_overflow_round_trip() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();

        let payload: Vec<u8> = (0..20000u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
        let mut cur = db.open_cursor(root, true, None).unwrap();
        cur.insert(
            Entry::Table {
                rowid: 42,
                data: &payload,
            },
            false,
            None,
            false,
        )
        .unwrap();

        assert_eq!(cur.seek(SeekKey::Rowid(42), false).unwrap(), 0);
        assert_eq!(cur.data_size().unwrap(), 20000);

        let usable = 4096u32;
        let (max_local, min_local) = page::payload_limits(page::PageType::LeafTable, usable);
        let n_local = page::local_payload_size(max_local, min_local, usable, 20000);
        let chain = (20000 - n_local).div_ceil(usable - 4);

        let mut out = vec![0u8; 20000];
        cur.read_data(0, &mut out).unwrap();
        assert_eq!(out, payload);

        let stats = {
            drop(cur);
            db.tree_stats(root).unwrap()
        };
        assert_eq!(stats.overflow_pages, chain);
    }

    /// Enough 400-byte rows to force three levels; invariants hold along
    /// the way and the file stays dense.
    #[test]
    fn scenario_split_under_append() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        let payload = [7u8; 400];
        let n = 2000i64;
        {
            let mut cur = db.open_cursor(root, true, None).unwrap();
            for rowid in 1..=n {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: &payload,
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
                if rowid % 250 == 0 {
                    drop(cur);
                    let report = db.integrity_check(&[root], 50).unwrap();
                    assert!(report.ok(), "after {rowid}: {:?}", report.errors);
                    cur = db.open_cursor(root, true, None).unwrap();
                }
            }
        }

        let stats = db.tree_stats(root).unwrap();
        assert!(stats.depth >= 3, "tree depth {}", stats.depth);

        let mut cur = db.open_cursor(root, false, None).unwrap();
        assert!(cur.first().unwrap());
        for expect in 1..=n {
            assert_eq!(cur.key_size().unwrap(), expect);
            if expect < n {
                assert!(cur.next().unwrap());
            }
        }
        drop(cur);

        let bound = (n as u64 * 400).div_ceil(4096) as f64 * 1.1;
        assert!(
            (db.page_count() as f64) <= bound + 4.0,
            "{} pages exceeds bound {bound}",
            db.page_count()
        );
    }

    /// Cursor restoration across a delete and re-insert by another
    /// cursor.
    #[test]
    fn scenario_cursor_restoration_across_delete() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        {
            let mut w = db.open_cursor(root, true, None).unwrap();
            for rowid in 99..=102i64 {
                w.insert(
                    Entry::Table {
                        rowid,
                        data: b"before",
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }

        let mut a = db.open_cursor(root, false, None).unwrap();
        assert_eq!(a.seek(SeekKey::Rowid(100), false).unwrap(), 0);

        let mut b = db.open_cursor(root, true, None).unwrap();
        assert_eq!(b.seek(SeekKey::Rowid(100), false).unwrap(), 0);
        b.delete(false).unwrap();
        b.insert(
            Entry::Table {
                rowid: 100,
                data: b"afterwards",
            },
            false,
            None,
            false,
        )
        .unwrap();

        assert!(a.has_moved().unwrap());
        a.restore().unwrap();
        assert_eq!(a.state(), CursorState::SkipNext);
        assert!(a.next().unwrap());
        assert_eq!(a.key_size().unwrap(), 101);
    }

    /// Incremental vacuum reclaims freed pages until Done, shrinking
    /// monotonically to the predicted size.
    #[test]
    fn scenario_incremental_vacuum() {
        let mut db = mem_db(OpenOptions {
            page_size: 512,
            auto_vacuum: AutoVacuum::Incremental,
            ..OpenOptions::default()
        });
        db.begin_trans(true).unwrap();
        let keep = db.create_table(TableKind::IntKey).unwrap();
        let scratch = db.create_table(TableKind::IntKey).unwrap();
        let payload = [3u8; 300];
        {
            let mut cur = db.open_cursor(keep, true, None).unwrap();
            for rowid in 1..=40i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: &payload,
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
            let mut cur = db.open_cursor(scratch, true, None).unwrap();
            for rowid in 1..=120i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: &payload,
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }
        // Free a large block of pages
        db.clear_table(scratch).unwrap();

        let before = db.page_count();
        let n_free = db.get_meta(0).unwrap();
        assert!(n_free > 0);
        let predicted = {
            let sh = db.shared.borrow_mut();
            sh.final_db_size(before, n_free)
        };

        let mut last = before;
        loop {
            match db.incr_vacuum() {
                Ok(()) => {
                    let now = db.page_count();
                    assert!(now < last, "page count must shrink monotonically");
                    last = now;
                }
                Err(BtreeError::Done) => break,
                Err(e) => panic!("vacuum error: {e}"),
            }
        }
        assert_eq!(db.page_count(), predicted);

        let report = db.integrity_check(&[keep, scratch], 50).unwrap();
        assert!(report.ok(), "{:?}", report.errors);
        db.commit().unwrap();
    }

    /// Rollback restores page 1 byte for byte and read cursors survive.
    #[test]
    fn scenario_rollback_restores_page_one() {
        let dir = std::env::temp_dir().join("sqlite-btree-lib-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rollback.db");
        let _ = std::fs::remove_file(&path);

        let registry = Registry::new();
        let mut db =
            Btree::open_with_registry(&path, opts_with_page(4096), &registry).unwrap();
        db.begin_trans(true).unwrap();
        let t1 = db.create_table(TableKind::IntKey).unwrap();
        let t2 = db.create_table(TableKind::IntKey).unwrap();
        {
            let mut cur = db.open_cursor(t1, true, None).unwrap();
            for rowid in 1..=20i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: b"committed",
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }
        db.commit().unwrap();

        let page1_before = db.shared.borrow_mut().pager.snapshot(1).unwrap();
        let count_before = db.page_count();

        // Cursor opened before the doomed transaction
        db.begin_trans(false).unwrap();
        let mut reader = db.open_cursor(t1, false, None).unwrap();
        assert!(reader.first().unwrap());
        drop(reader);
        db.rollback().unwrap();

        db.begin_trans(true).unwrap();
        let mut reader = db.open_cursor(t1, false, None).unwrap();
        assert!(reader.first().unwrap());
        {
            let mut cur = db.open_cursor(t2, true, None).unwrap();
            for rowid in 1..=200i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: &[9u8; 200],
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }
        // Force a page-1 write inside the transaction
        db.update_meta(1, 0xDEAD).unwrap();
        drop(reader);
        db.rollback().unwrap();

        let page1_after = db.shared.borrow_mut().pager.snapshot(1).unwrap();
        assert_eq!(page1_before, page1_after);
        assert_eq!(db.page_count(), count_before);
        assert_eq!(
            header::get_u32(&page1_after, header::HDR_DB_SIZE),
            count_before
        );

        // The earlier data still reads correctly
        db.begin_trans(false).unwrap();
        let mut cur = db.open_cursor(t1, false, None).unwrap();
        assert!(cur.first().unwrap());
        let mut n = 1i64;
        while cur.next().unwrap() {
            n += 1;
        }
        assert_eq!(n, 20);
        drop(cur);
        drop(db);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_second_writer_gets_busy() {
        let dir = std::env::temp_dir().join("sqlite-btree-lib-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("busy.db");
        let _ = std::fs::remove_file(&path);

        let registry = Registry::new();
        let opts = OpenOptions {
            shared_cache: true,
            ..opts_with_page(4096)
        };
        let mut a = Btree::open_with_registry(&path, opts.clone(), &registry).unwrap();
        let mut b = Btree::open_with_registry(&path, opts, &registry).unwrap();

        a.begin_trans(true).unwrap();
        assert!(matches!(b.begin_trans(true), Err(BtreeError::Busy)));
        // A pending writer also blocks new readers
        assert!(matches!(b.begin_trans(false), Err(BtreeError::Busy)));

        a.commit().unwrap();
        b.begin_trans(true).unwrap();
        b.commit().unwrap();
        drop(a);
        drop(b);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_busy_handler_retries() {
        let dir = std::env::temp_dir().join("sqlite-btree-lib-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("busy-handler.db");
        let _ = std::fs::remove_file(&path);

        let registry = Registry::new();
        let opts = OpenOptions {
            shared_cache: true,
            ..opts_with_page(4096)
        };
        let mut a = Btree::open_with_registry(&path, opts.clone(), &registry).unwrap();
        let mut b = Btree::open_with_registry(&path, opts, &registry).unwrap();

        a.begin_trans(true).unwrap();
        // Handler gives up after three attempts; still Busy
        b.set_busy_handler(Box::new(|attempt| attempt < 3));
        assert!(matches!(b.begin_trans(true), Err(BtreeError::Busy)));
        a.commit().unwrap();
        drop(a);
        drop(b);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_duplicate_open_without_shared_cache_is_constraint() {
        let dir = std::env::temp_dir().join("sqlite-btree-lib-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dup.db");
        let _ = std::fs::remove_file(&path);

        let registry = Registry::new();
        let _a =
            Btree::open_with_registry(&path, opts_with_page(4096), &registry).unwrap();
        assert!(matches!(
            Btree::open_with_registry(&path, opts_with_page(4096), &registry),
            Err(BtreeError::Constraint)
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_savepoint_rollback_keeps_transaction() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        {
            let mut cur = db.open_cursor(root, true, None).unwrap();
            cur.insert(
                Entry::Table {
                    rowid: 1,
                    data: b"kept",
                },
                false,
                None,
                false,
            )
            .unwrap();
        }
        let sp = db.open_savepoint().unwrap();
        {
            let mut cur = db.open_cursor(root, true, None).unwrap();
            for rowid in 2..=50i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: b"doomed",
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }
        db.savepoint(SavepointOp::Rollback, sp as i32).unwrap();
        assert_eq!(db.trans_state(), TransState::Write);

        let mut cur = db.open_cursor(root, false, None).unwrap();
        assert!(cur.first().unwrap());
        assert_eq!(cur.key_size().unwrap(), 1);
        assert!(!cur.next().unwrap());
        drop(cur);
        db.commit().unwrap();
    }

    #[test]
    fn test_full_autovacuum_truncates_on_commit() {
        let mut db = mem_db(OpenOptions {
            page_size: 512,
            auto_vacuum: AutoVacuum::Full,
            ..OpenOptions::default()
        });
        db.begin_trans(true).unwrap();
        let keep = db.create_table(TableKind::IntKey).unwrap();
        let scratch = db.create_table(TableKind::IntKey).unwrap();
        {
            let mut cur = db.open_cursor(scratch, true, None).unwrap();
            for rowid in 1..=100i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: &[1u8; 300],
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }
        db.clear_table(scratch).unwrap();
        db.commit().unwrap();

        // Commit-time compaction emptied the free-list
        db.begin_trans(false).unwrap();
        assert_eq!(db.get_meta(0).unwrap(), 0);
        let report = db.integrity_check(&[keep, scratch], 50).unwrap();
        assert!(report.ok(), "{:?}", report.errors);
    }

    #[test]
    fn test_drop_table_returns_moved_root() {
        let mut db = mem_db(OpenOptions {
            page_size: 512,
            auto_vacuum: AutoVacuum::Incremental,
            ..OpenOptions::default()
        });
        db.begin_trans(true).unwrap();
        let first = db.create_table(TableKind::IntKey).unwrap();
        let last = db.create_table(TableKind::IntKey).unwrap();
        {
            let mut cur = db.open_cursor(last, true, None).unwrap();
            cur.insert(
                Entry::Table {
                    rowid: 5,
                    data: b"moving row",
                },
                false,
                None,
                false,
            )
            .unwrap();
        }
        // Dropping the lower-numbered root pulls the higher one into its
        // slot
        let moved = db.drop_table(first).unwrap();
        assert_eq!(moved, last);

        let mut cur = db.open_cursor(first, false, None).unwrap();
        assert!(cur.first().unwrap());
        assert_eq!(cur.key_size().unwrap(), 5);
        drop(cur);
        db.commit().unwrap();
    }

    #[test]
    fn test_drop_table_without_autovacuum_frees_root() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        let moved = db.drop_table(root).unwrap();
        assert_eq!(moved, 0);
        assert_eq!(db.get_meta(0).unwrap(), 1);
        db.commit().unwrap();
    }

    #[test]
    fn test_drop_table_with_open_cursor_is_locked() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        let _cur = db.open_cursor(root, false, None).unwrap();
        assert!(matches!(
            db.drop_table(root),
            Err(BtreeError::Locked { .. })
        ));
    }

    #[test]
    fn test_clear_table_counts_rows() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        {
            let mut cur = db.open_cursor(root, true, None).unwrap();
            for rowid in 1..=37i64 {
                cur.insert(
                    Entry::Table {
                        rowid,
                        data: b"row",
                    },
                    true,
                    None,
                    false,
                )
                .unwrap();
            }
        }
        assert_eq!(db.clear_table(root).unwrap(), 37);
        assert_eq!(db.entry_count(root).unwrap(), 0);
    }

    #[test]
    fn test_meta_round_trip_and_readonly_rules() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        db.update_meta(1, 77).unwrap();
        assert_eq!(db.get_meta(1).unwrap(), 77);
        // Slot 0 is the free-page count and cannot be set directly
        assert!(db.update_meta(0, 1).is_err());
        db.commit().unwrap();

        assert!(matches!(db.update_meta(1, 78), Err(BtreeError::ReadOnly)));
    }

    #[test]
    fn test_write_cursor_requires_write_transaction() {
        let mut db = mem_db(opts_with_page(4096));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        db.commit().unwrap();

        db.begin_trans(false).unwrap();
        assert!(matches!(
            db.open_cursor(root, true, None),
            Err(BtreeError::ReadOnly)
        ));
    }

    #[test]
    fn test_incrblob_style_overwrite() {
        let mut db = mem_db(opts_with_page(512));
        db.begin_trans(true).unwrap();
        let root = db.create_table(TableKind::IntKey).unwrap();
        let payload = vec![0u8; 3000];
        let mut cur = db.open_cursor(root, true, None).unwrap();
        cur.insert(
            Entry::Table {
                rowid: 1,
                data: &payload,
            },
            false,
            None,
            false,
        )
        .unwrap();

        assert_eq!(cur.seek(SeekKey::Rowid(1), false).unwrap(), 0);
        let patch = [0xEEu8; 512];
        cur.write_data(1000, &patch).unwrap();

        let mut out = vec![0u8; 3000];
        cur.read_data(0, &mut out).unwrap();
        assert_eq!(out[999], 0);
        assert_eq!(&out[1000..1512], &patch[..]);
        assert_eq!(out[1512], 0);
    }

    #[test]
    fn test_read_uncommitted_bypasses_read_locks() {
        let dir = std::env::temp_dir().join("sqlite-btree-lib-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dirty-read.db");
        let _ = std::fs::remove_file(&path);

        let registry = Registry::new();
        let opts = OpenOptions {
            shared_cache: true,
            ..opts_with_page(4096)
        };
        let mut a = Btree::open_with_registry(&path, opts.clone(), &registry).unwrap();
        a.begin_trans(true).unwrap();
        let root = a.create_table(TableKind::IntKey).unwrap();
        a.commit().unwrap();

        // Writer takes a write lock on the table
        a.begin_trans(true).unwrap();
        let _w = a.open_cursor(root, true, None).unwrap();

        let mut b = Btree::open_with_registry(&path, opts, &registry).unwrap();
        b.set_read_uncommitted(true);
        b.begin_trans(false).unwrap();
        // An ordinary reader would be refused; read-uncommitted passes
        let cur = b.open_cursor(root, false, None);
        assert!(cur.is_ok());
        drop(cur);
        drop(_w);
        a.rollback().unwrap();
        drop(a);
        drop(b);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_shared_cache_table_lock_conflict() {
        let dir = std::env::temp_dir().join("sqlite-btree-lib-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("table-lock.db");
        let _ = std::fs::remove_file(&path);

        let registry = Registry::new();
        let opts = OpenOptions {
            shared_cache: true,
            ..opts_with_page(4096)
        };
        let mut a = Btree::open_with_registry(&path, opts.clone(), &registry).unwrap();
        a.begin_trans(true).unwrap();
        let root = a.create_table(TableKind::IntKey).unwrap();
        a.commit().unwrap();

        a.begin_trans(false).unwrap();
        let _ra = a.open_cursor(root, false, None).unwrap();

        // The writer cannot take a write lock while a reads the table
        let mut b = Btree::open_with_registry(&path, opts, &registry).unwrap();
        // No write transaction can even begin while a pending writer is
        // absent but the state machine requires the lock check at cursor
        // open time; use the raw query to show the conflict.
        {
            let sh = b.shared.borrow();
            assert!(matches!(
                sh.query_table_lock(b.handle, root, true, false),
                Err(BtreeError::LockedSharedCache { .. })
            ));
        }
        drop(_ra);
        drop(a);
        drop(b);
        let _ = std::fs::remove_file(&path);
    }
}
