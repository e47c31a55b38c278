use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, trace};
use memmap2::Mmap;

use crate::error::{BtreeError, Result};

/// 1-based page number.
pub type Pgno = u32;

/// Byte offset of the region the host OS uses for advisory locks. The page
/// spanning it is never handed out.
pub const PENDING_BYTE: u64 = 0x4000_0000;

/// Page number of the pending-byte page for a given page size.
pub fn pending_byte_page(page_size: u32) -> Pgno {
    (PENDING_BYTE / page_size as u64) as Pgno + 1
}

/// Original images captured on first write, so a rollback can restore the
/// transaction-start state byte for byte. `None` marks a page that did not
/// exist when the capture was taken.
type ImageMap = HashMap<Pgno, Option<Vec<u8>>>;

struct Journal {
    orig_page_count: Pgno,
    pages: ImageMap,
}

struct SavepointFrame {
    page_count: Pgno,
    pages: ImageMap,
}

/// A minimal transactional pager over a single database file.
///
/// Pages live in an in-memory image keyed by page number; file-backed
/// databases load pages on demand and flush journaled pages on commit.
/// The rollback journal is kept in memory: the durability of a journal
/// file across OS crashes is outside this crate's scope, but rollback
/// semantics are exact.
pub struct Pager {
    file: Option<File>,
    path: Option<PathBuf>,
    /// Read-only view of the last committed file image, used by the
    /// direct overflow-read fast path.
    map: Option<Mmap>,
    page_size: usize,
    page_count: Pgno,
    cache: HashMap<Pgno, Vec<u8>>,
    journal: Option<Journal>,
    savepoints: Vec<SavepointFrame>,
    read_only: bool,
    /// Advisory cache-size knob; this pager never evicts, but the value
    /// is kept for callers that tune it.
    cache_size: u32,
}

impl Pager {
    /// Open a file-backed pager. A missing or empty file starts a fresh
    /// zero-page database with `default_page_size`; otherwise the page
    /// size is taken from the file header.
    pub fn open(path: &Path, default_page_size: u32, read_only: bool) -> Result<Self> {
        let file = if read_only {
            OpenOptions::new().read(true).open(path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?
        };
        let len = file.metadata()?.len();

        let mut page_size = default_page_size as usize;
        let mut map = None;
        if len >= 100 {
            // SAFETY: the mapping is only read through while the pager
            // holds the file open; writers go through this same pager.
            let m = unsafe { Mmap::map(&file)? };
            let raw = u16::from_be_bytes([m[16], m[17]]);
            page_size = if raw == 1 { 65536 } else { raw as usize };
            if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
                return Err(BtreeError::corrupt("bad page size"));
            }
            map = Some(m);
        }

        let page_count = (len as usize / page_size) as Pgno;
        debug!(
            "pager open {:?}: {} pages of {} bytes",
            path, page_count, page_size
        );

        Ok(Pager {
            file: Some(file),
            path: Some(path.to_path_buf()),
            map,
            page_size,
            page_count,
            cache: HashMap::new(),
            journal: None,
            savepoints: Vec::new(),
            read_only,
            cache_size: 2000,
        })
    }

    /// Open an ephemeral in-memory pager.
    pub fn open_memory(page_size: u32) -> Self {
        Pager {
            file: None,
            path: None,
            map: None,
            page_size: page_size as usize,
            page_count: 0,
            cache: HashMap::new(),
            journal: None,
            savepoints: Vec::new(),
            read_only: false,
            cache_size: 2000,
        }
    }

    pub fn cache_size(&self) -> u32 {
        self.cache_size
    }

    pub fn set_cache_size(&mut self, pages: u32) {
        self.cache_size = pages;
    }

    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    pub fn page_count(&self) -> Pgno {
        self.page_count
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn in_write_tx(&self) -> bool {
        self.journal.is_some()
    }

    /// Change the page size before the first page is written. Fails once
    /// the database has pages.
    pub fn set_page_size(&mut self, page_size: u32) -> Result<()> {
        if self.page_count > 0 {
            return Err(BtreeError::ReadOnly);
        }
        self.page_size = page_size as usize;
        Ok(())
    }

    fn load(&mut self, pgno: Pgno) -> Result<()> {
        if self.cache.contains_key(&pgno) {
            return Ok(());
        }
        let mut buf = vec![0u8; self.page_size];
        let offset = (pgno as u64 - 1) * self.page_size as u64;
        if let Some(map) = &self.map {
            let start = offset as usize;
            if start < map.len() {
                let end = (start + self.page_size).min(map.len());
                buf[..end - start].copy_from_slice(&map[start..end]);
            }
        } else if let Some(file) = &mut self.file {
            file.seek(SeekFrom::Start(offset))
                .map_err(|_| BtreeError::IoRead(pgno))?;
            // Reads past EOF stay zero-filled
            let mut read = 0;
            while read < buf.len() {
                match file.read(&mut buf[read..]) {
                    Ok(0) => break,
                    Ok(n) => read += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => return Err(BtreeError::IoRead(pgno)),
                }
            }
        }
        self.cache.insert(pgno, buf);
        Ok(())
    }

    /// Fetch a page for reading.
    pub fn get(&mut self, pgno: Pgno) -> Result<&[u8]> {
        if pgno == 0 || pgno > self.page_count {
            return Err(BtreeError::corrupt("page number out of range"));
        }
        self.load(pgno)?;
        Ok(self.cache.get(&pgno).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Copy of a page's current content.
    pub fn snapshot(&mut self, pgno: Pgno) -> Result<Vec<u8>> {
        Ok(self.get(pgno)?.to_vec())
    }

    fn capture(&mut self, pgno: Pgno) -> Result<()> {
        self.capture_with(pgno, true)
    }

    /// Journal the pre-image of `pgno`. With `load_content` false and the
    /// page not yet cached, a `None` image is recorded instead of reading
    /// the disk: rollback then drops the cache entry and reads fall back
    /// to the committed file image, which is byte-identical.
    ///
    /// The transaction journal and the innermost savepoint frame judge
    /// "did the page exist" against their own start points: a page
    /// created earlier in the transaction has no pre-transaction image
    /// but a real pre-savepoint one.
    fn capture_with(&mut self, pgno: Pgno, load_content: bool) -> Result<()> {
        let in_tx = pgno <= self.journal.as_ref().map_or(0, |j| j.orig_page_count);
        let in_frame = self
            .savepoints
            .last()
            .map_or(false, |f| pgno <= f.page_count);
        let image = if (in_tx || in_frame) && (load_content || self.cache.contains_key(&pgno)) {
            self.load(pgno)?;
            self.cache.get(&pgno).cloned()
        } else {
            None
        };
        if let Some(j) = &mut self.journal {
            let tx_image = if in_tx { image.clone() } else { None };
            j.pages.entry(pgno).or_insert(tx_image);
        }
        if let Some(frame) = self.savepoints.last_mut() {
            frame
                .pages
                .entry(pgno)
                .or_insert(if in_frame { image } else { None });
        }
        Ok(())
    }

    /// Fetch a page for writing. The original image is journaled on the
    /// first write inside the transaction.
    pub fn get_mut(&mut self, pgno: Pgno) -> Result<&mut Vec<u8>> {
        if pgno == 0 || pgno > self.page_count {
            return Err(BtreeError::corrupt("page number out of range"));
        }
        if self.journal.is_none() {
            return Err(BtreeError::ReadOnly);
        }
        self.capture(pgno)?;
        self.load(pgno)?;
        self.cache.get_mut(&pgno).ok_or(BtreeError::IoRead(pgno))
    }

    /// Like `get_mut`, but skips the disk read when the page's prior
    /// content does not matter. Callers must only use this for pages whose
    /// content was never touched inside the current transaction; the
    /// B-tree layer tracks that with its `has_content` set.
    pub fn get_mut_unused(&mut self, pgno: Pgno) -> Result<&mut Vec<u8>> {
        if pgno == 0 || pgno > self.page_count {
            return Err(BtreeError::corrupt("page number out of range"));
        }
        if self.journal.is_none() {
            return Err(BtreeError::ReadOnly);
        }
        self.capture_with(pgno, false)?;
        if !self.cache.contains_key(&pgno) {
            trace!("skipping read of unused page {}", pgno);
            self.cache.insert(pgno, vec![0u8; self.page_size]);
        }
        self.cache.get_mut(&pgno).ok_or(BtreeError::IoRead(pgno))
    }

    /// Grow or shrink the database image. Shrinking journals the pages
    /// being cut off so rollback can bring them back.
    pub fn set_page_count(&mut self, n: Pgno) -> Result<()> {
        if self.journal.is_none() {
            return Err(BtreeError::ReadOnly);
        }
        if n < self.page_count {
            for pgno in n + 1..=self.page_count {
                self.capture(pgno)?;
                self.cache.remove(&pgno);
            }
        }
        self.page_count = n;
        Ok(())
    }

    /// Read a full page straight from the last committed file image,
    /// bypassing the cache. Returns false when the fast path is not
    /// available (no mapping, in-memory database, or a write transaction
    /// is open).
    pub fn read_direct(&self, pgno: Pgno, out: &mut [u8]) -> bool {
        if self.journal.is_some() {
            return false;
        }
        let Some(map) = &self.map else {
            return false;
        };
        let start = (pgno as usize - 1) * self.page_size;
        let end = start + self.page_size;
        if end > map.len() || out.len() < self.page_size {
            return false;
        }
        out[..self.page_size].copy_from_slice(&map[start..end]);
        true
    }

    /// Begin a write transaction.
    pub fn begin_write(&mut self) -> Result<()> {
        if self.read_only {
            return Err(BtreeError::ReadOnly);
        }
        if self.journal.is_none() {
            self.journal = Some(Journal {
                orig_page_count: self.page_count,
                pages: HashMap::new(),
            });
        }
        Ok(())
    }

    /// Flush journaled pages to the file and sync. The transaction stays
    /// open until `commit_phase_two`.
    pub fn commit_phase_one(&mut self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        if let Some(file) = &mut self.file {
            // Drop the stale mapping before the file changes underneath it
            self.map = None;
            let mut dirty: Vec<Pgno> = journal.pages.keys().copied().collect();
            dirty.sort_unstable();
            for pgno in dirty {
                if pgno > self.page_count {
                    continue;
                }
                let Some(data) = self.cache.get(&pgno) else {
                    continue;
                };
                let offset = (pgno as u64 - 1) * self.page_size as u64;
                file.seek(SeekFrom::Start(offset))
                    .map_err(|_| BtreeError::IoWrite(pgno))?;
                file.write_all(data).map_err(|_| BtreeError::IoWrite(pgno))?;
            }
            file.set_len(self.page_count as u64 * self.page_size as u64)?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Finalize the transaction and refresh the read mapping.
    pub fn commit_phase_two(&mut self) -> Result<()> {
        self.journal = None;
        self.savepoints.clear();
        if let Some(file) = &self.file {
            if file.metadata()?.len() >= 100 {
                // SAFETY: see `open`
                self.map = Some(unsafe { Mmap::map(file)? });
            } else {
                self.map = None;
            }
        }
        debug!("commit: {} pages", self.page_count);
        Ok(())
    }

    /// Abandon the transaction, restoring every journaled page and the
    /// original page count.
    pub fn rollback(&mut self) {
        if let Some(journal) = self.journal.take() {
            for (pgno, image) in journal.pages {
                match image {
                    Some(data) => {
                        self.cache.insert(pgno, data);
                    }
                    None => {
                        self.cache.remove(&pgno);
                    }
                }
            }
            self.page_count = journal.orig_page_count;
            debug!("rollback to {} pages", self.page_count);
        }
        self.savepoints.clear();
    }

    /// Undo every change made since the transaction began, but leave the
    /// transaction open: the statement-abort flavour of rollback.
    pub fn rollback_keep_open(&mut self) {
        if let Some(journal) = &mut self.journal {
            let pages = std::mem::take(&mut journal.pages);
            let orig = journal.orig_page_count;
            for (pgno, image) in pages {
                match image {
                    Some(data) => {
                        self.cache.insert(pgno, data);
                    }
                    None => {
                        self.cache.remove(&pgno);
                    }
                }
            }
            self.page_count = orig;
        }
        self.savepoints.clear();
    }

    /// Open a nested savepoint; returns its index.
    pub fn open_savepoint(&mut self) -> usize {
        self.savepoints.push(SavepointFrame {
            page_count: self.page_count,
            pages: HashMap::new(),
        });
        self.savepoints.len() - 1
    }

    pub fn savepoint_count(&self) -> usize {
        self.savepoints.len()
    }

    /// Release (commit) savepoints `index` and above; their changes fold
    /// into the enclosing frame.
    pub fn release_savepoint(&mut self, index: usize) {
        while self.savepoints.len() > index {
            let Some(frame) = self.savepoints.pop() else {
                break;
            };
            if let Some(parent) = self.savepoints.last_mut() {
                for (pgno, image) in frame.pages {
                    parent.pages.entry(pgno).or_insert(image);
                }
            }
        }
    }

    /// Roll back to the state at which savepoint `index` was opened; the
    /// savepoint itself stays open.
    pub fn rollback_savepoint(&mut self, index: usize) {
        while self.savepoints.len() > index + 1 {
            let Some(frame) = self.savepoints.pop() else {
                break;
            };
            self.apply_frame(frame);
        }
        if let Some(mut frame) = self.savepoints.pop() {
            let page_count = frame.page_count;
            let pages = std::mem::take(&mut frame.pages);
            self.apply_frame(SavepointFrame { page_count, pages });
            self.savepoints.push(SavepointFrame {
                page_count,
                pages: HashMap::new(),
            });
        }
    }

    fn apply_frame(&mut self, frame: SavepointFrame) {
        for (pgno, image) in frame.pages {
            match image {
                Some(data) => {
                    self.cache.insert(pgno, data);
                }
                None => {
                    self.cache.remove(&pgno);
                }
            }
        }
        self.page_count = frame.page_count;
    }

    /// Move the content of page `from` into slot `to`, leaving `from`
    /// unloaded. Both pages are journaled. Used by auto-vacuum relocation.
    pub fn move_page(&mut self, from: Pgno, to: Pgno) -> Result<()> {
        if from == to {
            return Ok(());
        }
        if self.journal.is_none() {
            return Err(BtreeError::ReadOnly);
        }
        self.capture(from)?;
        self.capture(to)?;
        self.load(from)?;
        let data = self
            .cache
            .remove(&from)
            .ok_or(BtreeError::IoRead(from))?;
        self.cache.insert(to, data);
        trace!("move page {} -> {}", from, to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(pages: Pgno) -> Pager {
        let mut p = Pager::open_memory(512);
        p.begin_write().unwrap();
        p.set_page_count(pages).unwrap();
        for pgno in 1..=pages {
            let data = p.get_mut_unused(pgno).unwrap();
            data[0] = pgno as u8;
        }
        p
    }

    #[test]
    fn test_get_out_of_range() {
        let mut p = Pager::open_memory(512);
        assert!(p.get(1).is_err());
        assert!(p.get(0).is_err());
    }

    #[test]
    fn test_rollback_restores_images_and_count() {
        let mut p = fresh(3);
        p.commit_phase_one().unwrap();
        p.commit_phase_two().unwrap();

        p.begin_write().unwrap();
        p.get_mut(2).unwrap()[0] = 0xEE;
        p.set_page_count(5).unwrap();
        p.get_mut_unused(5).unwrap()[0] = 0x55;
        p.rollback();

        assert_eq!(p.page_count(), 3);
        assert_eq!(p.get(2).unwrap()[0], 2);
        assert!(p.get(5).is_err());
    }

    #[test]
    fn test_savepoint_rollback_keeps_outer_changes() {
        let mut p = fresh(2);
        p.get_mut(1).unwrap()[0] = 0xAA;
        let sp = p.open_savepoint();
        p.get_mut(1).unwrap()[0] = 0xBB;
        p.get_mut(2).unwrap()[0] = 0xCC;
        p.rollback_savepoint(sp);

        assert_eq!(p.get(1).unwrap()[0], 0xAA);
        assert_eq!(p.get(2).unwrap()[0], 2);
        // Savepoint stays open
        assert_eq!(p.savepoint_count(), 1);
    }

    #[test]
    fn test_savepoint_release_folds_down() {
        let mut p = fresh(2);
        let outer = p.open_savepoint();
        p.get_mut(1).unwrap()[0] = 0x11;
        let inner = p.open_savepoint();
        p.get_mut(2).unwrap()[0] = 0x22;
        p.release_savepoint(inner);
        // Rolling back the outer savepoint undoes both writes
        p.rollback_savepoint(outer);
        assert_eq!(p.get(1).unwrap()[0], 1);
        assert_eq!(p.get(2).unwrap()[0], 2);
    }

    #[test]
    fn test_move_page() {
        let mut p = fresh(4);
        p.move_page(4, 2).unwrap();
        assert_eq!(p.get(2).unwrap()[0], 4);
    }

    #[test]
    fn test_pending_byte_page() {
        assert_eq!(pending_byte_page(4096), 0x4000_0000 / 4096 + 1);
        assert_eq!(pending_byte_page(65536), 0x4000_0000 / 65536 + 1);
    }

    #[test]
    fn test_file_backed_commit_and_reopen() {
        let dir = std::env::temp_dir().join("sqlite-btree-pager-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("commit.db");
        let _ = std::fs::remove_file(&path);

        {
            let mut p = Pager::open(&path, 512, false).unwrap();
            p.begin_write().unwrap();
            p.set_page_count(2).unwrap();
            p.get_mut_unused(1).unwrap()[16..18].copy_from_slice(&512u16.to_be_bytes());
            p.get_mut_unused(2).unwrap()[0] = 0x7E;
            p.commit_phase_one().unwrap();
            p.commit_phase_two().unwrap();
        }

        let mut p = Pager::open(&path, 4096, false).unwrap();
        assert_eq!(p.page_size(), 512);
        assert_eq!(p.page_count(), 2);
        assert_eq!(p.get(2).unwrap()[0], 0x7E);
        let _ = std::fs::remove_file(&path);
    }
}
