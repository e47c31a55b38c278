//! Byte-range allocation inside a single page's cell content area.

use log::trace;

use crate::error::{BtreeError, Result};
use crate::header::{get_u16, put_u16};
use crate::page::MemPage;

/// Fragments never exceed this many bytes on a well-formed page.
pub const MAX_FRAGMENT_BYTES: u8 = 60;

enum Slot {
    /// Allocation offset
    Found(usize),
    /// A usable block exists but taking it would push fragments past the
    /// cap; defragment instead
    Defrag,
    /// No block is large enough
    None,
}

fn find_slot(pg: &mut MemPage, data: &mut [u8], n: u32) -> Result<Slot> {
    let mut prev: Option<usize> = None;
    let mut pc = pg.first_freeblock as usize;

    while pc != 0 {
        if pc + 4 > pg.usable as usize {
            return Err(BtreeError::corrupt("freeblock past usable area"));
        }
        let next = get_u16(data, pc) as usize;
        let size = get_u16(data, pc + 2) as u32;
        if next != 0 && next < pc + size as usize {
            return Err(BtreeError::corrupt("freeblock order"));
        }

        if size >= n {
            let rem = size - n;
            if rem < 4 {
                if pg.frag as u32 + rem > MAX_FRAGMENT_BYTES as u32 {
                    return Ok(Slot::Defrag);
                }
                // Whole slot consumed; the remainder becomes fragments
                match prev {
                    Some(p) => put_u16(data, p, next as u16),
                    None => pg.set_first_freeblock(data, next as u16),
                }
                pg.set_frag(data, pg.frag + rem as u8);
                return Ok(Slot::Found(pc));
            }
            // Carve from the tail; chain pointers stay untouched
            put_u16(data, pc + 2, rem as u16);
            return Ok(Slot::Found(pc + rem as usize));
        }

        prev = Some(pc);
        pc = next;
    }
    Ok(Slot::None)
}

/// Allocate `n` bytes within the content area and return the offset.
///
/// Tries the freeblock chain in ascending offset order first, then the gap
/// between the pointer array and the content area, defragmenting when
/// neither fits. Two extra gap bytes are kept in reserve for the pointer
/// array entry the caller is about to add.
pub fn allocate_space(pg: &mut MemPage, data: &mut [u8], n: u16, secure: bool) -> Result<usize> {
    let n = (n as u32).max(4);
    let ptr_end = (pg.cell_ptr_offset() + 2 * pg.n_cell as usize) as u32;

    if pg.first_freeblock != 0 && pg.cell_content - ptr_end >= 2 {
        match find_slot(pg, data, n)? {
            Slot::Found(offset) => {
                pg.n_free -= n;
                return Ok(offset);
            }
            Slot::Defrag => defragment(pg, data, secure)?,
            Slot::None => {}
        }
    }

    if pg.cell_content - ptr_end < n + 2 {
        defragment(pg, data, secure)?;
    }
    let ptr_end = (pg.cell_ptr_offset() + 2 * pg.n_cell as usize) as u32;
    if pg.cell_content - ptr_end < n + 2 {
        return Err(BtreeError::corrupt("page free-space accounting"));
    }

    let offset = pg.cell_content - n;
    pg.set_cell_content(data, offset);
    pg.n_free -= n;
    Ok(offset as usize)
}

/// Return `size` bytes starting at `start` to the page's free pool.
///
/// The block is linked into the ascending freeblock chain, coalescing with
/// both neighbours; fragment bytes separating adjacent blocks are folded
/// in. Freeing at the content-area boundary extends the gap instead of
/// creating a block.
pub fn free_space(
    pg: &mut MemPage,
    data: &mut [u8],
    start: usize,
    size: u16,
    secure: bool,
) -> Result<()> {
    let requested = (size as u32).max(4);
    let mut start = start as u32;
    let mut end = start + requested;

    if start < pg.cell_content || end > pg.usable {
        return Err(BtreeError::corrupt("freed range outside content area"));
    }
    if secure {
        data[start as usize..end as usize].fill(0);
    }

    // Find the chain position: prev < start <= next
    let mut prev: Option<usize> = None;
    let mut next = pg.first_freeblock as usize;
    while next != 0 && next < start as usize {
        let after = get_u16(data, next) as usize;
        if after != 0 && after <= next {
            return Err(BtreeError::corrupt("freeblock order"));
        }
        prev = Some(next);
        next = after;
    }

    let mut frag = pg.frag as i32;

    // Coalesce with the following block
    let mut chain_next = next;
    if next != 0 {
        if end > next as u32 {
            return Err(BtreeError::corrupt("freed range overlaps freeblock"));
        }
        if end + 3 >= next as u32 {
            let gap = next as u32 - end;
            frag -= gap as i32;
            let next_size = get_u16(data, next + 2) as u32;
            end = next as u32 + next_size;
            chain_next = get_u16(data, next) as usize;
        }
    }

    // Coalesce with the preceding block
    let mut link_at = prev;
    if let Some(p) = prev {
        let p_size = get_u16(data, p + 2) as u32;
        let p_end = p as u32 + p_size;
        if p_end > start {
            return Err(BtreeError::corrupt("freed range overlaps freeblock"));
        }
        if p_end + 3 >= start {
            let gap = start - p_end;
            frag -= gap as i32;
            start = p as u32;
            link_at = find_prev(pg, data, p);
        }
    }

    if frag < 0 {
        return Err(BtreeError::corrupt("fragment accounting"));
    }
    pg.set_frag(data, frag as u8);

    if start == pg.cell_content && link_at.is_none() {
        // The freed block sits at the head of the content area; grow the
        // gap instead of chaining it
        pg.set_cell_content(data, end);
        pg.set_first_freeblock(data, chain_next as u16);
    } else {
        match link_at {
            Some(p) => put_u16(data, p, start as u16),
            None => pg.set_first_freeblock(data, start as u16),
        }
        put_u16(data, start as usize, chain_next as u16);
        put_u16(data, start as usize + 2, (end - start) as u16);
    }

    pg.n_free += requested;
    Ok(())
}

fn find_prev(pg: &MemPage, data: &[u8], target: usize) -> Option<usize> {
    let mut pc = pg.first_freeblock as usize;
    let mut prev = None;
    while pc != 0 && pc != target {
        prev = Some(pc);
        pc = get_u16(data, pc) as usize;
    }
    if pc == target {
        prev
    } else {
        None
    }
}

/// Repack every cell contiguously at the high end of the page, in
/// cell-index order. Freeblocks and fragments become zero; the free bytes
/// all end up in the gap. Defragmenting an already-defragmented page is a
/// no-op apart from canonicalising the header.
pub fn defragment(pg: &mut MemPage, data: &mut [u8], secure: bool) -> Result<()> {
    let snapshot = data.to_vec();
    let mut brk = pg.usable;

    for i in 0..pg.n_cell {
        let offset = pg.cell_offset(&snapshot, i)?;
        let size = pg.cell_size(&snapshot, offset)? as u32;
        if (offset as u32) + size > pg.usable {
            return Err(BtreeError::corrupt("cell extends past usable area"));
        }
        if brk < size {
            return Err(BtreeError::corrupt("cells exceed page capacity"));
        }
        brk -= size;
        data[brk as usize..(brk + size) as usize]
            .copy_from_slice(&snapshot[offset..offset + size as usize]);
        pg.set_cell_offset(data, i, brk as u16);
    }

    let ptr_end = (pg.cell_ptr_offset() + 2 * pg.n_cell as usize) as u32;
    if brk < ptr_end {
        return Err(BtreeError::corrupt("cells exceed page capacity"));
    }
    pg.set_first_freeblock(data, 0);
    pg.set_frag(data, 0);
    pg.set_cell_content(data, brk);
    if secure {
        data[ptr_end as usize..brk as usize].fill(0);
    }
    trace!("defragmented page {}: content at {}", pg.pgno, brk);
    Ok(())
}

/// Insert `cell` at index `i`, shifting the pointer array. Returns false
/// when the page lacks `len + 2` free bytes; the caller then routes the
/// cell through the balancer.
pub fn insert_cell(
    pg: &mut MemPage,
    data: &mut [u8],
    i: u16,
    cell: &[u8],
    secure: bool,
) -> Result<bool> {
    let sz = (cell.len() as u32).max(4);
    if pg.n_free < sz + 2 {
        return Ok(false);
    }

    let offset = allocate_space(pg, data, cell.len() as u16, secure)?;
    data[offset..offset + cell.len()].copy_from_slice(cell);

    // Shift pointer entries i.. right by one slot
    let base = pg.cell_ptr_offset();
    let ins = base + 2 * i as usize;
    let end = base + 2 * pg.n_cell as usize;
    data.copy_within(ins..end, ins + 2);
    put_u16(data, ins, offset as u16);

    pg.set_n_cell(data, pg.n_cell + 1);
    pg.n_free -= 2;
    Ok(true)
}

/// Remove the cell at index `i`, freeing its bytes.
pub fn drop_cell(pg: &mut MemPage, data: &mut [u8], i: u16, secure: bool) -> Result<()> {
    let offset = pg.cell_offset(data, i)?;
    let size = pg.cell_size(data, offset)?;
    free_space(pg, data, offset, size, secure)?;

    let base = pg.cell_ptr_offset();
    let at = base + 2 * i as usize;
    let end = base + 2 * pg.n_cell as usize;
    data.copy_within(at + 2..end, at);

    pg.set_n_cell(data, pg.n_cell - 1);
    pg.n_free += 2;
    Ok(())
}
