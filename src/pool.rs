//! Fixed-size arenas carved out of one aligned mapping each.
use crate::header::{FreeHeader, FREE_BIT, FREE_HEADER_WORDS};
use crate::heap::fatal_corruption;
use crate::{Ref, Word, WORD_BYTES};
use std::mem::size_of;
use std::ptr::null_mut;

/// One pool: the header lives at the base of its aligned mapping and the
/// word storage follows it immediately.
///
/// Invariant: `mem_start() <= end <= limit` at all times; every address the
/// allocator hands out lies in `[mem_start(), end)`.
#[repr(C)]
pub struct Pool {
    /// Next pool in the process-wide list. Pools are never unlinked.
    pub(crate) next: *mut Pool,
    /// Head of this pool's free list; nodes live inside the pool storage.
    pub(crate) free: *mut FreeHeader,
    /// Bump cursor: first word of never-used space.
    pub(crate) end: Ref,
    /// One past the last usable word.
    pub(crate) limit: Ref,
    mem: [Word; 0],
}

impl Pool {
    pub const HEADER_BYTES: usize = size_of::<Pool>();

    /// Words of object storage a pool of `pool_size` bytes offers.
    pub const fn usable_words(pool_size: usize) -> usize {
        (pool_size - Self::HEADER_BYTES) / WORD_BYTES
    }

    /// Construct an empty pool at `base`, the start of a zeroed, aligned
    /// mapping of `pool_size` bytes.
    ///
    /// # Safety
    /// `base` must be valid for `pool_size` bytes and word aligned.
    pub(crate) unsafe fn init(base: *mut u8, pool_size: usize) -> *mut Pool {
        let pool = base as *mut Pool;
        let mem = (*pool).mem.as_mut_ptr();
        (*pool).next = null_mut();
        (*pool).free = null_mut();
        (*pool).end = mem;
        (*pool).limit = mem.add(Self::usable_words(pool_size));
        pool
    }

    pub(crate) fn mem_start(&self) -> Ref {
        self.mem.as_ptr() as Ref
    }

    pub(crate) fn used_words(&self) -> usize {
        (self.end as usize - self.mem_start() as usize) / WORD_BYTES
    }

    pub(crate) fn bump_room(&self) -> usize {
        (self.limit as usize - self.end as usize) / WORD_BYTES
    }

    /// Carve `words` from the bump region, or report that it is full.
    pub(crate) unsafe fn try_bump(&mut self, words: usize) -> Option<Ref> {
        if words > self.bump_room() {
            return None;
        }
        let mem = self.end;
        self.end = self.end.add(words);
        Some(mem)
    }

    /// First-fit free list search. A block of exactly `words` is unlinked and
    /// returned whole; a block that can also host a viable remainder is split
    /// from its tail, shrinking the resident block in place so its address
    /// and list linkage stay stable. Anything in between is skipped: the
    /// remainder would be too small to relink.
    pub(crate) unsafe fn try_free_list(&mut self, words: usize) -> Option<Ref> {
        let mut prev: *mut FreeHeader = null_mut();
        let mut block = self.free;
        while !block.is_null() {
            if *(block as Ref) & FREE_BIT == 0 {
                fatal_corruption("free list node is not free-tagged", block as Ref);
            }
            let size = (*block).size;
            if size == words {
                let next = (*block).next();
                if prev.is_null() {
                    self.free = next;
                } else {
                    (*prev).set_next(next);
                }
                return Some(block as Ref);
            }
            if size >= words + FREE_HEADER_WORDS {
                (*block).size = size - words;
                return Some((block as Ref).add(size - words));
            }
            prev = block;
            block = (*block).next();
        }
        None
    }

    /// Sizes of the free blocks in list order.
    pub(crate) fn free_block_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::new();
        let mut block = self.free;
        unsafe {
            while !block.is_null() {
                sizes.push((*block).size);
                block = (*block).next();
            }
        }
        sizes
    }
}
