//! Human-readable heap and root dumps for embedders chasing rooting bugs.
//! Observers only; nothing here is required for correctness.
use crate::heap::Heap;
use crate::{formatted_size, WORD_BYTES};
use std::io::{self, Write};

/// Write every pool's occupancy and free-list contents plus the global load
/// state.
pub fn full_dump<W: Write>(heap: &Heap, out: &mut W) -> io::Result<()> {
    writeln!(
        out,
        "heap: {} pool(s), allocated {} / available {}, load factor {:.3}",
        heap.pool_count(),
        formatted_size(heap.allocated_words() * WORD_BYTES),
        formatted_size(heap.available_words() * WORD_BYTES),
        heap.load_factor()
    )?;
    let mut pool = heap.pools_head();
    let mut index = 0;
    while !pool.is_null() {
        unsafe {
            writeln!(
                out,
                "pool {}: {:p}, used {} words, bump room {} words",
                index,
                pool,
                (*pool).used_words(),
                (*pool).bump_room()
            )?;
            let mut block = (*pool).free;
            while !block.is_null() {
                writeln!(out, "  free block {:p}: {} words", block, (*block).size)?;
                block = (*block).next();
            }
            pool = (*pool).next;
        }
        index += 1;
    }
    Ok(())
}

/// Write the current value of every registered root slot of the calling
/// thread's shadow stack.
pub fn root_dump<W: Write>(heap: &Heap, out: &mut W) -> io::Result<()> {
    writeln!(out, "roots:")?;
    let mut result = Ok(());
    let mut slot = 0usize;
    unsafe {
        heap.shadow_stack().walk(|object| {
            if result.is_ok() {
                result = writeln!(out, "  slot {}: {:p}", slot, object);
            }
            slot += 1;
        });
    }
    result
}
