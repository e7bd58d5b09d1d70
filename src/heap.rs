//! The allocator + collector engine.
use crate::descriptor::Descriptor;
use crate::dump;
use crate::header::{FreeHeader, HeaderWord, MIN_OBJECT_WORDS};
use crate::mmap::Mmap;
use crate::pool::Pool;
use crate::roots::{JitRoots, RootFrame, ShadowStack};
use crate::worklist::Worklist;
use crate::{formatted_size, Config, Ref, Word, WORD_BYTES};
use atomic::{Atomic, Ordering};
use parking_lot::{lock_api::RawMutex, Mutex, RawMutex as Lock};
use std::cell::Cell;
use std::fmt;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::AtomicUsize;
use std::time::Instant;

#[cfg(feature = "corruption-checks")]
use crate::header::{CANARY, CANARY_WORD};

/// Words a genesis descriptor occupies: base fields plus one bitmap word,
/// which is also exactly the instance size it describes.
pub const GENESIS_WORDS: usize = Descriptor::BASE_WORDS + 1;

const MIN_POOL_BYTES: usize = 4 * 1024;

#[derive(Debug)]
pub enum HeapError {
    /// The OS refused to supply a pool mapping.
    OsAllocation(std::io::Error),
    /// A rejected [`Config`] value.
    InvalidConfig(&'static str),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OsAllocation(err) => write!(f, "pool allocation failed: {}", err),
            HeapError::InvalidConfig(what) => write!(f, "invalid heap config: {}", what),
        }
    }
}

impl std::error::Error for HeapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeapError::OsAllocation(err) => Some(err),
            HeapError::InvalidConfig(_) => None,
        }
    }
}

/// Heap invariant violations leave no safe way to continue: report and abort.
#[cold]
pub(crate) fn fatal_corruption(what: &str, address: *const Word) -> ! {
    eprintln!("[gc] heap corruption: {} at {:p}", what, address);
    eprintln!("{:?}", backtrace::Backtrace::new());
    std::process::abort();
}

/// One managed heap: the pool list, the load state and the registered root
/// set. All process-wide state of the engine lives here; embedders create one
/// per runtime (or per test) and pass it around explicitly.
pub struct Heap {
    config: Config,
    pub(crate) global_lock: Lock,
    /// Head of the pool list. Pools are appended, never removed.
    pools: *mut Pool,
    last_pool: *mut Pool,
    /// Where the next allocation starts searching; collections reset it to
    /// the first pool.
    current_pool: *mut Pool,
    /// Owns the mappings the pools live in.
    mappings: Vec<Mmap>,
    /// Live words as of the last sweep plus words allocated since.
    allocated: AtomicUsize,
    /// Total usable words across all pools.
    available: AtomicUsize,
    load_factor: Atomic<f64>,
    shadow_stack: ShadowStack,
    /// Stacks of threads currently blocked inside the runtime.
    blocked_stacks: Mutex<Vec<*const ShadowStack>>,
    jit_roots: Cell<Option<JitRoots>>,
    total_gcs: usize,
}

impl Heap {
    /// Create a heap with its first pool already mapped.
    pub fn new(config: Config) -> Result<Box<Self>, HeapError> {
        Self::validate(&config)?;
        let mut heap = Box::new(Self {
            config,
            global_lock: Lock::INIT,
            pools: null_mut(),
            last_pool: null_mut(),
            current_pool: null_mut(),
            mappings: Vec::new(),
            allocated: AtomicUsize::new(0),
            available: AtomicUsize::new(0),
            load_factor: Atomic::new(0.0),
            shadow_stack: ShadowStack::new(),
            blocked_stacks: Mutex::new(Vec::new()),
            jit_roots: Cell::new(None),
            total_gcs: 0,
        });
        heap.append_pool()?;
        Ok(heap)
    }

    fn validate(config: &Config) -> Result<(), HeapError> {
        if !config.pool_size.is_power_of_two() {
            return Err(HeapError::InvalidConfig("pool_size must be a power of two"));
        }
        if config.pool_size < MIN_POOL_BYTES {
            return Err(HeapError::InvalidConfig("pool_size below the minimum"));
        }
        let thresholds = [
            config.collect_threshold,
            config.expand_threshold,
            config.ideal_load,
        ];
        if thresholds.iter().any(|t| !t.is_finite() || *t <= 0.0) {
            return Err(HeapError::InvalidConfig(
                "load thresholds must be positive and finite",
            ));
        }
        if config.ideal_load > config.expand_threshold {
            return Err(HeapError::InvalidConfig(
                "ideal_load must not exceed expand_threshold",
            ));
        }
        Ok(())
    }

    /// Map one pool and account for it; on failure nothing changes.
    fn allocate_pool(&mut self) -> Result<*mut Pool, HeapError> {
        let pool_size = self.config.pool_size;
        let map = Mmap::new(pool_size, pool_size).map_err(HeapError::OsAllocation)?;
        let pool = unsafe { Pool::init(map.aligned(), pool_size) };
        self.mappings.push(map);
        self.available
            .fetch_add(Pool::usable_words(pool_size), Ordering::Relaxed);
        self.recompute_load_factor();
        Ok(pool)
    }

    /// Link a freshly mapped pool at the tail of the pool list.
    pub fn append_pool(&mut self) -> Result<(), HeapError> {
        let pool = self.allocate_pool()?;
        if self.last_pool.is_null() {
            self.pools = pool;
            self.current_pool = pool;
        } else {
            unsafe { (*self.last_pool).next = pool };
        }
        self.last_pool = pool;
        log::debug!(
            "[gc] pool {} appended, {} available",
            self.pool_count(),
            formatted_size(self.available.load(Ordering::Relaxed) * WORD_BYTES)
        );
        Ok(())
    }

    /// Allocate `size_words` of zeroed, tag-clear memory with a null
    /// descriptor slot, or report out of memory with `None`.
    ///
    /// The search tries, in order: bump room in the current pool, its free
    /// list, the next pool, one collection (with `protect` registered as a
    /// transient root for its duration), one expansion. Each fallback runs at
    /// most once per call; a request larger than one pool can ever hold
    /// fails immediately.
    ///
    /// The caller must stamp a descriptor into the header before the next
    /// collection may run; until then the object is not parseable.
    pub fn allocate_raw(
        &mut self,
        mut protect: Option<&mut *mut Descriptor>,
        size_words: usize,
    ) -> Option<NonNull<Word>> {
        if size_words > self.usable_pool_words() {
            log::debug!(
                "[gc] rejected {}-word request: larger than a pool",
                size_words
            );
            return None;
        }
        let size = size_words.max(MIN_OBJECT_WORDS);
        let mut collected = false;
        let mut expanded = false;
        loop {
            unsafe {
                let pool = self.current_pool;
                if let Some(mem) = (*pool).try_bump(size) {
                    return Some(self.finish_allocation(mem, size, true));
                }
                if let Some(mem) = (*pool).try_free_list(size) {
                    return Some(self.finish_allocation(mem, size, false));
                }
                if !(*pool).next.is_null() {
                    self.current_pool = (*pool).next;
                    continue;
                }
            }
            if !collected {
                collected = true;
                self.collect_protected(0, protect.as_deref_mut());
                continue;
            }
            if !expanded {
                expanded = true;
                if self.expand() {
                    continue;
                }
            }
            log::debug!("[gc] out of memory for a {}-word request", size);
            return None;
        }
    }

    /// Allocate an instance of `descriptor` and stamp it into the header.
    /// The descriptor slot is protected across any collection this triggers.
    pub fn allocate(&mut self, descriptor: &mut *mut Descriptor) -> Option<NonNull<Word>> {
        let size = unsafe { (**descriptor).size };
        let mem = self.allocate_raw(Some(descriptor), size)?;
        unsafe {
            *mem.as_ptr() = HeaderWord::from_descriptor(*descriptor).bits();
        }
        Some(mem)
    }

    /// Allocate the self-describing genesis descriptor: the bootstrap object
    /// whose own descriptor slot points at itself. It describes descriptors
    /// with a single bitmap word, which is enough to chain any further
    /// descriptor the embedder needs.
    pub fn bootstrap_genesis(&mut self) -> Option<NonNull<Descriptor>> {
        let mem = self.allocate_raw(None, GENESIS_WORDS)?;
        let descriptor = mem.cast::<Descriptor>();
        unsafe {
            let d = descriptor.as_ptr();
            (*d).set_header(d);
            (*d).size = GENESIS_WORDS as Word;
            (*d).set_pointer_at(0);
        }
        Some(descriptor)
    }

    /// Allocate a descriptor for `instance_words`-word objects, laid out by
    /// `meta` (usually the genesis descriptor). `meta` must declare at least
    /// [`Descriptor::words_for`]`(instance_words)` words so the new
    /// descriptor's bitmap has full coverage.
    pub fn new_descriptor(
        &mut self,
        meta: &mut *mut Descriptor,
        instance_words: usize,
    ) -> Option<NonNull<Descriptor>> {
        debug_assert!(unsafe { (**meta).size } >= Descriptor::words_for(instance_words));
        let mem = self.allocate(meta)?;
        let descriptor = mem.cast::<Descriptor>();
        unsafe {
            (*descriptor.as_ptr()).size = instance_words as Word;
        }
        Some(descriptor)
    }

    unsafe fn finish_allocation(&mut self, mem: Ref, size: usize, from_bump: bool) -> NonNull<Word> {
        if from_bump {
            // Bump space is virgin mapping, already zero.
            debug_assert_eq!(*mem, 0);
        } else {
            std::ptr::write_bytes(mem, 0, size);
        }
        #[cfg(feature = "corruption-checks")]
        {
            *mem.add(CANARY_WORD) = CANARY;
        }
        self.allocated.fetch_add(size, Ordering::Relaxed);
        self.recompute_load_factor();
        NonNull::new_unchecked(mem)
    }

    fn collect_protected(&mut self, generation: u8, protect: Option<&mut *mut Descriptor>) {
        match protect {
            Some(slot) => unsafe {
                let stack: *const ShadowStack = &self.shadow_stack;
                let mut frame = RootFrame::new([slot as *mut *mut Descriptor as *mut Ref]);
                let _guard = frame.push(&*stack);
                self.collect(generation);
            },
            None => self.collect(generation),
        }
    }

    /// Run one full stop-the-world collection: seed the worklist from every
    /// registered root, mark the transitive closure, sweep every pool.
    /// `generation` is threaded through for future use and logged; a single
    /// collection granularity is implemented.
    pub fn collect(&mut self, generation: u8) {
        self.global_lock.lock();
        let start = Instant::now();
        let before = self.allocated.load(Ordering::Relaxed);

        let mut worklist = Worklist::new();
        unsafe {
            self.seed_roots(&mut worklist);
            self.mark(&mut worklist);
            self.sweep();
        }
        // The frontier lives exactly one collection.
        drop(worklist);
        self.current_pool = self.pools;

        let after = self.allocated.load(Ordering::Relaxed);
        let pause = start.elapsed().as_micros() as f64 / 1000.0;
        log::debug!(
            "[gc] GC({}) Pause MarkSweep(gen {}) {}->{} {:.4}ms",
            self.total_gcs,
            generation,
            formatted_size(before * WORD_BYTES),
            formatted_size(after * WORD_BYTES),
            pause
        );
        if self.config.verbose {
            eprintln!(
                "[gc] GC({}) Pause MarkSweep(gen {}) {}->{} {:.4}ms",
                self.total_gcs,
                generation,
                formatted_size(before * WORD_BYTES),
                formatted_size(after * WORD_BYTES),
                pause
            );
        }
        self.total_gcs += 1;
        unsafe { self.global_lock.unlock() };
    }

    /// Cooperative housekeeping for safe points: collect when the heap runs
    /// hot, expand when collecting was not enough. Advisory only; the
    /// allocator enforces correctness on its own.
    pub fn yield_point(&mut self) {
        if self.load_factor() > self.config.collect_threshold {
            self.collect(0);
            if self.load_factor() > self.config.expand_threshold {
                self.expand();
            }
        }
    }

    /// Append pools until the load factor is at or below `ideal_load`, at
    /// least one. Returns whether any pool was appended.
    fn expand(&mut self) -> bool {
        let mut appended = false;
        loop {
            match self.append_pool() {
                Ok(()) => appended = true,
                Err(err) => {
                    log::error!("[gc] expansion stopped: {}", err);
                    break;
                }
            }
            if self.load_factor() <= self.config.ideal_load {
                break;
            }
        }
        appended
    }

    unsafe fn seed_roots(&self, worklist: &mut Worklist) {
        self.shadow_stack.walk(|object| {
            if !object.is_null() {
                worklist.push(object);
            }
        });
        for stack in self.blocked_stacks.lock().iter() {
            (**stack).walk(|object| {
                if !object.is_null() {
                    worklist.push(object);
                }
            });
        }
        if let Some(jit) = self.jit_roots.get() {
            jit.walk(|object| {
                if !object.is_null() {
                    worklist.push(object);
                }
            });
        }
    }

    /// Drain the worklist, tagging every reachable object. Tracing an object
    /// pushes its descriptor before its fields, so a descriptor is always
    /// kept at least as long as its instances.
    unsafe fn mark(&mut self, worklist: &mut Worklist) {
        while let Some(object) = worklist.pop() {
            if object.is_null() {
                continue;
            }
            let header = HeaderWord(*object);
            if header.is_marked() {
                continue;
            }
            if header.is_free() {
                // A precise root set never reaches a free block.
                if cfg!(feature = "corruption-checks") {
                    fatal_corruption("traced a reference into a free block", object);
                }
                continue;
            }
            #[cfg(feature = "corruption-checks")]
            {
                if *object.add(CANARY_WORD) != CANARY {
                    fatal_corruption("canary mismatch", object);
                }
            }
            let descriptor = header.descriptor();
            if cfg!(feature = "corruption-checks") && descriptor.is_null() {
                fatal_corruption("traced an object without a descriptor", object);
            }
            worklist.push(descriptor as Ref);
            *object = header.with_mark().bits();
            let size = (*descriptor).size;
            for k in 1..size {
                if (*descriptor).is_pointer_at(k) {
                    worklist.push(*object.add(k) as Ref);
                }
            }
        }
    }

    /// Walk every pool once, unmarking survivors, turning garbage into free
    /// blocks and rebuilding each free list from scratch; then replace the
    /// live total and reset the allocation cursor.
    ///
    /// The walk is split in two phases. Parsing a dead object reads its
    /// descriptor, and that descriptor may itself be dead earlier in the
    /// walk; its `size` field is exactly the word a free-block header would
    /// overwrite. So phase one parses every pool while all headers are still
    /// intact (only clearing mark bits, which destroys nothing), and phase
    /// two performs all conversions.
    unsafe fn sweep(&mut self) {
        struct PoolSweep {
            pool: *mut Pool,
            /// Free blocks of the rebuilt list, in address order.
            blocks: Vec<(Ref, Word)>,
        }

        let mut plans: Vec<PoolSweep> = Vec::new();
        let mut live_total = 0usize;
        let mut pool = self.pools;
        while !pool.is_null() {
            let mut blocks = Vec::new();
            let mut cursor = (*pool).mem_start();
            let end = (*pool).end;
            while cursor < end {
                let header = HeaderWord(*cursor);
                let step;
                if header.is_free() {
                    if cfg!(feature = "corruption-checks") && header.is_marked() {
                        fatal_corruption("free block carries a mark tag", cursor);
                    }
                    step = (*(cursor as *mut FreeHeader)).size;
                    blocks.push((cursor, step));
                } else {
                    let descriptor = header.descriptor();
                    if cfg!(feature = "corruption-checks") && descriptor.is_null() {
                        fatal_corruption("swept an object without a descriptor", cursor);
                    }
                    step = ((*descriptor).size as usize).max(MIN_OBJECT_WORDS);
                    if header.is_marked() {
                        *cursor = header.without_mark().bits();
                        live_total += step;
                    } else {
                        blocks.push((cursor, step));
                    }
                }
                cursor = cursor.add(step);
            }
            if cursor != end {
                fatal_corruption("sweep parse overran the pool cursor", cursor);
            }
            plans.push(PoolSweep { pool, blocks });
            pool = (*pool).next;
        }

        for plan in &plans {
            let mut head: *mut FreeHeader = null_mut();
            let mut tail: *mut FreeHeader = null_mut();
            for &(cell, size) in &plan.blocks {
                let block = FreeHeader::init(cell, size);
                if tail.is_null() {
                    head = block;
                } else {
                    (*tail).set_next(block);
                }
                tail = block;
            }
            (*plan.pool).free = head;
        }

        self.allocated.store(live_total, Ordering::Relaxed);
        self.recompute_load_factor();
    }

    fn recompute_load_factor(&self) {
        let available = self.available.load(Ordering::Relaxed);
        let allocated = self.allocated.load(Ordering::Relaxed);
        let load = if available == 0 {
            0.0
        } else {
            allocated as f64 / available as f64
        };
        self.load_factor.store(load, Ordering::Relaxed);
    }

    /// The calling thread's root stack. The reference is tied to the heap's
    /// boxed allocation, not to the borrow, so rooted scopes can keep using
    /// the heap; it must not outlive the heap itself.
    pub fn shadow_stack<'a>(&self) -> &'a ShadowStack {
        unsafe { std::mem::transmute(&self.shadow_stack) }
    }

    /// Register the shadow stack of a thread blocked inside the runtime so
    /// its roots are traced too.
    ///
    /// # Safety
    /// `stack` must stay valid until unregistered, and the owning thread must
    /// really be blocked whenever a collection runs.
    pub unsafe fn register_blocked_stack(&self, stack: *const ShadowStack) {
        self.blocked_stacks.lock().push(stack);
    }

    pub unsafe fn unregister_blocked_stack(&self, stack: *const ShadowStack) {
        self.blocked_stacks.lock().retain(|s| *s != stack);
    }

    /// Install (or clear) the JIT's root slot range.
    pub fn set_jit_roots(&self, roots: Option<JitRoots>) {
        self.jit_roots.set(roots);
    }

    pub fn load_factor(&self) -> f64 {
        self.load_factor.load(Ordering::Relaxed)
    }

    pub fn allocated_words(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn available_words(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    /// Words of object storage one pool offers under this heap's config.
    pub fn usable_pool_words(&self) -> usize {
        Pool::usable_words(self.config.pool_size)
    }

    pub fn pool_count(&self) -> usize {
        let mut count = 0;
        let mut pool = self.pools;
        while !pool.is_null() {
            count += 1;
            pool = unsafe { (*pool).next };
        }
        count
    }

    pub fn total_collections(&self) -> usize {
        self.total_gcs
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write the full heap dump through `log::debug!`.
    pub fn log_dump(&self) {
        let mut out = Vec::new();
        if dump::full_dump(self, &mut out).is_ok() {
            log::debug!("{}", String::from_utf8_lossy(&out));
        }
    }

    pub(crate) fn pools_head(&self) -> *mut Pool {
        self.pools
    }

    /// Sizes of the free blocks of pool `index`, in list order.
    pub(crate) fn pool_free_sizes(&self, index: usize) -> Vec<usize> {
        let mut pool = self.pools;
        for _ in 0..index {
            assert!(!pool.is_null());
            pool = unsafe { (*pool).next };
        }
        assert!(!pool.is_null());
        unsafe { (*pool).free_block_sizes() }
    }
}
