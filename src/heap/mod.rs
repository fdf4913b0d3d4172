//! Buddy heap with per-thread slab caches and file-backed overflow.
//!
//! Size classes are powers of two from 2^5 up to 2^30. Each heap owns
//! per-order intrusive freelists with an `avail` bitmap for constant-time
//! fit search, plus a small LIFO slab cache per small order that absorbs the
//! hot alloc/free traffic without touching the buddy lists. Memory arrives
//! in 32 MB pools mapped anonymously; when anonymous mmap fails the pool
//! falls back to a randomly named file in the swap directory (`RAY_SWAP_PATH`,
//! default `.`) mapped shared, and freeing such a block closes and unlinks
//! the file.
//!
//! Heaps are thread-local (one per executor). A block freed on a thread
//! other than its owner is pushed onto the owner's foreign bin (lock-free
//! single-linked) and reclaimed when the owner merges.

pub mod block;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use memmap2::MmapMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

pub use block::{
    order_of, order_size, BlockHdr, FreeLinks, HDR_SIZE, MAX_BLOCK_ORDER, MAX_POOL_ORDER,
    MIN_BLOCK_ORDER, SLAB_CACHE_SIZE, SLAB_ORDERS,
};

/// Upper bound on executors, and so on live heap ids.
pub const MAX_HEAPS: usize = 256;

const NUM_ORDERS: usize = MAX_POOL_ORDER as usize + 1;

/// Per-heap foreign bins, indexed by heap id. Push is an atomic head swap so
/// any thread may deposit; the owner drains during [`Heap::merge`].
static FOREIGN_BINS: Lazy<Vec<AtomicPtr<BlockHdr>>> =
    Lazy::new(|| (0..MAX_HEAPS).map(|_| AtomicPtr::new(ptr::null_mut())).collect());

/// Process-wide pool registry: base address -> backing map. Pools may change
/// owning heap through borrow/merge, so their lifetime is tracked globally.
static POOLS: Lazy<Mutex<HashMap<usize, PoolSeg>>> = Lazy::new(|| Mutex::new(HashMap::new()));

static SWAP_SEQ: AtomicU64 = AtomicU64::new(0);

struct PoolSeg {
    _map: MmapMut,
    file: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemStat {
    /// Bytes currently mapped from the OS.
    pub system: i64,
    /// Bytes held in heap pools.
    pub heap: i64,
    /// Bytes sitting on freelists.
    pub free: i64,
}

struct SlabCache {
    stack: [*mut BlockHdr; SLAB_CACHE_SIZE],
    count: usize,
}

impl SlabCache {
    fn new() -> Self {
        Self { stack: [ptr::null_mut(); SLAB_CACHE_SIZE], count: 0 }
    }
}

pub struct Heap {
    pub id: u32,
    avail: u64,
    freelist: [*mut BlockHdr; NUM_ORDERS],
    slabs: [SlabCache; SLAB_ORDERS],
    swap_path: PathBuf,
    memstat: MemStat,
}

// Heaps move between threads only while their owner is quiescent (worker
// startup publication and the pool's borrow/merge windows).
unsafe impl Send for Heap {}

#[inline(always)]
fn is_slab_order(order: u8) -> bool {
    order >= MIN_BLOCK_ORDER && order < MIN_BLOCK_ORDER + SLAB_ORDERS as u8
}

#[inline(always)]
fn slab_index(order: u8) -> usize {
    (order - MIN_BLOCK_ORDER) as usize
}

impl Heap {
    pub fn new(id: u32) -> Self {
        assert!((id as usize) < MAX_HEAPS, "heap id out of range");
        let swap_path = std::env::var_os("RAY_SWAP_PATH")
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        debug!(id, swap = %swap_path.display(), "heap created");
        Self {
            id,
            avail: 0,
            freelist: [ptr::null_mut(); NUM_ORDERS],
            slabs: std::array::from_fn(|_| SlabCache::new()),
            swap_path,
            memstat: MemStat::default(),
        }
    }

    /// Map a new pool of `size` bytes, falling back to a file in the swap
    /// directory when anonymous mmap fails. Returns the pool's root block
    /// with `pool`/`pool_order` initialised, or null on OOM.
    fn add_pool(&mut self, size: usize) -> *mut BlockHdr {
        let order = order_of(size);
        let (map, file) = match MmapMut::map_anon(size) {
            Ok(map) => (map, None),
            Err(_) => {
                let seq = SWAP_SEQ.fetch_add(1, Ordering::Relaxed);
                let tag = std::process::id() as u64 ^ seq.wrapping_mul(0x9e3779b97f4a7c15);
                let path = self.swap_path.join(format!("vec_{:016x}.dat", tag));
                let backed = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .and_then(|f| {
                        f.set_len(size as u64)?;
                        let m = unsafe { MmapMut::map_mut(&f)? };
                        Ok(m)
                    });
                match backed {
                    Ok(map) => {
                        debug!(path = %path.display(), size, "heap pool backed by file");
                        (map, Some(path))
                    }
                    Err(e) => {
                        warn!(error = %e, size, "heap pool allocation failed");
                        return ptr::null_mut();
                    }
                }
            }
        };

        let base = map.as_ptr() as *mut BlockHdr;
        let backed = file.is_some();
        POOLS.lock().insert(base as usize, PoolSeg { _map: map, file });

        unsafe {
            (*base).pool = base;
            (*base).pool_order = order;
            (*base).order = order;
            (*base).flags = if backed { block::FLAG_BACKED } else { 0 };
            (*base).heap_id = self.id;
        }

        self.memstat.system += size as i64;
        self.memstat.heap += size as i64;
        base
    }

    fn remove_pool(&mut self, base: *mut BlockHdr, size: usize) {
        let seg = POOLS.lock().remove(&(base as usize));
        match seg {
            Some(PoolSeg { _map, file }) => {
                drop(_map);
                if let Some(path) = file {
                    let _ = std::fs::remove_file(path);
                }
            }
            None => warn!(base = base as usize, "remove_pool: unregistered pool"),
        }
        self.memstat.system -= size as i64;
        self.memstat.heap -= size as i64;
    }

    #[inline(always)]
    unsafe fn insert_block(&mut self, blk: *mut BlockHdr, order: u8) {
        let head = self.freelist[order as usize];
        (*blk).set_used(false);
        (*blk).order = order;
        let links = BlockHdr::links(blk);
        links.prev = ptr::null_mut();
        links.next = head;
        if !head.is_null() {
            BlockHdr::links(head).prev = blk;
        } else {
            self.avail |= 1u64 << order;
        }
        self.freelist[order as usize] = blk;
    }

    #[inline(always)]
    unsafe fn remove_block(&mut self, blk: *mut BlockHdr, order: u8) {
        let links = BlockHdr::links(blk);
        if !links.prev.is_null() {
            BlockHdr::links(links.prev).next = links.next;
        }
        if !links.next.is_null() {
            BlockHdr::links(links.next).prev = links.prev;
        }
        if self.freelist[order as usize] == blk {
            self.freelist[order as usize] = links.next;
        }
        if self.freelist[order as usize].is_null() {
            self.avail &= !(1u64 << order);
        }
    }

    /// Give back the upper halves of `blk` until it is trimmed down from
    /// `from_order` to `to_order`.
    unsafe fn split_block(&mut self, blk: *mut BlockHdr, to_order: u8, from_order: u8) {
        let mut order = from_order;
        while order > to_order {
            order -= 1;
            let buddy = (blk as *mut u8).add(order_size(order)) as *mut BlockHdr;
            (*buddy).pool = (*blk).pool;
            (*buddy).pool_order = (*blk).pool_order;
            (*buddy).flags = 0;
            self.insert_block(buddy, order);
        }
    }

    /// Allocate a block able to hold `size` payload bytes, 16-byte aligned.
    /// Returns null on OOM or a zero/oversized request.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || size > order_size(MAX_POOL_ORDER) {
            return ptr::null_mut();
        }
        let order = order_of(size + HDR_SIZE);

        unsafe {
            // Fast path: slab cache.
            if is_slab_order(order) {
                let slab = &mut self.slabs[slab_index(order)];
                if slab.count > 0 {
                    slab.count -= 1;
                    let blk = slab.stack[slab.count];
                    (*blk).set_used(true);
                    (*blk).heap_id = self.id;
                    return BlockHdr::payload(blk);
                }
            }

            // Least order with a free block that fits.
            let fit = (u64::MAX << order) & self.avail;
            let (blk, have_order) = if fit == 0 {
                if order >= MAX_BLOCK_ORDER {
                    // Dedicated pool of exactly this order.
                    let pool = self.add_pool(order_size(order));
                    if pool.is_null() {
                        return ptr::null_mut();
                    }
                    (*pool).set_used(true);
                    return BlockHdr::payload(pool);
                }
                let pool = self.add_pool(order_size(MAX_BLOCK_ORDER));
                if pool.is_null() {
                    return ptr::null_mut();
                }
                (pool, MAX_BLOCK_ORDER)
            } else {
                let have = fit.trailing_zeros() as u8;
                let blk = self.freelist[have as usize];
                self.remove_block(blk, have);
                (blk, have)
            };

            self.split_block(blk, order, have_order);

            (*blk).order = order;
            (*blk).set_used(true);
            (*blk).heap_id = self.id;
            BlockHdr::payload(blk)
        }
    }

    /// Return a block. No-op on null. Panics on a corrupted mini-header.
    pub fn free(&mut self, raw: *mut u8) {
        if raw.is_null() {
            return;
        }
        unsafe {
            let mut blk = BlockHdr::from_payload(raw);
            let mut order = (*blk).order;

            if (*blk).flags & !(block::FLAG_USED | block::FLAG_BACKED) != 0 {
                panic!(
                    "heap: corrupted block header at {:p} (flags {:#x}, order {})",
                    blk,
                    (*blk).flags,
                    order
                );
            }
            // Mapped column payloads and other external memory never reach
            // the buddy lists.
            if order < MIN_BLOCK_ORDER || order > MAX_POOL_ORDER {
                return;
            }

            if (*blk).backed() {
                let fd_base = blk;
                self.remove_pool(fd_base, order_size(order));
                return;
            }

            // Fast path: slab cache, same-heap blocks only (heap 0 absorbs
            // everything).
            if is_slab_order(order) && (self.id == 0 || (*blk).heap_id == self.id) {
                let slab = &mut self.slabs[slab_index(order)];
                if slab.count < SLAB_CACHE_SIZE {
                    (*blk).set_used(false);
                    slab.stack[slab.count] = blk;
                    slab.count += 1;
                    return;
                }
            }

            // Foreign block: deposit into the owner's bin.
            if self.id != 0 && (*blk).heap_id != self.id {
                let bin = &FOREIGN_BINS[(*blk).heap_id as usize];
                let mut head = bin.load(Ordering::Acquire);
                loop {
                    BlockHdr::links(blk).next = head;
                    match bin.compare_exchange_weak(head, blk, Ordering::Release, Ordering::Acquire)
                    {
                        Ok(_) => return,
                        Err(h) => head = h,
                    }
                }
            }

            // Coalesce with the buddy as far up as possible.
            loop {
                if (*blk).pool_order == order {
                    return self.insert_block(blk, order);
                }
                let buddy = BlockHdr::buddy_of(blk, order);
                if (*buddy).used() || (*buddy).order != order {
                    return self.insert_block(blk, order);
                }
                self.remove_block(buddy, order);
                if buddy < blk {
                    blk = buddy;
                }
                order += 1;
            }
        }
    }

    /// Resize to the new size class. Contents are preserved up to the
    /// smaller of the two payload sizes. Shrinking splits in place; growing
    /// (or resizing a foreign/file-backed block) allocates and copies.
    pub fn realloc(&mut self, raw: *mut u8, new_size: usize) -> *mut u8 {
        if raw.is_null() {
            return self.alloc(new_size);
        }
        unsafe {
            let blk = BlockHdr::from_payload(raw);
            let old_order = (*blk).order;
            let order = order_of(new_size + HDR_SIZE);

            if order == old_order {
                return raw;
            }

            if order > old_order
                || (self.id != 0 && (*blk).heap_id != self.id)
                || (*blk).backed()
            {
                let dst = self.alloc(new_size);
                if dst.is_null() {
                    self.free(raw);
                    return ptr::null_mut();
                }
                let copy = order_size(old_order) - HDR_SIZE;
                ptr::copy_nonoverlapping(raw, dst, copy.min(new_size));
                self.free(raw);
                return dst;
            }

            // Shrink in place.
            (*blk).order = order;
            self.split_block(blk, order, old_order);
            raw
        }
    }

    fn flush_slabs(&mut self) {
        for i in 0..SLAB_ORDERS {
            while self.slabs[i].count > 0 {
                self.slabs[i].count -= 1;
                let blk = self.slabs[i].stack[self.slabs[i].count];
                unsafe { self.insert_block(blk, MIN_BLOCK_ORDER + i as u8) };
            }
        }
    }

    /// Flush slab caches and return whole top-order pools to the OS.
    /// Returns the number of bytes released.
    pub fn gc(&mut self) -> i64 {
        self.flush_slabs();
        let mut total = 0i64;
        unsafe {
            for order in MAX_BLOCK_ORDER..=MAX_POOL_ORDER {
                let size = order_size(order);
                let mut blk = self.freelist[order as usize];
                while !blk.is_null() {
                    let next = BlockHdr::links(blk).next;
                    if (*blk).pool_order == order && (*blk).pool == blk {
                        self.remove_block(blk, order);
                        self.remove_pool(blk, size);
                        total += size as i64;
                    }
                    blk = next;
                }
            }
        }
        debug!(heap = self.id, released = total, "heap gc");
        total
    }

    /// Hand a worker heap a share of this heap's free memory: half of every
    /// slab cache, one medium block per order, and one spare full pool per
    /// large order.
    pub fn borrow_into(&mut self, worker: &mut Heap) {
        for i in 0..SLAB_ORDERS {
            let half = self.slabs[i].count / 2;
            for _ in 0..half {
                self.slabs[i].count -= 1;
                let blk = self.slabs[i].stack[self.slabs[i].count];
                let w = worker.slabs[i].count;
                worker.slabs[i].stack[w] = blk;
                worker.slabs[i].count = w + 1;
            }
        }

        unsafe {
            for order in 20..MAX_POOL_ORDER + 1 {
                let head = self.freelist[order as usize];
                if head.is_null() || BlockHdr::links(head).next.is_null() {
                    continue;
                }
                if order >= MAX_BLOCK_ORDER && (*head).pool_order != order {
                    continue;
                }
                self.remove_block(head, order);
                worker.insert_block(head, order);
            }
        }
    }

    /// Fold a worker heap back into this one: slab caches first (spilling
    /// overflow to the freelists), then the worker's foreign bin through the
    /// normal free path (so coalescing applies), then a constant-time
    /// freelist splice.
    pub fn merge_from(&mut self, worker: &mut Heap) {
        for i in 0..SLAB_ORDERS {
            while worker.slabs[i].count > 0 && self.slabs[i].count < SLAB_CACHE_SIZE {
                worker.slabs[i].count -= 1;
                let blk = worker.slabs[i].stack[worker.slabs[i].count];
                let m = self.slabs[i].count;
                self.slabs[i].stack[m] = blk;
                self.slabs[i].count = m + 1;
            }
            while worker.slabs[i].count > 0 {
                worker.slabs[i].count -= 1;
                let blk = worker.slabs[i].stack[worker.slabs[i].count];
                unsafe { self.insert_block(blk, MIN_BLOCK_ORDER + i as u8) };
            }
        }

        unsafe {
            let mut blk = FOREIGN_BINS[worker.id as usize].swap(ptr::null_mut(), Ordering::AcqRel);
            while !blk.is_null() {
                let next = BlockHdr::links(blk).next;
                (*blk).heap_id = self.id;
                self.free(BlockHdr::payload(blk));
                blk = next;
            }

            for order in MIN_BLOCK_ORDER..=MAX_POOL_ORDER {
                let head = worker.freelist[order as usize];
                if head.is_null() {
                    continue;
                }
                let mut last = head;
                while !BlockHdr::links(last).next.is_null() {
                    last = BlockHdr::links(last).next;
                }
                let main_head = self.freelist[order as usize];
                BlockHdr::links(last).next = main_head;
                if !main_head.is_null() {
                    BlockHdr::links(main_head).prev = last;
                }
                self.freelist[order as usize] = head;
                worker.freelist[order as usize] = ptr::null_mut();
            }
        }

        self.avail |= worker.avail;
        worker.avail = 0;
        self.memstat.system += worker.memstat.system;
        self.memstat.heap += worker.memstat.heap;
        worker.memstat = MemStat::default();
    }

    /// Drain this heap's own foreign bin (blocks other threads returned).
    pub fn drain_foreign(&mut self) {
        unsafe {
            let mut blk = FOREIGN_BINS[self.id as usize].swap(ptr::null_mut(), Ordering::AcqRel);
            while !blk.is_null() {
                let next = BlockHdr::links(blk).next;
                self.free(BlockHdr::payload(blk));
                blk = next;
            }
        }
    }

    pub fn memstat(&mut self) -> MemStat {
        let mut free = 0i64;
        unsafe {
            for order in MIN_BLOCK_ORDER..=MAX_POOL_ORDER {
                let mut blk = self.freelist[order as usize];
                while !blk.is_null() {
                    free += order_size(order) as i64;
                    blk = BlockHdr::links(blk).next;
                }
            }
            for i in 0..SLAB_ORDERS {
                free += self.slabs[i].count as i64 * order_size(MIN_BLOCK_ORDER + i as u8) as i64;
            }
        }
        self.memstat.free = free;
        self.memstat
    }

    /// Count of free blocks whose order equals their pool order, and count
    /// of registered pools carved by this heap. Used by coalescing tests.
    pub fn top_order_counts(&mut self) -> (usize, usize) {
        self.flush_slabs();
        let mut top = 0usize;
        unsafe {
            for order in MIN_BLOCK_ORDER..=MAX_POOL_ORDER {
                let mut blk = self.freelist[order as usize];
                while !blk.is_null() {
                    if (*blk).pool_order == order {
                        top += 1;
                    }
                    blk = BlockHdr::links(blk).next;
                }
            }
        }
        let pools = POOLS.lock().len();
        (top, pools)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.flush_slabs();
        if !FOREIGN_BINS[self.id as usize].load(Ordering::Acquire).is_null() {
            warn!(heap = self.id, "foreign blocks not drained at destroy");
        }
        unsafe {
            for order in MIN_BLOCK_ORDER..=MAX_POOL_ORDER {
                let mut blk = self.freelist[order as usize];
                while !blk.is_null() {
                    let next = BlockHdr::links(blk).next;
                    if (*blk).pool_order == order && (*blk).pool == blk {
                        self.remove_pool(blk, order_size(order));
                    } else {
                        // Residue that never coalesced back to a whole pool
                        // means a value outlived its heap.
                        warn!(heap = self.id, order, block = blk as usize, "heap leak");
                    }
                    blk = next;
                }
                self.freelist[order as usize] = ptr::null_mut();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_roundtrip() {
        let mut heap = Heap::new(7);
        let p = heap.alloc(100);
        assert!(!p.is_null());
        unsafe {
            let blk = BlockHdr::from_payload(p);
            assert_eq!((*blk).order, order_of(100 + HDR_SIZE));
            assert!((*blk).used());
            std::ptr::write_bytes(p, 0xAB, 100);
        }
        heap.free(p);
    }

    #[test]
    fn test_alignment() {
        let mut heap = Heap::new(8);
        for size in [1usize, 17, 100, 1000, 5000] {
            let p = heap.alloc(size);
            assert_eq!(p as usize % 16, 0, "payload must be 16-byte aligned");
            heap.free(p);
        }
    }

    #[test]
    fn test_coalescing_restores_pools() {
        let mut heap = Heap::new(9);
        // Power-of-two payload sizes force clean buddy splits.
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            for order in [5u8, 6, 8, 12, 16] {
                ptrs.push(heap.alloc(order_size(order) - HDR_SIZE));
            }
        }
        for p in ptrs.drain(..) {
            heap.free(p);
        }
        let (top, _) = heap.top_order_counts();
        // Every freed block coalesced back into whole pools.
        let mut free_blocks = 0;
        unsafe {
            for order in MIN_BLOCK_ORDER..=MAX_POOL_ORDER {
                let mut blk = heap.freelist[order as usize];
                while !blk.is_null() {
                    free_blocks += 1;
                    blk = BlockHdr::links(blk).next;
                }
            }
        }
        assert_eq!(top, free_blocks);
    }

    #[test]
    fn test_gc_releases_everything() {
        let mut heap = Heap::new(10);
        let ptrs: Vec<_> = (0..100).map(|i| heap.alloc(64 + i * 32)).collect();
        for p in ptrs {
            heap.free(p);
        }
        let released = heap.gc();
        assert!(released >= order_size(MAX_BLOCK_ORDER) as i64);
        assert_eq!(heap.memstat().heap, 0);
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let mut heap = Heap::new(11);
        let p = heap.alloc(64);
        unsafe {
            for i in 0..64 {
                *p.add(i) = i as u8;
            }
        }
        let q = heap.realloc(p, 4096);
        unsafe {
            for i in 0..64 {
                assert_eq!(*q.add(i), i as u8);
            }
        }
        let r = heap.realloc(q, 32);
        unsafe {
            for i in 0..16 {
                assert_eq!(*r.add(i), i as u8);
            }
        }
        heap.free(r);
        heap.gc();
    }

    #[test]
    fn test_dedicated_large_block() {
        let mut heap = Heap::new(12);
        let size = order_size(MAX_BLOCK_ORDER) + 1;
        let p = heap.alloc(size);
        assert!(!p.is_null());
        unsafe {
            let blk = BlockHdr::from_payload(p);
            assert_eq!((*blk).order, MAX_BLOCK_ORDER + 1);
            assert_eq!((*blk).pool_order, (*blk).order);
        }
        heap.free(p);
        heap.gc();
    }

    #[test]
    fn test_borrow_merge() {
        let mut main = Heap::new(13);
        let mut worker = Heap::new(14);
        // Warm up the main heap so there is something to borrow.
        let ptrs: Vec<_> = (0..SLAB_CACHE_SIZE).map(|_| main.alloc(48)).collect();
        for p in ptrs {
            main.free(p);
        }
        main.borrow_into(&mut worker);
        assert!(worker.slabs[slab_index(order_of(48 + HDR_SIZE))].count > 0);
        let p = worker.alloc(48);
        assert!(!p.is_null());
        worker.free(p);
        main.merge_from(&mut worker);
        assert_eq!(worker.avail, 0);
        main.gc();
    }
}
