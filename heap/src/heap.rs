//! The region-based heap.
//!
//! One contiguous reservation carved into fixed-size regions, with an
//! external pair of mark bitmaps ("next" and "complete"), a free set, a
//! collection set, and a resident worker gang. The heap is decoupled from
//! any specific VM: consumers provide a [`TraceFn`] to enumerate the
//! reference fields of their objects and register [`RootSource`]s for root
//! discovery.
//!
//! Every allocation reserves a forwarding word in front of the object (see
//! the `object` crate); objects start out self-forwarded.
//!
//! [`RootSource`]: crate::RootSource

use std::collections::HashSet;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::{Mutex, MutexGuard, RwLock};

use object::{FWD_BYTES, FWD_WORDS, Header, Value, WORD_BYTES, fwd_init};

use crate::bitmap::MarkBitmap;
use crate::marker::StwMarker;
use crate::refproc::ReferenceProcessor;
use crate::region::Region;
use crate::roots::RootRegistry;
use crate::system;
use crate::tracer::GcTracer;
use crate::worker::{GangTask, WorkGang};
use crate::{BarrierSet, ForwardingBarrierSet};

/// Function that traces all reference fields of a heap object.
///
/// Given a pointer to a heap object (whose first bytes are a
/// [`Header`]), the function must call `visitor` for every [`Value`] field
/// that may be a heap reference. The visitor may rewrite the field in place
/// (pointer adjustment does exactly that).
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub type TraceFn = unsafe fn(obj: *const u8, visitor: &mut dyn FnMut(&mut Value));

pub const NO_REGION: usize = usize::MAX;

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the region layout and collection knobs.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of the heap in bytes. Must be a multiple of `region_size`.
    pub heap_size: usize,
    /// Size of a region. Power of two, multiple of the OS page size.
    pub region_size: usize,
    /// Size of the resident GC worker gang.
    pub parallel_gc_threads: usize,
    /// Desired TLAB carve-out size in bytes.
    pub tlab_size: usize,
    pub use_tlab: bool,
    /// Verify heap invariants around full collections.
    pub verify: bool,
    /// 0 disables reference processing, even for last-resort collections.
    pub ref_proc_frequency: u32,
    /// 0 disables class unloading, even for last-resort collections.
    pub unload_classes_frequency: u32,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 268_435_456, // 256 MB
            region_size: 1_048_576, // 1 MB
            parallel_gc_threads: 4,
            tlab_size: 32_768,
            use_tlab: true,
            verify: false,
            ref_proc_frequency: 1,
            unload_classes_frequency: 1,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.heap_size == 0 || self.region_size == 0 {
            return Err("sizes must be > 0");
        }
        if !self.region_size.is_power_of_two() {
            return Err("region_size must be a power of two");
        }
        if !self.region_size.is_multiple_of(system::OS_PAGE_SIZE) {
            return Err("region_size must match OS page alignment");
        }
        if !self.heap_size.is_multiple_of(self.region_size) {
            return Err("heap_size must be a multiple of region_size");
        }
        if self.heap_size / self.region_size > u32::MAX as usize {
            return Err("too many regions for metadata");
        }
        if self.parallel_gc_threads == 0 {
            return Err("parallel_gc_threads must be > 0");
        }
        if self.tlab_size == 0 || self.tlab_size > self.region_size {
            return Err("tlab_size must be in (0, region_size]");
        }
        Ok(())
    }
}

// ── Free set / collection set ─────────────────────────────────────────

/// Alloc-ready regions, ordered ascending so allocation prefers the low end
/// of the heap.
#[derive(Debug, Default)]
pub struct FreeSet {
    indices: Vec<u32>,
}

impl FreeSet {
    pub fn add(&mut self, index: usize) {
        let index = index as u32;
        if let Err(pos) = self.indices.binary_search(&index) {
            self.indices.insert(pos, index);
        }
    }

    pub fn remove(&mut self, index: usize) {
        if let Ok(pos) = self.indices.binary_search(&(index as u32)) {
            self.indices.remove(pos);
        }
    }

    pub fn take_lowest(&mut self) -> Option<usize> {
        if self.indices.is_empty() {
            None
        } else {
            Some(self.indices.remove(0) as usize)
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.binary_search(&(index as u32)).is_ok()
    }

    pub fn count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn clear(&mut self) {
        self.indices.clear();
    }
}

/// Regions selected for evacuation by a concurrent cycle. After a cancelled
/// cycle this may be non-empty when the full GC starts; it ends empty.
#[derive(Debug, Default)]
pub struct CollectionSet {
    set: HashSet<u32, ahash::RandomState>,
}

impl CollectionSet {
    pub fn add_region(&mut self, index: usize) {
        self.set.insert(index as u32);
    }

    pub fn remove_region(&mut self, index: usize) {
        self.set.remove(&(index as u32));
    }

    pub fn is_in(&self, index: usize) -> bool {
        self.set.contains(&(index as u32))
    }

    pub fn count(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn clear(&mut self) {
        self.set.clear();
    }
}

// ── HeapInner ─────────────────────────────────────────────────────────

pub struct HeapInner {
    settings: HeapSettings,
    trace_fn: TraceFn,
    base: usize,
    num_regions: usize,
    regions: Box<[Region]>,

    /// The two mark bitmaps and their top-at-mark-start arrays. Index
    /// `next_idx` is the "next" pair (marking writes into it); the other is
    /// "complete" (authoritative liveness for heap walks).
    bitmaps: [MarkBitmap; 2],
    tams: [Box<[AtomicUsize]>; 2],
    next_idx: AtomicU8,

    /// The heap lock. Guards heap-wide region-set mutations: prepare,
    /// humongous sweep, post-compact, allocation.
    lock: Mutex<()>,
    free_set: Mutex<FreeSet>,
    collection_set: Mutex<CollectionSet>,

    used: AtomicUsize,
    bytes_allocated_since_mark: AtomicUsize,

    /// Global region claim cursor shared by gang tasks.
    claim_cursor: AtomicUsize,
    /// Region currently bump-allocated from; NO_REGION when unset.
    alloc_region: AtomicUsize,

    concurrent_mark_in_progress: AtomicBool,
    evacuation_in_progress: AtomicBool,
    full_gc_in_progress: AtomicBool,
    full_gc_move_in_progress: AtomicBool,
    need_update_refs: AtomicBool,
    cancelled_concgc: AtomicBool,

    /// Thread currently holding the safepoint, if any.
    safepoint: Mutex<Option<ThreadId>>,

    workers: WorkGang,
    marker: StwMarker,
    ref_processor: ReferenceProcessor,
    roots: RootRegistry,
    barrier: RwLock<Arc<dyn BarrierSet>>,
    tracer: GcTracer,
    tlabs: Mutex<Vec<Arc<TlabState>>>,
}

impl HeapInner {
    fn new(settings: HeapSettings, trace_fn: TraceFn) -> Self {
        settings.validate().expect("invalid heap settings");

        let heap_size = settings.heap_size;
        let region_size = settings.region_size;
        let num_regions = heap_size / region_size;

        let base = system::reserve_memory(heap_size).expect("reserve heap").as_ptr() as usize;
        debug_assert!(base.is_multiple_of(system::OS_PAGE_SIZE));
        // Regions start out committed-empty; back the whole range now.
        // Uncommitting is a per-region decision made later.
        system::commit_memory(base, heap_size);

        let mut regions = Vec::with_capacity(num_regions);
        for i in 0..num_regions {
            let bottom = base + i * region_size;
            regions.push(Region::new(i, bottom, bottom + region_size));
        }

        let bitmaps = [
            MarkBitmap::new(base, heap_size),
            MarkBitmap::new(base, heap_size),
        ];
        let tams = [
            make_tams(&regions),
            make_tams(&regions),
        ];

        let mut free_set = FreeSet::default();
        for i in 0..num_regions {
            free_set.add(i);
        }

        Self {
            workers: WorkGang::new(settings.parallel_gc_threads),
            settings,
            trace_fn,
            base,
            num_regions,
            regions: regions.into_boxed_slice(),
            bitmaps,
            tams,
            next_idx: AtomicU8::new(0),
            lock: Mutex::new(()),
            free_set: Mutex::new(free_set),
            collection_set: Mutex::new(CollectionSet::default()),
            used: AtomicUsize::new(0),
            bytes_allocated_since_mark: AtomicUsize::new(0),
            claim_cursor: AtomicUsize::new(0),
            alloc_region: AtomicUsize::new(NO_REGION),
            concurrent_mark_in_progress: AtomicBool::new(false),
            evacuation_in_progress: AtomicBool::new(false),
            full_gc_in_progress: AtomicBool::new(false),
            full_gc_move_in_progress: AtomicBool::new(false),
            need_update_refs: AtomicBool::new(false),
            cancelled_concgc: AtomicBool::new(false),
            safepoint: Mutex::new(None),
            marker: StwMarker::new(),
            ref_processor: ReferenceProcessor::new(),
            roots: RootRegistry::new(),
            barrier: RwLock::new(Arc::new(ForwardingBarrierSet)),
            tracer: GcTracer::new(),
            tlabs: Mutex::new(Vec::new()),
        }
    }

    // ── accessors ──────────────────────────────────────────────────

    #[inline]
    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    #[inline]
    pub fn trace_fn(&self) -> TraceFn {
        self.trace_fn
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.settings.region_size
    }

    #[inline]
    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    #[inline]
    pub fn max_workers(&self) -> usize {
        self.workers.active_workers()
    }

    #[inline]
    pub fn workers(&self) -> &WorkGang {
        &self.workers
    }

    #[inline]
    pub fn marker(&self) -> &StwMarker {
        &self.marker
    }

    #[inline]
    pub fn ref_processor(&self) -> &ReferenceProcessor {
        &self.ref_processor
    }

    #[inline]
    pub fn roots(&self) -> &RootRegistry {
        &self.roots
    }

    #[inline]
    pub fn tracer(&self) -> &GcTracer {
        &self.tracer
    }

    /// Acquire the heap lock.
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn free_set(&self) -> MutexGuard<'_, FreeSet> {
        self.free_set.lock()
    }

    pub fn collection_set(&self) -> MutexGuard<'_, CollectionSet> {
        self.collection_set.lock()
    }

    // ── regions ────────────────────────────────────────────────────

    #[inline]
    pub fn region(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    #[inline]
    pub fn region_index_for(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.base && addr < self.base + self.settings.heap_size);
        (addr - self.base) / self.settings.region_size
    }

    #[inline]
    pub fn region_for(&self, addr: usize) -> &Region {
        &self.regions[self.region_index_for(addr)]
    }

    #[inline]
    pub fn is_in(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.settings.heap_size
    }

    /// Serial iteration over all regions, in index order.
    pub fn heap_region_iterate(&self, mut f: impl FnMut(&Region)) {
        for region in self.regions.iter() {
            f(region);
        }
    }

    /// Reset the shared claim cursor before a gang pass over the regions.
    pub fn clear_claim_cursor(&self) {
        self.claim_cursor.store(0, Ordering::Relaxed);
    }

    /// Claim the next region off the shared cursor.
    pub fn claim_next(&self) -> Option<&Region> {
        let index = self.claim_cursor.fetch_add(1, Ordering::Relaxed);
        self.regions.get(index)
    }

    // ── mark bitmaps / top-at-mark-start ───────────────────────────

    #[inline]
    fn next(&self) -> usize {
        self.next_idx.load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn next_mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next()]
    }

    #[inline]
    pub fn complete_mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[1 - self.next()]
    }

    /// What was "next" becomes the authoritative "complete" bitmap, along
    /// with its top-at-mark-start array.
    pub fn swap_mark_bitmaps(&self) {
        self.next_idx.fetch_xor(1, Ordering::Relaxed);
    }

    pub fn set_next_top_at_mark_start(&self, region_index: usize, addr: usize) {
        self.tams[self.next()][region_index].store(addr, Ordering::Relaxed);
    }

    pub fn next_top_at_mark_start(&self, region_index: usize) -> usize {
        self.tams[self.next()][region_index].load(Ordering::Relaxed)
    }

    pub fn set_complete_top_at_mark_start(&self, region_index: usize, addr: usize) {
        self.tams[1 - self.next()][region_index].store(addr, Ordering::Relaxed)
    }

    pub fn complete_top_at_mark_start(&self, region_index: usize) -> usize {
        self.tams[1 - self.next()][region_index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_marked_complete(&self, obj: *const u8) -> bool {
        self.complete_mark_bitmap().is_marked(obj as usize)
    }

    #[inline]
    pub fn is_marked_next(&self, obj: *const u8) -> bool {
        self.next_mark_bitmap().is_marked(obj as usize)
    }

    pub fn reset_next_mark_bitmap(&self) {
        self.reset_mark_bitmap(BitmapSel::Next);
    }

    pub fn reset_complete_mark_bitmap(&self) {
        self.reset_mark_bitmap(BitmapSel::Complete);
    }

    fn reset_mark_bitmap(&self, which: BitmapSel) {
        self.clear_claim_cursor();
        let task = ResetBitmapTask { heap: self, which };
        self.workers.run_task(&task);
    }

    pub fn is_next_bitmap_clear(&self) -> bool {
        self.next_mark_bitmap()
            .is_clear_range(self.base, self.base + self.settings.heap_size)
    }

    pub fn is_complete_bitmap_clear(&self) -> bool {
        self.complete_mark_bitmap()
            .is_clear_range(self.base, self.base + self.settings.heap_size)
    }

    /// Visit every live object in `region` in ascending address order,
    /// driven by the complete mark bitmap. Objects allocated after the
    /// top-at-mark-start are not visited.
    pub fn marked_object_iterate(&self, region: &Region, mut f: impl FnMut(*mut u8)) {
        let limit = self.complete_top_at_mark_start(region.index()).min(region.top());
        self.complete_mark_bitmap()
            .iter_marked(region.bottom(), limit, |addr| f(addr as *mut u8));
    }

    // ── usage accounting ───────────────────────────────────────────

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn set_used(&self, bytes: usize) {
        self.used.store(bytes, Ordering::Relaxed);
    }

    fn increase_used(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
        self.bytes_allocated_since_mark.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_allocated_since_mark(&self) -> usize {
        self.bytes_allocated_since_mark.load(Ordering::Relaxed)
    }

    pub fn clear_bytes_allocated_since_mark(&self) {
        self.bytes_allocated_since_mark.store(0, Ordering::Relaxed);
    }

    // ── GC state flags ─────────────────────────────────────────────

    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.concurrent_mark_in_progress.load(Ordering::Relaxed)
    }

    pub fn set_concurrent_mark_in_progress(&self, v: bool) {
        self.concurrent_mark_in_progress.store(v, Ordering::Relaxed);
    }

    pub fn stop_concurrent_marking(&self) {
        self.set_concurrent_mark_in_progress(false);
    }

    pub fn is_evacuation_in_progress(&self) -> bool {
        self.evacuation_in_progress.load(Ordering::Relaxed)
    }

    pub fn set_evacuation_in_progress(&self, v: bool) {
        self.evacuation_in_progress.store(v, Ordering::Relaxed);
    }

    pub fn is_full_gc_in_progress(&self) -> bool {
        self.full_gc_in_progress.load(Ordering::Relaxed)
    }

    pub fn set_full_gc_in_progress(&self, v: bool) {
        self.full_gc_in_progress.store(v, Ordering::Relaxed);
    }

    pub fn is_full_gc_move_in_progress(&self) -> bool {
        self.full_gc_move_in_progress.load(Ordering::Relaxed)
    }

    pub fn set_full_gc_move_in_progress(&self, v: bool) {
        self.full_gc_move_in_progress.store(v, Ordering::Relaxed);
    }

    pub fn need_update_refs(&self) -> bool {
        self.need_update_refs.load(Ordering::Relaxed)
    }

    pub fn set_need_update_refs(&self, v: bool) {
        self.need_update_refs.store(v, Ordering::Relaxed);
    }

    pub fn is_cancelled_concgc(&self) -> bool {
        self.cancelled_concgc.load(Ordering::Relaxed)
    }

    pub fn set_cancelled_concgc(&self, v: bool) {
        self.cancelled_concgc.store(v, Ordering::Relaxed);
    }

    pub fn clear_cancelled_concgc(&self) {
        self.set_cancelled_concgc(false);
    }

    // ── safepoint ──────────────────────────────────────────────────

    pub fn is_at_safepoint(&self) -> bool {
        self.safepoint.lock().is_some()
    }

    /// Whether the current thread is the one driving the safepoint.
    pub fn is_safepoint_thread(&self) -> bool {
        *self.safepoint.lock() == Some(std::thread::current().id())
    }

    // ── barrier set ────────────────────────────────────────────────

    pub fn barrier_set(&self) -> Arc<dyn BarrierSet> {
        self.barrier.read().clone()
    }

    /// Install a new barrier set, returning the previous one.
    pub fn set_barrier_set(&self, bs: Arc<dyn BarrierSet>) -> Arc<dyn BarrierSet> {
        let mut slot = self.barrier.write();
        log::debug!("barrier set: {} -> {}", slot.name(), bs.name());
        std::mem::replace(&mut *slot, bs)
    }

    // ── allocation ─────────────────────────────────────────────────

    /// Allocate an object of `size_words` (header included). Returns the
    /// object base pointer, self-forwarded and zero-initialized, or `None`
    /// when the heap has no room left.
    pub fn allocate(&self, size_words: u32, kind: u8) -> Option<NonNull<u8>> {
        let footprint = (size_words as usize + FWD_WORDS) * WORD_BYTES;
        if footprint > self.settings.region_size {
            return self.allocate_humongous(size_words, kind);
        }

        let _lock = self.lock.lock();
        let addr = self.allocate_shared_locked(footprint, false)?;
        // SAFETY: addr is a fresh, exclusively owned range inside the heap.
        Some(unsafe { self.initialize_object(addr, size_words, kind) })
    }

    /// Bump-allocate `bytes` from the current allocation region, taking a
    /// fresh region from the free set as needed. Heap lock must be held.
    fn allocate_shared_locked(&self, bytes: usize, tlab: bool) -> Option<usize> {
        debug_assert!(bytes.is_multiple_of(WORD_BYTES));
        loop {
            let index = self.alloc_region.load(Ordering::Relaxed);
            if index != NO_REGION {
                let region = &self.regions[index];
                if region.free() >= bytes {
                    let addr = region.top();
                    region.set_top(addr + bytes);
                    if tlab {
                        region.record_tlab_alloc(bytes);
                    } else {
                        region.record_shared_alloc(bytes);
                    }
                    self.increase_used(bytes);
                    return Some(addr);
                }
            }

            // The free set hands out empty regions and regular regions
            // that still have room.
            let next = self.free_set.lock().take_lowest()?;
            let region = &self.regions[next];
            if region.is_empty() {
                region.make_regular_allocation();
            }
            debug_assert!(region.is_regular());
            self.alloc_region.store(next, Ordering::Relaxed);
        }
    }

    /// Forget the current allocation region (it may have changed state
    /// under the collector's feet).
    pub fn reset_alloc_region(&self) {
        self.alloc_region.store(NO_REGION, Ordering::Relaxed);
    }

    fn allocate_humongous(&self, size_words: u32, kind: u8) -> Option<NonNull<u8>> {
        let footprint = (size_words as usize + FWD_WORDS) * WORD_BYTES;
        let region_size = self.settings.region_size;
        let needed = footprint.div_ceil(region_size);

        let _lock = self.lock.lock();
        let start = self.find_contiguous_empty_locked(needed)?;

        let mut free_set = self.free_set.lock();
        let mut remaining = footprint;
        for i in 0..needed {
            let region = &self.regions[start + i];
            if i == 0 {
                region.make_humongous_start();
            } else {
                region.make_humongous_cont();
            }
            let fill = remaining.min(region_size);
            region.set_top(region.bottom() + fill);
            free_set.remove(start + i);
            self.increase_used(fill);
            remaining -= fill;
        }
        drop(free_set);

        let addr = self.regions[start].bottom();
        log::debug!(
            "humongous allocation: {needed} regions at index {start}, {footprint} bytes"
        );
        // SAFETY: the claimed regions are contiguous and exclusively owned.
        Some(unsafe { self.initialize_object(addr, size_words, kind) })
    }

    fn find_contiguous_empty_locked(&self, needed: usize) -> Option<usize> {
        let mut run = 0;
        let mut start = 0;
        for index in 0..self.num_regions {
            if self.regions[index].is_empty() {
                if run == 0 {
                    start = index;
                }
                run += 1;
                if run == needed {
                    return Some(start);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Lay down [fwd][header][zeroed payload] at `addr` and return the
    /// object base.
    ///
    /// # Safety
    ///
    /// `addr` must be the start of an unused, word-aligned range of
    /// `(size_words + FWD_WORDS) * WORD_BYTES` bytes inside the heap.
    unsafe fn initialize_object(&self, addr: usize, size_words: u32, kind: u8) -> NonNull<u8> {
        let obj = (addr + FWD_BYTES) as *mut u8;
        // SAFETY: caller hands us exclusive ownership of the range.
        unsafe {
            ptr::write_bytes(obj, 0, size_words as usize * WORD_BYTES);
            ptr::write(obj as *mut Header, Header::new(kind, size_words));
            fwd_init(obj);
            NonNull::new_unchecked(obj)
        }
    }

    /// Trash a humongous object: the start region and every continuation
    /// behind it.
    pub fn trash_humongous_region_at(&self, start: &Region) {
        assert!(start.is_humongous_start(), "not a humongous start");
        log::debug!("trashing humongous object at region {}", start.index());
        start.make_trash();
        let mut index = start.index() + 1;
        while index < self.num_regions && self.regions[index].is_humongous_cont() {
            self.regions[index].make_trash();
            index += 1;
        }
    }

    // ── TLABs ──────────────────────────────────────────────────────

    pub fn register_tlab(&self) -> Tlab {
        let state = Arc::new(TlabState {
            window: Mutex::new(TlabWindow { bump: 0, end: 0 }),
            desired: AtomicUsize::new(self.settings.tlab_size),
            wasted: AtomicUsize::new(0),
        });
        self.tlabs.lock().push(state.clone());
        Tlab { state }
    }

    fn allocate_tlab_window(&self, bytes: usize) -> Option<(usize, usize)> {
        let _lock = self.lock.lock();
        let addr = self.allocate_shared_locked(bytes, true)?;
        Some((addr, addr + bytes))
    }

    /// Retire every registered TLAB so the heap parses cleanly: abandoned
    /// window tails are unmarked garbage reclaimed by the collection.
    pub fn make_tlabs_parsable(&self) {
        let tlabs = self.tlabs.lock();
        let mut retired = 0;
        for state in tlabs.iter() {
            let mut window = state.window.lock();
            retired += window.end - window.bump;
            state.wasted.fetch_add(window.end - window.bump, Ordering::Relaxed);
            *window = TlabWindow { bump: 0, end: 0 };
        }
        log::debug!("retired {} tlabs, {retired} bytes abandoned", tlabs.len());
    }

    /// Adapt TLAB carve-out sizes to the waste observed since the last
    /// resize.
    pub fn resize_all_tlabs(&self) {
        let floor = 1024.min(self.settings.tlab_size);
        let tlabs = self.tlabs.lock();
        for state in tlabs.iter() {
            let wasted = state.wasted.swap(0, Ordering::Relaxed);
            let desired = state.desired.load(Ordering::Relaxed);
            let new = if wasted > desired / 2 {
                (desired / 2).max(floor)
            } else {
                (desired * 2).min(self.settings.tlab_size)
            };
            state.desired.store(new, Ordering::Relaxed);
        }
    }

    // ── verification ───────────────────────────────────────────────

    /// Structural region invariants. Holds at any safepoint.
    pub fn verify_regions(&self) {
        for region in self.regions.iter() {
            assert!(region.bottom() <= region.top(), "{region:?}");
            assert!(region.top() <= region.end(), "{region:?}");
        }
    }

    /// Post-full-GC invariants: exact accounting, free-set membership,
    /// empty collection set, clear bitmaps.
    pub fn verify_after_full_gc(&self) {
        self.verify_regions();

        let mut sum = 0;
        let free_set = self.free_set.lock();
        for region in self.regions.iter() {
            sum += region.used();
            assert_eq!(
                free_set.contains(region.index()),
                region.is_alloc_allowed(),
                "free set membership mismatch for {region:?}"
            );
        }
        assert_eq!(self.used(), sum, "heap used out of sync with regions");
        assert!(self.collection_set.lock().is_empty(), "collection set not empty");
        assert!(self.is_next_bitmap_clear(), "next bitmap not clear");
        assert!(self.is_complete_bitmap_clear(), "complete bitmap not clear");
    }
}

impl Drop for HeapInner {
    fn drop(&mut self) {
        if let Some(base) = NonNull::new(self.base as *mut u8) {
            system::release_memory(base, self.settings.heap_size);
        }
    }
}

fn make_tams(regions: &[Region]) -> Box<[AtomicUsize]> {
    regions
        .iter()
        .map(|r| AtomicUsize::new(r.bottom()))
        .collect::<Vec<_>>()
        .into_boxed_slice()
}

// ── bitmap reset gang task ────────────────────────────────────────────

#[derive(Clone, Copy)]
enum BitmapSel {
    Next,
    Complete,
}

struct ResetBitmapTask<'a> {
    heap: &'a HeapInner,
    which: BitmapSel,
}

impl GangTask for ResetBitmapTask<'_> {
    fn name(&self) -> &'static str {
        "reset mark bitmap"
    }

    fn work(&self, _worker_id: usize) {
        let bitmap = match self.which {
            BitmapSel::Next => self.heap.next_mark_bitmap(),
            BitmapSel::Complete => self.heap.complete_mark_bitmap(),
        };
        while let Some(region) = self.heap.claim_next() {
            bitmap.clear_range(region.bottom(), region.end());
        }
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    #[must_use]
    pub fn new(settings: HeapSettings, trace_fn: TraceFn) -> Self {
        Self(Arc::new(HeapInner::new(settings, trace_fn)))
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ── safepoint scope ───────────────────────────────────────────────────

/// Marks the current thread as driving a stop-the-world pause. The real
/// runtime parks its mutators before constructing this; the heap only
/// records who the pause belongs to.
pub struct SafepointScope<'a> {
    heap: &'a HeapInner,
}

impl<'a> SafepointScope<'a> {
    pub fn new(heap: &'a HeapInner) -> Self {
        let mut holder = heap.safepoint.lock();
        assert!(holder.is_none(), "nested safepoint");
        *holder = Some(std::thread::current().id());
        Self { heap }
    }
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        *self.heap.safepoint.lock() = None;
    }
}

// ── TLABs ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct TlabWindow {
    bump: usize,
    end: usize,
}

#[derive(Debug)]
pub struct TlabState {
    window: Mutex<TlabWindow>,
    desired: AtomicUsize,
    wasted: AtomicUsize,
}

/// Thread-local allocation buffer: a private bump window carved out of the
/// shared allocation path. Refills itself; dies gracefully when the heap is
/// full.
#[derive(Debug)]
pub struct Tlab {
    state: Arc<TlabState>,
}

impl Tlab {
    pub fn allocate(&self, heap: &HeapInner, size_words: u32, kind: u8) -> Option<NonNull<u8>> {
        let footprint = (size_words as usize + FWD_WORDS) * WORD_BYTES;
        if footprint > heap.settings().tlab_size {
            return heap.allocate(size_words, kind);
        }

        let mut window = self.state.window.lock();
        if window.end - window.bump < footprint {
            let desired = self.state.desired.load(Ordering::Relaxed).max(footprint);
            self.state
                .wasted
                .fetch_add(window.end - window.bump, Ordering::Relaxed);
            let (start, end) = heap.allocate_tlab_window(desired)?;
            *window = TlabWindow { bump: start, end };
        }

        let addr = window.bump;
        window.bump += footprint;
        // SAFETY: addr is a fresh, exclusively owned range inside the window.
        Some(unsafe { heap.initialize_object(addr, size_words, kind) })
    }

    pub fn desired_size(&self) -> usize {
        self.state.desired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Objects in these tests have no reference fields.
    unsafe fn null_trace(_obj: *const u8, _visitor: &mut dyn FnMut(&mut Value)) {}

    fn small_settings() -> HeapSettings {
        HeapSettings {
            heap_size: 2 * 1024 * 1024,
            region_size: 128 * 1024,
            parallel_gc_threads: 2,
            tlab_size: 8192,
            use_tlab: true,
            verify: true,
            ..Default::default()
        }
    }

    fn test_heap() -> Heap {
        Heap::new(small_settings(), null_trace)
    }

    #[test]
    fn settings_validation() {
        assert!(small_settings().validate().is_ok());

        let mut s = small_settings();
        s.region_size = 3 * 4096;
        assert!(s.validate().is_err());

        let mut s = small_settings();
        s.heap_size = s.region_size + 1;
        assert!(s.validate().is_err());

        let mut s = small_settings();
        s.parallel_gc_threads = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn fresh_heap_is_empty() {
        let heap = test_heap();
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.num_regions(), 16);
        assert_eq!(heap.free_set().count(), 16);
        assert!(heap.is_next_bitmap_clear());
        heap.verify_regions();
    }

    #[test]
    fn shared_allocation_bumps_lowest_region() {
        let heap = test_heap();
        let a = heap.allocate(8, 0).unwrap();
        let b = heap.allocate(8, 0).unwrap();

        // Objects land behind their forwarding words in region 0.
        assert_eq!(heap.region_index_for(a.as_ptr() as usize), 0);
        assert_eq!(
            b.as_ptr() as usize,
            a.as_ptr() as usize + 9 * WORD_BYTES,
            "second object follows first plus fwd word"
        );
        assert_eq!(heap.used(), 2 * 9 * WORD_BYTES);
        assert!(heap.region(0).is_regular());
        assert!(!heap.free_set().contains(0));

        // Self-forwarded and header intact.
        unsafe {
            assert!(object::is_self_forwarded(a.as_ptr()));
            assert_eq!(object::object_size(a.as_ptr()), 8);
        }
    }

    #[test]
    fn allocation_spills_into_next_region() {
        let heap = test_heap();
        let region_words = heap.region_size() / WORD_BYTES;
        // Each allocation takes half a region plus change, so the second
        // one cannot share a region with the first.
        let words = (region_words / 2 + 16) as u32;
        let a = heap.allocate(words, 0).unwrap();
        let b = heap.allocate(words, 0).unwrap();
        assert_ne!(
            heap.region_index_for(a.as_ptr() as usize),
            heap.region_index_for(b.as_ptr() as usize)
        );
    }

    #[test]
    fn humongous_allocation_spans_regions() {
        let heap = test_heap();
        let region_words = heap.region_size() / WORD_BYTES;
        let words = (2 * region_words + region_words / 2) as u32;
        let obj = heap.allocate(words, 0).unwrap();

        let start = heap.region_index_for(obj.as_ptr() as usize);
        assert!(heap.region(start).is_humongous_start());
        assert!(heap.region(start + 1).is_humongous_cont());
        assert!(heap.region(start + 2).is_humongous_cont());
        assert!(!heap.region(start + 3).is_humongous());

        assert_eq!(heap.region(start).top(), heap.region(start).end());
        assert_eq!(heap.region(start + 1).top(), heap.region(start + 1).end());
        assert!(heap.region(start + 2).used() > 0);
        assert_eq!(
            heap.used(),
            (words as usize + FWD_WORDS) * WORD_BYTES
        );
    }

    #[test]
    fn humongous_trashing_covers_continuations() {
        let heap = test_heap();
        let region_words = heap.region_size() / WORD_BYTES;
        let obj = heap.allocate((2 * region_words) as u32, 0).unwrap();
        let start_index = heap.region_index_for(obj.as_ptr() as usize);

        heap.trash_humongous_region_at(heap.region(start_index));
        assert!(heap.region(start_index).is_trash());
        assert!(heap.region(start_index + 1).is_trash());
        assert!(heap.region(start_index + 2).is_trash());
    }

    #[test]
    fn tlab_allocation_refills() {
        let heap = test_heap();
        let tlab = heap.register_tlab();
        let tlab_size = heap.settings().tlab_size;
        let footprint = 17 * WORD_BYTES;
        let per_window = tlab_size / footprint;

        let mut last = 0usize;
        for _ in 0..per_window + 1 {
            let obj = tlab.allocate(&heap, 16, 0).unwrap();
            let addr = obj.as_ptr() as usize;
            assert!(addr > last, "tlab allocation goes forward");
            last = addr;
        }
        // The window refilled exactly once; used counts carved windows.
        assert_eq!(heap.used(), 2 * tlab_size);

        heap.make_tlabs_parsable();
        heap.resize_all_tlabs();
    }

    #[test]
    fn claim_cursor_hands_out_each_region_once() {
        let heap = test_heap();
        heap.clear_claim_cursor();
        let mut seen = Vec::new();
        while let Some(r) = heap.claim_next() {
            seen.push(r.index());
        }
        assert_eq!(seen, (0..heap.num_regions()).collect::<Vec<_>>());
        assert!(heap.claim_next().is_none());
    }

    #[test]
    fn bitmap_swap_flips_roles() {
        let heap = test_heap();
        let obj = heap.allocate(8, 0).unwrap();
        let addr = obj.as_ptr() as usize;

        heap.next_mark_bitmap().par_mark(addr);
        assert!(heap.is_marked_next(obj.as_ptr()));
        assert!(!heap.is_marked_complete(obj.as_ptr()));

        heap.swap_mark_bitmaps();
        assert!(heap.is_marked_complete(obj.as_ptr()));
        assert!(!heap.is_marked_next(obj.as_ptr()));
    }

    #[test]
    fn reset_bitmap_tasks_clear_everything() {
        let heap = test_heap();
        let obj = heap.allocate(8, 0).unwrap();
        heap.next_mark_bitmap().par_mark(obj.as_ptr() as usize);
        assert!(!heap.is_next_bitmap_clear());
        heap.reset_next_mark_bitmap();
        assert!(heap.is_next_bitmap_clear());
    }

    #[test]
    fn marked_object_iterate_respects_tams() {
        let heap = test_heap();
        let a = heap.allocate(8, 0).unwrap();
        let region = heap.region_for(a.as_ptr() as usize);

        // Record mark start after `a`, then allocate `b` past it.
        heap.set_next_top_at_mark_start(region.index(), region.top());
        let b = heap.allocate(8, 0).unwrap();

        heap.next_mark_bitmap().par_mark(a.as_ptr() as usize);
        heap.next_mark_bitmap().par_mark(b.as_ptr() as usize);
        heap.swap_mark_bitmaps();

        let mut seen = Vec::new();
        heap.marked_object_iterate(region, |obj| seen.push(obj as usize));
        assert_eq!(seen, vec![a.as_ptr() as usize]);
    }

    #[test]
    fn safepoint_scope_tracks_holder() {
        let heap = test_heap();
        assert!(!heap.is_at_safepoint());
        {
            let _scope = SafepointScope::new(&heap);
            assert!(heap.is_at_safepoint());
            assert!(heap.is_safepoint_thread());
        }
        assert!(!heap.is_at_safepoint());
    }

    #[test]
    fn barrier_slot_swap_returns_old() {
        let heap = test_heap();
        assert_eq!(heap.barrier_set().name(), "forwarding");
        let old = heap.set_barrier_set(Arc::new(crate::PassthroughBarrierSet));
        assert_eq!(old.name(), "forwarding");
        assert_eq!(heap.barrier_set().name(), "passthrough");
    }
}
