//! The full-GC sliding mark–compact collector.
//!
//! Last-resort stop-the-world collection for the region-based heap. It must
//! recover from *any* prior GC state (cancelled concurrent mark, aborted
//! evacuation, lingering collection set), reclaim all unreachable memory,
//! and leave a fully parsable, defragmented heap behind.
//!
//! Four phases, each a gang execution separated by full fences:
//!
//! 1. **Mark** — rebuild liveness from the roots with the STW marker, then
//!    swap bitmaps so the result becomes the authoritative "complete" map.
//! 2. **Plan** — workers claim regions off a shared cursor into private,
//!    disjoint *slices* and slide every live object toward the low end of
//!    the slice, recording targets in the forwarding words. Fully drained
//!    regions become new sliding targets for the same slice; running out of
//!    them degrades to compacting a region into itself, which is safe
//!    because sliding preserves address order.
//! 3. **Adjust** — rewrite every reference (roots, weak slots, heap fields)
//!    to the forwarded address of its referent.
//! 4. **Compact** — move the objects (overlap-safe ascending copy within
//!    each slice), re-initialize forwarding words, update region tops, and
//!    restore region/free-set/bitmap bookkeeping.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use parking_lot::Mutex;

use object::{
    FWD_BYTES, FWD_WORDS, Value, WORD_BYTES, fwd_get, fwd_init, fwd_set, is_self_forwarded,
    object_size,
};

use crate::PassthroughBarrierSet;
use crate::heap::{HeapInner, SafepointScope};
use crate::region::{Region, RegionSet};
use crate::roots::RootProcessor;
use crate::tracer::{GcCause, GcPhase};
use crate::worker::GangTask;

impl HeapInner {
    /// Run a full stop-the-world sliding mark–compact collection.
    ///
    /// Callers are responsible for having parked their mutators; this
    /// records the pause and drives all four phases on the current thread.
    pub fn full_gc(&self, cause: GcCause) {
        let _scope = SafepointScope::new(self);
        FullGc { heap: self }.do_it(cause);
    }
}

struct FullGc<'h> {
    heap: &'h HeapInner,
}

impl FullGc<'_> {
    fn do_it(&self, cause: GcCause) {
        let heap = self.heap;
        let tracer = heap.tracer();

        // A cycle that reported start but never end was aborted mid-flight;
        // close it before opening the full-GC session.
        if tracer.has_reported_gc_start() {
            tracer.report_gc_end();
        }
        tracer.report_gc_start(cause);

        if heap.settings().verify {
            heap.verify_regions();
        }

        heap.set_full_gc_in_progress(true);

        assert!(heap.is_at_safepoint(), "must be at a safepoint");
        assert!(
            heap.is_safepoint_thread(),
            "full GC only while the world is stopped, on the pausing thread"
        );

        {
            let _t = tracer.phase(GcPhase::FullGcHeapDumps);
            log::trace!("heap dump hook (pre)");
        }

        {
            let _t = tracer.phase(GcPhase::FullGcPrepare);
            self.prepare();
        }

        // Forwarding words transiently hold future addresses during the
        // move; nothing may resolve through them implicitly until we are
        // done.
        let old_barriers = heap.set_barrier_set(Arc::new(PassthroughBarrierSet));

        if heap.settings().use_tlab {
            heap.make_tlabs_parsable();
        }

        heap.set_need_update_refs(true);

        fence(Ordering::SeqCst);
        {
            let _t = tracer.phase(GcPhase::FullGcMark);
            self.phase1_mark_heap();
        }

        heap.set_full_gc_move_in_progress(true);

        fence(Ordering::SeqCst);
        let worker_slices: Vec<Mutex<RegionSet>> = (0..heap.max_workers())
            .map(|_| Mutex::new(RegionSet::new(heap.num_regions())))
            .collect();

        {
            let _t = tracer.phase(GcPhase::FullGcCalculateAddresses);
            self.phase2_calculate_target_addresses(&worker_slices);
        }

        fence(Ordering::SeqCst);
        {
            let _t = tracer.phase(GcPhase::FullGcAdjustPointers);
            self.phase3_update_references();
        }

        fence(Ordering::SeqCst);
        {
            let _t = tracer.phase(GcPhase::FullGcCopyObjects);
            self.phase4_compact_objects(&worker_slices);
        }

        heap.clear_bytes_allocated_since_mark();
        heap.set_need_update_refs(false);
        heap.set_full_gc_move_in_progress(false);
        heap.set_full_gc_in_progress(false);

        if heap.settings().verify {
            heap.verify_after_full_gc();
        }

        tracer.report_gc_end();

        {
            let _t = tracer.phase(GcPhase::FullGcHeapDumps);
            log::trace!("heap dump hook (post)");
        }

        if heap.settings().use_tlab {
            let _t = tracer.phase(GcPhase::FullGcResizeTlabs);
            heap.resize_all_tlabs();
        }

        heap.set_barrier_set(old_barriers);
    }

    /// Bring the heap into a state the compactor can work with, no matter
    /// which GC state was in flight when we were called.
    fn prepare(&self) {
        let heap = self.heap;

        // a. Cancel concurrent mark, if in progress.
        if heap.is_concurrent_mark_in_progress() {
            heap.marker().cancel();
            heap.stop_concurrent_marking();
        }
        assert!(!heap.is_concurrent_mark_in_progress(), "sanity");

        // b. Cancel evacuation, if in progress. In-flight copies are
        // abandoned; marking starts over.
        if heap.is_evacuation_in_progress() {
            heap.set_evacuation_in_progress(false);
        }
        assert!(!heap.is_evacuation_in_progress(), "sanity");

        // c. Reset the bitmap for new marking.
        heap.reset_next_mark_bitmap();
        assert!(heap.is_next_bitmap_clear(), "sanity");

        // d. Abandon reference discovery and clear all discovered
        // references.
        let rp = heap.ref_processor();
        rp.disable_discovery();
        rp.abandon_partial_discovery();
        rp.verify_no_references_recorded();

        {
            let _lock = heap.lock();

            // e. Make sure all regions are active: we may slide data
            // through any of them.
            ensure_heap_active(heap);

            // f. Clear region statuses, including collection set status.
            heap.heap_region_iterate(|r| {
                heap.set_next_top_at_mark_start(r.index(), r.top());
                r.clear_live_data();
                r.set_concurrent_iteration_safe_limit(r.top());
            });
        }
    }

    fn phase1_mark_heap(&self) {
        let heap = self.heap;
        let marker = heap.marker();

        // Do not trust heuristics: this can be the last-resort collection.
        // Only skip reference processing and class unloading when the knobs
        // explicitly disable them.
        marker.set_process_references(heap.settings().ref_proc_frequency != 0);
        marker.set_unload_classes(heap.settings().unload_classes_frequency != 0);

        let rp = heap.ref_processor();
        rp.enable_discovery(true);
        rp.setup_policy(true); // snapshot the soft-ref policy for this cycle
        rp.set_active_mt_degree(heap.workers().active_workers());

        marker.update_roots(heap, GcPhase::FullGcRoots);
        marker.mark_roots(heap, GcPhase::FullGcRoots);
        marker.shared_finish_mark_from_roots(heap, true);

        heap.swap_mark_bitmaps();
    }

    fn phase2_calculate_target_addresses(&self, worker_slices: &[Mutex<RegionSet>]) {
        let heap = self.heap;

        {
            let _lock = heap.lock();

            // Reclaim humongous objects that did not survive marking.
            heap.heap_region_iterate(|r| {
                if r.is_humongous_start() {
                    let head = (r.bottom() + FWD_BYTES) as *const u8;
                    if !heap.is_marked_complete(head) {
                        heap.trash_humongous_region_at(r);
                    }
                }
            });

            // The reclaimed backing storage must be active again: we may
            // slide data through it.
            ensure_heap_active(heap);
        }

        heap.clear_claim_cursor();
        let task = PrepareForCompactionTask {
            heap,
            worker_slices,
        };
        heap.workers().run_task(&task);
    }

    fn phase3_update_references(&self) {
        let heap = self.heap;

        {
            let rp = RootProcessor::new(heap.roots());
            let task = AdjustRootPointersTask { heap, rp: &rp };
            heap.workers().run_task(&task);
        }

        heap.clear_claim_cursor();
        let task = AdjustPointersTask { heap };
        heap.workers().run_task(&task);
    }

    fn phase4_compact_objects(&self, worker_slices: &[Mutex<RegionSet>]) {
        let heap = self.heap;

        let task = CompactObjectsTask {
            heap,
            worker_slices,
        };
        heap.workers().run_task(&task);

        // The complete-top-at-mark-start pointers are about to be rewound;
        // the complete bitmap must be reset first so size-based walking
        // stays consistent.
        heap.reset_complete_mark_bitmap();

        {
            let _lock = heap.lock();
            let live = self.post_compact();
            heap.set_used(live);
        }

        heap.collection_set().clear();
        heap.clear_cancelled_concgc();
        heap.reset_alloc_region();

        // Also clear the next bitmap in preparation for the next marking.
        heap.reset_next_mark_bitmap();
    }

    /// Bring regions into proper states after the move. Returns total live
    /// bytes. Heap lock must be held.
    fn post_compact(&self) -> usize {
        let heap = self.heap;
        heap.free_set().clear();

        let mut total_live = 0;
        heap.heap_region_iterate(|r| {
            heap.set_complete_top_at_mark_start(r.index(), r.bottom());

            let mut live = r.used();

            // Turn any lingering non-empty cset region into a regular one:
            // the leftover of the cancelled concurrent GC.
            if r.is_cset() && live != 0 {
                r.make_regular_bypass();
            }

            // Reclaim regular/cset regions that ended up empty.
            if (r.is_regular() || r.is_cset()) && live == 0 {
                r.make_trash();
            }

            // Recycle all trash regions.
            if r.is_trash() {
                live = 0;
                r.recycle();
            }

            // Finally, collect all suitable regions into the free set.
            if r.is_alloc_allowed() {
                let mut cset = heap.collection_set();
                if cset.is_in(r.index()) {
                    cset.remove_region(r.index());
                }
                drop(cset);
                heap.free_set().add(r.index());
            }

            r.set_live_data(live);
            r.reset_alloc_stats_to_shared();
            total_live += live;
        });
        total_live
    }
}

/// Recycle trash and promote empty regions so every region can host slid
/// data.
fn ensure_heap_active(heap: &HeapInner) {
    heap.heap_region_iterate(|r| {
        if r.is_trash() {
            r.recycle();
        }
        if r.is_empty() {
            r.make_regular_bypass();
        }
        assert!(r.is_active(), "only active regions in heap now: {r:?}");
    });
}

// ── Phase 2: sliding planner ──────────────────────────────────────────

/// Per-worker sliding state: the current target region, the bump pointer
/// inside it, and the pool of drained regions available as future targets.
struct SlidingPlanner<'a> {
    heap: &'a HeapInner,
    empty_regions: RegionSet,
    to_region: &'a Region,
    from_region: &'a Region,
    compact_point: usize,
}

impl<'a> SlidingPlanner<'a> {
    fn new(heap: &'a HeapInner, to_region: &'a Region) -> Self {
        Self {
            heap,
            empty_regions: RegionSet::new(heap.num_regions()),
            compact_point: to_region.bottom(),
            from_region: to_region,
            to_region,
        }
    }

    fn set_from_region(&mut self, from: &'a Region) {
        self.from_region = from;
    }

    fn is_compact_same_region(&self) -> bool {
        self.from_region.index() == self.to_region.index()
    }

    fn add_empty_region(&mut self, region: &Region) {
        self.empty_regions.add_region(region.index());
    }

    /// Seal the current target region at the bump pointer.
    fn finish_region(&mut self) {
        self.to_region.set_new_top(self.compact_point);
    }

    /// Regions claimed as future targets but never (re)filled hold nothing
    /// after the move.
    fn finish_empty_regions(&mut self) {
        while let Some(index) = self.empty_regions.current_then_next() {
            let region = self.heap.region(index);
            region.set_new_top(region.bottom());
        }
    }

    fn plan_object(&mut self, obj: *mut u8) {
        debug_assert!(self.heap.is_marked_complete(obj), "must be marked");

        // SAFETY: marked objects carry valid headers.
        let footprint = (unsafe { object_size(obj) } + FWD_WORDS) * WORD_BYTES;

        if self.compact_point + footprint > self.to_region.end() {
            self.finish_region();

            // Object does not fit. Pick the next drained region and start
            // compacting there.
            let new_to = match self.empty_regions.current_then_next() {
                Some(index) => self.heap.region(index),
                // Out of empty regions? Compact within the same region.
                None => self.from_region,
            };
            assert!(
                new_to.index() != self.to_region.index(),
                "must not reuse the same to-region"
            );
            self.to_region = new_to;
            self.compact_point = new_to.bottom();
        }

        debug_assert!(
            self.compact_point + footprint <= self.to_region.end(),
            "must fit"
        );
        // SAFETY: each object is planned exactly once, by the slice owner.
        debug_assert!(unsafe { is_self_forwarded(obj) }, "not yet planned");
        // The object itself lands one forwarding word past the line.
        unsafe { fwd_set(obj, (self.compact_point + FWD_BYTES) as *mut u8) };
        self.compact_point += footprint;
    }
}

struct PrepareForCompactionTask<'a> {
    heap: &'a HeapInner,
    worker_slices: &'a [Mutex<RegionSet>],
}

fn next_from_region<'a>(heap: &'a HeapInner, slice: &mut RegionSet) -> Option<&'a Region> {
    loop {
        let region = heap.claim_next()?;
        if region.is_move_allowed() {
            slice.add_region(region.index());
            return Some(region);
        }
    }
}

impl GangTask for PrepareForCompactionTask<'_> {
    fn name(&self) -> &'static str {
        "prepare for compaction"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let mut slice = self.worker_slices[worker_id].lock();

        let Some(first) = next_from_region(heap, &mut slice) else {
            // No work.
            return;
        };

        // Sliding compaction: walk all regions in the slice in claim order
        // and plan each live object, remembering drained regions for reuse
        // as targets.
        let mut planner = SlidingPlanner::new(heap, first);
        let mut from_region = Some(first);
        while let Some(from) = from_region {
            planner.set_from_region(from);
            heap.marked_object_iterate(from, |obj| planner.plan_object(obj));

            // Compacted the region to somewhere else? It is drained now.
            if !planner.is_compact_same_region() {
                planner.add_empty_region(from);
            }
            from_region = next_from_region(heap, &mut slice);
        }
        planner.finish_region();
        planner.finish_empty_regions();
    }
}

// ── Phase 3: pointer adjustment ───────────────────────────────────────

fn adjust_slot(heap: &HeapInner, slot: &mut Value) {
    if !slot.is_ref() {
        return;
    }
    let obj = slot.obj_ptr();
    debug_assert!(heap.is_marked_complete(obj), "referent must be marked");
    // SAFETY: marked referents carry planned forwarding words.
    let fwd = unsafe { fwd_get(obj) };
    *slot = Value::from_ptr(fwd);
}

struct AdjustRootPointersTask<'a> {
    heap: &'a HeapInner,
    rp: &'a RootProcessor,
}

impl GangTask for AdjustRootPointersTask<'_> {
    fn name(&self) -> &'static str {
        "adjust root pointers"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let mut adjust = |slot: &mut Value| adjust_slot(heap, slot);
        self.rp.process_all_roots(worker_id, &mut adjust);
        if worker_id == 0 {
            heap.ref_processor().weak_roots_do(&mut adjust);
        }
    }
}

struct AdjustPointersTask<'a> {
    heap: &'a HeapInner,
}

impl GangTask for AdjustPointersTask<'_> {
    fn name(&self) -> &'static str {
        "adjust pointers"
    }

    fn work(&self, _worker_id: usize) {
        let heap = self.heap;
        let trace_fn = heap.trace_fn();
        while let Some(region) = heap.claim_next() {
            // The start region walks the whole humongous payload.
            if region.is_humongous_cont() {
                continue;
            }
            heap.marked_object_iterate(region, |obj| {
                // SAFETY: obj is a marked, live object.
                unsafe { trace_fn(obj, &mut |slot| adjust_slot(heap, slot)) };
            });
        }
    }
}

// ── Phase 4: move ─────────────────────────────────────────────────────

struct CompactObjectsTask<'a> {
    heap: &'a HeapInner,
    worker_slices: &'a [Mutex<RegionSet>],
}

impl GangTask for CompactObjectsTask<'_> {
    fn name(&self) -> &'static str {
        "compact objects"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let mut slice = self.worker_slices[worker_id].lock();
        slice.clear_current_index();

        while let Some(index) = slice.current_then_next() {
            let region = heap.region(index);
            assert!(!region.is_humongous(), "humongous regions never slide");

            heap.marked_object_iterate(region, |obj| {
                // SAFETY: obj is marked and carries its planned target;
                // slices are disjoint and targets never exceed sources, so
                // the ascending overlap-safe copy is correct.
                unsafe {
                    let words = object_size(obj);
                    let target = fwd_get(obj);
                    if target as *const u8 != obj {
                        ptr::copy(obj as *const u8, target, words * WORD_BYTES);
                    }
                    fwd_init(target);
                }
            });
            region.set_top(region.new_top());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, HeapSettings};
    use crate::roots::RootSource;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Test object layout: [Header][id: u64][next: Value][pad…] = 8 words,
    /// 9 words of footprint with the forwarding word.
    const OBJ_WORDS: u32 = 8;
    const FOOTPRINT: usize = (OBJ_WORDS as usize + FWD_WORDS) * WORD_BYTES;
    const ID_OFFSET: usize = WORD_BYTES;
    const NEXT_OFFSET: usize = 2 * WORD_BYTES;

    unsafe fn trace_linked(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
        // SAFETY: all test objects use the linked layout above.
        unsafe { visitor(&mut *(obj.add(NEXT_OFFSET) as *mut Value)) }
    }

    struct TestRoots {
        slots: Vec<Value>,
    }

    impl RootSource for TestRoots {
        fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
            for slot in &mut self.slots {
                visitor(slot);
            }
        }
    }

    type Roots = Arc<parking_lot::Mutex<TestRoots>>;

    fn settings(threads: usize) -> HeapSettings {
        HeapSettings {
            heap_size: 2 * 1024 * 1024,
            region_size: 128 * 1024,
            parallel_gc_threads: threads,
            use_tlab: false,
            verify: true,
            ..Default::default()
        }
    }

    fn new_heap(threads: usize) -> (Heap, Roots) {
        let heap = Heap::new(settings(threads), trace_linked);
        let roots = Arc::new(parking_lot::Mutex::new(TestRoots { slots: Vec::new() }));
        heap.roots().register(roots.clone());
        (heap, roots)
    }

    fn alloc_linked(heap: &Heap, id: u64, next: Value) -> *mut u8 {
        let obj = heap.allocate(OBJ_WORDS, 0).unwrap().as_ptr();
        unsafe {
            *(obj.add(ID_OFFSET) as *mut u64) = id;
            *(obj.add(NEXT_OFFSET) as *mut Value) = next;
        }
        obj
    }

    fn alloc_sized(heap: &Heap, words: u32, id: u64) -> *mut u8 {
        let obj = heap.allocate(words, 0).unwrap().as_ptr();
        unsafe {
            *(obj.add(ID_OFFSET) as *mut u64) = id;
        }
        obj
    }

    fn id_of(obj: *const u8) -> u64 {
        unsafe { *(obj.add(ID_OFFSET) as *const u64) }
    }

    fn next_of(obj: *const u8) -> Value {
        unsafe { *(obj.add(NEXT_OFFSET) as *const Value) }
    }

    /// Walk the list structure from `root`, collecting ids (cycle-safe).
    fn collect_ids(root: Value) -> Vec<u64> {
        let mut ids = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = root;
        while cursor.is_ref() && seen.insert(cursor.raw()) {
            let obj = cursor.obj_ptr();
            ids.push(id_of(obj));
            cursor = next_of(obj);
        }
        ids
    }

    // ── boundary scenarios ─────────────────────────────────────────

    #[test]
    fn all_empty_heap() {
        let (heap, _roots) = new_heap(2);
        heap.full_gc(GcCause::SystemGc);

        assert_eq!(heap.used(), 0);
        assert_eq!(heap.free_set().count(), heap.num_regions());
        assert!(heap.collection_set().is_empty());
        heap.heap_region_iterate(|r| assert!(r.is_empty()));
    }

    #[test]
    fn single_live_object_slides_to_heap_start() {
        let (heap, roots) = new_heap(2);

        // Garbage before and after the survivor.
        alloc_linked(&heap, 100, Value::NULL);
        alloc_linked(&heap, 101, Value::NULL);
        let live = alloc_linked(&heap, 7, Value::NULL);
        alloc_linked(&heap, 102, Value::NULL);
        roots.lock().slots.push(Value::from_ptr(live));

        heap.full_gc(GcCause::AllocationFailure);

        assert_eq!(heap.used(), FOOTPRINT);
        let moved = roots.lock().slots[0];
        assert!(moved.is_ref());
        let obj = moved.obj_ptr();
        // Slid to the very front of the first region.
        assert_eq!(obj as usize, heap.region(0).bottom() + FWD_BYTES);
        assert_eq!(id_of(obj), 7);
        assert!(unsafe { is_self_forwarded(obj) });
    }

    #[test]
    fn fragmented_region_packs_densely() {
        let (heap, roots) = new_heap(1);

        // Every other object survives.
        let mut live_ids = Vec::new();
        for i in 0..300u64 {
            let obj = alloc_linked(&heap, i, Value::NULL);
            if i % 2 == 0 {
                roots.lock().slots.push(Value::from_ptr(obj));
                live_ids.push(i);
            }
        }

        heap.full_gc(GcCause::AllocationFailure);

        assert_eq!(heap.used(), 150 * FOOTPRINT);
        let region = heap.region(0);
        assert_eq!(region.top(), region.bottom() + 150 * FOOTPRINT);

        // Densely packed in the original order, contents intact.
        let roots = roots.lock();
        let mut addresses: Vec<usize> = Vec::new();
        for (slot, id) in roots.slots.iter().zip(&live_ids) {
            let obj = slot.obj_ptr();
            assert_eq!(id_of(obj), *id);
            addresses.push(obj as usize);
        }
        for pair in addresses.windows(2) {
            assert_eq!(pair[1] - pair[0], FOOTPRINT, "sliding left a gap");
        }
    }

    #[test]
    fn unreachable_humongous_is_trashed_and_recycled() {
        let (heap, roots) = new_heap(2);
        let region_words = (heap.region_size() / WORD_BYTES) as u32;

        // Spans three regions, no root.
        let hum = alloc_sized(&heap, 2 * region_words + region_words / 2, 900);
        let start_index = heap.region_index_for(hum as usize);
        assert!(heap.region(start_index).is_humongous_start());

        let live = alloc_linked(&heap, 1, Value::NULL);
        roots.lock().slots.push(Value::from_ptr(live));

        heap.full_gc(GcCause::LastDitch);

        // The three backing regions were trashed in the humongous sweep and
        // recycled; the survivor slid into the freed space, so every region
        // is allocation-ready again.
        assert_eq!(heap.used(), FOOTPRINT);
        heap.heap_region_iterate(|r| assert!(!r.is_humongous()));
        assert_eq!(heap.free_set().count(), heap.num_regions());
        let empty = {
            let mut n = 0;
            heap.heap_region_iterate(|r| {
                if r.is_empty() {
                    n += 1;
                }
            });
            n
        };
        assert_eq!(empty, heap.num_regions() - 1);
        assert_eq!(id_of(roots.lock().slots[0].obj_ptr()), 1);
    }

    #[test]
    fn live_humongous_is_pinned_in_place() {
        let (heap, roots) = new_heap(2);
        let region_words = (heap.region_size() / WORD_BYTES) as u32;

        let hum = alloc_sized(&heap, 2 * region_words, 900);
        let hum_footprint = (2 * region_words as usize + FWD_WORDS) * WORD_BYTES;
        let start_index = heap.region_index_for(hum as usize);
        roots.lock().slots.push(Value::from_ptr(hum));

        let live = alloc_linked(&heap, 1, Value::from_ptr(hum));
        roots.lock().slots.push(Value::from_ptr(live));

        heap.full_gc(GcCause::SystemGc);

        // Humongous object did not move; references to it survived.
        let roots = roots.lock();
        assert_eq!(roots.slots[0].obj_ptr(), hum);
        assert_eq!(id_of(hum), 900);
        assert!(heap.region(start_index).is_humongous_start());
        assert_eq!(next_of(roots.slots[1].obj_ptr()), Value::from_ptr(hum));
        assert_eq!(heap.used(), hum_footprint + FOOTPRINT);
    }

    #[test]
    fn cancelled_concurrent_cycle_is_recovered() {
        let (heap, roots) = new_heap(2);

        // Live data in two regions; region 1 is a leftover cset with a mix
        // of live and dead objects.
        let keep0 = alloc_linked(&heap, 1, Value::NULL);
        let region_words = (heap.region_size() / WORD_BYTES) as u32;
        alloc_sized(&heap, region_words / 2, 50); // push region 0 near full
        alloc_sized(&heap, region_words / 2, 51); // lands in region 1
        let keep1 = alloc_linked(&heap, 2, Value::NULL);
        let keep1_region = heap.region_index_for(keep1 as usize);
        assert!(keep1_region > 0, "second region must be in use");

        roots.lock().slots.push(Value::from_ptr(keep0));
        roots.lock().slots.push(Value::from_ptr(keep1));

        // Simulate the cancelled concurrent cycle: marker mid-flight,
        // stale marks on the next bitmap, a non-empty collection set.
        heap.region(keep1_region).make_cset();
        heap.collection_set().add_region(keep1_region);
        heap.set_concurrent_mark_in_progress(true);
        heap.set_cancelled_concgc(true);
        heap.next_mark_bitmap().par_mark(keep0 as usize);

        heap.full_gc(GcCause::AllocationFailure);

        assert!(!heap.is_concurrent_mark_in_progress());
        assert!(!heap.is_cancelled_concgc());
        assert!(heap.collection_set().is_empty());
        heap.heap_region_iterate(|r| assert!(!r.is_cset()));

        let roots = roots.lock();
        assert_eq!(id_of(roots.slots[0].obj_ptr()), 1);
        assert_eq!(id_of(roots.slots[1].obj_ptr()), 2);
        assert_eq!(heap.used(), 2 * FOOTPRINT);
    }

    #[test]
    fn worker_count_does_not_change_outcome() {
        let mut outcomes = Vec::new();
        for threads in [1, 4] {
            let (heap, roots) = new_heap(threads);
            let region_words = (heap.region_size() / WORD_BYTES) as u32;

            // Fill several regions with medium objects, root every third.
            let mut rooted = 0;
            for i in 0..64u64 {
                let obj = alloc_sized(&heap, region_words / 16, i);
                if i % 3 == 0 {
                    roots.lock().slots.push(Value::from_ptr(obj));
                    rooted += 1;
                }
            }

            heap.full_gc(GcCause::SystemGc);

            let ids: HashSet<u64> = roots.lock().slots.iter().map(|s| id_of(s.obj_ptr())).collect();
            outcomes.push((heap.used(), heap.free_set().count(), rooted, ids));
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    // ── laws ───────────────────────────────────────────────────────

    #[test]
    fn back_to_back_full_gcs_are_idempotent() {
        let (heap, roots) = new_heap(1);
        for i in 0..40u64 {
            let obj = alloc_linked(&heap, i, Value::NULL);
            if i % 4 != 3 {
                roots.lock().slots.push(Value::from_ptr(obj));
            }
        }

        heap.full_gc(GcCause::SystemGc);
        let tops_first: Vec<usize> = (0..heap.num_regions()).map(|i| heap.region(i).top()).collect();
        let slots_first: Vec<u64> = roots.lock().slots.iter().map(|s| s.raw()).collect();
        let used_first = heap.used();

        heap.full_gc(GcCause::SystemGc);
        let tops_second: Vec<usize> =
            (0..heap.num_regions()).map(|i| heap.region(i).top()).collect();
        let slots_second: Vec<u64> = roots.lock().slots.iter().map(|s| s.raw()).collect();

        assert_eq!(tops_first, tops_second);
        assert_eq!(slots_first, slots_second);
        assert_eq!(used_first, heap.used());
    }

    #[test]
    fn reachable_graph_survives_isomorphically() {
        let (heap, roots) = new_heap(2);

        // a -> b -> c -> a (cycle), d -> c.
        let c = alloc_linked(&heap, 3, Value::NULL);
        let b = alloc_linked(&heap, 2, Value::from_ptr(c));
        let a = alloc_linked(&heap, 1, Value::from_ptr(b));
        unsafe { *(c.add(NEXT_OFFSET) as *mut Value) = Value::from_ptr(a) };
        let d = alloc_linked(&heap, 4, Value::from_ptr(c));
        alloc_linked(&heap, 99, Value::NULL); // garbage

        roots.lock().slots.push(Value::from_ptr(a));
        roots.lock().slots.push(Value::from_ptr(d));

        let before_a = collect_ids(Value::from_ptr(a));
        let before_d = collect_ids(Value::from_ptr(d));

        heap.full_gc(GcCause::SystemGc);

        let roots = roots.lock();
        assert_eq!(collect_ids(roots.slots[0]), before_a);
        assert_eq!(collect_ids(roots.slots[1]), before_d);
        assert_eq!(heap.used(), 4 * FOOTPRINT);

        // Shared structure stays shared: d.next and the cycle meet at the
        // same c.
        let c_via_d = next_of(roots.slots[1].obj_ptr());
        let c_via_b = next_of(next_of(roots.slots[0].obj_ptr()).obj_ptr());
        assert_eq!(c_via_d, c_via_b);
    }

    #[test]
    fn every_live_object_is_self_forwarded_after_gc() {
        let (heap, roots) = new_heap(2);
        let c = alloc_linked(&heap, 3, Value::NULL);
        let b = alloc_linked(&heap, 2, Value::from_ptr(c));
        let a = alloc_linked(&heap, 1, Value::from_ptr(b));
        roots.lock().slots.push(Value::from_ptr(a));

        heap.full_gc(GcCause::SystemGc);

        let mut cursor = roots.lock().slots[0];
        while cursor.is_ref() {
            let obj = cursor.obj_ptr();
            assert!(unsafe { is_self_forwarded(obj) }, "double move");
            cursor = next_of(obj);
        }
    }

    // ── references, pinning, ambient machinery ─────────────────────

    #[test]
    fn weak_slots_cleared_or_updated() {
        let (heap, roots) = new_heap(2);

        let live = alloc_linked(&heap, 10, Value::NULL);
        let dead = alloc_linked(&heap, 11, Value::NULL);
        roots.lock().slots.push(Value::from_ptr(live));

        let mut weak_live = Box::new(Value::from_ptr(live));
        let mut weak_dead = Box::new(Value::from_ptr(dead));
        unsafe {
            heap.ref_processor().register_weak_slot(&mut *weak_live, false);
            heap.ref_processor().register_weak_slot(&mut *weak_dead, true);
        }

        heap.full_gc(GcCause::SystemGc);

        // Dead referent cleared (soft or not: full GC clears everything),
        // live referent re-pointed at the moved object.
        assert!(weak_dead.is_null());
        assert!(weak_live.is_ref());
        assert_eq!(id_of(weak_live.obj_ptr()), 10);
        assert_eq!(*weak_live, roots.lock().slots[0]);
    }

    #[test]
    fn pinned_region_holds_objects_in_place() {
        let (heap, roots) = new_heap(2);

        let pinned_obj = alloc_linked(&heap, 5, Value::NULL);
        alloc_linked(&heap, 6, Value::NULL); // dead neighbour, stays physically
        let pinned_region = heap.region_for(pinned_obj as usize);
        let used_before = pinned_region.used();
        pinned_region.make_pinned();

        roots.lock().slots.push(Value::from_ptr(pinned_obj));

        heap.full_gc(GcCause::SystemGc);

        assert_eq!(roots.lock().slots[0].obj_ptr(), pinned_obj);
        assert_eq!(id_of(pinned_obj), 5);
        assert!(pinned_region.is_pinned());
        // A pinned region cannot be compacted, dead neighbours included.
        assert_eq!(pinned_region.used(), used_before);
        assert_eq!(heap.used(), used_before);
    }

    #[test]
    fn allocation_works_after_collection() {
        let (heap, roots) = new_heap(2);
        for i in 0..50u64 {
            let obj = alloc_linked(&heap, i, Value::NULL);
            if i == 25 {
                roots.lock().slots.push(Value::from_ptr(obj));
            }
        }

        heap.full_gc(GcCause::AllocationFailure);
        assert_eq!(heap.used(), FOOTPRINT);

        let fresh = alloc_linked(&heap, 1000, Value::NULL);
        assert_eq!(id_of(fresh), 1000);
        assert_eq!(heap.used(), 2 * FOOTPRINT);

        roots.lock().slots.push(Value::from_ptr(fresh));
        heap.full_gc(GcCause::SystemGc);
        assert_eq!(heap.used(), 2 * FOOTPRINT);
    }

    #[test]
    fn gc_state_is_clean_after_collection() {
        let (heap, roots) = new_heap(2);
        let live = alloc_linked(&heap, 1, Value::NULL);
        roots.lock().slots.push(Value::from_ptr(live));

        heap.full_gc(GcCause::FullGcRequest);

        assert!(!heap.is_full_gc_in_progress());
        assert!(!heap.is_full_gc_move_in_progress());
        assert!(!heap.need_update_refs());
        assert!(!heap.is_at_safepoint());
        assert_eq!(heap.bytes_allocated_since_mark(), 0);
        assert_eq!(heap.barrier_set().name(), "forwarding");
        assert!(heap.is_next_bitmap_clear());
        assert!(heap.is_complete_bitmap_clear());
        assert_eq!(heap.tracer().completed_collections(), 1);
        assert_eq!(
            heap.tracer().timings().count(GcPhase::FullGcCopyObjects),
            1
        );
    }

    #[test]
    fn tlab_heap_survives_collection() {
        let mut s = settings(2);
        s.use_tlab = true;
        let heap = Heap::new(s, trace_linked);
        let roots = Arc::new(parking_lot::Mutex::new(TestRoots { slots: Vec::new() }));
        heap.roots().register(roots.clone());

        let tlab = heap.register_tlab();
        let mut keep = Vec::new();
        for i in 0..200u64 {
            let obj = tlab.allocate(&heap, OBJ_WORDS, 0).unwrap().as_ptr();
            unsafe {
                *(obj.add(ID_OFFSET) as *mut u64) = i;
                *(obj.add(NEXT_OFFSET) as *mut Value) = Value::NULL;
            }
            if i % 10 == 0 {
                roots.lock().slots.push(Value::from_ptr(obj));
                keep.push(i);
            }
        }

        heap.full_gc(GcCause::AllocationFailure);

        // Only the rooted objects survive; TLAB slack is gone.
        assert_eq!(heap.used(), keep.len() * FOOTPRINT);
        for (slot, id) in roots.lock().slots.iter().zip(&keep) {
            assert_eq!(id_of(slot.obj_ptr()), *id);
        }

        // The retired TLAB refills transparently after the collection.
        let obj = tlab.allocate(&heap, OBJ_WORDS, 0).unwrap();
        assert!(heap.is_in(obj.as_ptr() as usize));
    }

    #[test]
    fn uncommitted_regions_are_promoted_for_sliding() {
        let (heap, roots) = new_heap(2);

        // Uncommit a few empty regions up front.
        {
            let mut free = heap.free_set();
            for index in [4usize, 5] {
                free.remove(index);
            }
        }
        heap.region(4).uncommit();
        heap.region(5).uncommit();

        let live = alloc_linked(&heap, 3, Value::NULL);
        roots.lock().slots.push(Value::from_ptr(live));

        heap.full_gc(GcCause::SystemGc);

        // Prepare promoted them through regular-bypass; post-compact saw
        // them empty and recycled them into the free set.
        assert!(heap.region(4).is_empty());
        assert!(heap.region(5).is_empty());
        assert!(heap.free_set().contains(4));
        assert!(heap.free_set().contains(5));
        assert_eq!(id_of(roots.lock().slots[0].obj_ptr()), 3);
    }
}
