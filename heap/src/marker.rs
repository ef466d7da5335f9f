//! Stop-the-world marking.
//!
//! This is the concurrent marker driven in its STW mode: the full GC uses
//! it to rebuild liveness from the roots no matter which state an aborted
//! concurrent cycle left behind. Workers claim root sources off the shared
//! cursor, mark into the "next" bitmap with `par_mark` (exactly one worker
//! wins each object and queues it), and drain their local queues to
//! completion. Reference processing and class unloading happen in the
//! shared finish step.

use std::sync::atomic::{AtomicBool, Ordering};

use object::{FWD_WORDS, Value, WORD_BYTES, fwd_get, object_size};

use crate::heap::HeapInner;
use crate::roots::RootProcessor;
use crate::tracer::GcPhase;
use crate::worker::GangTask;

#[derive(Debug, Default)]
pub struct StwMarker {
    process_references: AtomicBool,
    unload_classes: AtomicBool,
    cancelled: AtomicBool,
}

impl StwMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_process_references(&self, v: bool) {
        self.process_references.store(v, Ordering::Relaxed);
    }

    pub fn process_references(&self) -> bool {
        self.process_references.load(Ordering::Relaxed)
    }

    pub fn set_unload_classes(&self, v: bool) {
        self.unload_classes.store(v, Ordering::Relaxed);
    }

    pub fn unload_classes(&self) -> bool {
        self.unload_classes.load(Ordering::Relaxed)
    }

    /// Abort an in-flight (concurrent) marking. Its partial results on the
    /// next bitmap are abandoned; the caller resets that bitmap.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        log::debug!("marking cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Resolve every root through the forwarding word. Needed before
    /// marking when a cancelled evacuation left roots pointing at
    /// forwarded copies.
    pub fn update_roots(&self, heap: &HeapInner, phase: GcPhase) {
        let _timer = heap.tracer().phase(phase);
        let rp = RootProcessor::new(heap.roots());
        let task = UpdateRootsTask { heap, rp: &rp };
        heap.workers().run_task(&task);
    }

    /// Mark everything reachable from the strong roots into the next
    /// bitmap, accumulating per-region live data.
    pub fn mark_roots(&self, heap: &HeapInner, phase: GcPhase) {
        self.cancelled.store(false, Ordering::Relaxed);
        let _timer = heap.tracer().phase(phase);
        let rp = RootProcessor::new(heap.roots());
        let task = MarkRootsTask { heap, rp: &rp };
        heap.workers().run_task(&task);
    }

    /// Finish marking: process discovered references against the freshly
    /// built bitmap. Class unloading is the consumer's business; the flag
    /// only gates whether they are told to do it.
    pub fn shared_finish_mark_from_roots(&self, heap: &HeapInner, full_gc: bool) {
        assert!(!full_gc || heap.is_full_gc_in_progress());

        if self.process_references() {
            let bitmap = heap.next_mark_bitmap();
            heap.ref_processor()
                .process_discovered_references(|addr| bitmap.is_marked(addr));
        } else {
            heap.ref_processor().disable_discovery();
        }
    }
}

// ── gang tasks ────────────────────────────────────────────────────────

struct UpdateRootsTask<'a> {
    heap: &'a HeapInner,
    rp: &'a RootProcessor,
}

impl GangTask for UpdateRootsTask<'_> {
    fn name(&self) -> &'static str {
        "update roots"
    }

    fn work(&self, worker_id: usize) {
        let mut resolve = |slot: &mut Value| {
            if !slot.is_ref() {
                return;
            }
            let obj = slot.obj_ptr();
            // SAFETY: reachable references point at objects with
            // initialized forwarding words.
            let fwd = unsafe { fwd_get(obj) };
            if fwd != obj {
                *slot = Value::from_ptr(fwd);
            }
        };
        self.rp.process_all_roots(worker_id, &mut resolve);
        if worker_id == 0 {
            self.heap.ref_processor().weak_roots_do(&mut resolve);
        }
    }
}

struct MarkRootsTask<'a> {
    heap: &'a HeapInner,
    rp: &'a RootProcessor,
}

impl GangTask for MarkRootsTask<'_> {
    fn name(&self) -> &'static str {
        "mark from roots"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let bitmap = heap.next_mark_bitmap();
        let trace_fn = heap.trace_fn();

        let mut queue: Vec<*mut u8> = Vec::new();
        let queue_ptr: *mut Vec<*mut u8> = &mut queue;

        let mut visit = |slot: &mut Value| {
            if !slot.is_ref() {
                return;
            }
            let obj = slot.obj_ptr();
            debug_assert!(heap.is_in(obj as usize), "reference outside heap");

            if bitmap.par_mark(obj as usize) {
                // SAFETY: a marked reference points at a valid object.
                let footprint = (unsafe { object_size(obj) } + FWD_WORDS) * WORD_BYTES;
                heap.region_for(obj as usize).increase_live_data(footprint);
                // SAFETY: queue_ptr is valid for the duration of this task.
                unsafe { (*queue_ptr).push(obj) };
            }
        };

        self.rp.process_all_roots(worker_id, &mut visit);

        while let Some(obj) = queue.pop() {
            // SAFETY: obj was marked through a live reference.
            unsafe { trace_fn(obj, &mut visit) };
        }
    }
}
