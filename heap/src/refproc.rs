//! Weak and soft reference processing.
//!
//! Consumers register reference slots (the referent field of their weak or
//! soft reference objects). While discovery is enabled, the final-mark pass
//! sweeps the registry: a slot whose referent did not get marked is cleared
//! to null. A full GC snapshots the "clear everything" soft policy, so soft
//! and weak referents are treated alike there. Surviving slots are rewritten
//! to the referents' new locations during pointer adjustment like any other
//! root.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use object::Value;

#[derive(Debug, Clone, Copy)]
struct WeakSlot {
    /// Address of the `Value` holding the referent.
    addr: usize,
    soft: bool,
}

#[derive(Debug, Default)]
pub struct ReferenceProcessor {
    discovery_enabled: AtomicBool,
    /// Soft policy for the current cycle: true clears soft referents as
    /// aggressively as weak ones.
    clear_soft: AtomicBool,
    mt_degree: AtomicUsize,
    slots: Mutex<Vec<WeakSlot>>,
    /// References discovered by the in-flight cycle; nonzero only between
    /// discovery and processing.
    discovered: AtomicUsize,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the referent slot of a weak (or soft) reference.
    ///
    /// # Safety
    ///
    /// `slot` must stay valid and pinned for the lifetime of the heap; the
    /// processor rewrites it during collections.
    pub unsafe fn register_weak_slot(&self, slot: *mut Value, soft: bool) {
        self.slots.lock().push(WeakSlot {
            addr: slot as usize,
            soft,
        });
    }

    pub fn enable_discovery(&self, verify_no_refs: bool) {
        if verify_no_refs {
            self.verify_no_references_recorded();
        }
        self.discovery_enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable_discovery(&self) {
        self.discovery_enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_discovery_enabled(&self) -> bool {
        self.discovery_enabled.load(Ordering::Relaxed)
    }

    /// Drop whatever a cancelled cycle had discovered so far.
    pub fn abandon_partial_discovery(&self) {
        self.discovered.store(0, Ordering::Relaxed);
    }

    pub fn verify_no_references_recorded(&self) {
        assert_eq!(
            self.discovered.load(Ordering::Relaxed),
            0,
            "stale discovered references"
        );
    }

    /// Snapshot the soft reference policy for this cycle.
    pub fn setup_policy(&self, clear_soft: bool) {
        self.clear_soft.store(clear_soft, Ordering::Relaxed);
    }

    pub fn set_active_mt_degree(&self, degree: usize) {
        self.mt_degree.store(degree, Ordering::Relaxed);
    }

    pub fn active_mt_degree(&self) -> usize {
        self.mt_degree.load(Ordering::Relaxed)
    }

    /// Process all registered reference slots against the given liveness
    /// predicate, clearing dead referents. Returns the number of cleared
    /// slots. Discovery ends with processing.
    pub fn process_discovered_references(&self, is_live: impl Fn(usize) -> bool) -> usize {
        assert!(self.is_discovery_enabled(), "discovery not enabled");
        let clear_soft = self.clear_soft.load(Ordering::Relaxed);

        let mut cleared = 0;
        let slots = self.slots.lock();
        for slot in slots.iter() {
            // SAFETY: registration contract keeps the slot valid and the
            // mutator is stopped while we rewrite it.
            let value = unsafe { &mut *(slot.addr as *mut Value) };
            if !value.is_ref() {
                continue;
            }
            self.discovered.fetch_add(1, Ordering::Relaxed);
            if is_live(value.ref_bits() as usize) {
                continue;
            }
            if slot.soft && !clear_soft {
                continue;
            }
            *value = Value::NULL;
            cleared += 1;
        }

        self.discovered.store(0, Ordering::Relaxed);
        self.disable_discovery();
        log::debug!("reference processing: cleared {cleared} referents");
        cleared
    }

    /// Visit every registered slot that still holds a referent. Used by the
    /// pointer-adjust pass; no liveness decisions are made here.
    pub fn weak_roots_do(&self, visitor: &mut dyn FnMut(&mut Value)) {
        let slots = self.slots.lock();
        for slot in slots.iter() {
            // SAFETY: see process_discovered_references.
            let value = unsafe { &mut *(slot.addr as *mut Value) };
            if value.is_ref() {
                visitor(value);
            }
        }
    }
}
