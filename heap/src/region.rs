//! Heap regions and region sets.
//!
//! A region is a fixed-size, contiguous slice of the heap reservation with a
//! uniform state and its own top/bottom bookkeeping. All shared metadata is
//! atomic; a region is only ever mutated by the thread that claimed it or
//! under the heap lock.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::system;

/// Region lifecycle states.
///
/// ```text
///  EmptyUncommitted ⇄ EmptyCommitted → Regular → Cset ──┐
///            │                │    │      │  ↑    │     │
///            └── make_regular_bypass      │  └ Pinned   │
///                             │           └─────────────┤
///                             └→ Humongous{Start,Cont} ─┤
///                                                       ▼
///                                   EmptyCommitted ← Trash (recycle)
/// ```
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    EmptyUncommitted = 0,
    EmptyCommitted,
    Regular,
    HumongousStart,
    HumongousCont,
    Cset,
    Pinned,
    Trash,
}

impl RegionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::EmptyUncommitted,
            1 => Self::EmptyCommitted,
            2 => Self::Regular,
            3 => Self::HumongousStart,
            4 => Self::HumongousCont,
            5 => Self::Cset,
            6 => Self::Pinned,
            7 => Self::Trash,
            _ => unreachable!("invalid region state byte: {raw}"),
        }
    }
}

pub struct Region {
    index: usize,
    bottom: usize,
    end: usize,
    state: AtomicU8,
    /// High watermark of live + allocated data.
    top: AtomicUsize,
    /// Scratch for the post-compaction top, written in Phase 2, applied in
    /// Phase 4.
    new_top: AtomicUsize,
    /// Live bytes as recorded by the last marking / post-compact pass.
    live_data: AtomicUsize,
    /// Highest address safe for concurrent heap iteration.
    safe_limit: AtomicUsize,
    tlab_allocated: AtomicUsize,
    shared_allocated: AtomicUsize,
}

impl Region {
    pub fn new(index: usize, bottom: usize, end: usize) -> Self {
        debug_assert!(bottom < end);
        Self {
            index,
            bottom,
            end,
            state: AtomicU8::new(RegionState::EmptyCommitted as u8),
            top: AtomicUsize::new(bottom),
            new_top: AtomicUsize::new(bottom),
            live_data: AtomicUsize::new(0),
            safe_limit: AtomicUsize::new(bottom),
            tlab_allocated: AtomicUsize::new(0),
            shared_allocated: AtomicUsize::new(0),
        }
    }

    // ── bounds ─────────────────────────────────────────────────────

    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline(always)]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end - self.bottom
    }

    #[inline(always)]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_top(&self, top: usize) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn new_top(&self) -> usize {
        self.new_top.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_new_top(&self, new_top: usize) {
        debug_assert!(new_top >= self.bottom && new_top <= self.end);
        self.new_top.store(new_top, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    #[inline(always)]
    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    // ── live data / stats ──────────────────────────────────────────

    #[inline(always)]
    pub fn live_data(&self) -> usize {
        self.live_data.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_live_data(&self, bytes: usize) {
        self.live_data.store(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn clear_live_data(&self) {
        self.live_data.store(0, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn increase_live_data(&self, bytes: usize) {
        self.live_data.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn concurrent_iteration_safe_limit(&self) -> usize {
        self.safe_limit.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_concurrent_iteration_safe_limit(&self, limit: usize) {
        debug_assert!(limit >= self.bottom && limit <= self.end);
        self.safe_limit.store(limit, Ordering::Relaxed);
    }

    pub fn record_tlab_alloc(&self, bytes: usize) {
        self.tlab_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_shared_alloc(&self, bytes: usize) {
        self.shared_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn tlab_allocated(&self) -> usize {
        self.tlab_allocated.load(Ordering::Relaxed)
    }

    /// Fold all allocation stats into the shared counter. After a full GC
    /// there are no TLAB-attributed bytes left to distinguish.
    pub fn reset_alloc_stats_to_shared(&self) {
        self.tlab_allocated.store(0, Ordering::Relaxed);
        self.shared_allocated.store(self.used(), Ordering::Relaxed);
    }

    // ── state predicates ───────────────────────────────────────────

    #[inline(always)]
    pub fn state(&self) -> RegionState {
        RegionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        matches!(
            self.state(),
            RegionState::EmptyUncommitted | RegionState::EmptyCommitted
        )
    }

    #[inline(always)]
    pub fn is_empty_uncommitted(&self) -> bool {
        self.state() == RegionState::EmptyUncommitted
    }

    #[inline(always)]
    pub fn is_regular(&self) -> bool {
        self.state() == RegionState::Regular
    }

    #[inline(always)]
    pub fn is_humongous_start(&self) -> bool {
        self.state() == RegionState::HumongousStart
    }

    #[inline(always)]
    pub fn is_humongous_cont(&self) -> bool {
        self.state() == RegionState::HumongousCont
    }

    #[inline(always)]
    pub fn is_humongous(&self) -> bool {
        self.is_humongous_start() || self.is_humongous_cont()
    }

    #[inline(always)]
    pub fn is_cset(&self) -> bool {
        self.state() == RegionState::Cset
    }

    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.state() == RegionState::Pinned
    }

    #[inline(always)]
    pub fn is_trash(&self) -> bool {
        self.state() == RegionState::Trash
    }

    /// A region that either holds data or can have data slid through it.
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        !self.is_empty() && !self.is_trash()
    }

    /// Regions whose objects the sliding compactor may relocate. Humongous
    /// regions never move here and pinned regions hold their objects in
    /// place.
    #[inline(always)]
    pub fn is_move_allowed(&self) -> bool {
        matches!(self.state(), RegionState::Regular | RegionState::Cset)
    }

    /// Regions the allocator may hand out memory from.
    #[inline(always)]
    pub fn is_alloc_allowed(&self) -> bool {
        matches!(
            self.state(),
            RegionState::EmptyUncommitted | RegionState::EmptyCommitted | RegionState::Regular
        )
    }

    // ── state transitions ──────────────────────────────────────────

    fn set_state(&self, state: RegionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    #[cold]
    fn illegal_transition(&self, to: &str) -> ! {
        panic!(
            "region {}: illegal transition {:?} -> {}",
            self.index,
            self.state(),
            to
        );
    }

    fn commit_if_needed(&self) {
        if self.is_empty_uncommitted() {
            system::commit_memory(self.bottom, self.size());
        }
    }

    pub fn make_regular_allocation(&self) {
        match self.state() {
            RegionState::EmptyUncommitted | RegionState::EmptyCommitted => {
                self.commit_if_needed();
                self.set_state(RegionState::Regular);
            }
            _ => self.illegal_transition("Regular (allocation)"),
        }
    }

    /// Promote straight to `Regular`, bypassing allocation bookkeeping. The
    /// full GC uses this to turn every region into a valid sliding target
    /// and to demote lingering cset regions.
    pub fn make_regular_bypass(&self) {
        match self.state() {
            RegionState::EmptyUncommitted | RegionState::EmptyCommitted | RegionState::Cset => {
                self.commit_if_needed();
                self.set_state(RegionState::Regular);
            }
            _ => self.illegal_transition("Regular (bypass)"),
        }
    }

    pub fn make_humongous_start(&self) {
        match self.state() {
            RegionState::EmptyUncommitted | RegionState::EmptyCommitted => {
                self.commit_if_needed();
                self.set_state(RegionState::HumongousStart);
            }
            _ => self.illegal_transition("HumongousStart"),
        }
    }

    pub fn make_humongous_cont(&self) {
        match self.state() {
            RegionState::EmptyUncommitted | RegionState::EmptyCommitted => {
                self.commit_if_needed();
                self.set_state(RegionState::HumongousCont);
            }
            _ => self.illegal_transition("HumongousCont"),
        }
    }

    pub fn make_cset(&self) {
        match self.state() {
            RegionState::Regular => self.set_state(RegionState::Cset),
            _ => self.illegal_transition("Cset"),
        }
    }

    pub fn make_pinned(&self) {
        match self.state() {
            RegionState::Regular => self.set_state(RegionState::Pinned),
            _ => self.illegal_transition("Pinned"),
        }
    }

    pub fn make_unpinned(&self) {
        match self.state() {
            RegionState::Pinned => self.set_state(RegionState::Regular),
            _ => self.illegal_transition("Regular (unpin)"),
        }
    }

    pub fn make_trash(&self) {
        match self.state() {
            RegionState::Regular
            | RegionState::Cset
            | RegionState::HumongousStart
            | RegionState::HumongousCont => self.set_state(RegionState::Trash),
            _ => self.illegal_transition("Trash"),
        }
    }

    /// Reclaim a trashed region: reset all bookkeeping and mark it
    /// committed-empty, ready to be reused as an allocation or sliding
    /// target.
    pub fn recycle(&self) {
        match self.state() {
            RegionState::Trash => {
                self.set_top(self.bottom);
                self.set_new_top(self.bottom);
                self.clear_live_data();
                self.set_concurrent_iteration_safe_limit(self.bottom);
                self.tlab_allocated.store(0, Ordering::Relaxed);
                self.shared_allocated.store(0, Ordering::Relaxed);
                self.set_state(RegionState::EmptyCommitted);
            }
            _ => self.illegal_transition("EmptyCommitted (recycle)"),
        }
    }

    /// Return the backing pages of a committed-empty region to the OS.
    pub fn uncommit(&self) {
        match self.state() {
            RegionState::EmptyCommitted => {
                system::uncommit_memory(self.bottom, self.size());
                self.set_state(RegionState::EmptyUncommitted);
            }
            _ => self.illegal_transition("EmptyUncommitted"),
        }
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("index", &self.index)
            .field("state", &self.state())
            .field("bottom", &format_args!("0x{:x}", self.bottom))
            .field("top", &format_args!("0x{:x}", self.top()))
            .field("end", &format_args!("0x{:x}", self.end))
            .field("live", &self.live_data())
            .finish()
    }
}

// ── RegionSet ─────────────────────────────────────────────────────────

/// An ordered set of region indices with a traversal cursor.
///
/// Worker slices and per-slice empty-region pools are `RegionSet`s: regions
/// are appended in claim order and later replayed in exactly that order.
/// A set is owned by a single worker at a time, so the cursor is plain.
#[derive(Debug)]
pub struct RegionSet {
    indices: Vec<u32>,
    cursor: usize,
}

impl RegionSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            indices: Vec::with_capacity(capacity),
            cursor: 0,
        }
    }

    pub fn add_region(&mut self, index: usize) {
        debug_assert!(index <= u32::MAX as usize);
        self.indices.push(index as u32);
    }

    /// Return the region at the cursor and advance, or `None` at the end.
    pub fn current_then_next(&mut self) -> Option<usize> {
        let index = *self.indices.get(self.cursor)?;
        self.cursor += 1;
        Some(index as usize)
    }

    pub fn clear_current_index(&mut self) {
        self.cursor = 0;
    }

    pub fn count(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn regions(&self) -> &[u32] {
        &self.indices
    }
}
