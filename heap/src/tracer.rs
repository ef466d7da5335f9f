//! GC session reporting and phase timing.
//!
//! Stands in for a full tracing backend: sessions and phases are logged via
//! `log` and accumulated into a phase-indexed duration table that tests and
//! benchmarks can read back.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Why a collection was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    AllocationFailure,
    SystemGc,
    MetadataGc,
    LastDitch,
    FullGcRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GcPhase {
    FullGcHeapDumps = 0,
    FullGcPrepare,
    FullGcRoots,
    FullGcMark,
    FullGcCalculateAddresses,
    FullGcAdjustPointers,
    FullGcCopyObjects,
    FullGcResizeTlabs,
}

impl GcPhase {
    pub const COUNT: usize = Self::FullGcResizeTlabs as usize + 1;

    pub fn name(self) -> &'static str {
        match self {
            Self::FullGcHeapDumps => "full gc: heap dumps",
            Self::FullGcPrepare => "full gc: prepare",
            Self::FullGcRoots => "full gc: roots",
            Self::FullGcMark => "full gc: mark",
            Self::FullGcCalculateAddresses => "full gc: calculate addresses",
            Self::FullGcAdjustPointers => "full gc: adjust pointers",
            Self::FullGcCopyObjects => "full gc: copy objects",
            Self::FullGcResizeTlabs => "full gc: resize tlabs",
        }
    }
}

/// Cumulative per-phase durations across all collections.
#[derive(Debug, Default, Clone)]
pub struct PhaseTimings {
    totals: [Duration; GcPhase::COUNT],
    counts: [usize; GcPhase::COUNT],
}

impl PhaseTimings {
    pub fn total(&self, phase: GcPhase) -> Duration {
        self.totals[phase as usize]
    }

    pub fn count(&self, phase: GcPhase) -> usize {
        self.counts[phase as usize]
    }

    fn record(&mut self, phase: GcPhase, elapsed: Duration) {
        self.totals[phase as usize] += elapsed;
        self.counts[phase as usize] += 1;
    }
}

#[derive(Debug)]
struct SessionState {
    started: Option<(GcCause, Instant)>,
    completed: usize,
}

/// Collection session bookkeeping. One session at a time; a session left
/// open by an aborted cycle is closed by the next reporter.
#[derive(Debug)]
pub struct GcTracer {
    session: Mutex<SessionState>,
    timings: Mutex<PhaseTimings>,
}

impl Default for GcTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl GcTracer {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(SessionState {
                started: None,
                completed: 0,
            }),
            timings: Mutex::new(PhaseTimings::default()),
        }
    }

    pub fn has_reported_gc_start(&self) -> bool {
        self.session.lock().started.is_some()
    }

    pub fn report_gc_start(&self, cause: GcCause) {
        let mut session = self.session.lock();
        assert!(session.started.is_none(), "GC session already open");
        log::info!("GC start: {cause:?}");
        session.started = Some((cause, Instant::now()));
    }

    pub fn report_gc_end(&self) {
        let mut session = self.session.lock();
        let (cause, begin) = session.started.take().expect("no GC session open");
        session.completed += 1;
        log::info!("GC end: {cause:?}, {:.3}ms", begin.elapsed().as_secs_f64() * 1e3);
    }

    pub fn completed_collections(&self) -> usize {
        self.session.lock().completed
    }

    /// RAII timer for one phase of the current collection.
    pub fn phase(&self, phase: GcPhase) -> GcPhaseTimer<'_> {
        GcPhaseTimer {
            tracer: self,
            phase,
            begin: Instant::now(),
        }
    }

    pub fn timings(&self) -> PhaseTimings {
        self.timings.lock().clone()
    }
}

pub struct GcPhaseTimer<'a> {
    tracer: &'a GcTracer,
    phase: GcPhase,
    begin: Instant,
}

impl Drop for GcPhaseTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.begin.elapsed();
        self.tracer.timings.lock().record(self.phase, elapsed);
        log::debug!(
            "{}: {:.3}ms",
            self.phase.name(),
            elapsed.as_secs_f64() * 1e3
        );
    }
}
