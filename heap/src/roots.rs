//! Root iteration.
//!
//! Consumers register root sources (thread stacks, globals, handle tables)
//! with the heap. At a safepoint a [`RootProcessor`] fans the registered
//! sources out over the worker gang: sources are claimed off an atomic
//! cursor, so each source is visited by exactly one worker per pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use object::Value;

/// A producer of root slots. The visitor receives `&mut Value` so the GC
/// can rewrite roots in place (forwarding resolution, pointer adjustment).
pub trait RootSource: Send {
    fn name(&self) -> &'static str {
        "roots"
    }

    fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

/// The heap-owned set of registered root sources.
#[derive(Default)]
pub struct RootRegistry {
    sources: Mutex<Vec<Arc<Mutex<dyn RootSource>>>>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(Vec::new()),
        }
    }

    /// Register a root source. The caller keeps its own handle to mutate
    /// the source between collections.
    pub fn register(&self, source: Arc<Mutex<dyn RootSource>>) {
        self.sources.lock().push(source);
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<dyn RootSource>>> {
        self.sources.lock().clone()
    }
}

/// One root pass over all registered sources, claim-distributed across
/// workers. Construct once per pass; the cursor starts at the first source.
pub struct RootProcessor {
    sources: Vec<Arc<Mutex<dyn RootSource>>>,
    cursor: AtomicUsize,
}

impl RootProcessor {
    pub fn new(registry: &RootRegistry) -> Self {
        Self {
            sources: registry.snapshot(),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Visit this worker's share of the root sources. Every source is
    /// processed by exactly one worker per processor instance.
    pub fn process_all_roots(&self, _worker_id: usize, visitor: &mut dyn FnMut(&mut Value)) {
        loop {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(source) = self.sources.get(index) else {
                return;
            };
            source.lock().visit(visitor);
        }
    }
}
