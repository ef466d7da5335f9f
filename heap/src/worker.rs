//! The worker gang executing parallel GC tasks.
//!
//! A fixed set of long-lived worker threads sleeps on a condvar between
//! tasks. The driver publishes one task per *epoch* with
//! [`WorkGang::run_task`]; every worker runs `work(worker_id)` exactly once
//! for that epoch and the last finisher wakes the driver. The epoch counter
//! is the wakeup sense: a worker only picks up a task whose epoch it has
//! not seen yet, and the driver does not return (or publish the next epoch)
//! before the whole gang has checked back in, so epochs never overlap.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

/// A unit of gang work. Implementations distribute work internally (claim
/// cursors, pre-partitioned slices); the gang only fans out worker ids.
pub trait GangTask: Sync {
    fn name(&self) -> &'static str;
    fn work(&self, worker_id: usize);
}

/// Dispatch state shared between the driver and the workers.
struct Dispatch {
    /// Bumped once per task; doubles as the sleep/wake sense.
    epoch: u64,
    task: Option<&'static dyn GangTask>,
    /// Workers that have completed the current epoch's work.
    finished: usize,
    shutdown: bool,
}

struct GangShared {
    dispatch: Mutex<Dispatch>,
    /// Workers sleep here between epochs.
    start: Condvar,
    /// The driver sleeps here until the last worker checks in.
    done: Condvar,
    workers: usize,
}

/// Fixed-size pool of GC worker threads.
pub struct WorkGang {
    shared: Arc<GangShared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkGang {
    pub fn new(workers: usize) -> Self {
        assert!(workers >= 1, "gang needs at least one worker");
        let shared = Arc::new(GangShared {
            dispatch: Mutex::new(Dispatch {
                epoch: 0,
                task: None,
                finished: 0,
                shutdown: false,
            }),
            start: Condvar::new(),
            done: Condvar::new(),
            workers,
        });

        let handles = (0..workers)
            .map(|id| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("gc-worker-{id}"))
                    .spawn(move || worker_loop(id, shared))
                    .expect("spawn gc worker")
            })
            .collect();

        Self { shared, handles }
    }

    /// Number of workers that will execute each task. The full-GC policy
    /// always runs the whole gang.
    #[inline]
    pub fn active_workers(&self) -> usize {
        self.shared.workers
    }

    /// Run `task` on every worker and wait for all of them to finish.
    pub fn run_task(&self, task: &dyn GangTask) {
        log::debug!("gang task: {}", task.name());

        // SAFETY: workers dereference the task only between the dispatch
        // below and the join at the bottom of this function; run_task does
        // not return before the last worker has finished, so the pointer
        // never outlives the borrow.
        let task: &'static dyn GangTask = unsafe { std::mem::transmute(task) };

        let mut dispatch = self.shared.dispatch.lock();
        dispatch.epoch += 1;
        dispatch.task = Some(task);
        dispatch.finished = 0;
        self.shared.start.notify_all();

        // Join: the last worker of this epoch wakes us.
        while dispatch.finished < self.shared.workers {
            self.shared.done.wait(&mut dispatch);
        }
        dispatch.task = None;
    }
}

impl Drop for WorkGang {
    fn drop(&mut self) {
        {
            let mut dispatch = self.shared.dispatch.lock();
            dispatch.shutdown = true;
            self.shared.start.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, shared: Arc<GangShared>) {
    let mut seen = 0u64;
    loop {
        let task = {
            let mut dispatch = shared.dispatch.lock();
            while dispatch.epoch == seen && !dispatch.shutdown {
                shared.start.wait(&mut dispatch);
            }
            if dispatch.shutdown {
                return;
            }
            seen = dispatch.epoch;
            dispatch.task.expect("dispatched epoch without a task")
        };

        task.work(id);

        let mut dispatch = shared.dispatch.lock();
        dispatch.finished += 1;
        if dispatch.finished == shared.workers {
            // Only the driver ever waits on `done`.
            shared.done.notify_one();
        }
    }
}
