//! Process-wide worker pool shared by every heap.
//!
//! Marking and sweeping tasks are posted here. Each heap bounds how many tasks
//! it posts with its own budget, so one pool serves any number of heaps.

use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use threadpool::ThreadPool;

/// Thread count requested before the pool is first used. Zero means one thread
/// per available core, minus the mutator.
static REQUESTED_THREADS: AtomicUsize = AtomicUsize::new(0);

static TASK_POOL: Lazy<Mutex<ThreadPool>> = Lazy::new(|| {
    let threads = match REQUESTED_THREADS.load(Ordering::Relaxed) {
        0 => default_thread_count(),
        n => n,
    };

    tracing::debug!(threads, "starting gc task pool");
    Mutex::new(
        threadpool::Builder::new()
            .num_threads(threads)
            .thread_name("kiln-gc-worker".to_owned())
            .build(),
    )
});

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .clamp(1, 7)
}

/// Request a thread count for the shared pool. Only effective before the first
/// task is posted.
pub fn initialize(thread_num: usize) {
    REQUESTED_THREADS.store(thread_num, Ordering::Relaxed);
}

/// Number of worker threads in the pool
pub fn total_thread_num() -> usize {
    TASK_POOL.lock().max_count()
}

/// Run `task` on a worker thread.
pub fn post_task(task: impl FnOnce() + Send + 'static) {
    TASK_POOL.lock().execute(task);
}
