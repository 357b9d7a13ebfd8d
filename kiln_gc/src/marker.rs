//! Concurrent marker.
//!
//! Marking is shared by partial and full collections:
//! 1. Roots are marked while the mutator is stopped.
//! 2. Worker tasks on the shared pool drain the work queue. For a concurrent
//!    mark the mutator resumes meanwhile and the write barrier feeds new gray
//!    objects into the queue.
//! 3. Remark: the mutator stops, roots are rescanned and the remaining work is
//!    drained on the mutator thread while the workers finish.
//!
//! Workers only touch region metadata (atomic bitmaps, remembered sets, live
//! byte counters), object slots (atomic loads) and the work queue.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{
    object_header::{load_header, load_slot, slot_address},
    region::Region,
    tagged_value::{Address, TaggedValue},
    task_pool,
    visitor::RootVisitor,
    work_queue::{LocalQueue, WorkQueue},
};

struct MarkingShared {
    queue: WorkQueue,
    running_tasks: Mutex<usize>,
    tasks_finished: Condvar,
    aborted: AtomicBool,
}

impl MarkingShared {
    fn task_finished(&self) {
        let mut running = self.running_tasks.lock();
        *running -= 1;
        if *running == 0 {
            self.tasks_finished.notify_all();
        }
    }
}

pub struct ConcurrentMarker {
    shared: Arc<MarkingShared>,
    marking: bool,
    concurrent: bool,
}

impl ConcurrentMarker {
    pub fn new() -> ConcurrentMarker {
        ConcurrentMarker {
            shared: Arc::new(MarkingShared {
                queue: WorkQueue::new(),
                running_tasks: Mutex::new(0),
                tasks_finished: Condvar::new(),
                aborted: AtomicBool::new(false),
            }),
            marking: false,
            concurrent: false,
        }
    }

    /// Whether a mark is in progress. The write barrier marks while true.
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marking
    }

    /// Whether the mark in progress runs alongside the mutator
    #[inline]
    pub fn is_concurrent(&self) -> bool {
        self.marking && self.concurrent
    }

    pub(crate) fn begin(&mut self, concurrent: bool) {
        debug_assert!(!self.marking);
        self.shared.aborted.store(false, Ordering::Release);
        self.marking = true;
        self.concurrent = concurrent;
    }

    pub(crate) fn finish(&mut self) {
        debug_assert!(self.shared.queue.is_empty());
        self.marking = false;
        self.concurrent = false;
    }

    /// Stop a mark in progress and discard its work.
    pub(crate) fn abort(&mut self) {
        self.shared.aborted.store(true, Ordering::Release);
        self.wait_for_tasks();
        self.shared.queue.clear();
        self.marking = false;
        self.concurrent = false;
    }

    /// Visitor that marks root targets and queues them for scanning.
    pub(crate) fn root_marker(&self) -> RootMarker<'_> {
        RootMarker {
            queue: &self.shared.queue,
        }
    }

    /// Mark `target` on behalf of the write barrier.
    #[inline]
    pub(crate) fn mark_from_barrier(&self, target: Address) {
        let region = unsafe { Region::from_address(target) };
        mark_and_push(region, target, |addr| self.shared.queue.push(addr));
    }

    /// Post up to `count` marking tasks to the shared pool.
    pub(crate) fn post_tasks(&self, count: usize) {
        for _ in 0..count {
            *self.shared.running_tasks.lock() += 1;
            let shared = self.shared.clone();
            task_pool::post_task(move || {
                run_mark_task(&shared);
                shared.task_finished();
            });
        }
    }

    /// Drain the work queue on the calling thread.
    pub(crate) fn drain_on_current_thread(&self) {
        let mut local = self.shared.queue.local();
        while let Some(addr) = local.pop() {
            scan_object(addr, &mut local);
        }
    }

    pub(crate) fn wait_for_tasks(&self) {
        let mut running = self.shared.running_tasks.lock();
        while *running > 0 {
            self.shared.tasks_finished.wait(&mut running);
        }
    }

    /// Drain on the calling thread until the queue is empty and every worker
    /// task has exited.
    pub(crate) fn complete(&self) {
        loop {
            self.drain_on_current_thread();
            self.wait_for_tasks();
            if self.shared.queue.is_empty() {
                break;
            }
        }
    }

    /// Whether concurrent marking has run out of work and only needs remark.
    pub fn is_work_done(&self) -> bool {
        *self.shared.running_tasks.lock() == 0 && self.shared.queue.is_empty()
    }
}

impl Drop for ConcurrentMarker {
    fn drop(&mut self) {
        if self.marking {
            self.abort();
        }
    }
}

// ============================================================================
// Marking
// ============================================================================

#[inline]
fn mark_and_push(region: &Region, target: Address, mut push: impl FnMut(Address)) {
    if region.atomic_mark(target) {
        let size = unsafe { load_header(target) }.size();
        region.add_live_bytes(size);
        push(target);
    }
}

fn run_mark_task(shared: &MarkingShared) {
    let mut local = shared.queue.local();
    while let Some(addr) = local.pop() {
        scan_object(addr, &mut local);
        if shared.aborted.load(Ordering::Acquire) {
            break;
        }
    }
}

/// Mark everything the object's slots point to. A slot pointing into the
/// collection set from outside it is recorded in the holder's cross-region
/// set so evacuation can update it.
fn scan_object(addr: Address, local: &mut LocalQueue) {
    let holder_region = unsafe { Region::from_address(addr) };
    let holder_in_collect_set = holder_region.in_collect_set();
    let header = unsafe { load_header(addr) };

    for index in 0..header.slot_count() {
        let slot = slot_address(addr, index);
        let Some(target) = unsafe { load_slot(slot) }.heap_address() else {
            continue;
        };

        let target_region = unsafe { Region::from_address(target) };
        if target_region.in_collect_set() && !holder_in_collect_set {
            holder_region.atomic_insert_cross_region(slot);
        }

        mark_and_push(target_region, target, |target| local.push(target));
    }
}

/// Marks the targets of root slots
pub(crate) struct RootMarker<'a> {
    queue: &'a WorkQueue,
}

impl RootVisitor for RootMarker<'_> {
    fn visit_root(&mut self, slot: &mut TaggedValue) {
        if let Some(target) = slot.heap_address() {
            let region = unsafe { Region::from_address(target) };
            mark_and_push(region, target, |addr| self.queue.push(addr));
        }
    }
}
