//! Concurrent sweeper.
//!
//! After a mark, every region of a sparse space that was not evacuated is swept:
//! the gaps between marked objects become filler-covered free ranges, stale
//! old-to-new entries inside those gaps are dropped and the mark bitmap is
//! cleared. Sweeping runs region by region on the shared pool; the mutator
//! claims unswept regions itself whenever it has to wait.
//!
//! Results are only applied to a space by the mutator (`Heap` merges them), so
//! free lists and region lists are never touched off the mutator thread.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::{
    object_header::{load_header, write_filler},
    region::{Region, RegionFlags},
    space::SpaceType,
    tagged_value::Address,
    task_pool,
};

/// Region shared with sweeper tasks.
///
/// Regions queued for sweeping are only released by the mutator after their
/// sweep result was merged, so the pointer outlives every task using it.
#[derive(Clone, Copy)]
pub(crate) struct RegionPtr(*const Region);

unsafe impl Send for RegionPtr {}
unsafe impl Sync for RegionPtr {}

impl RegionPtr {
    pub(crate) fn new(region: &Region) -> RegionPtr {
        RegionPtr(region as *const Region)
    }

    /// # Safety
    /// The region must not have been released.
    pub(crate) unsafe fn get<'a>(self) -> &'a Region {
        &*self.0
    }
}

pub(crate) struct SweepResult {
    pub space: SpaceType,
    pub region: RegionPtr,
    pub free_ranges: Vec<(Address, usize)>,
    pub live_bytes: usize,
}

struct SweepShared {
    pending: Mutex<Vec<(SpaceType, RegionPtr)>>,
    results: Mutex<Vec<SweepResult>>,
    running_tasks: Mutex<usize>,
    tasks_finished: Condvar,
}

impl SweepShared {
    /// Sweep claimed regions until none are left.
    fn sweep_pending(&self) {
        loop {
            let next = self.pending.lock().pop();
            let Some((space, region)) = next else {
                break;
            };

            let result = sweep_region(space, region);
            self.results.lock().push(result);
        }
    }

    fn task_finished(&self) {
        let mut running = self.running_tasks.lock();
        *running -= 1;
        if *running == 0 {
            self.tasks_finished.notify_all();
        }
    }
}

pub struct ConcurrentSweeper {
    shared: Arc<SweepShared>,
    sweeping: bool,
}

impl ConcurrentSweeper {
    pub fn new() -> ConcurrentSweeper {
        ConcurrentSweeper {
            shared: Arc::new(SweepShared {
                pending: Mutex::new(Vec::new()),
                results: Mutex::new(Vec::new()),
                running_tasks: Mutex::new(0),
                tasks_finished: Condvar::new(),
            }),
            sweeping: false,
        }
    }

    /// Whether swept regions have not all been merged back yet
    #[inline]
    pub fn is_sweeping(&self) -> bool {
        self.sweeping
    }

    /// Start sweeping `regions`. With `task_count == 0` the sweep runs on the
    /// calling thread before returning.
    pub(crate) fn start(&mut self, regions: Vec<(SpaceType, RegionPtr)>, task_count: usize) {
        if regions.is_empty() {
            return;
        }

        for (_, region) in &regions {
            unsafe { region.get() }.set_flag(RegionFlags::IN_SWEEPING);
        }

        let task_count = task_count.min(regions.len());
        self.shared.pending.lock().extend(regions);
        self.sweeping = true;

        if task_count == 0 {
            self.shared.sweep_pending();
            return;
        }

        for _ in 0..task_count {
            *self.shared.running_tasks.lock() += 1;
            let shared = self.shared.clone();
            task_pool::post_task(move || {
                shared.sweep_pending();
                shared.task_finished();
            });
        }
    }

    /// Results finished so far.
    ///
    /// Tasks publish a result before they count themselves finished, so the
    /// finished state is read first. Results published after that read stay
    /// queued and the sweeper keeps reporting that it is sweeping.
    pub(crate) fn take_results(&mut self) -> Vec<SweepResult> {
        let finished = self.all_tasks_finished();
        let results = std::mem::take(&mut *self.shared.results.lock());
        self.sweeping = !finished;
        results
    }

    /// Finish every outstanding sweep, helping on the calling thread.
    pub(crate) fn ensure_all_finished(&mut self) -> Vec<SweepResult> {
        if !self.sweeping {
            return Vec::new();
        }

        self.shared.sweep_pending();

        let mut running = self.shared.running_tasks.lock();
        while *running > 0 {
            self.shared.tasks_finished.wait(&mut running);
        }
        drop(running);

        let results = std::mem::take(&mut *self.shared.results.lock());
        self.sweeping = false;
        results
    }

    fn all_tasks_finished(&self) -> bool {
        *self.shared.running_tasks.lock() == 0 && self.shared.pending.lock().is_empty()
    }

    /// Free detached regions on a worker thread.
    pub(crate) fn defer_free(regions: Vec<Box<Region>>) {
        if regions.is_empty() {
            return;
        }

        task_pool::post_task(move || {
            let count = regions.len();
            drop(regions);
            tracing::trace!(count, "freed deferred regions");
        });
    }
}

impl Drop for ConcurrentSweeper {
    fn drop(&mut self) {
        self.ensure_all_finished();
    }
}

/// Sweep one region. Runs on any thread.
fn sweep_region(space: SpaceType, region: RegionPtr) -> SweepResult {
    let region_ref = unsafe { region.get() };
    let mut free_ranges = Vec::new();
    let mut live_bytes = 0;
    let mut cursor = region_ref.begin();

    region_ref.iterate_marked(|addr| {
        if addr > cursor {
            free_ranges.push((cursor, addr - cursor));
        }

        let size = unsafe { load_header(addr) }.size();
        live_bytes += size;
        cursor = addr + size;
    });

    if region_ref.end() > cursor {
        free_ranges.push((cursor, region_ref.end() - cursor));
    }

    for &(addr, size) in &free_ranges {
        unsafe { write_filler(addr, size) };
        region_ref.clear_old_to_new_range(addr, addr + size);
    }

    region_ref.clear_mark_bitmap();

    SweepResult {
        space,
        region,
        free_ranges,
        live_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_header::{initialize, object_size, ObjectKind};

    #[test]
    fn sweep_builds_free_ranges_between_marked_objects() {
        let region = Region::new_regular(SpaceType::Old, RegionFlags::empty()).unwrap();
        let size = object_size(2, 0);
        let objects: Vec<Address> = (0..4)
            .map(|_| {
                let addr = region.bump_allocate(size).unwrap();
                unsafe { initialize(addr, ObjectKind::Plain, size, 2) };
                addr
            })
            .collect();
        region.set_top(region.end());

        region.atomic_mark(objects[1]);
        region.atomic_mark(objects[3]);
        region.insert_old_to_new(objects[0] + 8);
        region.insert_old_to_new(objects[1] + 8);

        let mut sweeper = ConcurrentSweeper::new();
        sweeper.start(vec![(SpaceType::Old, RegionPtr::new(&region))], 0);
        let results = sweeper.ensure_all_finished();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.live_bytes, 2 * size);
        assert_eq!(
            result.free_ranges,
            vec![
                (objects[0], size),
                (objects[2], size),
                (objects[3] + size, region.end() - objects[3] - size),
            ]
        );

        assert!(!region.has_marked_objects());
        assert!(!region.old_to_new_contains(objects[0] + 8));
        assert!(region.old_to_new_contains(objects[1] + 8));
        assert!(unsafe { load_header(objects[2]) }.is_free());
    }

    #[test]
    fn concurrent_sweep_finishes_every_region() {
        let regions: Vec<_> = (0..8)
            .map(|_| Region::new_regular(SpaceType::NonMovable, RegionFlags::empty()).unwrap())
            .collect();
        for region in &regions {
            region.set_top(region.end());
        }

        let mut sweeper = ConcurrentSweeper::new();
        sweeper.start(
            regions.iter().map(|r| (SpaceType::NonMovable, RegionPtr::new(r))).collect(),
            4,
        );
        let results = sweeper.ensure_all_finished();

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|r| r.live_bytes == 0));
        assert!(!sweeper.is_sweeping());
    }

    #[test]
    fn polling_never_strands_a_late_result() {
        let region = Region::new_regular(SpaceType::Old, RegionFlags::empty()).unwrap();
        region.set_top(region.end());

        let mut sweeper = ConcurrentSweeper::new();
        for _ in 0..2000 {
            sweeper.start(vec![(SpaceType::Old, RegionPtr::new(&region))], 1);

            let mut collected = 0;
            while sweeper.is_sweeping() {
                collected += sweeper.take_results().len();
            }

            assert_eq!(collected, 1);
            assert!(sweeper.shared.results.lock().is_empty());
            region.clear_flag(RegionFlags::IN_SWEEPING);
        }
    }
}
