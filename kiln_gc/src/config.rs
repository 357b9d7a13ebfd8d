//! Heap configuration.
//!
//! `HeapConfig` is fixed when the heap is created. The runtime-adjustable part
//! of the policy (growth type, worker budgets, concurrency toggles) lives in the
//! heap itself and is changed through `Heap::change_gc_params` and
//! `Heap::notify_memory_pressure`.

use crate::region::DEFAULT_REGION_SIZE;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

pub const DEFAULT_MIN_SEMI_SPACE_SIZE: usize = 2 * MB;
pub const DEFAULT_MAX_SEMI_SPACE_SIZE: usize = 16 * MB;
pub const DEFAULT_OLD_SPACE_CAPACITY: usize = 256 * MB;
pub const DEFAULT_MIN_OLD_SPACE_LIMIT: usize = 16 * MB;
pub const DEFAULT_NON_MOVABLE_SPACE_CAPACITY: usize = 32 * MB;
pub const DEFAULT_MACHINE_CODE_SPACE_CAPACITY: usize = 16 * MB;
pub const DEFAULT_HUGE_OBJECT_SPACE_CAPACITY: usize = 256 * MB;
pub const DEFAULT_MAX_HEAP_SIZE: usize = 512 * MB;

/// How aggressively old space limits grow after a full mark
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemGrowingType {
    /// Foreground: grow freely, favor throughput
    HighThroughput,
    /// Background: grow slowly, favor footprint
    Conservative,
    /// Memory pressure: grow as little as possible
    Pressure,
}

impl MemGrowingType {
    /// Factor applied to the live old space size to get the next limit
    pub fn growing_factor(self) -> f64 {
        match self {
            MemGrowingType::HighThroughput => 2.0,
            MemGrowingType::Conservative => 1.5,
            MemGrowingType::Pressure => 1.1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Starting young space capacity
    pub min_semi_space_size: usize,
    /// Young space capacity never grows past this
    pub max_semi_space_size: usize,
    /// Hard cap on committed old space
    pub old_space_capacity: usize,
    /// Smallest old space limit. Crossing the limit schedules an old collection.
    pub min_old_space_limit: usize,
    pub non_movable_space_capacity: usize,
    pub machine_code_space_capacity: usize,
    pub huge_object_space_capacity: usize,
    /// Administrative cap on all committed memory
    pub max_heap_size: usize,
    /// Number of collector worker threads. Zero means one per core.
    pub gc_thread_num: usize,
    pub enable_concurrent_mark: bool,
    pub enable_concurrent_sweep: bool,
    /// Fraction of the old space limit at which concurrent marking starts
    pub concurrent_mark_trigger_ratio: f64,
    /// Old regions with a live ratio below this are evacuated by a partial GC
    pub collect_set_live_ratio: f64,
    /// Background mode: mark task budget
    pub background_mark_task_count: usize,
    /// Background mode: disable concurrent marking and sweeping
    pub background_disables_concurrency: bool,
}

impl HeapConfig {
    /// Largest committed size of all spaces together, excluding young space
    pub fn max_old_generation_size(&self) -> usize {
        self.old_space_capacity
            + self.non_movable_space_capacity
            + self.machine_code_space_capacity
            + self.huge_object_space_capacity
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfigBuilder::new().build()
    }
}

pub struct HeapConfigBuilder(HeapConfig);

impl HeapConfigBuilder {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self(HeapConfig {
            min_semi_space_size: DEFAULT_MIN_SEMI_SPACE_SIZE,
            max_semi_space_size: DEFAULT_MAX_SEMI_SPACE_SIZE,
            old_space_capacity: DEFAULT_OLD_SPACE_CAPACITY,
            min_old_space_limit: DEFAULT_MIN_OLD_SPACE_LIMIT,
            non_movable_space_capacity: DEFAULT_NON_MOVABLE_SPACE_CAPACITY,
            machine_code_space_capacity: DEFAULT_MACHINE_CODE_SPACE_CAPACITY,
            huge_object_space_capacity: DEFAULT_HUGE_OBJECT_SPACE_CAPACITY,
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            gc_thread_num: 0,
            enable_concurrent_mark: true,
            enable_concurrent_sweep: true,
            concurrent_mark_trigger_ratio: 0.75,
            collect_set_live_ratio: 0.3,
            background_mark_task_count: 1,
            background_disables_concurrency: true,
        })
    }

    /// Derive every space size from one total heap size.
    pub fn from_heap_size(heap_size: usize) -> Self {
        let heap_size = heap_size.max(8 * DEFAULT_REGION_SIZE);
        Self::new()
            .max_heap_size(heap_size)
            .max_semi_space_size((heap_size / 16).max(DEFAULT_REGION_SIZE))
            .min_semi_space_size((heap_size / 64).max(DEFAULT_REGION_SIZE))
            .old_space_capacity(heap_size / 2)
            .min_old_space_limit((heap_size / 16).max(DEFAULT_REGION_SIZE))
            .non_movable_space_capacity((heap_size / 16).max(2 * DEFAULT_REGION_SIZE))
            .machine_code_space_capacity((heap_size / 32).max(DEFAULT_REGION_SIZE))
            .huge_object_space_capacity(heap_size / 4)
    }

    /// Return the config that has been built, consuming the builder.
    pub fn build(self) -> HeapConfig {
        let mut config = self.0;
        config.max_semi_space_size = config.max_semi_space_size.max(config.min_semi_space_size);
        config.min_old_space_limit = config.min_old_space_limit.min(config.old_space_capacity);
        config
    }

    pub fn min_semi_space_size(mut self, size: usize) -> Self {
        self.0.min_semi_space_size = size;
        self
    }

    pub fn max_semi_space_size(mut self, size: usize) -> Self {
        self.0.max_semi_space_size = size;
        self
    }

    pub fn old_space_capacity(mut self, size: usize) -> Self {
        self.0.old_space_capacity = size;
        self
    }

    pub fn min_old_space_limit(mut self, size: usize) -> Self {
        self.0.min_old_space_limit = size;
        self
    }

    pub fn non_movable_space_capacity(mut self, size: usize) -> Self {
        self.0.non_movable_space_capacity = size;
        self
    }

    pub fn machine_code_space_capacity(mut self, size: usize) -> Self {
        self.0.machine_code_space_capacity = size;
        self
    }

    pub fn huge_object_space_capacity(mut self, size: usize) -> Self {
        self.0.huge_object_space_capacity = size;
        self
    }

    pub fn max_heap_size(mut self, size: usize) -> Self {
        self.0.max_heap_size = size;
        self
    }

    pub fn gc_thread_num(mut self, gc_thread_num: usize) -> Self {
        self.0.gc_thread_num = gc_thread_num;
        self
    }

    pub fn enable_concurrent_mark(mut self, enable: bool) -> Self {
        self.0.enable_concurrent_mark = enable;
        self
    }

    pub fn enable_concurrent_sweep(mut self, enable: bool) -> Self {
        self.0.enable_concurrent_sweep = enable;
        self
    }

    pub fn concurrent_mark_trigger_ratio(mut self, ratio: f64) -> Self {
        self.0.concurrent_mark_trigger_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn collect_set_live_ratio(mut self, ratio: f64) -> Self {
        self.0.collect_set_live_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn background_mark_task_count(mut self, count: usize) -> Self {
        self.0.background_mark_task_count = count.max(1);
        self
    }

    pub fn background_disables_concurrency(mut self, disables: bool) -> Self {
        self.0.background_disables_concurrency = disables;
        self
    }
}
