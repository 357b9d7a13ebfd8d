//! Heap - generational, region-based managed memory
//!
//! Design:
//! - Young objects are bump allocated in a semi-space and collected by a
//!   stop-the-world copying collection (`GcType::Young`).
//! - Older objects live in free-list spaces. A partial collection marks the
//!   whole heap (concurrently when enabled), evacuates young space plus
//!   fragmented old regions and sweeps the rest. A full collection compacts all
//!   of old space.
//! - Allocation drives collection: when a space is exhausted the smallest
//!   sufficient collection runs (Young, then Partial, then Full) before the
//!   request fails with `AllocError`.
//!
//! The runtime provides roots through `GcContext::visit_roots`; heap objects
//! describe their own tagged slots in their header.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::{
    config::{HeapConfig, MemGrowingType},
    error::{AllocError, AllocResult},
    evacuator::{
        forwarded_address, update_cross_region_slots, update_moved_objects, Evacuator,
        ReferenceUpdater, YoungCollector,
    },
    fatal,
    global_handles::GlobalHandleTable,
    marker::ConcurrentMarker,
    object_header::{
        align_up, initialize, load_header, object_size, payload, payload_mut, ObjectHeader,
        ObjectKind, HEADER_SIZE, MAX_SLOT_COUNT, OBJECT_ALIGNMENT, SLOT_SIZE,
    },
    region::{Region, RegionFlags, DEFAULT_REGION_MASK, DEFAULT_REGION_SIZE, MAX_REGULAR_HEAP_OBJECT_SIZE},
    space::{HugeObjectSpace, SemiSpace, SpaceType, SparseSpace},
    stats::GcStats,
    sweeper::{ConcurrentSweeper, RegionPtr, SweepResult},
    tagged_value::{Address, TaggedValue},
    task_pool,
    visitor::{GcContext, RootProviderId, RootVisitor},
};

/// Young space survival rate above which the semi-space grows
const GROW_SURVIVAL_RATE: f64 = 0.8;

/// Young space survival rate below which the semi-space shrinks
const SHRINK_SURVIVAL_RATE: f64 = 0.1;

/// Largest raw payload an object may carry
const MAX_RAW_BYTES: usize = isize::MAX as usize / 2;

/// Shortest idle period worth spending on a young collection
const IDLE_YOUNG_GC_MICROS: u64 = 1000;

/// Shortest idle period worth spending on an old generation collection
const IDLE_OLD_GC_MICROS: u64 = 10_000;

/// Long idle periods in a row with a stable heap size before the mutator is
/// considered at rest
const IDLE_REST_SAMPLES: usize = 3;

/// Heap growth after a rest collection before another one may run
const IDLE_REST_HEAP_GROWTH: usize = 2 * 1024 * 1024;

/// What long idle periods have seen so far.
struct IdleState {
    /// Heap object size at recent long idle periods, oldest first
    samples: Vec<usize>,
    /// A heap at rest larger than this gets a full collection
    rest_full_gc_size: usize,
    /// Old and non-movable committed size above which idle time runs a
    /// partial collection
    old_committed_limit: usize,
}

impl IdleState {
    fn new(old_committed_limit: usize) -> IdleState {
        IdleState {
            samples: Vec::with_capacity(IDLE_REST_SAMPLES),
            rest_full_gc_size: IDLE_REST_HEAP_GROWTH,
            old_committed_limit,
        }
    }

    /// Record a long idle period and pick the old generation collection it
    /// should run, if any.
    fn select_gc(&mut self, heap_object_size: usize, old_committed_size: usize) -> Option<GcType> {
        if self.samples.len() == IDLE_REST_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(heap_object_size);

        if self.is_at_rest() && heap_object_size > self.rest_full_gc_size {
            return Some(GcType::Full);
        }

        if old_committed_size > self.old_committed_limit {
            return Some(GcType::Partial);
        }

        None
    }

    /// The heap barely changed over the last few long idle periods.
    fn is_at_rest(&self) -> bool {
        if self.samples.len() < IDLE_REST_SAMPLES {
            return false;
        }

        let min = self.samples.iter().copied().min().unwrap_or(0);
        let max = self.samples.iter().copied().max().unwrap_or(0);
        max - min <= max / 64
    }

    fn collected(
        &mut self,
        gc_type: GcType,
        heap_object_size: usize,
        old_committed_size: usize,
        min_old_committed_limit: usize,
    ) {
        self.samples.clear();
        match gc_type {
            GcType::Full => self.rest_full_gc_size = heap_object_size + IDLE_REST_HEAP_GROWTH,
            _ => self.old_committed_limit = old_committed_size.max(min_old_committed_limit),
        }
    }
}

/// Collection types, from cheapest to most thorough
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GcType {
    /// Copy young survivors, promote aged objects
    Young,
    /// Mark everything, evacuate young space and fragmented old regions
    Partial,
    /// Mark everything, evacuate young space and all of old space
    Full,
}

/// Collector phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GcPhase {
    /// No collection work in progress
    #[default]
    Idle,
    /// Marking roots with the mutator stopped
    RootScanning,
    /// Marking on worker threads, possibly alongside the mutator
    Marking,
    /// Finishing a concurrent mark with the mutator stopped
    Remark,
    /// Clearing dead weak global handles
    WeakRefProcessing,
    /// Moving objects and updating references
    Evacuating,
    /// Regions are being swept
    Sweeping,
}

type RootProvider = (RootProviderId, Box<dyn GcContext + Send>);

pub struct Heap {
    config: HeapConfig,

    semi_space: SemiSpace,
    old_space: SparseSpace,
    non_movable_space: SparseSpace,
    machine_code_space: SparseSpace,
    huge_object_space: HugeObjectSpace,

    global_handles: GlobalHandleTable,
    pub(crate) marker: ConcurrentMarker,
    sweeper: ConcurrentSweeper,

    /// Native subsystems that hold managed values, visited after the context
    root_providers: Vec<RootProvider>,
    next_root_provider_id: u64,

    /// Phase of the collection currently running on the mutator
    phase: GcPhase,
    in_gc: bool,

    growing_type: MemGrowingType,
    in_background: bool,
    max_mark_task_count: usize,
    concurrent_mark_enabled: bool,
    concurrent_sweep_enabled: bool,

    /// Old generation size that triggers a partial collection
    old_space_limit: usize,

    idle: IdleState,

    stats: GcStats,

    #[cfg(feature = "gc_stress_test")]
    pub gc_stress_test: bool,
}

impl Heap {
    /// Create a new heap
    pub fn new(config: HeapConfig) -> Heap {
        task_pool::initialize(config.gc_thread_num);

        Heap {
            semi_space: SemiSpace::new(config.min_semi_space_size, config.max_semi_space_size),
            old_space: SparseSpace::new(SpaceType::Old, config.old_space_capacity),
            non_movable_space: SparseSpace::new(
                SpaceType::NonMovable,
                config.non_movable_space_capacity,
            ),
            machine_code_space: SparseSpace::new(
                SpaceType::MachineCode,
                config.machine_code_space_capacity,
            ),
            huge_object_space: HugeObjectSpace::new(config.huge_object_space_capacity),
            global_handles: GlobalHandleTable::new(),
            marker: ConcurrentMarker::new(),
            sweeper: ConcurrentSweeper::new(),
            root_providers: Vec::new(),
            next_root_provider_id: 0,
            phase: GcPhase::Idle,
            in_gc: false,
            growing_type: MemGrowingType::HighThroughput,
            in_background: false,
            max_mark_task_count: task_pool::total_thread_num(),
            concurrent_mark_enabled: config.enable_concurrent_mark,
            concurrent_sweep_enabled: config.enable_concurrent_sweep,
            old_space_limit: config.min_old_space_limit,
            idle: IdleState::new(config.min_old_space_limit),
            stats: GcStats::default(),
            config,

            #[cfg(feature = "gc_stress_test")]
            gc_stress_test: false,
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Get the current collector phase
    pub fn phase(&self) -> GcPhase {
        if self.in_gc {
            self.phase
        } else if self.marker.is_concurrent() {
            GcPhase::Marking
        } else if self.sweeper.is_sweeping() {
            GcPhase::Sweeping
        } else {
            GcPhase::Idle
        }
    }

    /// Whether marking is in progress. The write barrier marks while true.
    #[inline]
    pub fn is_marking(&self) -> bool {
        self.marker.is_marking()
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    #[inline]
    pub fn global_handles(&self) -> &GlobalHandleTable {
        &self.global_handles
    }

    #[inline]
    pub fn semi_space(&self) -> &SemiSpace {
        &self.semi_space
    }

    #[inline]
    pub fn old_space(&self) -> &SparseSpace {
        &self.old_space
    }

    #[inline]
    pub fn non_movable_space(&self) -> &SparseSpace {
        &self.non_movable_space
    }

    #[inline]
    pub fn machine_code_space(&self) -> &SparseSpace {
        &self.machine_code_space
    }

    #[inline]
    pub fn huge_object_space(&self) -> &HugeObjectSpace {
        &self.huge_object_space
    }

    #[inline]
    pub fn growing_type(&self) -> MemGrowingType {
        self.growing_type
    }

    #[inline]
    pub fn is_in_background(&self) -> bool {
        self.in_background
    }

    /// Upper bound on marking and sweeping tasks posted per cycle
    #[inline]
    pub fn max_mark_task_count(&self) -> usize {
        self.max_mark_task_count
    }

    #[inline]
    pub fn is_concurrent_mark_enabled(&self) -> bool {
        self.concurrent_mark_enabled
    }

    #[inline]
    pub fn is_concurrent_sweep_enabled(&self) -> bool {
        self.concurrent_sweep_enabled
    }

    #[inline]
    pub fn old_space_limit(&self) -> usize {
        self.old_space_limit
    }

    /// Bytes of objects in old and huge object space
    pub fn old_generation_size(&self) -> usize {
        self.old_space.heap_object_size() + self.huge_object_space.heap_object_size()
    }

    /// Bytes of allocated objects across all spaces
    pub fn heap_object_size(&self) -> usize {
        self.semi_space.heap_object_size()
            + self.old_space.heap_object_size()
            + self.non_movable_space.heap_object_size()
            + self.machine_code_space.heap_object_size()
            + self.huge_object_space.heap_object_size()
    }

    /// Bytes of system memory held by all spaces
    pub fn committed_size(&self) -> usize {
        self.semi_space.committed_size()
            + self.old_space.committed_size()
            + self.non_movable_space.committed_size()
            + self.machine_code_space.committed_size()
            + self.huge_object_space.committed_size()
    }

    pub(crate) fn all_regions(&self) -> impl Iterator<Item = &Region> {
        self.semi_space.regions().chain(self.old_generation_regions())
    }

    /// Every region outside young space
    pub(crate) fn old_generation_regions(&self) -> impl Iterator<Item = &Region> {
        self.old_space
            .regions()
            .chain(self.non_movable_space.regions())
            .chain(self.machine_code_space.regions())
            .chain(self.huge_object_space.regions())
    }

    fn sparse_space_mut(&mut self, space: SpaceType) -> &mut SparseSpace {
        match space {
            SpaceType::Old => &mut self.old_space,
            SpaceType::NonMovable => &mut self.non_movable_space,
            SpaceType::MachineCode => &mut self.machine_code_space,
            SpaceType::Young | SpaceType::HugeObject => {
                fatal!("{} space is not a free-list space", space.name())
            }
        }
    }

    // ========================================================================
    // Root providers
    // ========================================================================

    /// Register a native subsystem whose values are roots of every collection.
    pub fn add_root_provider(&mut self, provider: Box<dyn GcContext + Send>) -> RootProviderId {
        let id = RootProviderId(self.next_root_provider_id);
        self.next_root_provider_id += 1;
        self.root_providers.push((id, provider));
        id
    }

    pub fn remove_root_provider(&mut self, id: RootProviderId) -> Option<Box<dyn GcContext + Send>> {
        let position = self.root_providers.iter().position(|(provider_id, _)| *provider_id == id)?;
        Some(self.root_providers.remove(position).1)
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a raw object of at least `size` bytes (header included) with no
    /// tagged slots.
    ///
    /// Requests larger than the regular object limit go to huge object space
    /// whatever `space` says. On exhaustion this runs the smallest sufficient
    /// collection and retries, escalating up to a full collection.
    pub fn allocate(
        &mut self,
        ctx: &mut dyn GcContext,
        size: usize,
        space: SpaceType,
    ) -> AllocResult<Address> {
        let size = align_up(size.max(HEADER_SIZE), OBJECT_ALIGNMENT);
        let addr = self.allocate_raw(ctx, size, space)?;
        unsafe { initialize(addr, ObjectKind::Plain, size, 0) };
        Ok(addr)
    }

    /// Allocate an object with `slot_count` tagged slots, all undefined,
    /// followed by `raw_bytes` of payload.
    pub fn allocate_object(
        &mut self,
        ctx: &mut dyn GcContext,
        kind: ObjectKind,
        slot_count: usize,
        raw_bytes: usize,
        space: SpaceType,
    ) -> AllocResult<Address> {
        // No heap can hold an object this large, report it like any other
        // exhausted allocation
        if slot_count > MAX_SLOT_COUNT || raw_bytes > MAX_RAW_BYTES {
            let size = slot_count.saturating_mul(SLOT_SIZE).saturating_add(raw_bytes);
            warn!(slot_count, raw_bytes, "object exceeds the maximum object size");
            return Err(AllocError::oom(size, space));
        }

        let size = object_size(slot_count, raw_bytes);
        let addr = self.allocate_raw(ctx, size, space)?;
        unsafe { initialize(addr, kind, size, slot_count) };
        Ok(addr)
    }

    fn allocate_raw(
        &mut self,
        ctx: &mut dyn GcContext,
        size: usize,
        space: SpaceType,
    ) -> AllocResult<Address> {
        let space = if size > MAX_REGULAR_HEAP_OBJECT_SIZE {
            SpaceType::HugeObject
        } else {
            space
        };

        #[cfg(feature = "gc_stress_test")]
        if self.gc_stress_test && space == SpaceType::Young {
            self.collect_garbage(ctx, GcType::Young)?;
        }

        if space != SpaceType::Young {
            self.check_old_generation_limit(ctx, size)?;
        }

        if let Some(addr) = self.try_allocate(size, space) {
            return Ok(addr);
        }

        let first = if space == SpaceType::Young {
            self.select_gc_type()
        } else {
            GcType::Partial
        };

        for &gc_type in escalation(first) {
            self.collect_garbage(ctx, gc_type)?;
            if let Some(addr) = self.try_allocate(size, space) {
                return Ok(addr);
            }
        }

        let committed = self.committed_size();
        warn!(size, space = space.name(), committed, "allocation failed after full gc");

        if committed + size.max(DEFAULT_REGION_SIZE) > self.config.max_heap_size {
            Err(AllocError::HeapLimit {
                limit: self.config.max_heap_size,
                space,
            })
        } else {
            Err(AllocError::oom(size, space))
        }
    }

    /// Allocate without collecting. Objects allocated while marking are black.
    fn try_allocate(&mut self, size: usize, space: SpaceType) -> Option<Address> {
        let addr = match space {
            SpaceType::Young => self.semi_space.allocate(size)?,
            SpaceType::HugeObject => {
                if self.committed_size() + size > self.config.max_heap_size {
                    return None;
                }
                self.huge_object_space.allocate(size)?
            }
            SpaceType::Old | SpaceType::NonMovable | SpaceType::MachineCode => {
                self.allocate_sparse(space, size)?
            }
        };

        if self.marker.is_marking() {
            let region = unsafe { Region::from_address(addr) };
            region.atomic_mark(addr);
            region.add_live_bytes(size);
        }

        Some(addr)
    }

    /// Free list first, then finish any sweep, then grow by one region.
    fn allocate_sparse(&mut self, space: SpaceType, size: usize) -> Option<Address> {
        if let Some(addr) = self.sparse_space_mut(space).allocate_from_free_list(size) {
            return Some(addr);
        }

        if self.sweeper.is_sweeping() {
            self.finish_sweeping();
            if let Some(addr) = self.sparse_space_mut(space).allocate_from_free_list(size) {
                return Some(addr);
            }
        }

        if self.committed_size() + DEFAULT_REGION_SIZE > self.config.max_heap_size {
            return None;
        }

        let space = self.sparse_space_mut(space);
        if !space.expand(RegionFlags::empty()) {
            return None;
        }
        space.allocate_from_free_list(size)
    }

    /// Run a partial collection once the old generation outgrows its limit,
    /// or start concurrent marking as it approaches it.
    fn check_old_generation_limit(&mut self, ctx: &mut dyn GcContext, size: usize) -> AllocResult<()> {
        if self.in_gc {
            return Ok(());
        }

        if self.old_generation_size() + size > self.old_space_limit {
            return self.collect_garbage(ctx, GcType::Partial);
        }

        self.try_trigger_concurrent_marking(ctx);
        Ok(())
    }

    // ========================================================================
    // Object access
    // ========================================================================

    /// Header of a live object allocated by this heap.
    #[inline]
    pub fn object_header(&self, object: Address) -> ObjectHeader {
        unsafe { load_header(object) }
    }

    /// Raw payload bytes following the tagged slots of `object`.
    pub fn payload(&self, object: Address) -> &[u8] {
        unsafe { payload(object) }
    }

    pub fn payload_mut(&mut self, object: Address) -> &mut [u8] {
        unsafe { payload_mut(object) }
    }

    /// Whether `addr` is the start of an object in this heap.
    ///
    /// Walks the containing region, so this is meant for assertions and tests.
    pub fn contains_object(&self, addr: Address) -> bool {
        let Some(region) = self.all_regions().find(|region| region.contains(addr)) else {
            return false;
        };

        if addr >= region.top() {
            return false;
        }

        let mut found = false;
        region.walk_objects(|object, header| {
            if object == addr && !header.is_free() {
                found = true;
            }
        });
        found
    }

    /// Whether a value is usable: not a heap pointer, or a pointer to an
    /// object of this heap.
    pub fn is_alive(&self, value: TaggedValue) -> bool {
        match value.heap_address() {
            Some(addr) => self.contains_object(addr),
            None => true,
        }
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Young unless marking is under way or the old generation is over its
    /// limit.
    pub fn select_gc_type(&self) -> GcType {
        if self.marker.is_marking() || self.old_generation_size() > self.old_space_limit {
            GcType::Partial
        } else {
            GcType::Young
        }
    }

    /// Run a collection to completion.
    ///
    /// A young or partial request while concurrent marking runs finishes that
    /// mark and runs as partial; a full request aborts it and starts over.
    /// Returns `AllocError` if objects moved into old space overflowed its
    /// capacity.
    pub fn collect_garbage(&mut self, ctx: &mut dyn GcContext, gc_type: GcType) -> AllocResult<()> {
        if self.in_gc {
            return Ok(());
        }

        let gc_type = if self.marker.is_marking() {
            if gc_type == GcType::Full {
                self.abort_concurrent_marking();
                GcType::Full
            } else {
                GcType::Partial
            }
        } else {
            gc_type
        };

        let start = Instant::now();
        self.in_gc = true;
        debug!(?gc_type, heap_object_size = self.heap_object_size(), "gc start");

        #[cfg(feature = "heap_verify")]
        self.verify();

        self.finish_sweeping();
        let size_before = self.heap_object_size();

        let promoted = match gc_type {
            GcType::Young => self.run_young_gc(ctx),
            GcType::Partial | GcType::Full => {
                let promoted = self.run_old_gc(ctx, gc_type);
                self.recompute_limits();
                promoted
            }
        };
        let overflowed = self.old_space.evacuation_overflowed();

        self.phase = GcPhase::Idle;
        self.in_gc = false;
        self.stats.record(gc_type, start.elapsed(), size_before, self.heap_object_size(), promoted);

        for callback in self.global_handles.take_second_pass_callbacks() {
            callback();
        }

        #[cfg(feature = "heap_verify")]
        self.verify();

        if overflowed {
            warn!(
                committed = self.old_space.committed_size(),
                capacity = self.old_space.maximum_capacity(),
                "objects moved by gc overflowed old space"
            );
            return Err(AllocError::oom(promoted, SpaceType::Old));
        }

        if gc_type == GcType::Young {
            self.try_trigger_concurrent_marking(ctx);
        }

        Ok(())
    }

    fn run_young_gc(&mut self, ctx: &mut dyn GcContext) -> usize {
        self.phase = GcPhase::Evacuating;

        let young_before = self.semi_space.heap_object_size();
        let from_age_mark = self.semi_space.age_mark();
        let from_space = self.semi_space.flip();
        for region in &from_space {
            region.set_flag(RegionFlags::IN_COLLECT_SET);
        }
        self.old_space.begin_evacuation();

        let mut remembered = Vec::new();
        for region in self.old_generation_regions() {
            region.iterate_old_to_new(|slot| remembered.push((RegionPtr::new(region), slot)));
        }

        let (copied, promoted) = {
            let Heap {
                semi_space,
                old_space,
                root_providers,
                global_handles,
                ..
            } = self;

            let mut collector = YoungCollector::new(semi_space, old_space, from_age_mark);
            visit_strong_roots(ctx, root_providers, global_handles, &mut collector);
            collector.update_remembered_slots(&remembered);
            collector.process_worklist();
            (collector.copied_bytes(), collector.promoted_bytes())
        };

        self.phase = GcPhase::WeakRefProcessing;
        self.global_handles.sweep_weak(forwarded_address);

        self.semi_space.set_age_mark();
        drop(from_space);

        if young_before > 0 {
            self.adjust_young_capacity((copied + promoted) as f64 / young_before as f64);
        }

        promoted
    }

    fn run_old_gc(&mut self, ctx: &mut dyn GcContext, gc_type: GcType) -> usize {
        if self.marker.is_marking() {
            self.phase = GcPhase::Remark;
            self.mark_roots(ctx);
        } else {
            self.phase = GcPhase::RootScanning;
            self.prepare_marking(gc_type);
            self.marker.begin(false);
            self.mark_roots(ctx);
            self.phase = GcPhase::Marking;
            self.marker.post_tasks(self.max_mark_task_count);
        }
        self.marker.complete();
        self.marker.finish();

        self.phase = GcPhase::WeakRefProcessing;
        self.global_handles.sweep_weak(|addr| {
            unsafe { Region::from_address(addr) }
                .is_marked(addr)
                .then_some(addr)
        });

        self.phase = GcPhase::Evacuating;
        let young_regions = self.semi_space.flip();
        self.semi_space.set_extra_flags(RegionFlags::empty());
        self.old_space.clear_free_list();
        self.old_space.begin_evacuation();
        let old_collect_set = self.old_space.take_collect_set();

        let (moved, promoted) = {
            let mut evacuator = Evacuator::new(&mut self.old_space);
            let mut promoted = 0;
            for region in &young_regions {
                promoted += evacuator.evacuate_region(region);
            }
            for region in &old_collect_set {
                evacuator.evacuate_region(region);
            }
            (evacuator.into_moved(), promoted)
        };

        {
            let Heap {
                root_providers,
                global_handles,
                ..
            } = self;

            let mut updater = ReferenceUpdater;
            visit_strong_roots(ctx, root_providers, global_handles, &mut updater);
            global_handles.iterate_weak(&mut updater);
        }
        for region in self.old_generation_regions() {
            update_cross_region_slots(region);
        }
        update_moved_objects(&moved);

        debug!(
            young_regions = young_regions.len(),
            old_regions = old_collect_set.len(),
            moved = moved.len(),
            "evacuated collection set"
        );
        drop(young_regions);
        drop(old_collect_set);

        // Young space is empty now, so no old-to-new edge survives
        for region in self.old_generation_regions() {
            region.clear_all_old_to_new();
        }

        self.phase = GcPhase::Sweeping;
        self.start_sweeping();
        ConcurrentSweeper::defer_free(self.huge_object_space.sweep());

        promoted
    }

    /// Reset live byte counters and select the collection set.
    fn prepare_marking(&mut self, gc_type: GcType) {
        for region in self.all_regions() {
            region.reset_live_bytes();
        }

        let live_ratio = self.config.collect_set_live_ratio;
        let mut selected = 0;
        for region in self.old_space.regions() {
            let fragmented =
                (region.alive_at_last_sweep() as f64) < region.capacity() as f64 * live_ratio;
            if gc_type == GcType::Full || fragmented {
                region.set_flag(RegionFlags::IN_COLLECT_SET);
                selected += 1;
            }
        }
        self.semi_space.set_extra_flags(RegionFlags::IN_COLLECT_SET);

        debug!(?gc_type, old_regions = selected, "selected collection set");
    }

    fn mark_roots(&mut self, ctx: &mut dyn GcContext) {
        let Heap {
            marker,
            root_providers,
            global_handles,
            ..
        } = self;

        let mut root_marker = marker.root_marker();
        visit_strong_roots(ctx, root_providers, global_handles, &mut root_marker);
    }

    // ========================================================================
    // Concurrent marking
    // ========================================================================

    /// Start concurrent marking if it is enabled and the old generation has
    /// reached the trigger ratio of its limit. Returns whether marking started.
    pub fn try_trigger_concurrent_marking(&mut self, ctx: &mut dyn GcContext) -> bool {
        if !self.concurrent_mark_enabled || self.marker.is_marking() || self.in_gc {
            return false;
        }

        let threshold = self.old_space_limit as f64 * self.config.concurrent_mark_trigger_ratio;
        if (self.old_generation_size() as f64) < threshold {
            return false;
        }

        self.start_concurrent_marking(ctx);
        true
    }

    fn start_concurrent_marking(&mut self, ctx: &mut dyn GcContext) {
        debug!(
            old_generation_size = self.old_generation_size(),
            limit = self.old_space_limit,
            "starting concurrent marking"
        );

        self.finish_sweeping();
        self.prepare_marking(GcType::Partial);
        self.marker.begin(true);
        self.mark_roots(ctx);
        self.marker.post_tasks(self.max_mark_task_count.max(1));
        self.stats.concurrent_mark_count += 1;
    }

    fn abort_concurrent_marking(&mut self) {
        info!("aborting concurrent marking for a full gc");

        self.marker.abort();
        for region in self.all_regions() {
            region.clear_flag(RegionFlags::IN_COLLECT_SET);
            region.clear_mark_bitmap();
            region.clear_cross_region();
            region.reset_live_bytes();
        }
        self.semi_space.set_extra_flags(RegionFlags::empty());
    }

    // ========================================================================
    // Sweeping
    // ========================================================================

    /// Queue every non-evacuated region of the free-list spaces for sweeping.
    fn start_sweeping(&mut self) {
        let mut regions = Vec::new();

        let mut old_live = 0;
        for region in self.old_space.regions() {
            if region.has_flag(RegionFlags::FRESH) {
                continue;
            }
            old_live += region.live_bytes();
            regions.push((SpaceType::Old, RegionPtr::new(region)));
        }
        self.old_space.set_allocated_bytes(old_live + self.old_space.evacuated_bytes());
        self.old_space.clear_fresh_flags();

        for space in [&mut self.non_movable_space, &mut self.machine_code_space] {
            let mut live = 0;
            for region in space.regions() {
                live += region.live_bytes();
                regions.push((space.space_type(), RegionPtr::new(region)));
            }
            space.clear_free_list();
            space.set_allocated_bytes(live);
        }

        let task_count = if self.concurrent_sweep_enabled {
            self.max_mark_task_count.max(1)
        } else {
            0
        };

        self.sweeper.start(regions, task_count);
        if task_count == 0 {
            self.finish_sweeping();
        }
    }

    /// Wait for outstanding sweeping and merge every result.
    pub(crate) fn finish_sweeping(&mut self) {
        if self.sweeper.is_sweeping() {
            let results = self.sweeper.ensure_all_finished();
            self.merge_sweep_results(results);
        }
    }

    fn merge_sweep_results(&mut self, results: Vec<SweepResult>) {
        for result in results {
            let region = unsafe { result.region.get() };
            region.clear_flag(RegionFlags::IN_SWEEPING);
            region.merge_sweeping_set();
            region.set_alive_at_last_sweep(result.live_bytes);
            let begin = region.begin();

            let space = self.sparse_space_mut(result.space);
            if result.live_bytes == 0 {
                drop(space.remove_region(begin));
                continue;
            }

            for (addr, size) in result.free_ranges {
                unsafe { space.add_free_range(addr, size) };
            }
        }
    }

    // ========================================================================
    // Policy
    // ========================================================================

    /// Set the old generation limit from the live size after a marking
    /// collection.
    fn recompute_limits(&mut self) {
        let live = self.old_generation_size();
        let grown = (live as f64 * self.growing_type.growing_factor()) as usize;
        let maximum = self.config.old_space_capacity + self.config.huge_object_space_capacity;
        self.old_space_limit = grown.max(self.config.min_old_space_limit).min(maximum);

        debug!(
            live,
            limit = self.old_space_limit,
            growing_type = ?self.growing_type,
            "recomputed old generation limit"
        );
    }

    fn adjust_young_capacity(&mut self, survival_rate: f64) {
        let capacity = self.semi_space.capacity();
        if survival_rate >= GROW_SURVIVAL_RATE && self.growing_type == MemGrowingType::HighThroughput {
            self.semi_space.set_capacity(capacity * 2);
        } else if survival_rate < SHRINK_SURVIVAL_RATE || self.growing_type == MemGrowingType::Pressure {
            self.semi_space.set_capacity(capacity / 2);
        }
    }

    /// Switch between foreground and background tuning.
    ///
    /// Background mode shrinks the worker budget, optionally disables
    /// concurrent marking and sweeping, shrinks young space and grows the
    /// old generation conservatively. Switching back restores the configured
    /// behaviour. Takes effect from the next cycle.
    pub fn change_gc_params(&mut self, in_background: bool) {
        if self.in_background == in_background {
            return;
        }
        self.in_background = in_background;

        if in_background {
            info!("gc switched to background mode");
            if self.growing_type != MemGrowingType::Pressure {
                self.growing_type = MemGrowingType::Conservative;
            }
            if self.config.background_disables_concurrency {
                self.concurrent_mark_enabled = false;
                self.concurrent_sweep_enabled = false;
            }
            self.max_mark_task_count = self.config.background_mark_task_count;
            self.semi_space.set_capacity(self.semi_space.min_capacity());
        } else {
            info!("gc switched to foreground mode");
            if self.growing_type != MemGrowingType::Pressure {
                self.growing_type = MemGrowingType::HighThroughput;
            }
            self.concurrent_mark_enabled = self.config.enable_concurrent_mark;
            self.concurrent_sweep_enabled = self.config.enable_concurrent_sweep;
            self.max_mark_task_count = task_pool::total_thread_num();
        }
    }

    /// Enter or leave the pressure growth policy.
    pub fn notify_memory_pressure(&mut self, in_pressure: bool) {
        self.growing_type = if in_pressure {
            MemGrowingType::Pressure
        } else {
            MemGrowingType::Conservative
        };

        info!(in_pressure, "memory pressure changed");
    }

    /// Use an idle period. In order of preference:
    /// - finish a concurrent mark whose work is done;
    /// - in a long idle period, run a full collection once the heap is at rest
    ///   or a partial collection once old and non-movable space outgrew the
    ///   committed size left by the last idle collection;
    /// - run a young collection if young space is more than half full.
    ///
    /// Returns whether a collection ran.
    pub fn trigger_idle_collection(
        &mut self,
        ctx: &mut dyn GcContext,
        idle_micros: u64,
    ) -> AllocResult<bool> {
        if self.marker.is_concurrent() {
            if !self.marker.is_work_done() {
                return Ok(false);
            }
            self.collect_garbage(ctx, GcType::Partial)?;
            return Ok(true);
        }

        if idle_micros >= IDLE_OLD_GC_MICROS {
            let old_committed = self.idle_old_committed_size();
            if let Some(gc_type) = self.idle.select_gc(self.heap_object_size(), old_committed) {
                debug!(?gc_type, idle_micros, "idle collection");
                self.collect_garbage(ctx, gc_type)?;

                let old_committed = self.idle_old_committed_size();
                self.idle.collected(
                    gc_type,
                    self.heap_object_size(),
                    old_committed,
                    self.config.min_old_space_limit,
                );
                return Ok(true);
            }
        }

        if idle_micros >= IDLE_YOUNG_GC_MICROS
            && self.semi_space.heap_object_size() > self.semi_space.capacity() / 2
        {
            self.collect_garbage(ctx, GcType::Young)?;
            return Ok(true);
        }

        if self.sweeper.is_sweeping() {
            let results = self.sweeper.take_results();
            self.merge_sweep_results(results);
        }

        Ok(false)
    }

    fn idle_old_committed_size(&self) -> usize {
        self.old_space.committed_size() + self.non_movable_space.committed_size()
    }

    /// Region base for an address, used to test membership without
    /// dereferencing.
    #[inline]
    pub(crate) fn region_base(addr: Address) -> Address {
        addr & !DEFAULT_REGION_MASK
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.marker.is_marking() {
            self.marker.abort();
        }
        self.finish_sweeping();
    }
}

/// Collections to try, in order, when an allocation fails.
fn escalation(first: GcType) -> &'static [GcType] {
    match first {
        GcType::Young => &[GcType::Young, GcType::Partial, GcType::Full],
        GcType::Partial => &[GcType::Partial, GcType::Full],
        GcType::Full => &[GcType::Full],
    }
}

/// Visit the context, every root provider and the strong global handles.
fn visit_strong_roots(
    ctx: &mut dyn GcContext,
    root_providers: &mut [RootProvider],
    global_handles: &GlobalHandleTable,
    visitor: &mut dyn RootVisitor,
) {
    ctx.visit_roots(visitor);
    for (_, provider) in root_providers.iter_mut() {
        provider.visit_roots(visitor);
    }
    global_handles.iterate_strong(visitor);
}
