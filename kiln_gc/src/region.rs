//! Region - a power-of-two aligned block of heap memory owned by one Space.
//!
//! Layout: | back-pointer to Region | padding | objects ... |
//!
//! Because regular regions are aligned to their size, the Region of any object
//! is found by masking the object's address and loading the back-pointer stored
//! at the start of the block. Huge regions use the same alignment but are sized
//! to their single object.
//!
//! Region metadata (flags, bitmaps, live bytes) is atomic so marker and sweeper
//! threads can read and update it while the mutator runs.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::alloc::{alloc_zeroed, dealloc, Layout};

use bitflags::bitflags;

use crate::{
    bitmap::AtomicBitmap,
    object_header::{self, align_up, ObjectHeader, OBJECT_ALIGNMENT},
    space::SpaceType,
    tagged_value::Address,
};

pub const REGION_SIZE_LOG2: usize = 18;

/// Size and alignment of a regular region (256 KiB)
pub const DEFAULT_REGION_SIZE: usize = 1 << REGION_SIZE_LOG2;
pub const DEFAULT_REGION_MASK: usize = DEFAULT_REGION_SIZE - 1;

/// Bytes reserved at the start of every region for the back-pointer
pub const REGION_HEADER_SIZE: usize = 64;

/// Objects larger than this are placed in their own huge region
pub const MAX_REGULAR_HEAP_OBJECT_SIZE: usize = 128 * 1024;

/// Usable bytes in a regular region
pub const REGION_USABLE_SIZE: usize = DEFAULT_REGION_SIZE - REGION_HEADER_SIZE;

const HUGE_REGION_GRANULARITY: usize = 4096;

/// Bits in the mark bitmap and remembered sets cover 8 bytes each
const BITMAP_GRANULARITY_LOG2: usize = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const IN_YOUNG_SPACE = 1 << 0;
        const IN_OLD_SPACE = 1 << 1;
        const IN_NON_MOVABLE_SPACE = 1 << 2;
        const IN_HUGE_OBJECT_SPACE = 1 << 3;
        const IN_MACHINE_CODE_SPACE = 1 << 4;
        /// Region will be evacuated by the current collection
        const IN_COLLECT_SET = 1 << 5;
        /// Young region containing the age mark
        const HAS_AGE_MARK = 1 << 6;
        /// Young region entirely below the age mark
        const BELOW_AGE_MARK = 1 << 7;
        /// Region is queued for or undergoing a sweep
        const IN_SWEEPING = 1 << 8;
        /// Region created by evacuation during the current collection
        const FRESH = 1 << 9;
    }
}

impl RegionFlags {
    pub fn for_space(space: SpaceType) -> RegionFlags {
        match space {
            SpaceType::Young => RegionFlags::IN_YOUNG_SPACE,
            SpaceType::Old => RegionFlags::IN_OLD_SPACE,
            SpaceType::NonMovable => RegionFlags::IN_NON_MOVABLE_SPACE,
            SpaceType::HugeObject => RegionFlags::IN_HUGE_OBJECT_SPACE,
            SpaceType::MachineCode => RegionFlags::IN_MACHINE_CODE_SPACE,
        }
    }
}

pub struct Region {
    base: Address,
    begin: Address,
    end: Address,
    layout: Layout,
    space: SpaceType,
    flags: AtomicU32,
    /// End of allocated memory. Objects tile `[begin, top)`.
    top: AtomicUsize,
    /// Bytes marked live by the current mark
    live_bytes: AtomicUsize,
    /// Live bytes found by the most recent sweep
    alive_at_last_sweep: AtomicUsize,
    mark_bitmap: AtomicBitmap,
    old_to_new_set: AtomicBitmap,
    cross_region_set: AtomicBitmap,
    /// Old-to-new entries recorded while the region is being swept
    sweeping_set: AtomicBitmap,
}

impl Region {
    /// Allocate a regular region for `space`. Returns `None` if the system
    /// allocator fails.
    pub(crate) fn new_regular(space: SpaceType, extra_flags: RegionFlags) -> Option<Box<Region>> {
        Region::allocate(space, DEFAULT_REGION_SIZE, extra_flags)
    }

    /// Allocate a huge region sized for one object of `object_size` bytes.
    pub(crate) fn new_huge(object_size: usize) -> Option<Box<Region>> {
        let size = align_up(REGION_HEADER_SIZE + object_size, HUGE_REGION_GRANULARITY);
        Region::allocate(SpaceType::HugeObject, size, RegionFlags::empty())
    }

    fn allocate(space: SpaceType, size: usize, extra_flags: RegionFlags) -> Option<Box<Region>> {
        let layout = Layout::from_size_align(size, DEFAULT_REGION_SIZE).ok()?;
        let base = unsafe { alloc_zeroed(layout) } as Address;
        if base == 0 {
            return None;
        }

        let bit_count = size >> BITMAP_GRANULARITY_LOG2;
        let flags = RegionFlags::for_space(space) | extra_flags;
        let begin = base + REGION_HEADER_SIZE;

        let region = Box::new(Region {
            base,
            begin,
            end: base + size,
            layout,
            space,
            flags: AtomicU32::new(flags.bits()),
            top: AtomicUsize::new(begin),
            live_bytes: AtomicUsize::new(0),
            alive_at_last_sweep: AtomicUsize::new(size - REGION_HEADER_SIZE),
            mark_bitmap: AtomicBitmap::new(bit_count),
            old_to_new_set: AtomicBitmap::new(bit_count),
            cross_region_set: AtomicBitmap::new(bit_count),
            sweeping_set: AtomicBitmap::new(bit_count),
        });

        // The boxed Region never moves, so the back-pointer stays valid until
        // the Region is dropped together with its memory.
        unsafe {
            *(base as *mut *const Region) = &*region as *const Region;
        }

        Some(region)
    }

    /// Find the Region containing the start of an object.
    ///
    /// # Safety
    /// `addr` must be the start of an object allocated in a live Region.
    #[inline]
    pub unsafe fn from_address<'a>(addr: Address) -> &'a Region {
        let base = addr & !DEFAULT_REGION_MASK;
        &**(base as *const *const Region)
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    #[inline]
    pub fn begin(&self) -> Address {
        self.begin
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_top(&self, top: Address) {
        debug_assert!(top >= self.begin && top <= self.end);
        self.top.store(top, Ordering::Release)
    }

    /// Usable bytes in the region
    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.begin
    }

    /// Bytes of system memory committed for the region
    #[inline]
    pub fn committed_size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn space(&self) -> SpaceType {
        self.space
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.end
    }

    /// Bump allocate `size` bytes, or `None` if the region is full.
    #[inline]
    pub(crate) fn bump_allocate(&self, size: usize) -> Option<Address> {
        let top = self.top();
        if top + size > self.end {
            return None;
        }
        self.set_top(top + size);
        Some(top)
    }

    #[inline]
    fn bit_index(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.base && addr < self.end);
        (addr - self.base) >> BITMAP_GRANULARITY_LOG2
    }

    #[inline]
    fn bit_address(&self, index: usize) -> Address {
        self.base + (index << BITMAP_GRANULARITY_LOG2)
    }

    // ========================================================================
    // Flags
    // ========================================================================

    #[inline]
    pub fn flags(&self) -> RegionFlags {
        RegionFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_flag(&self, flag: RegionFlags) -> bool {
        self.flags().intersects(flag)
    }

    #[inline]
    pub(crate) fn set_flag(&self, flag: RegionFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_flag(&self, flag: RegionFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    #[inline]
    pub fn in_young_space(&self) -> bool {
        self.has_flag(RegionFlags::IN_YOUNG_SPACE)
    }

    #[inline]
    pub fn in_collect_set(&self) -> bool {
        self.has_flag(RegionFlags::IN_COLLECT_SET)
    }

    #[inline]
    pub fn is_huge(&self) -> bool {
        self.has_flag(RegionFlags::IN_HUGE_OBJECT_SPACE)
    }

    // ========================================================================
    // Marking
    // ========================================================================

    /// Mark the object at `addr`, returning true if it was previously unmarked.
    #[inline]
    pub fn atomic_mark(&self, addr: Address) -> bool {
        self.mark_bitmap.atomic_test_and_set(self.bit_index(addr))
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        self.mark_bitmap.test(self.bit_index(addr))
    }

    #[inline]
    pub fn has_marked_objects(&self) -> bool {
        !self.mark_bitmap.is_empty()
    }

    pub(crate) fn clear_mark_bitmap(&self) {
        self.mark_bitmap.clear_all();
    }

    /// Call `f` with every marked object in address order.
    pub(crate) fn iterate_marked(&self, mut f: impl FnMut(Address)) {
        self.mark_bitmap.iterate(|index| f(self.bit_address(index)));
    }

    #[inline]
    pub(crate) fn add_live_bytes(&self, size: usize) {
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
    }

    #[inline]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_live_bytes(&self) {
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn alive_at_last_sweep(&self) -> usize {
        self.alive_at_last_sweep.load(Ordering::Relaxed)
    }

    pub(crate) fn set_alive_at_last_sweep(&self, bytes: usize) {
        self.alive_at_last_sweep.store(bytes, Ordering::Relaxed);
    }

    // ========================================================================
    // Remembered sets
    // ========================================================================

    /// Record an old-to-young slot. While the region is being swept the entry
    /// goes to the sweeping set, which is merged back once the sweep finishes.
    #[inline]
    pub(crate) fn insert_old_to_new(&self, slot: Address) {
        let index = self.bit_index(slot);
        if self.has_flag(RegionFlags::IN_SWEEPING) {
            self.sweeping_set.set(index);
        } else {
            self.old_to_new_set.set(index);
        }
    }

    #[inline]
    pub(crate) fn clear_old_to_new(&self, slot: Address) {
        self.old_to_new_set.clear(self.bit_index(slot));
    }

    /// Drop old-to-new entries in a range of dead memory.
    pub(crate) fn clear_old_to_new_range(&self, start: Address, end: Address) {
        self.old_to_new_set
            .clear_range(self.bit_index(start), self.bit_index(end - OBJECT_ALIGNMENT) + 1);
    }

    pub(crate) fn clear_all_old_to_new(&self) {
        self.old_to_new_set.clear_all();
        self.sweeping_set.clear_all();
    }

    pub fn old_to_new_contains(&self, slot: Address) -> bool {
        let index = self.bit_index(slot);
        self.old_to_new_set.test(index) || self.sweeping_set.test(index)
    }

    pub(crate) fn iterate_old_to_new(&self, mut f: impl FnMut(Address)) {
        self.old_to_new_set.iterate(|index| f(self.bit_address(index)));
    }

    pub(crate) fn has_old_to_new_entries(&self) -> bool {
        !self.old_to_new_set.is_empty() || !self.sweeping_set.is_empty()
    }

    pub(crate) fn merge_sweeping_set(&self) {
        self.old_to_new_set.merge_from(&self.sweeping_set);
    }

    #[inline]
    pub(crate) fn atomic_insert_cross_region(&self, slot: Address) {
        self.cross_region_set.set(self.bit_index(slot));
    }

    pub fn cross_region_contains(&self, slot: Address) -> bool {
        self.cross_region_set.test(self.bit_index(slot))
    }

    pub(crate) fn iterate_cross_region(&self, mut f: impl FnMut(Address)) {
        self.cross_region_set.iterate(|index| f(self.bit_address(index)));
    }

    pub(crate) fn clear_cross_region(&self) {
        self.cross_region_set.clear_all();
    }

    // ========================================================================
    // Walking
    // ========================================================================

    /// Call `f` with every object (fillers included) in `[begin, top)`.
    ///
    /// Must not run while objects in the region are being forwarded.
    pub(crate) fn walk_objects(&self, mut f: impl FnMut(Address, ObjectHeader)) {
        let top = self.top();
        let mut addr = self.begin;
        while addr < top {
            let header = unsafe { object_header::load_header(addr) };
            if header.is_forwarded() || header.size() == 0 {
                crate::fatal!("unwalkable object {addr:#x} in region {:#x}: {header:?}", self.base);
            }
            f(addr, header);
            addr += header.size();
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.base as *mut u8, self.layout) }
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base))
            .field("space", &self.space)
            .field("flags", &self.flags())
            .field("used", &(self.top() - self.begin))
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}
