//! Sparse space - free-list allocated regions that are swept in place.
//!
//! Used for the old, non-movable and machine-code spaces. Old space regions may
//! additionally be selected into a collection set and evacuated.

use crate::{
    fatal,
    region::{Region, RegionFlags, DEFAULT_REGION_SIZE},
    space::{FreeObjectList, SpaceType},
    tagged_value::Address,
};

pub struct SparseSpace {
    space_type: SpaceType,
    regions: Vec<Box<Region>>,
    free_list: FreeObjectList,
    maximum_capacity: usize,
    committed: usize,
    /// Bytes of allocated (not free) objects
    allocated_bytes: usize,
    /// Bytes allocated by evacuation during the current collection
    evacuated_bytes: usize,
    /// Evacuation grew the space past its capacity during the current collection
    evacuation_overflowed: bool,
}

impl SparseSpace {
    pub fn new(space_type: SpaceType, maximum_capacity: usize) -> SparseSpace {
        SparseSpace {
            space_type,
            regions: Vec::new(),
            free_list: FreeObjectList::new(),
            maximum_capacity,
            committed: 0,
            allocated_bytes: 0,
            evacuated_bytes: 0,
            evacuation_overflowed: false,
        }
    }

    #[inline]
    pub fn space_type(&self) -> SpaceType {
        self.space_type
    }

    /// Allocate from the free list, growing by one region while under capacity.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if let Some(addr) = self.allocate_from_free_list(size) {
            return Some(addr);
        }

        if !self.expand(RegionFlags::empty()) {
            return None;
        }

        self.allocate_from_free_list(size)
    }

    pub(crate) fn allocate_from_free_list(&mut self, size: usize) -> Option<Address> {
        let addr = self.free_list.allocate(size)?;
        self.allocated_bytes += size;
        Some(addr)
    }

    /// Allocate space for an object moved by the collector. The copy cannot fail
    /// halfway, so this may grow past the maximum capacity. Callers check
    /// `is_over_capacity` afterwards.
    pub(crate) fn allocate_for_evacuation(&mut self, size: usize) -> Address {
        if let Some(addr) = self.allocate_from_free_list(size) {
            self.evacuated_bytes += size;
            return addr;
        }

        let region = match Region::new_regular(self.space_type, RegionFlags::FRESH) {
            Some(region) => region,
            None => fatal!("system allocator failed while evacuating into {} space", self.space_type.name()),
        };
        self.add_region(region);
        if self.is_over_capacity() {
            self.evacuation_overflowed = true;
        }

        match self.allocate_from_free_list(size) {
            Some(addr) => {
                self.evacuated_bytes += size;
                addr
            }
            None => fatal!("object of {size} bytes does not fit a fresh region"),
        }
    }

    /// Add one region if it fits in the maximum capacity.
    pub(crate) fn expand(&mut self, flags: RegionFlags) -> bool {
        if self.committed + DEFAULT_REGION_SIZE > self.maximum_capacity {
            return false;
        }

        match Region::new_regular(self.space_type, flags) {
            Some(region) => {
                self.add_region(region);
                true
            }
            None => false,
        }
    }

    fn add_region(&mut self, region: Box<Region>) {
        unsafe { self.free_list.free(region.begin(), region.capacity()) };
        region.set_top(region.end());
        self.committed += region.committed_size();
        self.regions.push(region);
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    #[inline]
    pub fn heap_object_size(&self) -> usize {
        self.allocated_bytes
    }

    #[inline]
    pub fn committed_size(&self) -> usize {
        self.committed
    }

    #[inline]
    pub fn maximum_capacity(&self) -> usize {
        self.maximum_capacity
    }

    #[inline]
    pub fn is_over_capacity(&self) -> bool {
        self.committed > self.maximum_capacity
    }

    #[inline]
    pub fn free_list_available(&self) -> usize {
        self.free_list.available()
    }

    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().map(|region| &**region)
    }

    // ========================================================================
    // Collection support
    // ========================================================================

    pub(crate) fn begin_evacuation(&mut self) {
        self.evacuated_bytes = 0;
        self.evacuation_overflowed = false;
    }

    pub(crate) fn evacuation_overflowed(&self) -> bool {
        self.evacuation_overflowed
    }

    pub(crate) fn evacuated_bytes(&self) -> usize {
        self.evacuated_bytes
    }

    /// Drop every free range. Sweeping rebuilds the list.
    pub(crate) fn clear_free_list(&mut self) {
        self.free_list.clear();
    }

    /// # Safety
    /// The range must be dead memory inside a region of this space.
    pub(crate) unsafe fn add_free_range(&mut self, addr: Address, size: usize) {
        self.free_list.free(addr, size);
    }

    pub(crate) fn set_allocated_bytes(&mut self, bytes: usize) {
        self.allocated_bytes = bytes;
    }

    /// Remove the regions selected into the collection set.
    pub(crate) fn take_collect_set(&mut self) -> Vec<Box<Region>> {
        let (collected, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.regions)
            .into_iter()
            .partition(|region| region.in_collect_set());
        self.regions = kept;
        self.committed -= collected.iter().map(|r| r.committed_size()).sum::<usize>();
        collected
    }

    /// Remove a region whose sweep found no live objects.
    pub(crate) fn remove_region(&mut self, begin: Address) -> Option<Box<Region>> {
        let position = self.regions.iter().position(|region| region.begin() == begin)?;
        let region = self.regions.swap_remove(position);
        self.committed -= region.committed_size();
        Some(region)
    }

    pub(crate) fn clear_fresh_flags(&mut self) {
        for region in &self.regions {
            region.clear_flag(RegionFlags::FRESH);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::REGION_USABLE_SIZE;

    #[test]
    fn grows_to_capacity() {
        let mut space = SparseSpace::new(SpaceType::Old, 2 * DEFAULT_REGION_SIZE);
        let size = 100 * 1024;
        let mut count = 0;
        while space.allocate(size).is_some() {
            count += 1;
        }

        assert_eq!(count, 4);
        assert_eq!(space.region_count(), 2);
        assert_eq!(space.heap_object_size(), 4 * size);
        assert_eq!(space.free_list_available(), 2 * (REGION_USABLE_SIZE - 2 * size));
    }

    #[test]
    fn evacuation_may_exceed_capacity() {
        let mut space = SparseSpace::new(SpaceType::Old, DEFAULT_REGION_SIZE);
        space.begin_evacuation();
        for _ in 0..3 {
            space.allocate_for_evacuation(100 * 1024);
        }

        assert!(space.is_over_capacity());
        assert!(space.evacuation_overflowed());
        assert_eq!(space.evacuated_bytes(), 300 * 1024);
        assert!(space.regions().all(|r| r.has_flag(RegionFlags::FRESH)));
    }
}
