//! Semi-space for young objects.
//!
//! Objects are bump allocated into a chain of regions. A young GC takes the
//! current regions as the from-space and copies survivors into fresh regions.
//! The age mark records where allocation stood after the last young GC:
//! objects below it have survived once and are promoted on the next young GC.

use crate::{
    region::{Region, RegionFlags, DEFAULT_REGION_SIZE},
    space::SpaceType,
    tagged_value::Address,
};

pub struct SemiSpace {
    regions: Vec<Box<Region>>,
    /// Current capacity, adjusted by survival rate
    capacity: usize,
    min_capacity: usize,
    max_capacity: usize,
    age_mark: Address,
    /// Flags applied to every region of the space, including new ones
    extra_flags: RegionFlags,
}

impl SemiSpace {
    pub fn new(min_capacity: usize, max_capacity: usize) -> SemiSpace {
        let min_capacity = min_capacity.max(DEFAULT_REGION_SIZE);
        SemiSpace {
            regions: Vec::new(),
            capacity: min_capacity,
            min_capacity,
            max_capacity: max_capacity.max(min_capacity),
            age_mark: 0,
            extra_flags: RegionFlags::empty(),
        }
    }

    /// Bump allocate `size` bytes, adding a region while under capacity.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if let Some(addr) = self.regions.last().and_then(|region| region.bump_allocate(size)) {
            return Some(addr);
        }

        if !self.expand() {
            return None;
        }

        self.regions.last().and_then(|region| region.bump_allocate(size))
    }

    fn expand(&mut self) -> bool {
        if self.committed_size() + DEFAULT_REGION_SIZE > self.capacity {
            return false;
        }

        match Region::new_regular(SpaceType::Young, self.extra_flags) {
            Some(region) => {
                self.regions.push(region);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn committed_size(&self) -> usize {
        self.regions.len() * DEFAULT_REGION_SIZE
    }

    pub fn heap_object_size(&self) -> usize {
        self.regions
            .iter()
            .map(|region| region.top() - region.begin())
            .sum()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.clamp(self.min_capacity, self.max_capacity);
    }

    #[inline]
    pub fn age_mark(&self) -> Address {
        self.age_mark
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().map(|region| &**region)
    }

    /// Apply `flags` to every current and future region until cleared.
    pub(crate) fn set_extra_flags(&mut self, flags: RegionFlags) {
        for region in &self.regions {
            region.clear_flag(self.extra_flags);
            region.set_flag(flags);
        }
        self.extra_flags = flags;
    }

    /// Hand the current regions to the collector and start an empty to-space.
    pub(crate) fn flip(&mut self) -> Vec<Box<Region>> {
        self.age_mark = 0;
        std::mem::take(&mut self.regions)
    }

    /// Record everything allocated so far as having survived one collection.
    pub(crate) fn set_age_mark(&mut self) {
        let count = self.regions.len();
        for (index, region) in self.regions.iter().enumerate() {
            if index + 1 < count {
                region.set_flag(RegionFlags::BELOW_AGE_MARK);
            } else {
                region.set_flag(RegionFlags::HAS_AGE_MARK);
            }
        }

        self.age_mark = self.regions.last().map_or(0, |region| region.top());
    }

    /// Whether an object in a from-space region survived the previous young GC.
    pub(crate) fn is_aged(region: &Region, addr: Address, from_age_mark: Address) -> bool {
        region.has_flag(RegionFlags::BELOW_AGE_MARK)
            || (region.has_flag(RegionFlags::HAS_AGE_MARK) && addr < from_age_mark)
    }
}
