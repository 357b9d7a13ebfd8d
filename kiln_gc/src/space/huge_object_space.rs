//! Huge object space - one dedicated region per oversized object.
//!
//! A huge object is live while its region's mark bitmap has any bit set. Dead
//! regions are detached during the collection and handed back to the caller to
//! be freed later on a worker thread.

use crate::{region::Region, tagged_value::Address};

pub struct HugeObjectSpace {
    regions: Vec<Box<Region>>,
    maximum_capacity: usize,
    committed: usize,
    heap_object_size: usize,
}

impl HugeObjectSpace {
    pub fn new(maximum_capacity: usize) -> HugeObjectSpace {
        HugeObjectSpace {
            regions: Vec::new(),
            maximum_capacity,
            committed: 0,
            heap_object_size: 0,
        }
    }

    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if self.committed + size > self.maximum_capacity {
            return None;
        }

        let region = Region::new_huge(size)?;
        let addr = region.bump_allocate(size)?;

        self.committed += region.committed_size();
        self.heap_object_size += size;
        self.regions.push(region);
        Some(addr)
    }

    #[inline]
    pub fn heap_object_size(&self) -> usize {
        self.heap_object_size
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
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().map(|region| &**region)
    }

    /// Detach every region without a mark bit and clear the bitmaps of the rest.
    /// The returned regions must be dropped later, off the mutator thread.
    pub(crate) fn sweep(&mut self) -> Vec<Box<Region>> {
        let (live, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut self.regions)
            .into_iter()
            .partition(|region| region.has_marked_objects());

        for region in &live {
            region.clear_mark_bitmap();
            region.set_alive_at_last_sweep(region.top() - region.begin());
        }

        for region in &dead {
            self.committed -= region.committed_size();
            self.heap_object_size -= region.top() - region.begin();
        }

        self.regions = live;
        dead
    }
}
