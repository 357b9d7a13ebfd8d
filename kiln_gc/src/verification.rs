//! Heap verification
//!
//! Walks every object of every region and checks that:
//! - each heap pointer in a slot refers to the start of a live object of this
//!   heap;
//! - each old-to-young slot is present in the holder region's old-to-new set.
//!
//! Any failure is an invariant violation and fatal.

use hashbrown::HashMap;

use crate::{
    fatal,
    heap::Heap,
    object_header::{load_slot, slot_address},
    region::Region,
    tagged_value::Address,
};

impl Heap {
    /// Verify heap invariants, returning the number of objects checked.
    ///
    /// Finishes outstanding sweeping first, so regions are fully walkable.
    pub fn verify(&mut self) -> usize {
        self.finish_sweeping();

        let regions: HashMap<Address, &Region> = self
            .all_regions()
            .map(|region| (Heap::region_base(region.begin()), region))
            .collect();

        let mut objects = 0;
        for region in self.all_regions() {
            let holder_is_young = region.in_young_space();

            region.walk_objects(|object, header| {
                if header.is_free() {
                    return;
                }
                objects += 1;

                for index in 0..header.slot_count() {
                    let slot = slot_address(object, index);
                    let Some(target) = unsafe { load_slot(slot) }.heap_address() else {
                        continue;
                    };

                    let Some(target_region) = regions.get(&Heap::region_base(target)) else {
                        fatal!("slot {slot:#x} of {object:#x} points outside the heap: {target:#x}");
                    };

                    if target < target_region.begin() || target >= target_region.top() {
                        fatal!("slot {slot:#x} of {object:#x} points past allocated memory: {target:#x}");
                    }

                    if self.object_header(target).is_free() {
                        fatal!("slot {slot:#x} of {object:#x} points at freed memory: {target:#x}");
                    }

                    if !holder_is_young
                        && target_region.in_young_space()
                        && !region.old_to_new_contains(slot)
                    {
                        fatal!("old-to-young slot {slot:#x} of {object:#x} is not remembered");
                    }
                }
            });
        }

        tracing::debug!(objects, "heap verified");
        objects
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::HeapConfigBuilder, heap::Heap, object_header::ObjectKind, space::SpaceType,
        tagged_value::TaggedValue, visitor::NoRoots,
    };

    fn heap() -> Heap {
        Heap::new(
            HeapConfigBuilder::from_heap_size(32 * 1024 * 1024)
                .enable_concurrent_mark(false)
                .enable_concurrent_sweep(false)
                .build(),
        )
    }

    #[test]
    fn counts_live_objects() {
        let mut heap = heap();
        for space in [SpaceType::Young, SpaceType::Old, SpaceType::NonMovable] {
            heap.allocate_object(&mut NoRoots, ObjectKind::Plain, 1, 0, space)
                .unwrap();
        }
        assert_eq!(heap.verify(), 3);
    }

    #[test]
    #[should_panic(expected = "is not remembered")]
    fn detects_missing_barrier() {
        let mut heap = heap();
        let old = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 1, 0, SpaceType::Old)
            .unwrap();
        let young = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 0, 0, SpaceType::Young)
            .unwrap();

        // Store without the barrier
        unsafe {
            crate::object_header::store_slot(
                crate::object_header::slot_address(old, 0),
                TaggedValue::from_address(young),
            )
        };
        heap.verify();
    }
}
