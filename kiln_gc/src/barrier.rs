//! Write barrier
//!
//! Every store of a tagged value into a heap object goes through
//! `Heap::set_field`, which performs the store and then the barrier:
//! - an old-to-young edge is recorded in the holder region's old-to-new set, so
//!   young collections never rescan old space;
//! - while marking, an edge from outside into the collection set is recorded in
//!   the holder's cross-region set, and an unmarked target is marked and queued
//!   (insertion barrier).

use crate::{
    fatal,
    heap::Heap,
    object_header::{load_header, load_slot, slot_address, store_slot},
    region::Region,
    tagged_value::{Address, TaggedValue},
};

impl Heap {
    /// Store `value` into slot `index` of `object`, followed by the barrier.
    pub fn set_field(&self, object: Address, index: usize, value: TaggedValue) {
        let slot = self.checked_slot(object, index);
        unsafe { store_slot(slot, value) };
        self.write_barrier(object, slot, value);
    }

    /// Load slot `index` of `object`.
    pub fn get_field(&self, object: Address, index: usize) -> TaggedValue {
        let slot = self.checked_slot(object, index);
        unsafe { load_slot(slot) }
    }

    fn checked_slot(&self, object: Address, index: usize) -> Address {
        let slot_count = unsafe { load_header(object) }.slot_count();
        if index >= slot_count {
            fatal!("slot {index} out of bounds for object {object:#x} with {slot_count} slots");
        }
        slot_address(object, index)
    }

    /// Record the store of `value` into `slot` of `object`.
    ///
    /// Must run after the store itself, for every heap pointer stored into a
    /// heap object by any path other than `set_field`.
    #[inline]
    pub fn write_barrier(&self, object: Address, slot: Address, value: TaggedValue) {
        let Some(target) = value.heap_address() else {
            return;
        };

        let holder_region = unsafe { Region::from_address(object) };
        let target_region = unsafe { Region::from_address(target) };

        if target_region.in_young_space() && !holder_region.in_young_space() {
            holder_region.insert_old_to_new(slot);
        }

        if !self.marker.is_marking() {
            return;
        }

        if target_region.in_collect_set() && !holder_region.in_collect_set() {
            holder_region.atomic_insert_cross_region(slot);
        }

        if !target_region.is_marked(target) {
            self.marker.mark_from_barrier(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::HeapConfigBuilder,
        heap::Heap,
        object_header::ObjectKind,
        region::Region,
        space::SpaceType,
        tagged_value::TaggedValue,
        visitor::NoRoots,
    };

    fn small_heap() -> Heap {
        Heap::new(
            HeapConfigBuilder::from_heap_size(64 * 1024 * 1024)
                .enable_concurrent_mark(false)
                .enable_concurrent_sweep(false)
                .build(),
        )
    }

    #[test]
    fn old_to_young_store_is_remembered() {
        let mut heap = small_heap();
        let old = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 2, 0, SpaceType::Old)
            .unwrap();
        let young = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 0, 0, SpaceType::Young)
            .unwrap();

        heap.set_field(old, 1, TaggedValue::from_address(young));

        let region = unsafe { Region::from_address(old) };
        assert!(region.old_to_new_contains(old + 16));
        assert!(!region.old_to_new_contains(old + 8));
        assert_eq!(heap.get_field(old, 1), TaggedValue::from_address(young));
    }

    #[test]
    fn young_to_young_store_is_not_remembered() {
        let mut heap = small_heap();
        let a = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 1, 0, SpaceType::Young)
            .unwrap();
        let b = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 0, 0, SpaceType::Young)
            .unwrap();

        heap.set_field(a, 0, TaggedValue::from_address(b));
        assert!(!unsafe { Region::from_address(a) }.old_to_new_contains(a + 8));
    }

    #[test]
    fn primitive_store_skips_barrier() {
        let mut heap = small_heap();
        let old = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 1, 0, SpaceType::Old)
            .unwrap();

        heap.set_field(old, 0, TaggedValue::from_i32(7));
        assert!(!unsafe { Region::from_address(old) }.old_to_new_contains(old + 8));
        assert_eq!(heap.get_field(old, 0).as_i32(), 7);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_slot_is_fatal() {
        let mut heap = small_heap();
        let object = heap
            .allocate_object(&mut NoRoots, ObjectKind::Plain, 1, 0, SpaceType::Old)
            .unwrap();
        heap.get_field(object, 1);
    }
}
