//! Moving collection.
//!
//! Young collection copies reachable young objects out of the from-space,
//! tracing from roots and old-to-new remembered slots. Objects that already
//! survived one young collection (below the age mark) are promoted to old space,
//! the rest are copied into the new young regions.
//!
//! Partial and full collections evacuate after a complete mark: every marked
//! object of the collection set is moved to old space, then references are
//! updated from roots, cross-region remembered slots and the moved objects.

use crate::{
    fatal,
    object_header::{load_header, load_slot, move_object, slot_address, store_slot},
    region::Region,
    space::{SemiSpace, SparseSpace},
    sweeper::RegionPtr,
    tagged_value::{Address, TaggedValue},
    visitor::RootVisitor,
};

#[inline]
fn in_collect_set(addr: Address) -> bool {
    unsafe { Region::from_address(addr) }.in_collect_set()
}

/// Current address of an object that may have been moved. `None` if it lies in
/// the collection set and was not moved, which means it died.
#[inline]
pub(crate) fn forwarded_address(addr: Address) -> Option<Address> {
    if !in_collect_set(addr) {
        return Some(addr);
    }

    let header = unsafe { load_header(addr) };
    if header.is_forwarded() {
        Some(header.forwarding_address())
    } else {
        None
    }
}

// ============================================================================
// Young collection
// ============================================================================

pub(crate) struct YoungCollector<'a> {
    semi_space: &'a mut SemiSpace,
    old_space: &'a mut SparseSpace,
    from_age_mark: Address,
    /// Copied objects whose slots still need scanning
    worklist: Vec<Address>,
    copied_bytes: usize,
    promoted_bytes: usize,
}

impl<'a> YoungCollector<'a> {
    pub(crate) fn new(
        semi_space: &'a mut SemiSpace,
        old_space: &'a mut SparseSpace,
        from_age_mark: Address,
    ) -> Self {
        YoungCollector {
            semi_space,
            old_space,
            from_age_mark,
            worklist: Vec::new(),
            copied_bytes: 0,
            promoted_bytes: 0,
        }
    }

    pub(crate) fn copied_bytes(&self) -> usize {
        self.copied_bytes
    }

    pub(crate) fn promoted_bytes(&self) -> usize {
        self.promoted_bytes
    }

    /// Copy a from-space object once, returning its new address.
    fn forward(&mut self, addr: Address) -> Address {
        let header = unsafe { load_header(addr) };
        if header.is_forwarded() {
            return header.forwarding_address();
        }

        let size = header.size();
        let region = unsafe { Region::from_address(addr) };
        let survivor = if SemiSpace::is_aged(region, addr, self.from_age_mark) {
            None
        } else {
            self.semi_space.allocate(size)
        };

        let new_addr = match survivor {
            Some(new_addr) => {
                self.copied_bytes += size;
                new_addr
            }
            None => {
                self.promoted_bytes += size;
                self.old_space.allocate_for_evacuation(size)
            }
        };

        unsafe { move_object(addr, new_addr, size) };
        self.worklist.push(new_addr);
        new_addr
    }

    /// Update one old-to-new slot, keeping the entry only while it still
    /// points into young space.
    pub(crate) fn update_remembered_slots(&mut self, slots: &[(RegionPtr, Address)]) {
        for &(region, slot) in slots {
            let holder_region = unsafe { region.get() };
            let value = unsafe { load_slot(slot) };

            let new_addr = match value.heap_address() {
                Some(target) if in_collect_set(target) => self.forward(target),
                _ => {
                    holder_region.clear_old_to_new(slot);
                    continue;
                }
            };

            unsafe { store_slot(slot, TaggedValue::from_address(new_addr)) };
            if !unsafe { Region::from_address(new_addr) }.in_young_space() {
                holder_region.clear_old_to_new(slot);
            }
        }
    }

    /// Scan copied objects until no new copies are produced.
    pub(crate) fn process_worklist(&mut self) {
        while let Some(object) = self.worklist.pop() {
            let holder_region = unsafe { Region::from_address(object) };
            let holder_is_young = holder_region.in_young_space();
            let header = unsafe { load_header(object) };

            for index in 0..header.slot_count() {
                let slot = slot_address(object, index);
                let Some(target) = unsafe { load_slot(slot) }.heap_address() else {
                    continue;
                };
                if !in_collect_set(target) {
                    continue;
                }

                let new_addr = self.forward(target);
                unsafe { store_slot(slot, TaggedValue::from_address(new_addr)) };

                // Promoted objects pointing at survivors are new old-to-new edges
                if !holder_is_young && unsafe { Region::from_address(new_addr) }.in_young_space() {
                    holder_region.insert_old_to_new(slot);
                }
            }
        }
    }
}

impl RootVisitor for YoungCollector<'_> {
    fn visit_root(&mut self, slot: &mut TaggedValue) {
        if let Some(target) = slot.heap_address() {
            if in_collect_set(target) {
                *slot = TaggedValue::from_address(self.forward(target));
            }
        }
    }
}

// ============================================================================
// Collection set evacuation
// ============================================================================

pub(crate) struct Evacuator<'a> {
    old_space: &'a mut SparseSpace,
    moved: Vec<Address>,
    moved_bytes: usize,
}

impl<'a> Evacuator<'a> {
    pub(crate) fn new(old_space: &'a mut SparseSpace) -> Self {
        Evacuator {
            old_space,
            moved: Vec::new(),
            moved_bytes: 0,
        }
    }

    /// Move every marked object of `region` to old space. Returns the bytes moved.
    pub(crate) fn evacuate_region(&mut self, region: &Region) -> usize {
        let before = self.moved_bytes;
        region.iterate_marked(|addr| {
            let size = unsafe { load_header(addr) }.size();
            let new_addr = self.old_space.allocate_for_evacuation(size);
            unsafe { move_object(addr, new_addr, size) };
            self.moved.push(new_addr);
            self.moved_bytes += size;
        });
        self.moved_bytes - before
    }

    pub(crate) fn into_moved(self) -> Vec<Address> {
        self.moved
    }
}

/// Update a slot pointing into the collection set.
///
/// Slots of live objects must point at moved objects; finding an unmoved one
/// means a reference escaped both the marker and the write barrier. Slots from
/// remembered sets may belong to dead holders and are left alone.
#[inline]
pub(crate) fn update_slot(slot: Address, strict: bool) {
    let Some(target) = unsafe { load_slot(slot) }.heap_address() else {
        return;
    };

    match forwarded_address(target) {
        Some(new_addr) => {
            if new_addr != target {
                unsafe { store_slot(slot, TaggedValue::from_address(new_addr)) };
            }
        }
        None if strict => {
            fatal!("slot {slot:#x} of a live object references unmarked object {target:#x}")
        }
        None => {}
    }
}

/// Update the slots of every moved object.
pub(crate) fn update_moved_objects(moved: &[Address]) {
    for &object in moved {
        let header = unsafe { load_header(object) };
        for index in 0..header.slot_count() {
            update_slot(slot_address(object, index), true);
        }
    }
}

/// Update cross-region remembered slots of a region outside the collection
/// set, then drop the entries.
pub(crate) fn update_cross_region_slots(region: &Region) {
    region.iterate_cross_region(|slot| update_slot(slot, false));
    region.clear_cross_region();
}

/// Root visitor that follows forwarding addresses.
pub(crate) struct ReferenceUpdater;

impl RootVisitor for ReferenceUpdater {
    fn visit_root(&mut self, slot: &mut TaggedValue) {
        let Some(target) = slot.heap_address() else {
            return;
        };

        match forwarded_address(target) {
            Some(new_addr) => *slot = TaggedValue::from_address(new_addr),
            None => fatal!("root references unmarked object {target:#x}"),
        }
    }
}
