//! Heap - wraps kiln_gc::Heap with runtime-specific functionality
//!
//! This provides the memory allocation and GC interface for the kiln runtime.
//! Handle storage is passed in as the root context of every call that may
//! collect.

use kiln_gc::{Address, AllocResult, GcContext, GcType, ObjectKind, SpaceType};

use crate::common::options::Options;

/// Heap - wraps kiln_gc::Heap
pub struct Heap {
    /// The underlying GC heap
    gc_heap: kiln_gc::Heap,
}

impl Heap {
    pub fn new(options: &Options) -> Heap {
        #[allow(unused_mut)]
        let mut gc_heap = kiln_gc::Heap::new(options.heap_config());

        // Run a young GC on every young allocation in stress test mode
        #[cfg(feature = "gc_stress_test")]
        {
            gc_heap.gc_stress_test = options.gc_stress_test;
        }

        Heap { gc_heap }
    }

    /// Allocate an object with `slot_count` undefined slots followed by
    /// `raw_bytes` of zeroed payload.
    #[inline]
    pub fn alloc(
        &mut self,
        roots: &mut dyn GcContext,
        kind: ObjectKind,
        slot_count: usize,
        raw_bytes: usize,
        space: SpaceType,
    ) -> AllocResult<Address> {
        self.gc_heap
            .allocate_object(roots, kind, slot_count, raw_bytes, space)
    }

    /// Run a collection of the given type to completion
    pub fn run_gc(&mut self, roots: &mut dyn GcContext, gc_type: GcType) -> AllocResult<()> {
        self.gc_heap.collect_garbage(roots, gc_type)
    }

    /// Get the underlying GC heap (for advanced operations)
    pub fn gc_heap(&self) -> &kiln_gc::Heap {
        &self.gc_heap
    }

    pub fn gc_heap_mut(&mut self) -> &mut kiln_gc::Heap {
        &mut self.gc_heap
    }
}
