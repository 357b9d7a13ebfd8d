//! Root visitor and GC context traits
//!
//! These traits decouple the collector from the runtime that embeds it.
//! - `RootVisitor`: implemented by each collector phase, receives root slots
//! - `GcContext`: implemented by the runtime (handle storage, intrinsics, any
//!   other native structure holding managed values), enumerates its roots
//!
//! Heap objects themselves need no tracing hooks: their header records how many
//! tagged slots they carry.

use crate::tagged_value::TaggedValue;

/// Receives root slots during a collection.
///
/// A moving phase may overwrite the slot to follow an evacuated object.
pub trait RootVisitor {
    /// Visit a single root slot
    fn visit_root(&mut self, slot: &mut TaggedValue);

    /// Visit a contiguous range of root slots
    #[inline]
    fn visit_root_range(&mut self, slots: &mut [TaggedValue]) {
        for slot in slots {
            self.visit_root(slot);
        }
    }
}

/// Implemented by the runtime to enumerate native roots.
///
/// # Example
/// ```ignore
/// impl GcContext for HandleStorage {
///     fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
///         for block in self.live_blocks_mut() {
///             visitor.visit_root_range(block);
///         }
///     }
/// }
/// ```
pub trait GcContext {
    /// Visit every root slot. Called at the start of each collection and again
    /// when a moving collection fixes up references.
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor);
}

/// A context with no roots, for heaps driven purely through global handles.
pub struct NoRoots;

impl GcContext for NoRoots {
    fn visit_roots(&mut self, _: &mut dyn RootVisitor) {}
}

/// Identifies a root provider registered with `Heap::add_root_provider`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootProviderId(pub(crate) u64);
