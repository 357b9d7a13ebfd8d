use std::sync::Arc;

use kiln_gc::{Address, GcStats, GcType, ObjectKind, SpaceType, TaggedValue};
use tracing::{debug, info};

use crate::common::options::Options;

use super::{
    error::{preallocate_oom_error, ErrorObject, EvalResult},
    gc::Heap,
    global::Global,
    stack::HandleContext,
};

/// A runtime context: the heap, the handle stack and the objects every
/// context needs. Contexts are independent of each other and several may
/// coexist in one process.
pub struct Context {
    options: Arc<Options>,

    pub(crate) heap: Heap,

    pub(crate) handles: HandleContext,

    /// Reported when an allocation fails after every collection was tried
    pub(crate) oom_error: Global<ErrorObject>,
}

impl Context {
    /// Create a context. Initialization order is options, heap, handle stack,
    /// then the preallocated out of memory error.
    pub fn new(options: Options) -> Context {
        let options = Arc::new(options);
        let mut heap = Heap::new(&options);
        let mut handles = HandleContext::new();

        let oom_error = preallocate_oom_error(&mut heap, &mut handles);
        let oom_error = Global::from_value_in(heap.gc_heap(), TaggedValue::from_address(oom_error));

        info!(
            heap_size = options.heap_size,
            concurrent_mark = options.concurrent_mark,
            concurrent_sweep = options.concurrent_sweep,
            "context created"
        );

        Context {
            options,
            heap,
            handles,
            oom_error,
        }
    }

    pub fn options(&self) -> &Arc<Options> {
        &self.options
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn handle_context(&self) -> &HandleContext {
        &self.handles
    }

    #[cfg(feature = "handle_stats")]
    pub fn handle_stats(&self) -> super::stack::HandleStats {
        self.handles.handle_stats()
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.heap.gc_heap().stats()
    }

    /// Allocate a raw object, collecting as needed. Fails with the out of
    /// memory error object once every collection has been tried.
    pub(crate) fn alloc_raw(
        &mut self,
        kind: ObjectKind,
        slot_count: usize,
        raw_bytes: usize,
        space: SpaceType,
    ) -> EvalResult<Address> {
        let result = self
            .heap
            .alloc(&mut self.handles, kind, slot_count, raw_bytes, space);
        self.check_alloc(result)
    }

    // ========================================================================
    // Administrative GC interface
    // ========================================================================

    /// Run a collection to completion. Objects promoted by the collection may
    /// overflow old space, reported as the out of memory error.
    pub fn collect_garbage(&mut self, gc_type: GcType) -> EvalResult<()> {
        let result = self.heap.run_gc(&mut self.handles, gc_type);
        self.check_alloc(result)
    }

    /// Switch between foreground and background GC tuning.
    pub fn change_gc_params(&mut self, in_background: bool) {
        self.heap.gc_heap_mut().change_gc_params(in_background);
    }

    pub fn notify_memory_pressure(&mut self, in_pressure: bool) {
        self.heap.gc_heap_mut().notify_memory_pressure(in_pressure);
    }

    /// Use an idle period for GC work. Returns whether a collection ran.
    pub fn trigger_idle_collection(&mut self, idle_micros: u64) -> EvalResult<bool> {
        let result = self
            .heap
            .gc_heap_mut()
            .trigger_idle_collection(&mut self.handles, idle_micros);
        self.check_alloc(result)
    }

    /// Write GC and handle statistics to the dump output.
    pub fn dump_gc_stats(&self) {
        let stats = self.gc_stats();
        let gc_heap = self.heap.gc_heap();

        self.options.dump(&format!(
            "gc: young {}, partial {}, full {}, concurrent marks {}",
            stats.young_gc_count,
            stats.partial_gc_count,
            stats.full_gc_count,
            stats.concurrent_mark_count
        ));
        self.options.dump(&format!(
            "pause: total {:?}, max {:?}",
            stats.total_pause, stats.max_pause
        ));
        self.options.dump(&format!(
            "heap: {} bytes live, {} bytes committed, peak {} bytes",
            gc_heap.heap_object_size(),
            gc_heap.committed_size(),
            stats.peak_heap_object_size
        ));

        #[cfg(feature = "handle_stats")]
        {
            let handle_stats = self.handle_stats();
            self.options.dump(&format!(
                "handles: {} live, {} max",
                handle_stats.num_handles, handle_stats.max_handles
            ));
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.options.expose_gc_stats {
            self.dump_gc_stats();
        }

        debug!(gc_count = self.gc_stats().gc_count(), "context dropped");
    }
}
