//! Collection statistics.

use std::time::Duration;

use crate::heap::GcType;

#[derive(Clone, Debug, Default)]
pub struct GcStats {
    pub young_gc_count: usize,
    pub partial_gc_count: usize,
    pub full_gc_count: usize,
    /// Concurrent marks started, whether or not they finished
    pub concurrent_mark_count: usize,
    pub last_gc_type: Option<GcType>,
    pub last_pause: Duration,
    pub total_pause: Duration,
    pub max_pause: Duration,
    /// Heap object bytes freed by the last collection
    pub last_freed_bytes: usize,
    /// Bytes promoted from young to old space by the last collection
    pub last_promoted_bytes: usize,
    /// Largest heap object size seen at the start of any collection
    pub peak_heap_object_size: usize,
}

impl GcStats {
    pub fn gc_count(&self) -> usize {
        self.young_gc_count + self.partial_gc_count + self.full_gc_count
    }

    pub(crate) fn record(
        &mut self,
        gc_type: GcType,
        pause: Duration,
        size_before: usize,
        size_after: usize,
        promoted_bytes: usize,
    ) {
        match gc_type {
            GcType::Young => self.young_gc_count += 1,
            GcType::Partial => self.partial_gc_count += 1,
            GcType::Full => self.full_gc_count += 1,
        }

        self.last_gc_type = Some(gc_type);
        self.last_pause = pause;
        self.total_pause += pause;
        self.max_pause = self.max_pause.max(pause);
        self.last_freed_bytes = size_before.saturating_sub(size_after);
        self.last_promoted_bytes = promoted_bytes;
        self.peak_heap_object_size = self.peak_heap_object_size.max(size_before);

        tracing::debug!(
            gc_type = ?gc_type,
            pause_us = pause.as_micros() as u64,
            before = size_before,
            after = size_after,
            promoted = promoted_bytes,
            "gc finished"
        );
    }
}
