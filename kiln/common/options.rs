use std::fmt::Write;

use kiln_gc::{HeapConfig, HeapConfigBuilder};
use parking_lot::{Mutex, MutexGuard};

use super::constants::DEFAULT_HEAP_SIZE;

/// Options passed throughout the runtime.
pub struct Options {
    /// The heap size to use in bytes. Every space is sized from it unless
    /// `heap_config` overrides the layout.
    pub heap_size: usize,

    /// Number of collector threads, 0 to pick from the number of CPUs
    pub gc_thread_num: usize,

    /// Whether old space marking may run concurrently with the mutator
    pub concurrent_mark: bool,

    /// Whether sweeping may run concurrently with the mutator
    pub concurrent_sweep: bool,

    /// Fixed old space capacity, overriding the share derived from `heap_size`
    pub old_space_capacity: Option<usize>,

    /// Complete heap layout, overriding every size above
    pub heap_config: Option<HeapConfig>,

    /// Print GC statistics when the context is dropped
    pub expose_gc_stats: bool,

    /// Run a young collection on every young allocation. Only honored when
    /// built with the `gc_stress_test` feature.
    pub gc_stress_test: bool,

    /// Buffer to write all dumped output into instead of stdout
    pub dump_buffer: Option<Mutex<String>>,
}

impl Options {
    pub fn dump_buffer(&self) -> Option<MutexGuard<'_, String>> {
        self.dump_buffer.as_ref().map(|buffer| buffer.lock())
    }

    /// Write a line of dumped output to the dump buffer, or stdout if there is none.
    pub fn dump(&self, line: &str) {
        match self.dump_buffer() {
            Some(mut buffer) => {
                let _ = writeln!(buffer, "{line}");
            }
            None => println!("{line}"),
        }
    }

    /// The heap configuration these options describe.
    pub fn heap_config(&self) -> HeapConfig {
        if let Some(config) = &self.heap_config {
            return config.clone();
        }

        let mut builder = HeapConfigBuilder::from_heap_size(self.heap_size)
            .gc_thread_num(self.gc_thread_num)
            .enable_concurrent_mark(self.concurrent_mark)
            .enable_concurrent_sweep(self.concurrent_sweep);

        if let Some(capacity) = self.old_space_capacity {
            builder = builder.old_space_capacity(capacity);
        }

        builder.build()
    }
}

impl Default for Options {
    /// Create a new options struct with default values.
    fn default() -> Self {
        OptionsBuilder::new().build()
    }
}

pub struct OptionsBuilder(Options);

impl OptionsBuilder {
    /// Create new options with default values.
    pub fn new() -> Self {
        Self(Options {
            heap_size: DEFAULT_HEAP_SIZE,
            gc_thread_num: 0,
            concurrent_mark: true,
            concurrent_sweep: true,
            old_space_capacity: None,
            heap_config: None,
            expose_gc_stats: false,
            gc_stress_test: false,
            dump_buffer: None,
        })
    }

    /// Return the options that have been built, consuming the builder.
    pub fn build(self) -> Options {
        self.0
    }

    pub fn heap_size(mut self, heap_size: usize) -> Self {
        self.0.heap_size = heap_size;
        self
    }

    pub fn gc_thread_num(mut self, gc_thread_num: usize) -> Self {
        self.0.gc_thread_num = gc_thread_num;
        self
    }

    pub fn concurrent_mark(mut self, concurrent_mark: bool) -> Self {
        self.0.concurrent_mark = concurrent_mark;
        self
    }

    pub fn concurrent_sweep(mut self, concurrent_sweep: bool) -> Self {
        self.0.concurrent_sweep = concurrent_sweep;
        self
    }

    pub fn old_space_capacity(mut self, old_space_capacity: usize) -> Self {
        self.0.old_space_capacity = Some(old_space_capacity);
        self
    }

    pub fn heap_config(mut self, heap_config: HeapConfig) -> Self {
        self.0.heap_config = Some(heap_config);
        self
    }

    pub fn expose_gc_stats(mut self, expose_gc_stats: bool) -> Self {
        self.0.expose_gc_stats = expose_gc_stats;
        self
    }

    pub fn gc_stress_test(mut self, gc_stress_test: bool) -> Self {
        self.0.gc_stress_test = gc_stress_test;
        self
    }

    pub fn dump_buffer(mut self, dump_buffer: Option<Mutex<String>>) -> Self {
        self.0.dump_buffer = dump_buffer;
        self
    }
}
