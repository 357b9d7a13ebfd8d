/// Default total heap size when none is given, in bytes.
pub const DEFAULT_HEAP_SIZE: usize = 256 * 1024 * 1024;
