//! Error types and the fatal diagnostic path.
//!
//! Two classes of failure exist in the collector:
//! - Recoverable exhaustion, reported through `AllocError` so the runtime can
//!   turn it into a language-level error object.
//! - Invariant violations (double dispose, stale handles, a missing barrier
//!   found by verification). These go through `fatal!` and never return.

use thiserror::Error;

use crate::space::SpaceType;

/// Result type for allocations
pub type AllocResult<T> = Result<T, AllocError>;

/// Allocation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No space could satisfy the request after every collection was tried, or
    /// objects promoted during a collection overflowed their space.
    #[error("out of memory: failed to allocate {size} bytes in {space:?} space")]
    OutOfMemory { size: usize, space: SpaceType },
    /// The heap refused to grow past an administrative cap.
    #[error("heap limit reached: {limit} bytes committed in {space:?} space")]
    HeapLimit { limit: usize, space: SpaceType },
}

impl AllocError {
    pub fn oom(size: usize, space: SpaceType) -> AllocError {
        AllocError::OutOfMemory { size, space }
    }

    /// Whether the runtime should report this error as an out of memory error.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, AllocError::OutOfMemory { .. } | AllocError::HeapLimit { .. })
    }
}

/// Misuse of the global handle table reported by the non-fatal query paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GlobalHandleError {
    #[error("global handle {index} was already disposed")]
    Disposed { index: u32 },
    #[error("global handle {index} is out of range")]
    OutOfRange { index: u32 },
}

/// Abort the process after an invariant violation has been logged.
///
/// Test builds and the `fatal_panic` feature panic instead so violations can be
/// asserted on.
#[cold]
#[inline(never)]
pub fn abort_with(message: &str) -> ! {
    if cfg!(any(test, feature = "fatal_panic")) {
        panic!("fatal: {message}");
    }

    std::process::abort()
}

/// Log an invariant violation and abort.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::tracing::error!(target: "kiln_gc", "{}", message);
        $crate::error::abort_with(&message)
    }};
}
