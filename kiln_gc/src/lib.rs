//! Kiln garbage collector
//!
//! A generational, region-based collector for a managed-language runtime.
//! This crate provides the memory-management core without depending on the
//! runtime's object model.
//!
//! Key types:
//! - `TaggedValue`: a 64-bit NaN-boxed value (small int, double, special, heap pointer)
//! - `Region`: aligned block of memory owned by one space
//! - `Heap`: all spaces plus the young copying collector, the concurrent marker
//!   and the concurrent sweeper
//! - `GlobalHandleTable`: strong and weak roots that outlive handle scopes
//!
//! Key traits:
//! - `RootVisitor`: implemented by collector phases, receives root slots
//! - `GcContext`: implemented by the runtime, enumerates its roots

mod barrier;
mod bitmap;
pub mod config;
pub mod error;
mod evacuator;
pub mod global_handles;
mod heap;
mod marker;
pub mod object_header;
pub mod region;
pub mod space;
mod stats;
mod sweeper;
pub mod tagged_value;
pub mod task_pool;
mod verification;
mod visitor;
mod work_queue;

pub use config::{HeapConfig, HeapConfigBuilder, MemGrowingType};
pub use error::{AllocError, AllocResult, GlobalHandleError};
pub use global_handles::{GlobalHandle, GlobalHandleTable, WeakCallback};
pub use heap::{GcPhase, GcType, Heap};
pub use object_header::{ObjectHeader, ObjectKind};
pub use space::SpaceType;
pub use stats::GcStats;
pub use tagged_value::{Address, TaggedValue, Value};
pub use visitor::{GcContext, NoRoots, RootProviderId, RootVisitor};

#[doc(hidden)]
pub use tracing;

#[cfg(test)]
mod tests;
