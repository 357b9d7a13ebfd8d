//! kiln - a managed-language runtime core
//!
//! The runtime layer over the `kiln_gc` collector: an explicit `Context` owning
//! the heap, a scoped handle stack whose slots are the collector's roots, typed
//! global handles and the handful of object types the runtime itself needs.
//!
//! ```ignore
//! let mut cx = Context::new(OptionsBuilder::new().build());
//! let mut scope = HandleScope::new(&mut cx);
//! let greeting = scope.alloc_string("hello")?;
//! scope.collect_garbage(GcType::Full)?;
//! assert_eq!(greeting.get(&scope).as_str(&scope), "hello");
//! ```

pub mod common;
pub mod runtime;

pub use common::options::{Options, OptionsBuilder};
pub use runtime::{
    Context, ErrorKind, ErrorObject, EvalResult, Global, Handle, HandleScope, ObjectValue,
    StringValue,
};

pub use kiln_gc::{GcStats, GcType, HeapConfig, HeapConfigBuilder, SpaceType, TaggedValue};
