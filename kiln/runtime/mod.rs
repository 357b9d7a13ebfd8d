pub mod context;
pub mod error;
pub mod gc;
pub mod global;
pub mod object_value;
pub mod stack;
pub mod string_value;

pub use context::Context;
pub use error::{ErrorKind, ErrorObject, EvalResult};
pub use gc::Heap;
pub use global::Global;
pub use object_value::ObjectValue;
pub use stack::{Handle, HandleContents, HandleContext, HandleScope};
pub use string_value::StringValue;
