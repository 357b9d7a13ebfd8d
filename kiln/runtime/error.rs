//! Error objects and the result type of fallible runtime operations.
//!
//! Failures that reach script code are error objects on the managed heap. An
//! allocation that fails after every collection was tried is reported with the
//! out of memory error object allocated when the context was created, since
//! allocating a fresh error at that point would fail too.

use std::fmt;

use kiln_gc::{fatal, Address, AllocError, AllocResult, ObjectKind, SpaceType, TaggedValue};
use tracing::warn;

use super::{
    stack::HandleContents,
    string_value::{string_payload_size, write_string, StringValue},
    Context, Handle, HandleContext, Heap,
};

/// Result of a fallible runtime operation. The error is a rooted error object.
pub type EvalResult<T> = Result<T, Handle<ErrorObject>>;

const KIND_SLOT: usize = 0;
const MESSAGE_SLOT: usize = 1;
const ERROR_SLOT_COUNT: usize = 2;

pub(crate) const OUT_OF_MEMORY_MESSAGE: &str = "out of memory";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    RangeError,
    TypeError,
    InternalError,
    OutOfMemory,
}

impl ErrorKind {
    fn from_i32(value: i32) -> ErrorKind {
        match value {
            0 => ErrorKind::Error,
            1 => ErrorKind::RangeError,
            2 => ErrorKind::TypeError,
            3 => ErrorKind::InternalError,
            4 => ErrorKind::OutOfMemory,
            _ => fatal!("invalid error kind {value}"),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::OutOfMemory => "OutOfMemoryError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error object: its kind and a message string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorObject(Address);

impl ErrorObject {
    #[inline]
    pub fn address(self) -> Address {
        self.0
    }

    pub fn kind(self, cx: &Context) -> ErrorKind {
        ErrorKind::from_i32(cx.heap.gc_heap().get_field(self.0, KIND_SLOT).as_i32())
    }

    pub fn message(self, cx: &Context) -> &str {
        let message = cx.heap.gc_heap().get_field(self.0, MESSAGE_SLOT);
        StringValue::from_tagged(message).as_str(cx)
    }

    pub fn is_out_of_memory(self, cx: &Context) -> bool {
        self.kind(cx) == ErrorKind::OutOfMemory
    }

    /// `Kind: message`
    pub fn to_display_string(self, cx: &Context) -> String {
        format!("{}: {}", self.kind(cx), self.message(cx))
    }
}

impl HandleContents for ErrorObject {
    #[inline]
    fn from_tagged(value: TaggedValue) -> Self {
        match value.heap_address() {
            Some(addr) => ErrorObject(addr),
            None => fatal!("expected an error object, found {value:?}"),
        }
    }

    #[inline]
    fn to_tagged(self) -> TaggedValue {
        TaggedValue::from_address(self.0)
    }
}

impl Context {
    /// Allocate an error object with a fresh message string.
    pub fn alloc_error(&mut self, kind: ErrorKind, message: &str) -> EvalResult<Handle<ErrorObject>> {
        let message = self.alloc_string(message)?;
        let addr = self.alloc_raw(ObjectKind::Error, ERROR_SLOT_COUNT, 0, SpaceType::Young)?;

        let heap = self.heap.gc_heap();
        heap.set_field(addr, KIND_SLOT, TaggedValue::from_i32(kind as i32));
        heap.set_field(addr, MESSAGE_SLOT, message.value(self));

        Ok(self.handle(ErrorObject(addr)))
    }

    /// The preallocated out of memory error, rooted in the current scope.
    pub fn oom_error(&mut self) -> Handle<ErrorObject> {
        let value = self.oom_error.value(self);
        self.handle(value).cast()
    }

    /// Turn a failed allocation into the out of memory error object.
    pub(crate) fn check_alloc<T>(&mut self, result: AllocResult<T>) -> EvalResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => Err(self.report_alloc_error(error)),
        }
    }

    #[cold]
    fn report_alloc_error(&mut self, error: AllocError) -> Handle<ErrorObject> {
        warn!(%error, "allocation failed after every collection was tried");

        #[cfg(feature = "alloc_error")]
        {
            self.oom_error()
        }

        #[cfg(not(feature = "alloc_error"))]
        {
            panic!("Ran out of heap memory: {error}");
        }
    }
}

/// Allocate the out of memory error in non-movable space while the context is
/// being built. Failure here leaves the runtime unable to report OOM at all.
pub(crate) fn preallocate_oom_error(heap: &mut Heap, handles: &mut HandleContext) -> Address {
    let saved_top = handles.top();

    let message = match heap.alloc(
        handles,
        ObjectKind::String,
        0,
        string_payload_size(OUT_OF_MEMORY_MESSAGE),
        SpaceType::NonMovable,
    ) {
        Ok(addr) => addr,
        Err(error) => fatal!("failed to preallocate the out of memory message: {error}"),
    };
    write_string(heap.gc_heap_mut(), message, OUT_OF_MEMORY_MESSAGE);
    handles.push(TaggedValue::from_address(message));

    let error = match heap.alloc(
        handles,
        ObjectKind::Error,
        ERROR_SLOT_COUNT,
        0,
        SpaceType::NonMovable,
    ) {
        Ok(addr) => addr,
        Err(error) => fatal!("failed to preallocate the out of memory error: {error}"),
    };

    let gc_heap = heap.gc_heap();
    gc_heap.set_field(error, KIND_SLOT, TaggedValue::from_i32(ErrorKind::OutOfMemory as i32));
    gc_heap.set_field(error, MESSAGE_SLOT, TaggedValue::from_address(message));

    handles.close_scope(saved_top);
    error
}
