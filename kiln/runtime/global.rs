//! Typed global handles.
//!
//! A global roots a value independently of the handle scopes, until it is
//! disposed. Weak globals do not keep their target alive and read undefined
//! once it has been collected.

use std::{fmt, marker::PhantomData};

use kiln_gc::{GlobalHandle, GlobalHandleTable, TaggedValue, WeakCallback};

use super::{stack::HandleContents, Context, Handle};

pub struct Global<T = TaggedValue> {
    handle: GlobalHandle,
    phantom_data: PhantomData<fn() -> T>,
}

impl<T: HandleContents> Global<T> {
    /// Create a strong global holding the current value of `handle`.
    pub fn new(cx: &Context, handle: Handle<T>) -> Global<T> {
        Self::from_value(cx, handle.value(cx))
    }

    pub fn from_value(cx: &Context, value: TaggedValue) -> Global<T> {
        Self::from_value_in(cx.heap.gc_heap(), value)
    }

    /// Used while the context is still being built.
    pub(crate) fn from_value_in(gc_heap: &kiln_gc::Heap, value: TaggedValue) -> Global<T> {
        Global {
            handle: gc_heap.global_handles().new_global(value),
            phantom_data: PhantomData,
        }
    }

    /// Root the current value in the current handle scope.
    pub fn to_handle(&self, cx: &mut Context) -> Handle<T> {
        let value = self.value(cx);
        cx.handle(value).cast()
    }

    /// The current value. Undefined if the global is weak and its target died.
    pub fn value(&self, cx: &Context) -> TaggedValue {
        table(cx).get(self.handle)
    }

    pub fn set(&self, cx: &Context, handle: Handle<T>) {
        table(cx).set(self.handle, handle.value(cx));
    }

    pub fn set_weak(&self, cx: &Context) {
        table(cx).set_weak(self.handle);
    }

    /// Make the global weak. `first_pass` runs while the collector clears the
    /// global and must not allocate; `second_pass` runs after the collection.
    pub fn set_weak_with_callback(
        &self,
        cx: &Context,
        first_pass: Option<WeakCallback>,
        second_pass: Option<WeakCallback>,
    ) {
        table(cx).set_weak_with_callback(self.handle, first_pass, second_pass);
    }

    pub fn clear_weak(&self, cx: &Context) {
        table(cx).clear_weak(self.handle);
    }

    pub fn is_weak(&self, cx: &Context) -> bool {
        table(cx).is_weak(self.handle)
    }

    /// Release the global. Its slot may be reused by a later global.
    pub fn dispose(self, cx: &Context) {
        table(cx).dispose(self.handle);
    }

    pub fn raw(&self) -> GlobalHandle {
        self.handle
    }
}

impl<T> fmt::Debug for Global<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Global({:?})", self.handle)
    }
}

#[inline]
fn table(cx: &Context) -> &GlobalHandleTable {
    cx.heap.gc_heap().global_handles()
}
