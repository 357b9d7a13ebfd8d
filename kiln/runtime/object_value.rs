use kiln_gc::{fatal, Address, ObjectKind, SpaceType, TaggedValue};

use super::{error::EvalResult, stack::HandleContents, Context, Handle};

/// A plain object: a fixed number of tagged slots.
///
/// Holds a raw address, so it is only valid until the next allocation. Keep
/// objects in a `Handle<ObjectValue>` across anything that may collect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectValue(Address);

impl ObjectValue {
    #[inline]
    pub fn address(self) -> Address {
        self.0
    }

    pub fn slot_count(self, cx: &Context) -> usize {
        cx.heap.gc_heap().object_header(self.0).slot_count()
    }

    #[inline]
    pub fn get_field(self, cx: &Context, index: usize) -> TaggedValue {
        cx.heap.gc_heap().get_field(self.0, index)
    }

    /// Store into a slot through the write barrier.
    #[inline]
    pub fn set_field(self, cx: &Context, index: usize, value: TaggedValue) {
        cx.heap.gc_heap().set_field(self.0, index, value);
    }
}

impl HandleContents for ObjectValue {
    #[inline]
    fn from_tagged(value: TaggedValue) -> Self {
        match value.heap_address() {
            Some(addr) => ObjectValue(addr),
            None => fatal!("expected an object, found {value:?}"),
        }
    }

    #[inline]
    fn to_tagged(self) -> TaggedValue {
        TaggedValue::from_address(self.0)
    }
}

impl Context {
    /// Allocate a plain object with `slot_count` undefined slots.
    pub fn alloc_object(
        &mut self,
        slot_count: usize,
        space: SpaceType,
    ) -> EvalResult<Handle<ObjectValue>> {
        let addr = self.alloc_raw(ObjectKind::Plain, slot_count, 0, space)?;
        Ok(self.handle(ObjectValue(addr)))
    }

    /// Allocate an array whose elements are all undefined.
    pub fn alloc_array(&mut self, length: usize, space: SpaceType) -> EvalResult<Handle<ObjectValue>> {
        let addr = self.alloc_raw(ObjectKind::Array, length, 0, space)?;
        Ok(self.handle(ObjectValue(addr)))
    }

    #[inline]
    pub fn get_field(&self, object: Handle<ObjectValue>, index: usize) -> TaggedValue {
        object.get(self).get_field(self, index)
    }

    #[inline]
    pub fn set_field(&self, object: Handle<ObjectValue>, index: usize, value: TaggedValue) {
        object.get(self).set_field(self, index, value);
    }
}
