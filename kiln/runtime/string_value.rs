//! Flat UTF-8 strings.
//!
//! Layout: no tagged slots, then the byte length as a little-endian u64,
//! then the bytes.

use kiln_gc::{fatal, Address, ObjectKind, SpaceType, TaggedValue};

use super::{error::EvalResult, stack::HandleContents, Context, Handle};

const LENGTH_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StringValue(Address);

impl StringValue {
    #[inline]
    pub fn address(self) -> Address {
        self.0
    }

    pub fn len(self, cx: &Context) -> usize {
        let payload = cx.heap.gc_heap().payload(self.0);
        let mut length = [0; LENGTH_SIZE];
        length.copy_from_slice(&payload[..LENGTH_SIZE]);
        u64::from_le_bytes(length) as usize
    }

    pub fn is_empty(self, cx: &Context) -> bool {
        self.len(cx) == 0
    }

    pub fn as_str(self, cx: &Context) -> &str {
        let length = self.len(cx);
        let bytes = &cx.heap.gc_heap().payload(self.0)[LENGTH_SIZE..LENGTH_SIZE + length];
        match std::str::from_utf8(bytes) {
            Ok(str) => str,
            Err(_) => fatal!("string {:#x} holds invalid UTF-8", self.0),
        }
    }

    /// Compare contents, not identity
    pub fn equals(self, cx: &Context, other: StringValue) -> bool {
        self == other || self.as_str(cx) == other.as_str(cx)
    }
}

impl HandleContents for StringValue {
    #[inline]
    fn from_tagged(value: TaggedValue) -> Self {
        match value.heap_address() {
            Some(addr) => StringValue(addr),
            None => fatal!("expected a string, found {value:?}"),
        }
    }

    #[inline]
    fn to_tagged(self) -> TaggedValue {
        TaggedValue::from_address(self.0)
    }
}

impl Context {
    /// Allocate a young string holding a copy of `str`.
    pub fn alloc_string(&mut self, str: &str) -> EvalResult<Handle<StringValue>> {
        self.alloc_string_in(str, SpaceType::Young)
    }

    /// Allocate a string in a specific space. Strings too large for a regular
    /// region end up in huge object space whatever `space` says.
    pub fn alloc_string_in(
        &mut self,
        str: &str,
        space: SpaceType,
    ) -> EvalResult<Handle<StringValue>> {
        let addr = self.alloc_raw(ObjectKind::String, 0, LENGTH_SIZE + str.len(), space)?;
        write_string(self.heap.gc_heap_mut(), addr, str);
        Ok(self.handle(StringValue(addr)))
    }
}

/// Fill the payload of a freshly allocated string object.
pub(crate) fn write_string(heap: &mut kiln_gc::Heap, addr: Address, str: &str) {
    let payload = heap.payload_mut(addr);
    payload[..LENGTH_SIZE].copy_from_slice(&(str.len() as u64).to_le_bytes());
    payload[LENGTH_SIZE..LENGTH_SIZE + str.len()].copy_from_slice(str.as_bytes());
}

pub(crate) const fn string_payload_size(str: &str) -> usize {
    LENGTH_SIZE + str.len()
}
