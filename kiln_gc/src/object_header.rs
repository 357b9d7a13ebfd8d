//! Object header and object layout.
//!
//! Every managed object starts with one header word:
//! Layout: | header | tagged slot 0 | tagged slot 1 | ... | raw payload bytes |
//!
//! Header word bits:
//! - bit 0: forwarded flag. When set, the rest of the word is the new address
//! - bits 1..8: object kind
//! - bits 8..32: number of tagged slots
//! - bits 32..64: total object size in bytes, header included
//!
//! The collector traces an object by reading its slot count, so no external type
//! information is needed. Free memory inside sparse regions is covered by `Free`
//! filler objects, which keeps every region walkable from start to top.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::tagged_value::{Address, TaggedValue};

pub const HEADER_SIZE: usize = 8;
pub const SLOT_SIZE: usize = 8;
pub const OBJECT_ALIGNMENT: usize = 8;

const FORWARDED_BIT: u64 = 1;
const KIND_SHIFT: u64 = 1;
const KIND_MASK: u64 = 0x7F;
const SLOT_COUNT_SHIFT: u64 = 8;
const SLOT_COUNT_MASK: u64 = 0xFF_FFFF;
const SIZE_SHIFT: u64 = 32;

/// Largest number of tagged slots a single object may carry
pub const MAX_SLOT_COUNT: usize = SLOT_COUNT_MASK as usize;

/// Kind of a heap object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    /// An ordinary object made of tagged slots
    Plain = 0,
    /// Raw string bytes, no tagged slots
    String = 1,
    /// Dense array of tagged slots
    Array = 2,
    /// Error object: message and error kind slots
    Error = 3,
    /// Filler covering free memory
    Free = 4,
    /// Opaque machine code bytes
    MachineCode = 5,
}

impl ObjectKind {
    fn from_bits(bits: u8) -> ObjectKind {
        match bits {
            0 => ObjectKind::Plain,
            1 => ObjectKind::String,
            2 => ObjectKind::Array,
            3 => ObjectKind::Error,
            4 => ObjectKind::Free,
            5 => ObjectKind::MachineCode,
            _ => crate::fatal!("corrupt object header kind {bits}"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader(u64);

impl ObjectHeader {
    #[inline]
    pub fn new(kind: ObjectKind, size: usize, slot_count: usize) -> ObjectHeader {
        debug_assert!(size % OBJECT_ALIGNMENT == 0 && size >= HEADER_SIZE);
        debug_assert!(slot_count <= MAX_SLOT_COUNT);
        debug_assert!(HEADER_SIZE + slot_count * SLOT_SIZE <= size);

        ObjectHeader(
            ((size as u64) << SIZE_SHIFT)
                | ((slot_count as u64 & SLOT_COUNT_MASK) << SLOT_COUNT_SHIFT)
                | ((kind as u64 & KIND_MASK) << KIND_SHIFT),
        )
    }

    #[inline]
    pub fn forwarding(new_addr: Address) -> ObjectHeader {
        ObjectHeader(new_addr as u64 | FORWARDED_BIT)
    }

    #[inline]
    pub fn is_forwarded(self) -> bool {
        self.0 & FORWARDED_BIT != 0
    }

    #[inline]
    pub fn forwarding_address(self) -> Address {
        debug_assert!(self.is_forwarded());
        (self.0 & !FORWARDED_BIT) as Address
    }

    #[inline]
    pub fn size(self) -> usize {
        debug_assert!(!self.is_forwarded());
        (self.0 >> SIZE_SHIFT) as usize
    }

    #[inline]
    pub fn slot_count(self) -> usize {
        debug_assert!(!self.is_forwarded());
        ((self.0 >> SLOT_COUNT_SHIFT) & SLOT_COUNT_MASK) as usize
    }

    #[inline]
    pub fn kind(self) -> ObjectKind {
        ObjectKind::from_bits(((self.0 >> KIND_SHIFT) & KIND_MASK) as u8)
    }

    #[inline]
    pub fn is_free(self) -> bool {
        !self.is_forwarded() && self.kind() == ObjectKind::Free
    }
}

impl core::fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_forwarded() {
            write!(f, "Forwarded({:#x})", self.forwarding_address())
        } else {
            f.debug_struct("ObjectHeader")
                .field("kind", &self.kind())
                .field("size", &self.size())
                .field("slot_count", &self.slot_count())
                .finish()
        }
    }
}

/// Total aligned size of an object with the given number of slots and raw bytes.
#[inline]
pub const fn object_size(slot_count: usize, raw_bytes: usize) -> usize {
    align_up(HEADER_SIZE + slot_count * SLOT_SIZE + raw_bytes, OBJECT_ALIGNMENT)
}

#[inline]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

#[inline]
pub fn slot_address(object: Address, index: usize) -> Address {
    object + HEADER_SIZE + index * SLOT_SIZE
}

// ============================================================================
// Raw memory access
//
// Every function below requires `object` (or `slot`) to point into memory
// owned by a live Region of the heap.
// ============================================================================

#[inline]
unsafe fn word<'a>(addr: Address) -> &'a AtomicU64 {
    &*(addr as *const AtomicU64)
}

#[inline]
pub(crate) unsafe fn load_header(object: Address) -> ObjectHeader {
    ObjectHeader(word(object).load(Ordering::Acquire))
}

#[inline]
pub(crate) unsafe fn store_header(object: Address, header: ObjectHeader) {
    word(object).store(header.0, Ordering::Release)
}

#[inline]
pub(crate) unsafe fn load_slot(slot: Address) -> TaggedValue {
    TaggedValue::from_raw(word(slot).load(Ordering::Acquire))
}

#[inline]
pub(crate) unsafe fn store_slot(slot: Address, value: TaggedValue) {
    word(slot).store(value.raw(), Ordering::Release)
}

/// Write a header and fill every tagged slot with undefined. Raw payload bytes
/// are left as they are (fresh regions are zeroed).
pub(crate) unsafe fn initialize(object: Address, kind: ObjectKind, size: usize, slot_count: usize) {
    for index in 0..slot_count {
        store_slot(slot_address(object, index), TaggedValue::UNDEFINED);
    }
    store_header(object, ObjectHeader::new(kind, size, slot_count));
}

/// Cover `[addr, addr + size)` with a filler object.
#[inline]
pub(crate) unsafe fn write_filler(addr: Address, size: usize) {
    store_header(addr, ObjectHeader::new(ObjectKind::Free, size, 0));
}

/// Copy a whole object to `to` and leave a forwarding header at `from`.
pub(crate) unsafe fn move_object(from: Address, to: Address, size: usize) {
    core::ptr::copy_nonoverlapping(from as *const u8, to as *mut u8, size);
    store_header(from, ObjectHeader::forwarding(to));
}

/// Raw payload bytes following the tagged slots.
pub(crate) unsafe fn payload<'a>(object: Address) -> &'a [u8] {
    let header = load_header(object);
    let start = slot_address(object, header.slot_count());
    let len = object + header.size() - start;
    core::slice::from_raw_parts(start as *const u8, len)
}

pub(crate) unsafe fn payload_mut<'a>(object: Address) -> &'a mut [u8] {
    let header = load_header(object);
    let start = slot_address(object, header.slot_count());
    let len = object + header.size() - start;
    core::slice::from_raw_parts_mut(start as *mut u8, len)
}
