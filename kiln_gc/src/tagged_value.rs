//! Tagged values - the uniform 64-bit representation of every managed value.
//!
//! Encoding (NaN-boxing):
//! - top 16 bits `0xFFFF`: a 32-bit integer in the low bits
//! - top 16 bits `0x0000` and no special tag bits: an 8-byte aligned heap address
//! - small constants for the special values (hole, null, undefined, booleans,
//!   exception)
//! - everything else: a double whose bit pattern was offset by 2^48
//!
//! The bit packing stays in this file. The rest of the crate classifies values
//! through `TaggedValue::kind` or the predicate accessors.

use core::fmt;

pub type Address = usize;

const TAG_MARK: u64 = 0xFFFF << 48;
const TAG_INT: u64 = TAG_MARK;

const TAG_SPECIAL: u64 = 0x02;
const TAG_BOOLEAN: u64 = 0x04;
const TAG_HEAP_OBJECT_MASK: u64 = TAG_MARK | TAG_SPECIAL | TAG_BOOLEAN;

const VALUE_UNDEFINED: u64 = 0x02;
const VALUE_NULL: u64 = 0x03;
const VALUE_HOLE: u64 = 0x05;
const VALUE_FALSE: u64 = 0x06;
const VALUE_TRUE: u64 = 0x07;
const VALUE_EXCEPTION: u64 = 0x0A;

const DOUBLE_ENCODE_OFFSET: u64 = 1 << 48;

/// Doubles at or above this bit pattern would reach the int tag once offset.
const IMPURE_NAN_START: u64 = 0xFFFE << 48;
const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Special singleton values. Compared by identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Special {
    Undefined,
    Null,
    Hole,
    Exception,
}

/// Decoded view of a tagged value
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    SmallInt(i32),
    Double(f64),
    Boolean(bool),
    Special(Special),
    HeapPointer(Address),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TaggedValue(u64);

impl TaggedValue {
    pub const UNDEFINED: TaggedValue = TaggedValue(VALUE_UNDEFINED);
    pub const NULL: TaggedValue = TaggedValue(VALUE_NULL);
    pub const HOLE: TaggedValue = TaggedValue(VALUE_HOLE);
    pub const TRUE: TaggedValue = TaggedValue(VALUE_TRUE);
    pub const FALSE: TaggedValue = TaggedValue(VALUE_FALSE);
    pub const EXCEPTION: TaggedValue = TaggedValue(VALUE_EXCEPTION);

    #[inline]
    pub const fn from_i32(value: i32) -> TaggedValue {
        TaggedValue(TAG_INT | (value as u32 as u64))
    }

    /// Impure NaNs (bit patterns that collide with the int tag) are replaced by
    /// the canonical quiet NaN. Every other bit pattern is kept as is.
    #[inline]
    pub fn from_f64(value: f64) -> TaggedValue {
        let mut bits = value.to_bits();
        if bits >= IMPURE_NAN_START {
            bits = CANONICAL_NAN;
        }

        TaggedValue(bits + DOUBLE_ENCODE_OFFSET)
    }

    /// Use an int when the number is integral and fits, otherwise a double.
    /// Negative zero stays a double.
    pub fn from_number(value: f64) -> TaggedValue {
        let as_int = value as i32;
        if as_int as f64 == value && !(value == 0.0 && value.is_sign_negative()) {
            TaggedValue::from_i32(as_int)
        } else {
            TaggedValue::from_f64(value)
        }
    }

    #[inline]
    pub const fn from_bool(value: bool) -> TaggedValue {
        if value {
            TaggedValue::TRUE
        } else {
            TaggedValue::FALSE
        }
    }

    /// Wrap a heap address. The address must be non-null and 8-byte aligned.
    #[inline]
    pub fn from_address(addr: Address) -> TaggedValue {
        debug_assert!(addr != 0 && addr & 0x7 == 0, "misaligned heap address {addr:#x}");
        TaggedValue(addr as u64)
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> TaggedValue {
        TaggedValue(raw)
    }

    #[inline]
    pub(crate) const fn raw(self) -> u64 {
        self.0
    }

    // ========================================================================
    // Classification
    // ========================================================================

    #[inline]
    pub const fn is_int(self) -> bool {
        (self.0 & TAG_MARK) == TAG_INT
    }

    #[inline]
    pub const fn is_double(self) -> bool {
        let tag = self.0 & TAG_MARK;
        tag != 0 && tag != TAG_INT
    }

    #[inline]
    pub const fn is_number(self) -> bool {
        (self.0 & TAG_MARK) != 0
    }

    #[inline]
    pub const fn is_heap_object(self) -> bool {
        (self.0 & TAG_HEAP_OBJECT_MASK) == 0 && self.0 != 0
    }

    #[inline]
    pub const fn is_boolean(self) -> bool {
        self.0 == VALUE_TRUE || self.0 == VALUE_FALSE
    }

    #[inline]
    pub const fn is_undefined(self) -> bool {
        self.0 == VALUE_UNDEFINED
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == VALUE_NULL
    }

    #[inline]
    pub const fn is_hole(self) -> bool {
        self.0 == VALUE_HOLE
    }

    #[inline]
    pub const fn is_exception(self) -> bool {
        self.0 == VALUE_EXCEPTION
    }

    #[inline]
    pub const fn is_nullish(self) -> bool {
        self.is_undefined() || self.is_null()
    }

    /// Decode into the sum type. Raw zero never appears in initialized memory
    /// and decodes as a hole.
    pub fn kind(self) -> Value {
        if self.is_int() {
            Value::SmallInt(self.as_i32())
        } else if self.is_double() {
            Value::Double(self.as_f64())
        } else if self.is_heap_object() {
            Value::HeapPointer(self.0 as Address)
        } else {
            match self.0 {
                VALUE_TRUE => Value::Boolean(true),
                VALUE_FALSE => Value::Boolean(false),
                VALUE_UNDEFINED => Value::Special(Special::Undefined),
                VALUE_NULL => Value::Special(Special::Null),
                VALUE_EXCEPTION => Value::Special(Special::Exception),
                _ => Value::Special(Special::Hole),
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub const fn as_i32(self) -> i32 {
        debug_assert!(self.is_int());
        self.0 as u32 as i32
    }

    #[inline]
    pub fn as_f64(self) -> f64 {
        debug_assert!(self.is_double());
        f64::from_bits(self.0 - DOUBLE_ENCODE_OFFSET)
    }

    #[inline]
    pub const fn as_bool(self) -> bool {
        self.0 == VALUE_TRUE
    }

    /// The heap address of a heap pointer, `None` for every other kind.
    #[inline]
    pub const fn heap_address(self) -> Option<Address> {
        if self.is_heap_object() {
            Some(self.0 as Address)
        } else {
            None
        }
    }

    /// Numeric value of an int or double.
    #[inline]
    pub fn number(self) -> Option<f64> {
        if self.is_int() {
            Some(self.as_i32() as f64)
        } else if self.is_double() {
            Some(self.as_f64())
        } else {
            None
        }
    }

    // ========================================================================
    // Conversions
    // ========================================================================

    /// ToBoolean for values that need no heap access. Heap objects are truthy;
    /// the runtime special cases strings.
    pub fn to_boolean(self) -> bool {
        match self.kind() {
            Value::SmallInt(i) => i != 0,
            Value::Double(d) => !(d == 0.0 || d.is_nan()),
            Value::Boolean(b) => b,
            Value::Special(_) => false,
            Value::HeapPointer(_) => true,
        }
    }

    /// ToNumber for values that need no heap access. Returns `None` for heap
    /// pointers, whose conversion belongs to the object layer.
    pub fn to_number(self) -> Option<f64> {
        match self.kind() {
            Value::SmallInt(i) => Some(i as f64),
            Value::Double(d) => Some(d),
            Value::Boolean(b) => Some(if b { 1.0 } else { 0.0 }),
            Value::Special(Special::Null) => Some(0.0),
            Value::Special(_) => Some(f64::NAN),
            Value::HeapPointer(_) => None,
        }
    }

    /// ToInt32: truncate and wrap modulo 2^32.
    pub fn to_int32(self) -> Option<i32> {
        if self.is_int() {
            return Some(self.as_i32());
        }

        self.to_number().map(double_to_int32)
    }

    // ========================================================================
    // Comparison
    // ========================================================================

    /// SameValue: numbers compare by bit pattern (so +0 and -0 differ) with
    /// all NaNs equal, everything else by identity.
    pub fn same_value(self, other: TaggedValue) -> bool {
        match (self.number(), other.number()) {
            (Some(a), Some(b)) => {
                if a.is_nan() && b.is_nan() {
                    true
                } else {
                    a.to_bits() == b.to_bits()
                }
            }
            (None, None) => self.0 == other.0,
            _ => false,
        }
    }

    /// Strict equality: +0 equals -0 and NaN never equals itself.
    pub fn strict_equals(self, other: TaggedValue) -> bool {
        match (self.number(), other.number()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.0 == other.0,
            _ => false,
        }
    }
}

impl Default for TaggedValue {
    fn default() -> Self {
        TaggedValue::UNDEFINED
    }
}

impl From<Value> for TaggedValue {
    fn from(value: Value) -> Self {
        match value {
            Value::SmallInt(i) => TaggedValue::from_i32(i),
            Value::Double(d) => TaggedValue::from_f64(d),
            Value::Boolean(b) => TaggedValue::from_bool(b),
            Value::Special(Special::Undefined) => TaggedValue::UNDEFINED,
            Value::Special(Special::Null) => TaggedValue::NULL,
            Value::Special(Special::Hole) => TaggedValue::HOLE,
            Value::Special(Special::Exception) => TaggedValue::EXCEPTION,
            Value::HeapPointer(addr) => TaggedValue::from_address(addr),
        }
    }
}

impl fmt::Debug for TaggedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Value::SmallInt(i) => write!(f, "Int({i})"),
            Value::Double(d) => write!(f, "Double({d}, {:#018x})", d.to_bits()),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Special(s) => write!(f, "{s:?}"),
            Value::HeapPointer(addr) => write!(f, "Object({addr:#x})"),
        }
    }
}

/// Truncate a double and wrap it into the int32 range.
pub fn double_to_int32(d: f64) -> i32 {
    if !d.is_finite() {
        return 0;
    }

    let truncated = d.trunc();
    if truncated >= i32::MIN as f64 && truncated <= i32::MAX as f64 {
        return truncated as i32;
    }

    let modulo = truncated.rem_euclid(4294967296.0);
    (modulo as u64 as u32) as i32
}
