//! Size-classed free list for sparse spaces.
//!
//! Ranges up to 256 bytes live in exact 8-byte classes. Larger ranges are
//! bucketed by power of two. Every range on the list is covered by a filler
//! object so the owning region stays walkable.

use crate::{object_header, tagged_value::Address};

const SMALL_LIMIT: usize = 256;
const SMALL_CLASS_COUNT: usize = SMALL_LIMIT / 8 + 1;
const SMALL_LIMIT_LOG2: usize = 8;
const CLASS_COUNT: usize = SMALL_CLASS_COUNT + (usize::BITS as usize - SMALL_LIMIT_LOG2);

#[derive(Clone, Copy, Debug)]
struct FreeRange {
    addr: Address,
    size: usize,
}

pub struct FreeObjectList {
    buckets: Vec<Vec<FreeRange>>,
    available: usize,
}

impl FreeObjectList {
    pub fn new() -> FreeObjectList {
        FreeObjectList {
            buckets: (0..CLASS_COUNT).map(|_| Vec::new()).collect(),
            available: 0,
        }
    }

    #[inline]
    fn class_index(size: usize) -> usize {
        if size <= SMALL_LIMIT {
            size / 8
        } else {
            let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
            SMALL_CLASS_COUNT + log2 - SMALL_LIMIT_LOG2
        }
    }

    #[inline]
    fn is_exact_class(index: usize) -> bool {
        index < SMALL_CLASS_COUNT
    }

    /// Bytes currently on the free list
    #[inline]
    pub fn available(&self) -> usize {
        self.available
    }

    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// Add a free range, covering it with a filler object.
    ///
    /// # Safety
    /// The range must be unused memory inside a live region of the owning space.
    pub(crate) unsafe fn free(&mut self, addr: Address, size: usize) {
        if size == 0 {
            return;
        }
        debug_assert!(size % object_header::OBJECT_ALIGNMENT == 0);

        object_header::write_filler(addr, size);
        self.buckets[Self::class_index(size)].push(FreeRange { addr, size });
        self.available += size;
    }

    /// Take `size` bytes, splitting a larger range if needed.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        let start = Self::class_index(size);
        for index in start..CLASS_COUNT {
            let bucket = &mut self.buckets[index];
            if bucket.is_empty() {
                continue;
            }

            // Ranges in the starting power-of-two class may still be too small
            let position = if index == start && !Self::is_exact_class(index) {
                match bucket.iter().rposition(|range| range.size >= size) {
                    Some(position) => position,
                    None => continue,
                }
            } else {
                bucket.len() - 1
            };

            let range = bucket.swap_remove(position);
            self.available -= range.size;

            let remainder = range.size - size;
            if remainder > 0 {
                unsafe { self.free(range.addr + size, remainder) };
            }

            return Some(range.addr);
        }

        None
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.available = 0;
    }
}
