//! Atomic bitmap shared by mark bits and remembered sets.
//!
//! Bits are set and cleared with atomic read-modify-write operations so marker
//! threads, sweeper threads and the mutator's write barrier can touch the same
//! word without losing updates.

use core::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
}

impl AtomicBitmap {
    pub fn new(bit_count: usize) -> AtomicBitmap {
        let word_count = bit_count.div_ceil(BITS_PER_WORD);
        let words = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        AtomicBitmap { words }
    }

    #[inline]
    fn position(index: usize) -> (usize, u64) {
        (index / BITS_PER_WORD, 1u64 << (index % BITS_PER_WORD))
    }

    /// Set the bit, returning true if this call changed it from clear to set.
    #[inline]
    pub fn atomic_test_and_set(&self, index: usize) -> bool {
        let (word, mask) = Self::position(index);
        let previous = self.words[word].fetch_or(mask, Ordering::AcqRel);
        previous & mask == 0
    }

    #[inline]
    pub fn set(&self, index: usize) {
        let (word, mask) = Self::position(index);
        self.words[word].fetch_or(mask, Ordering::Relaxed);
    }

    #[inline]
    pub fn test(&self, index: usize) -> bool {
        let (word, mask) = Self::position(index);
        self.words[word].load(Ordering::Acquire) & mask != 0
    }

    #[inline]
    pub fn clear(&self, index: usize) {
        let (word, mask) = Self::position(index);
        self.words[word].fetch_and(!mask, Ordering::Relaxed);
    }

    /// Clear every bit in `[start, end)`.
    pub fn clear_range(&self, start: usize, end: usize) {
        let mut index = start;
        while index < end {
            let (word, _) = Self::position(index);
            let bit = index % BITS_PER_WORD;
            let span = (BITS_PER_WORD - bit).min(end - index);
            let mask = if span == BITS_PER_WORD {
                u64::MAX
            } else {
                ((1u64 << span) - 1) << bit
            };
            self.words[word].fetch_and(!mask, Ordering::Relaxed);
            index += span;
        }
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| word.load(Ordering::Acquire) == 0)
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    /// Call `f` with the index of every set bit, in ascending order.
    pub fn iterate(&self, mut f: impl FnMut(usize)) {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                f(word_index * BITS_PER_WORD + bit);
                bits &= bits - 1;
            }
        }
    }

    /// Move every bit of `other` into `self`, leaving `other` empty.
    pub fn merge_from(&self, other: &AtomicBitmap) {
        debug_assert_eq!(self.words.len(), other.words.len());
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            let bits = src.swap(0, Ordering::AcqRel);
            if bits != 0 {
                dst.fetch_or(bits, Ordering::AcqRel);
            }
        }
    }
}
