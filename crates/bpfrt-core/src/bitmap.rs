//! Dense bit set with cursor search
//!
//! Backs free-slot tracking and per-CPU scan loops. Mutation comes in
//! two modes: interlocked (atomic RMW, required when concurrent
//! writers exist) and plain (load/store, single writer). Searches scan
//! word-at-a-time using count-trailing/leading-zeros and resume from
//! an opaque cursor; cursors must not be shared across threads.

use core::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

/// Dense bit set.
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    bit_count: usize,
}

impl Bitmap {
    /// Create a bitmap holding `bit_count` bits, all clear.
    pub fn new(bit_count: usize) -> Self {
        let word_count = (bit_count + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let words: Vec<AtomicU64> = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        Self {
            words: words.into_boxed_slice(),
            bit_count,
        }
    }

    /// Number of bits the bitmap holds.
    #[inline]
    pub fn len(&self) -> usize {
        self.bit_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    /// Set bit `index`. Out-of-range indices are ignored.
    #[inline]
    pub fn set(&self, index: usize, interlocked: bool) {
        if index >= self.bit_count {
            return;
        }
        let word = &self.words[index / BITS_PER_WORD];
        let mask = 1u64 << (index % BITS_PER_WORD);
        if interlocked {
            word.fetch_or(mask, Ordering::AcqRel);
        } else {
            word.store(word.load(Ordering::Relaxed) | mask, Ordering::Release);
        }
    }

    /// Clear bit `index`. Out-of-range indices are ignored.
    #[inline]
    pub fn reset(&self, index: usize, interlocked: bool) {
        if index >= self.bit_count {
            return;
        }
        let word = &self.words[index / BITS_PER_WORD];
        let mask = 1u64 << (index % BITS_PER_WORD);
        if interlocked {
            word.fetch_and(!mask, Ordering::AcqRel);
        } else {
            word.store(word.load(Ordering::Relaxed) & !mask, Ordering::Release);
        }
    }

    /// Test bit `index`. Out-of-range indices read as clear.
    #[inline]
    pub fn test(&self, index: usize) -> bool {
        if index >= self.bit_count {
            return false;
        }
        let word = self.words[index / BITS_PER_WORD].load(Ordering::Acquire);
        word & (1u64 << (index % BITS_PER_WORD)) != 0
    }

    /// Start a forward (ascending index) search.
    pub fn forward_cursor(&self) -> ForwardCursor<'_> {
        let current = self
            .words
            .first()
            .map(|w| w.load(Ordering::Acquire))
            .unwrap_or(0);
        ForwardCursor {
            bitmap: self,
            word_index: 0,
            current,
        }
    }

    /// Start a reverse (descending index) search.
    pub fn reverse_cursor(&self) -> ReverseCursor<'_> {
        let word_index = self.words.len();
        ReverseCursor {
            bitmap: self,
            word_index,
            current: 0,
        }
    }
}

/// Cursor over set bits in ascending order.
///
/// The word under the cursor is snapshotted when the cursor reaches
/// it; bits mutated behind the cursor are not revisited.
pub struct ForwardCursor<'a> {
    bitmap: &'a Bitmap,
    word_index: usize,
    current: u64,
}

impl<'a> ForwardCursor<'a> {
    /// Next set bit at or after the cursor, or `None` when exhausted.
    pub fn next_bit(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let offset = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                let bit = self.word_index * BITS_PER_WORD + offset;
                if bit < self.bitmap.bit_count {
                    return Some(bit);
                }
                return None;
            }
            self.word_index += 1;
            if self.word_index >= self.bitmap.words.len() {
                return None;
            }
            self.current = self.bitmap.words[self.word_index].load(Ordering::Acquire);
        }
    }
}

/// Cursor over set bits in descending order.
pub struct ReverseCursor<'a> {
    bitmap: &'a Bitmap,
    word_index: usize,
    current: u64,
}

impl<'a> ReverseCursor<'a> {
    /// Next set bit at or before the cursor, or `None` when exhausted.
    pub fn next_bit(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let offset = BITS_PER_WORD - 1 - self.current.leading_zeros() as usize;
                self.current &= !(1u64 << offset);
                let bit = self.word_index * BITS_PER_WORD + offset;
                if bit < self.bitmap.bit_count {
                    return Some(bit);
                }
                continue;
            }
            if self.word_index == 0 {
                return None;
            }
            self.word_index -= 1;
            self.current = self.bitmap.words[self.word_index].load(Ordering::Acquire);
        }
    }
}
