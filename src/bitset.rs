//! Growable bit vector with lock-free per-bit operations.
//!
//! Storage is a fixed table of lazily allocated chunks, so growing never moves
//! an existing word. Readers therefore need no lock. Only growth and the bulk
//! sweeps take `resize`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;

const WORD_BITS: usize = 32;
const CHUNK_WORDS: usize = 64;

/// Indices are participant ids, so the bit space matches the u16 id space.
pub const MAX_BITS: usize = 1 << 16;
const MAX_WORDS: usize = MAX_BITS / WORD_BITS;
const MAX_CHUNKS: usize = MAX_WORDS / CHUNK_WORDS;

type Chunk = Box<[AtomicU32]>;

pub struct AtomicBitSet {
    chunks: Box<[OnceLock<Chunk>]>,
    capacity_words: AtomicUsize,
    resize: Mutex<()>,
}

impl AtomicBitSet {
    pub fn new() -> Self {
        Self {
            chunks: (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect(),
            capacity_words: AtomicUsize::new(0),
            resize: Mutex::new(()),
        }
    }

    pub fn with_capacity(bits: usize) -> Self {
        let set = Self::new();
        if bits > 0 {
            set.grow_to(bits.div_ceil(WORD_BITS));
        }
        set
    }

    /// Current capacity in bits.
    pub fn capacity(&self) -> usize {
        self.capacity_words.load(Ordering::Acquire) * WORD_BITS
    }

    fn locate(index: usize) -> (usize, u32) {
        (index / WORD_BITS, 1u32 << (index % WORD_BITS))
    }

    fn word(&self, word_index: usize) -> Option<&AtomicU32> {
        if word_index >= self.capacity_words.load(Ordering::Acquire) {
            return None;
        }
        self.chunks[word_index / CHUNK_WORDS]
            .get()
            .map(|chunk| &chunk[word_index % CHUNK_WORDS])
    }

    fn grow_to(&self, required_words: usize) {
        if required_words <= self.capacity_words.load(Ordering::Acquire) {
            return;
        }

        let _guard = self.resize.lock();
        let current = self.capacity_words.load(Ordering::Acquire);
        if required_words <= current {
            return;
        }

        let target = required_words.max(current + current / 2 + 1).min(MAX_WORDS);
        for chunk in &self.chunks[..target.div_ceil(CHUNK_WORDS)] {
            chunk.get_or_init(|| (0..CHUNK_WORDS).map(|_| AtomicU32::new(0)).collect());
        }
        self.capacity_words.store(target, Ordering::Release);
    }

    /// Sets or clears bit `index`, growing if needed. Returns whether the bit
    /// changed.
    ///
    /// # Panics
    ///
    /// Panics if `index >= MAX_BITS`.
    pub fn set(&self, index: usize, value: bool) -> bool {
        assert!(index < MAX_BITS, "bit index {} outside id space", index);
        let (word_index, mask) = Self::locate(index);

        let word = match self.word(word_index) {
            Some(word) => word,
            None if !value => return false,
            None => {
                self.grow_to(word_index + 1);
                match self.word(word_index) {
                    Some(word) => word,
                    None => return false,
                }
            }
        };

        let mut current = word.load(Ordering::Acquire);
        loop {
            let next = if value { current | mask } else { current & !mask };
            if next == current {
                return false;
            }
            match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get(&self, index: usize) -> bool {
        let (word_index, mask) = Self::locate(index);
        self.word(word_index)
            .map(|word| word.load(Ordering::Acquire) & mask != 0)
            .unwrap_or(false)
    }

    /// Clears bit `index` if it is set; returns whether it was.
    pub fn test_and_clear(&self, index: usize) -> bool {
        let (word_index, mask) = Self::locate(index);
        let Some(word) = self.word(word_index) else {
            return false;
        };

        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & mask == 0 {
                return false;
            }
            match word.compare_exchange_weak(current, current & !mask, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Fills every bit within the current capacity.
    pub fn set_all(&self, value: bool) {
        let _guard = self.resize.lock();
        let fill = if value { u32::MAX } else { 0 };
        let words = self.capacity_words.load(Ordering::Acquire);
        for word_index in 0..words {
            if let Some(chunk) = self.chunks[word_index / CHUNK_WORDS].get() {
                chunk[word_index % CHUNK_WORDS].store(fill, Ordering::Release);
            }
        }
    }

    pub fn clear(&self) {
        self.set_all(false);
    }

    /// Grows to cover `bits` bits, then sets every bit.
    pub fn fill_to(&self, bits: usize) {
        if bits > 0 {
            self.grow_to(bits.min(MAX_BITS).div_ceil(WORD_BITS));
        }
        self.set_all(true);
    }

    pub fn count_ones(&self) -> usize {
        let words = self.capacity_words.load(Ordering::Acquire);
        (0..words)
            .filter_map(|w| self.word(w))
            .map(|word| word.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        let words = self.capacity_words.load(Ordering::Acquire);
        (0..words).flat_map(move |w| {
            let bits = self.word(w).map(|word| word.load(Ordering::Acquire)).unwrap_or(0);
            (0..WORD_BITS)
                .filter(move |b| bits & (1u32 << b) != 0)
                .map(move |b| w * WORD_BITS + b)
        })
    }
}

impl Default for AtomicBitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicBitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBitSet")
            .field("capacity", &self.capacity())
            .field("ones", &self.count_ones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_set_get_clear() {
        let set = AtomicBitSet::new();
        assert!(!set.get(5));
        assert_eq!(set.capacity(), 0);

        assert!(set.set(5, true));
        assert!(!set.set(5, true));
        assert!(set.get(5));
        assert!(!set.get(4));

        assert!(set.set(5, false));
        assert!(!set.get(5));
    }

    #[test]
    fn test_get_never_grows() {
        let set = AtomicBitSet::new();
        assert!(!set.get(10_000));
        assert!(!set.test_and_clear(10_000));
        assert!(!set.set(10_000, false));
        assert_eq!(set.capacity(), 0);
    }

    #[test]
    fn test_growth_policy() {
        let set = AtomicBitSet::new();
        set.set(0, true);
        assert_eq!(set.capacity(), 32);

        // 1 word → max(2, 1 + 0 + 1) = 2 words.
        set.set(33, true);
        assert_eq!(set.capacity(), 64);

        // 2 words → max(3, 2 + 1 + 1) = 4 words.
        set.set(64, true);
        assert_eq!(set.capacity(), 128);

        set.set(5000, true);
        assert_eq!(set.capacity(), (5000 / 32 + 1) * 32);
        assert!(set.get(0) && set.get(33) && set.get(64) && set.get(5000));
    }

    #[test]
    fn test_test_and_clear() {
        let set = AtomicBitSet::new();
        set.set(70, true);
        assert!(set.test_and_clear(70));
        assert!(!set.test_and_clear(70));
        assert!(!set.get(70));
    }

    #[test]
    fn test_bulk_operations() {
        let set = AtomicBitSet::with_capacity(100);
        set.set_all(true);
        assert!(set.get(0) && set.get(99));
        assert_eq!(set.count_ones(), set.capacity());

        set.clear();
        assert_eq!(set.count_ones(), 0);

        let set = AtomicBitSet::new();
        set.fill_to(40);
        assert!(set.get(39));
        set.set(3, false);
        let ones: Vec<usize> = set.iter_ones().take(3).collect();
        assert_eq!(ones, vec![0, 1, 2]);
    }

    #[test]
    #[should_panic]
    fn test_index_outside_id_space() {
        AtomicBitSet::new().set(MAX_BITS, true);
    }

    #[test]
    fn test_concurrent_set_with_growth() {
        let set = AtomicBitSet::new();
        thread::scope(|s| {
            for t in 0..8 {
                let set = &set;
                s.spawn(move || {
                    for i in (t..4096).step_by(8) {
                        set.set(i, true);
                    }
                });
            }
        });
        assert_eq!(set.count_ones(), 4096);
        assert!((0..4096).all(|i| set.get(i)));
    }

    #[test]
    fn test_concurrent_test_and_clear_claims_once() {
        let set = AtomicBitSet::new();
        for i in 0..256 {
            set.set(i, true);
        }
        let claimed = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for i in 0..256 {
                        if set.test_and_clear(i) {
                            claimed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });
        assert_eq!(claimed.load(Ordering::Relaxed), 256);
        assert_eq!(set.count_ones(), 0);
    }

    #[test]
    fn test_neighbouring_bits_under_contention() {
        let set = AtomicBitSet::with_capacity(32);
        thread::scope(|s| {
            for bit in 0..32 {
                let set = &set;
                s.spawn(move || {
                    for round in 0..1000 {
                        set.set(bit, round % 2 == 0);
                    }
                });
            }
        });
        // Each thread's last write was a clear.
        assert_eq!(set.count_ones(), 0);
    }
}
