//! Fixed-capacity bit set used for node and CPU masks.

use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-capacity bit vector backed by 64-bit words.
///
/// The capacity is always the requested bit count rounded up to a multiple of 64,
/// which is also the layout the kernel expects for `cpu_set_t` and NUMA nodemasks.
/// Indices at or beyond the capacity are ignored by [`Bitmask::set`] and read as
/// unset by [`Bitmask::get`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Bitmask {
    words: Vec<u64>,
}

impl Bitmask {
    /// Creates an all-zero mask able to hold at least `bits` bits.
    ///
    /// # Examples
    ///
    /// ```
    /// # use agave_numa_utils::Bitmask;
    /// let mask = Bitmask::new(65);
    /// assert_eq!(mask.len(), 128);
    /// assert_eq!(mask.count(), 0);
    /// ```
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    /// Builds a mask from raw words, lowest-order word first.
    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words }
    }

    /// Sets bit `i` to `value`. Out-of-capacity indices are ignored.
    pub fn set(&mut self, i: usize, value: bool) {
        if let Some(word) = self.words.get_mut(i / WORD_BITS) {
            let bit = 1u64 << (i % WORD_BITS);
            if value {
                *word |= bit;
            } else {
                *word &= !bit;
            }
        }
    }

    /// Returns bit `i`, or `false` if `i` is beyond the capacity.
    pub fn get(&self, i: usize) -> bool {
        self.words
            .get(i / WORD_BITS)
            .is_some_and(|word| (word >> (i % WORD_BITS)) & 1 != 0)
    }

    /// Clears every bit, padding included.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Sets every bit, padding beyond the originally requested count included.
    pub fn fill(&mut self) {
        self.words.fill(u64::MAX);
    }

    /// Population count across all words.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Capacity in bits. Always a multiple of 64.
    pub fn len(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    /// Returns true if the mask has no capacity at all.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Iterates over the indices of set bits, low to high.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(n, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(n * WORD_BITS + bit)
            })
        })
    }

    /// ORs every bit of `other` into `self`, up to `self`'s capacity.
    pub fn union_with(&mut self, other: &Bitmask) {
        for (dst, src) in self.words.iter_mut().zip(other.words.iter()) {
            *dst |= src;
        }
    }

    /// Comma-joined decimal indices of the set bits, e.g. `"0,1,5"`.
    pub fn text(&self) -> String {
        self.iter_ones()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Comma-joined 16-digit upper-case hex words, lowest-order word first.
    pub fn hex(&self) -> String {
        self.words
            .iter()
            .map(|w| format!("{w:016X}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [u64] {
        &mut self.words
    }
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test]
    fn test_capacity_rounds_up() {
        for n in 0..=300 {
            let mask = Bitmask::new(n);
            assert_eq!(mask.len() % 64, 0, "capacity for {n} not word aligned");
            assert!(mask.len() >= n, "capacity for {n} too small");
            assert!(mask.len() < n + 64, "capacity for {n} too large");
        }
    }

    #[test]
    fn test_set_get_count() {
        for n in 0..256 {
            let mut mask = Bitmask::new(n);
            for i in 0..n {
                mask.set(i, true);
                assert!(mask.get(i));
                assert_eq!(mask.count(), i + 1);
                mask.set(i, false);
                assert!(!mask.get(i));
                assert_eq!(mask.count(), i);
                mask.set(i, true);

                for k in i + 1..n {
                    assert!(!mask.get(k));
                }
            }
        }
    }

    #[test]
    fn test_set_existing_bit_does_not_change_count() {
        let mut mask = Bitmask::new(10);
        mask.set(3, true);
        mask.set(3, true);
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn test_out_of_capacity_is_ignored() {
        let mut mask = Bitmask::new(64);
        mask.set(64, true);
        mask.set(10_000, true);
        assert_eq!(mask.count(), 0);
        assert!(!mask.get(64));
        assert!(!mask.get(usize::MAX));

        let mut empty = Bitmask::new(0);
        empty.set(0, true);
        assert!(empty.is_empty());
        assert!(!empty.get(0));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut mask = Bitmask::new(130);
        mask.set(1, true);
        mask.set(129, true);

        let mut clone = mask.clone();
        assert_eq!(mask, clone);
        for i in 0..mask.len() {
            assert_eq!(mask.get(i), clone.get(i));
        }

        clone.set(1, false);
        clone.set(64, true);
        assert!(mask.get(1));
        assert!(!mask.get(64));
        assert_ne!(mask, clone);
    }

    #[test]
    fn test_clear_all_and_fill() {
        let mut mask = Bitmask::new(70);
        mask.fill();
        assert_eq!(mask.count(), 128);
        for i in 0..mask.len() {
            assert!(mask.get(i));
        }
        mask.clear_all();
        assert_eq!(mask.count(), 0);
    }

    #[test_case(&[], "" ; "empty")]
    #[test_case(&[0], "0" ; "single")]
    #[test_case(&[0, 1, 5, 64, 127], "0,1,5,64,127" ; "across words")]
    fn test_text(bits: &[usize], expected: &str) {
        let mut mask = Bitmask::new(128);
        for &i in bits {
            mask.set(i, true);
        }
        assert_eq!(mask.text(), expected);
        assert_eq!(mask.iter_ones().collect::<Vec<_>>(), bits);
    }

    #[test]
    fn test_hex() {
        let mut mask = Bitmask::new(128);
        mask.set(0, true);
        mask.set(4, true);
        mask.set(64 + 63, true);
        assert_eq!(mask.hex(), "0000000000000011,8000000000000000");
        assert_eq!(mask.to_string(), mask.hex());
        assert_eq!(Bitmask::new(0).hex(), "");

        let words = Bitmask::new(192).hex();
        assert_eq!(words.matches(',').count() + 1, 3);
    }

    #[test]
    fn test_union_with() {
        let mut a = Bitmask::new(128);
        a.set(1, true);
        let mut b = Bitmask::new(64);
        b.set(2, true);
        b.set(63, true);
        a.union_with(&b);
        assert_eq!(a.text(), "1,2,63");

        // bits beyond the destination capacity are dropped
        let mut small = Bitmask::new(64);
        let mut big = Bitmask::new(128);
        big.set(100, true);
        small.union_with(&big);
        assert_eq!(small.count(), 0);
    }

    #[test]
    fn test_from_words() {
        let mask = Bitmask::from_words(vec![0b101, 1]);
        assert_eq!(mask.len(), 128);
        assert_eq!(mask.text(), "0,2,64");
        assert_eq!(mask.words(), &[0b101, 1]);
    }
}
