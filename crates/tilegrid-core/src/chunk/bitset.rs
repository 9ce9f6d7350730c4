use bitvec::prelude::*;

/// A bitset over chunk cell positions that only stores the span between its
/// lowest and highest member.
///
/// Bit `i` of `bits` represents cell position `offset + i`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetBitSet {
    offset: usize,
    bits: BitVec<u64, Lsb0>,
}

impl OffsetBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the raw parts produced by [`OffsetBitSet::to_parts`].
    pub fn from_parts(offset: usize, len: usize, words: Vec<u64>) -> Self {
        let mut bits = BitVec::<u64, Lsb0>::from_vec(words);
        bits.truncate(len);
        Self { offset, bits }
    }

    /// `(offset, len, words)` for persistence.
    pub fn to_parts(&self) -> (usize, usize, Vec<u64>) {
        (self.offset, self.bits.len(), self.bits.as_raw_slice().to_vec())
    }

    pub fn contains(&self, position: usize) -> bool {
        position >= self.offset
            && self
                .bits
                .get(position - self.offset)
                .map(|bit| *bit)
                .unwrap_or(false)
    }

    /// Set a member, widening the stored span if needed.
    pub fn insert(&mut self, position: usize) {
        if self.bits.is_empty() {
            self.offset = position;
            self.bits.push(true);
            return;
        }
        if position < self.offset {
            let shift = self.offset - position;
            let mut widened = BitVec::<u64, Lsb0>::repeat(false, shift);
            widened.extend_from_bitslice(&self.bits);
            self.bits = widened;
            self.offset = position;
        }
        let index = position - self.offset;
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        self.bits.set(index, true);
    }

    /// Clear a member. Returns whether it was present.
    pub fn remove(&mut self, position: usize) -> bool {
        if !self.contains(position) {
            return false;
        }
        self.bits.set(position - self.offset, false);
        true
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    /// Member positions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        let offset = self.offset;
        self.bits.iter_ones().map(move |index| index + offset)
    }

    /// Heap bytes held by the bit storage.
    pub fn heap_bytes(&self) -> usize {
        self.bits.capacity().div_ceil(8)
    }

    /// Upper bound on the heap bytes after inserting `position` into a set
    /// spanning at most `cells` positions.
    pub fn bytes_after_insert(&self, cells: usize) -> usize {
        cells.div_ceil(8).max(self.heap_bytes())
    }
}

impl FromIterator<usize> for OffsetBitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut positions: Vec<usize> = iter.into_iter().collect();
        positions.sort_unstable();
        let mut set = Self::new();
        if let (Some(&first), Some(&last)) = (positions.first(), positions.last()) {
            set.offset = first;
            set.bits = BitVec::repeat(false, last - first + 1);
            for position in positions {
                set.bits.set(position - first, true);
            }
        }
        set
    }
}
