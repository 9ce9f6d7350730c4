//! Sparse chunk encoding: one default value plus per-value exceptions.
//!
//! Exceptions are kept two ways. Values that recur often get an
//! [`OffsetBitSet`] over cell positions; rare values get a hash set of cell
//! positions. A hash set is promoted to a bitset once it holds more than
//! `promotion_threshold` positions.

use std::collections::{BTreeMap, HashSet};
use std::mem::size_of;

use super::bitset::OffsetBitSet;
use crate::cell::CellValue;

/// Approximate per-entry bookkeeping of the value maps.
const MAP_ENTRY_BYTES: usize = 64;

#[derive(Clone, Debug)]
pub struct ValueBits<T> {
    pub value: T,
    pub bits: OffsetBitSet,
}

#[derive(Clone, Debug)]
pub struct ValueCells<T> {
    pub value: T,
    pub cells: HashSet<u32>,
}

#[derive(Clone, Debug)]
pub struct MapChunk<T: CellValue> {
    cells: usize,
    default: T,
    bitsets: BTreeMap<T::Key, ValueBits<T>>,
    sets: BTreeMap<T::Key, ValueCells<T>>,
    promotion_threshold: usize,
}

impl<T: CellValue> MapChunk<T> {
    /// A chunk of `cells` positions all holding `default`.
    pub fn new(cells: usize, default: T, promotion_threshold: usize) -> Self {
        Self {
            cells,
            default,
            bitsets: BTreeMap::new(),
            sets: BTreeMap::new(),
            promotion_threshold,
        }
    }

    /// Encode row-major `values`, using the most frequent value as default.
    pub fn from_values(values: &[T], promotion_threshold: usize) -> Option<Self> {
        let default = most_frequent(values)?;
        let mut chunk = Self::new(values.len(), default, promotion_threshold);
        for (position, value) in values.iter().enumerate() {
            if !value.same(default) {
                chunk.insert_exception(position, *value);
            }
        }
        Some(chunk)
    }

    /// Rebuild from persisted parts.
    pub fn from_parts(
        cells: usize,
        default: T,
        bitsets: Vec<ValueBits<T>>,
        sets: Vec<ValueCells<T>>,
        promotion_threshold: usize,
    ) -> Self {
        Self {
            cells,
            default,
            bitsets: bitsets.into_iter().map(|b| (b.value.key(), b)).collect(),
            sets: sets.into_iter().map(|s| (s.value.key(), s)).collect(),
            promotion_threshold,
        }
    }

    pub fn default_value(&self) -> T {
        self.default
    }

    pub fn promotion_threshold(&self) -> usize {
        self.promotion_threshold
    }

    pub fn bitsets(&self) -> impl Iterator<Item = &ValueBits<T>> {
        self.bitsets.values()
    }

    pub fn sets(&self) -> impl Iterator<Item = &ValueCells<T>> {
        self.sets.values()
    }

    pub fn get(&self, position: usize) -> T {
        if let Some(entry) = self.bitsets.values().find(|b| b.bits.contains(position)) {
            return entry.value;
        }
        let cell = position as u32;
        if let Some(entry) = self.sets.values().find(|s| s.cells.contains(&cell)) {
            return entry.value;
        }
        self.default
    }

    /// Store `value` at `position`, returning the previous value.
    pub fn set(&mut self, position: usize, value: T) -> T {
        let previous = self.get(position);
        if previous.same(value) {
            return previous;
        }
        if !previous.same(self.default) {
            self.remove_exception(position, previous);
        }
        if !value.same(self.default) {
            self.insert_exception(position, value);
        }
        previous
    }

    /// Upper bound on extra heap bytes [`MapChunk::set`] may allocate.
    pub fn growth_bytes(&self, value: T) -> usize {
        if value.same(self.default) {
            return 0;
        }
        let key = value.key();
        if let Some(entry) = self.bitsets.get(&key) {
            return entry.bits.bytes_after_insert(self.cells) - entry.bits.heap_bytes();
        }
        match self.sets.get(&key) {
            Some(entry) if entry.cells.len() + 1 > self.promotion_threshold => {
                self.cells.div_ceil(8) + MAP_ENTRY_BYTES
            }
            Some(entry) if entry.cells.len() == entry.cells.capacity() => {
                set_bytes(entry.cells.capacity().max(4))
            }
            Some(_) => 0,
            None => set_bytes(4) + MAP_ENTRY_BYTES,
        }
    }

    fn insert_exception(&mut self, position: usize, value: T) {
        let key = value.key();
        if let Some(entry) = self.bitsets.get_mut(&key) {
            entry.bits.insert(position);
            return;
        }
        let entry = self.sets.entry(key).or_insert_with(|| ValueCells {
            value,
            cells: HashSet::new(),
        });
        entry.cells.insert(position as u32);
        if entry.cells.len() > self.promotion_threshold {
            if let Some(promoted) = self.sets.remove(&key) {
                tracing::trace!(
                    cells = promoted.cells.len(),
                    "promoting map chunk exception set to bitset"
                );
                let bits = promoted.cells.iter().map(|&cell| cell as usize).collect();
                self.bitsets.insert(key, ValueBits { value, bits });
            }
        }
    }

    fn remove_exception(&mut self, position: usize, value: T) {
        let key = value.key();
        if let Some(entry) = self.bitsets.get_mut(&key) {
            entry.bits.remove(position);
            if entry.bits.is_empty() {
                self.bitsets.remove(&key);
            }
            return;
        }
        if let Some(entry) = self.sets.get_mut(&key) {
            entry.cells.remove(&(position as u32));
            if entry.cells.is_empty() {
                self.sets.remove(&key);
            }
        }
    }

    /// Number of cells holding the default value.
    pub fn default_count(&self) -> usize {
        let exceptions: usize = self.bitsets.values().map(|b| b.bits.len()).sum::<usize>()
            + self.sets.values().map(|s| s.cells.len()).sum::<usize>();
        self.cells - exceptions
    }

    /// `(value, count)` groups: the default run, then every bitset, then
    /// every hash set. Empty groups are skipped.
    pub fn runs(&self) -> Vec<(T, usize)> {
        let mut runs = Vec::with_capacity(1 + self.bitsets.len() + self.sets.len());
        let default_count = self.default_count();
        if default_count > 0 {
            runs.push((self.default, default_count));
        }
        runs.extend(self.bitsets.values().map(|b| (b.value, b.bits.len())));
        runs.extend(self.sets.values().map(|s| (s.value, s.cells.len())));
        runs
    }

    pub fn heap_bytes(&self) -> usize {
        let bitsets: usize = self
            .bitsets
            .values()
            .map(|b| b.bits.heap_bytes() + MAP_ENTRY_BYTES)
            .sum();
        let sets: usize = self
            .sets
            .values()
            .map(|s| set_bytes(s.cells.capacity()) + MAP_ENTRY_BYTES)
            .sum();
        bitsets + sets
    }
}

fn set_bytes(capacity: usize) -> usize {
    capacity * (size_of::<u32>() + 1)
}

fn most_frequent<T: CellValue>(values: &[T]) -> Option<T> {
    let mut counts: BTreeMap<T::Key, (T, usize)> = BTreeMap::new();
    for value in values {
        counts.entry(value.key()).or_insert((*value, 0)).1 += 1;
    }
    counts
        .into_values()
        .max_by_key(|(_, count)| *count)
        .map(|(value, _)| value)
}
