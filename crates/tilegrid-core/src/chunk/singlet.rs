use crate::cell::CellValue;

/// A chunk whose every cell holds the same value.
#[derive(Clone, Copy, Debug)]
pub struct SingletChunk<T> {
    value: T,
}

impl<T: CellValue> SingletChunk<T> {
    pub fn new(value: T) -> Self {
        Self { value }
    }

    pub fn value(&self) -> T {
        self.value
    }
}
