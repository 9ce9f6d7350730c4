use std::collections::{BTreeMap, BTreeSet};
use tilegrid_core::ChunkId;

use super::GridId;

/// Outcome of a memory check: how many chunks were cleared and whether the
/// requested headroom was reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Account {
    pub cleared: usize,
    pub success: bool,
}

/// [`Account`] itemised per grid and chunk.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountDetail {
    pub cleared: BTreeMap<GridId, BTreeSet<ChunkId>>,
    pub freed_bytes: usize,
    pub success: bool,
}

impl AccountDetail {
    pub(crate) fn succeeded() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, grid: GridId, id: ChunkId, bytes: usize) {
        self.cleared.entry(grid).or_default().insert(id);
        self.freed_bytes += bytes;
    }

    pub fn cleared_count(&self) -> usize {
        self.cleared.values().map(BTreeSet::len).sum()
    }

    pub fn contains(&self, grid: GridId, id: ChunkId) -> bool {
        self.cleared.get(&grid).is_some_and(|ids| ids.contains(&id))
    }

    pub fn to_account(&self) -> Account {
        Account {
            cleared: self.cleared_count(),
            success: self.success,
        }
    }
}
