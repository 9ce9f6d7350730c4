#![allow(dead_code)]

use std::mem::size_of;
use std::rc::Rc;
use tempfile::TempDir;
use tilegrid_cache::{Chunk, ManagerConfig, MemoryManager};
use tracing_subscriber::EnvFilter;

pub const NO_DATA: i32 = -9999;

/// Route library logs to the test output; `RUST_LOG=tilegrid_cache=debug`
/// shows evictions and reloads.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bytes charged for a resident Array chunk of `cells` `i32` cells.
pub fn array_chunk_bytes(cells: usize) -> usize {
    size_of::<Chunk<i32>>() + cells * size_of::<i32>()
}

/// Manager with its own cache directory.
pub fn manager(budget: usize, reserve: usize) -> (TempDir, Rc<MemoryManager>) {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    let config = ManagerConfig::default()
        .with_cache_dir(dir.path())
        .with_memory_budget(budget)
        .with_reserve(reserve);
    let manager = MemoryManager::new(config).expect("valid config");
    (dir, manager)
}

/// Manager that never needs to evict in these tests.
pub fn roomy_manager() -> (TempDir, Rc<MemoryManager>) {
    manager(64 * 1024 * 1024, 1024)
}
