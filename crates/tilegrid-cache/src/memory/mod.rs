//! Memory manager.
//!
//! One [`MemoryManager`] coordinates every grid created against it. It keeps
//! a ledger of resident chunk bytes against a fixed budget. Allocations that
//! would overrun the budget fail with [`GridError::MemoryPressure`]; the
//! retry loop in [`MemoryManager::run`] answers that by evicting chunks and
//! re-running the whole operation:
//!
//! ```text
//! Running -> Failed(MemoryPressure) -> Recovering -> Retrying -> Running
//!                                          |
//!                                          +-> Fatal (MemoryExhausted)
//! ```
//!
//! Recovering releases the reserve, evicts least-recently-used chunks that
//! no active exclusion protects, persisting dirty ones first, and
//! re-establishes the reserve before the retry. Operations run through the
//! loop must therefore be restartable.

mod account;
mod exclusion;

pub use account::{Account, AccountDetail};
pub use exclusion::{Exclusions, GridId};

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use tilegrid_core::ChunkId;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::{GridError, GridResult};

/// Something holding chunks the manager can evict.
pub(crate) trait Evictable {
    /// Push resident chunks that are worth clearing and not excluded.
    fn collect_candidates(&self, exclusions: &Exclusions, out: &mut Vec<Candidate>);

    /// Persist `id` if dirty and drop it from memory. Returns the bytes
    /// released, or `None` if the chunk was not resident or is in use.
    fn evict(&self, id: ChunkId) -> GridResult<Option<usize>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub grid: GridId,
    pub chunk: ChunkId,
    pub last_used: u64,
}

struct Registration {
    id: GridId,
    name: String,
    handle: Weak<dyn Evictable>,
}

/// Coordinator of chunk eviction across all live grids.
pub struct MemoryManager {
    config: ManagerConfig,
    resident: Cell<usize>,
    reserve_held: Cell<usize>,
    clock: Cell<u64>,
    next_grid: Cell<u64>,
    next_context: Cell<u64>,
    grids: RefCell<Vec<Registration>>,
    contexts: RefCell<Vec<(u64, Exclusions)>>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("resident", &self.resident.get())
            .field("reserve_held", &self.reserve_held.get())
            .field("grids", &self.grids.borrow().len())
            .finish()
    }
}

impl MemoryManager {
    pub fn new(config: ManagerConfig) -> GridResult<Rc<Self>> {
        let config = config.validated()?;
        info!(
            budget = config.memory_budget_bytes,
            reserve = config.reserve_bytes,
            cache_dir = %config.cache_dir.display(),
            "memory manager created"
        );
        let manager = Self {
            config,
            resident: Cell::new(0),
            reserve_held: Cell::new(0),
            clock: Cell::new(0),
            next_grid: Cell::new(0),
            next_context: Cell::new(0),
            grids: RefCell::new(Vec::new()),
            contexts: RefCell::new(Vec::new()),
        };
        manager.init_memory_reserve();
        Ok(Rc::new(manager))
    }

    /// Manager configured from `TILEGRID_*` environment variables.
    pub fn from_env() -> GridResult<Rc<Self>> {
        Self::new(ManagerConfig::from_env()?)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Bytes charged by resident chunks.
    pub fn resident_bytes(&self) -> usize {
        self.resident.get()
    }

    /// Bytes currently set aside as the reserve margin.
    pub fn reserve_held(&self) -> usize {
        self.reserve_held.get()
    }

    /// Bytes that can still be charged without touching the reserve.
    pub fn headroom(&self) -> usize {
        self.config
            .memory_budget_bytes
            .saturating_sub(self.resident.get())
            .saturating_sub(self.reserve_held.get())
    }

    /// Number of live registered grids.
    pub fn grid_count(&self) -> usize {
        self.grids
            .borrow()
            .iter()
            .filter(|r| r.handle.strong_count() > 0)
            .count()
    }

    pub(crate) fn tick(&self) -> u64 {
        let next = self.clock.get() + 1;
        self.clock.set(next);
        next
    }

    /// Charge `bytes` against the budget, or report the pressure.
    pub(crate) fn try_charge(&self, bytes: usize) -> GridResult<()> {
        if bytes > self.headroom() {
            return Err(GridError::MemoryPressure { requested: bytes });
        }
        self.resident.set(self.resident.get() + bytes);
        Ok(())
    }

    /// Charge without checking; used to settle estimates after the fact.
    pub(crate) fn charge(&self, bytes: usize) {
        self.resident.set(self.resident.get() + bytes);
    }

    pub(crate) fn release(&self, bytes: usize) {
        self.resident.set(self.resident.get().saturating_sub(bytes));
    }

    /// Reserve an id for a new grid, rejecting names held by live grids.
    pub(crate) fn allocate_grid_id(&self, name: &str) -> GridResult<GridId> {
        let mut grids = self.grids.borrow_mut();
        grids.retain(|r| r.handle.strong_count() > 0);
        if grids.iter().any(|r| r.name == name) {
            return Err(GridError::DuplicateGridName(name.to_string()));
        }
        let id = GridId(self.next_grid.get());
        self.next_grid.set(id.0 + 1);
        Ok(id)
    }

    pub(crate) fn register(&self, id: GridId, name: &str, handle: Weak<dyn Evictable>) {
        info!(grid = %id, name, "grid registered");
        self.grids.borrow_mut().push(Registration {
            id,
            name: name.to_string(),
            handle,
        });
    }

    /// Forget a grid and release the bytes its chunks were charged.
    pub(crate) fn deregister(&self, id: GridId, charged: usize) {
        self.release(charged);
        if let Ok(mut grids) = self.grids.try_borrow_mut() {
            grids.retain(|r| r.id != id && r.handle.strong_count() > 0);
        }
        debug!(grid = %id, released = charged, "grid deregistered");
    }

    /// Protect chunks from eviction until the returned guard is dropped.
    ///
    /// Every reclaim and memory check honours active guards in addition to
    /// its own exclusions.
    pub fn exclude(self: &Rc<Self>, exclusions: Exclusions) -> ExclusionGuard {
        let token = self.next_context.get();
        self.next_context.set(token + 1);
        self.contexts.borrow_mut().push((token, exclusions));
        ExclusionGuard {
            manager: Rc::clone(self),
            token,
        }
    }

    fn effective_exclusions(&self, exclusions: &Exclusions) -> Exclusions {
        let mut all = exclusions.clone();
        for (_, context) in self.contexts.borrow().iter() {
            all.extend(context);
        }
        all
    }

    /// Run `op`, reclaiming memory and retrying from the start whenever it
    /// reports [`GridError::MemoryPressure`].
    ///
    /// Gives up with [`GridError::MemoryExhausted`] when a reclaim cannot
    /// make room or after `max_reclaim_attempts` cycles.
    pub fn run<R>(
        &self,
        exclusions: &Exclusions,
        mut op: impl FnMut() -> GridResult<R>,
    ) -> GridResult<R> {
        let mut attempts = 0;
        loop {
            match op() {
                Err(GridError::MemoryPressure { requested }) => {
                    if attempts >= self.config.max_reclaim_attempts {
                        warn!(requested, attempts, "giving up after repeated reclaims");
                        return Err(GridError::MemoryExhausted { requested });
                    }
                    attempts += 1;
                    self.reclaim(requested, exclusions)?;
                }
                result => return result,
            }
        }
    }

    /// Make room for `requested` bytes after an allocation failed.
    pub fn reclaim(&self, requested: usize, exclusions: &Exclusions) -> GridResult<AccountDetail> {
        self.reserve_held.set(0);
        let target = requested.saturating_add(self.config.reserve_bytes);
        let mut detail = self.evict_until(target, exclusions)?;
        if self.headroom() < requested {
            self.init_memory_reserve();
            return Err(GridError::MemoryExhausted { requested });
        }
        if detail.cleared_count() == 0 {
            warn!(requested, "reclaim cleared no chunks, retrying on the released reserve");
        }
        self.reserve_keeping_free(requested);
        detail.success = true;
        Ok(detail)
    }

    /// Set aside up to `reserve_bytes` of the free budget as the reserve.
    pub fn init_memory_reserve(&self) {
        self.reserve_keeping_free(0);
    }

    fn reserve_keeping_free(&self, keep_free: usize) {
        let free = self
            .config
            .memory_budget_bytes
            .saturating_sub(self.resident.get());
        let reserve = self.config.reserve_bytes.min(free.saturating_sub(keep_free));
        self.reserve_held.set(reserve);
        debug!(reserve, keep_free, "memory reserve initialised");
    }

    /// Evict chunks if headroom has fallen below the reserve margin.
    ///
    /// Returns `true` if enough headroom is available afterwards.
    pub fn check_and_maybe_free_memory(&self, exclusions: &Exclusions) -> GridResult<bool> {
        Ok(self.check_and_maybe_free_memory_account_detail(exclusions)?.success)
    }

    pub fn check_and_maybe_free_memory_account(
        &self,
        exclusions: &Exclusions,
    ) -> GridResult<Account> {
        Ok(self
            .check_and_maybe_free_memory_account_detail(exclusions)?
            .to_account())
    }

    pub fn check_and_maybe_free_memory_account_detail(
        &self,
        exclusions: &Exclusions,
    ) -> GridResult<AccountDetail> {
        let wanted = self.config.reserve_bytes;
        let missing_reserve = wanted.saturating_sub(self.reserve_held.get());
        if self.headroom() >= wanted + missing_reserve {
            return Ok(AccountDetail::succeeded());
        }
        let mut detail = self.evict_until(wanted + missing_reserve, exclusions)?;
        self.init_memory_reserve();
        detail.success = self.headroom() >= wanted;
        if !detail.success {
            warn!(
                headroom = self.headroom(),
                wanted, "could not restore memory headroom"
            );
        }
        Ok(detail)
    }

    /// Evict every chunk not excluded that is worth clearing.
    pub fn evict_all(&self, exclusions: &Exclusions) -> GridResult<AccountDetail> {
        let exclusions = self.effective_exclusions(exclusions);
        let mut detail = AccountDetail::default();
        for (candidate, handle) in self.candidates(&exclusions) {
            if let Some(bytes) = handle.evict(candidate.chunk)? {
                detail.record(candidate.grid, candidate.chunk, bytes);
            }
        }
        self.init_memory_reserve();
        detail.success = true;
        Ok(detail)
    }

    /// Evict least-recently-used candidates until headroom reaches `target`.
    fn evict_until(&self, target: usize, exclusions: &Exclusions) -> GridResult<AccountDetail> {
        let mut detail = AccountDetail::default();
        if self.headroom() >= target {
            detail.success = true;
            return Ok(detail);
        }
        let exclusions = self.effective_exclusions(exclusions);
        for (candidate, handle) in self.candidates(&exclusions) {
            if let Some(bytes) = handle.evict(candidate.chunk)? {
                debug!(
                    grid = %candidate.grid,
                    chunk = %candidate.chunk,
                    bytes,
                    "chunk evicted"
                );
                detail.record(candidate.grid, candidate.chunk, bytes);
            }
            if self.headroom() >= target {
                break;
            }
        }
        detail.success = self.headroom() >= target;
        Ok(detail)
    }

    /// Eviction candidates across live grids, least recently used first.
    fn candidates(&self, exclusions: &Exclusions) -> Vec<(Candidate, Rc<dyn Evictable>)> {
        let handles: Vec<(GridId, Rc<dyn Evictable>)> = self
            .grids
            .borrow()
            .iter()
            .filter(|r| !exclusions.excludes_grid(r.id))
            .filter_map(|r| r.handle.upgrade().map(|handle| (r.id, handle)))
            .collect();

        let mut found = Vec::new();
        let mut candidates = Vec::new();
        for (_, handle) in &handles {
            found.clear();
            handle.collect_candidates(exclusions, &mut found);
            candidates.extend(found.iter().map(|c| (*c, Rc::clone(handle))));
        }
        candidates.sort_by_key(|(c, _)| (c.last_used, c.grid, c.chunk));
        candidates
    }
}

/// Keeps an exclusion context active; see [`MemoryManager::exclude`].
pub struct ExclusionGuard {
    manager: Rc<MemoryManager>,
    token: u64,
}

impl Drop for ExclusionGuard {
    fn drop(&mut self) {
        self.manager
            .contexts
            .borrow_mut()
            .retain(|(token, _)| *token != self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Evictable stand-in holding `(bytes, last_used)` per chunk.
    struct FakeGrid {
        id: GridId,
        manager: Rc<MemoryManager>,
        chunks: RefCell<BTreeMap<ChunkId, (usize, u64)>>,
    }

    impl FakeGrid {
        fn create(manager: &Rc<MemoryManager>, name: &str, chunks: &[(u64, usize)]) -> Rc<Self> {
            let id = manager.allocate_grid_id(name).unwrap();
            let map = chunks
                .iter()
                .map(|&(col, bytes)| {
                    manager.try_charge(bytes).unwrap();
                    (ChunkId::new(0, col), (bytes, manager.tick()))
                })
                .collect();
            let grid = Rc::new(Self {
                id,
                manager: Rc::clone(manager),
                chunks: RefCell::new(map),
            });
            let handle: Rc<dyn Evictable> = grid.clone();
            manager.register(id, name, Rc::downgrade(&handle));
            grid
        }

        fn resident(&self, col: u64) -> bool {
            self.chunks.borrow().contains_key(&ChunkId::new(0, col))
        }
    }

    impl Evictable for FakeGrid {
        fn collect_candidates(&self, exclusions: &Exclusions, out: &mut Vec<Candidate>) {
            for (id, (_, last_used)) in self.chunks.borrow().iter() {
                if !exclusions.excludes(self.id, *id) {
                    out.push(Candidate {
                        grid: self.id,
                        chunk: *id,
                        last_used: *last_used,
                    });
                }
            }
        }

        fn evict(&self, id: ChunkId) -> GridResult<Option<usize>> {
            let removed = self.chunks.borrow_mut().remove(&id).map(|(bytes, _)| bytes);
            if let Some(bytes) = removed {
                self.manager.release(bytes);
            }
            Ok(removed)
        }
    }

    fn manager(budget: usize, reserve: usize) -> Rc<MemoryManager> {
        MemoryManager::new(
            ManagerConfig::default()
                .with_memory_budget(budget)
                .with_reserve(reserve),
        )
        .unwrap()
    }

    #[test]
    fn test_try_charge_respects_reserve() {
        let manager = manager(100, 20);
        assert_eq!(manager.reserve_held(), 20);
        assert_eq!(manager.headroom(), 80);
        assert!(manager.try_charge(80).is_ok());
        assert!(matches!(
            manager.try_charge(1),
            Err(GridError::MemoryPressure { requested: 1 })
        ));
        manager.release(30);
        assert_eq!(manager.resident_bytes(), 50);
    }

    #[test]
    fn test_reclaim_evicts_least_recently_used_first() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[(0, 30), (1, 30), (2, 30)]);
        let detail = manager.reclaim(25, &Exclusions::new()).unwrap();
        assert!(detail.success);
        assert_eq!(detail.cleared_count(), 1);
        assert!(detail.contains(grid.id, ChunkId::new(0, 0)));
        assert!(!grid.resident(0));
        assert!(grid.resident(1));
        assert!(manager.headroom() >= 25);
    }

    #[test]
    fn test_exclusions_are_never_evicted() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[(0, 30), (1, 30), (2, 30)]);
        let exclusions = Exclusions::chunk(grid.id, ChunkId::new(0, 0))
            .with_chunk(grid.id, ChunkId::new(0, 1));
        let detail = manager.evict_all(&exclusions).unwrap();
        assert_eq!(detail.cleared_count(), 1);
        assert!(grid.resident(0));
        assert!(grid.resident(1));
        assert!(!grid.resident(2));
    }

    #[test]
    fn test_guard_exclusions_apply_until_dropped() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[(0, 30)]);
        {
            let _guard = manager.exclude(Exclusions::new().with_grid(grid.id));
            let detail = manager.evict_all(&Exclusions::new()).unwrap();
            assert_eq!(detail.cleared_count(), 0);
            assert!(grid.resident(0));
        }
        let detail = manager.evict_all(&Exclusions::new()).unwrap();
        assert_eq!(detail.cleared_count(), 1);
    }

    #[test]
    fn test_reclaim_fails_when_nothing_evictable() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[(0, 80)]);
        let err = manager
            .reclaim(50, &Exclusions::new().with_grid(grid.id))
            .unwrap_err();
        assert!(matches!(err, GridError::MemoryExhausted { requested: 50 }));
        assert!(grid.resident(0));
    }

    #[test]
    fn test_reclaim_can_proceed_on_released_reserve() {
        let manager = manager(100, 20);
        let _grid = FakeGrid::create(&manager, "a", &[(0, 75)]);
        assert_eq!(manager.headroom(), 5);
        let detail = manager.reclaim(15, &Exclusions::new().with_grid(_grid.id)).unwrap();
        assert_eq!(detail.cleared_count(), 0);
        assert!(manager.headroom() >= 15);
        assert_eq!(manager.reserve_held(), 10);
    }

    #[test]
    fn test_run_retries_after_reclaim() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[(0, 40), (1, 40)]);
        let mut calls = 0;
        let charged = manager.run(&Exclusions::chunk(grid.id, ChunkId::new(0, 1)), || {
            calls += 1;
            manager.try_charge(30).map(|_| calls)
        });
        assert_eq!(charged.unwrap(), 2);
        assert!(!grid.resident(0));
        assert!(grid.resident(1));
    }

    #[test]
    fn test_run_passes_other_errors_through() {
        let manager = manager(100, 10);
        let mut calls = 0;
        let result: GridResult<()> = manager.run(&Exclusions::new(), || {
            calls += 1;
            Err(GridError::Corrupt("boom".into()))
        });
        assert!(matches!(result, Err(GridError::Corrupt(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_check_and_maybe_free_memory() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[(0, 30), (1, 30)]);
        assert!(manager.check_and_maybe_free_memory(&Exclusions::new()).unwrap());
        manager.try_charge(25).unwrap();
        assert_eq!(manager.headroom(), 5);

        let account = manager
            .check_and_maybe_free_memory_account(&Exclusions::chunk(grid.id, ChunkId::new(0, 0)))
            .unwrap();
        assert_eq!(account, Account { cleared: 1, success: true });
        assert!(grid.resident(0));
        assert!(!grid.resident(1));
    }

    #[test]
    fn test_check_reports_failure_without_erroring() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[(0, 88)]);
        let ok = manager
            .check_and_maybe_free_memory(&Exclusions::new().with_grid(grid.id))
            .unwrap();
        assert!(!ok);
    }

    #[test]
    fn test_duplicate_names_rejected_while_alive() {
        let manager = manager(100, 10);
        let grid = FakeGrid::create(&manager, "a", &[]);
        assert!(matches!(
            manager.allocate_grid_id("a"),
            Err(GridError::DuplicateGridName(_))
        ));
        assert_eq!(manager.grid_count(), 1);
        drop(grid);
        assert_eq!(manager.grid_count(), 0);
        assert!(manager.allocate_grid_id("a").is_ok());
    }
}
