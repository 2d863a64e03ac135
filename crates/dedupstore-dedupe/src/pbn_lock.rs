//! Physical block number locks.
//!
//! A PBN lock is owned by the physical zone that covers its block. Read
//! locks are shared: a hash lock holds one on the duplicate block while
//! its members add references, budgeted by the lock's increment limit.
//! The increment budget is the one field touched from other zones, so it
//! is atomic; everything else is mutated only on the owning zone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dedupstore_core::types::PhysicalBlockNumber;

use crate::error::{DedupeError, DedupeResult};

/// The maximum references a data block can hold; a fresh block's increment
/// limit starts here.
pub const MAXIMUM_REFERENCE_COUNT: u32 = 254;

/// The kinds of PBN lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PbnLockType {
    /// Shared lock for reading and deduplicating against a block.
    ReadLock,
    /// Exclusive lock held while writing new data to a block.
    WriteData,
    /// Exclusive lock held while writing a block map page.
    WriteBlockMap,
    /// Exclusive lock held while writing a compressed block.
    WriteCompressed,
}

/// One lock on a physical block.
pub struct PbnLock {
    kind: Mutex<PbnLockType>,
    holder_count: AtomicU32,
    increment_limit: AtomicU32,
    has_provisional_reference: AtomicBool,
}

impl std::fmt::Debug for PbnLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbnLock")
            .field("kind", &*self.kind.lock())
            .field("holder_count", &self.holder_count.load(Ordering::Relaxed))
            .field(
                "increment_limit",
                &self.increment_limit.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl PbnLock {
    /// Creates an unheld lock of the given kind.
    pub fn new(kind: PbnLockType) -> Self {
        Self {
            kind: Mutex::new(kind),
            holder_count: AtomicU32::new(0),
            increment_limit: AtomicU32::new(0),
            has_provisional_reference: AtomicBool::new(false),
        }
    }

    /// The current lock kind.
    pub fn kind(&self) -> PbnLockType {
        *self.kind.lock()
    }

    /// True for shared read locks.
    pub fn is_read_lock(&self) -> bool {
        self.kind() == PbnLockType::ReadLock
    }

    /// Downgrades an exclusive write lock to a shared read lock. Legal only
    /// on the owning physical zone, and only once.
    pub fn downgrade_to_read(&self) -> DedupeResult<()> {
        let mut kind = self.kind.lock();
        if *kind == PbnLockType::ReadLock {
            return Err(DedupeError::AlreadyReadLock);
        }
        *kind = PbnLockType::ReadLock;
        Ok(())
    }

    /// Atomically consumes one unit of the increment budget. Returns false
    /// once the budget is exhausted.
    pub fn claim_increment(&self) -> bool {
        self.increment_limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                limit.checked_sub(1)
            })
            .is_ok()
    }

    /// Sets the increment budget, recorded when the lock is first taken.
    pub fn set_increment_limit(&self, limit: u32) {
        self.increment_limit.store(limit, Ordering::Release);
    }

    /// The remaining increment budget.
    pub fn increment_limit(&self) -> u32 {
        self.increment_limit.load(Ordering::Acquire)
    }

    /// Adds a holder, returning the new count.
    pub fn acquire_holder(&self) -> u32 {
        self.holder_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Removes a holder, returning the new count.
    pub fn release_holder(&self) -> u32 {
        let previous = self.holder_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "PBN lock holder underflow");
        previous - 1
    }

    /// Holders currently sharing the lock.
    pub fn holder_count(&self) -> u32 {
        self.holder_count.load(Ordering::Acquire)
    }

    /// Marks the provisional reference taken for a brand-new duplicate
    /// lock.
    pub fn set_provisional_reference(&self, held: bool) {
        self.has_provisional_reference.store(held, Ordering::Release);
    }

    /// True while the lock carries a provisional reference.
    pub fn has_provisional_reference(&self) -> bool {
        self.has_provisional_reference.load(Ordering::Acquire)
    }
}

/// The result of attempting to take a PBN lock.
pub enum PbnLockAttempt {
    /// A new lock was created and registered for the block.
    Acquired(Arc<PbnLock>),
    /// The block was already locked; the existing lock is returned so the
    /// caller can decide whether it can be shared.
    Existing(Arc<PbnLock>),
}

/// One physical zone's table of PBN locks.
pub struct PhysicalZone {
    zone_id: u8,
    locks: HashMap<PhysicalBlockNumber, Arc<PbnLock>>,
}

impl PhysicalZone {
    /// Creates an empty zone.
    pub fn new(zone_id: u8) -> Self {
        Self {
            zone_id,
            locks: HashMap::new(),
        }
    }

    /// This zone's identifier.
    pub fn zone_id(&self) -> u8 {
        self.zone_id
    }

    /// Attempts to lock `pbn`. If the block is already locked the existing
    /// lock is returned unmodified; otherwise a fresh, unheld lock of the
    /// requested kind is registered and returned.
    pub fn attempt_pbn_lock(&mut self, pbn: PhysicalBlockNumber, kind: PbnLockType) -> PbnLockAttempt {
        if let Some(existing) = self.locks.get(&pbn) {
            tracing::debug!(%pbn, existing = ?existing.kind(), "pbn already locked");
            return PbnLockAttempt::Existing(Arc::clone(existing));
        }
        let lock = Arc::new(PbnLock::new(kind));
        self.locks.insert(pbn, Arc::clone(&lock));
        PbnLockAttempt::Acquired(lock)
    }

    /// The lock registered for `pbn`, if any.
    pub fn get_pbn_lock(&self, pbn: PhysicalBlockNumber) -> Option<Arc<PbnLock>> {
        self.locks.get(&pbn).cloned()
    }

    /// Releases one holder of the lock on `pbn`, unregistering the lock
    /// when the last holder is gone. Returns the remaining holder count.
    pub fn release_pbn_lock(&mut self, pbn: PhysicalBlockNumber, lock: &Arc<PbnLock>) -> u32 {
        debug_assert!(
            self.locks
                .get(&pbn)
                .map_or(true, |held| Arc::ptr_eq(held, lock)),
            "releasing a lock the zone does not hold"
        );
        let remaining = lock.release_holder();
        if remaining == 0 {
            self.locks.remove(&pbn);
            tracing::debug!(%pbn, "pbn lock released");
        }
        remaining
    }

    /// The number of locked blocks in this zone.
    pub fn locked_count(&self) -> usize {
        self.locks.len()
    }
}

/// Reference-count state the dedupe path needs from the slab depot.
pub trait SlabDepot {
    /// The additional references `pbn` can still accept.
    fn get_increment_limit(&self, pbn: PhysicalBlockNumber) -> u32;

    /// Takes a provisional reference preventing the block from being
    /// reclaimed while an unverified duplicate lock exists.
    fn acquire_provisional_reference(&mut self, pbn: PhysicalBlockNumber) -> DedupeResult<()>;

    /// Returns a provisional reference.
    fn release_provisional_reference(&mut self, pbn: PhysicalBlockNumber);
}

/// In-memory slab depot double with configurable per-block limits.
#[derive(Default)]
pub struct InMemorySlabDepot {
    limits: HashMap<PhysicalBlockNumber, u32>,
    provisional: HashMap<PhysicalBlockNumber, u32>,
    fail_provisional: bool,
}

impl InMemorySlabDepot {
    /// Creates a depot where every block has the full reference budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the increment limit for one block.
    pub fn set_increment_limit(&mut self, pbn: PhysicalBlockNumber, limit: u32) {
        self.limits.insert(pbn, limit);
    }

    /// Makes provisional reference acquisition fail, for error-path tests.
    pub fn fail_provisional_references(&mut self, fail: bool) {
        self.fail_provisional = fail;
    }

    /// Provisional references currently held on `pbn`.
    pub fn provisional_references(&self, pbn: PhysicalBlockNumber) -> u32 {
        self.provisional.get(&pbn).copied().unwrap_or(0)
    }
}

impl SlabDepot for InMemorySlabDepot {
    fn get_increment_limit(&self, pbn: PhysicalBlockNumber) -> u32 {
        self.limits.get(&pbn).copied().unwrap_or(MAXIMUM_REFERENCE_COUNT)
    }

    fn acquire_provisional_reference(&mut self, pbn: PhysicalBlockNumber) -> DedupeResult<()> {
        if self.fail_provisional {
            return Err(DedupeError::NoProvisionalReference { pbn: pbn.as_u64() });
        }
        *self.provisional.entry(pbn).or_insert(0) += 1;
        Ok(())
    }

    fn release_provisional_reference(&mut self, pbn: PhysicalBlockNumber) {
        if let Some(count) = self.provisional.get_mut(&pbn) {
            *count = count.saturating_sub(1);
        }
    }
}

/// The outcome of [`lock_duplicate_pbn`].
#[derive(Debug)]
pub enum DuplicateLockOutcome {
    /// The advice cannot be used: the block is write-locked or has no
    /// increment budget left.
    Stale,
    /// A shared read lock on the duplicate block, ready to be registered
    /// to the hash lock.
    Locked(Arc<PbnLock>),
}

/// Acquires a shared read lock on an advised duplicate block. Runs on the
/// physical zone owning `pbn`.
pub fn lock_duplicate_pbn(
    zone: &mut PhysicalZone,
    depot: &mut dyn SlabDepot,
    pbn: PhysicalBlockNumber,
) -> DedupeResult<DuplicateLockOutcome> {
    let increment_limit = depot.get_increment_limit(pbn);
    if increment_limit == 0 {
        return Ok(DuplicateLockOutcome::Stale);
    }

    match zone.attempt_pbn_lock(pbn, PbnLockType::ReadLock) {
        PbnLockAttempt::Existing(lock) => {
            if lock.is_read_lock() {
                // Share the existing read lock and its remaining budget.
                Ok(DuplicateLockOutcome::Locked(lock))
            } else {
                // The block is being written; the advice is out of date.
                Ok(DuplicateLockOutcome::Stale)
            }
        }
        PbnLockAttempt::Acquired(lock) => {
            // A brand-new lock needs a provisional reference so the block
            // cannot be reclaimed before verification.
            if let Err(error) = depot.acquire_provisional_reference(pbn) {
                lock.acquire_holder();
                zone.release_pbn_lock(pbn, &lock);
                return Err(error);
            }
            lock.set_provisional_reference(true);
            lock.set_increment_limit(increment_limit);
            Ok(DuplicateLockOutcome::Locked(lock))
        }
    }
}
