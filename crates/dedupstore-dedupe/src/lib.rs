#![warn(missing_docs)]

//! dedupstore dedupe subsystem: hash zones, the hash-lock state machine,
//! PBN read locks with increment budgets, and the dedup index interface.

pub mod error;
pub mod hash_lock;
pub mod hash_zone;
pub mod index;
pub mod pbn_lock;

pub use error::{DedupeError, DedupeResult};
pub use hash_lock::{DedupeAction, HashLock, HashLockKey, HashLockState};
pub use hash_zone::{HashZone, HashZoneStats};
pub use index::{DedupeAdvice, DedupeIndex, InMemoryDedupeIndex};
pub use pbn_lock::{
    lock_duplicate_pbn, DuplicateLockOutcome, InMemorySlabDepot, PbnLock, PbnLockType,
    PhysicalZone, SlabDepot,
};
