//! The hash lock: per-content-hash coordination state.
//!
//! A hash lock funnels concurrent writers of identical data through one
//! agent so they share a single index query, a single read lock on the
//! duplicate block, and (when possible) a single physical write. The state
//! field is authoritative; the associated data (agent, duplicate,
//! duplicate lock) is only meaningful in the states that use it.
//!
//! The lock itself is a passive record. All transitions run on the owning
//! hash zone, in `hash_zone`.

use std::sync::Arc;

use dedupstore_core::data_vio::DataVio;
use dedupstore_core::mapping::ZonedPbn;
use dedupstore_core::types::{ChunkName, PhysicalBlockNumber};
use dedupstore_core::wait_queue::WaitQueue;

use crate::pbn_lock::PbnLock;

/// Key of a hash lock within its zone's pool.
pub type HashLockKey = usize;

/// The states of the hash lock machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashLockState {
    /// Fresh from the pool; no work started.
    Initializing,
    /// The agent is querying the dedup index.
    Querying,
    /// The agent is compressing and writing new data.
    Writing,
    /// The agent is acquiring a read lock on the advised duplicate block.
    Locking,
    /// The agent is reading the advised block and comparing its bytes.
    Verifying,
    /// All holders are adding references against the duplicate lock; no
    /// agent.
    Deduping,
    /// The agent is updating the dedup index.
    Updating,
    /// The agent is releasing the duplicate block lock.
    Unlocking,
    /// Dedup abandoned; holders proceed on the plain write path.
    Bypassing,
    /// Final state before returning to the pool.
    Destroying,
}

impl HashLockState {
    /// A short name for errors and tracing.
    pub fn name(&self) -> &'static str {
        match self {
            HashLockState::Initializing => "Initializing",
            HashLockState::Querying => "Querying",
            HashLockState::Writing => "Writing",
            HashLockState::Locking => "Locking",
            HashLockState::Verifying => "Verifying",
            HashLockState::Deduping => "Deduping",
            HashLockState::Updating => "Updating",
            HashLockState::Unlocking => "Unlocking",
            HashLockState::Bypassing => "Bypassing",
            HashLockState::Destroying => "Destroying",
        }
    }
}

/// Asynchronous work a hash zone asks its driver to perform. Completions
/// re-enter the zone through the matching `continue_*` method.
#[derive(Debug)]
pub enum DedupeAction {
    /// Query the dedup index for the DataVIO's hash.
    QueryIndex {
        /// The agent performing the query.
        vio: Arc<DataVio>,
    },
    /// Update the dedup index with the lock's final duplicate location.
    UpdateIndex {
        /// The agent performing the update.
        vio: Arc<DataVio>,
    },
    /// Acquire a read lock on the advised duplicate block, on its
    /// physical zone.
    LockDuplicatePbn {
        /// The agent acquiring the lock.
        vio: Arc<DataVio>,
        /// The advised block.
        pbn: PhysicalBlockNumber,
    },
    /// Read the duplicate block and compare it with the agent's data.
    VerifyDuplication {
        /// The agent verifying.
        vio: Arc<DataVio>,
        /// The candidate duplicate.
        duplicate: ZonedPbn,
    },
    /// Compress and write the DataVIO's own data.
    WriteData {
        /// The writer.
        vio: Arc<DataVio>,
    },
    /// Pull the agent out of the packer so a sharer is not stalled behind
    /// compression.
    CancelCompression {
        /// The agent to progress.
        vio: Arc<DataVio>,
    },
    /// Release the duplicate block lock, on its physical zone.
    ReleaseDuplicateLock {
        /// The agent releasing.
        vio: Arc<DataVio>,
        /// The locked block.
        pbn: PhysicalBlockNumber,
        /// The lock being released.
        lock: Arc<PbnLock>,
    },
    /// Add the DataVIO's block map reference to the verified duplicate.
    UpdateBlockMap {
        /// The deduplicating DataVIO.
        vio: Arc<DataVio>,
        /// The shared duplicate location.
        duplicate: ZonedPbn,
    },
}

/// One hash lock.
pub struct HashLock {
    pub(crate) state: HashLockState,
    pub(crate) chunk_name: ChunkName,
    /// True while the zone map still points at this lock. A forked lock
    /// is superseded in the map but lives until its holders finish.
    pub(crate) registered: bool,
    pub(crate) agent: Option<Arc<DataVio>>,
    pub(crate) waiters: WaitQueue<Arc<DataVio>>,
    pub(crate) duplicate: Option<ZonedPbn>,
    pub(crate) duplicate_lock: Option<Arc<PbnLock>>,
    pub(crate) verified: bool,
    pub(crate) verify_counted: bool,
    pub(crate) update_advice: bool,
    pub(crate) duplicate_ring: Vec<Arc<DataVio>>,
    pub(crate) reference_count: u32,
}

impl HashLock {
    pub(crate) fn new() -> Self {
        Self {
            state: HashLockState::Initializing,
            chunk_name: ChunkName::default(),
            registered: false,
            agent: None,
            waiters: WaitQueue::new(),
            duplicate: None,
            duplicate_lock: None,
            verified: false,
            verify_counted: false,
            update_advice: false,
            duplicate_ring: Vec::new(),
            reference_count: 0,
        }
    }

    pub(crate) fn reset(&mut self, chunk_name: ChunkName) {
        debug_assert!(self.waiters.is_empty());
        debug_assert!(self.duplicate_lock.is_none());
        self.state = HashLockState::Initializing;
        self.chunk_name = chunk_name;
        self.registered = true;
        self.agent = None;
        self.duplicate = None;
        self.duplicate_lock = None;
        self.verified = false;
        self.verify_counted = false;
        self.update_advice = false;
        self.duplicate_ring.clear();
        self.reference_count = 0;
    }

    /// The lock's current state.
    pub fn state(&self) -> HashLockState {
        self.state
    }

    /// The content hash this lock coordinates.
    pub fn chunk_name(&self) -> ChunkName {
        self.chunk_name
    }

    /// The id of the current agent, if one is driving the lock.
    pub fn agent_id(&self) -> Option<u64> {
        self.agent.as_ref().map(|vio| vio.id())
    }

    /// DataVIOs queued behind the agent.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// The candidate or verified duplicate location.
    pub fn duplicate(&self) -> Option<ZonedPbn> {
        self.duplicate
    }

    /// True while the lock holds a read lock on the duplicate block.
    pub fn has_duplicate_lock(&self) -> bool {
        self.duplicate_lock.is_some()
    }

    /// DataVIOs currently pointing at this lock.
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    /// True once the duplicate's bytes have been confirmed equal.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// True if the index must be updated during cleanup.
    pub fn needs_index_update(&self) -> bool {
        self.update_advice
    }

    pub(crate) fn is_agent(&self, vio: &Arc<DataVio>) -> bool {
        self.agent.as_ref().map(|a| a.id()) == Some(vio.id())
    }

    pub(crate) fn detach(&mut self, vio: &Arc<DataVio>) {
        self.duplicate_ring.retain(|member| member.id() != vio.id());
        debug_assert!(self.reference_count > 0);
        self.reference_count -= 1;
        vio.state().hash_lock = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dedupstore_core::types::LogicalBlockNumber;

    fn make_vio(id: u64) -> Arc<DataVio> {
        Arc::new(DataVio::new(
            id,
            LogicalBlockNumber::new(id),
            ChunkName::new([9; 16]),
            Bytes::from_static(b"data"),
        ))
    }

    #[test]
    fn test_state_names() {
        assert_eq!(HashLockState::Initializing.name(), "Initializing");
        assert_eq!(HashLockState::Destroying.name(), "Destroying");
    }

    #[test]
    fn test_reset_clears_lifecycle_fields() {
        let mut lock = HashLock::new();
        lock.state = HashLockState::Destroying;
        lock.verified = true;
        lock.update_advice = true;

        lock.reset(ChunkName::new([1; 16]));
        assert_eq!(lock.state(), HashLockState::Initializing);
        assert!(!lock.is_verified());
        assert!(!lock.needs_index_update());
        assert!(lock.registered);
        assert_eq!(lock.reference_count(), 0);
    }

    #[test]
    fn test_detach_removes_from_ring() {
        let mut lock = HashLock::new();
        lock.reset(ChunkName::new([1; 16]));
        let vio = make_vio(1);
        vio.state().hash_lock = Some(0);
        lock.duplicate_ring.push(Arc::clone(&vio));
        lock.reference_count = 1;

        lock.detach(&vio);
        assert!(lock.duplicate_ring.is_empty());
        assert_eq!(lock.reference_count(), 0);
        assert_eq!(vio.state().hash_lock, None);
    }

    #[test]
    fn test_agent_identity() {
        let mut lock = HashLock::new();
        lock.reset(ChunkName::new([1; 16]));
        let agent = make_vio(1);
        let other = make_vio(2);
        lock.agent = Some(Arc::clone(&agent));
        assert!(lock.is_agent(&agent));
        assert!(!lock.is_agent(&other));
        assert_eq!(lock.agent_id(), Some(1));
    }
}
