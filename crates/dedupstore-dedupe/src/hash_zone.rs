//! Hash zones: the keyed table of hash locks and their state machine.
//!
//! Each zone owns a pool of hash locks and the map from content hash to
//! the active lock for that hash. Every transition of a lock runs here, on
//! the zone's thread. Asynchronous steps (index queries, writes, PBN
//! locking, verification) are emitted as [`DedupeAction`]s; the driver
//! performs them and re-enters the zone through the matching `continue_*`
//! method.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dedupstore_core::data_vio::DataVio;
use dedupstore_core::types::ChunkName;
use dedupstore_core::wait_queue::WaitQueue;

use crate::error::{DedupeError, DedupeResult};
use crate::hash_lock::{DedupeAction, HashLock, HashLockKey, HashLockState};
use crate::index::DedupeAdvice;
use crate::pbn_lock::{DuplicateLockOutcome, PbnLock};

/// Initial size of a zone's hash lock pool. The pool grows on demand.
pub const LOCK_POOL_CAPACITY: usize = 16;

/// Counters for one hash zone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashZoneStats {
    /// Index advice that verified as a true duplicate.
    pub dedupe_advice_valid: u64,
    /// Index advice that was unusable, write-locked, or failed
    /// verification.
    pub dedupe_advice_stale: u64,
    /// Writers that joined an existing lock with matching data.
    pub concurrent_data_matches: u64,
    /// Writers whose data differed from an existing lock's holders.
    pub concurrent_hash_collisions: u64,
    /// Hash locks currently in use.
    pub curr_hash_locks: u64,
    /// High watermark of locks in use.
    pub max_hash_locks: u64,
}

/// One hash zone.
pub struct HashZone {
    zone_id: u8,
    pool: Vec<HashLock>,
    free_keys: Vec<HashLockKey>,
    lock_map: HashMap<ChunkName, HashLockKey>,
    actions: VecDeque<DedupeAction>,
    stats: HashZoneStats,
}

impl HashZone {
    /// Creates a zone with a pre-allocated lock pool.
    pub fn new(zone_id: u8) -> Self {
        let pool: Vec<HashLock> = (0..LOCK_POOL_CAPACITY).map(|_| HashLock::new()).collect();
        let free_keys = (0..LOCK_POOL_CAPACITY).rev().collect();
        Self {
            zone_id,
            pool,
            free_keys,
            lock_map: HashMap::new(),
            actions: VecDeque::new(),
            stats: HashZoneStats::default(),
        }
    }

    /// This zone's identifier.
    pub fn zone_id(&self) -> u8 {
        self.zone_id
    }

    /// Zone counters.
    pub fn stats(&self) -> &HashZoneStats {
        &self.stats
    }

    /// The lock at `key`, for inspection.
    pub fn lock(&self, key: HashLockKey) -> &HashLock {
        &self.pool[key]
    }

    /// The active lock key for a hash, if one is registered.
    pub fn lock_for(&self, name: &ChunkName) -> Option<HashLockKey> {
        self.lock_map.get(name).copied()
    }

    /// Removes the oldest emitted action for the driver to perform.
    pub fn next_action(&mut self) -> Option<DedupeAction> {
        self.actions.pop_front()
    }

    /// Removes every emitted action, oldest first.
    pub fn drain_actions(&mut self) -> Vec<DedupeAction> {
        self.actions.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Acquisition and release
    // ------------------------------------------------------------------

    /// Acquires the hash lock for the DataVIO's content hash.
    ///
    /// Returns `None` without attaching when dedup is not possible for
    /// this request: zero blocks, or a hash collision with the data
    /// already under the lock (the request then proceeds as a plain
    /// write).
    pub fn acquire_hash_lock(&mut self, vio: &Arc<DataVio>) -> DedupeResult<Option<HashLockKey>> {
        debug_assert!(vio.state().hash_lock.is_none());
        if vio.is_zero_block() {
            return Ok(None);
        }
        let name = vio.chunk_name();

        if let Some(&key) = self.lock_map.get(&name) {
            if let Some(member) = self.pool[key].duplicate_ring.first() {
                if member.data() != vio.data() {
                    self.stats.concurrent_hash_collisions += 1;
                    tracing::debug!(vio = vio.id(), %name, "hash collision; dedup bypassed");
                    return Ok(None);
                }
                self.stats.concurrent_data_matches += 1;
            }
            self.attach(key, vio);
            return Ok(Some(key));
        }

        let key = self.allocate_lock(name);
        self.lock_map.insert(name, key);
        self.attach(key, vio);
        Ok(Some(key))
    }

    fn allocate_lock(&mut self, name: ChunkName) -> HashLockKey {
        let key = match self.free_keys.pop() {
            Some(key) => key,
            None => {
                self.pool.push(HashLock::new());
                self.pool.len() - 1
            }
        };
        self.pool[key].reset(name);
        self.stats.curr_hash_locks += 1;
        self.stats.max_hash_locks = self.stats.max_hash_locks.max(self.stats.curr_hash_locks);
        key
    }

    fn attach(&mut self, key: HashLockKey, vio: &Arc<DataVio>) {
        let lock = &mut self.pool[key];
        lock.duplicate_ring.push(Arc::clone(vio));
        lock.reference_count += 1;
        vio.state().hash_lock = Some(key);
    }

    /// Detaches a DataVIO and returns the lock to the pool once nothing
    /// references it.
    fn exit_lock(&mut self, key: HashLockKey, vio: &Arc<DataVio>) {
        {
            let lock = &mut self.pool[key];
            lock.detach(vio);
        }
        let lock = &self.pool[key];
        if lock.reference_count == 0 && lock.agent.is_none() && lock.waiters.is_empty() {
            self.destroy_lock(key);
        }
    }

    fn destroy_lock(&mut self, key: HashLockKey) {
        let name = {
            let lock = &mut self.pool[key];
            debug_assert!(lock.duplicate_lock.is_none(), "destroying a lock still holding a PBN lock");
            lock.state = HashLockState::Destroying;
            lock.chunk_name
        };
        if self.pool[key].registered {
            if self.lock_map.get(&name) == Some(&key) {
                self.lock_map.remove(&name);
            }
            self.pool[key].registered = false;
        }
        self.free_keys.push(key);
        self.stats.curr_hash_locks -= 1;
        tracing::debug!(key, %name, "hash lock destroyed");
    }

    // ------------------------------------------------------------------
    // Entry and continuation dispatch
    // ------------------------------------------------------------------

    /// Dispatches a DataVIO that has acquired the lock and is not a hash
    /// collision.
    pub fn enter_hash_lock(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> DedupeResult<()> {
        self.ensure_held(key, &vio)?;
        let state = self.pool[key].state;
        tracing::debug!(vio = vio.id(), state = state.name(), "entering hash lock");
        match state {
            HashLockState::Initializing => {
                self.pool[key].agent = Some(Arc::clone(&vio));
                self.start_querying(key);
                Ok(())
            }
            HashLockState::Querying
            | HashLockState::Updating
            | HashLockState::Locking
            | HashLockState::Verifying
            | HashLockState::Unlocking => {
                self.pool[key].waiters.enqueue(vio);
                Ok(())
            }
            HashLockState::Writing => {
                // Do not let the packer hold the agent indefinitely while
                // a sharer waits behind it.
                let agent = self.pool[key].agent.clone();
                self.pool[key].waiters.enqueue(vio);
                if let Some(agent) = agent {
                    self.actions.push_back(DedupeAction::CancelCompression { vio: agent });
                }
                Ok(())
            }
            HashLockState::Bypassing => {
                self.actions.push_back(DedupeAction::WriteData { vio });
                Ok(())
            }
            HashLockState::Deduping => {
                if !self.launch_dedupe(key, &vio, false) {
                    self.fork(key, vio);
                }
                Ok(())
            }
            HashLockState::Destroying => Err(DedupeError::InvalidLockState {
                state: state.name(),
                operation: "enter",
            }),
        }
    }

    /// Continues a DataVIO whose asynchronous step completed while holding
    /// the lock.
    pub fn continue_hash_lock(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> DedupeResult<()> {
        self.ensure_held(key, &vio)?;
        match self.pool[key].state {
            HashLockState::Writing => self.continue_writing(key, vio, None),
            HashLockState::Deduping => self.finish_deduping(key, vio),
            HashLockState::Bypassing => {
                self.exit_lock(key, &vio);
                Ok(())
            }
            state => Err(DedupeError::InvalidLockState {
                state: state.name(),
                operation: "continue",
            }),
        }
    }

    // ------------------------------------------------------------------
    // Querying
    // ------------------------------------------------------------------

    fn start_querying(&mut self, key: HashLockKey) {
        let agent = {
            let lock = &mut self.pool[key];
            lock.state = HashLockState::Querying;
            lock.agent.clone().expect("querying requires an agent")
        };
        self.actions.push_back(DedupeAction::QueryIndex { vio: agent });
    }

    /// Applies the index's answer to a query.
    pub fn continue_querying(
        &mut self,
        key: HashLockKey,
        vio: Arc<DataVio>,
        advice: Option<DedupeAdvice>,
    ) -> DedupeResult<()> {
        self.ensure_state(key, HashLockState::Querying, "continue_querying")?;
        self.ensure_agent(key, &vio, "continue_querying")?;

        let usable = advice.filter(|a| a.is_usable());
        if advice.is_some() && usable.is_none() {
            self.stats.dedupe_advice_stale += 1;
        }

        match usable {
            Some(advice) => {
                {
                    let lock = &mut self.pool[key];
                    lock.duplicate = Some(advice.location);
                    let mut state = vio.state();
                    state.is_duplicate = true;
                    state.duplicate = Some(advice.location);
                }
                self.start_locking(key);
            }
            None => {
                // If the agent already has an allocation, the query posted
                // it to the index, so no later update is required.
                self.pool[key].update_advice = !vio.has_allocation();
                self.start_writing(key);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Locking and verifying
    // ------------------------------------------------------------------

    fn start_locking(&mut self, key: HashLockKey) {
        let (agent, pbn) = {
            let lock = &mut self.pool[key];
            debug_assert!(lock.duplicate_lock.is_none());
            lock.state = HashLockState::Locking;
            (
                lock.agent.clone().expect("locking requires an agent"),
                lock.duplicate.expect("locking requires advice").pbn,
            )
        };
        self.actions.push_back(DedupeAction::LockDuplicatePbn { vio: agent, pbn });
    }

    /// Applies the outcome of locking the advised duplicate block.
    pub fn continue_locking(
        &mut self,
        key: HashLockKey,
        vio: Arc<DataVio>,
        outcome: DuplicateLockOutcome,
    ) -> DedupeResult<()> {
        self.ensure_state(key, HashLockState::Locking, "continue_locking")?;
        self.ensure_agent(key, &vio, "continue_locking")?;

        match outcome {
            DuplicateLockOutcome::Stale => {
                // The advised block is being rewritten or has no reference
                // budget left.
                self.stats.dedupe_advice_stale += 1;
                {
                    let lock = &mut self.pool[key];
                    lock.update_advice = true;
                    vio.state().is_duplicate = false;
                }
                self.start_writing(key);
            }
            DuplicateLockOutcome::Locked(pbn_lock) => {
                self.set_duplicate_lock(key, pbn_lock);
                let lock = &mut self.pool[key];
                if !lock.verified {
                    self.start_verifying(key);
                } else if lock
                    .duplicate_lock
                    .as_ref()
                    .expect("just set")
                    .claim_increment()
                {
                    // Already verified on a previous hold and an increment
                    // is available: dedupe without re-reading.
                    self.start_deduping(key, false);
                } else {
                    // Re-locked but the budget is exhausted; release and
                    // write a new copy.
                    lock.verified = false;
                    lock.update_advice = true;
                    self.start_unlocking(key);
                }
            }
        }
        Ok(())
    }

    fn set_duplicate_lock(&mut self, key: HashLockKey, pbn_lock: Arc<PbnLock>) {
        pbn_lock.acquire_holder();
        self.pool[key].duplicate_lock = Some(pbn_lock);
    }

    fn start_verifying(&mut self, key: HashLockKey) {
        let (agent, duplicate) = {
            let lock = &mut self.pool[key];
            lock.state = HashLockState::Verifying;
            (
                lock.agent.clone().expect("verifying requires an agent"),
                lock.duplicate.expect("verifying requires a candidate"),
            )
        };
        self.actions
            .push_back(DedupeAction::VerifyDuplication { vio: agent, duplicate });
    }

    /// Applies the result of the byte comparison against the advised
    /// block.
    pub fn continue_verifying(
        &mut self,
        key: HashLockKey,
        vio: Arc<DataVio>,
        matched: bool,
    ) -> DedupeResult<()> {
        self.ensure_state(key, HashLockState::Verifying, "continue_verifying")?;
        self.ensure_agent(key, &vio, "continue_verifying")?;

        if matched {
            if !self.pool[key].verify_counted {
                self.pool[key].verify_counted = true;
                self.stats.dedupe_advice_valid += 1;
            }
            let claimed = self.pool[key]
                .duplicate_lock
                .as_ref()
                .expect("verifying holds the duplicate lock")
                .claim_increment();
            if claimed {
                self.pool[key].verified = true;
                self.start_deduping(key, false);
            } else {
                // True duplicate, but its references are exhausted. Roll
                // over by treating the lock as unverified so the agent
                // writes a new copy after unlocking.
                let lock = &mut self.pool[key];
                lock.verified = false;
                lock.update_advice = true;
                self.start_unlocking(key);
            }
        } else {
            if !self.pool[key].verify_counted {
                self.pool[key].verify_counted = true;
                self.stats.dedupe_advice_stale += 1;
            }
            let lock = &mut self.pool[key];
            lock.verified = false;
            lock.update_advice = true;
            self.start_unlocking(key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deduping
    // ------------------------------------------------------------------

    /// Enters Deduping and launches every holder against the duplicate
    /// lock. When `agent_is_done` the agent already made its own block map
    /// update (it wrote the block or updated the index) and exits instead
    /// of deduping.
    fn start_deduping(&mut self, key: HashLockKey, agent_is_done: bool) {
        let agent = {
            let lock = &mut self.pool[key];
            lock.state = HashLockState::Deduping;
            lock.agent.take().expect("deduping is entered by an agent")
        };

        if agent_is_done {
            self.exit_lock(key, &agent);
        } else {
            // The agent claimed its increment before Deduping was entered.
            let launched = self.launch_dedupe(key, &agent, true);
            debug_assert!(launched);
        }

        loop {
            let waiter = match self.pool[key].waiters.dequeue() {
                Some(waiter) => waiter,
                None => break,
            };
            if !self.launch_dedupe(key, &waiter, false) {
                self.fork(key, waiter);
                return;
            }
        }
    }

    /// Sends one holder to make its block map reference to the duplicate.
    /// Returns false when the increment budget is exhausted; the caller
    /// must fork.
    fn launch_dedupe(&mut self, key: HashLockKey, vio: &Arc<DataVio>, has_claim: bool) -> bool {
        let duplicate = {
            let lock = &self.pool[key];
            debug_assert_eq!(lock.state, HashLockState::Deduping);
            let duplicate = lock.duplicate.expect("deduping requires a duplicate");
            let pbn_lock = lock.duplicate_lock.as_ref().expect("deduping holds the lock");
            if !has_claim && !pbn_lock.claim_increment() {
                return false;
            }
            duplicate
        };
        {
            let mut state = vio.state();
            state.is_duplicate = true;
            state.duplicate = Some(duplicate);
        }
        self.actions
            .push_back(DedupeAction::UpdateBlockMap { vio: Arc::clone(vio), duplicate });
        true
    }

    /// Finishes one holder's block map update. The last holder out drives
    /// the lock's cleanup.
    fn finish_deduping(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> DedupeResult<()> {
        debug_assert!(self.pool[key].agent.is_none(), "deduping has no agent");
        if self.pool[key].reference_count > 1 {
            self.exit_lock(key, &vio);
            return Ok(());
        }

        // The last holder becomes the cleanup agent.
        self.pool[key].agent = Some(Arc::clone(&vio));
        if self.pool[key].update_advice {
            self.start_updating(key);
        } else if self.pool[key].duplicate_lock.is_some() {
            self.start_unlocking(key);
        } else {
            self.start_destroying(key);
        }
        Ok(())
    }

    /// Replaces an exhausted lock with a fresh one for the same hash. The
    /// displaced DataVIO becomes the new lock's writing agent, and every
    /// waiter still queued on the old lock transfers to the new one.
    fn fork(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> HashLockKey {
        let name = self.pool[key].chunk_name;
        tracing::debug!(vio = vio.id(), %name, "hash lock rollover fork");

        // Only the new lock will update the index.
        self.pool[key].update_advice = false;
        self.pool[key].registered = false;
        {
            let lock = &mut self.pool[key];
            lock.detach(&vio);
        }

        let new_key = self.allocate_lock(name);
        self.lock_map.insert(name, new_key);
        self.pool[new_key].update_advice = true;

        // Transfer the old lock's remaining waiters.
        loop {
            let waiter = match self.pool[key].waiters.dequeue() {
                Some(waiter) => waiter,
                None => break,
            };
            self.pool[key].detach(&waiter);
            self.attach(new_key, &waiter);
            self.pool[new_key].waiters.enqueue(waiter);
        }

        self.attach(new_key, &vio);
        self.pool[new_key].agent = Some(vio);
        self.start_writing(new_key);
        new_key
    }

    // ------------------------------------------------------------------
    // Writing
    // ------------------------------------------------------------------

    fn start_writing(&mut self, key: HashLockKey) {
        let agent = {
            let lock = &mut self.pool[key];
            lock.state = HashLockState::Writing;
            lock.agent.clone().expect("writing requires an agent")
        };
        self.actions.push_back(DedupeAction::WriteData { vio: agent });
    }

    /// Finishes the agent's write of its own data. `allocation_lock` is
    /// the agent's PBN lock on the block it wrote, required (downgraded to
    /// a read lock) when sharers are waiting to dedupe against it.
    pub fn continue_writing(
        &mut self,
        key: HashLockKey,
        vio: Arc<DataVio>,
        allocation_lock: Option<Arc<PbnLock>>,
    ) -> DedupeResult<()> {
        self.ensure_state(key, HashLockState::Writing, "continue_writing")?;
        self.ensure_agent(key, &vio, "continue_writing")?;

        // The lock's duplicate is now the agent's freshly written block,
        // verified by construction.
        let new_mapped = vio.state().new_mapped;
        {
            let lock = &mut self.pool[key];
            lock.duplicate = Some(new_mapped);
            lock.verified = true;
        }

        if !self.pool[key].waiters.is_empty() {
            let lock = allocation_lock.ok_or(DedupeError::LockNotDowngraded)?;
            self.transfer_allocation_lock(key, &vio, lock)?;
            self.start_deduping(key, true);
        } else if self.pool[key].update_advice {
            self.start_updating(key);
        } else if self.pool[key].duplicate_lock.is_some() {
            // A compressed write leaves us sharing a read lock that must
            // be released before the lock can be destroyed.
            self.start_unlocking(key);
        } else {
            self.start_destroying(key);
        }
        Ok(())
    }

    /// Shares the agent's just-written block with the lock: the agent's
    /// write lock, already downgraded to a read lock, becomes the
    /// duplicate lock.
    fn transfer_allocation_lock(
        &mut self,
        key: HashLockKey,
        vio: &Arc<DataVio>,
        allocation_lock: Arc<PbnLock>,
    ) -> DedupeResult<()> {
        if !allocation_lock.is_read_lock() {
            return Err(DedupeError::LockNotDowngraded);
        }
        let state = vio.state();
        if state.allocation != Some(state.new_mapped.pbn) {
            return Err(DedupeError::AllocationMismatch);
        }
        drop(state);
        self.set_duplicate_lock(key, allocation_lock);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Updating and unlocking
    // ------------------------------------------------------------------

    fn start_updating(&mut self, key: HashLockKey) {
        let agent = {
            let lock = &mut self.pool[key];
            debug_assert!(lock.update_advice);
            lock.state = HashLockState::Updating;
            lock.agent.clone().expect("updating requires an agent")
        };
        self.actions.push_back(DedupeAction::UpdateIndex { vio: agent });
    }

    /// Finishes the agent's index update and continues cleanup.
    pub fn continue_updating(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> DedupeResult<()> {
        self.ensure_state(key, HashLockState::Updating, "continue_updating")?;
        self.ensure_agent(key, &vio, "continue_updating")?;
        self.pool[key].update_advice = false;

        let has_waiters = !self.pool[key].waiters.is_empty();
        let has_lock = self.pool[key].duplicate_lock.is_some();
        if has_waiters && has_lock {
            self.start_deduping(key, true);
        } else if has_waiters {
            // Waiters arrived during the update. The agent's own work is
            // done; retire it to the first waiter, which re-locks the
            // recorded duplicate.
            let old_agent = self.pool[key].agent.take().expect("agent present");
            self.exit_lock(key, &old_agent);
            let new_agent = self.pool[key].waiters.dequeue().expect("waiter present");
            self.pool[key].agent = Some(new_agent);
            self.start_locking(key);
        } else if has_lock {
            self.start_unlocking(key);
        } else {
            self.start_destroying(key);
        }
        Ok(())
    }

    fn start_unlocking(&mut self, key: HashLockKey) {
        let (agent, pbn, pbn_lock) = {
            let lock = &mut self.pool[key];
            lock.state = HashLockState::Unlocking;
            (
                lock.agent.clone().expect("unlocking requires an agent"),
                lock.duplicate.expect("unlocking had a duplicate").pbn,
                lock.duplicate_lock.clone().expect("unlocking holds the lock"),
            )
        };
        self.actions.push_back(DedupeAction::ReleaseDuplicateLock {
            vio: agent,
            pbn,
            lock: pbn_lock,
        });
    }

    /// Finishes releasing the duplicate lock and decides where the lock
    /// goes next.
    pub fn finish_unlocking(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> DedupeResult<()> {
        self.ensure_state(key, HashLockState::Unlocking, "finish_unlocking")?;
        self.ensure_agent(key, &vio, "finish_unlocking")?;
        self.pool[key].duplicate_lock = None;

        if !self.pool[key].verified {
            // Nothing was deduped against the released lock; the agent
            // writes its own copy and remembers to update the index.
            self.pool[key].update_advice = true;
            self.start_writing(key);
            return Ok(());
        }

        if !self.pool[key].waiters.is_empty() {
            // A waiter arrived while unlocking. Retire the agent to the
            // first waiter and re-acquire the lock from scratch; the old
            // verification no longer holds.
            self.pool[key].verified = false;
            let old_agent = self.pool[key].agent.take().expect("agent present");
            self.exit_lock(key, &old_agent);
            let new_agent = self.pool[key].waiters.dequeue().expect("waiter present");
            self.pool[key].agent = Some(new_agent);
            self.start_locking(key);
            return Ok(());
        }

        self.start_destroying(key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bypass, abort, destroy
    // ------------------------------------------------------------------

    /// Handles an error raised while `vio` holds the lock. A non-agent
    /// erroring alone exits without disturbing the other holders;
    /// otherwise the whole lock bypasses dedup.
    pub fn abort_hash_lock(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> DedupeResult<()> {
        self.ensure_held(key, &vio)?;
        let is_agent = self.pool[key].is_agent(&vio);
        if !is_agent && self.pool[key].reference_count > 1 {
            self.remove_waiter(key, &vio);
            self.exit_lock(key, &vio);
            return Ok(());
        }
        if !is_agent {
            // The lock had no agent (or only this holder); the erroring
            // DataVIO drives the bypass so any duplicate lock gets
            // released.
            self.remove_waiter(key, &vio);
            self.pool[key].agent = Some(Arc::clone(&vio));
        }
        self.start_bypassing(key);
        Ok(())
    }

    fn remove_waiter(&mut self, key: HashLockKey, vio: &Arc<DataVio>) {
        let lock = &mut self.pool[key];
        let mut retained = WaitQueue::new();
        lock.waiters.notify_all(|waiter| {
            if waiter.id() != vio.id() {
                retained.enqueue(waiter);
            }
        });
        lock.waiters = retained;
    }

    fn start_bypassing(&mut self, key: HashLockKey) {
        self.pool[key].state = HashLockState::Bypassing;
        self.pool[key].update_advice = false;
        tracing::debug!(key, "hash lock bypassing dedup");

        // Every waiter takes the plain compress-and-write path; each exits
        // the lock as it continues.
        let mut launched = Vec::new();
        self.pool[key].waiters.notify_all(|waiter| launched.push(waiter));
        for waiter in launched {
            self.actions.push_back(DedupeAction::WriteData { vio: waiter });
        }

        let has_lock = self.pool[key].duplicate_lock.is_some();
        let agent = self.pool[key].agent.clone();
        match (has_lock, agent) {
            (true, Some(agent)) => {
                // The agent must visit the duplicate zone to release the
                // lock before it can exit.
                let (pbn, pbn_lock) = {
                    let lock = &self.pool[key];
                    (
                        lock.duplicate.expect("lock implies duplicate").pbn,
                        lock.duplicate_lock.clone().expect("checked"),
                    )
                };
                self.actions.push_back(DedupeAction::ReleaseDuplicateLock {
                    vio: agent,
                    pbn,
                    lock: pbn_lock,
                });
            }
            (false, Some(agent)) => {
                self.pool[key].agent = None;
                self.exit_lock(key, &agent);
            }
            (true, None) => {
                debug_assert!(false, "a duplicate lock cannot be held without an agent");
            }
            (false, None) => {
                if self.pool[key].reference_count == 0 && self.pool[key].waiters.is_empty() {
                    self.destroy_lock(key);
                }
            }
        }
    }

    /// Finishes a bypass after the duplicate lock has been released.
    pub fn finish_bypassing(&mut self, key: HashLockKey, vio: Arc<DataVio>) -> DedupeResult<()> {
        self.ensure_state(key, HashLockState::Bypassing, "finish_bypassing")?;
        self.ensure_agent(key, &vio, "finish_bypassing")?;
        self.pool[key].duplicate_lock = None;
        self.pool[key].agent = None;
        self.exit_lock(key, &vio);
        Ok(())
    }

    fn start_destroying(&mut self, key: HashLockKey) {
        debug_assert!(self.pool[key].waiters.is_empty());
        if let Some(agent) = self.pool[key].agent.take() {
            self.exit_lock(key, &agent);
        } else if self.pool[key].reference_count == 0 {
            self.destroy_lock(key);
        }
    }

    // ------------------------------------------------------------------
    // Guards
    // ------------------------------------------------------------------

    fn ensure_held(&self, key: HashLockKey, vio: &Arc<DataVio>) -> DedupeResult<()> {
        if vio.state().hash_lock != Some(key) {
            return Err(DedupeError::LockNotHeld { vio: vio.id() });
        }
        Ok(())
    }

    fn ensure_state(
        &self,
        key: HashLockKey,
        expected: HashLockState,
        operation: &'static str,
    ) -> DedupeResult<()> {
        let state = self.pool[key].state;
        if state != expected {
            return Err(DedupeError::InvalidLockState {
                state: state.name(),
                operation,
            });
        }
        Ok(())
    }

    fn ensure_agent(
        &self,
        key: HashLockKey,
        vio: &Arc<DataVio>,
        operation: &'static str,
    ) -> DedupeResult<()> {
        if !self.pool[key].is_agent(vio) {
            return Err(DedupeError::NotTheAgent {
                vio: vio.id(),
                operation,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dedupstore_core::mapping::{BlockMappingState, ZonedPbn};
    use dedupstore_core::types::{LogicalBlockNumber, PhysicalBlockNumber};

    use crate::pbn_lock::{PbnLock, PbnLockType};

    fn make_vio(id: u64, data: &'static [u8]) -> Arc<DataVio> {
        Arc::new(DataVio::new(
            id,
            LogicalBlockNumber::new(id),
            ChunkName::new([7; 16]),
            Bytes::from_static(data),
        ))
    }

    fn mapped(pbn: u64) -> ZonedPbn {
        ZonedPbn::new(PhysicalBlockNumber::new(pbn), BlockMappingState::Uncompressed)
    }

    fn read_lock_with_budget(budget: u32) -> Arc<PbnLock> {
        let lock = Arc::new(PbnLock::new(PbnLockType::ReadLock));
        lock.set_increment_limit(budget);
        lock
    }

    #[test]
    fn test_acquire_allocates_and_reuses_by_hash() {
        let mut zone = HashZone::new(0);
        let a = make_vio(1, b"same");
        let b = make_vio(2, b"same");

        let key_a = zone.acquire_hash_lock(&a).unwrap().unwrap();
        let key_b = zone.acquire_hash_lock(&b).unwrap().unwrap();
        assert_eq!(key_a, key_b);
        assert_eq!(zone.lock(key_a).reference_count(), 2);
        assert_eq!(zone.stats().concurrent_data_matches, 1);
        assert_eq!(zone.stats().curr_hash_locks, 1);
    }

    #[test]
    fn test_hash_collision_bypasses_dedup() {
        let mut zone = HashZone::new(0);
        let a = make_vio(1, b"content-a");
        let b = make_vio(2, b"content-b");

        let key_a = zone.acquire_hash_lock(&a).unwrap();
        assert!(key_a.is_some());

        // Same hash, different bytes: the entrant gets no lock.
        let key_b = zone.acquire_hash_lock(&b).unwrap();
        assert!(key_b.is_none());
        assert!(b.state().hash_lock.is_none());
        assert_eq!(zone.stats().concurrent_hash_collisions, 1);
    }

    #[test]
    fn test_zero_block_skips_dedup() {
        let mut zone = HashZone::new(0);
        let zero = Arc::new(DataVio::new(
            1,
            LogicalBlockNumber::new(1),
            ChunkName::new([0; 16]),
            Bytes::from_static(&[0u8; 32]),
        ));
        assert_eq!(zone.acquire_hash_lock(&zero).unwrap(), None);
    }

    #[test]
    fn test_first_entrant_becomes_agent_and_queries() {
        let mut zone = HashZone::new(0);
        let vio = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&vio).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&vio)).unwrap();

        assert_eq!(zone.lock(key).state(), HashLockState::Querying);
        assert_eq!(zone.lock(key).agent_id(), Some(1));
        assert!(matches!(
            zone.next_action(),
            Some(DedupeAction::QueryIndex { .. })
        ));
    }

    #[test]
    fn test_entrant_during_writing_cancels_compression() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.drain_actions();

        // No advice: the agent goes to Writing.
        zone.continue_querying(key, Arc::clone(&agent), None).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Writing);

        let sharer = make_vio(2, b"data");
        zone.acquire_hash_lock(&sharer).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&sharer)).unwrap();
        assert_eq!(zone.lock(key).waiter_count(), 1);

        let actions = zone.drain_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            DedupeAction::CancelCompression { vio } if vio.id() == 1
        )));
    }

    #[test]
    fn test_no_advice_solo_writer_updates_and_destroys() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();

        // The agent had no allocation when it queried, so the index must
        // be updated once the write lands.
        zone.continue_querying(key, Arc::clone(&agent), None).unwrap();
        assert!(zone.lock(key).needs_index_update());

        {
            let mut state = agent.state();
            state.allocation = Some(PhysicalBlockNumber::new(9000));
            state.new_mapped = mapped(9000);
        }
        zone.continue_writing(key, Arc::clone(&agent), None).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Updating);

        zone.continue_updating(key, Arc::clone(&agent)).unwrap();
        assert_eq!(zone.stats().curr_hash_locks, 0);
        assert!(agent.state().hash_lock.is_none());
        assert!(zone.lock_for(&agent.chunk_name()).is_none());
    }

    #[test]
    fn test_posted_query_needs_no_update() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        agent.state().allocation = Some(PhysicalBlockNumber::new(9000));
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();

        zone.continue_querying(key, Arc::clone(&agent), None).unwrap();
        assert!(!zone.lock(key).needs_index_update());
    }

    #[test]
    fn test_unusable_advice_counts_stale() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();

        let advice = DedupeAdvice::new(ZonedPbn::default());
        zone.continue_querying(key, Arc::clone(&agent), Some(advice))
            .unwrap();
        assert_eq!(zone.stats().dedupe_advice_stale, 1);
        assert_eq!(zone.lock(key).state(), HashLockState::Writing);
    }

    #[test]
    fn test_advice_leads_to_locking_then_verifying() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();

        let advice = DedupeAdvice::new(mapped(5000));
        zone.continue_querying(key, Arc::clone(&agent), Some(advice))
            .unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Locking);
        assert!(agent.state().is_duplicate);

        let pbn_lock = read_lock_with_budget(4);
        zone.continue_locking(
            key,
            Arc::clone(&agent),
            DuplicateLockOutcome::Locked(pbn_lock),
        )
        .unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Verifying);
        assert!(zone.lock(key).has_duplicate_lock());
    }

    #[test]
    fn test_stale_lock_outcome_goes_to_writing() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.continue_querying(key, Arc::clone(&agent), Some(DedupeAdvice::new(mapped(5000))))
            .unwrap();

        zone.continue_locking(key, Arc::clone(&agent), DuplicateLockOutcome::Stale)
            .unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Writing);
        assert!(zone.lock(key).needs_index_update());
        assert!(!agent.state().is_duplicate);
        assert_eq!(zone.stats().dedupe_advice_stale, 1);
    }

    #[test]
    fn test_verify_match_dedupes() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.continue_querying(key, Arc::clone(&agent), Some(DedupeAdvice::new(mapped(5000))))
            .unwrap();
        zone.continue_locking(
            key,
            Arc::clone(&agent),
            DuplicateLockOutcome::Locked(read_lock_with_budget(4)),
        )
        .unwrap();
        zone.drain_actions();

        zone.continue_verifying(key, Arc::clone(&agent), true).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Deduping);
        assert_eq!(zone.stats().dedupe_advice_valid, 1);
        assert!(matches!(
            zone.next_action(),
            Some(DedupeAction::UpdateBlockMap { vio, .. }) if vio.id() == 1
        ));

        // The lone holder finishes; no update needed (advice was right),
        // so the lock unlocks and destroys.
        zone.continue_hash_lock(key, Arc::clone(&agent)).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Unlocking);
        let release = zone.next_action();
        assert!(matches!(release, Some(DedupeAction::ReleaseDuplicateLock { .. })));
        zone.finish_unlocking(key, Arc::clone(&agent)).unwrap();
        assert_eq!(zone.stats().curr_hash_locks, 0);
    }

    #[test]
    fn test_verify_mismatch_unlocks_then_writes() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.continue_querying(key, Arc::clone(&agent), Some(DedupeAdvice::new(mapped(5000))))
            .unwrap();
        zone.continue_locking(
            key,
            Arc::clone(&agent),
            DuplicateLockOutcome::Locked(read_lock_with_budget(4)),
        )
        .unwrap();

        zone.continue_verifying(key, Arc::clone(&agent), false).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Unlocking);
        assert_eq!(zone.stats().dedupe_advice_stale, 1);

        zone.finish_unlocking(key, Arc::clone(&agent)).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Writing);
        assert!(zone.lock(key).needs_index_update());
    }

    #[test]
    fn test_abort_non_agent_exits_alone() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let waiter = make_vio(2, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.acquire_hash_lock(&waiter).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&waiter)).unwrap();

        zone.abort_hash_lock(key, Arc::clone(&waiter)).unwrap();
        // The agent's query is undisturbed.
        assert_eq!(zone.lock(key).state(), HashLockState::Querying);
        assert_eq!(zone.lock(key).reference_count(), 1);
        assert_eq!(zone.lock(key).waiter_count(), 0);
        assert!(waiter.state().hash_lock.is_none());
    }

    #[test]
    fn test_abort_agent_bypasses_waiters_to_plain_writes() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let waiter = make_vio(2, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.acquire_hash_lock(&waiter).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&waiter)).unwrap();
        zone.drain_actions();

        zone.abort_hash_lock(key, Arc::clone(&agent)).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Bypassing);
        assert!(!zone.lock(key).needs_index_update());

        let actions = zone.drain_actions();
        assert!(actions.iter().any(|action| matches!(
            action,
            DedupeAction::WriteData { vio } if vio.id() == 2
        )));

        // Each bypassed holder exits as its plain write continues.
        zone.continue_hash_lock(key, Arc::clone(&waiter)).unwrap();
        assert_eq!(zone.stats().curr_hash_locks, 0);
    }

    #[test]
    fn test_late_entrant_in_bypassing_writes_directly() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        // Keep a second holder so the lock survives the agent's abort.
        let survivor = make_vio(3, b"data");
        zone.acquire_hash_lock(&survivor).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&survivor)).unwrap();
        zone.abort_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.drain_actions();

        let late = make_vio(2, b"data");
        zone.acquire_hash_lock(&late).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&late)).unwrap();
        assert!(matches!(
            zone.next_action(),
            Some(DedupeAction::WriteData { vio }) if vio.id() == 2
        ));
    }

    #[test]
    fn test_continue_requires_holding_the_lock() {
        let mut zone = HashZone::new(0);
        let holder = make_vio(1, b"data");
        let stranger = make_vio(2, b"data");
        let key = zone.acquire_hash_lock(&holder).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&holder)).unwrap();

        let err = zone.continue_hash_lock(key, stranger).unwrap_err();
        assert!(matches!(err, DedupeError::LockNotHeld { vio: 2 }));
    }

    #[test]
    fn test_continuations_require_matching_state() {
        let mut zone = HashZone::new(0);
        let vio = make_vio(1, b"data");
        let key = zone.acquire_hash_lock(&vio).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&vio)).unwrap();

        // Querying, not Verifying.
        let err = zone.continue_verifying(key, Arc::clone(&vio), true).unwrap_err();
        assert!(matches!(err, DedupeError::InvalidLockState { .. }));

        // Continue in Querying is illegal entirely.
        let err = zone.continue_hash_lock(key, vio).unwrap_err();
        assert!(matches!(err, DedupeError::InvalidLockState { .. }));
    }

    #[test]
    fn test_transfer_requires_downgraded_matching_lock() {
        let mut zone = HashZone::new(0);
        let agent = make_vio(1, b"data");
        let sharer = make_vio(2, b"data");
        let key = zone.acquire_hash_lock(&agent).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&agent)).unwrap();
        zone.continue_querying(key, Arc::clone(&agent), None).unwrap();
        zone.acquire_hash_lock(&sharer).unwrap().unwrap();
        zone.enter_hash_lock(key, Arc::clone(&sharer)).unwrap();

        {
            let mut state = agent.state();
            state.allocation = Some(PhysicalBlockNumber::new(9000));
            state.new_mapped = mapped(9000);
        }

        // Still a write lock: refused.
        let write_lock = Arc::new(PbnLock::new(PbnLockType::WriteData));
        let err = zone
            .continue_writing(key, Arc::clone(&agent), Some(write_lock))
            .unwrap_err();
        assert_eq!(err, DedupeError::LockNotDowngraded);

        // Downgraded: accepted, waiters launch against the new block.
        let lock = Arc::new(PbnLock::new(PbnLockType::WriteData));
        lock.downgrade_to_read().unwrap();
        lock.set_increment_limit(MAXIMUM_REFERENCE_COUNT_FOR_TEST);
        zone.continue_writing(key, Arc::clone(&agent), Some(lock)).unwrap();
        assert_eq!(zone.lock(key).state(), HashLockState::Deduping);
        assert_eq!(zone.lock(key).duplicate(), Some(mapped(9000)));
    }

    const MAXIMUM_REFERENCE_COUNT_FOR_TEST: u32 = 253;
}
