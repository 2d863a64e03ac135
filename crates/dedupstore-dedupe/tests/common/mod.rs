//! Shared test driver for the hash-lock machinery.
//!
//! Plays the role of the executors around a hash zone: it performs the
//! zone's emitted actions against an in-memory index, a physical zone, and
//! a slab depot double, then re-enters the zone with the results.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use dedupstore_core::data_vio::{DataVio, VioId};
use dedupstore_core::mapping::{BlockMappingState, ZonedPbn};
use dedupstore_core::types::{ChunkName, LogicalBlockNumber, PhysicalBlockNumber};
use dedupstore_dedupe::hash_lock::DedupeAction;
use dedupstore_dedupe::hash_zone::HashZone;
use dedupstore_dedupe::index::{DedupeIndex, InMemoryDedupeIndex};
use dedupstore_dedupe::pbn_lock::{
    lock_duplicate_pbn, InMemorySlabDepot, PbnLockAttempt, PbnLockType, PhysicalZone,
    MAXIMUM_REFERENCE_COUNT,
};
use dedupstore_dedupe::HashLockState;
use dedupstore_dedupe::SlabDepot;

/// Base of the physical range the driver allocates fresh blocks from.
pub const ALLOCATION_BASE: u64 = 9000;

pub struct Driver {
    pub zone: HashZone,
    pub physical: PhysicalZone,
    pub depot: InMemorySlabDepot,
    pub index: InMemoryDedupeIndex,
    /// Simulated device contents, for verification reads.
    pub blocks: HashMap<PhysicalBlockNumber, Bytes>,
    pub next_allocation: u64,
    /// Block map references made by deduplicating DataVIOs.
    pub block_map_updates: Vec<(VioId, ZonedPbn)>,
    /// DataVIOs that wrote their own copy.
    pub plain_writes: Vec<VioId>,
    /// Compression cancellations observed.
    pub cancelled: Vec<VioId>,
}

impl Driver {
    pub fn new() -> Self {
        Self {
            zone: HashZone::new(0),
            physical: PhysicalZone::new(0),
            depot: InMemorySlabDepot::new(),
            index: InMemoryDedupeIndex::new(),
            blocks: HashMap::new(),
            next_allocation: 0,
            block_map_updates: Vec::new(),
            plain_writes: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn make_vio(&self, id: VioId, name: ChunkName, data: &'static [u8]) -> Arc<DataVio> {
        Arc::new(DataVio::new(
            id,
            LogicalBlockNumber::new(id),
            name,
            Bytes::from_static(data),
        ))
    }

    /// Stores pre-existing content at a physical block, as if written by an
    /// earlier run.
    pub fn seed_block(&mut self, pbn: u64, data: &'static [u8]) {
        self.blocks
            .insert(PhysicalBlockNumber::new(pbn), Bytes::from_static(data));
    }

    /// Acquires and enters the hash lock for a DataVIO.
    pub fn launch(&mut self, vio: &Arc<DataVio>) -> Option<usize> {
        let key = self.zone.acquire_hash_lock(vio).unwrap();
        if let Some(key) = key {
            self.zone.enter_hash_lock(key, Arc::clone(vio)).unwrap();
        }
        key
    }

    fn key_of(vio: &Arc<DataVio>) -> usize {
        vio.state().hash_lock.expect("vio holds a hash lock")
    }

    /// Performs one emitted action. Returns false when the zone is idle.
    pub fn step(&mut self) -> bool {
        let action = match self.zone.next_action() {
            Some(action) => action,
            None => return false,
        };
        match action {
            DedupeAction::QueryIndex { vio } => {
                let posted = vio.state().allocation.map(|pbn| {
                    ZonedPbn::new(pbn, BlockMappingState::Uncompressed)
                });
                let advice = self.index.query(vio.chunk_name(), posted);
                let key = Self::key_of(&vio);
                self.zone.continue_querying(key, vio, advice).unwrap();
            }
            DedupeAction::LockDuplicatePbn { vio, pbn } => {
                let outcome =
                    lock_duplicate_pbn(&mut self.physical, &mut self.depot, pbn).unwrap();
                let key = Self::key_of(&vio);
                self.zone.continue_locking(key, vio, outcome).unwrap();
            }
            DedupeAction::VerifyDuplication { vio, duplicate } => {
                let matched = self
                    .blocks
                    .get(&duplicate.pbn)
                    .is_some_and(|stored| stored == vio.data());
                let key = Self::key_of(&vio);
                self.zone.continue_verifying(key, vio, matched).unwrap();
            }
            DedupeAction::WriteData { vio } => {
                let lock = self.write_block(&vio);
                let key = Self::key_of(&vio);
                let is_writing_agent = self.zone.lock(key).state() == HashLockState::Writing
                    && self.zone.lock(key).agent_id() == Some(vio.id());
                if is_writing_agent {
                    self.zone.continue_writing(key, vio, Some(lock)).unwrap();
                } else {
                    // Plain write on the bypass path; the holder exits.
                    self.zone.continue_hash_lock(key, vio).unwrap();
                }
            }
            DedupeAction::CancelCompression { vio } => {
                self.cancelled.push(vio.id());
            }
            DedupeAction::ReleaseDuplicateLock { vio, pbn, lock } => {
                let remaining = self.physical.release_pbn_lock(pbn, &lock);
                if remaining == 0 && lock.has_provisional_reference() {
                    self.depot.release_provisional_reference(pbn);
                }
                let key = Self::key_of(&vio);
                match self.zone.lock(key).state() {
                    HashLockState::Bypassing => self.zone.finish_bypassing(key, vio).unwrap(),
                    _ => self.zone.finish_unlocking(key, vio).unwrap(),
                }
            }
            DedupeAction::UpdateIndex { vio } => {
                let key = Self::key_of(&vio);
                let location = self.zone.lock(key).duplicate().expect("update has a location");
                self.index.update(vio.chunk_name(), location);
                self.zone.continue_updating(key, vio).unwrap();
            }
            DedupeAction::UpdateBlockMap { vio, duplicate } => {
                self.block_map_updates.push((vio.id(), duplicate));
                let key = Self::key_of(&vio);
                self.zone.continue_hash_lock(key, vio).unwrap();
            }
        }
        true
    }

    /// Performs every emitted action until the zone is idle.
    pub fn run(&mut self) {
        while self.step() {}
    }

    /// Simulates the compress-and-write path: allocates a block, writes the
    /// DataVIO's data, and downgrades the allocation's write lock for
    /// sharing.
    fn write_block(&mut self, vio: &Arc<DataVio>) -> Arc<dedupstore_dedupe::PbnLock> {
        let pbn = PhysicalBlockNumber::new(ALLOCATION_BASE + self.next_allocation);
        self.next_allocation += 1;

        let lock = match self.physical.attempt_pbn_lock(pbn, PbnLockType::WriteData) {
            PbnLockAttempt::Acquired(lock) => lock,
            PbnLockAttempt::Existing(_) => panic!("fresh allocation already locked"),
        };
        lock.acquire_holder();
        self.blocks.insert(pbn, vio.data().clone());
        {
            let mut state = vio.state();
            state.allocation = Some(pbn);
            state.new_mapped = ZonedPbn::new(pbn, BlockMappingState::Uncompressed);
        }
        // The writer holds the only reference; the rest of the budget is
        // available for deduplication.
        lock.downgrade_to_read().unwrap();
        lock.set_increment_limit(MAXIMUM_REFERENCE_COUNT - 1);
        self.plain_writes.push(vio.id());
        lock
    }
}
