//! The recovery journal: a circular write-ahead log of reference-count
//! deltas.
//!
//! The journal admits DataVIOs under a space budget, assigns them entry
//! slots in the active tail block, commits blocks through the physical
//! layer, acknowledges waiters in strict journal-point order, and reaps
//! ring space once the block map and slab journal no longer reference it.
//!
//! Every method here must run on the journal thread; the only state shared
//! with other zones lives in the [`LockCounter`] and the read-only
//! notifier. I/O completions re-enter through `complete_block_write` and
//! `complete_reap_flush`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use dedupstore_core::admin_state::{AdminState, AdminStateCode, DrainOperation};
use dedupstore_core::data_vio::DataVio;
use dedupstore_core::error::{CoreError, CoreResult};
use dedupstore_core::format::{
    RecoveryJournalEntry, RecoveryJournalState, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK,
};
use dedupstore_core::mapping::{BlockMappingState, JournalOperation};
use dedupstore_core::physical::{IoId, PhysicalLayer, WritePolicy};
use dedupstore_core::read_only::ReadOnlyNotifier;
use dedupstore_core::types::{
    JournalPoint, Nonce, PhysicalBlockNumber, RecoveryCount, SequenceNumber, ThreadConfig,
    ZoneType, MAX_JOURNAL_SEQUENCE,
};
use dedupstore_core::wait_queue::WaitQueue;

use crate::collab::{BlockMapEra, SlabJournalCommitter};
use crate::journal_block::JournalBlock;
use crate::lock_counter::LockCounter;

/// The number of usable blocks in a journal ring of the given size. A
/// quarter of the ring, capped at 8 blocks, is reserved so the replayer
/// always has headroom.
pub fn get_recovery_journal_length(journal_size: u64) -> u64 {
    journal_size - (journal_size / 4).min(8)
}

/// Configuration for the recovery journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryJournalConfig {
    /// Size of the on-disk ring, in blocks.
    pub journal_size: u64,
    /// Number of in-memory staging blocks.
    pub tail_buffer_size: usize,
    /// Journal-wide nonce stamped into every block header.
    pub nonce: Nonce,
    /// Generation byte for this journal incarnation.
    pub recovery_count: RecoveryCount,
    /// Zone counts for the lock counter.
    pub thread_config: ThreadConfig,
}

impl Default for RecoveryJournalConfig {
    fn default() -> Self {
        Self {
            journal_size: 32,
            tail_buffer_size: 8,
            nonce: 0,
            recovery_count: 0,
            thread_config: ThreadConfig::default(),
        }
    }
}

/// Statistics for the recovery journal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryJournalStats {
    /// Increment admissions refused for lack of journal space.
    pub disk_full: u64,
    /// Requests sent to the slab depot to commit its oldest tail blocks.
    pub slab_journal_commits_requested: u64,
    /// Entries assigned a slot in a tail block.
    pub entries_started: u64,
    /// Entries submitted in commit writes.
    pub entries_written: u64,
    /// Entries durable on disk.
    pub entries_committed: u64,
    /// Tail blocks activated.
    pub blocks_started: u64,
    /// Block commit writes submitted.
    pub blocks_written: u64,
    /// Block commit writes completed.
    pub blocks_committed: u64,
    /// Data increment entries journaled.
    pub data_increments: u64,
    /// Data decrement entries journaled.
    pub data_decrements: u64,
    /// Block map increment entries journaled.
    pub block_map_increments: u64,
}

/// The recovery journal.
pub struct RecoveryJournal {
    size: u64,
    entries_per_block: u16,
    nonce: Nonce,
    recovery_count: RecoveryCount,
    state: AdminState,
    notifier: Arc<ReadOnlyNotifier>,
    lock_counter: Arc<LockCounter>,
    layer: Box<dyn PhysicalLayer>,
    block_map: Box<dyn BlockMapEra>,
    depot: Box<dyn SlabJournalCommitter>,

    tail: SequenceNumber,
    append_point: JournalPoint,
    last_write_acknowledged: SequenceNumber,
    commit_point: JournalPoint,
    block_map_head: SequenceNumber,
    slab_journal_head: SequenceNumber,
    block_map_reap_head: SequenceNumber,
    slab_journal_reap_head: SequenceNumber,

    available_space: u64,
    pending_decrement_count: u64,
    logical_blocks_used: u64,
    block_map_data_blocks: u64,

    increment_waiters: WaitQueue<Arc<DataVio>>,
    decrement_waiters: WaitQueue<Arc<DataVio>>,

    blocks: Vec<JournalBlock>,
    free_tail_blocks: VecDeque<usize>,
    active_tail_blocks: VecDeque<usize>,
    active_block: Option<usize>,
    pending_writes: VecDeque<usize>,
    pending_write_count: usize,
    write_ios: HashMap<IoId, usize>,
    reap_flush_io: Option<IoId>,

    reaping: bool,
    adding_entries: bool,
    stats: RecoveryJournalStats,
}

impl RecoveryJournal {
    /// Creates a journal over the given collaborators. The journal starts
    /// `New` and must be opened before admitting entries.
    pub fn new(
        config: RecoveryJournalConfig,
        layer: Box<dyn PhysicalLayer>,
        block_map: Box<dyn BlockMapEra>,
        depot: Box<dyn SlabJournalCommitter>,
        notifier: Arc<ReadOnlyNotifier>,
    ) -> Self {
        let entries_per_block = RECOVERY_JOURNAL_ENTRIES_PER_BLOCK;
        let usable = get_recovery_journal_length(config.journal_size);
        let lock_counter = Arc::new(LockCounter::new(
            config.journal_size as usize,
            config.thread_config.logical_zone_count as usize,
            config.thread_config.physical_zone_count as usize,
            Arc::clone(&notifier),
        ));

        tracing::debug!(
            journal_size = config.journal_size,
            usable_blocks = usable,
            tail_buffer_size = config.tail_buffer_size,
            "creating recovery journal"
        );

        let blocks: Vec<JournalBlock> = (0..config.tail_buffer_size)
            .map(|_| JournalBlock::new(entries_per_block))
            .collect();
        let free_tail_blocks = (0..config.tail_buffer_size).collect();

        Self {
            size: config.journal_size,
            entries_per_block,
            nonce: config.nonce,
            recovery_count: config.recovery_count,
            state: AdminState::new(),
            notifier,
            lock_counter,
            layer,
            block_map,
            depot,
            tail: 1,
            append_point: JournalPoint::new(1, 0),
            last_write_acknowledged: 0,
            commit_point: JournalPoint::new(0, 0),
            block_map_head: 1,
            slab_journal_head: 1,
            block_map_reap_head: 1,
            slab_journal_reap_head: 1,
            available_space: entries_per_block as u64 * usable,
            pending_decrement_count: 0,
            logical_blocks_used: 0,
            block_map_data_blocks: 0,
            increment_waiters: WaitQueue::new(),
            decrement_waiters: WaitQueue::new(),
            blocks,
            free_tail_blocks,
            active_tail_blocks: VecDeque::new(),
            active_block: None,
            pending_writes: VecDeque::new(),
            pending_write_count: 0,
            write_ios: HashMap::new(),
            reap_flush_io: None,
            reaping: false,
            adding_entries: false,
            stats: RecoveryJournalStats::default(),
        }
    }

    /// Opens a freshly constructed journal for normal operation.
    pub fn open(&mut self) -> CoreResult<()> {
        self.state.open()
    }

    fn ring_slot(&self, sequence: SequenceNumber) -> usize {
        (sequence % self.size) as usize
    }

    fn head(&self) -> SequenceNumber {
        self.block_map_head.min(self.slab_journal_head)
    }

    fn enter_read_only(&mut self, error: CoreError) {
        self.notifier.enter_read_only_mode(error);
    }

    // ------------------------------------------------------------------
    // Admission and entry assignment
    // ------------------------------------------------------------------

    /// Admits a DataVIO for a journal entry. The entry is assigned
    /// immediately if space allows, otherwise the request waits for reaping
    /// to free space.
    pub fn add_entry(&mut self, vio: Arc<DataVio>) -> CoreResult<()> {
        if !self.state.is_normal() {
            let error = CoreError::InvalidAdminState {
                operation: "add_entry",
                state: self.state.code().name(),
            };
            vio.complete(Err(error.clone()));
            return Err(error);
        }
        if self.notifier.is_read_only() {
            vio.complete(Err(CoreError::ReadOnly));
            return Err(CoreError::ReadOnly);
        }

        self.append_point.advance(self.entries_per_block);

        let operation = vio.state().operation;
        tracing::debug!(
            vio = vio.id(),
            ?operation,
            append_point = %self.append_point,
            "journal entry requested"
        );
        if operation.is_increment() {
            self.increment_waiters.enqueue(vio);
        } else {
            self.decrement_waiters.enqueue(vio);
        }

        self.assign_entries();
        Ok(())
    }

    /// Assigns queued waiters to tail-block slots. Decrements drain first;
    /// their space was reserved when the paired increments were admitted.
    fn assign_entries(&mut self) {
        if self.adding_entries {
            return;
        }
        self.adding_entries = true;

        while !self.decrement_waiters.is_empty() && !self.notifier.is_read_only() {
            if self.available_space == 0 {
                // Decrement space is reserved at increment admission;
                // running out is an accounting failure.
                self.enter_read_only(CoreError::JournalFull);
                break;
            }
            match self.prepare_to_assign_entry() {
                Some(block_index) => {
                    let vio = self.decrement_waiters.dequeue().expect("waiter present");
                    self.assign_entry(block_index, vio);
                }
                None => break,
            }
        }

        while !self.increment_waiters.is_empty() && !self.notifier.is_read_only() {
            if self.available_space <= self.pending_decrement_count + 1 {
                self.stats.disk_full += 1;
                tracing::debug!(
                    available_space = self.available_space,
                    pending_decrement_count = self.pending_decrement_count,
                    "increment admission refused"
                );
                break;
            }
            match self.prepare_to_assign_entry() {
                Some(block_index) => {
                    let vio = self.increment_waiters.dequeue().expect("waiter present");
                    self.assign_entry(block_index, vio);
                }
                None => break,
            }
        }

        self.adding_entries = false;

        self.write_blocks();
        self.check_slab_journal_commit_threshold();
        if self.notifier.is_read_only() {
            self.check_for_drain_complete();
        }
    }

    /// Returns a tail block with a free slot, advancing the tail if needed.
    fn prepare_to_assign_entry(&mut self) -> Option<usize> {
        if let Some(index) = self.active_block {
            if !self.blocks[index].is_full() {
                return Some(index);
            }
        }
        self.advance_tail()
    }

    /// Activates a free staging block for the next sequence number.
    fn advance_tail(&mut self) -> Option<usize> {
        if self.tail >= MAX_JOURNAL_SEQUENCE {
            self.enter_read_only(CoreError::JournalOverflow { sequence: self.tail });
            return None;
        }
        if self.tail - self.head() >= self.size {
            // The on-disk ring has no slot for another block until a reap.
            self.stats.disk_full += 1;
            return None;
        }
        let index = self.free_tail_blocks.pop_front()?;

        let sequence = self.tail;
        let slot = self.ring_slot(sequence);
        self.blocks[index].initialize(sequence, PhysicalBlockNumber::new(slot as u64));
        self.active_tail_blocks.push_back(index);
        self.active_block = Some(index);
        self.tail += 1;
        self.stats.blocks_started += 1;
        self.block_map.advance_block_map_era(self.tail);
        tracing::debug!(sequence, slot, "tail block activated");
        Some(index)
    }

    /// Assigns one waiter to a slot in the given block and applies the
    /// operation's accounting.
    fn assign_entry(&mut self, block_index: usize, vio: Arc<DataVio>) {
        let (operation, entry) = {
            let state = vio.state();
            let mapped = match state.operation {
                JournalOperation::DataDecrement => state.unmapping,
                _ => state.new_mapped,
            };
            (
                state.operation,
                RecoveryJournalEntry {
                    operation: state.operation,
                    mapping_state: mapped.state,
                    logical: vio.logical(),
                    physical: mapped.pbn,
                },
            )
        };

        let slot = {
            let block = &mut self.blocks[block_index];
            let slot = block.block_number().as_u64() as usize;
            if block.is_empty() {
                // One per-entry lock per slot, plus one held by the block
                // itself until it is fully committed.
                self.lock_counter
                    .initialize_lock_count(slot, self.entries_per_block as u32 + 1);
            }
            let point = block.enqueue_entry(Arc::clone(&vio), entry);
            tracing::debug!(vio = vio.id(), point = %point, "journal entry assigned");
            slot
        };

        match operation {
            JournalOperation::DataIncrement => {
                if entry.mapping_state != BlockMappingState::Unmapped {
                    self.logical_blocks_used += 1;
                }
                self.pending_decrement_count += 1;
                self.stats.data_increments += 1;
            }
            JournalOperation::DataDecrement => {
                if entry.mapping_state != BlockMappingState::Unmapped {
                    self.logical_blocks_used = self.logical_blocks_used.saturating_sub(1);
                }
                self.pending_decrement_count = self.pending_decrement_count.saturating_sub(1);
                // The paired increment's per-entry lock protects this slot.
                self.lock_counter.release_journal_zone_reference(slot);
                self.stats.data_decrements += 1;
            }
            JournalOperation::BlockMapIncrement => {
                self.block_map_data_blocks += 1;
                self.stats.block_map_increments += 1;
            }
        }

        self.available_space -= 1;
        self.stats.entries_started += 1;

        if self.blocks[block_index].is_full() {
            self.schedule_block_write(block_index);
        }
    }

    fn schedule_block_write(&mut self, block_index: usize) {
        if !self.pending_writes.contains(&block_index) {
            self.pending_writes.push_back(block_index);
        }
    }

    // ------------------------------------------------------------------
    // Write scheduling and commit completion
    // ------------------------------------------------------------------

    /// Issues commit writes according to the write policy. On return either
    /// no assigned DataVIO is waiting for durability or an I/O is
    /// outstanding whose completion re-enters this scheduler.
    fn write_blocks(&mut self) {
        if self.notifier.is_read_only() {
            return;
        }
        let batching = self.layer.write_policy() == WritePolicy::Async;
        if batching && self.pending_write_count > 0 {
            return;
        }

        while let Some(index) = self.pending_writes.pop_front() {
            self.commit_block(index);
        }

        if self.pending_write_count == 0 || !batching {
            if let Some(index) = self.active_block {
                if self.blocks[index].can_commit() {
                    self.commit_block(index);
                }
            }
        }
    }

    fn commit_block(&mut self, block_index: usize) {
        if !self.blocks[block_index].can_commit() {
            return;
        }
        let (pbn, image) = {
            let block = &mut self.blocks[block_index];
            let image = block.start_commit(self.nonce, self.recovery_count);
            (block.block_number(), image)
        };
        match image {
            Ok(image) => {
                let entries = self.blocks[block_index].entries_in_commit();
                let io = self.layer.submit_block_write(pbn, image);
                self.write_ios.insert(io, block_index);
                self.pending_write_count += 1;
                self.stats.blocks_written += 1;
                self.stats.entries_written += entries as u64;
                tracing::debug!(
                    sequence = self.blocks[block_index].sequence_number(),
                    entries,
                    io,
                    "journal block commit submitted"
                );
            }
            Err(error) => {
                self.blocks[block_index].abandon_commit();
                self.enter_read_only(error);
                self.notify_commit_waiters();
                self.check_for_drain_complete();
            }
        }
    }

    /// Completes a block commit write submitted through the physical layer.
    pub fn complete_block_write(&mut self, io: IoId, result: CoreResult<()>) {
        let Some(block_index) = self.write_ios.remove(&io) else {
            return;
        };
        self.pending_write_count -= 1;

        match result {
            Ok(()) => {
                let sequence = {
                    let block = &mut self.blocks[block_index];
                    let entries = block.entries_in_commit();
                    block.finish_commit();
                    self.stats.entries_committed += entries as u64;
                    self.stats.blocks_committed += 1;
                    block.sequence_number()
                };
                // Acknowledgement never regresses.
                if sequence > self.last_write_acknowledged {
                    self.last_write_acknowledged = sequence;
                }
            }
            Err(error) => {
                self.blocks[block_index].abandon_commit();
                tracing::error!(io, %error, "journal block write failed");
                self.enter_read_only(error);
            }
        }

        self.notify_commit_waiters();

        if !self.notifier.is_read_only() {
            let block = &self.blocks[block_index];
            // Another partial commit may have accumulated during the write.
            if block.is_dirty() && block.is_full() {
                self.schedule_block_write(block_index);
            }
        }

        self.write_blocks();
        self.check_for_drain_complete();
    }

    /// Walks the front of the active ring, releasing commit waiters in
    /// strict journal-point order and recycling fully committed full
    /// blocks.
    fn notify_commit_waiters(&mut self) {
        loop {
            let Some(&front) = self.active_tail_blocks.front() else {
                break;
            };
            if self.blocks[front].is_committing() {
                break;
            }

            if self.notifier.is_read_only() {
                let block = &mut self.blocks[front];
                block
                    .entry_waiters
                    .notify_all(|vio| vio.complete(Err(CoreError::ReadOnly)));
                block
                    .commit_waiters
                    .notify_all(|vio| vio.complete(Err(CoreError::ReadOnly)));
                self.recycle_front_block();
                continue;
            }

            let mut commit_point = self.commit_point;
            self.blocks[front].commit_waiters.notify_all(|vio| {
                let point = vio
                    .state()
                    .recovery_journal_point
                    .expect("assigned entries carry a journal point");
                assert!(
                    commit_point.precedes(&point),
                    "commit notification out of order: {point} released after {commit_point}"
                );
                commit_point = point;
                vio.complete(Ok(()));
            });
            self.commit_point = commit_point;

            let block = &self.blocks[front];
            let recyclable =
                block.is_clean() && !block.is_empty() && (block.is_full() || self.state.is_saving());
            if recyclable {
                self.recycle_front_block();
            } else {
                break;
            }
        }
    }

    /// Recycles the front block of the active ring: releases the per-entry
    /// locks the journal still holds for it and returns it to the free
    /// ring.
    fn recycle_front_block(&mut self) {
        let index = self.active_tail_blocks.pop_front().expect("front block");
        if self.active_block == Some(index) {
            self.active_block = None;
        }
        let block = &self.blocks[index];
        let slot = block.block_number().as_u64() as usize;
        let entry_count = block.entry_count();
        if entry_count > 0 {
            // Unused entry slots, then the block's own lock.
            for _ in entry_count..self.entries_per_block {
                self.lock_counter.release_journal_zone_reference(slot);
            }
            self.lock_counter.release_journal_zone_reference(slot);
        }
        self.free_tail_blocks.push_back(index);
        tracing::debug!(
            sequence = self.blocks[index].sequence_number(),
            "tail block recycled"
        );
    }

    // ------------------------------------------------------------------
    // Reaping
    // ------------------------------------------------------------------

    /// Entry point for lock-counter unlock notifications. Acknowledges the
    /// notification before reaping so releases racing with the reap are not
    /// lost.
    pub fn reap_callback(&mut self, lock_number: usize) {
        self.lock_counter.acknowledge_unlock(lock_number);
        self.reap();
        self.check_for_drain_complete();
    }

    /// Drains all posted unlock notifications into `reap_callback`.
    pub fn service_unlock_notifications(&mut self) {
        while let Some(lock_number) = self.lock_counter.poll_notification() {
            self.reap_callback(lock_number);
        }
    }

    /// Advances the tentative reap heads over consecutive unlocked slots
    /// and, in async mode, issues the flush that makes the advance safe.
    fn reap(&mut self) {
        if self.reaping || self.notifier.is_read_only() {
            return;
        }

        let mut advanced = false;
        while self.block_map_reap_head < self.tail
            && !self
                .lock_counter
                .is_locked(self.ring_slot(self.block_map_reap_head), ZoneType::Logical)
        {
            self.block_map_reap_head += 1;
            advanced = true;
        }
        while self.slab_journal_reap_head < self.tail
            && !self
                .lock_counter
                .is_locked(self.ring_slot(self.slab_journal_reap_head), ZoneType::Physical)
        {
            self.slab_journal_reap_head += 1;
            advanced = true;
        }
        if !advanced {
            return;
        }

        if self.layer.write_policy().is_async() {
            // The heads must not pass data that is not yet durable on the
            // device; flush before applying them.
            self.reaping = true;
            let io = self.layer.submit_flush();
            self.reap_flush_io = Some(io);
            tracing::debug!(
                block_map_reap_head = self.block_map_reap_head,
                slab_journal_reap_head = self.slab_journal_reap_head,
                io,
                "reap flush submitted"
            );
        } else {
            // Every block write already carried a flush.
            self.finish_reaping();
        }
    }

    /// Applies the tentative reap heads and credits the reclaimed space.
    fn finish_reaping(&mut self) {
        let old_head = self.head();
        self.block_map_head = self.block_map_reap_head;
        self.slab_journal_head = self.slab_journal_reap_head;
        let reaped = self.head() - old_head;
        self.available_space += reaped * self.entries_per_block as u64;
        tracing::debug!(
            block_map_head = self.block_map_head,
            slab_journal_head = self.slab_journal_head,
            blocks_reaped = reaped,
            available_space = self.available_space,
            "journal reaped"
        );

        self.check_slab_journal_commit_threshold();
        self.assign_entries();
        self.reap();
    }

    /// Completes the reap flush submitted through the physical layer.
    pub fn complete_reap_flush(&mut self, io: IoId, result: CoreResult<()>) {
        if self.reap_flush_io != Some(io) {
            return;
        }
        self.reap_flush_io = None;
        self.reaping = false;
        match result {
            Ok(()) => self.finish_reaping(),
            Err(error) => {
                tracing::error!(io, %error, "reap flush failed");
                self.enter_read_only(error);
                self.notify_commit_waiters();
            }
        }
        self.check_for_drain_complete();
    }

    /// Asks the slab depot to commit its oldest tail blocks whenever the
    /// journal has grown past two thirds of the ring, keeping the reap
    /// frontier moving.
    fn check_slab_journal_commit_threshold(&mut self) {
        let threshold = (self.size * 2) / 3;
        if self.tail - self.slab_journal_head > threshold {
            self.stats.slab_journal_commits_requested += 1;
            self.depot.commit_oldest_tail_blocks(self.slab_journal_head);
        }
    }

    // ------------------------------------------------------------------
    // Admin operations
    // ------------------------------------------------------------------

    /// Begins a drain. New admissions fail; in-flight work completes, and
    /// the drain finishes when the journal is quiescent.
    pub fn drain(&mut self, operation: DrainOperation) -> CoreResult<()> {
        self.state.start_draining(operation)?;
        tracing::debug!(?operation, "journal drain started");
        self.write_blocks();
        self.check_for_drain_complete();
        Ok(())
    }

    /// Resumes a quiescent journal. A saved journal resets its in-memory
    /// positions first.
    pub fn resume(&mut self) -> CoreResult<()> {
        if self.notifier.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        let was_saved = self.state.is_saved();
        self.state.resume_if_quiescent()?;
        if was_saved {
            self.reset();
        }
        Ok(())
    }

    /// Re-runs the drain-completion check. Registered as the journal's
    /// read-only listener action.
    pub fn handle_read_only_notification(&mut self) {
        self.check_for_drain_complete();
    }

    /// Completes an in-progress drain once the journal is quiescent.
    /// Idempotent; fired after each commit, reap, and admin event.
    fn check_for_drain_complete(&mut self) {
        if self.notifier.is_read_only() {
            self.increment_waiters
                .notify_all(|vio| vio.complete(Err(CoreError::ReadOnly)));
            self.decrement_waiters
                .notify_all(|vio| vio.complete(Err(CoreError::ReadOnly)));
            self.notify_commit_waiters();
        }

        if !self.state.is_draining() {
            return;
        }
        if self.state.is_saving() {
            // Clean partial blocks recycle during a save so the ring can
            // empty; the notification walk applies that rule.
            self.notify_commit_waiters();
        }
        if self.reaping || self.pending_write_count > 0 {
            return;
        }
        if !self.increment_waiters.is_empty() || !self.decrement_waiters.is_empty() {
            return;
        }
        if self
            .active_tail_blocks
            .iter()
            .any(|&index| self.blocks[index].has_waiters())
        {
            return;
        }

        if self.state.is_saving() {
            debug_assert!(
                self.active_block
                    .map_or(true, |index| self.blocks[index].is_clean()),
                "active block must be clean when a save completes"
            );
            debug_assert!(
                self.active_tail_blocks.is_empty(),
                "active ring must be empty when a save completes"
            );
        }

        let result = if self.notifier.is_read_only() {
            Err(CoreError::ReadOnly)
        } else {
            Ok(())
        };
        if let Ok(operation) = self.state.finish_draining_with_result(result) {
            tracing::debug!(?operation, "journal drain complete");
        }
    }

    // ------------------------------------------------------------------
    // Persisted state
    // ------------------------------------------------------------------

    /// Captures the persisted component state. A cleanly saved journal
    /// records its tail; otherwise replay must start at the lower of the
    /// two heads.
    pub fn record_state(&self) -> RecoveryJournalState {
        let journal_start = if self.state.is_saved() {
            self.tail
        } else {
            self.head()
        };
        RecoveryJournalState {
            journal_start,
            logical_blocks_used: self.logical_blocks_used,
            block_map_data_blocks: self.block_map_data_blocks,
        }
    }

    /// Applies decoded persisted state. The journal comes back `Suspended`
    /// and must be resumed before admitting entries.
    pub fn decode_state(&mut self, state: RecoveryJournalState) {
        self.tail = state.journal_start;
        self.logical_blocks_used = state.logical_blocks_used;
        self.block_map_data_blocks = state.block_map_data_blocks;
        self.reset();
        self.state = AdminState::suspended();
    }

    /// Resets every in-memory position to a clean journal at `tail`.
    fn reset(&mut self) {
        self.block_map_head = self.tail;
        self.slab_journal_head = self.tail;
        self.block_map_reap_head = self.tail;
        self.slab_journal_reap_head = self.tail;
        self.last_write_acknowledged = self.tail.saturating_sub(1);
        self.append_point = JournalPoint::new(self.tail, 0);
        self.commit_point = JournalPoint::new(self.tail.saturating_sub(1), u16::MAX);
        self.available_space =
            self.entries_per_block as u64 * get_recovery_journal_length(self.size);
        self.pending_decrement_count = 0;
        self.active_block = None;
        self.active_tail_blocks.clear();
        self.pending_writes.clear();
        self.free_tail_blocks = (0..self.blocks.len()).collect();
    }

    /// Sets the tail directly, entering read-only mode when the sequence
    /// space is exhausted.
    pub fn set_tail(&mut self, tail: SequenceNumber) -> CoreResult<()> {
        if tail >= MAX_JOURNAL_SEQUENCE {
            self.enter_read_only(CoreError::JournalOverflow { sequence: tail });
            return Err(CoreError::JournalOverflow { sequence: tail });
        }
        self.tail = tail;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The next free sequence number.
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// The highest committed sequence number.
    pub fn last_write_acknowledged(&self) -> SequenceNumber {
        self.last_write_acknowledged
    }

    /// The highest journal point whose waiter has been released.
    pub fn commit_point(&self) -> JournalPoint {
        self.commit_point
    }

    /// The block map reap frontier.
    pub fn block_map_head(&self) -> SequenceNumber {
        self.block_map_head
    }

    /// The slab journal reap frontier.
    pub fn slab_journal_head(&self) -> SequenceNumber {
        self.slab_journal_head
    }

    /// Entries that may still be assigned.
    pub fn available_space(&self) -> u64 {
        self.available_space
    }

    /// Admission slots reserved for promised decrements.
    pub fn pending_decrement_count(&self) -> u64 {
        self.pending_decrement_count
    }

    /// Persisted count of logical blocks holding data.
    pub fn logical_blocks_used(&self) -> u64 {
        self.logical_blocks_used
    }

    /// Persisted count of allocated block map pages.
    pub fn block_map_data_blocks(&self) -> u64 {
        self.block_map_data_blocks
    }

    /// The journal's lock counter, shared with downstream zones.
    pub fn lock_counter(&self) -> &Arc<LockCounter> {
        &self.lock_counter
    }

    /// The current administrative state code.
    pub fn admin_state(&self) -> AdminStateCode {
        self.state.code()
    }

    /// True once the journal has observed read-only mode.
    pub fn is_read_only(&self) -> bool {
        self.notifier.is_read_only()
    }

    /// Journal statistics.
    pub fn stats(&self) -> &RecoveryJournalStats {
        &self.stats
    }

    /// Entries per on-disk journal block.
    pub fn entries_per_block(&self) -> u16 {
        self.entries_per_block
    }

    /// Forces the space accounting to a given state. Test hook.
    #[doc(hidden)]
    pub fn force_space_for_testing(&mut self, available_space: u64, pending_decrement_count: u64) {
        self.available_space = available_space;
        self.pending_decrement_count = pending_decrement_count;
    }
}
