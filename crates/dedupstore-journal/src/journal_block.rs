//! One in-memory staging buffer for one on-disk journal block.
//!
//! A block accumulates entries until full, commits (possibly several times
//! as partial commits), and is recycled onto the journal's free ring once
//! fully committed. DataVIOs wait on `entry_waiters` until their slot is
//! durable, then graduate to `commit_waiters` for acknowledgement by the
//! journal's in-order notification walk.

use std::sync::Arc;

use dedupstore_core::data_vio::DataVio;
use dedupstore_core::error::CoreResult;
use dedupstore_core::format::{
    encode_journal_block, JournalBlockHeader, RecoveryJournalEntry,
};
use dedupstore_core::types::{JournalPoint, Nonce, PhysicalBlockNumber, RecoveryCount, SequenceNumber};
use dedupstore_core::wait_queue::WaitQueue;

/// The staging buffer for one journal block.
pub struct JournalBlock {
    sequence_number: SequenceNumber,
    block_number: PhysicalBlockNumber,
    entries_per_block: u16,
    entry_count: u16,
    committed_entry_count: u16,
    entries_in_commit: u16,
    committing: bool,
    entries: Vec<RecoveryJournalEntry>,
    /// DataVIOs whose entries are staged but not yet durable.
    pub entry_waiters: WaitQueue<Arc<DataVio>>,
    /// DataVIOs whose entries are durable, awaiting in-order release.
    pub commit_waiters: WaitQueue<Arc<DataVio>>,
}

impl JournalBlock {
    /// Creates an idle block able to hold `entries_per_block` entries.
    pub fn new(entries_per_block: u16) -> Self {
        Self {
            sequence_number: 0,
            block_number: PhysicalBlockNumber::new(0),
            entries_per_block,
            entry_count: 0,
            committed_entry_count: 0,
            entries_in_commit: 0,
            committing: false,
            entries: Vec::with_capacity(entries_per_block as usize),
            entry_waiters: WaitQueue::new(),
            commit_waiters: WaitQueue::new(),
        }
    }

    /// Activates the block for a new sequence number at the given ring slot.
    /// Any prior contents are discarded; waiters must already be gone.
    pub fn initialize(&mut self, sequence_number: SequenceNumber, block_number: PhysicalBlockNumber) {
        debug_assert!(self.entry_waiters.is_empty());
        debug_assert!(self.commit_waiters.is_empty());
        self.sequence_number = sequence_number;
        self.block_number = block_number;
        self.entry_count = 0;
        self.committed_entry_count = 0;
        self.entries_in_commit = 0;
        self.committing = false;
        self.entries.clear();
    }

    /// The sequence number this block is staging.
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    /// The on-disk block this buffer commits to.
    pub fn block_number(&self) -> PhysicalBlockNumber {
        self.block_number
    }

    /// Number of entries staged so far.
    pub fn entry_count(&self) -> u16 {
        self.entry_count
    }

    /// True if no entries have been staged.
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// True if every entry slot has been assigned.
    pub fn is_full(&self) -> bool {
        self.entry_count == self.entries_per_block
    }

    /// True while some staged entry is not yet durable on disk.
    pub fn is_dirty(&self) -> bool {
        self.entry_count > self.committed_entry_count
    }

    /// True while a commit write for this block is outstanding.
    pub fn is_committing(&self) -> bool {
        self.committing
    }

    /// True if a commit may be started: the block is dirty, no commit is in
    /// flight, and something new has been staged since the last commit.
    pub fn can_commit(&self) -> bool {
        self.is_dirty() && !self.committing
    }

    /// Entries staged but not covered by any commit, in flight or done.
    pub fn uncommitted_entry_count(&self) -> u16 {
        self.entry_count - self.committed_entry_count - self.entries_in_commit
    }

    /// Entries covered by the commit currently in flight.
    pub fn entries_in_commit(&self) -> u16 {
        self.entries_in_commit
    }

    /// Stages one entry and queues its DataVIO for durability notification.
    /// Returns the journal point assigned to the entry.
    pub fn enqueue_entry(&mut self, vio: Arc<DataVio>, entry: RecoveryJournalEntry) -> JournalPoint {
        debug_assert!(!self.is_full());
        self.entries.push(entry);
        self.entry_count += 1;
        let point = JournalPoint::new(self.sequence_number, self.entry_count);
        {
            let mut state = vio.state();
            state.recovery_journal_point = Some(point);
            state.recovery_sequence_number = Some(self.sequence_number);
        }
        self.entry_waiters.enqueue(vio);
        point
    }

    /// Begins a commit: snapshots the entries being written and packs the
    /// full on-disk block image.
    pub fn start_commit(&mut self, nonce: Nonce, recovery_count: RecoveryCount) -> CoreResult<Vec<u8>> {
        debug_assert!(self.can_commit());
        self.entries_in_commit = self.entry_count - self.committed_entry_count;
        self.committing = true;

        let header = JournalBlockHeader {
            nonce,
            recovery_count,
            sequence_number: self.sequence_number,
            entry_count: self.entry_count,
        };
        encode_journal_block(&header, &self.entries)
    }

    /// Finishes a successful commit: the snapshotted entries are durable,
    /// and their waiters graduate to `commit_waiters` in entry order.
    pub fn finish_commit(&mut self) {
        debug_assert!(self.committing);
        let newly_durable = self.entries_in_commit;
        self.committed_entry_count += newly_durable;
        self.entries_in_commit = 0;
        self.committing = false;

        for _ in 0..newly_durable {
            match self.entry_waiters.dequeue() {
                Some(vio) => self.commit_waiters.enqueue(vio),
                None => break,
            }
        }
    }

    /// Abandons an in-flight commit after a write error. The snapshot is
    /// discarded; waiters stay queued so the journal can fail them.
    pub fn abandon_commit(&mut self) {
        self.entries_in_commit = 0;
        self.committing = false;
    }

    /// True once every staged entry is durable.
    pub fn is_clean(&self) -> bool {
        !self.is_dirty() && !self.committing
    }

    /// True if any DataVIO still waits on this block.
    pub fn has_waiters(&self) -> bool {
        !self.entry_waiters.is_empty() || !self.commit_waiters.is_empty()
    }
}
