//! Interfaces to the journal's downstream collaborators.
//!
//! The block map and slab depot live outside this crate; the journal only
//! needs to notify them. The recording doubles share their call logs
//! through handles so tests can keep an observer after handing the double
//! to the journal.

use std::sync::Arc;

use parking_lot::Mutex;

use dedupstore_core::types::SequenceNumber;

/// Receives block map era advances as the journal tail moves.
pub trait BlockMapEra {
    /// Tells the block map that journal entries now reference era
    /// `sequence`.
    fn advance_block_map_era(&mut self, sequence: SequenceNumber);
}

/// Commits slab journal tail blocks so the journal's reap frontier can
/// keep moving.
pub trait SlabJournalCommitter {
    /// Asks the slab depot to commit every slab journal tail block holding
    /// entries from journal blocks up to `up_to` exclusive.
    fn commit_oldest_tail_blocks(&mut self, up_to: SequenceNumber);
}

/// Recording double for [`BlockMapEra`].
#[derive(Clone, Default)]
pub struct RecordingBlockMapEra {
    calls: Arc<Mutex<Vec<SequenceNumber>>>,
}

impl RecordingBlockMapEra {
    /// Creates a recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence numbers passed so far, in order.
    pub fn calls(&self) -> Vec<SequenceNumber> {
        self.calls.lock().clone()
    }
}

impl BlockMapEra for RecordingBlockMapEra {
    fn advance_block_map_era(&mut self, sequence: SequenceNumber) {
        self.calls.lock().push(sequence);
    }
}

/// Recording double for [`SlabJournalCommitter`].
#[derive(Clone, Default)]
pub struct RecordingSlabCommitter {
    calls: Arc<Mutex<Vec<SequenceNumber>>>,
}

impl RecordingSlabCommitter {
    /// Creates a recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence numbers passed so far, in order.
    pub fn calls(&self) -> Vec<SequenceNumber> {
        self.calls.lock().clone()
    }
}

impl SlabJournalCommitter for RecordingSlabCommitter {
    fn commit_oldest_tail_blocks(&mut self, up_to: SequenceNumber) {
        self.calls.lock().push(up_to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_share_logs_across_clones() {
        let mut era = RecordingBlockMapEra::new();
        let observer = era.clone();
        era.advance_block_map_era(4);
        era.advance_block_map_era(5);
        assert_eq!(observer.calls(), vec![4, 5]);

        let mut committer = RecordingSlabCommitter::new();
        let observer = committer.clone();
        committer.commit_oldest_tail_blocks(2);
        assert_eq!(observer.calls(), vec![2]);
    }
}
