//! The DataVIO: one in-flight write request.
//!
//! A DataVIO is owned by the layer above the core and shared by handle. Its
//! identity (logical block, content hash, data) is immutable; the mutable
//! mapping and journal linkage live behind a lock because different zones
//! touch them at different stages of the write. The completion result
//! latches exactly once.

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::error::CoreResult;
use crate::mapping::{JournalOperation, ZonedPbn};
use crate::types::{ChunkName, JournalPoint, LogicalBlockNumber, PhysicalBlockNumber, SequenceNumber};

/// Identifier of a DataVIO, unique within one run.
pub type VioId = u64;

/// The mutable per-request state of a DataVIO.
#[derive(Debug, Clone, Default)]
pub struct DataVioState {
    /// The reference-count delta this request will journal.
    pub operation: JournalOperation,
    /// The mapping this write establishes.
    pub new_mapped: ZonedPbn,
    /// The mapping this write replaces (journaled by the paired decrement).
    pub unmapping: ZonedPbn,
    /// True once a duplicate candidate has been identified.
    pub is_duplicate: bool,
    /// The candidate or verified duplicate location.
    pub duplicate: Option<ZonedPbn>,
    /// The physical block allocated for this request's own data, if any.
    pub allocation: Option<PhysicalBlockNumber>,
    /// The journal entry slot assigned to this request.
    pub recovery_journal_point: Option<JournalPoint>,
    /// The journal block whose per-entry lock this request holds.
    pub recovery_sequence_number: Option<SequenceNumber>,
    /// Key of the hash lock this request holds, if any.
    pub hash_lock: Option<usize>,
    /// Label of the most recently launched asynchronous step, for tracing.
    pub last_async_operation: &'static str,
}

/// One in-flight write request.
pub struct DataVio {
    id: VioId,
    logical: LogicalBlockNumber,
    chunk_name: ChunkName,
    data: Bytes,
    is_zero_block: bool,
    state: Mutex<DataVioState>,
    result: Mutex<Option<CoreResult<()>>>,
}

impl std::fmt::Debug for DataVio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataVio")
            .field("id", &self.id)
            .field("logical", &self.logical)
            .field("chunk_name", &self.chunk_name)
            .finish_non_exhaustive()
    }
}

impl DataVio {
    /// Creates a new request for `logical` carrying `data` hashed to
    /// `chunk_name`.
    pub fn new(id: VioId, logical: LogicalBlockNumber, chunk_name: ChunkName, data: Bytes) -> Self {
        let is_zero_block = data.iter().all(|b| *b == 0);
        Self {
            id,
            logical,
            chunk_name,
            data,
            is_zero_block,
            state: Mutex::new(DataVioState::default()),
            result: Mutex::new(None),
        }
    }

    /// The request's identifier.
    pub fn id(&self) -> VioId {
        self.id
    }

    /// The logical block being written.
    pub fn logical(&self) -> LogicalBlockNumber {
        self.logical
    }

    /// The content hash of the data.
    pub fn chunk_name(&self) -> ChunkName {
        self.chunk_name
    }

    /// The data being written.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// True if the data is entirely zero.
    pub fn is_zero_block(&self) -> bool {
        self.is_zero_block
    }

    /// Locks and returns the mutable request state.
    pub fn state(&self) -> MutexGuard<'_, DataVioState> {
        self.state.lock()
    }

    /// True once the request owns a freshly allocated physical block.
    pub fn has_allocation(&self) -> bool {
        self.state.lock().allocation.is_some()
    }

    /// Latches the completion result. The first completion wins; later
    /// completions are ignored.
    pub fn complete(&self, result: CoreResult<()>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            tracing::debug!(vio = self.id, ok = result.is_ok(), "data vio completed");
            *slot = Some(result);
        }
    }

    /// Returns the latched completion result, if the request has completed.
    pub fn result(&self) -> Option<CoreResult<()>> {
        self.result.lock().clone()
    }

    /// True once the request has completed.
    pub fn is_complete(&self) -> bool {
        self.result.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    fn sample_vio(id: VioId) -> DataVio {
        DataVio::new(
            id,
            LogicalBlockNumber::new(100),
            ChunkName::new([7; 16]),
            Bytes::from_static(b"some data"),
        )
    }

    #[test]
    fn test_identity_accessors() {
        let vio = sample_vio(3);
        assert_eq!(vio.id(), 3);
        assert_eq!(vio.logical(), LogicalBlockNumber::new(100));
        assert_eq!(vio.chunk_name(), ChunkName::new([7; 16]));
        assert!(!vio.is_zero_block());
    }

    #[test]
    fn test_zero_block_detection() {
        let zero = DataVio::new(
            1,
            LogicalBlockNumber::new(0),
            ChunkName::new([0; 16]),
            Bytes::from_static(&[0u8; 64]),
        );
        assert!(zero.is_zero_block());
    }

    #[test]
    fn test_completion_latches_first_result() {
        let vio = sample_vio(1);
        assert!(!vio.is_complete());

        vio.complete(Err(CoreError::ReadOnly));
        vio.complete(Ok(()));

        assert!(vio.is_complete());
        assert_eq!(vio.result(), Some(Err(CoreError::ReadOnly)));
    }

    #[test]
    fn test_state_mutation() {
        let vio = sample_vio(1);
        assert!(!vio.has_allocation());
        {
            let mut state = vio.state();
            state.allocation = Some(PhysicalBlockNumber::new(9000));
            state.recovery_journal_point = Some(JournalPoint::new(1, 1));
        }
        assert!(vio.has_allocation());
        assert_eq!(
            vio.state().recovery_journal_point,
            Some(JournalPoint::new(1, 1))
        );
    }
}
