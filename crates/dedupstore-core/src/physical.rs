//! The physical I/O layer interface.
//!
//! The core never touches a device directly: it submits block writes and
//! flushes through this trait and is re-entered with completions by the
//! layer's driver. `InMemoryLayer` is the standard test double; it records
//! submissions so a test can complete them in any order it chooses.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::PhysicalBlockNumber;

/// Identifier of one submitted I/O.
pub type IoId = u64;

/// The durability policy governing journal writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WritePolicy {
    /// Every journal block write carries a flush; reaping needs no extra
    /// flush.
    Sync,
    /// Writes are batched and reaping issues an explicit flush first.
    #[default]
    Async,
    /// Async scheduling without the reap flush guarantee.
    AsyncUnsafe,
}

impl WritePolicy {
    /// Returns true for the asynchronous policies.
    pub fn is_async(&self) -> bool {
        matches!(self, WritePolicy::Async | WritePolicy::AsyncUnsafe)
    }
}

/// The interface the core uses to reach the device.
pub trait PhysicalLayer {
    /// The configured write policy.
    fn write_policy(&self) -> WritePolicy;

    /// Submits one metadata block write. Completion is delivered by the
    /// driver re-entering the submitting component with the returned id.
    fn submit_block_write(&mut self, pbn: PhysicalBlockNumber, data: Vec<u8>) -> IoId;

    /// Submits a device flush.
    fn submit_flush(&mut self) -> IoId;
}

/// One I/O recorded by [`InMemoryLayer`].
#[derive(Debug, Clone)]
pub struct PendingIo {
    /// The submission id.
    pub id: IoId,
    /// What was submitted.
    pub kind: PendingIoKind,
}

/// The kinds of I/O the core submits.
#[derive(Debug, Clone)]
pub enum PendingIoKind {
    /// A block write to the given physical block.
    BlockWrite {
        /// Target block.
        pbn: PhysicalBlockNumber,
        /// The 4K payload.
        data: Vec<u8>,
    },
    /// A device flush.
    Flush,
}

#[derive(Default)]
struct LayerShared {
    next_id: AtomicU64,
    pending: Mutex<VecDeque<PendingIo>>,
}

/// In-memory physical layer: records submissions, completes nothing itself.
#[derive(Clone)]
pub struct InMemoryLayer {
    policy: WritePolicy,
    shared: Arc<LayerShared>,
}

impl InMemoryLayer {
    /// Creates a layer with the given policy.
    pub fn new(policy: WritePolicy) -> Self {
        Self {
            policy,
            shared: Arc::new(LayerShared::default()),
        }
    }

    /// Removes and returns the oldest submitted I/O.
    pub fn take_pending(&self) -> Option<PendingIo> {
        self.shared.pending.lock().pop_front()
    }

    /// Removes and returns every submitted I/O, oldest first.
    pub fn drain_pending(&self) -> Vec<PendingIo> {
        self.shared.pending.lock().drain(..).collect()
    }

    /// The number of submitted, not-yet-taken I/Os.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl PhysicalLayer for InMemoryLayer {
    fn write_policy(&self) -> WritePolicy {
        self.policy
    }

    fn submit_block_write(&mut self, pbn: PhysicalBlockNumber, data: Vec<u8>) -> IoId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(io = id, %pbn, len = data.len(), "block write submitted");
        self.shared.pending.lock().push_back(PendingIo {
            id,
            kind: PendingIoKind::BlockWrite { pbn, data },
        });
        id
    }

    fn submit_flush(&mut self) -> IoId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(io = id, "flush submitted");
        self.shared
            .pending
            .lock()
            .push_back(PendingIo { id, kind: PendingIoKind::Flush });
        id
    }
}
