//! Error types for the dedupe subsystem.

use thiserror::Error;

/// Result type alias for dedupe operations.
pub type DedupeResult<T> = Result<T, DedupeError>;

/// Error variants for dedupe operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DedupeError {
    /// The operation is not legal in the lock's current state.
    #[error("Hash lock in state {state} cannot {operation}")]
    InvalidLockState {
        /// Name of the state the lock was in.
        state: &'static str,
        /// The operation that was attempted.
        operation: &'static str,
    },

    /// A continuation arrived from a DataVIO that is not the lock's agent.
    #[error("DataVIO {vio} is not the agent for {operation}")]
    NotTheAgent {
        /// The DataVIO that continued.
        vio: u64,
        /// The operation that required the agent.
        operation: &'static str,
    },

    /// A DataVIO tried to act on a hash lock it does not hold.
    #[error("DataVIO {vio} does not hold this hash lock")]
    LockNotHeld {
        /// The offending DataVIO.
        vio: u64,
    },

    /// An allocation lock was transferred before being downgraded to a
    /// read lock.
    #[error("Allocation lock must be downgraded to a read lock before transfer")]
    LockNotDowngraded,

    /// The transferred allocation does not match the block the DataVIO
    /// wrote.
    #[error("Transferred lock PBN does not match the agent's allocation")]
    AllocationMismatch,

    /// A write lock cannot be downgraded twice.
    #[error("PBN lock is already a read lock")]
    AlreadyReadLock,

    /// A provisional reference could not be taken on the duplicate block.
    #[error("No provisional reference available for {pbn}")]
    NoProvisionalReference {
        /// The physical block that could not be referenced.
        pbn: u64,
    },
}
