#![warn(missing_docs)]

//! dedupstore core subsystem: shared domain types, bit-exact on-disk formats,
//! the DataVIO write-request handle, wait queues, and administrative state.

pub mod admin_state;
pub mod data_vio;
pub mod error;
pub mod format;
pub mod mapping;
pub mod physical;
pub mod read_only;
pub mod types;
pub mod wait_queue;

pub use data_vio::{DataVio, VioId};
pub use error::{CoreError, CoreResult};
pub use types::{
    ChunkName, JournalPoint, LogicalBlockNumber, Nonce, PhysicalBlockNumber, RecoveryCount,
    SequenceNumber, ZoneType,
};
