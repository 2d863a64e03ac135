#![warn(missing_docs)]

//! dedupstore journal subsystem: the circular recovery journal, its tail
//! blocks, per-block reference counting, and reaping.

pub mod collab;
pub mod journal_block;
pub mod lock_counter;
pub mod recovery_journal;

pub use lock_counter::LockCounter;
pub use recovery_journal::{
    get_recovery_journal_length, RecoveryJournal, RecoveryJournalConfig, RecoveryJournalStats,
};
