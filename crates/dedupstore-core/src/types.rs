//! Core identifier types shared by the journal and dedupe subsystems.

use core::fmt;
use serde::{Deserialize, Serialize};

/// A physical block number on the backing device. Packs to 40 bits on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PhysicalBlockNumber(pub u64);

/// The distinguished physical block holding all-zero data. References to it
/// are never counted.
pub const ZERO_BLOCK: PhysicalBlockNumber = PhysicalBlockNumber(0);

impl PhysicalBlockNumber {
    /// Creates a new physical block number.
    pub fn new(pbn: u64) -> Self {
        Self(pbn)
    }

    /// Returns the raw block number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the zero block.
    pub fn is_zero_block(&self) -> bool {
        *self == ZERO_BLOCK
    }
}

impl fmt::Display for PhysicalBlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pbn {}", self.0)
    }
}

/// A logical block number in the address space exposed to clients. Packs to
/// 48 bits on disk.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct LogicalBlockNumber(pub u64);

impl LogicalBlockNumber {
    /// Creates a new logical block number.
    pub fn new(lbn: u64) -> Self {
        Self(lbn)
    }

    /// Returns the raw block number.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogicalBlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lbn {}", self.0)
    }
}

/// Monotonic sequence number identifying a journal block.
pub type SequenceNumber = u64;

/// The first sequence number that can no longer be represented in a packed
/// journal block header. Issuing it is fatal.
pub const MAX_JOURNAL_SEQUENCE: SequenceNumber = 1 << 48;

/// Wrap-safe generation byte stamped into each journal block header to
/// distinguish journal generations after a crash.
pub type RecoveryCount = u8;

/// Journal-wide nonce distinguishing this journal's blocks from stale data
/// left by a previous format of the partition.
pub type Nonce = u64;

/// The exact location of a journal entry: which block, and which entry slot
/// within it. Totally ordered, block first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct JournalPoint {
    /// The sequence number of the journal block.
    pub sequence_number: SequenceNumber,
    /// The entry count of the block at the point this entry was assigned.
    pub entry_count: u16,
}

impl JournalPoint {
    /// Creates a journal point.
    pub fn new(sequence_number: SequenceNumber, entry_count: u16) -> Self {
        Self {
            sequence_number,
            entry_count,
        }
    }

    /// Returns true if this point is strictly before `other`.
    pub fn precedes(&self, other: &JournalPoint) -> bool {
        self < other
    }

    /// Advances the point by one entry, rolling into the next block when the
    /// current one is exhausted.
    pub fn advance(&mut self, entries_per_block: u16) {
        if self.entry_count + 1 == entries_per_block {
            self.sequence_number += 1;
            self.entry_count = 0;
        } else {
            self.entry_count += 1;
        }
    }
}

impl fmt::Display for JournalPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.sequence_number, self.entry_count)
    }
}

/// The content hash of one block of data, as produced by the dedup index's
/// hash function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ChunkName(pub [u8; 16]);

impl ChunkName {
    /// Creates a chunk name from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The zone types that may hold references to journal blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneType {
    /// Logical zones: block map updates.
    Logical,
    /// Physical zones: slab journal updates.
    Physical,
}

/// Identifier of a zone within its type.
pub type ZoneId = u8;

/// Zone counts for the thread configuration the core runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Number of logical zones.
    pub logical_zone_count: u8,
    /// Number of physical zones.
    pub physical_zone_count: u8,
    /// Number of hash zones.
    pub hash_zone_count: u8,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            logical_zone_count: 1,
            physical_zone_count: 1,
            hash_zone_count: 1,
        }
    }
}
