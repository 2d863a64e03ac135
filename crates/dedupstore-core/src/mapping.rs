//! Block mapping states and journal operation kinds.
//!
//! Both enums pack into a 4-bit nibble in the on-disk journal entry, so
//! their discriminants are part of the wire contract and must not change.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::PhysicalBlockNumber;

/// How a logical block maps onto its physical block.
///
/// Nibble values: 0 is unmapped, 1 is an uncompressed mapping, 2 through 15
/// are compressed mappings carrying the slot index within the compressed
/// block (slot = nibble - 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BlockMappingState {
    /// The logical block has no physical mapping.
    #[default]
    Unmapped,
    /// The logical block maps to a whole uncompressed physical block.
    Uncompressed,
    /// The logical block maps to slot `0..14` within a compressed block.
    Compressed(u8),
}

/// Number of distinct compressed-slot states representable in the nibble.
pub const MAX_COMPRESSION_SLOTS: u8 = 14;

impl BlockMappingState {
    /// Packs the state into its on-disk nibble.
    pub fn to_nibble(self) -> u8 {
        match self {
            BlockMappingState::Unmapped => 0,
            BlockMappingState::Uncompressed => 1,
            BlockMappingState::Compressed(slot) => slot + 2,
        }
    }

    /// Unpacks a nibble into a mapping state. All 16 nibble values are valid.
    pub fn from_nibble(nibble: u8) -> CoreResult<Self> {
        match nibble {
            0 => Ok(BlockMappingState::Unmapped),
            1 => Ok(BlockMappingState::Uncompressed),
            2..=15 => Ok(BlockMappingState::Compressed(nibble - 2)),
            _ => Err(CoreError::InvalidFormat {
                reason: format!("mapping state nibble {nibble:#x} out of range"),
            }),
        }
    }

    /// Returns true for any compressed mapping.
    pub fn is_compressed(&self) -> bool {
        matches!(self, BlockMappingState::Compressed(_))
    }
}

/// The reference-count delta kinds a journal entry can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum JournalOperation {
    /// Remove a reference to a data block.
    DataDecrement = 0,
    /// Add a reference to a data block.
    #[default]
    DataIncrement = 1,
    /// Add a reference to a block map page. Block map references are never
    /// decremented through the journal.
    BlockMapIncrement = 2,
}

impl JournalOperation {
    /// Returns true for operations that add a reference.
    pub fn is_increment(&self) -> bool {
        matches!(
            self,
            JournalOperation::DataIncrement | JournalOperation::BlockMapIncrement
        )
    }

    /// Packs the operation into its on-disk nibble.
    pub fn to_nibble(self) -> u8 {
        self as u8
    }

    /// Unpacks a nibble into an operation. Unknown codes are refused so a
    /// corrupt or future-format block cannot be silently misread.
    pub fn from_nibble(nibble: u8) -> CoreResult<Self> {
        match nibble {
            0 => Ok(JournalOperation::DataDecrement),
            1 => Ok(JournalOperation::DataIncrement),
            2 => Ok(JournalOperation::BlockMapIncrement),
            code => Err(CoreError::NotImplemented { code }),
        }
    }
}

/// A physical block number paired with the mapping state a logical block
/// holds (or will hold) onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ZonedPbn {
    /// The physical block.
    pub pbn: PhysicalBlockNumber,
    /// The mapping state of the reference.
    pub state: BlockMappingState,
}

impl ZonedPbn {
    /// Creates a mapped reference.
    pub fn new(pbn: PhysicalBlockNumber, state: BlockMappingState) -> Self {
        Self { pbn, state }
    }

    /// Returns true if this reference maps to nothing.
    pub fn is_unmapped(&self) -> bool {
        self.state == BlockMappingState::Unmapped
    }
}
