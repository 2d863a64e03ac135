//! Bit-exact on-disk formats for the recovery journal.
//!
//! Everything here is part of the wire contract shared with the offline
//! replayer: packed entry layout, block header layout, and the persisted
//! component state record (version 7.0). All integers are little-endian.
//! The constants in this module are frozen; changing any of them breaks
//! compatibility with existing journals.

use crc32fast::Hasher;

use crate::error::{CoreError, CoreResult};
use crate::mapping::{BlockMappingState, JournalOperation};
use crate::types::{LogicalBlockNumber, Nonce, PhysicalBlockNumber, RecoveryCount, SequenceNumber};

/// Size in bytes of one on-disk journal block (one device block).
pub const JOURNAL_BLOCK_SIZE: usize = 4096;

/// Size in bytes of the packed journal block header.
pub const PACKED_HEADER_SIZE: usize = 32;

/// Size in bytes of one packed journal entry.
pub const PACKED_ENTRY_SIZE: usize = 12;

/// Number of entries in one on-disk journal block: the largest count whose
/// packed form fits in a device block alongside the header.
pub const RECOVERY_JOURNAL_ENTRIES_PER_BLOCK: u16 = 311;

/// Check byte stamped into every journal block header.
pub const JOURNAL_CHECK_BYTE: u8 = 0x6A;

/// Metadata-type byte identifying recovery journal blocks among the
/// metadata structures sharing the physical layer.
pub const RECOVERY_JOURNAL_METADATA_TYPE: u8 = 0x02;

const _: () = assert!(
    PACKED_HEADER_SIZE + RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as usize * PACKED_ENTRY_SIZE
        <= JOURNAL_BLOCK_SIZE
);

const MAX_LOGICAL_BLOCK: u64 = (1 << 48) - 1;
const MAX_PHYSICAL_BLOCK: u64 = (1 << 40) - 1;

/// One recovery journal entry in its semantic form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryJournalEntry {
    /// The reference-count delta this entry records.
    pub operation: JournalOperation,
    /// The mapping state of the reference.
    pub mapping_state: BlockMappingState,
    /// The logical block whose mapping changed.
    pub logical: LogicalBlockNumber,
    /// The physical block the mapping refers to.
    pub physical: PhysicalBlockNumber,
}

impl RecoveryJournalEntry {
    /// Packs the entry into its 12-byte on-disk form.
    ///
    /// Byte 0 carries the operation nibble (low) and mapping-state nibble
    /// (high); bytes 1..7 the 48-bit LBN; bytes 7..12 the 40-bit PBN.
    pub fn encode(&self) -> CoreResult<[u8; PACKED_ENTRY_SIZE]> {
        if self.logical.as_u64() > MAX_LOGICAL_BLOCK {
            return Err(CoreError::FieldOutOfRange {
                field: "logical block number",
                value: self.logical.as_u64(),
            });
        }
        if self.physical.as_u64() > MAX_PHYSICAL_BLOCK {
            return Err(CoreError::FieldOutOfRange {
                field: "physical block number",
                value: self.physical.as_u64(),
            });
        }

        let mut packed = [0u8; PACKED_ENTRY_SIZE];
        packed[0] = self.operation.to_nibble() | (self.mapping_state.to_nibble() << 4);
        packed[1..7].copy_from_slice(&self.logical.as_u64().to_le_bytes()[..6]);
        packed[7..12].copy_from_slice(&self.physical.as_u64().to_le_bytes()[..5]);
        Ok(packed)
    }

    /// Unpacks a 12-byte on-disk entry, validating both nibbles.
    pub fn decode(packed: &[u8; PACKED_ENTRY_SIZE]) -> CoreResult<Self> {
        let operation = JournalOperation::from_nibble(packed[0] & 0x0F)?;
        let mapping_state = BlockMappingState::from_nibble(packed[0] >> 4)?;

        let mut lbn_bytes = [0u8; 8];
        lbn_bytes[..6].copy_from_slice(&packed[1..7]);
        let mut pbn_bytes = [0u8; 8];
        pbn_bytes[..5].copy_from_slice(&packed[7..12]);

        Ok(Self {
            operation,
            mapping_state,
            logical: LogicalBlockNumber::new(u64::from_le_bytes(lbn_bytes)),
            physical: PhysicalBlockNumber::new(u64::from_le_bytes(pbn_bytes)),
        })
    }
}

/// The header of one on-disk journal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalBlockHeader {
    /// Journal-wide nonce distinguishing this journal's blocks.
    pub nonce: Nonce,
    /// Generation byte for crash recovery.
    pub recovery_count: RecoveryCount,
    /// Sequence number of this block.
    pub sequence_number: SequenceNumber,
    /// Number of valid entries following the header.
    pub entry_count: u16,
}

impl JournalBlockHeader {
    fn pack_prefix(&self) -> [u8; PACKED_HEADER_SIZE - 4] {
        let mut prefix = [0u8; PACKED_HEADER_SIZE - 4];
        prefix[0..8].copy_from_slice(&self.nonce.to_le_bytes());
        prefix[8] = self.recovery_count;
        prefix[9] = JOURNAL_CHECK_BYTE;
        prefix[10] = RECOVERY_JOURNAL_METADATA_TYPE;
        // prefix[11] reserved
        prefix[12..20].copy_from_slice(&self.sequence_number.to_le_bytes());
        prefix[20..22].copy_from_slice(&self.entry_count.to_le_bytes());
        // prefix[22..28] reserved
        prefix
    }
}

fn block_checksum(header_prefix: &[u8], entry_bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(header_prefix);
    hasher.update(entry_bytes);
    hasher.finalize()
}

/// Packs a journal block header and its entries into one device block.
///
/// The trailing bytes of the block are zeroed. The header checksum covers
/// the header prefix plus the packed entry payload.
pub fn encode_journal_block(
    header: &JournalBlockHeader,
    entries: &[RecoveryJournalEntry],
) -> CoreResult<Vec<u8>> {
    if entries.len() != header.entry_count as usize {
        return Err(CoreError::InvalidFormat {
            reason: format!(
                "header entry count {} does not match {} entries",
                header.entry_count,
                entries.len()
            ),
        });
    }
    if header.entry_count > RECOVERY_JOURNAL_ENTRIES_PER_BLOCK {
        return Err(CoreError::FieldOutOfRange {
            field: "entry count",
            value: header.entry_count as u64,
        });
    }

    let mut block = vec![0u8; JOURNAL_BLOCK_SIZE];
    for (i, entry) in entries.iter().enumerate() {
        let offset = PACKED_HEADER_SIZE + i * PACKED_ENTRY_SIZE;
        block[offset..offset + PACKED_ENTRY_SIZE].copy_from_slice(&entry.encode()?);
    }

    let prefix = header.pack_prefix();
    let entry_end = PACKED_HEADER_SIZE + header.entry_count as usize * PACKED_ENTRY_SIZE;
    let checksum = block_checksum(&prefix, &block[PACKED_HEADER_SIZE..entry_end]);

    block[..PACKED_HEADER_SIZE - 4].copy_from_slice(&prefix);
    block[PACKED_HEADER_SIZE - 4..PACKED_HEADER_SIZE].copy_from_slice(&checksum.to_le_bytes());
    Ok(block)
}

/// Unpacks one device block into its header and entries, validating the
/// check byte, metadata type, entry count, checksum, and every entry.
pub fn decode_journal_block(
    block: &[u8],
) -> CoreResult<(JournalBlockHeader, Vec<RecoveryJournalEntry>)> {
    if block.len() != JOURNAL_BLOCK_SIZE {
        return Err(CoreError::InvalidFormat {
            reason: format!("journal block is {} bytes, expected {JOURNAL_BLOCK_SIZE}", block.len()),
        });
    }
    if block[9] != JOURNAL_CHECK_BYTE {
        return Err(CoreError::InvalidFormat {
            reason: format!("bad check byte {:#04x}", block[9]),
        });
    }
    if block[10] != RECOVERY_JOURNAL_METADATA_TYPE {
        return Err(CoreError::InvalidFormat {
            reason: format!("bad metadata type {:#04x}", block[10]),
        });
    }

    let entry_count = u16::from_le_bytes([block[20], block[21]]);
    if entry_count > RECOVERY_JOURNAL_ENTRIES_PER_BLOCK {
        return Err(CoreError::FieldOutOfRange {
            field: "entry count",
            value: entry_count as u64,
        });
    }

    let entry_end = PACKED_HEADER_SIZE + entry_count as usize * PACKED_ENTRY_SIZE;
    let expected = u32::from_le_bytes([block[28], block[29], block[30], block[31]]);
    let actual = block_checksum(
        &block[..PACKED_HEADER_SIZE - 4],
        &block[PACKED_HEADER_SIZE..entry_end],
    );
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }

    let header = JournalBlockHeader {
        nonce: u64::from_le_bytes(block[0..8].try_into().expect("8 bytes")),
        recovery_count: block[8],
        sequence_number: u64::from_le_bytes(block[12..20].try_into().expect("8 bytes")),
        entry_count,
    };

    let mut entries = Vec::with_capacity(entry_count as usize);
    for i in 0..entry_count as usize {
        let offset = PACKED_HEADER_SIZE + i * PACKED_ENTRY_SIZE;
        let packed: &[u8; PACKED_ENTRY_SIZE] = block[offset..offset + PACKED_ENTRY_SIZE]
            .try_into()
            .expect("12 bytes");
        entries.push(RecoveryJournalEntry::decode(packed)?);
    }

    Ok((header, entries))
}

/// Component id of the recovery journal in versioned headers.
pub const RECOVERY_JOURNAL_COMPONENT_ID: u32 = 2;

/// Persisted format version of the recovery journal state record.
pub const RECOVERY_JOURNAL_VERSION: (u32, u32) = (7, 0);

/// Size in bytes of the state payload following the versioned header.
pub const RECOVERY_JOURNAL_STATE_SIZE: u64 = 24;

const VERSIONED_HEADER_SIZE: usize = 20;

/// Total encoded size of the persisted journal state.
pub const ENCODED_STATE_SIZE: usize = VERSIONED_HEADER_SIZE + RECOVERY_JOURNAL_STATE_SIZE as usize;

/// The persisted state of the recovery journal, format 7.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryJournalState {
    /// Where replay must start: the tail for a cleanly saved journal,
    /// otherwise the lower of the two reap heads.
    pub journal_start: SequenceNumber,
    /// Persisted count of logical blocks holding data.
    pub logical_blocks_used: u64,
    /// Persisted count of allocated block map pages.
    pub block_map_data_blocks: u64,
}

impl RecoveryJournalState {
    /// Encodes the state with its versioned header.
    pub fn encode(&self) -> [u8; ENCODED_STATE_SIZE] {
        let mut bytes = [0u8; ENCODED_STATE_SIZE];
        bytes[0..4].copy_from_slice(&RECOVERY_JOURNAL_COMPONENT_ID.to_le_bytes());
        bytes[4..8].copy_from_slice(&RECOVERY_JOURNAL_VERSION.0.to_le_bytes());
        bytes[8..12].copy_from_slice(&RECOVERY_JOURNAL_VERSION.1.to_le_bytes());
        bytes[12..20].copy_from_slice(&RECOVERY_JOURNAL_STATE_SIZE.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.journal_start.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.logical_blocks_used.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.block_map_data_blocks.to_le_bytes());
        bytes
    }

    /// Decodes a state record, rejecting headers whose id, version, or size
    /// do not match format 7.0.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != ENCODED_STATE_SIZE {
            return Err(CoreError::InvalidFormat {
                reason: format!(
                    "state record is {} bytes, expected {ENCODED_STATE_SIZE}",
                    bytes.len()
                ),
            });
        }

        let id = u32::from_le_bytes(bytes[0..4].try_into().expect("4 bytes"));
        let major = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes"));
        let minor = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
        let size = u64::from_le_bytes(bytes[12..20].try_into().expect("8 bytes"));

        let expected = (
            RECOVERY_JOURNAL_COMPONENT_ID,
            RECOVERY_JOURNAL_VERSION,
            RECOVERY_JOURNAL_STATE_SIZE,
        );
        if (id, (major, minor), size) != expected {
            return Err(CoreError::VersionMismatch {
                expected: format!(
                    "id {} version {}.{} size {}",
                    expected.0, expected.1 .0, expected.1 .1, expected.2
                ),
                found: format!("id {id} version {major}.{minor} size {size}"),
            });
        }

        Ok(Self {
            journal_start: u64::from_le_bytes(bytes[20..28].try_into().expect("8 bytes")),
            logical_blocks_used: u64::from_le_bytes(bytes[28..36].try_into().expect("8 bytes")),
            block_map_data_blocks: u64::from_le_bytes(bytes[36..44].try_into().expect("8 bytes")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> RecoveryJournalEntry {
        RecoveryJournalEntry {
            operation: JournalOperation::DataIncrement,
            mapping_state: BlockMappingState::Uncompressed,
            logical: LogicalBlockNumber::new(100),
            physical: PhysicalBlockNumber::new(5000),
        }
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = sample_entry();
        let packed = entry.encode().unwrap();
        assert_eq!(RecoveryJournalEntry::decode(&packed).unwrap(), entry);
    }

    #[test]
    fn test_entry_packs_nibbles() {
        let entry = RecoveryJournalEntry {
            operation: JournalOperation::BlockMapIncrement,
            mapping_state: BlockMappingState::Compressed(3),
            logical: LogicalBlockNumber::new(0),
            physical: PhysicalBlockNumber::new(0),
        };
        let packed = entry.encode().unwrap();
        assert_eq!(packed[0] & 0x0F, 2);
        assert_eq!(packed[0] >> 4, 5);
    }

    #[test]
    fn test_entry_width_limits() {
        let wide_lbn = RecoveryJournalEntry {
            logical: LogicalBlockNumber::new(1 << 48),
            ..sample_entry()
        };
        assert!(matches!(
            wide_lbn.encode(),
            Err(CoreError::FieldOutOfRange { field: "logical block number", .. })
        ));

        let wide_pbn = RecoveryJournalEntry {
            physical: PhysicalBlockNumber::new(1 << 40),
            ..sample_entry()
        };
        assert!(matches!(
            wide_pbn.encode(),
            Err(CoreError::FieldOutOfRange { field: "physical block number", .. })
        ));

        let max = RecoveryJournalEntry {
            logical: LogicalBlockNumber::new((1 << 48) - 1),
            physical: PhysicalBlockNumber::new((1 << 40) - 1),
            ..sample_entry()
        };
        let packed = max.encode().unwrap();
        assert_eq!(RecoveryJournalEntry::decode(&packed).unwrap(), max);
    }

    #[test]
    fn test_entry_decode_rejects_bad_operation() {
        let mut packed = sample_entry().encode().unwrap();
        packed[0] = (packed[0] & 0xF0) | 0x0F;
        assert!(matches!(
            RecoveryJournalEntry::decode(&packed),
            Err(CoreError::NotImplemented { code: 0x0F })
        ));
    }

    fn sample_header(entry_count: u16) -> JournalBlockHeader {
        JournalBlockHeader {
            nonce: 0xA5A5_5A5A_0123_4567,
            recovery_count: 9,
            sequence_number: 42,
            entry_count,
        }
    }

    #[test]
    fn test_block_round_trip() {
        let entries: Vec<_> = (0..5)
            .map(|i| RecoveryJournalEntry {
                logical: LogicalBlockNumber::new(100 + i),
                ..sample_entry()
            })
            .collect();
        let header = sample_header(entries.len() as u16);
        let block = encode_journal_block(&header, &entries).unwrap();
        assert_eq!(block.len(), JOURNAL_BLOCK_SIZE);

        let (decoded_header, decoded_entries) = decode_journal_block(&block).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded_entries, entries);
    }

    #[test]
    fn test_block_checksum_detects_corruption() {
        let entries = vec![sample_entry()];
        let block = encode_journal_block(&sample_header(1), &entries).unwrap();

        let mut corrupted = block.clone();
        corrupted[PACKED_HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            decode_journal_block(&corrupted),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_block_rejects_bad_check_byte() {
        let block = encode_journal_block(&sample_header(0), &[]).unwrap();
        let mut bad = block.clone();
        bad[9] = 0x00;
        assert!(decode_journal_block(&bad).is_err());
    }

    #[test]
    fn test_block_entry_count_must_match() {
        let err = encode_journal_block(&sample_header(3), &[sample_entry()]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat { .. }));
    }

    #[test]
    fn test_full_block_fits() {
        let entries = vec![sample_entry(); RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as usize];
        let header = sample_header(RECOVERY_JOURNAL_ENTRIES_PER_BLOCK);
        let block = encode_journal_block(&header, &entries).unwrap();
        let (decoded_header, decoded_entries) = decode_journal_block(&block).unwrap();
        assert_eq!(decoded_header.entry_count, RECOVERY_JOURNAL_ENTRIES_PER_BLOCK);
        assert_eq!(decoded_entries.len(), RECOVERY_JOURNAL_ENTRIES_PER_BLOCK as usize);
    }

    #[test]
    fn test_state_round_trip() {
        let state = RecoveryJournalState {
            journal_start: 17,
            logical_blocks_used: 4096,
            block_map_data_blocks: 12,
        };
        let encoded = state.encode();
        assert_eq!(RecoveryJournalState::decode(&encoded).unwrap(), state);
    }

    #[test]
    fn test_state_rejects_wrong_version() {
        let state = RecoveryJournalState::default();
        let mut encoded = state.encode();
        encoded[4] = 6; // major version
        assert!(matches!(
            RecoveryJournalState::decode(&encoded),
            Err(CoreError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_state_rejects_wrong_id_and_size() {
        let mut bad_id = RecoveryJournalState::default().encode();
        bad_id[0] = 99;
        assert!(RecoveryJournalState::decode(&bad_id).is_err());

        let mut bad_size = RecoveryJournalState::default().encode();
        bad_size[12] = 23;
        assert!(RecoveryJournalState::decode(&bad_size).is_err());

        assert!(RecoveryJournalState::decode(&[0u8; 10]).is_err());
    }
}
