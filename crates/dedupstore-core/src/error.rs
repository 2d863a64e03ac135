//! Error types shared across the dedupstore core.

use thiserror::Error;

use crate::types::SequenceNumber;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error variants for core operations.
///
/// Errors are cloneable so a single failure can be fanned out to every
/// waiter queued behind the failing operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The component has entered read-only mode; the operation was refused
    /// or completed with this error.
    #[error("Component is in read-only mode")]
    ReadOnly,

    /// The journal tail sequence number crossed the representable maximum.
    #[error("Journal sequence number overflow at {sequence}")]
    JournalOverflow {
        /// The sequence number that could not be issued.
        sequence: SequenceNumber,
    },

    /// A guaranteed-decrement entry could not be admitted. This is an
    /// accounting bug, not backpressure.
    #[error("Recovery journal is full")]
    JournalFull,

    /// No journal space for a new increment entry. Not fatal; the entry is
    /// retried once reaping frees space.
    #[error("Journal disk space exhausted")]
    DiskFull,

    /// The operation is not legal in the current administrative state.
    #[error("Invalid admin state for {operation}: {state}")]
    InvalidAdminState {
        /// The operation that was attempted.
        operation: &'static str,
        /// Name of the administrative state the component was in.
        state: &'static str,
    },

    /// An operation code with no implementation was encountered.
    #[error("Journal operation {code:#x} is not implemented")]
    NotImplemented {
        /// The unrecognized operation code.
        code: u8,
    },

    /// A journal block write failed.
    #[error("Journal block write failed: {reason}")]
    WriteError {
        /// Description of the failure from the I/O layer.
        reason: String,
    },

    /// A device flush issued during reaping failed.
    #[error("Journal flush failed: {reason}")]
    FlushError {
        /// Description of the failure from the I/O layer.
        reason: String,
    },

    /// A packed on-disk structure failed validation on decode.
    #[error("Invalid on-disk format: {reason}")]
    InvalidFormat {
        /// What was malformed.
        reason: String,
    },

    /// A versioned header did not match the expected id/version/size.
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// The expected header description.
        expected: String,
        /// The header that was actually read.
        found: String,
    },

    /// A checksum did not match the stored value.
    #[error("Checksum mismatch: expected {expected:#010x}, actual {actual:#010x}")]
    ChecksumMismatch {
        /// The checksum recorded on disk.
        expected: u32,
        /// The checksum computed over the data.
        actual: u32,
    },

    /// A field value does not fit in its packed on-disk width.
    #[error("Field {field} value {value} does not fit its on-disk width")]
    FieldOutOfRange {
        /// Name of the packed field.
        field: &'static str,
        /// The value that did not fit.
        value: u64,
    },

    /// A reference count was released more times than it was acquired.
    #[error("Reference count underflow for {counter}")]
    CounterUnderflow {
        /// Which counter underflowed.
        counter: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_result_alias() {
        let ok: CoreResult<u32> = Ok(7);
        assert!(ok.is_ok());

        let err: CoreResult<u32> = Err(CoreError::ReadOnly);
        assert!(err.is_err());
    }

    #[test]
    fn test_errors_are_cloneable_and_comparable() {
        let err = CoreError::JournalOverflow { sequence: 1 << 48 };
        assert_eq!(err.clone(), err);
        assert_ne!(err, CoreError::JournalFull);
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            format!("{}", CoreError::ReadOnly),
            "Component is in read-only mode"
        );
        let msg = format!(
            "{}",
            CoreError::InvalidAdminState {
                operation: "add_entry",
                state: "Suspended",
            }
        );
        assert!(msg.contains("add_entry"));
        assert!(msg.contains("Suspended"));
    }

    #[test]
    fn test_checksum_mismatch_formats_hex() {
        let msg = format!(
            "{}",
            CoreError::ChecksumMismatch {
                expected: 0xDEADBEEF,
                actual: 0x0BADF00D,
            }
        );
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("0x0badf00d"));
    }
}
