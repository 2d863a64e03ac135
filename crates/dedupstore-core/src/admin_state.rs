//! Administrative lifecycle state for core components.
//!
//! The state is authoritative: operations consult it before doing work, and
//! illegal transitions are refused rather than silently coerced.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// The drain operations a component can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrainOperation {
    /// Stop accepting work and quiesce; in-memory state is retained.
    Suspend,
    /// Quiesce and persist state; the component ends up saved.
    Save,
}

/// Administrative state codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdminStateCode {
    /// Freshly constructed, not yet opened.
    New,
    /// Accepting and processing work.
    NormalOperation,
    /// A drain is in progress for the given operation.
    Draining(DrainOperation),
    /// Quiescent after a suspend drain, or after loading persisted state.
    Suspended,
    /// Quiescent after a save drain; state has been persisted.
    Saved,
}

impl AdminStateCode {
    /// A short name for error reporting.
    pub fn name(&self) -> &'static str {
        match self {
            AdminStateCode::New => "New",
            AdminStateCode::NormalOperation => "NormalOperation",
            AdminStateCode::Draining(DrainOperation::Suspend) => "Draining(Suspend)",
            AdminStateCode::Draining(DrainOperation::Save) => "Draining(Save)",
            AdminStateCode::Suspended => "Suspended",
            AdminStateCode::Saved => "Saved",
        }
    }
}

/// The administrative state machine of one component.
#[derive(Debug, Clone)]
pub struct AdminState {
    code: AdminStateCode,
    last_drain_result: CoreResult<()>,
}

impl Default for AdminState {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminState {
    /// Creates a state machine in `New`.
    pub fn new() -> Self {
        Self {
            code: AdminStateCode::New,
            last_drain_result: Ok(()),
        }
    }

    /// Creates a state machine already `Suspended`, as produced by loading
    /// persisted state. A loaded component must be resumed before use.
    pub fn suspended() -> Self {
        Self {
            code: AdminStateCode::Suspended,
            last_drain_result: Ok(()),
        }
    }

    /// Returns the current state code.
    pub fn code(&self) -> AdminStateCode {
        self.code
    }

    /// Transitions `New` to `NormalOperation`. Legal only once, on a freshly
    /// constructed component.
    pub fn open(&mut self) -> CoreResult<()> {
        match self.code {
            AdminStateCode::New => {
                self.code = AdminStateCode::NormalOperation;
                Ok(())
            }
            other => Err(CoreError::InvalidAdminState {
                operation: "open",
                state: other.name(),
            }),
        }
    }

    /// Begins a drain. Legal only from `NormalOperation`.
    pub fn start_draining(&mut self, operation: DrainOperation) -> CoreResult<()> {
        match self.code {
            AdminStateCode::NormalOperation => {
                self.code = AdminStateCode::Draining(operation);
                Ok(())
            }
            other => Err(CoreError::InvalidAdminState {
                operation: "start_draining",
                state: other.name(),
            }),
        }
    }

    /// Completes an in-progress drain, recording the observed result.
    /// Returns the drain operation that finished.
    pub fn finish_draining_with_result(
        &mut self,
        result: CoreResult<()>,
    ) -> CoreResult<DrainOperation> {
        match self.code {
            AdminStateCode::Draining(operation) => {
                self.code = match operation {
                    DrainOperation::Suspend => AdminStateCode::Suspended,
                    DrainOperation::Save => AdminStateCode::Saved,
                };
                self.last_drain_result = result;
                Ok(operation)
            }
            other => Err(CoreError::InvalidAdminState {
                operation: "finish_draining",
                state: other.name(),
            }),
        }
    }

    /// Transitions a quiescent component back to `NormalOperation`.
    pub fn resume_if_quiescent(&mut self) -> CoreResult<()> {
        if self.is_quiescent() {
            self.code = AdminStateCode::NormalOperation;
            Ok(())
        } else {
            Err(CoreError::InvalidAdminState {
                operation: "resume",
                state: self.code.name(),
            })
        }
    }

    /// Returns true while a drain is in progress.
    pub fn is_draining(&self) -> bool {
        matches!(self.code, AdminStateCode::Draining(_))
    }

    /// Returns true while draining for a save.
    pub fn is_saving(&self) -> bool {
        self.code == AdminStateCode::Draining(DrainOperation::Save)
    }

    /// Returns true once a save drain has completed.
    pub fn is_saved(&self) -> bool {
        self.code == AdminStateCode::Saved
    }

    /// Returns true in any quiescent state.
    pub fn is_quiescent(&self) -> bool {
        matches!(self.code, AdminStateCode::Suspended | AdminStateCode::Saved)
    }

    /// Returns true while accepting work.
    pub fn is_normal(&self) -> bool {
        self.code == AdminStateCode::NormalOperation
    }

    /// The result recorded by the most recent completed drain.
    pub fn last_drain_result(&self) -> &CoreResult<()> {
        &self.last_drain_result
    }
}
