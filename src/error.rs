// ⚠️ Errors - What can go wrong while reconciling
//
// Empty inputs are not errors (they produce zero-effect results) and a failed
// batch is reported inside BackfillResult / PruneResult, not here. Only an
// unreachable store or a rejected call surfaces as an Err.

use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};

use crate::category::Category;

/// Failure raised by a backing store implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, lock poisoned, ...)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// A stored row could not be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether the store was down or turned this particular call away
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Unavailable(_) => FailureKind::StoreUnavailable,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => match err.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::PermissionDenied
                | ErrorCode::OutOfMemory
                | ErrorCode::FileLockingProtocolFailed => FailureKind::StoreUnavailable,
                _ => FailureKind::Rejected,
            },
            StoreError::Sqlite(_) | StoreError::Corrupt(_) => FailureKind::Rejected,
        }
    }
}

/// Why a batch did not commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Store unreachable; the same batch may succeed once it is back
    StoreUnavailable,

    /// Store reachable but refused the batch (constraint, bad data)
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Propagated unchanged; batches committed before the failure stand
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("{operation} already running for user {user_id} / {category}")]
    OperationInProgress {
        user_id: String,
        category: Category,
        operation: &'static str,
    },

    #[error("unknown category: {0}")]
    UnknownCategory(String),
}
