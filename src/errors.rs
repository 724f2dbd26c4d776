//! Error types for the revsync crate.
//!
//! This module defines a unified error enumeration used across the object
//! store, manifest store, staging area, lock manager, auth store, and change
//! engine. It integrates with `thiserror` to provide `Display` implementations
//! and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - The dispatcher (`protocol::dispatch`) is the only place a `SyncError` is
//!   mapped onto the wire-level `{status, msg}` contract; no other layer
//!   constructs that contract directly.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the revsync library.
pub enum SyncError {
    /// The `repository` header named a repository absent from configuration.
    #[error("The requested repository does not exist")]
    NoSuchRepository,

    /// Any authentication failure. Intentionally opaque to clients.
    #[error("Could not authenticate user")]
    AuthenticationFailed,

    /// Process-level flock contention, or the user lock is held by a live session.
    #[error("Could not acquire exclusive lock")]
    LockUnavailable,

    /// `begin_commit`'s `previous_revision` no longer matches head.
    #[error("Please update to latest revision")]
    NeedUpdate,

    /// A mutating call arrived with no active staging area.
    #[error("A commit must be started before attempting this operation.")]
    NoActiveCommit,

    /// A `conflict_resolutions` record was malformed.
    #[error("Please resolve conflicts")]
    ConflictResolutionRequired,

    /// A path contained a `.` or `..` segment. Rejected without further detail.
    #[error("")]
    PathTraversal,

    /// A batch delete failed partway through. Rejected without further detail.
    #[error("")]
    BatchFailure,

    /// A manifest referenced a hash with no corresponding object (I2 violation).
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// A revision id does not resolve to any commit record.
    #[error("Revision not found: {0}")]
    RevisionNotFound(String),

    /// I/O error from the underlying filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Auth database error.
    #[error("Database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// Manifest/commit-record (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for invariant violations and miscellaneous internal failures.
    #[error("{0}")]
    Internal(String),
}

impl SyncError {
    /// Render this error the way the wire protocol expects: the normative
    /// `msg` string from the specification's error table (empty for
    /// path-traversal and batch-delete failures, which are reported without
    /// detail).
    pub fn wire_message(&self) -> String {
        match self {
            SyncError::PathTraversal | SyncError::BatchFailure => String::new(),
            SyncError::NoSuchRepository
            | SyncError::AuthenticationFailed
            | SyncError::LockUnavailable
            | SyncError::NeedUpdate
            | SyncError::NoActiveCommit
            | SyncError::ConflictResolutionRequired => self.to_string(),
            other => other.to_string(),
        }
    }
}
