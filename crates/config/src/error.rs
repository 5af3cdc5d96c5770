//! Error types for the configuration engine.

use thiserror::Error;

/// Persistence collaborator failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision {0} not found")]
    RevisionNotFound(u64),

    #[error("certificate {0} not found")]
    CertificateNotFound(bastion_common::CertId),

    #[error("account {0} not found")]
    AccountNotFound(bastion_common::AccountId),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures of revision-mutating operations.
///
/// `InProgress` and `AwaitingConfirm` are returned immediately, never
/// queued: the caller is expected to retry after the conflicting
/// operation resolves.
#[derive(Debug, Error)]
pub enum RevisionError {
    /// Another commit/revert/discard/promote holds the single-slot gate.
    #[error("a configuration operation is already in progress")]
    InProgress,

    /// A prior commit's confirm window has not been resolved yet.
    #[error("waiting for the current configuration to be confirmed")]
    AwaitingConfirm,

    /// The running revision is already confirmed and cannot be canceled.
    #[error("the running configuration has already been confirmed")]
    AlreadyConfirmed,

    /// The candidate pointer references a missing or non-editable row.
    #[error("candidate revision {0} is missing or not editable")]
    CandidateInconsistent(u64),

    /// Rollback found nothing to restore.
    #[error("no prior committed revision is available to roll back to")]
    NoPriorRevision,

    #[error("revision {0} not found")]
    RevisionNotFound(u64),

    #[error(transparent)]
    Store(#[from] StoreError),
}
