//! Governance-level error surface.
//!
//! Proposal-visible failures (rejections, scope violations, supersession)
//! are not errors: they are [`SubmissionOutcome`] variants. `GovernanceError`
//! covers infrastructure failure: missing worlds, broken stores, host
//! misuse.
//!
//! [`SubmissionOutcome`]: crate::proposal::SubmissionOutcome

use thiserror::Error;

use mel_core::{CanonicalError, ErrorValue};
use mel_host::HostError;

/// Errors returned by governance APIs.
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// A referenced world id is not in the store.
    #[error("world '{world_id}' not found")]
    WorldNotFound {
        /// The missing world id.
        world_id: String,
    },
    /// A referenced branch does not exist.
    #[error("branch '{branch_id}' not found")]
    BranchNotFound {
        /// The missing branch id.
        branch_id: String,
    },
    /// The governor has no genesis world yet.
    #[error("lineage not initialized; call initialize() first")]
    NotInitialized,
    /// Genesis snapshot construction failed.
    #[error("genesis failed: {error}")]
    Genesis {
        /// The underlying validation error.
        error: ErrorValue,
    },
    /// Canonicalization failed while hashing a snapshot.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// The host refused the submission.
    #[error(transparent)]
    Host(#[from] HostError),
    /// Backend storage failure.
    #[error("world store failure: {message}")]
    Store {
        /// Backend diagnostic.
        message: String,
    },
}
