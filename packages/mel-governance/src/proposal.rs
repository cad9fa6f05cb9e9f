//! Proposals: governance-wrapped intents.
//!
//! Identifiers here are opaque newtypes with stable wire forms; numeric or
//! structural meaning is never read back out of them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mel_core::{ErrorValue, Intent, Snapshot};

use crate::branch::BranchId;
use crate::world::WorldId;

/// Identity of a registered actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    /// Wrap an actor identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Identity of a registered authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorityId(String);

impl AuthorityId {
    /// Wrap an authority identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AuthorityId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Identity of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(Uuid);

impl ProposalId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The inner uuid.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A governance-wrapped intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique proposal identity.
    pub proposal_id: ProposalId,
    /// The proposing actor.
    pub actor_id: ActorId,
    /// The wrapped intent.
    pub intent: Intent,
    /// World to execute against; defaults to the branch head.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_world_id: Option<WorldId>,
    /// Target branch; defaults to the active branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<BranchId>,
    /// Branch epoch observed at proposal time. A stale epoch at execution
    /// time supersedes the proposal.
    pub epoch: u64,
    /// Wall-clock submission time.
    pub created_at: DateTime<Utc>,
}

/// Terminal resolution of a proposal submission.
#[derive(Debug)]
pub enum SubmissionOutcome {
    /// The intent executed and its world passed scope validation.
    Completed {
        /// The recorded world.
        world_id: WorldId,
        /// Terminal snapshot.
        snapshot: Snapshot,
    },
    /// Execution or scope validation failed. A world may still have been
    /// recorded (scope violations record the terminal snapshot).
    Failed {
        /// The recorded world, when one exists.
        world_id: Option<WorldId>,
        /// The terminal error.
        error: ErrorValue,
    },
    /// The authority (or pre-validation) declined the proposal; no world.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
    /// A branch switch outpaced the proposal; no world.
    Superseded,
}

impl SubmissionOutcome {
    /// True for `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, SubmissionOutcome::Completed { .. })
    }
}
