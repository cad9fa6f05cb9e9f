//! # mel-governance
//!
//! The governance layer of the MEL runtime: proposals in, immutable worlds
//! out.
//!
//! An actor submits a [`Proposal`] wrapping an [`mel_core::Intent`]. The
//! [`Governor`] derives an execution key, asks the actor's bound
//! [`Authority`] for an [`AuthorityDecision`] with an [`ApprovedScope`],
//! validates the proposal against that scope, and hands the intent to the
//! host loop. Terminal snapshots become [`World`]s in a lineage DAG with
//! stored deltas; branch heads advance only for in-scope completions, and a
//! branch switch supersedes the departed branch's in-flight proposals.
//!
//! ## Guarantees
//!
//! - Every submission resolves to exactly one [`SubmissionOutcome`]
//! - Exactly one terminal governance event per proposal
//! - Worlds are immutable and content-addressed; deltas reconstruct lineage
//! - Reserved namespaces never count against an approved scope

// Core modules
mod authority;
mod branch;
mod error;
mod events;
mod governor;
mod keys;
mod proposal;
mod scope;
mod world;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export authorities
pub use authority::{
    Authority, AuthorityDecision, AutoAuthority, HumanAuthority, PendingApproval,
    PolicyAuthority, PolicyRule, RuleCondition, RuleDecision, TribunalAuthority,
};

// Re-export branches
pub use branch::{Branch, BranchId, BranchManager, PersistedBranchState};

// Re-export error types
pub use error::GovernanceError;

// Re-export events
pub use events::{EventSink, GovernanceEvent, NoopSink, TracingSink};

// Re-export the governor
pub use governor::{Governor, GovernorBuilder};

// Re-export key policies
pub use keys::{DefaultKeyPolicy, ExecutionKeyPolicy, PerActorKeyPolicy};

// Re-export proposals
pub use proposal::{ActorId, AuthorityId, Proposal, ProposalId, SubmissionOutcome};

// Re-export scopes
pub use scope::{glob_matches, validate_result_scope, validate_scope, ApprovedScope};

// Re-export worlds
pub use world::{InMemoryWorldStore, World, WorldDelta, WorldId, WorldStatus, WorldStore};
