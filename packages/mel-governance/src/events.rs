//! Governance events and the sink seam.
//!
//! The governor emits a small closed set of events describing the lifecycle
//! of proposals and worlds. Fan-out, subscriptions, and delivery guarantees
//! are an application concern; the core only promises per-key emission
//! order and accepts any sink, including [`NoopSink`].

use crate::branch::BranchId;
use crate::proposal::ProposalId;
use crate::world::WorldId;

/// Lifecycle events emitted by the governor.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernanceEvent {
    /// A proposal entered the pipeline.
    ProposalSubmitted {
        /// The proposal.
        proposal_id: ProposalId,
    },
    /// Authority evaluation began.
    ProposalEvaluating {
        /// The proposal.
        proposal_id: ProposalId,
    },
    /// The authority (or pre-validation) decided.
    ProposalDecided {
        /// The proposal.
        proposal_id: ProposalId,
        /// Whether it was approved.
        approved: bool,
        /// Optional reason, mainly for rejections.
        reason: Option<String>,
    },
    /// A branch switch outpaced the proposal.
    ProposalSuperseded {
        /// The proposal.
        proposal_id: ProposalId,
        /// Why it was superseded.
        reason: String,
    },
    /// Execution finished and the world passed scope validation.
    ExecutionCompleted {
        /// The proposal.
        proposal_id: ProposalId,
        /// The recorded world.
        world_id: WorldId,
    },
    /// Execution failed (terminal error or scope violation).
    ExecutionFailed {
        /// The proposal.
        proposal_id: ProposalId,
        /// The recorded world, when one exists.
        world_id: Option<WorldId>,
        /// Failure classification, e.g. `SCOPE_VIOLATION`.
        reason: String,
    },
    /// A world was recorded in the lineage.
    WorldCreated {
        /// The new world.
        world_id: WorldId,
        /// Its parent in the DAG (self for genesis).
        parent_world_id: WorldId,
    },
    /// A branch was forked from an existing world.
    WorldForked {
        /// The fork point.
        world_id: WorldId,
        /// The new branch.
        branch_id: BranchId,
    },
}

/// Receives governance events.
pub trait EventSink: Send + Sync {
    /// Accept one event. Must not block the governor.
    fn emit(&self, event: GovernanceEvent);
}

/// A sink that drops everything.
#[derive(Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: GovernanceEvent) {}
}

/// A sink that forwards events to `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: GovernanceEvent) {
        tracing::debug!(?event, "governance event");
    }
}
