//! The governor: proposal → authority → execution → world.
//!
//! ```text
//! Proposal ─► actor/authority lookup ─► derive execution key
//!     │
//!     ▼
//! request_approval ─► rejected ─► proposal:decided(rejected), no world
//!     │
//!     ▼ approved (+scope)
//! pre-scope validation ─► epoch check ─► host.submit(key, intent, base)
//!                                             │
//!                     ┌───────────────────────┴─────────────┐
//!                     ▼                                     ▼
//!              Completed snapshot                    Failed snapshot
//!                     │                                     │
//!          post-scope validation                   world (failed) recorded,
//!              │           │                       head unchanged
//!              ▼           ▼
//!       world committed  world (failed) recorded,
//!       head advances    head unchanged
//! ```
//!
//! Every submission resolves to exactly one [`SubmissionOutcome`], and the
//! sink sees exactly one terminal event per proposal.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use mel_core::{genesis, ErrorCode, HostContext, Intent, Snapshot};
use mel_host::{Host, IntentOutcome, SubmitOptions};

use crate::authority::Authority;
use crate::branch::{Branch, BranchId, BranchManager};
use crate::error::GovernanceError;
use crate::events::{EventSink, GovernanceEvent, NoopSink};
use crate::keys::{DefaultKeyPolicy, ExecutionKeyPolicy};
use crate::proposal::{ActorId, AuthorityId, Proposal, ProposalId, SubmissionOutcome};
use crate::scope::{validate_result_scope, validate_scope, ApprovedScope};
use crate::world::{World, WorldDelta, WorldId, WorldStatus, WorldStore};

/// Builder for a [`Governor`].
pub struct GovernorBuilder {
    host: Host,
    store: Arc<dyn WorldStore>,
    key_policy: Arc<dyn ExecutionKeyPolicy>,
    sink: Arc<dyn EventSink>,
}

impl GovernorBuilder {
    /// Start a builder over a host and a world store.
    pub fn new(host: Host, store: Arc<dyn WorldStore>) -> Self {
        Self {
            host,
            store,
            key_policy: Arc::new(DefaultKeyPolicy),
            sink: Arc::new(NoopSink),
        }
    }

    /// Replace the execution-key policy.
    pub fn with_key_policy(mut self, policy: Arc<dyn ExecutionKeyPolicy>) -> Self {
        self.key_policy = policy;
        self
    }

    /// Attach an event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Finish construction.
    pub fn build(self) -> Governor {
        Governor {
            inner: Arc::new(GovernorInner {
                host: self.host,
                store: self.store,
                branches: BranchManager::new(),
                actors: DashMap::new(),
                authorities: DashMap::new(),
                key_policy: self.key_policy,
                sink: self.sink,
            }),
        }
    }
}

struct GovernorInner {
    host: Host,
    store: Arc<dyn WorldStore>,
    branches: BranchManager,
    actors: DashMap<ActorId, AuthorityId>,
    authorities: DashMap<AuthorityId, Arc<dyn Authority>>,
    key_policy: Arc<dyn ExecutionKeyPolicy>,
    sink: Arc<dyn EventSink>,
}

/// The governance pipeline.
#[derive(Clone)]
pub struct Governor {
    inner: Arc<GovernorInner>,
}

impl Governor {
    /// Start a builder.
    pub fn builder(host: Host, store: Arc<dyn WorldStore>) -> GovernorBuilder {
        GovernorBuilder::new(host, store)
    }

    /// Create the genesis world and the `main` branch.
    ///
    /// Idempotence is the caller's concern; calling twice creates a second
    /// genesis lineage and re-points `main`. Don't.
    pub async fn initialize(
        &self,
        initial_data: Option<Value>,
    ) -> Result<WorldId, GovernanceError> {
        let inner = &self.inner;
        let ctx = HostContext::new(Utc::now(), fastrand::u64(..));
        let snapshot = genesis(inner.host.schema(), initial_data, &ctx)
            .map_err(|error| GovernanceError::Genesis { error })?;

        let world_id = WorldId::generate();
        let world = World {
            world_id,
            schema_hash: snapshot.meta.schema_hash.clone(),
            snapshot_hash: snapshot.content_hash()?,
            created_at: ctx.now,
            created_by_proposal: None,
            status: WorldStatus::Completed,
        };
        inner
            .store
            .store(world, WorldDelta::genesis(world_id, ctx.now), snapshot.clone())
            .await?;
        inner.branches.initialize(
            "main",
            world_id,
            snapshot.meta.schema_hash.clone(),
            ctx.now,
        );
        inner.sink.emit(GovernanceEvent::WorldCreated {
            world_id,
            parent_world_id: world_id,
        });
        info!(world_id = %world_id, "genesis world created");
        Ok(world_id)
    }

    /// Register an authority implementation under an id.
    pub fn register_authority(&self, id: AuthorityId, authority: Arc<dyn Authority>) {
        self.inner.authorities.insert(id, authority);
    }

    /// Bind an actor to a registered authority.
    pub fn register_actor(&self, actor: ActorId, authority: AuthorityId) {
        self.inner.actors.insert(actor, authority);
    }

    /// Build a proposal against the active branch's current head and epoch.
    pub fn propose(&self, actor: ActorId, intent: Intent) -> Result<Proposal, GovernanceError> {
        let branch = self.inner.branches.active()?;
        Ok(Proposal {
            proposal_id: ProposalId::generate(),
            actor_id: actor,
            intent,
            base_world_id: None,
            branch_id: Some(branch.id),
            epoch: branch.epoch,
            created_at: Utc::now(),
        })
    }

    /// The active branch.
    pub fn active_branch(&self) -> Result<Branch, GovernanceError> {
        self.inner.branches.active()
    }

    /// Fork a branch at a world and emit `world:forked`.
    pub async fn create_branch(
        &self,
        name: &str,
        from_world: WorldId,
    ) -> Result<Branch, GovernanceError> {
        let inner = &self.inner;
        if !inner.store.has(&from_world).await? {
            return Err(GovernanceError::WorldNotFound {
                world_id: from_world.to_string(),
            });
        }
        let active = inner.branches.active()?;
        let branch = inner.branches.fork(
            name,
            from_world,
            &active.id,
            active.schema_hash.clone(),
            Utc::now(),
        )?;
        inner.sink.emit(GovernanceEvent::WorldForked {
            world_id: from_world,
            branch_id: branch.id.clone(),
        });
        Ok(branch)
    }

    /// Switch the active branch (bumping the departed branch's epoch).
    pub fn switch_branch(&self, to: &BranchId) -> Result<Branch, GovernanceError> {
        self.inner.branches.switch(to)
    }

    /// Persist branch bookkeeping into the world store.
    pub async fn save_branch_state(&self) -> Result<(), GovernanceError> {
        let state = self.inner.branches.persisted()?;
        self.inner.store.save_branch_state(state).await
    }

    /// Restore branch bookkeeping from the world store.
    pub async fn load_branch_state(&self) -> Result<bool, GovernanceError> {
        match self.inner.store.load_branch_state().await? {
            Some(state) => {
                self.inner.branches.restore(state);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run the full submission pipeline for a proposal.
    pub async fn submit(&self, proposal: Proposal) -> Result<SubmissionOutcome, GovernanceError> {
        let inner = &self.inner;
        let proposal_id = proposal.proposal_id;
        inner
            .sink
            .emit(GovernanceEvent::ProposalSubmitted { proposal_id });

        // 1. Actor registration and authority binding.
        let Some(authority_id) = inner
            .actors
            .get(&proposal.actor_id)
            .map(|e| e.value().clone())
        else {
            return Ok(self.reject(
                proposal_id,
                format!("actor '{}' is not registered", proposal.actor_id),
            ));
        };
        let Some(authority) = inner
            .authorities
            .get(&authority_id)
            .map(|e| e.value().clone())
        else {
            return Ok(self.reject(
                proposal_id,
                format!("actor '{}' is bound to an unknown authority", proposal.actor_id),
            ));
        };

        // 2. Execution key.
        let key = inner.key_policy.derive_execution_key(&proposal);

        // 3. Authority decision.
        inner
            .sink
            .emit(GovernanceEvent::ProposalEvaluating { proposal_id });
        let decision = authority.request_approval(&proposal).await;
        if !decision.approved {
            let reason = decision
                .reason
                .unwrap_or_else(|| "denied by authority".to_string());
            return Ok(self.reject(proposal_id, reason));
        }
        let scope = decision
            .approved_scope
            .unwrap_or_else(ApprovedScope::unrestricted);

        // 4. Pre-execution scope validation.
        if let Err(reason) = validate_scope(&proposal, &scope) {
            return Ok(self.reject(proposal_id, reason));
        }
        inner.sink.emit(GovernanceEvent::ProposalDecided {
            proposal_id,
            approved: true,
            reason: None,
        });

        // 5. Epoch check at execution time: the authority may have taken
        // arbitrarily long, and the user may have switched branches meanwhile.
        let branch_id = match &proposal.branch_id {
            Some(id) => id.clone(),
            None => inner.branches.active()?.id,
        };
        if self.superseded(&proposal, &branch_id)? {
            return Ok(SubmissionOutcome::Superseded);
        }

        // 6. Resolve the base snapshot.
        let branch = inner.branches.get(&branch_id)?;
        let base_world = proposal.base_world_id.unwrap_or(branch.head);
        let base_snapshot = inner.store.restore(&base_world).await?;

        // 7. Execute on the host.
        debug!(proposal_id = %proposal_id, key = %key, "handing off to host");
        let outcome = inner
            .host
            .submit(
                key,
                proposal.intent.clone(),
                Some(base_snapshot.clone()),
                SubmitOptions::default(),
            )
            .await?;

        // 8. Epoch re-check before committing anything.
        if self.superseded(&proposal, &branch_id)? {
            return Ok(SubmissionOutcome::Superseded);
        }

        match outcome {
            IntentOutcome::Completed { snapshot } => {
                match validate_result_scope(&base_snapshot, &snapshot, &scope) {
                    Ok(()) => {
                        let world_id = self
                            .record_world(
                                &proposal,
                                base_world,
                                &base_snapshot,
                                &snapshot,
                                WorldStatus::Completed,
                            )
                            .await?;
                        inner.branches.advance_head(&branch_id, world_id)?;
                        inner.sink.emit(GovernanceEvent::ExecutionCompleted {
                            proposal_id,
                            world_id,
                        });
                        Ok(SubmissionOutcome::Completed { world_id, snapshot })
                    }
                    Err(violation) => {
                        // The terminal snapshot escaped its approved scope:
                        // record the world for forensics, keep the head put.
                        warn!(proposal_id = %proposal_id, error = %violation, "scope violation");
                        let world_id = self
                            .record_world(
                                &proposal,
                                base_world,
                                &base_snapshot,
                                &snapshot,
                                WorldStatus::Failed,
                            )
                            .await?;
                        inner.sink.emit(GovernanceEvent::ExecutionFailed {
                            proposal_id,
                            world_id: Some(world_id),
                            reason: ErrorCode::ScopeViolation.to_string(),
                        });
                        Ok(SubmissionOutcome::Failed {
                            world_id: Some(world_id),
                            error: violation,
                        })
                    }
                }
            }
            IntentOutcome::Failed { snapshot, error } => {
                let world_id = match snapshot {
                    Some(snapshot) => Some(
                        self.record_world(
                            &proposal,
                            base_world,
                            &base_snapshot,
                            &snapshot,
                            WorldStatus::Failed,
                        )
                        .await?,
                    ),
                    None => None,
                };
                inner.sink.emit(GovernanceEvent::ExecutionFailed {
                    proposal_id,
                    world_id,
                    reason: error.code.to_string(),
                });
                Ok(SubmissionOutcome::Failed { world_id, error })
            }
        }
    }

    fn reject(&self, proposal_id: ProposalId, reason: String) -> SubmissionOutcome {
        self.inner.sink.emit(GovernanceEvent::ProposalDecided {
            proposal_id,
            approved: false,
            reason: Some(reason.clone()),
        });
        SubmissionOutcome::Rejected { reason }
    }

    fn superseded(
        &self,
        proposal: &Proposal,
        branch_id: &BranchId,
    ) -> Result<bool, GovernanceError> {
        let current = self.inner.branches.epoch(branch_id)?;
        if proposal.epoch < current {
            self.inner.sink.emit(GovernanceEvent::ProposalSuperseded {
                proposal_id: proposal.proposal_id,
                reason: "branch_switch".to_string(),
            });
            return Ok(true);
        }
        Ok(false)
    }

    async fn record_world(
        &self,
        proposal: &Proposal,
        parent: WorldId,
        base: &Snapshot,
        terminal: &Snapshot,
        status: WorldStatus,
    ) -> Result<WorldId, GovernanceError> {
        let inner = &self.inner;
        let world_id = WorldId::generate();
        let now = Utc::now();
        let world = World {
            world_id,
            schema_hash: terminal.meta.schema_hash.clone(),
            snapshot_hash: terminal.content_hash()?,
            created_at: now,
            created_by_proposal: Some(proposal.proposal_id),
            status,
        };
        let delta = WorldDelta {
            from_world_id: parent,
            to_world_id: world_id,
            patches: mel_core::diff(&base.data, &terminal.data),
            created_at: now,
        };
        inner.store.store(world, delta, terminal.clone()).await?;
        inner.sink.emit(GovernanceEvent::WorldCreated {
            world_id,
            parent_world_id: parent,
        });
        Ok(world_id)
    }
}
