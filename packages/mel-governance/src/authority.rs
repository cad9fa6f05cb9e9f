//! Authorities: the single approval seam.
//!
//! Every authority kind (automatic, policy-driven, human, tribunal) sits
//! behind one capability: [`Authority::request_approval`]. The governor
//! neither knows nor cares which kind decided.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::proposal::Proposal;
use crate::scope::{glob_matches, ApprovedScope};

/// An approval decision with an optional scope constraint.
#[derive(Debug, Clone)]
pub struct AuthorityDecision {
    /// Whether the proposal may execute.
    pub approved: bool,
    /// Optional human-readable reason.
    pub reason: Option<String>,
    /// Scope the execution must stay inside; `None` means unrestricted.
    pub approved_scope: Option<ApprovedScope>,
    /// Decision time.
    pub timestamp: chrono::DateTime<Utc>,
}

impl AuthorityDecision {
    /// An approval with an optional scope.
    pub fn approve(scope: Option<ApprovedScope>) -> Self {
        Self {
            approved: true,
            reason: None,
            approved_scope: scope,
            timestamp: Utc::now(),
        }
    }

    /// A rejection with a reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            approved_scope: None,
            timestamp: Utc::now(),
        }
    }
}

/// The single approval capability.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Evaluate a proposal. Must not panic; a failing authority should
    /// reject rather than error.
    async fn request_approval(&self, proposal: &Proposal) -> AuthorityDecision;
}

// =============================================================================
// Auto
// =============================================================================

/// Approves everything, optionally attaching a fixed scope.
#[derive(Default)]
pub struct AutoAuthority {
    scope: Option<ApprovedScope>,
}

impl AutoAuthority {
    /// Approve-all with no scope constraint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Approve-all with a fixed scope.
    pub fn with_scope(scope: ApprovedScope) -> Self {
        Self { scope: Some(scope) }
    }
}

#[async_trait]
impl Authority for AutoAuthority {
    async fn request_approval(&self, _proposal: &Proposal) -> AuthorityDecision {
        AuthorityDecision::approve(self.scope.clone())
    }
}

// =============================================================================
// Policy
// =============================================================================

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleDecision {
    /// Approve the proposal.
    Approve,
    /// Reject the proposal.
    Reject,
}

/// When a rule applies.
pub enum RuleCondition {
    /// Intent type is one of the listed types.
    IntentTypeIn(Vec<String>),
    /// Intent type matches a dot-segment glob (`user.*`, `**`).
    TypePattern(String),
    /// A named predicate registered on the authority.
    Custom(String),
}

/// One ordered policy rule.
pub struct PolicyRule {
    /// When the rule applies.
    pub condition: RuleCondition,
    /// What it decides.
    pub decision: RuleDecision,
    /// Reason attached to the decision.
    pub reason: Option<String>,
}

type CustomPredicate = Box<dyn Fn(&Proposal) -> bool + Send + Sync>;

/// Ordered-rule authority: first matching rule wins, default otherwise.
pub struct PolicyAuthority {
    rules: Vec<PolicyRule>,
    default_decision: RuleDecision,
    scope: Option<ApprovedScope>,
    predicates: HashMap<String, CustomPredicate>,
}

impl PolicyAuthority {
    /// Start with a default decision and no rules.
    pub fn new(default_decision: RuleDecision) -> Self {
        Self {
            rules: Vec::new(),
            default_decision,
            scope: None,
            predicates: HashMap::new(),
        }
    }

    /// Append a rule. Rules are evaluated in insertion order.
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Attach the scope granted on approval.
    pub fn with_scope(mut self, scope: ApprovedScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Register a named predicate for `RuleCondition::Custom`.
    pub fn with_predicate(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&Proposal) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.insert(name.into(), Box::new(predicate));
        self
    }

    fn matches(&self, condition: &RuleCondition, proposal: &Proposal) -> bool {
        match condition {
            RuleCondition::IntentTypeIn(types) => {
                types.iter().any(|t| t == &proposal.intent.intent_type)
            }
            RuleCondition::TypePattern(pattern) => {
                glob_matches(pattern, &proposal.intent.intent_type)
            }
            RuleCondition::Custom(name) => match self.predicates.get(name) {
                Some(predicate) => predicate(proposal),
                None => {
                    // An unregistered predicate never matches; it cannot
                    // silently approve.
                    warn!(predicate = %name, "custom policy predicate not registered");
                    false
                }
            },
        }
    }
}

#[async_trait]
impl Authority for PolicyAuthority {
    async fn request_approval(&self, proposal: &Proposal) -> AuthorityDecision {
        for rule in &self.rules {
            if self.matches(&rule.condition, proposal) {
                return match rule.decision {
                    RuleDecision::Approve => AuthorityDecision {
                        approved: true,
                        reason: rule.reason.clone(),
                        approved_scope: self.scope.clone(),
                        timestamp: Utc::now(),
                    },
                    RuleDecision::Reject => AuthorityDecision {
                        approved: false,
                        reason: rule.reason.clone(),
                        approved_scope: None,
                        timestamp: Utc::now(),
                    },
                };
            }
        }
        match self.default_decision {
            RuleDecision::Approve => AuthorityDecision::approve(self.scope.clone()),
            RuleDecision::Reject => AuthorityDecision::reject("no policy rule matched"),
        }
    }
}

// =============================================================================
// Human
// =============================================================================

/// A pending approval surfaced to a human operator.
pub struct PendingApproval {
    /// The proposal awaiting a decision.
    pub proposal: Proposal,
    /// Channel for the operator's decision.
    pub respond: oneshot::Sender<AuthorityDecision>,
}

/// Routes approvals to an out-of-band human channel.
///
/// The receiving side (UI, chat bot, queue worker) owns the other end of
/// the channel and replies per request. A closed or full channel rejects.
pub struct HumanAuthority {
    requests: mpsc::Sender<PendingApproval>,
}

impl HumanAuthority {
    /// Create the authority plus the operator's request stream.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { requests: tx }, rx)
    }
}

#[async_trait]
impl Authority for HumanAuthority {
    async fn request_approval(&self, proposal: &Proposal) -> AuthorityDecision {
        let (respond, decision) = oneshot::channel();
        let pending = PendingApproval {
            proposal: proposal.clone(),
            respond,
        };
        if self.requests.send(pending).await.is_err() {
            return AuthorityDecision::reject("approval channel closed");
        }
        match decision.await {
            Ok(decision) => decision,
            Err(_) => AuthorityDecision::reject("approver abandoned the request"),
        }
    }
}

// =============================================================================
// Tribunal
// =============================================================================

/// Quorum over member authorities.
///
/// Members are consulted in order; the proposal is approved once `quorum`
/// members approve. The first approving member's scope is used.
pub struct TribunalAuthority {
    members: Vec<Arc<dyn Authority>>,
    quorum: usize,
}

impl TribunalAuthority {
    /// Build a tribunal. `quorum` is clamped to the member count.
    pub fn new(members: Vec<Arc<dyn Authority>>, quorum: usize) -> Self {
        let quorum = quorum.min(members.len()).max(1);
        Self { members, quorum }
    }
}

#[async_trait]
impl Authority for TribunalAuthority {
    async fn request_approval(&self, proposal: &Proposal) -> AuthorityDecision {
        let mut approvals = 0;
        let mut scope = None;
        let mut reasons = Vec::new();
        for member in &self.members {
            let decision = member.request_approval(proposal).await;
            if decision.approved {
                approvals += 1;
                if scope.is_none() {
                    scope = decision.approved_scope;
                }
                if approvals >= self.quorum {
                    return AuthorityDecision::approve(scope);
                }
            } else if let Some(reason) = decision.reason {
                reasons.push(reason);
            }
        }
        AuthorityDecision::reject(format!(
            "quorum not reached ({approvals}/{} needed {}): {}",
            self.members.len(),
            self.quorum,
            reasons.join("; ")
        ))
    }
}
