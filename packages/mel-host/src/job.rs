//! Job types: the units of work a key's runner consumes.
//!
//! Every state transition on an execution key happens through a job on that
//! key's mailbox. Jobs are handled strictly in FIFO order by a single
//! runner, which is what serializes all snapshot access for the key.

use std::fmt;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use mel_core::{ErrorValue, Intent, Patch, RequirementId, Snapshot};

use crate::HostError;

/// Serialization domain identifier: one runner, one job at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionKey(String);

impl ExecutionKey {
    /// Wrap a derived key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Result of one effect execution, injected back into the flow.
#[derive(Debug)]
pub enum EffectOutcome {
    /// The handler returned patches (possibly empty).
    Patches(Vec<Patch>),
    /// The handler failed; the error is recorded and an empty patch list is
    /// injected so flow guards can branch on it.
    Failed(ErrorValue),
}

/// Terminal resolution of a submitted intent.
#[derive(Debug)]
pub enum IntentOutcome {
    /// The flow completed; the snapshot is the new canonical state.
    Completed {
        /// Terminal snapshot.
        snapshot: Snapshot,
    },
    /// The flow (or the host) terminated with an error.
    Failed {
        /// Terminal snapshot, when one was produced.
        snapshot: Option<Snapshot>,
        /// The terminal error.
        error: ErrorValue,
    },
}

impl IntentOutcome {
    /// The terminal snapshot, if any.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            IntentOutcome::Completed { snapshot } => Some(snapshot),
            IntentOutcome::Failed { snapshot, .. } => snapshot.as_ref(),
        }
    }

    /// True for `Completed`.
    pub fn is_completed(&self) -> bool {
        matches!(self, IntentOutcome::Completed { .. })
    }
}

/// A unit of work on a key's mailbox.
pub enum Job {
    /// Begin executing an intent.
    StartIntent {
        /// The intent to run.
        intent: Intent,
        /// Base snapshot; defaults to the key's canonical state (or genesis).
        base: Option<Snapshot>,
        /// Completion channel back to the submitter.
        reply: Option<oneshot::Sender<IntentOutcome>>,
        /// Cancellation signal for the whole intent.
        cancel: CancellationToken,
        /// Optional intent-level deadline.
        deadline: Option<std::time::Duration>,
    },
    /// Re-invoke compute after effect results landed.
    ContinueCompute {
        /// Intent being resumed.
        intent_id: String,
        /// Iteration counter, bounded by the scheduler options.
        iteration: u32,
    },
    /// Inject one effect's result.
    FulfillEffect {
        /// Intent the requirement belongs to.
        intent_id: String,
        /// The requirement being fulfilled.
        requirement_id: RequirementId,
        /// What the handler produced.
        outcome: EffectOutcome,
    },
    /// Apply host-owned patches outside intent evaluation.
    ApplyPatches {
        /// Patches to apply to the key's canonical data.
        patches: Vec<Patch>,
        /// Attribution tag for logs.
        source: String,
        /// Completion channel.
        reply: Option<oneshot::Sender<Result<(), HostError>>>,
    },
}

impl Job {
    /// Short tag for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::StartIntent { .. } => "start_intent",
            Job::ContinueCompute { .. } => "continue_compute",
            Job::FulfillEffect { .. } => "fulfill_effect",
            Job::ApplyPatches { .. } => "apply_patches",
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::StartIntent { intent, .. } => f
                .debug_struct("StartIntent")
                .field("intent_type", &intent.intent_type)
                .field("intent_id", &intent.intent_id)
                .finish_non_exhaustive(),
            Job::ContinueCompute { intent_id, iteration } => f
                .debug_struct("ContinueCompute")
                .field("intent_id", intent_id)
                .field("iteration", iteration)
                .finish(),
            Job::FulfillEffect { intent_id, requirement_id, .. } => f
                .debug_struct("FulfillEffect")
                .field("intent_id", intent_id)
                .field("requirement_id", &requirement_id.to_string())
                .finish_non_exhaustive(),
            Job::ApplyPatches { patches, source, .. } => f
                .debug_struct("ApplyPatches")
                .field("count", &patches.len())
                .field("source", source)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn execution_key_round_trips() {
        let key = ExecutionKey::new("actor:increment");
        assert_eq!(key.as_str(), "actor:increment");
        assert_eq!(key.to_string(), "actor:increment");
        assert_eq!(ExecutionKey::from("actor:increment"), key);
    }

    #[test]
    fn job_kinds() {
        let job = Job::ContinueCompute {
            intent_id: "i".into(),
            iteration: 1,
        };
        assert_eq!(job.kind(), "continue_compute");
    }

    #[test]
    fn job_debug_is_compact() {
        let job = Job::StartIntent {
            intent: Intent::new("increment", json!({}), "i-1"),
            base: None,
            reply: None,
            cancel: CancellationToken::new(),
            deadline: None,
        };
        let debug = format!("{job:?}");
        assert!(debug.contains("StartIntent"));
        assert!(debug.contains("increment"));
    }
}
