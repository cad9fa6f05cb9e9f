//! Execution-key derivation policy.
//!
//! The execution key is the serialization domain: one runner, strict FIFO.
//! The default policy hashes `(actor_id, intent_type)` into a stable key,
//! giving single-writer semantics per actor and intent type. Applications
//! with different contention needs plug in their own policy.

use serde_json::json;

use mel_core::hash_value;
use mel_host::ExecutionKey;

use crate::proposal::Proposal;

/// Derives the execution key for a proposal.
pub trait ExecutionKeyPolicy: Send + Sync {
    /// Derive the key. Identical proposals must yield identical keys.
    fn derive_execution_key(&self, proposal: &Proposal) -> ExecutionKey;
}

/// Default policy: content hash of `(actor_id, intent_type)`.
#[derive(Debug, Default)]
pub struct DefaultKeyPolicy;

impl ExecutionKeyPolicy for DefaultKeyPolicy {
    fn derive_execution_key(&self, proposal: &Proposal) -> ExecutionKey {
        let identity = json!([proposal.actor_id.as_str(), proposal.intent.intent_type]);
        match hash_value(&identity) {
            Ok(hash) => ExecutionKey::new(format!("ek_{}", &hash.as_str()[..16])),
            // Canonicalization of two strings cannot fail; keep a readable
            // fallback anyway.
            Err(_) => ExecutionKey::new(format!(
                "ek_{}:{}",
                proposal.actor_id, proposal.intent.intent_type
            )),
        }
    }
}

/// Serialize every proposal of an actor onto one key, regardless of intent
/// type.
#[derive(Debug, Default)]
pub struct PerActorKeyPolicy;

impl ExecutionKeyPolicy for PerActorKeyPolicy {
    fn derive_execution_key(&self, proposal: &Proposal) -> ExecutionKey {
        ExecutionKey::new(format!("actor_{}", proposal.actor_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{ActorId, ProposalId};
    use chrono::Utc;
    use mel_core::Intent;
    use serde_json::json;

    fn proposal(actor: &str, intent_type: &str) -> Proposal {
        Proposal {
            proposal_id: ProposalId::generate(),
            actor_id: ActorId::from(actor),
            intent: Intent::new(intent_type, json!({}), "i-1"),
            base_world_id: None,
            branch_id: None,
            epoch: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn identical_proposals_yield_identical_keys() {
        let policy = DefaultKeyPolicy;
        let a = policy.derive_execution_key(&proposal("alice", "increment"));
        let b = policy.derive_execution_key(&proposal("alice", "increment"));
        assert_eq!(a, b);
    }

    #[test]
    fn keys_separate_actors_and_intent_types() {
        let policy = DefaultKeyPolicy;
        let base = policy.derive_execution_key(&proposal("alice", "increment"));
        assert_ne!(base, policy.derive_execution_key(&proposal("bob", "increment")));
        assert_ne!(base, policy.derive_execution_key(&proposal("alice", "reset")));
    }

    #[test]
    fn per_actor_policy_collapses_intent_types() {
        let policy = PerActorKeyPolicy;
        assert_eq!(
            policy.derive_execution_key(&proposal("alice", "increment")),
            policy.derive_execution_key(&proposal("alice", "reset")),
        );
    }
}
