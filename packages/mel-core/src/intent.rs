//! Intents, flow positions, and effect requirements.
//!
//! An [`Intent`] is a user-authored request to run a named action. Its
//! `intent_id` is the re-entry key: once-guards and requirement ids are both
//! derived from it, which is what makes retried dispatches converge.
//!
//! A [`Requirement`] is a recorded effect declaration awaiting host
//! fulfillment. Its id is a pure function of
//! `(schema_hash, intent_id, action_id, flow_node_path)`, so re-running the
//! same flow over the same intent always names the same requirement.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::canonical::{hash_value, ContentHash};
use crate::error::CanonicalError;

/// A request to run a named action with input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// The action name to dispatch.
    #[serde(rename = "type")]
    pub intent_type: String,
    /// Action input, visible to flows under the `input.` path root.
    pub input: Value,
    /// Re-entry key; identical ids are idempotent under once-guards.
    pub intent_id: String,
}

impl Intent {
    /// Build an intent.
    pub fn new(
        intent_type: impl Into<String>,
        input: Value,
        intent_id: impl Into<String>,
    ) -> Self {
        Self {
            intent_type: intent_type.into(),
            input,
            intent_id: intent_id.into(),
        }
    }
}

/// Index path of a node inside an action's (inlined) flow tree.
///
/// Ordering is document order: an ancestor sorts before its descendants,
/// earlier siblings before later ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(SmallVec<[u32; 8]>);

impl NodePath {
    /// The root position (before descending into any node).
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    /// Build from explicit indices.
    pub fn from_indices(indices: impl IntoIterator<Item = u32>) -> Self {
        Self(indices.into_iter().collect())
    }

    /// The index sequence.
    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    /// Descend into child `index`.
    pub fn push(&mut self, index: u32) {
        self.0.push(index);
    }

    /// Ascend one level.
    pub fn pop(&mut self) {
        self.0.pop();
    }

    /// True if `self` is `other` or an ancestor of `other`.
    pub fn is_prefix_of(&self, other: &NodePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for index in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{index}")?;
            first = false;
        }
        Ok(())
    }
}

/// Identity of a recorded effect requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementId(ContentHash);

impl RequirementId {
    /// The underlying content hash.
    pub fn hash(&self) -> &ContentHash {
        &self.0
    }
}

impl fmt::Display for RequirementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Derive the deterministic requirement id for an effect node.
pub fn requirement_id(
    schema_hash: &ContentHash,
    intent_id: &str,
    action_id: &str,
    flow_position: &NodePath,
) -> Result<RequirementId, CanonicalError> {
    let identity = Value::Array(vec![
        Value::String(schema_hash.as_str().to_string()),
        Value::String(intent_id.to_string()),
        Value::String(action_id.to_string()),
        Value::Array(
            flow_position
                .indices()
                .iter()
                .map(|i| Value::from(*i))
                .collect(),
        ),
    ]);
    Ok(RequirementId(hash_value(&identity)?))
}

/// A recorded effect declaration awaiting host fulfillment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    /// Deterministic identity (see [`requirement_id`]).
    pub id: RequirementId,
    /// Registered effect type to invoke.
    pub effect_type: String,
    /// Parameters, fully resolved against the working snapshot.
    pub params: Map<String, Value>,
    /// Action whose flow emitted the requirement.
    pub action_id: String,
    /// Node path of the emitting effect node.
    pub flow_position: NodePath,
    /// Frozen-context time of emission.
    pub created_at: DateTime<Utc>,
}

/// Out-of-band continuation state the host carries between compute passes.
///
/// This is the per-intent "continuation slot" of the execution context. It
/// never appears inside snapshot data.
#[derive(Debug, Clone, Default)]
pub struct Reentry {
    /// Flow position of the most recent suspension, if any. The walker
    /// fast-forwards past everything at or before this position.
    pub resume_after: Option<NodePath>,
    /// Requirements whose results have been injected.
    pub fulfilled: std::collections::BTreeSet<RequirementId>,
}

impl Reentry {
    /// Fresh state for a first dispatch.
    pub fn initial() -> Self {
        Self::default()
    }
}
