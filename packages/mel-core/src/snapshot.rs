//! Immutable, versioned snapshots.
//!
//! A snapshot is a value: every operation that "mutates" one returns a new
//! snapshot with a strictly larger `meta.version`. The kernel never hands
//! out aliased mutable state.
//!
//! The `system` block is runtime-owned bookkeeping (status, errors, pending
//! requirements); `data` is user-owned; `computed` mirrors the schema's
//! computed section; `input` holds the current action's input while an
//! intent is executing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{hash_value, ContentHash};
use crate::error::{CanonicalError, ErrorValue};
use crate::intent::Requirement;

/// Runtime status of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    /// No intent is executing.
    Idle,
    /// A compute pass is in progress (transient, never observed terminally).
    Computing,
    /// Suspended on one or more effect requirements.
    Pending,
    /// The last intent terminated with an error.
    Error,
}

/// Runtime-owned bookkeeping block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    /// Current status.
    pub status: SystemStatus,
    /// Most recent error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorValue>,
    /// All errors recorded since the snapshot lineage began.
    pub errors: Vec<ErrorValue>,
    /// Requirements awaiting host fulfillment.
    pub pending_requirements: Vec<Requirement>,
    /// Action currently executing, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_action: Option<String>,
}

impl SystemState {
    /// A clean idle block.
    pub fn idle() -> Self {
        Self {
            status: SystemStatus::Idle,
            last_error: None,
            errors: Vec::new(),
            pending_requirements: Vec::new(),
            current_action: None,
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Strictly monotonic under any mutation.
    pub version: u64,
    /// Frozen-context time of the producing operation.
    pub timestamp: DateTime<Utc>,
    /// Frozen-context seed of the producing operation.
    pub random_seed: u64,
    /// Hash of the schema that produced this snapshot.
    pub schema_hash: ContentHash,
}

/// An immutable point-in-time projection of all schema data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// User-owned data tree.
    pub data: Value,
    /// Computed field name → value.
    pub computed: BTreeMap<String, Value>,
    /// Runtime bookkeeping.
    pub system: SystemState,
    /// Current action input (null when idle).
    pub input: Value,
    /// Metadata.
    pub meta: SnapshotMeta,
}

impl Snapshot {
    /// Content hash over `{data, computed}`.
    ///
    /// Metadata (version, timestamp) is deliberately excluded: two snapshots
    /// with the same observable state hash identically.
    pub fn content_hash(&self) -> Result<ContentHash, CanonicalError> {
        let computed: Value = self
            .computed
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<serde_json::Map<String, Value>>()
            .into();
        hash_value(&serde_json::json!({
            "data": self.data,
            "computed": computed,
        }))
    }

    /// The computed map as an object value (for expression evaluation).
    pub fn computed_view(&self) -> Value {
        Value::Object(
            self.computed
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// The system block as an object value (for `sys(...)` reads).
    ///
    /// Serialization of the system block cannot fail; a defensive null is
    /// returned if it ever did.
    pub fn system_view(&self) -> Value {
        serde_json::to_value(&self.system).unwrap_or(Value::Null)
    }

    /// Successor metadata: version bumped, context refreshed.
    pub fn next_meta(&self, now: DateTime<Utc>, random_seed: u64) -> SnapshotMeta {
        SnapshotMeta {
            version: self.meta.version + 1,
            timestamp: now,
            random_seed,
            schema_hash: self.meta.schema_hash.clone(),
        }
    }
}
