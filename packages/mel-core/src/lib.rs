//! # mel-core
//!
//! Pure deterministic evaluation kernel for MEL domain schemas.
//!
//! The kernel separates **deciding** from **doing**:
//! - [`compute`] is a pure reducer: `(schema, snapshot, intent, host
//!   context) → (new snapshot, requirements, trace)`. It never performs IO,
//!   never reads a clock, and never panics on well-typed input.
//! - Effects are *declared*, not executed: a flow that reaches an `effect`
//!   node suspends with a [`Requirement`] and the host resumes it later by
//!   calling [`compute`] again.
//!
//! ```text
//! Intent ──► compute() ──► Complete ─────────────► terminal Snapshot
//!               │
//!               ├────────► Error ───────────────► terminal Snapshot
//!               │
//!               └────────► Pending + Requirement ─► host executes effect,
//!                                 ▲                 injects patches,
//!                                 └──────────────── calls compute() again
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Snapshots are values** - every mutation returns a new snapshot with
//!    a strictly larger version
//! 2. **Errors are values** - failures land in `system.errors`, not panics
//! 3. **Determinism** - identical inputs (including frozen `now` and seed)
//!    produce byte-identical canonical outputs and identical requirement ids
//! 4. **Content addressing** - schema hashes, snapshot hashes, and
//!    requirement ids all derive from one canonical JSON form
//! 5. **Reserved namespaces** - `data.$host` and `data.$mel.*` are never
//!    written by user flows or effect handlers

// Core modules
mod canonical;
mod compute;
mod computed;
mod error;
mod expr;
mod flow;
mod intent;
mod patch;
mod schema;
mod snapshot;
mod trace;
mod value;

// Re-export canonical form and hashing
pub use canonical::{
    canonical_bytes, canonical_equal, canonical_string, hash_bytes, hash_value, ContentHash,
};

// Re-export the compute surface
pub use compute::{
    apply_external_patches, compute, genesis, ComputeOptions, ComputeResult, ComputeStatus,
    HostContext,
};

// Re-export the computed dependency graph
pub use computed::ComputedGraph;

// Re-export the error model
pub use error::{
    CanonicalError, ErrorCode, ErrorSource, ErrorValue, PatchError, SchemaError,
};

// Re-export the expression IR
pub use expr::{eval, EvalEnv, Expr};

// Re-export the flow IR
pub use flow::{run_flow, FlowInputs, FlowNode, FlowOutcome, FlowResult, PatchOp};

// Re-export intents and requirements
pub use intent::{requirement_id, Intent, NodePath, Reentry, Requirement, RequirementId};

// Re-export the patch engine
pub use patch::{apply_patches, changed_paths, diff, reject_reserved, Patch, UnsetMode};

// Re-export the schema model
pub use schema::{
    ActionSpec, ComputedSection, ComputedSpec, FieldSpec, FieldType, Schema, SchemaDef,
    StateSection,
};

// Re-export snapshots
pub use snapshot::{Snapshot, SnapshotMeta, SystemState, SystemStatus};

// Re-export tracing structures
pub use trace::{TraceBuilder, TraceGraph, TraceNode};

// Re-export paths and reserved namespace constants
pub use value::{
    Path, PLATFORM_PREFIX, RESERVED_HOST_SEGMENT, RESERVED_PLATFORM_SEGMENT,
};
