//! Error model for the kernel.
//!
//! # Errors are values
//!
//! Evaluation never panics and never throws past a boundary. An expression
//! or flow failure becomes an [`ErrorValue`] recorded on the snapshot's
//! system block; `fail` elevates one to a terminal result. The closed
//! [`ErrorCode`] set is shared by every layer; the host and governance
//! crates add no codes of their own.
//!
//! Structured `thiserror` enums ([`SchemaError`], [`PatchError`],
//! [`CanonicalError`]) cover the load-time and engine-level failures that
//! are Rust `Result`s rather than in-snapshot values.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The closed set of error codes observable anywhere in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Schema failed shape validation at load.
    SchemaError,
    /// Computed dependency graph or flow call graph contains a cycle.
    CyclicDependency,
    /// Intent referenced an action the schema does not define.
    UnknownAction,
    /// No handler is registered for an emitted effect type.
    UnknownEffect,
    /// A `call` node referenced a flow that does not exist.
    UnknownFlow,
    /// A `call` chain re-entered an action already on the call stack.
    CyclicCall,
    /// Operand or target type did not match the operation.
    TypeMismatch,
    /// Traversal crossed a non-container before the path was exhausted.
    PathNotFound,
    /// A numeric segment indexed past the end of an array.
    IndexOutOfBounds,
    /// Division or modulo by zero.
    DivisionByZero,
    /// The action exists but is not currently dispatchable.
    ActionUnavailable,
    /// Intent input failed the action's input specification.
    InvalidInput,
    /// A state field failed its declared type or required constraint.
    ValidationError,
    /// An effect handler exceeded its timeout budget.
    EffectTimeout,
    /// An effect handler returned an error or panicked.
    EffectHandlerError,
    /// The continue/compute cycle exceeded its iteration bound.
    LoopMaxIterations,
    /// The runtime observed a state it considers impossible.
    InvalidState,
    /// The intent was cancelled before reaching a terminal state.
    Cancelled,
    /// A terminal diff escaped the approved scope.
    ScopeViolation,
    /// The proposing actor is not registered.
    UnknownActor,
    /// The proposing actor has no bound authority.
    UnboundActor,
    /// The authority denied the proposal.
    PermissionDenied,
    /// A referenced world id is not in the store.
    WorldNotFound,
    /// Unclassified internal failure.
    Internal,
}

impl ErrorCode {
    /// Stable wire name (`SCREAMING_SNAKE_CASE`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SchemaError => "SCHEMA_ERROR",
            ErrorCode::CyclicDependency => "CYCLIC_DEPENDENCY",
            ErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ErrorCode::UnknownEffect => "UNKNOWN_EFFECT",
            ErrorCode::UnknownFlow => "UNKNOWN_FLOW",
            ErrorCode::CyclicCall => "CYCLIC_CALL",
            ErrorCode::TypeMismatch => "TYPE_MISMATCH",
            ErrorCode::PathNotFound => "PATH_NOT_FOUND",
            ErrorCode::IndexOutOfBounds => "INDEX_OUT_OF_BOUNDS",
            ErrorCode::DivisionByZero => "DIVISION_BY_ZERO",
            ErrorCode::ActionUnavailable => "ACTION_UNAVAILABLE",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::EffectTimeout => "EFFECT_TIMEOUT",
            ErrorCode::EffectHandlerError => "EFFECT_HANDLER_ERROR",
            ErrorCode::LoopMaxIterations => "LOOP_MAX_ITERATIONS",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::ScopeViolation => "SCOPE_VIOLATION",
            ErrorCode::UnknownActor => "UNKNOWN_ACTOR",
            ErrorCode::UnboundActor => "UNBOUND_ACTOR",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::WorldNotFound => "WORLD_NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Parse a wire name back into a code. Unknown names map to `Internal`.
    pub fn parse(name: &str) -> ErrorCode {
        match name {
            "SCHEMA_ERROR" => ErrorCode::SchemaError,
            "CYCLIC_DEPENDENCY" => ErrorCode::CyclicDependency,
            "UNKNOWN_ACTION" => ErrorCode::UnknownAction,
            "UNKNOWN_EFFECT" => ErrorCode::UnknownEffect,
            "UNKNOWN_FLOW" => ErrorCode::UnknownFlow,
            "CYCLIC_CALL" => ErrorCode::CyclicCall,
            "TYPE_MISMATCH" => ErrorCode::TypeMismatch,
            "PATH_NOT_FOUND" => ErrorCode::PathNotFound,
            "INDEX_OUT_OF_BOUNDS" => ErrorCode::IndexOutOfBounds,
            "DIVISION_BY_ZERO" => ErrorCode::DivisionByZero,
            "ACTION_UNAVAILABLE" => ErrorCode::ActionUnavailable,
            "INVALID_INPUT" => ErrorCode::InvalidInput,
            "VALIDATION_ERROR" => ErrorCode::ValidationError,
            "EFFECT_TIMEOUT" => ErrorCode::EffectTimeout,
            "EFFECT_HANDLER_ERROR" => ErrorCode::EffectHandlerError,
            "LOOP_MAX_ITERATIONS" => ErrorCode::LoopMaxIterations,
            "INVALID_STATE" => ErrorCode::InvalidState,
            "CANCELLED" => ErrorCode::Cancelled,
            "SCOPE_VIOLATION" => ErrorCode::ScopeViolation,
            "UNKNOWN_ACTOR" => ErrorCode::UnknownActor,
            "UNBOUND_ACTOR" => ErrorCode::UnboundActor,
            "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
            "WORLD_NOT_FOUND" => ErrorCode::WorldNotFound,
            _ => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where inside an action an error was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    /// The action whose flow was executing.
    pub action_id: String,
    /// Display form of the flow node path (e.g. `0.2.1`).
    pub node_path: String,
}

/// A first-class error value, recorded on the snapshot's system block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Classification within the closed code set.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Producing location, when the error arose inside a flow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
    /// Frozen-context time at which the error was produced.
    pub timestamp: DateTime<Utc>,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl ErrorValue {
    /// Build an error value with no source attribution.
    pub fn new(code: ErrorCode, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            timestamp,
            context: None,
        }
    }

    /// Attach a producing flow location.
    pub fn with_source(mut self, action_id: impl Into<String>, node_path: impl Into<String>) -> Self {
        self.source = Some(ErrorSource {
            action_id: action_id.into(),
            node_path: node_path.into(),
        });
        self
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Canonical-form encoding failures.
#[derive(Debug, Error)]
pub enum CanonicalError {
    /// The value could not be encoded to canonical JSON.
    #[error("canonical encoding failed: {message}")]
    Encode {
        /// Encoder diagnostic.
        message: String,
    },
}

/// Schema load and validation failures.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// The schema definition failed shape validation.
    #[error("invalid schema: {message}")]
    Invalid {
        /// What was malformed.
        message: String,
    },
    /// The computed dependency graph contains a cycle.
    #[error("cyclic computed dependency: {cycle}")]
    CyclicDependency {
        /// Display form of the cycle, e.g. `a -> b -> a`.
        cycle: String,
    },
    /// The action call graph contains a cycle.
    #[error("cyclic action call: {cycle}")]
    CyclicCall {
        /// Display form of the cycle.
        cycle: String,
    },
    /// An action name uses the reserved platform prefix.
    #[error("action name '{name}' uses the reserved platform prefix")]
    ReservedActionName {
        /// The offending action name.
        name: String,
    },
    /// A flow referenced an unknown action.
    #[error("flow in action '{action}' calls unknown action '{target}'")]
    UnknownCallTarget {
        /// The calling action.
        action: String,
        /// The missing callee.
        target: String,
    },
    /// Canonicalization failed while computing the schema hash.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Patch application failures. The whole batch is rejected on the first one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PatchError {
    /// Target path crossed a non-container.
    #[error("path '{path}' not traversable")]
    PathNotFound {
        /// The failing patch path.
        path: String,
    },
    /// A numeric segment indexed past the end of an array.
    #[error("index out of bounds at '{path}'")]
    IndexOutOfBounds {
        /// The failing patch path.
        path: String,
    },
    /// Merge target or merge value was not an object.
    #[error("cannot merge at '{path}': {message}")]
    MergeTypeMismatch {
        /// The failing patch path.
        path: String,
        /// What was wrong.
        message: String,
    },
    /// Strict-mode unset on a missing path.
    #[error("unset target '{path}' does not exist")]
    UnsetMissing {
        /// The failing patch path.
        path: String,
    },
    /// The patch targeted a reserved namespace it may not touch.
    #[error("path '{path}' targets a reserved namespace")]
    ReservedNamespace {
        /// The failing patch path.
        path: String,
    },
}

impl PatchError {
    /// The error code this failure maps to when recorded as a value.
    pub fn code(&self) -> ErrorCode {
        match self {
            PatchError::PathNotFound { .. } => ErrorCode::PathNotFound,
            PatchError::IndexOutOfBounds { .. } => ErrorCode::IndexOutOfBounds,
            PatchError::MergeTypeMismatch { .. } => ErrorCode::TypeMismatch,
            PatchError::UnsetMissing { .. } => ErrorCode::PathNotFound,
            PatchError::ReservedNamespace { .. } => ErrorCode::PermissionDenied,
        }
    }
}
