//! Host-level error surface.

use thiserror::Error;

use mel_core::{ErrorValue, PatchError, SchemaError};

/// Errors returned by host APIs.
///
/// Failures *inside* an intent execution are not here; those are
/// [`ErrorValue`]s on the terminal snapshot. `HostError` covers misuse of
/// the host surface itself.
#[derive(Debug, Error)]
pub enum HostError {
    /// Attempted to register a handler for a reserved effect type.
    #[error("effect type '{effect_type}' is reserved")]
    ReservedEffectType {
        /// The offending type.
        effect_type: String,
    },
    /// Attempted to register a second handler for the same effect type.
    #[error("effect type '{effect_type}' is already registered")]
    DuplicateEffect {
        /// The offending type.
        effect_type: String,
    },
    /// The runner dropped the completion channel (host shutdown mid-intent).
    #[error("intent completion channel closed")]
    ChannelClosed,
    /// Genesis construction failed before any intent could run.
    #[error("genesis failed: {error}")]
    Genesis {
        /// The underlying validation error.
        error: ErrorValue,
    },
    /// Host-owned patch application failed.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// Schema loading failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}
