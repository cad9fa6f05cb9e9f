//! # mel-host
//!
//! The host loop for the MEL kernel: a mailbox+runner event loop that drives
//! the compute → effect → re-compute cycle per execution key.
//!
//! The kernel decides; the host does. [`mel_core::compute`] never performs
//! IO; when a flow suspends on an effect, the host executes the registered
//! handler off-mailbox, injects its result patches, and re-enters compute
//! with the continuation it kept out-of-band.
//!
//! ## Guarantees
//!
//! - **Per-key serialization**: one runner per execution key, FIFO jobs,
//!   no lost wakeups
//! - **Frozen context**: each job observes a single `{now, random_seed}`
//! - **Publish boundary**: observers see one notification per intent, at
//!   its terminal transition
//! - **Contained effects**: handler errors, panics, and timeouts become
//!   recorded error values, never crashes

// Core modules
mod effects;
mod error;
mod host;
mod job;
mod mailbox;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the effect surface
pub use effects::{
    EffectContext, EffectHandler, EffectOptions, EffectRegistry, PatchBatch,
    RESERVED_EFFECT_PREFIX,
};

// Re-export error types
pub use error::HostError;

// Re-export the host surface
pub use host::{
    DevtoolsOptions, Host, HostBuilder, HostOptions, SchedulerOptions, SnapshotPublished,
    SubmitOptions,
};

// Re-export job types
pub use job::{EffectOutcome, ExecutionKey, IntentOutcome, Job};

// Re-export the mailbox
pub use mailbox::Mailbox;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
