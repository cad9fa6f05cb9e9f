//! The host: per-key runners driving the compute → effect → re-compute
//! cycle.
//!
//! ```text
//! submit(key, intent) ─► Mailbox(key) ─► Runner(key) ─► compute()
//!                              ▲               │
//!                              │               ├─ Complete/Error ─► publish + reply
//!                              │               │
//!                              │               └─ Pending ─► dispatch effects
//!                              │                                  │ (off-mailbox)
//!                              └───────── FulfillEffect ◄─────────┘
//! ```
//!
//! # Key Invariants
//!
//! 1. **One runner per key** - jobs for a key are handled strictly serially
//! 2. **Frozen context per job** - `{now, random_seed}` is reset at the start
//!    of each job and observed unchanged within it
//! 3. **Apply before dispatch** - compute's patches land on the canonical
//!    snapshot before any effect dispatch; the dispatch list is read from the
//!    post-apply snapshot
//! 4. **Publish boundary** - observers see at most one publish per intent,
//!    at its terminal transition
//! 5. **Intent-granularity single-writer** - a `StartIntent` arriving while
//!    another intent is mid-execution parks until the current one resolves

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mel_core::{
    apply_external_patches, compute, genesis, ComputeOptions, ComputeStatus, ErrorCode,
    ErrorValue, HostContext, Intent, Patch, Reentry, Requirement, RequirementId, Schema, Snapshot,
    SystemStatus,
};

use crate::effects::{EffectContext, EffectHandler, EffectOptions, EffectRegistry};
use crate::job::{EffectOutcome, ExecutionKey, IntentOutcome, Job};
use crate::mailbox::Mailbox;
use crate::HostError;

/// Publish-boundary capacity; slow subscribers may lag.
const PUBLISH_CAPACITY: usize = 1024;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Default intent deadline applied when a submission has none.
    pub default_timeout_ms: Option<u64>,
    /// Bound on continue/compute iterations per intent.
    pub max_iterations: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            default_timeout_ms: None,
            max_iterations: 128,
        }
    }
}

/// Developer tooling toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevtoolsOptions {
    /// Collect a trace for every compute pass.
    pub trace_enabled: bool,
}

/// Host construction options.
#[derive(Debug, Clone, Default)]
pub struct HostOptions {
    /// Initial data for genesis snapshots.
    pub initial_data: Option<Value>,
    /// Scheduler tuning.
    pub scheduler: SchedulerOptions,
    /// Developer tooling.
    pub devtools: DevtoolsOptions,
    /// Fixed seed base for deterministic frozen contexts (tests). When
    /// unset, seeds are drawn from thread-local entropy.
    pub seed: Option<u64>,
}

/// Per-submission options.
#[derive(Debug, Default)]
pub struct SubmitOptions {
    /// External cancellation signal for the intent.
    pub cancel: Option<CancellationToken>,
    /// Intent-level deadline.
    pub timeout_ms: Option<u64>,
}

/// Terminal-snapshot notification (the publish boundary).
#[derive(Debug, Clone)]
pub struct SnapshotPublished {
    /// Execution key the intent ran on.
    pub key: ExecutionKey,
    /// The intent that reached a terminal state.
    pub intent_id: String,
    /// True when the intent completed without a terminal error.
    pub completed: bool,
    /// The terminal snapshot.
    pub snapshot: Arc<Snapshot>,
}

/// In-flight execution state for one intent.
struct IntentRun {
    intent: Intent,
    snapshot: Snapshot,
    iteration: u32,
    reentry: Reentry,
    dispatched: BTreeSet<RequirementId>,
    cancel: CancellationToken,
    deadline: Option<tokio::time::Instant>,
    reply: Option<oneshot::Sender<IntentOutcome>>,
}

/// Runner-owned state for one key. Touched only by the key's runner.
#[derive(Default)]
struct KeyExec {
    canonical: Option<Snapshot>,
    current: Option<IntentRun>,
    parked: VecDeque<Job>,
}

struct KeyState {
    mailbox: Mailbox,
    exec: Mutex<KeyExec>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            mailbox: Mailbox::new(),
            exec: Mutex::new(KeyExec::default()),
        }
    }

    fn exec(&self) -> MutexGuard<'_, KeyExec> {
        match self.exec.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Builder for a [`Host`].
pub struct HostBuilder {
    schema: Arc<Schema>,
    registry: EffectRegistry,
    options: HostOptions,
}

impl HostBuilder {
    /// Start a builder for the given schema.
    pub fn new(schema: Schema) -> Self {
        Self::from_arc(Arc::new(schema))
    }

    /// Start a builder from a shared schema.
    pub fn from_arc(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            registry: EffectRegistry::new(),
            options: HostOptions::default(),
        }
    }

    /// Set host options.
    pub fn with_options(mut self, options: HostOptions) -> Self {
        self.options = options;
        self
    }

    /// Register an effect handler with default options.
    ///
    /// # Panics
    ///
    /// Panics on duplicate or reserved registration; use
    /// [`HostBuilder::try_with_effect`] for the non-panicking version.
    pub fn with_effect(self, effect_type: &str, handler: Arc<dyn EffectHandler>) -> Self {
        self.try_with_effect(effect_type, handler, EffectOptions::default())
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Register an effect handler, returning an error on duplicate or
    /// reserved registration.
    pub fn try_with_effect(
        self,
        effect_type: &str,
        handler: Arc<dyn EffectHandler>,
        options: EffectOptions,
    ) -> Result<Self, HostError> {
        self.registry.register(effect_type, handler, options)?;
        Ok(self)
    }

    /// Finish construction.
    pub fn build(self) -> Host {
        let (publisher, _) = broadcast::channel(PUBLISH_CAPACITY);
        info!(schema_id = %self.schema.id(), hash = %self.schema.hash().short(), "host built");
        Host {
            inner: Arc::new(HostInner {
                schema: self.schema,
                registry: Arc::new(self.registry),
                keys: DashMap::new(),
                options: self.options,
                publisher,
                seed_counter: AtomicU64::new(0),
            }),
        }
    }
}

/// The host loop: mailboxes, runners, effect execution, publish boundary.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Start a builder.
    pub fn builder(schema: Schema) -> HostBuilder {
        HostBuilder::new(schema)
    }

    /// The schema this host executes.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Subscribe to the terminal publish boundary.
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotPublished> {
        self.inner.publisher.subscribe()
    }

    /// Submit an intent on a key and await its terminal outcome.
    pub async fn submit(
        &self,
        key: ExecutionKey,
        intent: Intent,
        base: Option<Snapshot>,
        opts: SubmitOptions,
    ) -> Result<IntentOutcome, HostError> {
        let (tx, rx) = oneshot::channel();
        let cancel = opts.cancel.unwrap_or_default();
        let deadline = opts
            .timeout_ms
            .or(self.inner.options.scheduler.default_timeout_ms)
            .map(Duration::from_millis);
        self.inner.enqueue(
            &key,
            Job::StartIntent {
                intent,
                base,
                reply: Some(tx),
                cancel,
                deadline,
            },
        );
        rx.await.map_err(|_| HostError::ChannelClosed)
    }

    /// Apply host-owned patches to a key's canonical data, outside any
    /// intent evaluation.
    pub async fn apply_patches(
        &self,
        key: ExecutionKey,
        patches: Vec<Patch>,
        source: impl Into<String>,
    ) -> Result<(), HostError> {
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(
            &key,
            Job::ApplyPatches {
                patches,
                source: source.into(),
                reply: Some(tx),
            },
        );
        rx.await.map_err(|_| HostError::ChannelClosed)?
    }

    /// The key's canonical snapshot, if one exists yet.
    pub fn snapshot(&self, key: &ExecutionKey) -> Option<Snapshot> {
        let state = self.inner.keys.get(key)?;
        let snapshot = state.exec().canonical.clone();
        snapshot
    }
}

struct HostInner {
    schema: Arc<Schema>,
    registry: Arc<EffectRegistry>,
    keys: DashMap<ExecutionKey, Arc<KeyState>>,
    options: HostOptions,
    publisher: broadcast::Sender<SnapshotPublished>,
    seed_counter: AtomicU64,
}

impl HostInner {
    fn key_state(&self, key: &ExecutionKey) -> Arc<KeyState> {
        self.keys
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyState::new()))
            .clone()
    }

    fn enqueue(self: &Arc<Self>, key: &ExecutionKey, job: Job) {
        let state = self.key_state(key);
        if state.mailbox.enqueue_and_kick(job) {
            let inner = self.clone();
            let key = key.clone();
            let state = state.clone();
            tokio::spawn(async move {
                run_key(inner, key, state);
            });
        }
    }

    /// Freeze `{now, random_seed}` for one job.
    fn freeze(&self) -> HostContext {
        let seed = match self.options.seed {
            Some(base) => base.wrapping_add(self.seed_counter.fetch_add(1, Ordering::Relaxed)),
            None => fastrand::u64(..),
        };
        HostContext::new(Utc::now(), seed)
    }

    fn handle_job(self: &Arc<Self>, key: &ExecutionKey, state: &Arc<KeyState>, job: Job) {
        debug!(key = %key, kind = job.kind(), "handling job");
        match job {
            Job::StartIntent {
                intent,
                base,
                reply,
                cancel,
                deadline,
            } => self.handle_start(key, state, intent, base, reply, cancel, deadline),
            Job::ContinueCompute {
                intent_id,
                iteration,
            } => self.handle_continue(key, state, &intent_id, iteration),
            Job::FulfillEffect {
                intent_id,
                requirement_id,
                outcome,
            } => self.handle_fulfill(key, state, &intent_id, requirement_id, outcome),
            Job::ApplyPatches {
                patches,
                source,
                reply,
            } => self.handle_apply(key, state, patches, &source, reply),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_start(
        self: &Arc<Self>,
        key: &ExecutionKey,
        state: &Arc<KeyState>,
        intent: Intent,
        base: Option<Snapshot>,
        reply: Option<oneshot::Sender<IntentOutcome>>,
        cancel: CancellationToken,
        deadline: Option<Duration>,
    ) {
        let mut exec = state.exec();
        if exec.current.is_some() {
            // Another intent owns the key; park until it resolves.
            debug!(key = %key, intent_id = %intent.intent_id, "parking intent");
            exec.parked.push_back(Job::StartIntent {
                intent,
                base,
                reply,
                cancel,
                deadline,
            });
            return;
        }

        let frozen = self.freeze();
        let base = match base.or_else(|| exec.canonical.clone()) {
            Some(snapshot) => snapshot,
            None => match genesis(&self.schema, self.options.initial_data.clone(), &frozen) {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(key = %key, error = %error, "genesis failed");
                    if let Some(reply) = reply {
                        let _ = reply.send(IntentOutcome::Failed {
                            snapshot: None,
                            error,
                        });
                    }
                    return;
                }
            },
        };

        if cancel.is_cancelled() {
            if let Some(reply) = reply {
                let _ = reply.send(IntentOutcome::Failed {
                    snapshot: None,
                    error: ErrorValue::new(
                        ErrorCode::Cancelled,
                        "intent cancelled before execution",
                        frozen.now,
                    ),
                });
            }
            return;
        }

        let deadline_at = deadline.map(|d| tokio::time::Instant::now() + d);
        if let Some(duration) = deadline {
            // Watchdog: force a scheduling point when the deadline passes so
            // an intent stuck on a hung effect still resolves.
            let token = cancel.clone();
            let inner = self.clone();
            let key = key.clone();
            let intent_id = intent.intent_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if !token.is_cancelled() {
                    token.cancel();
                    inner.enqueue(
                        &key,
                        Job::ContinueCompute {
                            intent_id,
                            iteration: 0,
                        },
                    );
                }
            });
        }

        exec.current = Some(IntentRun {
            intent,
            snapshot: base,
            iteration: 0,
            reentry: Reentry::initial(),
            dispatched: BTreeSet::new(),
            cancel,
            deadline: deadline_at,
            reply,
        });
        self.run_pass(key, state, &mut exec, frozen);
    }

    fn handle_continue(
        self: &Arc<Self>,
        key: &ExecutionKey,
        state: &Arc<KeyState>,
        intent_id: &str,
        iteration: u32,
    ) {
        let mut exec = state.exec();
        let frozen = self.freeze();
        {
            let Some(run) = exec.current.as_mut() else {
                return; // Stale continuation for a finished intent.
            };
            if run.intent.intent_id != intent_id {
                return;
            }
            run.iteration = run.iteration.max(iteration);
            if run.iteration > self.options.scheduler.max_iterations {
                let error = ErrorValue::new(
                    ErrorCode::LoopMaxIterations,
                    format!(
                        "intent exceeded {} compute iterations",
                        self.options.scheduler.max_iterations
                    ),
                    frozen.now,
                );
                let snapshot = error_snapshot(&run.snapshot, error.clone(), &frozen);
                self.finalize(
                    key,
                    state,
                    &mut exec,
                    IntentOutcome::Failed {
                        snapshot: Some(snapshot),
                        error,
                    },
                );
                return;
            }
        }
        self.run_pass(key, state, &mut exec, frozen);
    }

    fn handle_fulfill(
        self: &Arc<Self>,
        key: &ExecutionKey,
        state: &Arc<KeyState>,
        intent_id: &str,
        requirement_id: RequirementId,
        outcome: EffectOutcome,
    ) {
        let mut exec = state.exec();
        let frozen = self.freeze();
        let next_iteration;
        {
            let Some(run) = exec.current.as_mut() else {
                debug!(key = %key, "discarding late effect result");
                return;
            };
            if run.intent.intent_id != intent_id {
                debug!(key = %key, "discarding effect result for a different intent");
                return;
            }
            let known = run
                .snapshot
                .system
                .pending_requirements
                .iter()
                .any(|r| r.id == requirement_id);
            if !known {
                debug!(key = %key, requirement_id = %requirement_id, "duplicate fulfillment ignored");
                return;
            }

            match outcome {
                EffectOutcome::Patches(patches) => {
                    match apply_external_patches(&self.schema, &run.snapshot, &patches, &frozen) {
                        Ok(next) => run.snapshot = next,
                        Err(err) => {
                            // Injection failed: record it and continue with an
                            // empty injection so guards can branch.
                            let error = ErrorValue::new(
                                err.code(),
                                format!("effect result rejected: {err}"),
                                frozen.now,
                            );
                            record_system_error(&mut run.snapshot, error, &frozen);
                        }
                    }
                }
                EffectOutcome::Failed(error) => {
                    record_system_error(&mut run.snapshot, error, &frozen);
                }
            }

            run.snapshot
                .system
                .pending_requirements
                .retain(|r| r.id != requirement_id);
            run.reentry.fulfilled.insert(requirement_id);
            next_iteration = run.iteration + 1;
        }
        drop(exec);
        self.enqueue(
            key,
            Job::ContinueCompute {
                intent_id: intent_id.to_string(),
                iteration: next_iteration,
            },
        );
    }

    fn handle_apply(
        self: &Arc<Self>,
        key: &ExecutionKey,
        state: &Arc<KeyState>,
        patches: Vec<Patch>,
        source: &str,
        reply: Option<oneshot::Sender<Result<(), HostError>>>,
    ) {
        let mut exec = state.exec();
        let frozen = self.freeze();
        debug!(key = %key, source, count = patches.len(), "applying host patches");

        let result = if let Some(run) = exec.current.as_mut() {
            apply_external_patches(&self.schema, &run.snapshot, &patches, &frozen)
                .map(|next| run.snapshot = next)
        } else {
            let base = match exec.canonical.clone() {
                Some(snapshot) => Ok(snapshot),
                None => genesis(&self.schema, self.options.initial_data.clone(), &frozen)
                    .map_err(|error| {
                        // Surface as a patch-level path failure is wrong here;
                        // report genesis failure directly.
                        HostError::Genesis { error }
                    }),
            };
            match base {
                Ok(base) => apply_external_patches(&self.schema, &base, &patches, &frozen)
                    .map(|next| exec.canonical = Some(next)),
                Err(err) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(err));
                    }
                    return;
                }
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(result.map_err(HostError::from));
        }
    }

    /// One compute pass over the current intent, plus effect dispatch.
    fn run_pass(
        self: &Arc<Self>,
        key: &ExecutionKey,
        state: &Arc<KeyState>,
        exec: &mut KeyExec,
        frozen: HostContext,
    ) {
        let Some(run) = exec.current.as_mut() else {
            return;
        };

        if run.cancel.is_cancelled() || deadline_passed(run.deadline) {
            let error = ErrorValue::new(ErrorCode::Cancelled, "intent cancelled", frozen.now);
            let snapshot = error_snapshot(&run.snapshot, error.clone(), &frozen);
            self.finalize(
                key,
                state,
                exec,
                IntentOutcome::Failed {
                    snapshot: Some(snapshot),
                    error,
                },
            );
            return;
        }

        let result = compute(
            &self.schema,
            &run.snapshot,
            &run.intent,
            &frozen,
            &run.reentry,
            ComputeOptions {
                trace_enabled: self.options.devtools.trace_enabled,
            },
        );

        match result.status {
            ComputeStatus::Complete => {
                self.finalize(
                    key,
                    state,
                    exec,
                    IntentOutcome::Completed {
                        snapshot: result.snapshot,
                    },
                );
            }
            ComputeStatus::Error => {
                let error = result
                    .snapshot
                    .system
                    .last_error
                    .clone()
                    .unwrap_or_else(|| {
                        ErrorValue::new(ErrorCode::Internal, "compute failed", frozen.now)
                    });
                self.finalize(
                    key,
                    state,
                    exec,
                    IntentOutcome::Failed {
                        snapshot: Some(result.snapshot),
                        error,
                    },
                );
            }
            ComputeStatus::Pending => {
                // Apply before dispatch: the canonical snapshot is updated
                // first; the dispatch list is read from the post-apply
                // snapshot.
                run.snapshot = result.snapshot;
                run.reentry.resume_after = result.suspended_at;

                let to_dispatch: Vec<Requirement> = run
                    .snapshot
                    .system
                    .pending_requirements
                    .iter()
                    .filter(|r| !run.dispatched.contains(&r.id))
                    .cloned()
                    .collect();

                // Every new requirement needs a handler before anything is
                // dispatched; a missing one fails the intent outright.
                let missing = to_dispatch
                    .iter()
                    .find(|r| !self.registry.contains(&r.effect_type))
                    .map(|r| r.effect_type.clone());
                if let Some(effect_type) = missing {
                    let error = ErrorValue::new(
                        ErrorCode::UnknownEffect,
                        format!("no handler for effect '{effect_type}'"),
                        frozen.now,
                    );
                    let snapshot = error_snapshot(&run.snapshot, error.clone(), &frozen);
                    self.finalize(
                        key,
                        state,
                        exec,
                        IntentOutcome::Failed {
                            snapshot: Some(snapshot),
                            error,
                        },
                    );
                    return;
                }

                if to_dispatch.is_empty() {
                    if run.snapshot.system.pending_requirements.is_empty() {
                        // Pending with nothing outstanding: keep computing.
                        let intent_id = run.intent.intent_id.clone();
                        let iteration = run.iteration + 1;
                        self.enqueue(key, Job::ContinueCompute { intent_id, iteration });
                    }
                    return;
                }

                for requirement in to_dispatch {
                    run.dispatched.insert(requirement.id.clone());
                    self.dispatch_effect(key, run, requirement);
                }
            }
        }
    }

    /// Dispatch one requirement off-mailbox; its result re-enters as a
    /// `FulfillEffect` job.
    fn dispatch_effect(self: &Arc<Self>, key: &ExecutionKey, run: &IntentRun, requirement: Requirement) {
        let ctx = EffectContext {
            snapshot: Arc::new(run.snapshot.clone()),
            cancel: run.cancel.clone(),
        };
        let inner = self.clone();
        let key = key.clone();
        let intent_id = run.intent.intent_id.clone();
        debug!(
            key = %key,
            effect_type = %requirement.effect_type,
            requirement_id = %requirement.id,
            "dispatching effect"
        );
        tokio::spawn(async move {
            let outcome = inner
                .registry
                .execute(&requirement, ctx)
                .await
                .unwrap_or_else(|| {
                    EffectOutcome::Failed(ErrorValue::new(
                        ErrorCode::UnknownEffect,
                        format!("no handler for effect '{}'", requirement.effect_type),
                        Utc::now(),
                    ))
                });
            inner.enqueue(
                &key,
                Job::FulfillEffect {
                    intent_id,
                    requirement_id: requirement.id,
                    outcome,
                },
            );
        });
    }

    /// Terminal transition: set the canonical snapshot, publish once, reply,
    /// and un-park any deferred intents.
    fn finalize(
        self: &Arc<Self>,
        key: &ExecutionKey,
        state: &Arc<KeyState>,
        exec: &mut KeyExec,
        outcome: IntentOutcome,
    ) {
        let Some(run) = exec.current.take() else {
            return;
        };
        if let Some(snapshot) = outcome.snapshot() {
            exec.canonical = Some(snapshot.clone());
            let _ = self.publisher.send(SnapshotPublished {
                key: key.clone(),
                intent_id: run.intent.intent_id.clone(),
                completed: outcome.is_completed(),
                snapshot: Arc::new(snapshot.clone()),
            });
        }
        info!(
            key = %key,
            intent_id = %run.intent.intent_id,
            completed = outcome.is_completed(),
            "intent terminal"
        );
        if let Some(reply) = run.reply {
            let _ = reply.send(outcome);
        }
        if !exec.parked.is_empty() {
            state
                .mailbox
                .requeue_front(std::mem::take(&mut exec.parked));
        }
    }
}

/// Runner loop: drain, release, re-check.
fn run_key(inner: Arc<HostInner>, key: ExecutionKey, state: Arc<KeyState>) {
    loop {
        state.mailbox.begin_drain();
        while let Some(job) = state.mailbox.pop() {
            inner.handle_job(&key, &state, job);
        }
        if !state.mailbox.release() {
            break;
        }
    }
}

fn deadline_passed(deadline: Option<tokio::time::Instant>) -> bool {
    deadline.is_some_and(|at| tokio::time::Instant::now() >= at)
}

/// A terminal snapshot carrying a host-produced error.
fn error_snapshot(snapshot: &Snapshot, error: ErrorValue, frozen: &HostContext) -> Snapshot {
    let mut next = snapshot.clone();
    next.system.status = SystemStatus::Error;
    next.system.last_error = Some(error.clone());
    next.system.errors.push(error);
    next.system.pending_requirements.clear();
    next.system.current_action = None;
    next.input = Value::Null;
    next.meta = snapshot.next_meta(frozen.now, frozen.random_seed);
    next
}

/// Record a non-terminal error on a run's working snapshot.
fn record_system_error(snapshot: &mut Snapshot, error: ErrorValue, frozen: &HostContext) {
    snapshot.system.last_error = Some(error.clone());
    snapshot.system.errors.push(error);
    snapshot.meta = snapshot.next_meta(frozen.now, frozen.random_seed);
}
