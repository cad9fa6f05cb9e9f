//! The pure compute function.
//!
//! `compute` is the kernel's only entry point for state transitions: it maps
//! `(schema, snapshot, intent, host context)` to a new snapshot plus effect
//! requirements and an optional trace. It is a total function (every
//! failure path returns a value) and it is deterministic: identical inputs
//! (including the frozen `now` and `random_seed`) produce byte-identical
//! canonical snapshots, identical requirement ids, and identical trace ids.
//!
//! Suspension is not a language feature here. A flow that reaches an
//! `effect` node returns `Pending` plus a requirement; the host injects the
//! result and calls `compute` again with the continuation it kept
//! out-of-band. Nothing host-internal is ever written into `data`.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ErrorCode, ErrorValue, PatchError};
use crate::expr::{eval, EvalEnv};
use crate::flow::{run_flow, FlowInputs, FlowOutcome};
use crate::intent::{Intent, NodePath, Reentry, Requirement, RequirementId};
use crate::patch::{apply_patches, changed_paths, Patch, UnsetMode};
use crate::schema::{FieldSpec, Schema};
use crate::snapshot::{Snapshot, SnapshotMeta, SystemState, SystemStatus};
use crate::trace::{TraceBuilder, TraceGraph};
use crate::value::{self, Lookup, Path};

/// Host-frozen context for one compute pass.
#[derive(Debug, Clone)]
pub struct HostContext {
    /// Frozen time; the kernel never reads a wall clock.
    pub now: DateTime<Utc>,
    /// Frozen seed for the deterministic `uuid` expression.
    pub random_seed: u64,
    /// Optional host environment values (opaque to the kernel).
    pub env: Option<Map<String, Value>>,
}

impl HostContext {
    /// Context with no environment.
    pub fn new(now: DateTime<Utc>, random_seed: u64) -> Self {
        Self {
            now,
            random_seed,
            env: None,
        }
    }
}

/// Evaluation toggles.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeOptions {
    /// Collect a [`TraceGraph`] for this pass.
    pub trace_enabled: bool,
}

/// Terminal classification of a compute pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    /// The flow ran to completion.
    Complete,
    /// The flow suspended on an effect requirement.
    Pending,
    /// The flow terminated with an error.
    Error,
}

/// Everything a compute pass produced.
#[derive(Debug)]
pub struct ComputeResult {
    /// Terminal classification.
    pub status: ComputeStatus,
    /// The successor snapshot.
    pub snapshot: Snapshot,
    /// Requirements newly emitted by this pass.
    pub requirements: Vec<Requirement>,
    /// Suspension point, when `status == Pending`.
    pub suspended_at: Option<NodePath>,
    /// Collected trace, when enabled.
    pub trace: Option<TraceGraph>,
}

/// Run one compute pass.
pub fn compute(
    schema: &Schema,
    snapshot: &Snapshot,
    intent: &Intent,
    host: &HostContext,
    reentry: &Reentry,
    options: ComputeOptions,
) -> ComputeResult {
    let mut trace = TraceBuilder::new(options.trace_enabled);

    let Some(action) = schema.action(&intent.intent_type) else {
        let error = ErrorValue::new(
            ErrorCode::UnknownAction,
            format!("unknown action '{}'", intent.intent_type),
            host.now,
        );
        return error_result(snapshot, error, host, trace);
    };

    if let Some(spec) = &action.input {
        if let Err(error) = validate_input(spec, &intent.input, host.now) {
            return error_result(snapshot, error, host, trace);
        }
    }

    let pending_ids: BTreeSet<RequirementId> = snapshot
        .system
        .pending_requirements
        .iter()
        .map(|r| r.id.clone())
        .collect();

    let flow = run_flow(
        FlowInputs {
            schema,
            action_id: &intent.intent_type,
            flow: &action.flow,
            data: snapshot.data.clone(),
            input: intent.input.clone(),
            computed: snapshot.computed_view(),
            system: snapshot.system_view(),
            intent_id: &intent.intent_id,
            now: host.now,
            random_seed: host.random_seed,
            reentry,
            pending: &pending_ids,
        },
        &mut trace,
    );

    // Recompute affected computed fields against the terminal data.
    let changed = changed_paths(&snapshot.data, &flow.data);
    let affected = schema.computed_graph().affected(&changed);
    let mut computed = snapshot.computed.clone();
    let mut errors = flow.errors;
    errors.extend(recompute_fields(
        schema,
        &flow.data,
        &affected,
        &mut computed,
        &intent.input,
        &snapshot.system_view(),
        &intent.intent_id,
        host,
        &mut trace,
    ));

    // Requirements still outstanding from earlier passes.
    let carried: Vec<Requirement> = snapshot
        .system
        .pending_requirements
        .iter()
        .filter(|r| !reentry.fulfilled.contains(&r.id))
        .cloned()
        .collect();

    let (status, system, input, suspended_at) = match flow.outcome {
        FlowOutcome::Completed => {
            let mut all_errors = snapshot.system.errors.clone();
            all_errors.extend(errors.iter().cloned());
            let system = SystemState {
                status: SystemStatus::Idle,
                last_error: errors.last().cloned().or(snapshot.system.last_error.clone()),
                errors: all_errors,
                pending_requirements: Vec::new(),
                current_action: None,
            };
            (ComputeStatus::Complete, system, Value::Null, None)
        }
        FlowOutcome::Suspended { at } => {
            let mut pending = carried;
            pending.extend(flow.requirements.iter().cloned());
            let mut all_errors = snapshot.system.errors.clone();
            all_errors.extend(errors.iter().cloned());
            let system = SystemState {
                status: SystemStatus::Pending,
                last_error: errors.last().cloned().or(snapshot.system.last_error.clone()),
                errors: all_errors,
                pending_requirements: pending,
                current_action: Some(intent.intent_type.clone()),
            };
            (
                ComputeStatus::Pending,
                system,
                intent.input.clone(),
                Some(at),
            )
        }
        FlowOutcome::Failed { error } => {
            let mut all_errors = snapshot.system.errors.clone();
            all_errors.extend(errors.iter().cloned());
            all_errors.push(error.clone());
            let system = SystemState {
                status: SystemStatus::Error,
                last_error: Some(error),
                errors: all_errors,
                pending_requirements: Vec::new(),
                current_action: None,
            };
            (ComputeStatus::Error, system, Value::Null, None)
        }
    };

    debug!(
        action = %intent.intent_type,
        intent_id = %intent.intent_id,
        status = ?status,
        new_requirements = flow.requirements.len(),
        "compute pass finished"
    );

    ComputeResult {
        status,
        snapshot: Snapshot {
            data: flow.data,
            computed,
            system,
            input,
            meta: snapshot.next_meta(host.now, host.random_seed),
        },
        requirements: flow.requirements,
        suspended_at,
        trace: if options.trace_enabled {
            Some(trace.finish())
        } else {
            None
        },
    }
}

/// Build the genesis snapshot for a schema.
///
/// Applies field defaults, enforces required fields and declared types, and
/// evaluates every computed field in topological order.
pub fn genesis(
    schema: &Schema,
    initial_data: Option<Value>,
    host: &HostContext,
) -> Result<Snapshot, ErrorValue> {
    let mut data = match initial_data {
        None => Value::Object(Map::new()),
        Some(value @ Value::Object(_)) => value,
        Some(other) => {
            return Err(ErrorValue::new(
                ErrorCode::InvalidInput,
                format!("initial data must be an object, got {other}"),
                host.now,
            ))
        }
    };

    for (field, spec) in schema.state_fields() {
        let path = Path::parse(field);
        apply_field(&mut data, field, &path, spec, host.now)?;
    }

    let mut computed = BTreeMap::new();
    let all: Vec<String> = schema.computed_graph().order().to_vec();
    let mut trace = TraceBuilder::new(false);
    let errors = recompute_fields(
        schema,
        &data,
        &all,
        &mut computed,
        &Value::Null,
        &Value::Null,
        "",
        host,
        &mut trace,
    );

    let mut system = SystemState::idle();
    system.last_error = errors.last().cloned();
    system.errors = errors;

    Ok(Snapshot {
        data,
        computed,
        system,
        input: Value::Null,
        meta: SnapshotMeta {
            version: 1,
            timestamp: host.now,
            random_seed: host.random_seed,
            schema_hash: schema.hash().clone(),
        },
    })
}

/// Apply host-injected patches (effect results, host-owned writes) to a
/// snapshot.
///
/// Patches apply to `data` atomically, affected computed fields are
/// re-evaluated, and the version is bumped. The system block and input are
/// carried over unchanged; pending-requirement bookkeeping belongs to the
/// caller.
pub fn apply_external_patches(
    schema: &Schema,
    snapshot: &Snapshot,
    patches: &[Patch],
    host: &HostContext,
) -> Result<Snapshot, PatchError> {
    let data = apply_patches(&snapshot.data, patches, UnsetMode::Lenient)?;
    let changed = changed_paths(&snapshot.data, &data);
    let affected = schema.computed_graph().affected(&changed);

    let mut computed = snapshot.computed.clone();
    let mut trace = TraceBuilder::new(false);
    let errors = recompute_fields(
        schema,
        &data,
        &affected,
        &mut computed,
        &snapshot.input,
        &snapshot.system_view(),
        "",
        host,
        &mut trace,
    );

    let mut system = snapshot.system.clone();
    if let Some(last) = errors.last() {
        system.last_error = Some(last.clone());
    }
    system.errors.extend(errors);

    Ok(Snapshot {
        data,
        computed,
        system,
        input: snapshot.input.clone(),
        meta: snapshot.next_meta(host.now, host.random_seed),
    })
}

fn apply_field(
    data: &mut Value,
    field: &str,
    path: &Path,
    spec: &FieldSpec,
    now: DateTime<Utc>,
) -> Result<(), ErrorValue> {
    match value::lookup(data, path) {
        Lookup::Found(existing) => {
            if !existing.is_null() && !spec.field_type.accepts(existing) {
                return Err(ErrorValue::new(
                    ErrorCode::TypeMismatch,
                    format!("state field '{field}' does not match its declared type"),
                    now,
                ));
            }
            Ok(())
        }
        Lookup::Missing => {
            if let Some(default) = &spec.default {
                value::write(data, path, default.clone()).map_err(|_| {
                    ErrorValue::new(
                        ErrorCode::ValidationError,
                        format!("cannot apply default for state field '{field}'"),
                        now,
                    )
                })?;
                Ok(())
            } else if spec.required {
                Err(ErrorValue::new(
                    ErrorCode::ValidationError,
                    format!("required state field '{field}' is missing"),
                    now,
                ))
            } else {
                Ok(())
            }
        }
        Lookup::Blocked | Lookup::OutOfBounds => Err(ErrorValue::new(
            ErrorCode::ValidationError,
            format!("state field path '{field}' is not reachable in the initial data"),
            now,
        )),
    }
}

fn validate_input(
    spec: &BTreeMap<String, FieldSpec>,
    input: &Value,
    now: DateTime<Utc>,
) -> Result<(), ErrorValue> {
    let object = match input {
        Value::Object(map) => map,
        Value::Null if spec.values().all(|f| !f.required) => return Ok(()),
        other => {
            return Err(ErrorValue::new(
                ErrorCode::InvalidInput,
                format!("action input must be an object, got {other}"),
                now,
            ))
        }
    };
    for (name, field) in spec {
        match object.get(name) {
            Some(value) => {
                if !value.is_null() && !field.field_type.accepts(value) {
                    return Err(ErrorValue::new(
                        ErrorCode::InvalidInput,
                        format!("input field '{name}' does not match its declared type"),
                        now,
                    ));
                }
                if value.is_null() && field.required {
                    return Err(ErrorValue::new(
                        ErrorCode::InvalidInput,
                        format!("input field '{name}' is required"),
                        now,
                    ));
                }
            }
            None => {
                if field.required {
                    return Err(ErrorValue::new(
                        ErrorCode::InvalidInput,
                        format!("input field '{name}' is required"),
                        now,
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Re-evaluate the named computed fields in order, accumulating results.
///
/// A field whose expression errors is set to null and the error recorded;
/// recomputation continues.
#[allow(clippy::too_many_arguments)]
fn recompute_fields(
    schema: &Schema,
    data: &Value,
    names: &[String],
    computed: &mut BTreeMap<String, Value>,
    input: &Value,
    system: &Value,
    intent_id: &str,
    host: &HostContext,
    trace: &mut TraceBuilder,
) -> Vec<ErrorValue> {
    let mut errors = Vec::new();
    let mut rng = fastrand::Rng::with_seed(host.random_seed);
    for name in names {
        let Some(spec) = schema.computed_fields().get(name) else {
            continue;
        };
        let view = Value::Object(
            computed
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let mut env = EvalEnv::new(
            data, input, &view, system, intent_id, host.now, &mut rng, trace,
        );
        match eval(&spec.expr, &mut env) {
            Ok(value) => {
                computed.insert(name.clone(), value);
            }
            Err(error) => {
                computed.insert(name.clone(), Value::Null);
                errors.push(error.with_source(format!("computed.{name}"), ""));
            }
        }
    }
    errors
}

fn error_result(
    snapshot: &Snapshot,
    error: ErrorValue,
    host: &HostContext,
    trace: TraceBuilder,
) -> ComputeResult {
    let mut errors = snapshot.system.errors.clone();
    errors.push(error.clone());
    let enabled = trace.enabled();
    ComputeResult {
        status: ComputeStatus::Error,
        snapshot: Snapshot {
            data: snapshot.data.clone(),
            computed: snapshot.computed.clone(),
            system: SystemState {
                status: SystemStatus::Error,
                last_error: Some(error),
                errors,
                pending_requirements: Vec::new(),
                current_action: None,
            },
            input: Value::Null,
            meta: snapshot.next_meta(host.now, host.random_seed),
        },
        requirements: Vec::new(),
        suspended_at: None,
        trace: if enabled { Some(trace.finish()) } else { None },
    }
}
