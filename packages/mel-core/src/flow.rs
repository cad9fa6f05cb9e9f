//! Flow IR and the flow walker.
//!
//! A flow is a tree of declarative steps. The walker executes it strictly
//! top-to-bottom against a working copy of the snapshot data: patches apply
//! immediately (later steps observe them), `effect` suspends the pass at its
//! node path, `halt` completes, `fail` terminates with an error value.
//!
//! # Re-entry
//!
//! A suspended flow is resumed by running the walker again with the
//! [`Reentry`] continuation the host kept out-of-band. The walker
//! fast-forwards structurally: every node at or before the recorded
//! suspension point in document order is skipped without side effects
//! (conditions are not re-evaluated; the branch taken is recovered from the
//! suspension path), and execution continues with the first node after it.
//! An effect node whose requirement id has been fulfilled is a completed
//! no-op; one whose requirement is still outstanding suspends again without
//! re-emitting.
//!
//! # Guards
//!
//! `once` is the compiled form of the once-guard: it skips its body when a
//! marker for the current intent id exists under `data.$mel.guards.intent`,
//! and otherwise writes that marker as the first patch of the guarded block.
//! `when` guards are plain `if` nodes.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ErrorValue};
use crate::expr::{eval, EvalEnv, Expr};
use crate::intent::{requirement_id, NodePath, Reentry, Requirement, RequirementId};
use crate::patch::{apply_patches, Patch, UnsetMode};
use crate::schema::Schema;
use crate::trace::TraceBuilder;
use crate::value::{self, Lookup, Path};

/// Patch operation kind carried by a `patch` flow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Write a value.
    Set,
    /// Remove a value.
    Unset,
    /// Deep-merge an object.
    Merge,
}

/// The flow IR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "camelCase")]
pub enum FlowNode {
    /// Execute steps in order until a non-successful terminator.
    Seq {
        /// Child steps; child `i` has node-path index `i`.
        steps: Vec<FlowNode>,
    },
    /// Conditional branch. `then` is child 0, `otherwise` child 1.
    If {
        /// Boolean condition. An evaluation error skips the node entirely
        /// (recorded, not terminal).
        cond: Expr,
        /// Branch taken when the condition holds.
        then: Box<FlowNode>,
        /// Branch taken otherwise.
        #[serde(skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<FlowNode>>,
    },
    /// Evaluate a value and apply a patch to the working data immediately.
    Patch {
        /// Operation kind.
        op: PatchOp,
        /// Data-relative target path.
        path: Path,
        /// Value expression; required for `set` and `merge`.
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
    },
    /// Resolve params, record a requirement, and suspend the pass here.
    Effect {
        /// Registered effect type.
        effect_type: String,
        /// Parameter expressions, resolved against the working snapshot.
        params: BTreeMap<String, Expr>,
    },
    /// Inline the flow of another action (child 0).
    Call {
        /// Callee action name. The call graph is acyclic by schema contract.
        action: String,
    },
    /// End the flow successfully.
    Halt {
        /// Optional reason, recorded in the trace only.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Record an error value and terminate the flow with `Error`.
    Fail {
        /// Error code wire name (unknown names map to `INTERNAL`).
        code: String,
        /// Optional message expression.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Expr>,
    },
    /// Compiled once-guard: body runs at most once per intent id.
    Once {
        /// Guarded steps; child `i` has node-path index `i`.
        steps: Vec<FlowNode>,
    },
}

impl FlowNode {
    /// Sequential steps.
    pub fn seq(steps: Vec<FlowNode>) -> FlowNode {
        FlowNode::Seq { steps }
    }

    /// `when` guard: run `then` steps when the condition holds.
    pub fn when(cond: Expr, then: Vec<FlowNode>) -> FlowNode {
        FlowNode::If {
            cond,
            then: Box::new(FlowNode::seq(then)),
            otherwise: None,
        }
    }

    /// Full conditional.
    pub fn if_else(cond: Expr, then: FlowNode, otherwise: FlowNode) -> FlowNode {
        FlowNode::If {
            cond,
            then: Box::new(then),
            otherwise: Some(Box::new(otherwise)),
        }
    }

    /// `set` patch step.
    pub fn patch_set(path: &str, value: Expr) -> FlowNode {
        FlowNode::Patch {
            op: PatchOp::Set,
            path: Path::parse(path),
            value: Some(value),
        }
    }

    /// `unset` patch step.
    pub fn patch_unset(path: &str) -> FlowNode {
        FlowNode::Patch {
            op: PatchOp::Unset,
            path: Path::parse(path),
            value: None,
        }
    }

    /// `merge` patch step.
    pub fn patch_merge(path: &str, value: Expr) -> FlowNode {
        FlowNode::Patch {
            op: PatchOp::Merge,
            path: Path::parse(path),
            value: Some(value),
        }
    }

    /// Effect step.
    pub fn effect(effect_type: &str, params: Vec<(&str, Expr)>) -> FlowNode {
        FlowNode::Effect {
            effect_type: effect_type.to_string(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Call step.
    pub fn call(action: &str) -> FlowNode {
        FlowNode::Call {
            action: action.to_string(),
        }
    }

    /// Successful termination.
    pub fn halt() -> FlowNode {
        FlowNode::Halt { reason: None }
    }

    /// Failure termination.
    pub fn fail(code: ErrorCode, message: Option<Expr>) -> FlowNode {
        FlowNode::Fail {
            code: code.as_str().to_string(),
            message,
        }
    }

    /// Compiled once-guard.
    pub fn once(steps: Vec<FlowNode>) -> FlowNode {
        FlowNode::Once { steps }
    }

    /// Collect the actions this flow calls (transitively within the node).
    pub fn call_targets(&self, out: &mut BTreeSet<String>) {
        match self {
            FlowNode::Seq { steps } | FlowNode::Once { steps } => {
                for step in steps {
                    step.call_targets(out);
                }
            }
            FlowNode::If { then, otherwise, .. } => {
                then.call_targets(out);
                if let Some(otherwise) = otherwise {
                    otherwise.call_targets(out);
                }
            }
            FlowNode::Call { action } => {
                out.insert(action.clone());
            }
            FlowNode::Patch { .. }
            | FlowNode::Effect { .. }
            | FlowNode::Halt { .. }
            | FlowNode::Fail { .. } => {}
        }
    }

    /// Visit every patch path declared in this flow.
    pub fn patch_paths(&self, out: &mut Vec<Path>) {
        match self {
            FlowNode::Seq { steps } | FlowNode::Once { steps } => {
                for step in steps {
                    step.patch_paths(out);
                }
            }
            FlowNode::If { then, otherwise, .. } => {
                then.patch_paths(out);
                if let Some(otherwise) = otherwise {
                    otherwise.patch_paths(out);
                }
            }
            FlowNode::Patch { path, .. } => out.push(path.clone()),
            FlowNode::Effect { .. }
            | FlowNode::Call { .. }
            | FlowNode::Halt { .. }
            | FlowNode::Fail { .. } => {}
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            FlowNode::Seq { .. } => "seq",
            FlowNode::If { .. } => "if",
            FlowNode::Patch { .. } => "patch",
            FlowNode::Effect { .. } => "effect",
            FlowNode::Call { .. } => "call",
            FlowNode::Halt { .. } => "halt",
            FlowNode::Fail { .. } => "fail",
            FlowNode::Once { .. } => "once",
        }
    }
}

/// How a flow pass ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowOutcome {
    /// Ran to the end (or hit `halt`).
    Completed,
    /// Suspended at an effect node.
    Suspended {
        /// Node path of the suspension point.
        at: NodePath,
    },
    /// Terminated by `fail` or an unrecoverable walker error.
    Failed {
        /// The terminal error.
        error: ErrorValue,
    },
}

/// Everything a flow pass produced.
#[derive(Debug)]
pub struct FlowResult {
    /// Terminal outcome of this pass.
    pub outcome: FlowOutcome,
    /// Working data after all applied patches.
    pub data: Value,
    /// Patches applied this pass, in application order.
    pub patches: Vec<Patch>,
    /// Requirements newly emitted this pass.
    pub requirements: Vec<Requirement>,
    /// Non-terminal errors recorded along the way.
    pub errors: Vec<ErrorValue>,
}

/// Inputs to one flow pass.
pub struct FlowInputs<'a> {
    /// The loaded schema (needed for `call` resolution and hashing).
    pub schema: &'a Schema,
    /// Root action being executed.
    pub action_id: &'a str,
    /// Root flow node.
    pub flow: &'a FlowNode,
    /// Working data (owned; the result returns the mutated copy).
    pub data: Value,
    /// Action input.
    pub input: Value,
    /// Computed map as an object value.
    pub computed: Value,
    /// System block as an object value.
    pub system: Value,
    /// Intent id under evaluation.
    pub intent_id: &'a str,
    /// Frozen time.
    pub now: DateTime<Utc>,
    /// Frozen seed for the deterministic `uuid` expression.
    pub random_seed: u64,
    /// Continuation state from previous passes.
    pub reentry: &'a Reentry,
    /// Requirement ids still awaiting fulfillment.
    pub pending: &'a BTreeSet<RequirementId>,
}

/// Run one pass of a flow.
pub fn run_flow(inputs: FlowInputs<'_>, trace: &mut TraceBuilder) -> FlowResult {
    let mut walker = Walker {
        schema: inputs.schema,
        action_id: inputs.action_id,
        intent_id: inputs.intent_id,
        now: inputs.now,
        rng: fastrand::Rng::with_seed(inputs.random_seed),
        data: inputs.data,
        input: inputs.input,
        computed: inputs.computed,
        system: inputs.system,
        fulfilled: &inputs.reentry.fulfilled,
        pending: inputs.pending,
        ff: inputs.reentry.resume_after.clone(),
        path: NodePath::root(),
        patches: Vec::new(),
        requirements: Vec::new(),
        errors: Vec::new(),
        suspended_at: None,
        call_stack: Vec::new(),
        trace,
    };
    let step = walker.exec(inputs.flow);
    let outcome = match step {
        Step::Continue | Step::Halt => FlowOutcome::Completed,
        Step::Suspend => FlowOutcome::Suspended {
            at: walker.suspended_at.clone().unwrap_or_default(),
        },
        Step::Fail(error) => FlowOutcome::Failed { error },
    };
    FlowResult {
        outcome,
        data: walker.data,
        patches: walker.patches,
        requirements: walker.requirements,
        errors: walker.errors,
    }
}

/// Per-node control flow.
enum Step {
    Continue,
    Halt,
    Suspend,
    Fail(ErrorValue),
}

/// Fast-forward classification of the current node.
#[derive(PartialEq)]
enum Position {
    /// No fast-forward active; execute normally.
    Live,
    /// Node is strictly before the resume point; skip without effects.
    Skip,
    /// Node is the suspension point itself.
    At,
    /// Node is an ancestor of the resume point; descend structurally.
    Ancestor,
}

struct Walker<'a, 'b> {
    schema: &'a Schema,
    action_id: &'a str,
    intent_id: &'a str,
    now: DateTime<Utc>,
    rng: fastrand::Rng,
    data: Value,
    input: Value,
    computed: Value,
    system: Value,
    fulfilled: &'a BTreeSet<RequirementId>,
    pending: &'a BTreeSet<RequirementId>,
    /// Active resume point; cleared once passed.
    ff: Option<NodePath>,
    path: NodePath,
    patches: Vec<Patch>,
    requirements: Vec<Requirement>,
    errors: Vec<ErrorValue>,
    suspended_at: Option<NodePath>,
    call_stack: Vec<String>,
    trace: &'b mut TraceBuilder,
}

impl<'a, 'b> Walker<'a, 'b> {
    fn exec(&mut self, node: &FlowNode) -> Step {
        match self.classify() {
            Position::Skip => return Step::Continue,
            Position::At => {
                self.ff = None;
                if let FlowNode::Effect { .. } = node {
                    return self.exec_effect_at_resume(node);
                }
                // Defensive: a non-effect resume point is executed normally.
            }
            Position::Ancestor => return self.descend(node),
            Position::Live => {}
        }
        self.exec_live(node)
    }

    fn classify(&self) -> Position {
        match &self.ff {
            None => Position::Live,
            Some(resume) => {
                if self.path == *resume {
                    Position::At
                } else if self.path.is_prefix_of(resume) {
                    Position::Ancestor
                } else if self.path < *resume {
                    Position::Skip
                } else {
                    // Past the resume point without hitting it; treat as live.
                    Position::Live
                }
            }
        }
    }

    /// Structural descent toward the resume point, without side effects on
    /// the nodes along the way (conditions are not re-evaluated).
    fn descend(&mut self, node: &FlowNode) -> Step {
        let next_index = match self
            .ff
            .as_ref()
            .and_then(|resume| resume.indices().get(self.path.indices().len()).copied())
        {
            Some(index) => index,
            None => {
                // Stale or exhausted resume path; resume live execution here.
                self.ff = None;
                return self.exec_live(node);
            }
        };
        match node {
            FlowNode::Seq { steps } | FlowNode::Once { steps } => {
                for (index, step) in steps.iter().enumerate() {
                    let index = index as u32;
                    if index < next_index && self.ff.is_some() {
                        continue;
                    }
                    self.path.push(index);
                    let result = self.exec(step);
                    self.path.pop();
                    match result {
                        Step::Continue => {}
                        other => return other,
                    }
                }
                Step::Continue
            }
            FlowNode::If { then, otherwise, .. } => {
                let branch: Option<&FlowNode> = match next_index {
                    0 => Some(then),
                    1 => otherwise.as_deref(),
                    _ => None,
                };
                match branch {
                    Some(branch) => {
                        self.path.push(next_index);
                        let result = self.exec(branch);
                        self.path.pop();
                        result
                    }
                    None => {
                        // Stale resume path; nothing to resume into.
                        self.ff = None;
                        Step::Continue
                    }
                }
            }
            FlowNode::Call { action } => {
                let Some(target) = self.schema.action(action) else {
                    self.ff = None;
                    return Step::Continue;
                };
                self.call_stack.push(action.clone());
                self.path.push(0);
                let result = self.exec(&target.flow);
                self.path.pop();
                self.call_stack.pop();
                result
            }
            // Leaves have no children; a resume path below one is stale.
            FlowNode::Patch { .. }
            | FlowNode::Effect { .. }
            | FlowNode::Halt { .. }
            | FlowNode::Fail { .. } => {
                self.ff = None;
                Step::Continue
            }
        }
    }

    /// The suspended effect node, revisited on re-entry.
    fn exec_effect_at_resume(&mut self, node: &FlowNode) -> Step {
        let FlowNode::Effect { .. } = node else {
            return Step::Continue;
        };
        let id = match self.current_requirement_id() {
            Ok(id) => id,
            Err(step) => return step,
        };
        if self.fulfilled.contains(&id) {
            return Step::Continue;
        }
        if self.pending.contains(&id) {
            self.suspended_at = Some(self.path.clone());
            return Step::Suspend;
        }
        // Neither fulfilled nor pending: fall through to a fresh emission.
        self.exec_live(node)
    }

    fn exec_live(&mut self, node: &FlowNode) -> Step {
        let traced = self.trace.enabled();
        if traced {
            self.trace
                .open(&format!("flow:{}", node.kind()), self.path.to_string());
        }
        let step = self.exec_live_inner(node);
        if traced {
            let outcome = match &step {
                Step::Continue => "continue",
                Step::Halt => "halt",
                Step::Suspend => "suspend",
                Step::Fail(_) => "fail",
            };
            self.trace.close(Some(Value::String(outcome.to_string())));
        }
        step
    }

    fn exec_live_inner(&mut self, node: &FlowNode) -> Step {
        match node {
            FlowNode::Seq { steps } => {
                for (index, step) in steps.iter().enumerate() {
                    self.path.push(index as u32);
                    let result = self.exec(step);
                    self.path.pop();
                    match result {
                        Step::Continue => {}
                        other => return other,
                    }
                }
                Step::Continue
            }
            FlowNode::If { cond, then, otherwise } => {
                let verdict = match self.eval_expr(cond) {
                    Ok(Value::Bool(b)) => b,
                    Ok(other) => {
                        self.record_error(ErrorValue::new(
                            ErrorCode::TypeMismatch,
                            format!("if condition must be boolean, got {other}"),
                            self.now,
                        ));
                        return Step::Continue;
                    }
                    Err(error) => {
                        // Guard evaluation error: skip the block, record it.
                        self.record_error(error);
                        return Step::Continue;
                    }
                };
                if verdict {
                    self.path.push(0);
                    let result = self.exec(then);
                    self.path.pop();
                    result
                } else if let Some(otherwise) = otherwise {
                    self.path.push(1);
                    let result = self.exec(otherwise);
                    self.path.pop();
                    result
                } else {
                    Step::Continue
                }
            }
            FlowNode::Patch { op, path, value } => {
                self.exec_patch(*op, path, value.as_ref());
                Step::Continue
            }
            FlowNode::Effect { effect_type, params } => {
                self.exec_effect(effect_type, params)
            }
            FlowNode::Call { action } => {
                if self.call_stack.iter().any(|frame| frame == action) {
                    return Step::Fail(
                        ErrorValue::new(
                            ErrorCode::CyclicCall,
                            format!("action '{action}' is already on the call stack"),
                            self.now,
                        )
                        .with_source(self.action_id, self.path.to_string()),
                    );
                }
                let Some(target) = self.schema.action(action) else {
                    return Step::Fail(
                        ErrorValue::new(
                            ErrorCode::UnknownFlow,
                            format!("call target '{action}' does not exist"),
                            self.now,
                        )
                        .with_source(self.action_id, self.path.to_string()),
                    );
                };
                self.call_stack.push(action.clone());
                self.path.push(0);
                let result = self.exec(&target.flow);
                self.path.pop();
                self.call_stack.pop();
                result
            }
            FlowNode::Halt { .. } => Step::Halt,
            FlowNode::Fail { code, message } => {
                let code = ErrorCode::parse(code);
                let message = match message {
                    Some(expr) => match self.eval_expr(expr) {
                        Ok(Value::String(s)) => s,
                        Ok(other) => other.to_string(),
                        Err(_) => code.as_str().to_string(),
                    },
                    None => code.as_str().to_string(),
                };
                Step::Fail(
                    ErrorValue::new(code, message, self.now)
                        .with_source(self.action_id, self.path.to_string()),
                )
            }
            FlowNode::Once { steps } => {
                let marker_path = Path::parse("$mel.guards.intent").child(self.intent_id);
                if !matches!(value::lookup(&self.data, &marker_path), Lookup::Missing) {
                    // Marker present (or unreachable): the block already ran.
                    return Step::Continue;
                }
                // First execution writes the marker before anything else.
                let marker = Patch::Set {
                    path: marker_path,
                    value: Value::Bool(true),
                };
                if let Err(error) = self.apply_patch(marker) {
                    self.record_error(error);
                    return Step::Continue;
                }
                for (index, step) in steps.iter().enumerate() {
                    self.path.push(index as u32);
                    let result = self.exec(step);
                    self.path.pop();
                    match result {
                        Step::Continue => {}
                        other => return other,
                    }
                }
                Step::Continue
            }
        }
    }

    fn exec_patch(&mut self, op: PatchOp, path: &Path, value: Option<&Expr>) {
        if path.is_reserved() {
            self.record_error(ErrorValue::new(
                ErrorCode::PermissionDenied,
                format!("patch path '{path}' targets a reserved namespace"),
                self.now,
            ));
            return;
        }
        let patch = match op {
            PatchOp::Set | PatchOp::Merge => {
                let Some(expr) = value else {
                    self.record_error(ErrorValue::new(
                        ErrorCode::InvalidState,
                        format!("patch '{path}' is missing its value expression"),
                        self.now,
                    ));
                    return;
                };
                let resolved = match self.eval_expr(expr) {
                    Ok(value) => value,
                    Err(error) => {
                        self.record_error(error);
                        return;
                    }
                };
                match op {
                    PatchOp::Set => Patch::Set {
                        path: path.clone(),
                        value: resolved,
                    },
                    _ => Patch::Merge {
                        path: path.clone(),
                        value: resolved,
                    },
                }
            }
            PatchOp::Unset => Patch::Unset { path: path.clone() },
        };
        if let Err(error) = self.apply_patch(patch) {
            self.record_error(error);
        }
    }

    fn exec_effect(&mut self, effect_type: &str, params: &BTreeMap<String, Expr>) -> Step {
        let id = match self.current_requirement_id() {
            Ok(id) => id,
            Err(step) => return step,
        };
        if self.fulfilled.contains(&id) {
            return Step::Continue;
        }
        if self.pending.contains(&id) {
            self.suspended_at = Some(self.path.clone());
            return Step::Suspend;
        }
        let mut resolved = serde_json::Map::new();
        for (name, expr) in params {
            match self.eval_expr(expr) {
                Ok(value) => {
                    resolved.insert(name.clone(), value);
                }
                Err(error) => {
                    // Parameter resolution failed: record and skip the effect.
                    self.record_error(error);
                    return Step::Continue;
                }
            }
        }
        self.requirements.push(Requirement {
            id,
            effect_type: effect_type.to_string(),
            params: resolved,
            action_id: self.action_id.to_string(),
            flow_position: self.path.clone(),
            created_at: self.now,
        });
        self.suspended_at = Some(self.path.clone());
        Step::Suspend
    }

    fn current_requirement_id(&self) -> Result<RequirementId, Step> {
        requirement_id(self.schema.hash(), self.intent_id, self.action_id, &self.path).map_err(
            |err| {
                Step::Fail(
                    ErrorValue::new(ErrorCode::Internal, err.to_string(), self.now)
                        .with_source(self.action_id, self.path.to_string()),
                )
            },
        )
    }

    fn apply_patch(&mut self, patch: Patch) -> Result<(), ErrorValue> {
        match apply_patches(&self.data, std::slice::from_ref(&patch), UnsetMode::Lenient) {
            Ok(next) => {
                self.data = next;
                self.patches.push(patch);
                Ok(())
            }
            Err(err) => Err(ErrorValue::new(err.code(), err.to_string(), self.now)),
        }
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Value, ErrorValue> {
        let mut env = EvalEnv::new(
            &self.data,
            &self.input,
            &self.computed,
            &self.system,
            self.intent_id,
            self.now,
            &mut self.rng,
            self.trace,
        );
        eval(expr, &mut env)
    }

    fn record_error(&mut self, error: ErrorValue) {
        let error = if error.source.is_none() {
            error.with_source(self.action_id, self.path.to_string())
        } else {
            error
        };
        self.errors.push(error);
    }
}
