//! Expression IR and evaluator.
//!
//! Expressions are a tagged tree evaluated purely against a read-only view of
//! the working snapshot. Evaluation is total: every failure path returns an
//! [`ErrorValue`] rather than panicking, and errors propagate as values to
//! the enclosing flow step.
//!
//! # Path roots
//!
//! `get` paths are rooted: `data.…` reads the user tree, `input.…` the
//! current action input, `computed.…` the computed map. Inside `filter` /
//! `map` the roots `item` and `index` address the current element. `sys`
//! reads the system block.
//!
//! # Determinism
//!
//! The only non-functional inputs are the frozen context (`now`) and the
//! seeded PRNG consumed by `uuid`. Identical frozen contexts yield identical
//! results, including identical uuids in identical evaluation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{ErrorCode, ErrorValue};
use crate::trace::TraceBuilder;
use crate::value::{self, Lookup, Path};

/// The expression IR.
///
/// Constructors ([`Expr::lit`], [`Expr::get`], …) exist for every variant so
/// flows can be assembled without spelling out the enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Expr {
    /// A literal value.
    Lit {
        /// The value.
        value: Value,
    },
    /// Read a rooted path (`data.…`, `input.…`, `computed.…`, `item`, `index`).
    Get {
        /// Rooted path.
        path: Path,
    },
    /// Read the system block (`status`, `last_error`, …).
    Sys {
        /// System-relative path.
        path: Path,
    },
    /// The id of the intent under evaluation. Compiled once-guards use this.
    IntentId,
    /// The recorded guard marker for the current intent id, or null.
    ///
    /// Reads `data.$mel.guards.intent.<intent_id>`.
    GuardMarker,
    /// Numeric addition; string operands concatenate.
    Add {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Numeric subtraction.
    Sub {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Numeric multiplication.
    Mul {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Numeric division. Division by zero is a typed error.
    Div {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Deep equality.
    Eq {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Deep inequality.
    Neq {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Strictly less than (numbers or strings).
    Lt {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Less than or equal (numbers or strings).
    Lte {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Strictly greater than (numbers or strings).
    Gt {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Greater than or equal (numbers or strings).
    Gte {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical AND with short-circuit.
    And {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical OR with short-circuit.
    Or {
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Logical negation.
    Not {
        /// Operand.
        expr: Box<Expr>,
    },
    /// First operand that evaluates to a non-null value.
    Coalesce {
        /// Candidates, tried in order.
        exprs: Vec<Expr>,
    },
    /// True if the operand is null (or a missing path).
    IsNull {
        /// Operand.
        expr: Box<Expr>,
    },
    /// True if the operand is not null.
    IsNotNull {
        /// Operand.
        expr: Box<Expr>,
    },
    /// Length of an array, object, or string (in characters).
    Len {
        /// Operand.
        expr: Box<Expr>,
    },
    /// Keep array elements for which the predicate holds.
    Filter {
        /// Array source.
        items: Box<Expr>,
        /// Boolean predicate; sees `item` and `index`.
        predicate: Box<Expr>,
    },
    /// Transform each array element.
    Map {
        /// Array source.
        items: Box<Expr>,
        /// Transform; sees `item` and `index`.
        transform: Box<Expr>,
    },
    /// Conditional with lazy branches.
    Cond {
        /// Boolean condition.
        cond: Box<Expr>,
        /// Evaluated when the condition holds.
        then: Box<Expr>,
        /// Evaluated otherwise.
        otherwise: Box<Expr>,
    },
    /// Trim whitespace from a string.
    Trim {
        /// Operand.
        expr: Box<Expr>,
    },
    /// A uuid drawn deterministically from the frozen seed.
    Uuid,
}

impl Expr {
    /// Literal value.
    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Lit { value: value.into() }
    }

    /// Rooted path read.
    pub fn get(path: &str) -> Expr {
        Expr::Get { path: Path::parse(path) }
    }

    /// System block read.
    pub fn sys(path: &str) -> Expr {
        Expr::Sys { path: Path::parse(path) }
    }

    /// Addition / concatenation.
    pub fn add(left: Expr, right: Expr) -> Expr {
        Expr::Add { left: Box::new(left), right: Box::new(right) }
    }

    /// Subtraction.
    pub fn sub(left: Expr, right: Expr) -> Expr {
        Expr::Sub { left: Box::new(left), right: Box::new(right) }
    }

    /// Multiplication.
    pub fn mul(left: Expr, right: Expr) -> Expr {
        Expr::Mul { left: Box::new(left), right: Box::new(right) }
    }

    /// Division.
    pub fn div(left: Expr, right: Expr) -> Expr {
        Expr::Div { left: Box::new(left), right: Box::new(right) }
    }

    /// Deep equality.
    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::Eq { left: Box::new(left), right: Box::new(right) }
    }

    /// Deep inequality.
    pub fn neq(left: Expr, right: Expr) -> Expr {
        Expr::Neq { left: Box::new(left), right: Box::new(right) }
    }

    /// Strictly less than.
    pub fn lt(left: Expr, right: Expr) -> Expr {
        Expr::Lt { left: Box::new(left), right: Box::new(right) }
    }

    /// Less than or equal.
    pub fn lte(left: Expr, right: Expr) -> Expr {
        Expr::Lte { left: Box::new(left), right: Box::new(right) }
    }

    /// Strictly greater than.
    pub fn gt(left: Expr, right: Expr) -> Expr {
        Expr::Gt { left: Box::new(left), right: Box::new(right) }
    }

    /// Greater than or equal.
    pub fn gte(left: Expr, right: Expr) -> Expr {
        Expr::Gte { left: Box::new(left), right: Box::new(right) }
    }

    /// Logical AND.
    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::And { left: Box::new(left), right: Box::new(right) }
    }

    /// Logical OR.
    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::Or { left: Box::new(left), right: Box::new(right) }
    }

    /// Logical negation.
    pub fn not(expr: Expr) -> Expr {
        Expr::Not { expr: Box::new(expr) }
    }

    /// First non-null candidate.
    pub fn coalesce(exprs: Vec<Expr>) -> Expr {
        Expr::Coalesce { exprs }
    }

    /// Null check.
    pub fn is_null(expr: Expr) -> Expr {
        Expr::IsNull { expr: Box::new(expr) }
    }

    /// Non-null check.
    pub fn is_not_null(expr: Expr) -> Expr {
        Expr::IsNotNull { expr: Box::new(expr) }
    }

    /// Length.
    pub fn len(expr: Expr) -> Expr {
        Expr::Len { expr: Box::new(expr) }
    }

    /// Array filter.
    pub fn filter(items: Expr, predicate: Expr) -> Expr {
        Expr::Filter { items: Box::new(items), predicate: Box::new(predicate) }
    }

    /// Array map.
    pub fn map(items: Expr, transform: Expr) -> Expr {
        Expr::Map { items: Box::new(items), transform: Box::new(transform) }
    }

    /// Conditional.
    pub fn cond(cond: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Cond {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    /// String trim.
    pub fn trim(expr: Expr) -> Expr {
        Expr::Trim { expr: Box::new(expr) }
    }

    /// Short operator name, used for trace node sources.
    pub fn op_name(&self) -> &'static str {
        match self {
            Expr::Lit { .. } => "lit",
            Expr::Get { .. } => "get",
            Expr::Sys { .. } => "sys",
            Expr::IntentId => "intentId",
            Expr::GuardMarker => "guardMarker",
            Expr::Add { .. } => "add",
            Expr::Sub { .. } => "sub",
            Expr::Mul { .. } => "mul",
            Expr::Div { .. } => "div",
            Expr::Eq { .. } => "eq",
            Expr::Neq { .. } => "neq",
            Expr::Lt { .. } => "lt",
            Expr::Lte { .. } => "lte",
            Expr::Gt { .. } => "gt",
            Expr::Gte { .. } => "gte",
            Expr::And { .. } => "and",
            Expr::Or { .. } => "or",
            Expr::Not { .. } => "not",
            Expr::Coalesce { .. } => "coalesce",
            Expr::IsNull { .. } => "isNull",
            Expr::IsNotNull { .. } => "isNotNull",
            Expr::Len { .. } => "len",
            Expr::Filter { .. } => "filter",
            Expr::Map { .. } => "map",
            Expr::Cond { .. } => "cond",
            Expr::Trim { .. } => "trim",
            Expr::Uuid => "uuid",
        }
    }
}

/// Read-only evaluation environment for one compute pass.
pub struct EvalEnv<'a> {
    /// The working user data tree.
    pub data: &'a Value,
    /// The current action input.
    pub input: &'a Value,
    /// The computed map as an object value.
    pub computed: &'a Value,
    /// The system block as an object value.
    pub system: &'a Value,
    /// Id of the intent under evaluation.
    pub intent_id: &'a str,
    /// Frozen time.
    pub now: DateTime<Utc>,
    /// Seeded PRNG; consumed by `uuid`.
    pub rng: &'a mut fastrand::Rng,
    /// Trace collection (possibly disabled).
    pub trace: &'a mut TraceBuilder,
    /// `item` / `index` frames for filter/map scopes, innermost last.
    scope: Vec<(Value, usize)>,
}

impl<'a> EvalEnv<'a> {
    /// Assemble an environment.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: &'a Value,
        input: &'a Value,
        computed: &'a Value,
        system: &'a Value,
        intent_id: &'a str,
        now: DateTime<Utc>,
        rng: &'a mut fastrand::Rng,
        trace: &'a mut TraceBuilder,
    ) -> Self {
        Self {
            data,
            input,
            computed,
            system,
            intent_id,
            now,
            rng,
            trace,
            scope: Vec::new(),
        }
    }

    fn error(&self, code: ErrorCode, message: impl Into<String>) -> ErrorValue {
        ErrorValue::new(code, message, self.now)
    }
}

/// Evaluate an expression to a value.
pub fn eval(expr: &Expr, env: &mut EvalEnv<'_>) -> Result<Value, ErrorValue> {
    let traced = env.trace.enabled();
    if traced {
        env.trace.open(&format!("expr:{}", expr.op_name()), expr.op_name());
    }
    let result = eval_inner(expr, env);
    if traced {
        env.trace.close(result.as_ref().ok().cloned());
    }
    result
}

fn eval_inner(expr: &Expr, env: &mut EvalEnv<'_>) -> Result<Value, ErrorValue> {
    match expr {
        Expr::Lit { value } => Ok(value.clone()),
        Expr::Get { path } => eval_get(path, env),
        Expr::Sys { path } => Ok(match value::lookup(env.system, path) {
            Lookup::Found(v) => v.clone(),
            _ => Value::Null,
        }),
        Expr::IntentId => Ok(Value::String(env.intent_id.to_string())),
        Expr::GuardMarker => {
            let marker_path = Path::parse("$mel.guards.intent").child(env.intent_id);
            Ok(match value::lookup(env.data, &marker_path) {
                Lookup::Found(v) => v.clone(),
                _ => Value::Null,
            })
        }
        Expr::Add { left, right } => {
            let l = eval(left, env)?;
            let r = eval(right, env)?;
            match (&l, &r) {
                (Value::String(a), Value::String(b)) => {
                    Ok(Value::String(format!("{a}{b}")))
                }
                _ => numeric_op(&l, &r, env, "add", |a, b| a.checked_add(b), |a, b| a + b),
            }
        }
        Expr::Sub { left, right } => {
            let l = eval(left, env)?;
            let r = eval(right, env)?;
            numeric_op(&l, &r, env, "sub", |a, b| a.checked_sub(b), |a, b| a - b)
        }
        Expr::Mul { left, right } => {
            let l = eval(left, env)?;
            let r = eval(right, env)?;
            numeric_op(&l, &r, env, "mul", |a, b| a.checked_mul(b), |a, b| a * b)
        }
        Expr::Div { left, right } => {
            let l = eval(left, env)?;
            let r = eval(right, env)?;
            let (a, b) = both_numbers(&l, &r, env, "div")?;
            if b == 0.0 {
                return Err(env.error(ErrorCode::DivisionByZero, "division by zero"));
            }
            // Integer division only when it is exact; otherwise float.
            if let (Some(ai), Some(bi)) = (l.as_i64(), r.as_i64()) {
                if bi != 0 && ai % bi == 0 {
                    return Ok(Value::from(ai / bi));
                }
            }
            Ok(number(a / b))
        }
        Expr::Eq { left, right } => {
            let l = eval(left, env)?;
            let r = eval(right, env)?;
            Ok(Value::Bool(l == r))
        }
        Expr::Neq { left, right } => {
            let l = eval(left, env)?;
            let r = eval(right, env)?;
            Ok(Value::Bool(l != r))
        }
        Expr::Lt { left, right } => compare(left, right, env, "lt", |o| o == std::cmp::Ordering::Less),
        Expr::Lte { left, right } => {
            compare(left, right, env, "lte", |o| o != std::cmp::Ordering::Greater)
        }
        Expr::Gt { left, right } => {
            compare(left, right, env, "gt", |o| o == std::cmp::Ordering::Greater)
        }
        Expr::Gte { left, right } => {
            compare(left, right, env, "gte", |o| o != std::cmp::Ordering::Less)
        }
        Expr::And { left, right } => {
            if !boolean(&eval(left, env)?, env, "and")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(boolean(&eval(right, env)?, env, "and")?))
        }
        Expr::Or { left, right } => {
            if boolean(&eval(left, env)?, env, "or")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(boolean(&eval(right, env)?, env, "or")?))
        }
        Expr::Not { expr } => Ok(Value::Bool(!boolean(&eval(expr, env)?, env, "not")?)),
        Expr::Coalesce { exprs } => {
            for candidate in exprs {
                let value = eval(candidate, env)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
        Expr::IsNull { expr } => Ok(Value::Bool(eval(expr, env)?.is_null())),
        Expr::IsNotNull { expr } => Ok(Value::Bool(!eval(expr, env)?.is_null())),
        Expr::Len { expr } => {
            let value = eval(expr, env)?;
            match &value {
                Value::Array(items) => Ok(Value::from(items.len())),
                Value::Object(map) => Ok(Value::from(map.len())),
                Value::String(s) => Ok(Value::from(s.chars().count())),
                other => Err(env.error(
                    ErrorCode::TypeMismatch,
                    format!("len expects array, object, or string, got {}", kind_of(other)),
                )),
            }
        }
        Expr::Filter { items, predicate } => {
            let source = eval(items, env)?;
            let Value::Array(items) = source else {
                return Err(env.error(
                    ErrorCode::TypeMismatch,
                    format!("filter expects an array, got {}", kind_of(&source)),
                ));
            };
            let mut kept = Vec::new();
            for (index, item) in items.into_iter().enumerate() {
                env.scope.push((item.clone(), index));
                let verdict = eval(predicate, env);
                env.scope.pop();
                if boolean(&verdict?, env, "filter predicate")? {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
        Expr::Map { items, transform } => {
            let source = eval(items, env)?;
            let Value::Array(items) = source else {
                return Err(env.error(
                    ErrorCode::TypeMismatch,
                    format!("map expects an array, got {}", kind_of(&source)),
                ));
            };
            let mut mapped = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                env.scope.push((item, index));
                let transformed = eval(transform, env);
                env.scope.pop();
                mapped.push(transformed?);
            }
            Ok(Value::Array(mapped))
        }
        Expr::Cond { cond, then, otherwise } => {
            if boolean(&eval(cond, env)?, env, "cond")? {
                eval(then, env)
            } else {
                eval(otherwise, env)
            }
        }
        Expr::Trim { expr } => {
            let value = eval(expr, env)?;
            match value {
                Value::String(s) => Ok(Value::String(s.trim().to_string())),
                other => Err(env.error(
                    ErrorCode::TypeMismatch,
                    format!("trim expects a string, got {}", kind_of(&other)),
                )),
            }
        }
        Expr::Uuid => Ok(Value::String(deterministic_uuid(env.rng))),
    }
}

fn eval_get(path: &Path, env: &mut EvalEnv<'_>) -> Result<Value, ErrorValue> {
    let root = path.head().unwrap_or("");
    let tail = path.tail();
    let resolved = match root {
        "data" => value::lookup(env.data, &tail),
        "input" => value::lookup(env.input, &tail),
        "computed" => {
            // Computed fields are keyed by their full dotted name.
            let key = tail.to_string();
            if let Value::Object(map) = env.computed {
                return Ok(map.get(&key).cloned().unwrap_or(Value::Null));
            }
            return Ok(Value::Null);
        }
        "item" => match env.scope.last() {
            Some((item, _)) => {
                let item = item.clone();
                return match value::lookup(&item, &tail) {
                    Lookup::Found(v) => Ok(v.clone()),
                    Lookup::Missing => Ok(Value::Null),
                    Lookup::Blocked => Err(env.error(
                        ErrorCode::PathNotFound,
                        format!("path '{path}' crosses a non-container"),
                    )),
                    Lookup::OutOfBounds => Err(env.error(
                        ErrorCode::IndexOutOfBounds,
                        format!("index out of bounds at '{path}'"),
                    )),
                };
            }
            None => {
                return Err(env.error(
                    ErrorCode::PathNotFound,
                    "'item' is only available inside filter/map",
                ))
            }
        },
        "index" => {
            return match env.scope.last() {
                Some((_, index)) => Ok(Value::from(*index)),
                None => Err(env.error(
                    ErrorCode::PathNotFound,
                    "'index' is only available inside filter/map",
                )),
            }
        }
        other => {
            return Err(env.error(
                ErrorCode::PathNotFound,
                format!("unknown path root '{other}' in '{path}'"),
            ))
        }
    };
    match resolved {
        Lookup::Found(v) => Ok(v.clone()),
        Lookup::Missing => Ok(Value::Null),
        Lookup::Blocked => Err(env.error(
            ErrorCode::PathNotFound,
            format!("path '{path}' crosses a non-container"),
        )),
        Lookup::OutOfBounds => Err(env.error(
            ErrorCode::IndexOutOfBounds,
            format!("index out of bounds at '{path}'"),
        )),
    }
}

fn compare(
    left: &Expr,
    right: &Expr,
    env: &mut EvalEnv<'_>,
    op: &str,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, ErrorValue> {
    let l = eval(left, env)?;
    let r = eval(right, env)?;
    let ordering = match (&l, &r) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            let (a, b) = both_numbers(&l, &r, env, op)?;
            a.partial_cmp(&b).ok_or_else(|| {
                env.error(ErrorCode::TypeMismatch, format!("{op}: incomparable numbers"))
            })?
        }
    };
    Ok(Value::Bool(accept(ordering)))
}

fn numeric_op(
    l: &Value,
    r: &Value,
    env: &EvalEnv<'_>,
    op: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, ErrorValue> {
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        if let Some(result) = int_op(a, b) {
            return Ok(Value::from(result));
        }
        // Integer overflow falls back to float arithmetic.
    }
    let (a, b) = both_numbers(l, r, env, op)?;
    Ok(number(float_op(a, b)))
}

fn both_numbers(
    l: &Value,
    r: &Value,
    env: &EvalEnv<'_>,
    op: &str,
) -> Result<(f64, f64), ErrorValue> {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(env.error(
            ErrorCode::TypeMismatch,
            format!("{op} expects numbers, got {} and {}", kind_of(l), kind_of(r)),
        )),
    }
}

fn boolean(value: &Value, env: &EvalEnv<'_>, op: &str) -> Result<bool, ErrorValue> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(env.error(
            ErrorCode::TypeMismatch,
            format!("{op} expects a boolean, got {}", kind_of(other)),
        )),
    }
}

fn number(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Format 16 deterministic bytes as a v4-shaped uuid string.
fn deterministic_uuid(rng: &mut fastrand::Rng) -> String {
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_with(data: Value, input: Value, expr: &Expr) -> Result<Value, ErrorValue> {
        let computed = json!({});
        let system = json!({"status": "idle"});
        let mut rng = fastrand::Rng::with_seed(7);
        let mut trace = TraceBuilder::new(false);
        let mut env = EvalEnv::new(
            &data,
            &input,
            &computed,
            &system,
            "intent-1",
            Utc::now(),
            &mut rng,
            &mut trace,
        );
        eval(expr, &mut env)
    }

    #[test]
    fn literals_and_gets() {
        let data = json!({"count": 3, "user": {"name": "ada"}});
        assert_eq!(eval_with(data.clone(), json!({}), &Expr::lit(5)).unwrap(), json!(5));
        assert_eq!(
            eval_with(data.clone(), json!({}), &Expr::get("data.user.name")).unwrap(),
            json!("ada")
        );
        assert_eq!(
            eval_with(data, json!({"value": 9}), &Expr::get("input.value")).unwrap(),
            json!(9)
        );
    }

    #[test]
    fn missing_key_reads_null() {
        assert_eq!(
            eval_with(json!({}), json!({}), &Expr::get("data.missing")).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn traversal_through_scalar_errors() {
        let err = eval_with(json!({"count": 1}), json!({}), &Expr::get("data.count.x")).unwrap_err();
        assert_eq!(err.code, ErrorCode::PathNotFound);
    }

    #[test]
    fn unknown_root_errors() {
        let err = eval_with(json!({}), json!({}), &Expr::get("nowhere.x")).unwrap_err();
        assert_eq!(err.code, ErrorCode::PathNotFound);
    }

    #[test]
    fn integer_arithmetic() {
        let expr = Expr::add(Expr::get("data.count"), Expr::lit(1));
        assert_eq!(eval_with(json!({"count": 2}), json!({}), &expr).unwrap(), json!(3));
    }

    #[test]
    fn string_concatenation() {
        let expr = Expr::add(Expr::lit("a"), Expr::lit("b"));
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!("ab"));
    }

    #[test]
    fn division_by_zero_is_typed() {
        let expr = Expr::div(Expr::lit(1), Expr::lit(0));
        let err = eval_with(json!({}), json!({}), &expr).unwrap_err();
        assert_eq!(err.code, ErrorCode::DivisionByZero);
    }

    #[test]
    fn exact_integer_division_stays_integer() {
        let expr = Expr::div(Expr::lit(6), Expr::lit(3));
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!(2));
        let expr = Expr::div(Expr::lit(7), Expr::lit(2));
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!(3.5));
    }

    #[test]
    fn type_mismatch_is_typed() {
        let expr = Expr::add(Expr::lit(1), Expr::lit(true));
        let err = eval_with(json!({}), json!({}), &expr).unwrap_err();
        assert_eq!(err.code, ErrorCode::TypeMismatch);
    }

    #[test]
    fn comparisons() {
        let expr = Expr::gt(Expr::get("data.count"), Expr::lit(0));
        assert_eq!(eval_with(json!({"count": 1}), json!({}), &expr).unwrap(), json!(true));
        let expr = Expr::lte(Expr::lit("a"), Expr::lit("b"));
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!(true));
    }

    #[test]
    fn boolean_short_circuit() {
        // Right side would error, but left decides.
        let expr = Expr::and(Expr::lit(false), Expr::div(Expr::lit(1), Expr::lit(0)));
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!(false));
        let expr = Expr::or(Expr::lit(true), Expr::div(Expr::lit(1), Expr::lit(0)));
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!(true));
    }

    #[test]
    fn coalesce_and_null_checks() {
        let expr = Expr::coalesce(vec![
            Expr::get("data.missing"),
            Expr::lit(Value::Null),
            Expr::lit("fallback"),
        ]);
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!("fallback"));
        assert_eq!(
            eval_with(json!({}), json!({}), &Expr::is_null(Expr::get("data.x"))).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn len_variants() {
        assert_eq!(
            eval_with(json!({"items": [1, 2, 3]}), json!({}), &Expr::len(Expr::get("data.items")))
                .unwrap(),
            json!(3)
        );
        assert_eq!(
            eval_with(json!({}), json!({}), &Expr::len(Expr::lit("héllo"))).unwrap(),
            json!(5)
        );
    }

    #[test]
    fn filter_and_map_bind_item_and_index() {
        let data = json!({"items": [1, 2, 3, 4]});
        let filtered = Expr::filter(
            Expr::get("data.items"),
            Expr::gt(Expr::get("item"), Expr::lit(2)),
        );
        assert_eq!(eval_with(data.clone(), json!({}), &filtered).unwrap(), json!([3, 4]));

        let mapped = Expr::map(Expr::get("data.items"), Expr::get("index"));
        assert_eq!(eval_with(data, json!({}), &mapped).unwrap(), json!([0, 1, 2, 3]));
    }

    #[test]
    fn cond_is_lazy() {
        let expr = Expr::cond(
            Expr::lit(true),
            Expr::lit("yes"),
            Expr::div(Expr::lit(1), Expr::lit(0)),
        );
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!("yes"));
    }

    #[test]
    fn trim_strings() {
        let expr = Expr::trim(Expr::lit("  spaced  "));
        assert_eq!(eval_with(json!({}), json!({}), &expr).unwrap(), json!("spaced"));
    }

    #[test]
    fn uuid_is_deterministic_per_seed() {
        let gen = |seed: u64| {
            let data = json!({});
            let input = json!({});
            let computed = json!({});
            let system = json!({});
            let mut rng = fastrand::Rng::with_seed(seed);
            let mut trace = TraceBuilder::new(false);
            let mut env = EvalEnv::new(
                &data, &input, &computed, &system, "i", Utc::now(), &mut rng, &mut trace,
            );
            eval(&Expr::Uuid, &mut env).unwrap()
        };
        assert_eq!(gen(42), gen(42));
        assert_ne!(gen(42), gen(43));
    }

    #[test]
    fn uuid_has_v4_shape() {
        let mut rng = fastrand::Rng::with_seed(1);
        let uuid = deterministic_uuid(&mut rng);
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.as_bytes()[14], b'4');
    }

    #[test]
    fn guard_marker_reads_reserved_namespace() {
        let data = json!({"$mel": {"guards": {"intent": {"intent-1": true}}}});
        assert_eq!(eval_with(data, json!({}), &Expr::GuardMarker).unwrap(), json!(true));
        assert_eq!(
            eval_with(json!({}), json!({}), &Expr::GuardMarker).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn sys_reads_system_block() {
        assert_eq!(
            eval_with(json!({}), json!({}), &Expr::sys("status")).unwrap(),
            json!("idle")
        );
    }

    #[test]
    fn intent_id_is_visible() {
        assert_eq!(
            eval_with(json!({}), json!({}), &Expr::IntentId).unwrap(),
            json!("intent-1")
        );
    }
}
