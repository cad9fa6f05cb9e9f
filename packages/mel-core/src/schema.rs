//! Schema model, validation, and content addressing.
//!
//! A schema is loaded once from a deserialized [`SchemaDef`], validated, and
//! then shared immutably. Loading computes the content hash over the
//! canonical form (so permuted field orders hash identically), topologically
//! sorts the computed section, and verifies the action call graph is
//! acyclic. A schema that loads is safe to evaluate: the walker never has to
//! re-check these structural invariants.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::canonical::{hash_value, ContentHash};
use crate::computed::ComputedGraph;
use crate::error::SchemaError;
use crate::expr::Expr;
use crate::flow::FlowNode;
use crate::value::{Path, PLATFORM_PREFIX};

/// Declared type of a state or input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Boolean.
    Bool,
    /// Integer number.
    Int,
    /// Any number.
    Float,
    /// String.
    String,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// Anything, including null.
    Any,
}

impl FieldType {
    /// Whether a value satisfies this type. Null satisfies only `Any`.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldType::Bool => value.is_boolean(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::String => value.is_string(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

/// Declaration of a single state or input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Declared type.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the field must be present (directly or via `default`).
    #[serde(default)]
    pub required: bool,
    /// Default value applied when the field is absent at genesis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Declaration of a computed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedSpec {
    /// Expression evaluated against the post-flow snapshot.
    pub expr: Expr,
    /// Declared dependencies, rooted (`data.…` or `computed.…`).
    pub deps: Vec<String>,
}

/// Declaration of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// The action's flow tree.
    pub flow: FlowNode,
    /// Optional input field specification, validated at dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<BTreeMap<String, FieldSpec>>,
}

/// State section of a schema definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSection {
    /// Field path → specification.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

/// Computed section of a schema definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComputedSection {
    /// Computed name → specification.
    #[serde(default)]
    pub fields: BTreeMap<String, ComputedSpec>,
}

/// The raw, serializable schema shape produced by an authoring front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    /// Schema identifier.
    pub id: String,
    /// Authoring version string.
    pub version: String,
    /// State fields.
    #[serde(default)]
    pub state: StateSection,
    /// Computed fields.
    #[serde(default)]
    pub computed: ComputedSection,
    /// Actions.
    #[serde(default)]
    pub actions: BTreeMap<String, ActionSpec>,
}

/// A validated, content-addressed schema.
///
/// Construction goes through [`Schema::load`]; the derived structures
/// (content hash, computed graph) are fixed for the schema's lifetime.
#[derive(Debug, Clone)]
pub struct Schema {
    def: SchemaDef,
    hash: ContentHash,
    graph: ComputedGraph,
}

impl Schema {
    /// Validate a definition and derive the hash and computed graph.
    pub fn load(def: SchemaDef) -> Result<Self, SchemaError> {
        if def.id.is_empty() {
            return Err(SchemaError::Invalid {
                message: "schema id must not be empty".into(),
            });
        }
        if def.version.is_empty() {
            return Err(SchemaError::Invalid {
                message: "schema version must not be empty".into(),
            });
        }

        for field in def.state.fields.keys() {
            let path = Path::parse(field);
            validate_declared_path(field, &path)?;
            if let Some(spec) = def.state.fields.get(field) {
                if let Some(default) = &spec.default {
                    if !spec.field_type.accepts(default) && !default.is_null() {
                        return Err(SchemaError::Invalid {
                            message: format!(
                                "default for state field '{field}' does not match its type"
                            ),
                        });
                    }
                }
            }
        }

        for name in def.computed.fields.keys() {
            if name.is_empty() {
                return Err(SchemaError::Invalid {
                    message: "computed field names must not be empty".into(),
                });
            }
        }

        validate_actions(&def.actions)?;
        let graph = ComputedGraph::build(&def.computed.fields)?;
        let hash = hash_value(&serde_json::to_value(&def).map_err(|err| SchemaError::Invalid {
            message: format!("schema is not serializable: {err}"),
        })?)?;

        debug!(schema_id = %def.id, hash = %hash.short(), "schema loaded");
        Ok(Self { def, hash, graph })
    }

    /// Deserialize a JSON schema value, then load it.
    pub fn from_value(value: Value) -> Result<Self, SchemaError> {
        let def: SchemaDef = serde_json::from_value(value).map_err(|err| SchemaError::Invalid {
            message: format!("schema value has the wrong shape: {err}"),
        })?;
        Self::load(def)
    }

    /// Parse a JSON schema document, then load it.
    pub fn from_json_str(raw: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| SchemaError::Invalid {
            message: format!("schema document is not valid JSON: {err}"),
        })?;
        Self::from_value(value)
    }

    /// Schema identifier.
    pub fn id(&self) -> &str {
        &self.def.id
    }

    /// Authoring version string.
    pub fn version(&self) -> &str {
        &self.def.version
    }

    /// Content hash of the canonical schema form.
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    /// State field declarations.
    pub fn state_fields(&self) -> &BTreeMap<String, FieldSpec> {
        &self.def.state.fields
    }

    /// Computed field declarations.
    pub fn computed_fields(&self) -> &BTreeMap<String, ComputedSpec> {
        &self.def.computed.fields
    }

    /// Action declarations.
    pub fn actions(&self) -> &BTreeMap<String, ActionSpec> {
        &self.def.actions
    }

    /// Look up an action by name.
    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.def.actions.get(name)
    }

    /// The computed dependency graph.
    pub fn computed_graph(&self) -> &ComputedGraph {
        &self.graph
    }
}

fn validate_declared_path(raw: &str, path: &Path) -> Result<(), SchemaError> {
    if path.is_empty() || path.segments().iter().any(String::is_empty) {
        return Err(SchemaError::Invalid {
            message: format!("field path '{raw}' has empty segments"),
        });
    }
    if path.is_reserved() {
        return Err(SchemaError::Invalid {
            message: format!("field path '{raw}' is inside a reserved namespace"),
        });
    }
    Ok(())
}

fn validate_actions(actions: &BTreeMap<String, ActionSpec>) -> Result<(), SchemaError> {
    for (name, spec) in actions {
        if name.is_empty() {
            return Err(SchemaError::Invalid {
                message: "action names must not be empty".into(),
            });
        }
        if name.starts_with(PLATFORM_PREFIX) {
            return Err(SchemaError::ReservedActionName { name: name.clone() });
        }

        // Declared patch targets may not enter reserved namespaces; guard
        // markers are written by the walker itself, never by user flows.
        let mut patch_paths = Vec::new();
        spec.flow.patch_paths(&mut patch_paths);
        for path in patch_paths {
            if path.is_reserved() {
                return Err(SchemaError::Invalid {
                    message: format!(
                        "action '{name}' patches reserved path '{path}'"
                    ),
                });
            }
        }

        let mut targets = BTreeSet::new();
        spec.flow.call_targets(&mut targets);
        for target in targets {
            if !actions.contains_key(&target) {
                return Err(SchemaError::UnknownCallTarget {
                    action: name.clone(),
                    target,
                });
            }
        }
    }

    check_call_acyclicity(actions)
}

/// Depth-first search for cycles over the action call graph.
fn check_call_acyclicity(actions: &BTreeMap<String, ActionSpec>) -> Result<(), SchemaError> {
    let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, spec) in actions {
        let mut targets = BTreeSet::new();
        spec.flow.call_targets(&mut targets);
        edges.insert(name.clone(), targets);
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        name: &str,
        edges: &BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Result<(), SchemaError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let mut parts: Vec<&str> = stack
                    .iter()
                    .skip_while(|frame| frame.as_str() != name)
                    .map(String::as_str)
                    .collect();
                parts.push(name);
                return Err(SchemaError::CyclicCall {
                    cycle: parts.join(" -> "),
                });
            }
            None => {}
        }
        marks.insert(name.to_string(), Mark::Visiting);
        stack.push(name.to_string());
        if let Some(targets) = edges.get(name) {
            for target in targets {
                if edges.contains_key(target) {
                    visit(target, edges, marks, stack)?;
                }
            }
        }
        stack.pop();
        marks.insert(name.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    for name in edges.keys() {
        let mut stack = Vec::new();
        visit(name, &edges, &mut marks, &mut stack)?;
    }
    Ok(())
}
