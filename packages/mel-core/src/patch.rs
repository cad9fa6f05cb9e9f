//! Patches: the only way state changes.
//!
//! A [`Patch`] is a `set`, `unset`, or `merge` against a data-relative
//! dot-path. Batches apply atomically: the first invalid patch rejects the
//! whole batch and the input tree is returned untouched. Within a batch,
//! later patches observe earlier mutations.
//!
//! [`diff`] recovers a canonical patch list between two trees; its output
//! order is deterministic (sorted by path), which is what scope
//! post-validation and world deltas rely on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PatchError;
use crate::value::{self, Lookup, Path, WriteFailure};

/// A single state edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    /// Write `value` at `path`, creating intermediate objects.
    Set {
        /// Data-relative target path.
        path: Path,
        /// Value to write.
        value: Value,
    },
    /// Remove the value at `path`.
    Unset {
        /// Data-relative target path.
        path: Path,
    },
    /// Deep-merge an object into the object at `path`.
    Merge {
        /// Data-relative target path.
        path: Path,
        /// Object to merge. Non-object values are rejected.
        value: Value,
    },
}

impl Patch {
    /// Convenience constructor for `set`.
    pub fn set(path: impl Into<Path>, value: Value) -> Self {
        Patch::Set { path: path.into(), value }
    }

    /// Convenience constructor for `unset`.
    pub fn unset(path: impl Into<Path>) -> Self {
        Patch::Unset { path: path.into() }
    }

    /// Convenience constructor for `merge`.
    pub fn merge(path: impl Into<Path>, value: Value) -> Self {
        Patch::Merge { path: path.into(), value }
    }

    /// The patch's target path.
    pub fn path(&self) -> &Path {
        match self {
            Patch::Set { path, .. } | Patch::Unset { path } | Patch::Merge { path, .. } => path,
        }
    }
}

/// How `unset` treats a missing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsetMode {
    /// Missing targets are a no-op.
    #[default]
    Lenient,
    /// Missing targets reject the batch.
    Strict,
}

/// Apply a batch of patches to `data`, returning the new tree.
///
/// The input is untouched; on error the batch is rejected wholesale.
pub fn apply_patches(
    data: &Value,
    patches: &[Patch],
    mode: UnsetMode,
) -> Result<Value, PatchError> {
    let mut working = data.clone();
    for patch in patches {
        apply_one(&mut working, patch, mode)?;
    }
    Ok(working)
}

/// Reject any patch whose path enters a reserved namespace.
///
/// Effect handlers go through this gate before their patches are injected.
pub fn reject_reserved(patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        if patch.path().is_reserved() {
            return Err(PatchError::ReservedNamespace {
                path: patch.path().to_string(),
            });
        }
    }
    Ok(())
}

fn apply_one(working: &mut Value, patch: &Patch, mode: UnsetMode) -> Result<(), PatchError> {
    match patch {
        Patch::Set { path, value } => {
            value::write(working, path, value.clone()).map_err(|failure| match failure {
                WriteFailure::Blocked { .. } => PatchError::PathNotFound {
                    path: path.to_string(),
                },
                WriteFailure::OutOfBounds { .. } => PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                },
            })
        }
        Patch::Unset { path } => {
            let removed = value::remove(working, path).map_err(|failure| match failure {
                WriteFailure::Blocked { .. } => PatchError::PathNotFound {
                    path: path.to_string(),
                },
                WriteFailure::OutOfBounds { .. } => PatchError::IndexOutOfBounds {
                    path: path.to_string(),
                },
            })?;
            if !removed && mode == UnsetMode::Strict {
                return Err(PatchError::UnsetMissing {
                    path: path.to_string(),
                });
            }
            Ok(())
        }
        Patch::Merge { path, value } => {
            let Value::Object(incoming) = value else {
                return Err(PatchError::MergeTypeMismatch {
                    path: path.to_string(),
                    message: "merge value is not an object".into(),
                });
            };
            let target = match value::lookup(working, path) {
                Lookup::Found(Value::Object(existing)) => {
                    let mut merged = existing.clone();
                    merge_into(&mut merged, incoming);
                    Value::Object(merged)
                }
                Lookup::Found(_) => {
                    return Err(PatchError::MergeTypeMismatch {
                        path: path.to_string(),
                        message: "merge target is not an object".into(),
                    })
                }
                Lookup::Missing => Value::Object(incoming.clone()),
                Lookup::Blocked => {
                    return Err(PatchError::PathNotFound {
                        path: path.to_string(),
                    })
                }
                Lookup::OutOfBounds => {
                    return Err(PatchError::IndexOutOfBounds {
                        path: path.to_string(),
                    })
                }
            };
            value::write(working, path, target).map_err(|_| PatchError::PathNotFound {
                path: path.to_string(),
            })
        }
    }
}

/// Recursive object merge: objects merge, everything else overwrites.
fn merge_into(target: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(nested)) => {
                merge_into(existing, nested);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Canonical patch list transforming `base` into `next`.
///
/// Object trees are descended recursively; arrays and scalars are replaced
/// wholesale when unequal. Output is ordered by path.
pub fn diff(base: &Value, next: &Value) -> Vec<Patch> {
    let mut patches = Vec::new();
    diff_inner(base, next, &Path::root(), &mut patches);
    patches.sort_by(|a, b| a.path().cmp(b.path()));
    patches
}

/// The set of paths that change between `base` and `next`.
pub fn changed_paths(base: &Value, next: &Value) -> Vec<Path> {
    diff(base, next).into_iter().map(|p| p.path().clone()).collect()
}

fn diff_inner(base: &Value, next: &Value, at: &Path, out: &mut Vec<Patch>) {
    match (base, next) {
        (Value::Object(base_map), Value::Object(next_map)) => {
            let mut keys: Vec<&String> = base_map.keys().chain(next_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = at.child(key.clone());
                match (base_map.get(key), next_map.get(key)) {
                    (Some(b), Some(n)) => diff_inner(b, n, &child, out),
                    (Some(_), None) => out.push(Patch::Unset { path: child }),
                    (None, Some(n)) => out.push(Patch::Set {
                        path: child,
                        value: n.clone(),
                    }),
                    (None, None) => unreachable!("key came from one of the maps"),
                }
            }
        }
        _ => {
            if base != next {
                out.push(Patch::Set {
                    path: at.clone(),
                    value: next.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_creates_and_overwrites() {
        let base = json!({"count": 1});
        let next = apply_patches(
            &base,
            &[
                Patch::set("count", json!(2)),
                Patch::set("user.name", json!("ada")),
            ],
            UnsetMode::default(),
        )
        .unwrap();
        assert_eq!(next, json!({"count": 2, "user": {"name": "ada"}}));
        // Input untouched.
        assert_eq!(base, json!({"count": 1}));
    }

    #[test]
    fn later_patches_observe_earlier_mutations() {
        let base = json!({});
        let next = apply_patches(
            &base,
            &[
                Patch::set("a", json!({"x": 1})),
                Patch::set("a.y", json!(2)),
            ],
            UnsetMode::default(),
        )
        .unwrap();
        assert_eq!(next, json!({"a": {"x": 1, "y": 2}}));
    }

    #[test]
    fn batch_rejects_atomically() {
        let base = json!({"count": 1});
        let err = apply_patches(
            &base,
            &[
                Patch::set("count", json!(2)),
                Patch::set("count.nested", json!(3)),
            ],
            UnsetMode::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::PathNotFound { .. }));
    }

    #[test]
    fn unset_lenient_vs_strict() {
        let base = json!({"a": 1});
        let next =
            apply_patches(&base, &[Patch::unset("missing")], UnsetMode::Lenient).unwrap();
        assert_eq!(next, base);

        let err =
            apply_patches(&base, &[Patch::unset("missing")], UnsetMode::Strict).unwrap_err();
        assert!(matches!(err, PatchError::UnsetMissing { .. }));
    }

    #[test]
    fn merge_deep_merges_objects() {
        let base = json!({"config": {"a": 1, "nested": {"x": 1}}});
        let next = apply_patches(
            &base,
            &[Patch::merge("config", json!({"b": 2, "nested": {"y": 2}}))],
            UnsetMode::default(),
        )
        .unwrap();
        assert_eq!(
            next,
            json!({"config": {"a": 1, "b": 2, "nested": {"x": 1, "y": 2}}})
        );
    }

    #[test]
    fn merge_on_array_is_rejected() {
        let base = json!({"items": [1, 2]});
        let err = apply_patches(
            &base,
            &[Patch::merge("items", json!({"a": 1}))],
            UnsetMode::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::MergeTypeMismatch { .. }));
    }

    #[test]
    fn merge_with_non_object_value_is_rejected() {
        let base = json!({"config": {}});
        let err = apply_patches(
            &base,
            &[Patch::merge("config", json!(42))],
            UnsetMode::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::MergeTypeMismatch { .. }));
    }

    #[test]
    fn merge_onto_missing_creates_object() {
        let base = json!({});
        let next = apply_patches(
            &base,
            &[Patch::merge("config", json!({"a": 1}))],
            UnsetMode::default(),
        )
        .unwrap();
        assert_eq!(next, json!({"config": {"a": 1}}));
    }

    #[test]
    fn reserved_paths_are_rejected_for_handlers() {
        let err = reject_reserved(&[Patch::set("$mel.guards.intent.x", json!(true))]).unwrap_err();
        assert!(matches!(err, PatchError::ReservedNamespace { .. }));
        reject_reserved(&[Patch::set("count", json!(1))]).unwrap();
    }

    #[test]
    fn diff_detects_set_unset_and_nested_change() {
        let base = json!({"a": 1, "b": {"x": 1, "y": 2}, "gone": true});
        let next = json!({"a": 1, "b": {"x": 9, "y": 2}, "new": "v"});
        let patches = diff(&base, &next);
        assert_eq!(
            patches,
            vec![
                Patch::set("b.x", json!(9)),
                Patch::unset("gone"),
                Patch::set("new", json!("v")),
            ]
        );
    }

    #[test]
    fn diff_replaces_arrays_wholesale() {
        let base = json!({"items": [1, 2]});
        let next = json!({"items": [1, 2, 3]});
        let patches = diff(&base, &next);
        assert_eq!(patches, vec![Patch::set("items", json!([1, 2, 3]))]);
    }

    #[test]
    fn diff_of_equal_trees_is_empty() {
        let value = json!({"a": {"b": [1, 2]}});
        assert!(diff(&value, &value).is_empty());
    }

    #[test]
    fn diff_apply_round_trip_for_disjoint_sets() {
        let base = json!({"count": 0, "name": "x"});
        let patches = vec![
            Patch::set("count", json!(5)),
            Patch::set("status", json!("ok")),
        ];
        let next = apply_patches(&base, &patches, UnsetMode::default()).unwrap();
        assert_eq!(diff(&base, &next), patches);
    }

    #[test]
    fn changed_paths_are_sorted() {
        let base = json!({"z": 1, "a": 1});
        let next = json!({"z": 2, "a": 2});
        let paths: Vec<String> = changed_paths(&base, &next)
            .iter()
            .map(Path::to_string)
            .collect();
        assert_eq!(paths, vec!["a", "z"]);
    }
}
