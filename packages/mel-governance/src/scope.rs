//! Approved scopes and pre/post execution validation.
//!
//! A scope constrains what an approved proposal may do: which intent types
//! it may dispatch (checked before execution) and which data paths it may
//! change, within a patch budget (checked after execution against the
//! terminal diff).
//!
//! # Path globs
//!
//! Patterns are dot-separated against the rooted path form (`data.count`):
//! - a literal segment matches itself
//! - `*` matches exactly one segment
//! - `**` matches any number of segments, including zero
//! - a trailing `.*` also matches the node itself, so `data.count.*` allows
//!   both `data.count` and everything beneath it
//!
//! Reserved sub-namespaces (`data.$host`, `data.$mel.*`) are excluded from
//! scope accounting entirely: the runtime owns them.

use serde::{Deserialize, Serialize};

use mel_core::{changed_paths, ErrorCode, ErrorValue, Path, Snapshot};

use crate::proposal::Proposal;

/// Constraint set attached to an approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedScope {
    /// Intent types the proposal may dispatch; `None` allows all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_intent_types: Option<Vec<String>>,
    /// Path globs the terminal diff must stay inside.
    pub allowed_paths: Vec<String>,
    /// Maximum number of changed paths in the terminal diff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_patch_count: Option<usize>,
}

impl ApprovedScope {
    /// A scope that allows everything.
    pub fn unrestricted() -> Self {
        Self {
            allowed_intent_types: None,
            allowed_paths: vec!["**".to_string()],
            max_patch_count: None,
        }
    }

    /// A scope allowing only the given path globs.
    pub fn paths(globs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            allowed_intent_types: None,
            allowed_paths: globs.into_iter().map(Into::into).collect(),
            max_patch_count: None,
        }
    }

    /// Restrict to specific intent types.
    pub fn with_intent_types(
        mut self,
        types: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.allowed_intent_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Bound the number of changed paths.
    pub fn with_max_patch_count(mut self, max: usize) -> Self {
        self.max_patch_count = Some(max);
        self
    }
}

/// Pre-execution validation: intent-type whitelist and structural checks.
pub fn validate_scope(proposal: &Proposal, scope: &ApprovedScope) -> Result<(), String> {
    if let Some(allowed) = &scope.allowed_intent_types {
        if !allowed.iter().any(|t| t == &proposal.intent.intent_type) {
            return Err(format!(
                "intent type '{}' is not in the approved whitelist",
                proposal.intent.intent_type
            ));
        }
    }
    if scope.allowed_paths.is_empty() {
        return Err("approved scope allows no paths".to_string());
    }
    Ok(())
}

/// Post-execution validation of the terminal diff against the scope.
///
/// Every changed non-reserved path must match an allowed glob, and the
/// number of changed paths must respect `max_patch_count`.
pub fn validate_result_scope(
    base: &Snapshot,
    terminal: &Snapshot,
    scope: &ApprovedScope,
) -> Result<(), ErrorValue> {
    let changed: Vec<Path> = changed_paths(&base.data, &terminal.data)
        .into_iter()
        .filter(|path| !path.is_reserved())
        .collect();

    let mut violations = Vec::new();
    for path in &changed {
        let rooted = format!("data.{path}");
        let allowed = scope
            .allowed_paths
            .iter()
            .any(|glob| glob_matches(glob, &rooted));
        if !allowed {
            violations.push(rooted);
        }
    }
    if !violations.is_empty() {
        return Err(ErrorValue::new(
            ErrorCode::ScopeViolation,
            format!("paths outside approved scope: {}", violations.join(", ")),
            terminal.meta.timestamp,
        ));
    }

    if let Some(max) = scope.max_patch_count {
        if changed.len() > max {
            return Err(ErrorValue::new(
                ErrorCode::ScopeViolation,
                format!("{} changed paths exceed the budget of {max}", changed.len()),
                terminal.meta.timestamp,
            ));
        }
    }
    Ok(())
}

/// Dot-segment glob matching (see module docs for semantics).
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let path: Vec<&str> = path.split('.').collect();
    segments_match(&pattern, &path)
}

fn segments_match(pattern: &[&str], path: &[&str]) -> bool {
    match (pattern.first(), path.first()) {
        (None, None) => true,
        // A trailing `*` (or `**`) also accepts the parent node itself:
        // `data.count.*` allows a change to `data.count`.
        (Some(&"*"), None) | (Some(&"**"), None) => pattern.len() == 1,
        (None, Some(_)) => false,
        (Some(_), None) => false,
        (Some(&"**"), Some(_)) => {
            segments_match(&pattern[1..], path) || segments_match(pattern, &path[1..])
        }
        (Some(&"*"), Some(_)) => segments_match(&pattern[1..], &path[1..]),
        (Some(literal), Some(segment)) => {
            literal == segment && segments_match(&pattern[1..], &path[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{ActorId, ProposalId};
    use chrono::Utc;
    use mel_core::{ContentHash, Intent, SnapshotMeta, SystemState};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn snapshot(data: Value) -> Snapshot {
        Snapshot {
            data,
            computed: BTreeMap::new(),
            system: SystemState::idle(),
            input: Value::Null,
            meta: SnapshotMeta {
                version: 1,
                timestamp: Utc::now(),
                random_seed: 0,
                schema_hash: ContentHash::from_hex("00".repeat(32)),
            },
        }
    }

    #[test]
    fn glob_literal_and_single_star() {
        assert!(glob_matches("data.count", "data.count"));
        assert!(!glob_matches("data.count", "data.other"));
        assert!(glob_matches("data.*", "data.count"));
        assert!(!glob_matches("data.*", "data.user.name"));
    }

    #[test]
    fn glob_trailing_star_includes_parent() {
        assert!(glob_matches("data.count.*", "data.count"));
        assert!(glob_matches("data.count.*", "data.count.nested"));
        assert!(!glob_matches("data.count.*", "data.other"));
    }

    #[test]
    fn glob_double_star_spans_segments() {
        assert!(glob_matches("**", "data.anything.at.all"));
        assert!(glob_matches("data.**", "data.user.name"));
        assert!(glob_matches("data.**.name", "data.user.profile.name"));
        assert!(!glob_matches("data.**.name", "data.user.profile.email"));
    }

    #[test]
    fn pre_validation_checks_intent_whitelist() {
        let proposal = Proposal {
            proposal_id: ProposalId::generate(),
            actor_id: ActorId::from("alice"),
            intent: Intent::new("reset", json!({}), "i-1"),
            base_world_id: None,
            branch_id: None,
            epoch: 1,
            created_at: Utc::now(),
        };
        let scope = ApprovedScope::unrestricted().with_intent_types(["increment"]);
        assert!(validate_scope(&proposal, &scope).is_err());

        let scope = ApprovedScope::unrestricted().with_intent_types(["reset", "increment"]);
        assert!(validate_scope(&proposal, &scope).is_ok());
    }

    #[test]
    fn post_validation_accepts_in_scope_changes() {
        let base = snapshot(json!({"count": 0}));
        let terminal = snapshot(json!({"count": 3}));
        let scope = ApprovedScope::paths(["data.count.*"]);
        assert!(validate_result_scope(&base, &terminal, &scope).is_ok());
    }

    #[test]
    fn post_validation_flags_out_of_scope_changes() {
        let base = snapshot(json!({"count": 0}));
        let terminal = snapshot(json!({"count": 0, "name": "x"}));
        let scope = ApprovedScope::paths(["data.count.*"]);
        let err = validate_result_scope(&base, &terminal, &scope).unwrap_err();
        assert_eq!(err.code, ErrorCode::ScopeViolation);
        assert!(err.message.contains("data.name"));
    }

    #[test]
    fn post_validation_ignores_reserved_namespaces() {
        let base = snapshot(json!({"count": 0}));
        let terminal = snapshot(json!({
            "count": 1,
            "$mel": {"guards": {"intent": {"abc": true}}},
        }));
        let scope = ApprovedScope::paths(["data.count.*"]);
        assert!(validate_result_scope(&base, &terminal, &scope).is_ok());
    }

    #[test]
    fn post_validation_enforces_patch_budget() {
        let base = snapshot(json!({}));
        let terminal = snapshot(json!({"a": 1, "b": 2, "c": 3}));
        let scope = ApprovedScope::unrestricted().with_max_patch_count(2);
        let err = validate_result_scope(&base, &terminal, &scope).unwrap_err();
        assert_eq!(err.code, ErrorCode::ScopeViolation);
        assert!(err.message.contains("budget"));
    }

    #[test]
    fn unrestricted_scope_allows_everything() {
        let base = snapshot(json!({}));
        let terminal = snapshot(json!({"deeply": {"nested": {"write": true}}}));
        assert!(
            validate_result_scope(&base, &terminal, &ApprovedScope::unrestricted()).is_ok()
        );
    }
}
