//! Effect registry and executor.
//!
//! Effects are the only place IO happens. Handlers are registered per effect
//! type with execution options; the executor wraps every invocation with a
//! timeout, bounded retries, and panic containment. Handlers must not throw
//! as a contract; when one does anyway (error or panic), the failure is
//! materialized as an `EFFECT_HANDLER_ERROR` with an empty patch list so
//! flow guards can branch on the recorded error.
//!
//! # The Error Boundary Rule
//!
//! `anyhow::Error` is handler-internal transport. It never crosses the
//! executor boundary: everything becomes an [`EffectOutcome`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mel_core::{
    reject_reserved, ErrorCode, ErrorValue, Patch, PatchError, Path, Requirement, Snapshot,
};

use crate::job::EffectOutcome;
use crate::HostError;

/// Effect types under this prefix are host-owned and cannot be registered by
/// users.
pub const RESERVED_EFFECT_PREFIX: &str = "system.";

/// Per-effect execution options.
#[derive(Debug, Clone, Copy)]
pub struct EffectOptions {
    /// Budget for a single handler invocation.
    pub timeout_ms: u64,
    /// Retries after a failed or timed-out invocation.
    pub retries: u32,
    /// Delay between retries.
    pub retry_delay_ms: u64,
}

impl Default for EffectOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 0,
            retry_delay_ms: 1_000,
        }
    }
}

impl EffectOptions {
    /// Set the invocation timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the delay between retries.
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: u64) -> Self {
        self.retry_delay_ms = retry_delay_ms;
        self
    }
}

/// Context handed to an effect handler.
///
/// Deliberately narrow: the snapshot to read, a cancellation signal to
/// honor, and nothing else. Handlers return patches; they never touch the
/// mailbox or the canonical snapshot directly.
#[derive(Clone)]
pub struct EffectContext {
    /// Post-apply snapshot the requirement was dispatched from.
    pub snapshot: Arc<Snapshot>,
    /// Cancelled when the intent is cancelled or times out.
    pub cancel: CancellationToken,
}

/// Builder for handler result patches that refuses reserved namespaces at
/// construction time.
#[derive(Debug, Default)]
pub struct PatchBatch {
    patches: Vec<Patch>,
}

impl PatchBatch {
    /// Start an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `set` patch.
    pub fn set(mut self, path: &str, value: Value) -> Result<Self, PatchError> {
        let path = Path::parse(path);
        Self::check(&path)?;
        self.patches.push(Patch::Set { path, value });
        Ok(self)
    }

    /// Add an `unset` patch.
    pub fn unset(mut self, path: &str) -> Result<Self, PatchError> {
        let path = Path::parse(path);
        Self::check(&path)?;
        self.patches.push(Patch::Unset { path });
        Ok(self)
    }

    /// Add a `merge` patch.
    pub fn merge(mut self, path: &str, value: Value) -> Result<Self, PatchError> {
        let path = Path::parse(path);
        Self::check(&path)?;
        self.patches.push(Patch::Merge { path, value });
        Ok(self)
    }

    /// Finish the batch.
    pub fn into_patches(self) -> Vec<Patch> {
        self.patches
    }

    fn check(path: &Path) -> Result<(), PatchError> {
        if path.is_reserved() {
            return Err(PatchError::ReservedNamespace {
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

/// An effect handler: async IO in, patches out.
#[async_trait]
pub trait EffectHandler: Send + Sync + 'static {
    /// Execute the effect.
    ///
    /// Handlers should express domain-level failure as data (patches), and
    /// reserve `Err` for infrastructure failure. Returned patches may not
    /// target reserved namespaces.
    async fn handle(
        &self,
        effect_type: &str,
        params: Map<String, Value>,
        ctx: EffectContext,
    ) -> Result<Vec<Patch>>;
}

struct RegisteredEffect {
    handler: Arc<dyn EffectHandler>,
    options: EffectOptions,
}

/// Registry of effect handlers keyed by effect type.
#[derive(Default)]
pub struct EffectRegistry {
    entries: DashMap<String, RegisteredEffect>,
}

impl EffectRegistry {
    /// Create an empty registry with the built-in `system.*` handlers.
    pub fn new() -> Self {
        let registry = Self {
            entries: DashMap::new(),
        };
        registry.register_builtin("system.get", Arc::new(SystemGetHandler));
        registry
    }

    /// Register a user handler.
    ///
    /// Reserved types and duplicate registrations are errors.
    pub fn register(
        &self,
        effect_type: &str,
        handler: Arc<dyn EffectHandler>,
        options: EffectOptions,
    ) -> Result<(), HostError> {
        if effect_type.starts_with(RESERVED_EFFECT_PREFIX) {
            return Err(HostError::ReservedEffectType {
                effect_type: effect_type.to_string(),
            });
        }
        if self.entries.contains_key(effect_type) {
            return Err(HostError::DuplicateEffect {
                effect_type: effect_type.to_string(),
            });
        }
        self.entries.insert(
            effect_type.to_string(),
            RegisteredEffect { handler, options },
        );
        Ok(())
    }

    fn register_builtin(&self, effect_type: &str, handler: Arc<dyn EffectHandler>) {
        self.entries.insert(
            effect_type.to_string(),
            RegisteredEffect {
                handler,
                options: EffectOptions::default(),
            },
        );
    }

    /// True when a handler exists for the type.
    pub fn contains(&self, effect_type: &str) -> bool {
        self.entries.contains_key(effect_type)
    }

    /// Execute a requirement's effect with timeout, retries, and panic
    /// containment. Returns `None` when no handler is registered.
    pub async fn execute(&self, requirement: &Requirement, ctx: EffectContext) -> Option<EffectOutcome> {
        let (handler, options) = {
            let entry = self.entries.get(&requirement.effect_type)?;
            (entry.handler.clone(), entry.options)
        };
        Some(run_with_policy(handler, options, requirement, ctx).await)
    }
}

async fn run_with_policy(
    handler: Arc<dyn EffectHandler>,
    options: EffectOptions,
    requirement: &Requirement,
    ctx: EffectContext,
) -> EffectOutcome {
    let budget = Duration::from_millis(options.timeout_ms);
    let attempts = options.retries + 1;
    let mut last_failure: Option<ErrorValue> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(options.retry_delay_ms)).await;
        }
        if ctx.cancel.is_cancelled() {
            return EffectOutcome::Failed(ErrorValue::new(
                ErrorCode::Cancelled,
                format!("effect '{}' cancelled", requirement.effect_type),
                Utc::now(),
            ));
        }

        let invocation = handler.handle(
            &requirement.effect_type,
            requirement.params.clone(),
            ctx.clone(),
        );
        let caught = std::panic::AssertUnwindSafe(invocation).catch_unwind();
        match tokio::time::timeout(budget, caught).await {
            Ok(Ok(Ok(patches))) => {
                if let Err(err) = reject_reserved(&patches) {
                    // A handler targeting reserved namespaces is a contract
                    // violation, not a retryable fault.
                    return EffectOutcome::Failed(ErrorValue::new(
                        ErrorCode::EffectHandlerError,
                        format!(
                            "effect '{}' returned a reserved-path patch: {err}",
                            requirement.effect_type
                        ),
                        Utc::now(),
                    ));
                }
                debug!(
                    effect_type = %requirement.effect_type,
                    requirement_id = %requirement.id,
                    patches = patches.len(),
                    "effect completed"
                );
                return EffectOutcome::Patches(patches);
            }
            Ok(Ok(Err(error))) => {
                warn!(
                    effect_type = %requirement.effect_type,
                    attempt,
                    error = %error,
                    "effect handler returned an error"
                );
                last_failure = Some(ErrorValue::new(
                    ErrorCode::EffectHandlerError,
                    format!("effect '{}' failed: {error}", requirement.effect_type),
                    Utc::now(),
                ));
            }
            Ok(Err(_panic)) => {
                warn!(
                    effect_type = %requirement.effect_type,
                    attempt,
                    "effect handler panicked"
                );
                last_failure = Some(ErrorValue::new(
                    ErrorCode::EffectHandlerError,
                    format!("effect '{}' panicked", requirement.effect_type),
                    Utc::now(),
                ));
            }
            Err(_elapsed) => {
                warn!(
                    effect_type = %requirement.effect_type,
                    attempt,
                    timeout_ms = options.timeout_ms,
                    "effect handler timed out"
                );
                last_failure = Some(ErrorValue::new(
                    ErrorCode::EffectTimeout,
                    format!(
                        "effect '{}' exceeded {}ms",
                        requirement.effect_type, options.timeout_ms
                    ),
                    Utc::now(),
                ));
            }
        }
    }

    EffectOutcome::Failed(last_failure.unwrap_or_else(|| {
        ErrorValue::new(
            ErrorCode::EffectHandlerError,
            format!("effect '{}' failed", requirement.effect_type),
            Utc::now(),
        )
    }))
}

/// Built-in `system.get`: copy a snapshot data value to another path.
///
/// Params: `path` (source, data-relative), `into` (target, data-relative).
struct SystemGetHandler;

#[async_trait]
impl EffectHandler for SystemGetHandler {
    async fn handle(
        &self,
        _effect_type: &str,
        params: Map<String, Value>,
        ctx: EffectContext,
    ) -> Result<Vec<Patch>> {
        let source = params
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("system.get requires a 'path' param"))?;
        let target = params
            .get("into")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("system.get requires an 'into' param"))?;
        let value = ctx
            .snapshot
            .data
            .pointer(&format!("/{}", source.replace('.', "/")))
            .cloned()
            .unwrap_or(Value::Null);
        Ok(PatchBatch::new().set(target, value)?.into_patches())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mel_core::{ContentHash, NodePath};
    use serde_json::json;
    use std::collections::BTreeMap;

    struct OkHandler(Vec<Patch>);

    #[async_trait]
    impl EffectHandler for OkHandler {
        async fn handle(
            &self,
            _effect_type: &str,
            _params: Map<String, Value>,
            _ctx: EffectContext,
        ) -> Result<Vec<Patch>> {
            Ok(self.0.clone())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl EffectHandler for FailingHandler {
        async fn handle(
            &self,
            _effect_type: &str,
            _params: Map<String, Value>,
            _ctx: EffectContext,
        ) -> Result<Vec<Patch>> {
            anyhow::bail!("backend unavailable")
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl EffectHandler for PanickingHandler {
        async fn handle(
            &self,
            _effect_type: &str,
            _params: Map<String, Value>,
            _ctx: EffectContext,
        ) -> Result<Vec<Patch>> {
            panic!("handler bug")
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl EffectHandler for SlowHandler {
        async fn handle(
            &self,
            _effect_type: &str,
            _params: Map<String, Value>,
            _ctx: EffectContext,
        ) -> Result<Vec<Patch>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn requirement(effect_type: &str) -> Requirement {
        Requirement {
            id: mel_core::requirement_id(
                &ContentHash::from_hex("00".repeat(32)),
                "i-1",
                "action",
                &NodePath::from_indices([0]),
            )
            .unwrap(),
            effect_type: effect_type.to_string(),
            params: Map::new(),
            action_id: "action".into(),
            flow_position: NodePath::from_indices([0]),
            created_at: Utc::now(),
        }
    }

    fn ctx() -> EffectContext {
        let snapshot = Snapshot {
            data: json!({"user": {"name": "ada"}}),
            computed: BTreeMap::new(),
            system: mel_core::SystemState::idle(),
            input: Value::Null,
            meta: mel_core::SnapshotMeta {
                version: 1,
                timestamp: Utc::now(),
                random_seed: 0,
                schema_hash: ContentHash::from_hex("00".repeat(32)),
            },
        };
        EffectContext {
            snapshot: Arc::new(snapshot),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn reserved_registration_is_rejected() {
        let registry = EffectRegistry::new();
        let err = registry
            .register("system.sneaky", Arc::new(OkHandler(Vec::new())), EffectOptions::default())
            .unwrap_err();
        assert!(matches!(err, HostError::ReservedEffectType { .. }));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = EffectRegistry::new();
        registry
            .register("api.fetch", Arc::new(OkHandler(Vec::new())), EffectOptions::default())
            .unwrap();
        let err = registry
            .register("api.fetch", Arc::new(OkHandler(Vec::new())), EffectOptions::default())
            .unwrap_err();
        assert!(matches!(err, HostError::DuplicateEffect { .. }));
    }

    #[tokio::test]
    async fn missing_handler_returns_none() {
        let registry = EffectRegistry::new();
        assert!(registry.execute(&requirement("api.ghost"), ctx()).await.is_none());
    }

    #[tokio::test]
    async fn successful_execution_returns_patches() {
        let registry = EffectRegistry::new();
        registry
            .register(
                "api.fetch",
                Arc::new(OkHandler(vec![Patch::set("status", json!("ok"))])),
                EffectOptions::default(),
            )
            .unwrap();
        let outcome = registry.execute(&requirement("api.fetch"), ctx()).await.unwrap();
        match outcome {
            EffectOutcome::Patches(patches) => assert_eq!(patches.len(), 1),
            other => panic!("expected patches, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_materializes_as_effect_handler_error() {
        let registry = EffectRegistry::new();
        registry
            .register("api.flaky", Arc::new(FailingHandler), EffectOptions::default())
            .unwrap();
        let outcome = registry.execute(&requirement("api.flaky"), ctx()).await.unwrap();
        match outcome {
            EffectOutcome::Failed(error) => {
                assert_eq!(error.code, ErrorCode::EffectHandlerError);
                assert!(error.message.contains("backend unavailable"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let registry = EffectRegistry::new();
        registry
            .register("api.buggy", Arc::new(PanickingHandler), EffectOptions::default())
            .unwrap();
        let outcome = registry.execute(&requirement("api.buggy"), ctx()).await.unwrap();
        match outcome {
            EffectOutcome::Failed(error) => {
                assert_eq!(error.code, ErrorCode::EffectHandlerError);
                assert!(error.message.contains("panicked"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_materializes_as_effect_timeout() {
        let registry = EffectRegistry::new();
        registry
            .register(
                "api.slow",
                Arc::new(SlowHandler),
                EffectOptions::default().with_timeout_ms(50),
            )
            .unwrap();
        let outcome = registry.execute(&requirement("api.slow"), ctx()).await.unwrap();
        match outcome {
            EffectOutcome::Failed(error) => assert_eq!(error.code, ErrorCode::EffectTimeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_then_fail() {
        struct CountingHandler(std::sync::atomic::AtomicU32);

        #[async_trait]
        impl EffectHandler for CountingHandler {
            async fn handle(
                &self,
                _effect_type: &str,
                _params: Map<String, Value>,
                _ctx: EffectContext,
            ) -> Result<Vec<Patch>> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                anyhow::bail!("still broken")
            }
        }

        let handler = Arc::new(CountingHandler(std::sync::atomic::AtomicU32::new(0)));
        let registry = EffectRegistry::new();
        registry
            .register(
                "api.retry",
                handler.clone(),
                EffectOptions::default().with_retries(2).with_retry_delay_ms(1),
            )
            .unwrap();
        let outcome = registry.execute(&requirement("api.retry"), ctx()).await.unwrap();
        assert!(matches!(outcome, EffectOutcome::Failed(_)));
        assert_eq!(handler.0.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reserved_path_patches_are_rejected() {
        let registry = EffectRegistry::new();
        registry
            .register(
                "api.sneaky",
                Arc::new(OkHandler(vec![Patch::set("$mel.guards.intent.x", json!(true))])),
                EffectOptions::default(),
            )
            .unwrap();
        let outcome = registry.execute(&requirement("api.sneaky"), ctx()).await.unwrap();
        match outcome {
            EffectOutcome::Failed(error) => {
                assert_eq!(error.code, ErrorCode::EffectHandlerError);
                assert!(error.message.contains("reserved"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn system_get_copies_values() {
        let registry = EffectRegistry::new();
        let mut params = Map::new();
        params.insert("path".into(), json!("user.name"));
        params.insert("into".into(), json!("copied"));
        let mut req = requirement("system.get");
        req.params = params;
        let outcome = registry.execute(&req, ctx()).await.unwrap();
        match outcome {
            EffectOutcome::Patches(patches) => {
                assert_eq!(patches, vec![Patch::set("copied", json!("ada"))]);
            }
            other => panic!("expected patches, got {other:?}"),
        }
    }

    #[test]
    fn patch_batch_refuses_reserved_paths() {
        let err = PatchBatch::new().set("$host.slot", json!(1)).unwrap_err();
        assert!(matches!(err, PatchError::ReservedNamespace { .. }));
        let patches = PatchBatch::new()
            .set("a", json!(1))
            .unwrap()
            .unset("b")
            .unwrap()
            .into_patches();
        assert_eq!(patches.len(), 2);
    }
}
