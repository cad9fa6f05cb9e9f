//! End-to-end host-loop behavior: intents in, terminal snapshots out.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use mel_core::{
    ActionSpec, ComputedSection, ErrorCode, Expr, FieldSpec, FieldType, FlowNode, Intent, Patch,
    Schema, SchemaDef, StateSection,
};
use mel_host::testing::{handler_fn, static_handler, PublishRecorder};
use mel_host::{
    CancellationToken, EffectOptions, ExecutionKey, Host, HostOptions, IntentOutcome,
    SchedulerOptions, SubmitOptions,
};

fn counter_schema() -> Schema {
    let mut state = BTreeMap::new();
    state.insert(
        "count".to_string(),
        FieldSpec {
            field_type: FieldType::Int,
            required: true,
            default: Some(json!(0)),
        },
    );
    let mut actions = BTreeMap::new();
    actions.insert(
        "increment".to_string(),
        ActionSpec {
            flow: FlowNode::seq(vec![FlowNode::patch_set(
                "count",
                Expr::add(Expr::get("data.count"), Expr::lit(1)),
            )]),
            input: None,
        },
    );
    let mut reset_input = BTreeMap::new();
    reset_input.insert(
        "value".to_string(),
        FieldSpec {
            field_type: FieldType::Int,
            required: true,
            default: None,
        },
    );
    actions.insert(
        "reset".to_string(),
        ActionSpec {
            flow: FlowNode::seq(vec![FlowNode::patch_set("count", Expr::get("input.value"))]),
            input: Some(reset_input),
        },
    );
    actions.insert(
        "decrement".to_string(),
        ActionSpec {
            flow: FlowNode::seq(vec![FlowNode::when(
                Expr::gt(Expr::get("data.count"), Expr::lit(0)),
                vec![FlowNode::patch_set(
                    "count",
                    Expr::sub(Expr::get("data.count"), Expr::lit(1)),
                )],
            )]),
            input: None,
        },
    );
    Schema::load(SchemaDef {
        id: "counter".into(),
        version: "1.0.0".into(),
        state: StateSection { fields: state },
        computed: ComputedSection::default(),
        actions,
    })
    .unwrap()
}

fn fetch_schema() -> Schema {
    let mut state = BTreeMap::new();
    for (name, default) in [
        ("user", Value::Null),
        ("status", json!("idle")),
        ("error", Value::Null),
    ] {
        state.insert(
            name.to_string(),
            FieldSpec {
                field_type: FieldType::Any,
                required: false,
                default: Some(default),
            },
        );
    }
    let mut actions = BTreeMap::new();
    actions.insert(
        "fetchUser".to_string(),
        ActionSpec {
            flow: FlowNode::seq(vec![
                FlowNode::patch_set("status", Expr::lit("loading")),
                FlowNode::effect("api.fetchUser", vec![("userId", Expr::get("input.userId"))]),
            ]),
            input: None,
        },
    );
    Schema::load(SchemaDef {
        id: "fetch".into(),
        version: "1.0.0".into(),
        state: StateSection { fields: state },
        computed: ComputedSection::default(),
        actions,
    })
    .unwrap()
}

fn multi_effect_schema() -> Schema {
    let mut state = BTreeMap::new();
    for (name, default) in [
        ("firstDone", json!(false)),
        ("secondDone", json!(false)),
        ("steps", json!([])),
        ("finalCount", json!(0)),
    ] {
        state.insert(
            name.to_string(),
            FieldSpec {
                field_type: FieldType::Any,
                required: false,
                default: Some(default),
            },
        );
    }
    let mut actions = BTreeMap::new();
    actions.insert(
        "runBoth".to_string(),
        ActionSpec {
            flow: FlowNode::seq(vec![
                FlowNode::effect("step.first", vec![]),
                FlowNode::effect("step.second", vec![]),
                FlowNode::patch_set("finalCount", Expr::lit(2)),
            ]),
            input: None,
        },
    );
    Schema::load(SchemaDef {
        id: "multi".into(),
        version: "1.0.0".into(),
        state: StateSection { fields: state },
        computed: ComputedSection::default(),
        actions,
    })
    .unwrap()
}

fn deterministic_options() -> HostOptions {
    HostOptions {
        seed: Some(7),
        ..HostOptions::default()
    }
}

#[tokio::test]
async fn counter_sequential_reaches_expected_totals() {
    let host = Host::builder(counter_schema())
        .with_options(deterministic_options())
        .build();
    let key = ExecutionKey::from("counter");

    for i in 0..3 {
        let outcome = host
            .submit(
                key.clone(),
                Intent::new("increment", json!({}), format!("i-{i}")),
                None,
                SubmitOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.is_completed());
    }
    assert_eq!(host.snapshot(&key).unwrap().data["count"], json!(3));

    host.submit(
        key.clone(),
        Intent::new("reset", json!({"value": 100}), "r-1"),
        None,
        SubmitOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(host.snapshot(&key).unwrap().data["count"], json!(100));

    host.submit(
        key.clone(),
        Intent::new("decrement", json!({}), "d-1"),
        None,
        SubmitOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(host.snapshot(&key).unwrap().data["count"], json!(99));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_on_one_key_serialize() {
    let host = Host::builder(counter_schema())
        .with_options(deterministic_options())
        .build();
    let key = ExecutionKey::from("contended");

    let mut handles = Vec::new();
    for i in 0..20 {
        let host = host.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            host.submit(
                key,
                Intent::new("increment", json!({}), format!("i-{i}")),
                None,
                SubmitOptions::default(),
            )
            .await
            .unwrap()
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_completed());
    }
    // Lost updates would show here: each increment reads the canonical
    // snapshot, so racing runners would collapse increments together.
    assert_eq!(host.snapshot(&key).unwrap().data["count"], json!(20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_keys_run_independently() {
    let host = Host::builder(counter_schema())
        .with_options(deterministic_options())
        .build();

    let mut handles = Vec::new();
    for k in 0..4 {
        let host = host.clone();
        handles.push(tokio::spawn(async move {
            let key = ExecutionKey::new(format!("key-{k}"));
            for i in 0..5 {
                host.submit(
                    key.clone(),
                    Intent::new("increment", json!({}), format!("i-{k}-{i}")),
                    None,
                    SubmitOptions::default(),
                )
                .await
                .unwrap();
            }
            key
        }));
    }
    for handle in handles {
        let key = handle.await.unwrap();
        assert_eq!(host.snapshot(&key).unwrap().data["count"], json!(5));
    }
}

#[tokio::test]
async fn effect_round_trip_success_and_domain_failure() {
    let handler = handler_fn(|params| {
        let user_id = params
            .get("userId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if user_id == "123" {
            Ok(vec![
                Patch::set("user", json!({"id": "123", "name": "Ada"})),
                Patch::set("status", json!("success")),
            ])
        } else {
            Ok(vec![
                Patch::set("status", json!("error")),
                Patch::set("error", json!(format!("User {user_id} not found"))),
            ])
        }
    });
    let host = Host::builder(fetch_schema())
        .with_options(deterministic_options())
        .with_effect("api.fetchUser", handler)
        .build();

    let outcome = host
        .submit(
            ExecutionKey::from("fetch-ok"),
            Intent::new("fetchUser", json!({"userId": "123"}), "f-1"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    let snapshot = outcome.snapshot().unwrap();
    assert!(outcome.is_completed());
    assert_eq!(snapshot.data["status"], json!("success"));
    assert_eq!(snapshot.data["user"]["id"], json!("123"));

    let outcome = host
        .submit(
            ExecutionKey::from("fetch-missing"),
            Intent::new("fetchUser", json!({"userId": "999"}), "f-2"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    // Domain-level failure is data, not an exception.
    assert!(outcome.is_completed());
    let snapshot = outcome.snapshot().unwrap();
    assert_eq!(snapshot.data["status"], json!("error"));
    assert_eq!(snapshot.data["error"], json!("User 999 not found"));
}

#[tokio::test]
async fn multi_effect_interleaving_publishes_once() {
    let first = handler_fn(|_| {
        Ok(vec![
            Patch::set("firstDone", json!(true)),
            Patch::set("steps", json!(["first"])),
        ])
    });
    let second = handler_fn(|_| {
        Ok(vec![
            Patch::set("secondDone", json!(true)),
            Patch::set("steps", json!(["first", "second"])),
        ])
    });
    let host = Host::builder(multi_effect_schema())
        .with_options(deterministic_options())
        .with_effect("step.first", first)
        .with_effect("step.second", second)
        .build();
    let recorder = PublishRecorder::attach(host.subscribe());

    let outcome = host
        .submit(
            ExecutionKey::from("multi"),
            Intent::new("runBoth", json!({}), "m-1"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let events = recorder.wait_for(1).await;
    // Exactly one publish for the whole intent, with the terminal snapshot
    // reflecting both effects and the final patch.
    assert_eq!(events.len(), 1);
    let snapshot = &events[0].snapshot;
    assert_eq!(snapshot.data["firstDone"], json!(true));
    assert_eq!(snapshot.data["secondDone"], json!(true));
    assert_eq!(snapshot.data["steps"], json!(["first", "second"]));
    assert_eq!(snapshot.data["finalCount"], json!(2));
}

#[tokio::test]
async fn unknown_effect_fails_the_intent() {
    let host = Host::builder(fetch_schema())
        .with_options(deterministic_options())
        .build();
    let outcome = host
        .submit(
            ExecutionKey::from("no-handler"),
            Intent::new("fetchUser", json!({"userId": "123"}), "f-1"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    match outcome {
        IntentOutcome::Failed { error, snapshot } => {
            assert_eq!(error.code, ErrorCode::UnknownEffect);
            assert!(snapshot.is_some());
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn handler_failure_is_recorded_and_flow_finishes() {
    let handler = handler_fn(|_| anyhow::bail!("backend down"));
    let host = Host::builder(fetch_schema())
        .with_options(deterministic_options())
        .with_effect("api.fetchUser", handler)
        .build();
    let outcome = host
        .submit(
            ExecutionKey::from("failing"),
            Intent::new("fetchUser", json!({"userId": "123"}), "f-1"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    // The effect failed, the failure was injected as an empty patch list,
    // and the flow ran to completion past the fulfilled requirement.
    assert!(outcome.is_completed());
    let snapshot = outcome.snapshot().unwrap();
    assert_eq!(snapshot.data["status"], json!("loading"));
    assert!(snapshot
        .system
        .errors
        .iter()
        .any(|e| e.code == ErrorCode::EffectHandlerError));
}

#[tokio::test]
async fn iteration_bound_is_enforced() {
    let handler = static_handler(vec![Patch::set("status", json!("success"))]);
    let host = Host::builder(fetch_schema())
        .with_options(HostOptions {
            seed: Some(7),
            scheduler: SchedulerOptions {
                default_timeout_ms: None,
                max_iterations: 0,
            },
            ..HostOptions::default()
        })
        .with_effect("api.fetchUser", handler)
        .build();
    let outcome = host
        .submit(
            ExecutionKey::from("bounded"),
            Intent::new("fetchUser", json!({"userId": "123"}), "f-1"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    match outcome {
        IntentOutcome::Failed { error, .. } => {
            assert_eq!(error.code, ErrorCode::LoopMaxIterations);
        }
        other => panic!("expected iteration-bound failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn intent_deadline_resolves_hung_effects() {
    let host = Host::builder(fetch_schema())
        .with_options(deterministic_options())
        .try_with_effect(
            "api.fetchUser",
            sleepy_handler(),
            EffectOptions::default().with_timeout_ms(120_000),
        )
        .unwrap()
        .build();

    let outcome = host
        .submit(
            ExecutionKey::from("deadline"),
            Intent::new("fetchUser", json!({"userId": "123"}), "f-1"),
            None,
            SubmitOptions {
                cancel: None,
                timeout_ms: Some(50),
            },
        )
        .await
        .unwrap();
    match outcome {
        IntentOutcome::Failed { error, .. } => assert_eq!(error.code, ErrorCode::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

fn sleepy_handler() -> std::sync::Arc<dyn mel_host::EffectHandler> {
    struct Sleepy;

    #[mel_host::async_trait]
    impl mel_host::EffectHandler for Sleepy {
        async fn handle(
            &self,
            _effect_type: &str,
            _params: serde_json::Map<String, Value>,
            _ctx: mel_host::EffectContext,
        ) -> anyhow::Result<Vec<Patch>> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(vec![])
        }
    }

    Arc::new(Sleepy)
}

#[tokio::test]
async fn cancellation_resolves_at_next_scheduling_point() {
    struct CancelAware;

    #[mel_host::async_trait]
    impl mel_host::EffectHandler for CancelAware {
        async fn handle(
            &self,
            _effect_type: &str,
            _params: serde_json::Map<String, Value>,
            ctx: mel_host::EffectContext,
        ) -> anyhow::Result<Vec<Patch>> {
            ctx.cancel.cancelled().await;
            Ok(vec![])
        }
    }

    let host = Host::builder(fetch_schema())
        .with_options(deterministic_options())
        .with_effect("api.fetchUser", Arc::new(CancelAware))
        .build();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        token.cancel();
    });

    let outcome = host
        .submit(
            ExecutionKey::from("cancelled"),
            Intent::new("fetchUser", json!({"userId": "123"}), "f-1"),
            None,
            SubmitOptions {
                cancel: Some(cancel),
                timeout_ms: None,
            },
        )
        .await
        .unwrap();
    match outcome {
        IntentOutcome::Failed { error, .. } => assert_eq!(error.code, ErrorCode::Cancelled),
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[tokio::test]
async fn host_patches_apply_outside_intents() {
    let host = Host::builder(counter_schema())
        .with_options(deterministic_options())
        .build();
    let key = ExecutionKey::from("hostpatch");

    host.apply_patches(key.clone(), vec![Patch::set("count", json!(41))], "seed")
        .await
        .unwrap();
    let outcome = host
        .submit(
            key.clone(),
            Intent::new("increment", json!({}), "i-1"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.snapshot().unwrap().data["count"], json!(42));
}

#[tokio::test]
async fn once_guard_converges_across_host_dispatches() {
    let mut actions = BTreeMap::new();
    actions.insert(
        "incrementOnce".to_string(),
        ActionSpec {
            flow: FlowNode::once(vec![FlowNode::patch_set(
                "count",
                Expr::add(Expr::get("data.count"), Expr::lit(1)),
            )]),
            input: None,
        },
    );
    let mut state = BTreeMap::new();
    state.insert(
        "count".to_string(),
        FieldSpec {
            field_type: FieldType::Int,
            required: true,
            default: Some(json!(0)),
        },
    );
    let schema = Schema::load(SchemaDef {
        id: "once".into(),
        version: "1".into(),
        state: StateSection { fields: state },
        computed: ComputedSection::default(),
        actions,
    })
    .unwrap();

    let host = Host::builder(schema)
        .with_options(deterministic_options())
        .build();
    let key = ExecutionKey::from("once");

    for _ in 0..2 {
        host.submit(
            key.clone(),
            Intent::new("incrementOnce", json!({}), "abc"),
            None,
            SubmitOptions::default(),
        )
        .await
        .unwrap();
    }
    assert_eq!(host.snapshot(&key).unwrap().data["count"], json!(1));

    host.submit(
        key.clone(),
        Intent::new("incrementOnce", json!({}), "def"),
        None,
        SubmitOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(host.snapshot(&key).unwrap().data["count"], json!(2));
}
