//! Testing utilities for host-loop tests.
//!
//! Enabled with the `testing` feature. Nothing here is part of the runtime
//! surface; it exists so integration tests (and downstream crates' tests)
//! can script effect handlers and observe the publish boundary without
//! boilerplate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use mel_core::Patch;

use crate::effects::{EffectContext, EffectHandler};
use crate::host::SnapshotPublished;

/// An effect handler built from a plain function over the resolved params.
pub struct FnEffectHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EffectHandler for FnEffectHandler<F>
where
    F: Fn(Map<String, Value>) -> Result<Vec<Patch>> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        _effect_type: &str,
        params: Map<String, Value>,
        _ctx: EffectContext,
    ) -> Result<Vec<Patch>> {
        (self.f)(params)
    }
}

/// Wrap a function as a shareable effect handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EffectHandler>
where
    F: Fn(Map<String, Value>) -> Result<Vec<Patch>> + Send + Sync + 'static,
{
    Arc::new(FnEffectHandler { f })
}

/// A handler that always returns the same patches.
pub fn static_handler(patches: Vec<Patch>) -> Arc<dyn EffectHandler> {
    handler_fn(move |_| Ok(patches.clone()))
}

/// Records publish-boundary events for assertions.
///
/// ```ignore
/// let recorder = PublishRecorder::attach(host.subscribe());
/// // ... run intents ...
/// assert_eq!(recorder.published().len(), 1);
/// ```
#[derive(Clone)]
pub struct PublishRecorder {
    events: Arc<Mutex<Vec<SnapshotPublished>>>,
}

impl PublishRecorder {
    /// Spawn a background task draining the receiver into a buffer.
    pub fn attach(mut receiver: broadcast::Receiver<SnapshotPublished>) -> Self {
        let events: Arc<Mutex<Vec<SnapshotPublished>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                if let Ok(mut buffer) = sink.lock() {
                    buffer.push(event);
                }
            }
        });
        Self { events }
    }

    /// Snapshot of everything recorded so far.
    pub fn published(&self) -> Vec<SnapshotPublished> {
        self.events
            .lock()
            .map(|buffer| buffer.clone())
            .unwrap_or_default()
    }

    /// Wait until at least `count` events have been recorded.
    ///
    /// Panics after ~2 seconds; this is a test utility.
    pub async fn wait_for(&self, count: usize) -> Vec<SnapshotPublished> {
        for _ in 0..200 {
            let events = self.published();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} published snapshots, saw {}",
            self.published().len()
        );
    }
}
