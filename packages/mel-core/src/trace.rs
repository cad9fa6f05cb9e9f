//! Evaluation trace graph.
//!
//! When tracing is enabled, every flow node and expression evaluated during a
//! compute pass records a node in a tree-shaped [`TraceGraph`]. Node ids are
//! allocated in evaluation order (plain indices), so two identical compute
//! passes produce identical trace ids. Tracing never influences snapshot
//! output; with tracing disabled the builder is a set of no-ops.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

/// A single trace node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceNode {
    /// Evaluation-order index. Deterministic for identical inputs.
    pub id: u32,
    /// Node kind, e.g. `flow:seq`, `flow:patch`, `expr:add`.
    pub kind: String,
    /// Source location: flow node path or expression operator detail.
    pub source: String,
    /// Input summary, when the node has a meaningful one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Output value or outcome summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Child node ids, in evaluation order.
    pub children: SmallVec<[u32; 4]>,
}

/// The complete trace of one compute pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceGraph {
    /// All nodes, indexed by id.
    pub nodes: Vec<TraceNode>,
    /// Ids of root nodes (no parent).
    pub roots: SmallVec<[u32; 4]>,
}

impl TraceGraph {
    /// Look up a node by id.
    pub fn node(&self, id: u32) -> Option<&TraceNode> {
        self.nodes.get(id as usize)
    }

    /// Number of recorded nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Incremental trace construction with an open-node stack.
///
/// A disabled builder allocates nothing and records nothing.
#[derive(Debug)]
pub struct TraceBuilder {
    enabled: bool,
    graph: TraceGraph,
    stack: Vec<u32>,
}

impl TraceBuilder {
    /// Create a builder; `enabled = false` yields a no-op builder.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            graph: TraceGraph::default(),
            stack: Vec::new(),
        }
    }

    /// Whether tracing is on.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Open a node and push it on the stack. Returns its id when enabled.
    pub fn open(&mut self, kind: &str, source: impl Into<String>) -> Option<u32> {
        if !self.enabled {
            return None;
        }
        let id = u32::try_from(self.graph.nodes.len()).unwrap_or(u32::MAX);
        self.graph.nodes.push(TraceNode {
            id,
            kind: kind.to_string(),
            source: source.into(),
            input: None,
            output: None,
            children: SmallVec::new(),
        });
        match self.stack.last() {
            Some(parent) => {
                let parent = *parent as usize;
                self.graph.nodes[parent].children.push(id);
            }
            None => self.graph.roots.push(id),
        }
        self.stack.push(id);
        Some(id)
    }

    /// Record the input of the currently open node.
    pub fn input(&mut self, value: Value) {
        if let Some(&id) = self.stack.last() {
            self.graph.nodes[id as usize].input = Some(value);
        }
    }

    /// Close the currently open node, recording its output.
    pub fn close(&mut self, output: Option<Value>) {
        if let Some(id) = self.stack.pop() {
            self.graph.nodes[id as usize].output = output;
        }
    }

    /// Record a closed leaf node in one step.
    pub fn leaf(&mut self, kind: &str, source: impl Into<String>, output: Option<Value>) {
        if self.open(kind, source).is_some() {
            self.close(output);
        }
    }

    /// Finish and return the graph.
    pub fn finish(self) -> TraceGraph {
        self.graph
    }
}
