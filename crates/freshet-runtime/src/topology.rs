//! Topology: the registry of running nodes
//!
//! Mutations (adding, removing, rewiring nodes) serialize on the topology
//! lock; traversal works on cloned `Arc` handles so running nodes never
//! block on the registry.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::fanin::FanIn;
use crate::fanout::FanOut;
use crate::sink::Sink;
use crate::source::Source;
use freshet_core::{Map, Value};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// What a node is: producer, transformer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Source,
    Box,
    Sink,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Source => write!(f, "source"),
            NodeKind::Box => write!(f, "box"),
            NodeKind::Sink => write!(f, "sink"),
        }
    }
}

/// Lifecycle state of a node. The order matters: waiting on a state means
/// waiting until the node reaches it or any later state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Initialized,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Initialized => "initialized",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Paused => "paused",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Observable node state. Readers wait for a required state without
/// spinning; writers just publish.
pub struct StateHolder {
    tx: watch::Sender<NodeState>,
}

impl StateHolder {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(NodeState::Initialized);
        Self { tx }
    }

    pub fn get(&self) -> NodeState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: NodeState) {
        self.tx.send_replace(state);
    }

    /// Waits until the state is `target` or later.
    pub async fn wait_for(&self, target: NodeState) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|s| *s >= target).await;
    }
}

impl Default for StateHolder {
    fn default() -> Self {
        Self::new()
    }
}

/// Node-specific behavior handle.
pub enum NodeBody {
    Source(Arc<dyn Source>),
    /// Box state lives in the writer chain of its fan-ins.
    Box,
    Sink(Arc<dyn Sink>),
}

/// One node of a running topology.
pub struct TopologyNode {
    pub name: String,
    pub kind: NodeKind,
    /// Source lifecycle; boxes and sinks derive their state from fan-ins.
    pub source_state: Option<Arc<StateHolder>>,
    /// One fan-in per sub-select for UNION ALL boxes, one for sinks, none
    /// for sources.
    pub fan_ins: Vec<Arc<FanIn>>,
    /// Sinks have no fan-out.
    pub fan_out: Option<Arc<FanOut>>,
    pub body: NodeBody,
}

impl TopologyNode {
    pub fn state(&self) -> NodeState {
        if let Some(holder) = &self.source_state {
            return holder.get();
        }
        self.fan_ins
            .iter()
            .map(|f| f.state().get())
            .min()
            .unwrap_or(NodeState::Stopped)
    }

    pub async fn wait_stopped(&self) {
        if let Some(holder) = &self.source_state {
            holder.wait_for(NodeState::Stopped).await;
        }
        for fan_in in &self.fan_ins {
            fan_in.state().wait_for(NodeState::Stopped).await;
        }
    }

    /// Stops the node: inputs close, in-flight work winds down, outputs
    /// close, and the call returns once the node reports stopped.
    pub async fn stop(&self, ctx: &Context) {
        match &self.body {
            NodeBody::Source(source) => {
                source.stop(ctx).await;
                if let Some(fan_out) = &self.fan_out {
                    // Unblock a generate() parked on a paused or full output.
                    fan_out.set_paused(false);
                }
            }
            NodeBody::Box => {
                for fan_in in &self.fan_ins {
                    fan_in.stop().await;
                }
                if let Some(fan_out) = &self.fan_out {
                    fan_out.close(ctx).await;
                }
            }
            NodeBody::Sink(_) => {
                for fan_in in &self.fan_ins {
                    fan_in.enable_graceful_stop();
                    fan_in.stop().await;
                }
            }
        }
        self.wait_stopped().await;
    }

    pub async fn status(&self) -> Value {
        let mut st = Map::new();
        st.insert("state".to_string(), Value::Str(self.state().to_string()));
        if !self.fan_ins.is_empty() {
            // A union box reports one input block per sub-select.
            if self.fan_ins.len() == 1 {
                st.insert("input".to_string(), self.fan_ins[0].status());
            } else {
                st.insert(
                    "input".to_string(),
                    Value::Array(self.fan_ins.iter().map(|f| f.status()).collect()),
                );
            }
        }
        if let Some(fan_out) = &self.fan_out {
            st.insert("output".to_string(), fan_out.status().await);
        }
        Value::Map(st)
    }
}

/// The graph of running nodes plus the shared runtime context.
pub struct Topology {
    name: String,
    ctx: Arc<Context>,
    nodes: RwLock<IndexMap<String, Arc<TopologyNode>>>,
}

impl Topology {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ctx: Arc::new(Context::new()),
            nodes: RwLock::new(IndexMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub async fn add_node(&self, node: Arc<TopologyNode>) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.name) {
            return Err(RuntimeError::plan(format!(
                "node '{}' already exists in topology '{}'",
                node.name, self.name
            )));
        }
        nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub async fn node(&self, name: &str) -> Option<Arc<TopologyNode>> {
        self.nodes.read().await.get(name).cloned()
    }

    /// Looks a node up and checks its kind, the common planner pattern.
    pub async fn node_of_kind(&self, name: &str, kind: NodeKind) -> Result<Arc<TopologyNode>> {
        match self.node(name).await {
            Some(node) if node.kind == kind => Ok(node),
            Some(node) => Err(RuntimeError::plan(format!(
                "node '{}' is a {}, not a {}",
                name, node.kind, kind
            ))),
            None => Err(RuntimeError::plan(format!("node '{}' was not found", name))),
        }
    }

    pub async fn remove_node(&self, name: &str) -> Option<Arc<TopologyNode>> {
        self.nodes.write().await.shift_remove(name)
    }

    pub async fn node_status(&self, name: &str) -> Option<Value> {
        let node = self.node(name).await?;
        Some(node.status().await)
    }

    /// Stops the whole topology: sources first, boxes cascade to a stop as
    /// their inputs disappear, sinks drain what is immediately available.
    pub async fn stop(&self) {
        let snapshot: Vec<Arc<TopologyNode>> =
            self.nodes.read().await.values().cloned().collect();
        for node in snapshot.iter().filter(|n| n.kind == NodeKind::Source) {
            node.stop(&self.ctx).await;
        }
        for node in snapshot.iter().filter(|n| n.kind == NodeKind::Box) {
            node.wait_stopped().await;
        }
        for node in snapshot.iter().filter(|n| n.kind == NodeKind::Sink) {
            node.stop(&self.ctx).await;
        }
        self.nodes.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_node_state_order() {
        assert!(NodeState::Initialized < NodeState::Running);
        assert!(NodeState::Running < NodeState::Paused);
        assert!(NodeState::Paused < NodeState::Stopping);
        assert!(NodeState::Stopping < NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_state_holder_wait() {
        let holder = Arc::new(StateHolder::new());
        assert_eq!(holder.get(), NodeState::Initialized);

        let h2 = holder.clone();
        let waiter = tokio::spawn(async move {
            h2.wait_for(NodeState::Running).await;
            h2.get()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        holder.set(NodeState::Running);
        assert_eq!(waiter.await.unwrap(), NodeState::Running);

        // Waiting for an earlier state returns immediately once past it.
        holder.set(NodeState::Stopped);
        holder.wait_for(NodeState::Running).await;
    }

    #[tokio::test]
    async fn test_duplicate_node_rejected() {
        let topology = Topology::new("t");
        let node = Arc::new(TopologyNode {
            name: "n".to_string(),
            kind: NodeKind::Source,
            source_state: Some(Arc::new(StateHolder::new())),
            fan_ins: Vec::new(),
            fan_out: Some(FanOut::new(NodeKind::Source, "n")),
            body: NodeBody::Box,
        });
        topology.add_node(node.clone()).await.unwrap();
        assert!(topology.add_node(node).await.is_err());
        assert!(topology.node("n").await.is_some());
        assert!(topology.node("zzz").await.is_none());
    }

    #[tokio::test]
    async fn test_node_of_kind_mismatch() {
        let topology = Topology::new("t");
        let node = Arc::new(TopologyNode {
            name: "n".to_string(),
            kind: NodeKind::Source,
            source_state: Some(Arc::new(StateHolder::new())),
            fan_ins: Vec::new(),
            fan_out: Some(FanOut::new(NodeKind::Source, "n")),
            body: NodeBody::Box,
        });
        topology.add_node(node).await.unwrap();
        assert!(topology.node_of_kind("n", NodeKind::Source).await.is_ok());
        assert!(topology.node_of_kind("n", NodeKind::Sink).await.is_err());
    }
}
