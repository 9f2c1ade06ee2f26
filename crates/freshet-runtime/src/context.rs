//! Runtime context shared by every node of a topology

use crate::error::RuntimeError;
use crate::state::SharedState;
use crate::topology::NodeKind;
use freshet_core::{TraceEventType, Tuple};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Feature flags toggled per topology.
#[derive(Debug, Default)]
pub struct ContextFlags {
    /// Record input/output trace events on tuples.
    pub tuple_trace: AtomicBool,
    /// Report tuples dropped because a fan-out has no destination.
    pub destinationless_tuple_log: AtomicBool,
}

impl ContextFlags {
    pub fn set_tuple_trace(&self, enabled: bool) {
        self.tuple_trace.store(enabled, Ordering::Relaxed);
    }

    pub fn tuple_trace_enabled(&self) -> bool {
        self.tuple_trace.load(Ordering::Relaxed)
    }

    pub fn destinationless_log_enabled(&self) -> bool {
        self.destinationless_tuple_log.load(Ordering::Relaxed)
    }
}

/// Report passed to the dropped-tuple callback.
pub struct DroppedTupleReport<'a> {
    pub node_kind: NodeKind,
    pub node_name: &'a str,
    pub phase: TraceEventType,
    pub tuple: &'a Tuple,
    pub error: &'a RuntimeError,
}

pub type DroppedTupleCallback = dyn Fn(&DroppedTupleReport<'_>) + Send + Sync;

/// Shared runtime context: flags, the dropped-tuple callback and the shared
/// state registry. One context per topology.
#[derive(Default)]
pub struct Context {
    pub flags: ContextFlags,
    dropped_cb: RwLock<Option<Arc<DroppedTupleCallback>>>,
    states: RwLock<IndexMap<String, Arc<dyn SharedState>>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dropped_tuple_callback<F>(&self, cb: F)
    where
        F: Fn(&DroppedTupleReport<'_>) + Send + Sync + 'static,
    {
        *self.dropped_cb.write().unwrap() = Some(Arc::new(cb));
    }

    /// Reports a per-tuple error. Non-fatal errors skip the tuple; this is
    /// the only channel they are visible on.
    pub fn dropped_tuple(
        &self,
        node_kind: NodeKind,
        node_name: &str,
        phase: TraceEventType,
        tuple: &Tuple,
        error: &RuntimeError,
    ) {
        debug!(
            node = node_name,
            ?phase,
            %error,
            "tuple dropped"
        );
        let cb = self.dropped_cb.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(&DroppedTupleReport {
                node_kind,
                node_name,
                phase,
                tuple,
                error,
            });
        }
    }

    // === Shared states ===

    pub fn add_state(&self, name: &str, state: Arc<dyn SharedState>) -> crate::error::Result<()> {
        let mut states = self.states.write().unwrap();
        if states.contains_key(name) {
            return Err(RuntimeError::plan(format!(
                "state '{}' already exists",
                name
            )));
        }
        states.insert(name.to_string(), state);
        Ok(())
    }

    pub fn replace_state(&self, name: &str, state: Arc<dyn SharedState>) {
        self.states.write().unwrap().insert(name.to_string(), state);
    }

    pub fn state(&self, name: &str) -> Option<Arc<dyn SharedState>> {
        self.states.read().unwrap().get(name).cloned()
    }

    pub fn remove_state(&self, name: &str) -> Option<Arc<dyn SharedState>> {
        self.states.write().unwrap().shift_remove(name)
    }
}
