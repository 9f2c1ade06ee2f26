//! Shared states and the persistence contract
//!
//! States are named, long-lived values UDFs and nodes can share. The
//! persistent store behind LOAD/SAVE STATE is an external collaborator;
//! only its contract lives here, plus an in-memory store for tests.

use crate::error::{Result, RuntimeError};
use freshet_core::{Map, Value};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

/// A named piece of shared state living in the topology context.
pub trait SharedState: Send + Sync {
    fn state_type(&self) -> &str;

    /// `UPDATE STATE .. SET ..` / `LOAD STATE .. SET ..` hook.
    fn update(&self, _params: &Map) -> Result<()> {
        Err(RuntimeError::Runtime(
            "this state does not support UPDATE".to_string(),
        ))
    }

    /// Snapshot used by stores that persist by value.
    fn snapshot(&self) -> Value {
        Value::Null
    }
}

/// Persistence contract behind LOAD STATE and SAVE STATE.
pub trait StateStore: Send + Sync {
    /// Returns the saved state, or `None` when nothing was saved under the
    /// (name, tag) pair - the `OR CREATE IF NOT SAVED` fallback case.
    fn load(
        &self,
        name: &str,
        state_type: &str,
        tag: Option<&str>,
    ) -> Result<Option<Arc<dyn SharedState>>>;

    fn save(&self, name: &str, tag: Option<&str>, state: &Arc<dyn SharedState>) -> Result<()>;
}

/// Store used when no persistence is configured: nothing is ever saved.
pub struct NoopStateStore;

impl StateStore for NoopStateStore {
    fn load(
        &self,
        _name: &str,
        _state_type: &str,
        _tag: Option<&str>,
    ) -> Result<Option<Arc<dyn SharedState>>> {
        Ok(None)
    }

    fn save(&self, name: &str, _tag: Option<&str>, _state: &Arc<dyn SharedState>) -> Result<()> {
        Err(RuntimeError::Runtime(format!(
            "cannot save state '{}': no state store is configured",
            name
        )))
    }
}

/// Keeps saved states in memory, keyed by name and tag.
#[derive(Default)]
pub struct MemoryStateStore {
    saved: StdMutex<IndexMap<String, Arc<dyn SharedState>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, tag: Option<&str>) -> String {
        match tag {
            Some(tag) => format!("{}#{}", name, tag),
            None => name.to_string(),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(
        &self,
        name: &str,
        _state_type: &str,
        tag: Option<&str>,
    ) -> Result<Option<Arc<dyn SharedState>>> {
        Ok(self.saved.lock().unwrap().get(&Self::key(name, tag)).cloned())
    }

    fn save(&self, name: &str, tag: Option<&str>, state: &Arc<dyn SharedState>) -> Result<()> {
        self.saved
            .lock()
            .unwrap()
            .insert(Self::key(name, tag), state.clone());
        Ok(())
    }
}

/// Built-in key-value state, registered as type `memory`. UPDATE merges the
/// given parameters into the map.
pub struct MemoryState {
    data: RwLock<Map>,
}

impl MemoryState {
    pub fn new(params: &Map) -> Self {
        Self {
            data: RwLock::new(params.clone()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.read().unwrap().get(key).cloned()
    }
}

impl SharedState for MemoryState {
    fn state_type(&self) -> &str {
        "memory"
    }

    fn update(&self, params: &Map) -> Result<()> {
        let mut data = self.data.write().unwrap();
        for (k, v) in params {
            data.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    fn snapshot(&self) -> Value {
        Value::Map(self.data.read().unwrap().clone())
    }
}
