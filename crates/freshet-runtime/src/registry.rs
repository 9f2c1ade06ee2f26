//! Type catalogs for sources, sinks, states and stream functions
//!
//! One registration phase at startup, read-only afterwards. The registry is
//! passed into the topology builder explicitly, so tests scope their own
//! overrides instead of patching process-wide globals.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::sink::{CollectorSink, ConsoleSink, Sink};
use crate::source::{BatchSource, Source};
use crate::state::{MemoryState, SharedState};
use crate::udf::UdfRegistry;
use crate::udsf::{DuplicateUdsf, Udsf};
use freshet_core::{Map, Value};
use indexmap::IndexMap;
use std::sync::Arc;

pub type SourceCreator =
    dyn Fn(&Context, &Map) -> Result<Arc<dyn Source>> + Send + Sync;
pub type SinkCreator = dyn Fn(&Context, &Map) -> Result<Arc<dyn Sink>> + Send + Sync;
pub type StateCreator =
    dyn Fn(&Context, &Map) -> Result<Arc<dyn SharedState>> + Send + Sync;
pub type UdsfCreator = dyn Fn(&[Value]) -> Result<Arc<dyn Udsf>> + Send + Sync;

pub struct Registry {
    sources: IndexMap<String, Arc<SourceCreator>>,
    sinks: IndexMap<String, Arc<SinkCreator>>,
    states: IndexMap<String, Arc<StateCreator>>,
    udsfs: IndexMap<String, Arc<UdsfCreator>>,
    pub udfs: Arc<UdfRegistry>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            sources: IndexMap::new(),
            sinks: IndexMap::new(),
            states: IndexMap::new(),
            udsfs: IndexMap::new(),
            udfs: Arc::new(UdfRegistry::default()),
        }
    }

    pub fn register_source<F>(&mut self, type_name: &str, creator: F)
    where
        F: Fn(&Context, &Map) -> Result<Arc<dyn Source>> + Send + Sync + 'static,
    {
        self.sources
            .insert(type_name.to_lowercase(), Arc::new(creator));
    }

    pub fn register_sink<F>(&mut self, type_name: &str, creator: F)
    where
        F: Fn(&Context, &Map) -> Result<Arc<dyn Sink>> + Send + Sync + 'static,
    {
        self.sinks.insert(type_name.to_lowercase(), Arc::new(creator));
    }

    pub fn register_state<F>(&mut self, type_name: &str, creator: F)
    where
        F: Fn(&Context, &Map) -> Result<Arc<dyn SharedState>> + Send + Sync + 'static,
    {
        self.states
            .insert(type_name.to_lowercase(), Arc::new(creator));
    }

    pub fn register_udsf<F>(&mut self, name: &str, creator: F)
    where
        F: Fn(&[Value]) -> Result<Arc<dyn Udsf>> + Send + Sync + 'static,
    {
        self.udsfs.insert(name.to_lowercase(), Arc::new(creator));
    }

    pub fn create_source(
        &self,
        ctx: &Context,
        type_name: &str,
        params: &Map,
    ) -> Result<Arc<dyn Source>> {
        match self.sources.get(&type_name.to_lowercase()) {
            Some(creator) => creator(ctx, params),
            None => Err(RuntimeError::plan(format!(
                "source type '{}' is not registered",
                type_name
            ))),
        }
    }

    pub fn create_sink(&self, ctx: &Context, type_name: &str, params: &Map) -> Result<Arc<dyn Sink>> {
        match self.sinks.get(&type_name.to_lowercase()) {
            Some(creator) => creator(ctx, params),
            None => Err(RuntimeError::plan(format!(
                "sink type '{}' is not registered",
                type_name
            ))),
        }
    }

    pub fn create_state(
        &self,
        ctx: &Context,
        type_name: &str,
        params: &Map,
    ) -> Result<Arc<dyn SharedState>> {
        match self.states.get(&type_name.to_lowercase()) {
            Some(creator) => creator(ctx, params),
            None => Err(RuntimeError::plan(format!(
                "state type '{}' is not registered",
                type_name
            ))),
        }
    }

    pub fn create_udsf(&self, name: &str, args: &[Value]) -> Result<Arc<dyn Udsf>> {
        match self.udsfs.get(&name.to_lowercase()) {
            Some(creator) => creator(args),
            None => Err(RuntimeError::plan(format!(
                "stream function '{}' is not registered",
                name
            ))),
        }
    }

    pub fn has_udsf(&self, name: &str) -> bool {
        self.udsfs.contains_key(&name.to_lowercase())
    }
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();

        registry.register_source("dummy", |_, params| {
            let num = params.get("num").map(|v| v.to_int()).transpose()?.unwrap_or(4);
            Ok(Arc::new(BatchSource::new(num)) as Arc<dyn Source>)
        });

        registry.register_sink("collector", |_, _| {
            Ok(CollectorSink::new() as Arc<dyn Sink>)
        });
        registry.register_sink("console", |_, _| Ok(Arc::new(ConsoleSink) as Arc<dyn Sink>));

        registry.register_state("memory", |_, params| {
            Ok(Arc::new(MemoryState::new(params)) as Arc<dyn SharedState>)
        });

        registry.register_udsf("duplicate", |args| {
            Ok(Arc::new(DuplicateUdsf::from_args(args)?) as Arc<dyn Udsf>)
        });

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_builtins() {
        let registry = Registry::default();
        let ctx = Context::new();
        assert!(registry.create_source(&ctx, "dummy", &Map::new()).is_ok());
        assert!(registry.create_sink(&ctx, "collector", &Map::new()).is_ok());
        assert!(registry.create_sink(&ctx, "console", &Map::new()).is_ok());
        assert!(registry.create_state(&ctx, "memory", &Map::new()).is_ok());
        assert!(registry.has_udsf("duplicate"));
    }

    #[test]
    fn test_type_names_case_insensitive() {
        let registry = Registry::default();
        let ctx = Context::new();
        assert!(registry.create_source(&ctx, "Dummy", &Map::new()).is_ok());
        assert!(registry.create_source(&ctx, "nope", &Map::new()).is_err());
    }

    #[test]
    fn test_scoped_override() {
        let mut registry = Registry::default();
        // A test can shadow a type without touching any global state.
        registry.register_source("dummy", |_, _| {
            Ok(Arc::new(BatchSource::new(1)) as Arc<dyn Source>)
        });
        let ctx = Context::new();
        assert!(registry.create_source(&ctx, "dummy", &Map::new()).is_ok());
    }
}
