//! The writer contract between topology stages

use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use freshet_core::{TraceEvent, TraceEventType, Tuple};
use std::sync::Arc;

/// Anything that accepts tuples: fan-outs, box pipelines, sink adapters.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()>;
}

/// Wraps a writer, stamping a trace event on every passing tuple when
/// tracing is enabled on the context.
pub struct TraceWriter {
    event_type: TraceEventType,
    node_name: String,
    inner: Arc<dyn Writer>,
}

impl TraceWriter {
    pub fn input(node_name: impl Into<String>, inner: Arc<dyn Writer>) -> Self {
        Self {
            event_type: TraceEventType::Input,
            node_name: node_name.into(),
            inner,
        }
    }

    pub fn output(node_name: impl Into<String>, inner: Arc<dyn Writer>) -> Self {
        Self {
            event_type: TraceEventType::Output,
            node_name: node_name.into(),
            inner,
        }
    }
}

#[async_trait]
impl Writer for TraceWriter {
    async fn write(&self, ctx: &Context, mut tuple: Tuple) -> Result<()> {
        if ctx.flags.tuple_trace_enabled() {
            let event = match self.event_type {
                TraceEventType::Input => TraceEvent::input(self.node_name.clone()),
                TraceEventType::Output => TraceEvent::output(self.node_name.clone()),
            };
            tuple.add_trace_event(event);
        }
        self.inner.write(ctx, tuple).await
    }
}
