//! Fan-out: broadcasting one node's output to every destination pipe

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::pipe::PipeSender;
use crate::topology::NodeKind;
use crate::writer::Writer;
use async_trait::async_trait;
use freshet_core::{Map, TraceEventType, Tuple, TupleFlags, Value};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Notify, RwLock};
use tracing::debug;

/// Connection lifecycle events delivered to the owner of a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutEvent {
    /// A destination was added. Delivered synchronously: the callback must
    /// not call back into the fan-out.
    NewConnection,
    /// The last destination went away. Delivered on a separate task: the
    /// callback may call back into the fan-out, e.g. to stop the source.
    Disconnect,
}

pub type FanOutCallback = dyn Fn(FanOutEvent) + Send + Sync;

/// Distributes tuples written by one node to all registered destinations.
pub struct FanOut {
    node_kind: NodeKind,
    node_name: String,
    dsts: RwLock<IndexMap<String, Arc<PipeSender>>>,
    closed: AtomicBool,
    paused: AtomicBool,
    resume: Notify,
    sent: AtomicU64,
    dropped_no_destination: AtomicU64,
    callback: StdMutex<Option<Arc<FanOutCallback>>>,
}

impl FanOut {
    pub fn new(node_kind: NodeKind, node_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_kind,
            node_name: node_name.into(),
            dsts: RwLock::new(IndexMap::new()),
            closed: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume: Notify::new(),
            sent: AtomicU64::new(0),
            dropped_no_destination: AtomicU64::new(0),
            callback: StdMutex::new(None),
        })
    }

    pub fn set_callback<F>(&self, cb: F)
    where
        F: Fn(FanOutEvent) + Send + Sync + 'static,
    {
        *self.callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub async fn add(self: &Arc<Self>, name: &str, sender: Arc<PipeSender>) -> Result<()> {
        let mut dsts = self.dsts.write().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Runtime(format!(
                "node '{}' already closed its output",
                self.node_name
            )));
        }
        if dsts.contains_key(name) {
            return Err(RuntimeError::Runtime(format!(
                "node '{}' already has the destination '{}'",
                self.node_name, name
            )));
        }
        sender.register(name, self);
        dsts.insert(name.to_string(), sender);
        drop(dsts);

        let cb = self.callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            cb(FanOutEvent::NewConnection);
        }
        Ok(())
    }

    pub async fn remove(&self, name: &str) {
        let mut dsts = self.dsts.write().await;
        let Some(dst) = dsts.shift_remove(name) else {
            return;
        };
        dst.close();
        let empty = dsts.is_empty();
        drop(dsts);
        if empty {
            self.fire_disconnect();
        }
    }

    fn fire_disconnect(&self) {
        let cb = self.callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            tokio::spawn(async move {
                cb(FanOutEvent::Disconnect);
            });
        }
    }

    pub async fn len(&self) -> usize {
        self.dsts.read().await.len()
    }

    /// Gates writers. Paused writers block until resumed or closed.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::AcqRel) != paused && !paused {
            self.resume.notify_waiters();
        }
    }

    async fn wait_resumed(&self) {
        let mut notified = std::pin::pin!(self.resume.notified());
        loop {
            notified.as_mut().enable();
            if !self.paused.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
                return;
            }
            notified.as_mut().await;
            notified.set(self.resume.notified());
        }
    }

    /// Closes every destination and forces resume so no writer deadlocks.
    pub async fn close(&self, _ctx: &Context) {
        let mut dsts = self.dsts.write().await;
        self.closed.store(true, Ordering::Release);
        for (_, dst) in dsts.drain(..) {
            dst.close();
        }
        drop(dsts);
        self.paused.store(false, Ordering::Release);
        self.resume.notify_waiters();
    }

    /// Broadcast status for the admin surface.
    pub async fn status(&self) -> Value {
        let mut st = Map::new();
        st.insert(
            "num_sent_total".to_string(),
            Value::Int(self.sent.load(Ordering::Relaxed) as i64),
        );
        st.insert(
            "num_dropped".to_string(),
            Value::Int(self.dropped_no_destination.load(Ordering::Relaxed) as i64),
        );
        let dsts = self.dsts.read().await;
        let mut outputs = Map::new();
        for (name, dst) in dsts.iter() {
            let (queued, capacity) = dst.queue_status();
            let mut m = Map::new();
            m.insert("num_sent".to_string(), Value::Int(dst.count() as i64));
            m.insert("queue_size".to_string(), Value::Int(capacity as i64));
            m.insert("num_queued".to_string(), Value::Int(queued as i64));
            outputs.insert(name.clone(), Value::Map(m));
        }
        st.insert("outputs".to_string(), Value::Map(outputs));
        Value::Map(st)
    }
}

#[async_trait]
impl Writer for FanOut {
    /// Writes a tuple to every destination. `PipeClosed` from a destination
    /// is not an error here: the destination is removed lazily after the
    /// broadcast.
    async fn write(&self, ctx: &Context, mut tuple: Tuple) -> Result<()> {
        self.wait_resumed().await;

        let dsts = self.dsts.read().await;
        if dsts.is_empty() {
            self.dropped_no_destination.fetch_add(1, Ordering::Relaxed);
            if ctx.flags.destinationless_log_enabled() {
                ctx.dropped_tuple(
                    self.node_kind,
                    &self.node_name,
                    TraceEventType::Output,
                    &tuple,
                    &RuntimeError::Runtime("no output destination is connected".to_string()),
                );
            }
            return Ok(());
        }

        if dsts.len() > 1 {
            // Each destination then receives a safe view; downstream
            // mutation requires a copy first.
            tuple.flags.set(TupleFlags::SHARED);
        }

        let mut closed = Vec::new();
        for (name, dst) in dsts.iter() {
            let report = |victim: Tuple| {
                ctx.dropped_tuple(
                    self.node_kind,
                    &self.node_name,
                    TraceEventType::Output,
                    &victim,
                    &RuntimeError::Runtime("the output queue is full".to_string()),
                );
            };
            if let Err(RuntimeError::PipeClosed) = dst.write_with(ctx, &tuple, report).await {
                closed.push(name.clone());
            }
        }
        drop(dsts);

        if !closed.is_empty() {
            let mut dsts = self.dsts.write().await;
            for name in closed {
                debug!(node = %self.node_name, dst = %name, "removing closed destination");
                dsts.shift_remove(&name);
            }
            let empty = dsts.is_empty();
            drop(dsts);
            if empty {
                self.fire_disconnect();
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
