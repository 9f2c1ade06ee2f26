//! The sink contract and built-in sinks

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::writer::Writer;
use async_trait::async_trait;
use freshet_core::{Map, Tuple};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Notify};

/// A consumer-only node implementation.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()>;

    async fn close(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// `UPDATE SINK .. SET ..` hook.
    async fn update(&self, _ctx: &Context, _params: &Map) -> Result<()> {
        Err(RuntimeError::Runtime(
            "this sink does not support UPDATE".to_string(),
        ))
    }
}

/// Adapts a sink into the writer chain of its node.
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Writer for SinkWriter {
    async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
        self.sink.write(ctx, tuple).await
    }
}

/// Collects tuples in memory and lets tests wait for a count. Registered as
/// type `collector`.
#[derive(Default)]
pub struct CollectorSink {
    tuples: StdMutex<Vec<Tuple>>,
    arrived: Notify,
}

impl CollectorSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tuples(&self) -> Vec<Tuple> {
        self.tuples.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.tuples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits until at least `n` tuples have arrived.
    pub async fn wait_for(&self, n: usize) {
        let mut notified = std::pin::pin!(self.arrived.notified());
        loop {
            notified.as_mut().enable();
            if self.len() >= n {
                return;
            }
            notified.as_mut().await;
            notified.set(self.arrived.notified());
        }
    }
}

#[async_trait]
impl Sink for CollectorSink {
    async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
        self.tuples.lock().unwrap().push(tuple);
        self.arrived.notify_waiters();
        Ok(())
    }
}

/// Prints each tuple's data as one JSON line. Registered as type `console`.
pub struct ConsoleSink;

#[async_trait]
impl Sink for ConsoleSink {
    async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
        match serde_json::to_string(tuple.data()) {
            Ok(line) => println!("{}", line),
            Err(e) => return Err(RuntimeError::Runtime(e.to_string())),
        }
        Ok(())
    }
}

/// Forwards tuples into an in-process channel; backs ad-hoc SELECT results.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Tuple>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Tuple>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
        // A dropped receiver means the client went away; not an error.
        let _ = self.tx.send(tuple);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collector_wait_for() {
        let ctx = Arc::new(Context::new());
        let sink = CollectorSink::new();

        let s2 = sink.clone();
        let waiter = tokio::spawn(async move {
            s2.wait_for(2).await;
            s2.len()
        });

        sink.write(&ctx, Tuple::new(Map::new())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        sink.write(&ctx, Tuple::new(Map::new())).await.unwrap();
        assert!(waiter.await.unwrap() >= 2);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let ctx = Context::new();
        let (sink, mut rx) = ChannelSink::new();
        sink.write(&ctx, Tuple::new(Map::new()).with_field("a", 1i64))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.get_int("a"), Some(1));
    }

    #[tokio::test]
    async fn test_channel_sink_receiver_gone_is_ok() {
        let ctx = Context::new();
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(sink.write(&ctx, Tuple::new(Map::new())).await.is_ok());
    }
}
