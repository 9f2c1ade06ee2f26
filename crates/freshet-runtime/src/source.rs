//! The source contract and built-in sources

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::writer::Writer;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use freshet_core::{Map, Tuple};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// A producer-only node implementation.
///
/// `generate` blocks until the source is exhausted or stopped, writing every
/// produced tuple through `writer`. The remaining methods are control-plane
/// calls arriving from the planner.
#[async_trait]
pub trait Source: Send + Sync {
    async fn generate(&self, ctx: &Context, writer: &dyn Writer) -> Result<()>;

    /// Makes `generate` return soon. Must be safe to call more than once.
    async fn stop(&self, ctx: &Context);

    async fn pause(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Replays the stream from its starting position. Sources that cannot
    /// rewind keep the default.
    async fn rewind(&self, _ctx: &Context) -> Result<()> {
        Err(RuntimeError::Runtime(
            "this source does not support rewinding".to_string(),
        ))
    }

    /// `UPDATE SOURCE .. SET ..` hook.
    async fn update(&self, _ctx: &Context, _params: &Map) -> Result<()> {
        Err(RuntimeError::Runtime(
            "this source does not support UPDATE".to_string(),
        ))
    }
}

enum BatchCommand {
    Rewind,
    Stop,
}

/// Replayable test source: emits `num` tuples with an `int` field counting
/// from 1, timestamps spaced one second apart, then idles until rewound or
/// stopped. Registered as type `dummy`.
pub struct BatchSource {
    num: i64,
    cmd_tx: mpsc::UnboundedSender<BatchCommand>,
    cmd_rx: Mutex<mpsc::UnboundedReceiver<BatchCommand>>,
}

impl BatchSource {
    pub fn new(num: i64) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Self {
            num,
            cmd_tx,
            cmd_rx: Mutex::new(cmd_rx),
        }
    }
}

#[async_trait]
impl Source for BatchSource {
    async fn generate(&self, ctx: &Context, writer: &dyn Writer) -> Result<()> {
        let mut cmd_rx = self.cmd_rx.lock().await;
        let base = Utc::now();
        let mut batch_id = 0u64;
        loop {
            for i in 1..=self.num {
                let tuple = Tuple::new(Map::new())
                    .with_field("int", i)
                    .with_timestamp(base + Duration::seconds(i - 1))
                    .with_batch_id(batch_id);
                batch_id += 1;
                writer.write(ctx, tuple).await?;
            }
            match cmd_rx.recv().await {
                Some(BatchCommand::Rewind) => {
                    debug!(num = self.num, "batch source rewinding");
                }
                Some(BatchCommand::Stop) | None => return Ok(()),
            }
        }
    }

    async fn stop(&self, _ctx: &Context) {
        let _ = self.cmd_tx.send(BatchCommand::Stop);
    }

    async fn rewind(&self, _ctx: &Context) -> Result<()> {
        self.cmd_tx
            .send(BatchCommand::Rewind)
            .map_err(|_| RuntimeError::Runtime("the source already stopped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    struct Collecting {
        tuples: StdMutex<Vec<Tuple>>,
    }

    #[async_trait]
    impl Writer for Collecting {
        async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
            self.tuples.lock().unwrap().push(tuple);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_batch_source_emits_then_stops() {
        let ctx = Context::new();
        let source = Arc::new(BatchSource::new(4));
        let collector = Arc::new(Collecting {
            tuples: StdMutex::new(Vec::new()),
        });

        source.stop(&ctx).await; // queued before generate: one batch, then exit
        source.generate(&ctx, collector.as_ref()).await.unwrap();

        let tuples = collector.tuples.lock().unwrap();
        assert_eq!(tuples.len(), 4);
        let ints: Vec<i64> = tuples.iter().map(|t| t.get_int("int").unwrap()).collect();
        assert_eq!(ints, vec![1, 2, 3, 4]);
        // Logical timestamps spaced one second apart.
        assert_eq!(
            tuples[3].timestamp - tuples[0].timestamp,
            Duration::seconds(3)
        );
        let batch_ids: Vec<u64> = tuples.iter().map(|t| t.batch_id).collect();
        assert_eq!(batch_ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_batch_source_rewind_replays() {
        let ctx = Context::new();
        let source = Arc::new(BatchSource::new(2));
        let collector = Arc::new(Collecting {
            tuples: StdMutex::new(Vec::new()),
        });

        source.rewind(&ctx).await.unwrap();
        source.stop(&ctx).await;
        source.generate(&ctx, collector.as_ref()).await.unwrap();

        let tuples = collector.tuples.lock().unwrap();
        assert_eq!(tuples.len(), 4);
        // batch_id keeps increasing across the rewind.
        assert_eq!(tuples[3].batch_id, 3);
    }
}
