//! Fan-in: multiplexing N input pipes into one node's input stream

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::pipe::PipeReceiver;
use crate::topology::{NodeKind, NodeState, StateHolder};
use crate::writer::Writer;
use freshet_core::{Map, TraceEventType, Tuple, Value};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Control messages consumed by fan-in workers.
enum FanInMessage {
    AddReceiver(String, PipeReceiver),
    Stop,
    EnableGracefulStop,
    StopOnDisconnect,
}

type WorkerPipes = Arc<StdMutex<IndexMap<String, PipeReceiver>>>;

/// Aggregates the input pipes of one node and pours their tuples into a
/// writer with a configurable number of parallel workers. Tuple order across
/// workers is not preserved.
pub struct FanIn {
    node_kind: NodeKind,
    node_name: String,
    state: Arc<StateHolder>,
    recvs: StdMutex<IndexMap<String, PipeReceiver>>,
    msg_txs: StdMutex<Vec<mpsc::UnboundedSender<FanInMessage>>>,
    worker_pipes: StdMutex<Vec<WorkerPipes>>,
    initial_graceful: AtomicBool,
    initial_stop_on_disconnect: AtomicBool,
    received: AtomicU64,
    errors: AtomicU64,
}

impl FanIn {
    pub fn new(node_kind: NodeKind, node_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_kind,
            node_name: node_name.into(),
            state: Arc::new(StateHolder::new()),
            recvs: StdMutex::new(IndexMap::new()),
            msg_txs: StdMutex::new(Vec::new()),
            worker_pipes: StdMutex::new(Vec::new()),
            initial_graceful: AtomicBool::new(false),
            initial_stop_on_disconnect: AtomicBool::new(false),
            received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> &Arc<StateHolder> {
        &self.state
    }

    /// Registers a new input edge. Valid before and during `run`.
    pub fn add(&self, name: &str, receiver: PipeReceiver) -> Result<()> {
        let mut recvs = self.recvs.lock().unwrap();
        if self.state.get() >= NodeState::Stopping {
            return Err(RuntimeError::Runtime(format!(
                "node '{}' already closed its input",
                self.node_name
            )));
        }
        if recvs.contains_key(name) {
            return Err(RuntimeError::Runtime(format!(
                "node '{}' is already receiving tuples from '{}'",
                self.node_name, name
            )));
        }
        recvs.insert(name.to_string(), receiver.clone());
        self.send_message_fn(|| FanInMessage::AddReceiver(name.to_string(), receiver.clone()));
        Ok(())
    }

    fn send_message_fn(&self, make: impl Fn() -> FanInMessage) {
        let txs = self.msg_txs.lock().unwrap();
        for tx in txs.iter() {
            let _ = tx.send(make());
        }
    }

    /// Workers stop once tuples currently in flight are processed, instead
    /// of breaking the moment `stop` arrives.
    pub fn enable_graceful_stop(&self) {
        self.initial_graceful.store(true, Ordering::Release);
        self.send_message_fn(|| FanInMessage::EnableGracefulStop);
    }

    /// Workers terminate once their set of input pipes becomes empty.
    pub fn stop_on_disconnect(&self) {
        self.initial_stop_on_disconnect.store(true, Ordering::Release);
        self.send_message_fn(|| FanInMessage::StopOnDisconnect);
    }

    /// Requests stop and waits until every worker has terminated and the
    /// teardown drain is scheduled.
    pub async fn stop(&self) {
        {
            let recvs = self.recvs.lock().unwrap();
            match self.state.get() {
                NodeState::Stopping | NodeState::Stopped => return,
                NodeState::Initialized | NodeState::Starting => {
                    for (_, r) in recvs.iter() {
                        r.close();
                    }
                    drop(recvs);
                    self.state.set(NodeState::Stopped);
                    return;
                }
                _ => {}
            }
            for (_, r) in recvs.iter() {
                r.close();
            }
        }
        self.send_message_fn(|| FanInMessage::Stop);
        self.state.wait_for(NodeState::Stopped).await;
    }

    /// Pours tuples into `writer` with `parallelism` workers until stopped.
    /// Panics in workers become fatal errors; afterwards every remaining
    /// input channel is drained so no upstream sender blocks forever.
    pub async fn run(
        self: Arc<Self>,
        ctx: Arc<Context>,
        writer: Arc<dyn Writer>,
        parallelism: usize,
    ) -> Result<()> {
        let parallelism = parallelism.max(1);
        if self.state.get() != NodeState::Initialized {
            return Err(RuntimeError::Runtime(format!(
                "'{}' already started to receive tuples",
                self.node_name
            )));
        }
        self.state.set(NodeState::Starting);

        let mut join_set = JoinSet::new();
        {
            let recvs = self.recvs.lock().unwrap();
            let mut txs = self.msg_txs.lock().unwrap();
            let mut worker_pipes = self.worker_pipes.lock().unwrap();
            for _ in 0..parallelism {
                let (tx, rx) = mpsc::unbounded_channel();
                txs.push(tx);
                let pipes: WorkerPipes = Arc::new(StdMutex::new(recvs.clone()));
                worker_pipes.push(pipes.clone());
                join_set.spawn(Self::worker(self.clone(), ctx.clone(), writer.clone(), pipes, rx));
            }
        }
        self.state.set(NodeState::Running);

        let mut first_error: Option<RuntimeError> = None;
        while let Some(joined) = join_set.join_next().await {
            let err = match joined {
                Ok(worker_err) => worker_err,
                Err(join_err) if join_err.is_panic() => Some(RuntimeError::fatal(format!(
                    "a worker of '{}' panicked",
                    self.node_name
                ))),
                Err(_) => None,
            };
            if let Some(err) = err {
                if first_error.is_none() {
                    error!(
                        node = %self.node_name,
                        %err,
                        "the node stopped with a fatal error"
                    );
                    first_error = Some(err);
                }
            }
        }

        self.state.set(NodeState::Stopping);
        self.teardown();
        self.state.set(NodeState::Stopped);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Closes and drains the union of the per-worker pipe sets and the
    /// registry map. They may diverge when an add or remove raced with a
    /// worker panic, so both are drained.
    fn teardown(&self) {
        let mut drain: Vec<PipeReceiver> = Vec::new();
        {
            let mut recvs = self.recvs.lock().unwrap();
            for (_, r) in recvs.drain(..) {
                r.close();
                drain.push(r);
            }
        }
        {
            let worker_pipes = self.worker_pipes.lock().unwrap();
            for pipes in worker_pipes.iter() {
                for (_, r) in pipes.lock().unwrap().iter() {
                    r.close();
                    drain.push(r.clone());
                }
            }
        }
        self.msg_txs.lock().unwrap().clear();
        if drain.is_empty() {
            return;
        }
        tokio::spawn(async move {
            // Duplicated receivers drain to EOF immediately, so the overlap
            // between worker sets and the registry is harmless.
            for r in drain {
                while r.recv().await.is_some() {}
            }
        });
    }

    async fn worker(
        fan_in: Arc<FanIn>,
        ctx: Arc<Context>,
        writer: Arc<dyn Writer>,
        pipes: WorkerPipes,
        mut msg_rx: mpsc::UnboundedReceiver<FanInMessage>,
    ) -> Option<RuntimeError> {
        let mut graceful = fan_in.initial_graceful.load(Ordering::Acquire);
        let mut stop_on_disconnect = fan_in.initial_stop_on_disconnect.load(Ordering::Acquire);
        // Rotates the poll order so one busy input cannot starve the rest.
        let mut rotation = 0usize;

        loop {
            let snapshot: Vec<(String, PipeReceiver)> = pipes
                .lock()
                .unwrap()
                .iter()
                .map(|(n, r)| (n.clone(), r.clone()))
                .collect();

            if stop_on_disconnect && snapshot.is_empty() {
                return None;
            }

            if snapshot.is_empty() {
                // Only the control channel is left to watch; a new input
                // could still be added dynamically.
                match msg_rx.recv().await {
                    None => return Some(control_channel_closed(&fan_in.node_name)),
                    Some(msg) => match Self::handle_message(
                        &fan_in,
                        &ctx,
                        &writer,
                        &pipes,
                        msg,
                        &mut graceful,
                        &mut stop_on_disconnect,
                    )
                    .await
                    {
                        MessageOutcome::Continue => continue,
                        MessageOutcome::Break => return None,
                        MessageOutcome::Fail(err) => return Some(err),
                    },
                }
            }

            tokio::select! {
                biased;
                msg = msg_rx.recv() => {
                    match msg {
                        None => return Some(control_channel_closed(&fan_in.node_name)),
                        Some(msg) => match Self::handle_message(
                            &fan_in, &ctx, &writer, &pipes, msg,
                            &mut graceful, &mut stop_on_disconnect,
                        ).await {
                            MessageOutcome::Continue => {}
                            MessageOutcome::Break => return None,
                            MessageOutcome::Fail(err) => return Some(err),
                        },
                    }
                }
                (idx, item) = recv_any(&snapshot, rotation) => {
                    rotation = rotation.wrapping_add(1);
                    match item {
                        None => {
                            // EOF: forget this input.
                            pipes.lock().unwrap().shift_remove(&snapshot[idx].0);
                        }
                        Some(tuple) => {
                            if let Some(err) =
                                Self::pour_one(&fan_in, &ctx, &writer, tuple).await
                            {
                                return Some(err);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(
        fan_in: &Arc<FanIn>,
        ctx: &Arc<Context>,
        writer: &Arc<dyn Writer>,
        pipes: &WorkerPipes,
        msg: FanInMessage,
        graceful: &mut bool,
        stop_on_disconnect: &mut bool,
    ) -> MessageOutcome {
        match msg {
            FanInMessage::AddReceiver(name, receiver) => {
                pipes.lock().unwrap().insert(name, receiver);
                MessageOutcome::Continue
            }
            FanInMessage::EnableGracefulStop => {
                *graceful = true;
                MessageOutcome::Continue
            }
            FanInMessage::StopOnDisconnect => {
                *stop_on_disconnect = true;
                MessageOutcome::Continue
            }
            FanInMessage::Stop => {
                if *graceful {
                    // Process whatever is immediately available, then stop
                    // without waiting for more.
                    loop {
                        let snapshot: Vec<PipeReceiver> =
                            pipes.lock().unwrap().values().cloned().collect();
                        let mut got = None;
                        for r in &snapshot {
                            if let Some(t) = r.try_recv() {
                                got = Some(t);
                                break;
                            }
                        }
                        match got {
                            Some(tuple) => {
                                if let Some(err) =
                                    Self::pour_one(fan_in, ctx, writer, tuple).await
                                {
                                    return MessageOutcome::Fail(err);
                                }
                            }
                            None => break,
                        }
                    }
                }
                MessageOutcome::Break
            }
        }
    }

    async fn pour_one(
        fan_in: &Arc<FanIn>,
        ctx: &Arc<Context>,
        writer: &Arc<dyn Writer>,
        tuple: Tuple,
    ) -> Option<RuntimeError> {
        fan_in.received.fetch_add(1, Ordering::Relaxed);
        let backup = tuple.shallow_copy();
        let err = match writer.write(ctx, tuple).await {
            Ok(()) => return None,
            Err(err) => err,
        };

        fan_in.errors.fetch_add(1, Ordering::Relaxed);
        ctx.dropped_tuple(
            fan_in.node_kind,
            &fan_in.node_name,
            TraceEventType::Input,
            &backup,
            &err,
        );
        if err.is_fatal() {
            return Some(err);
        }
        if err.is_temporary() {
            // TODO: retry with the retained payload once the retry queue
            // exists; reported and skipped until then.
            warn!(node = %fan_in.node_name, %err, "temporary error, tuple skipped");
        }
        None
    }

    /// Per-node and per-input metrics.
    pub fn status(&self) -> Value {
        let mut st = Map::new();
        st.insert(
            "num_received_total".to_string(),
            Value::Int(self.received.load(Ordering::Relaxed) as i64),
        );
        st.insert(
            "num_errors".to_string(),
            Value::Int(self.errors.load(Ordering::Relaxed) as i64),
        );
        let recvs = self.recvs.lock().unwrap();
        let mut inputs = Map::new();
        for (name, r) in recvs.iter() {
            let sender = r.sender();
            let (queued, capacity) = sender.queue_status();
            let mut m = Map::new();
            m.insert(
                "num_received".to_string(),
                Value::Int(sender.count() as i64 - queued as i64),
            );
            m.insert("queue_size".to_string(), Value::Int(capacity as i64));
            m.insert("num_queued".to_string(), Value::Int(queued as i64));
            m.insert("num_dropped".to_string(), Value::Int(sender.dropped() as i64));
            inputs.insert(name.clone(), Value::Map(m));
        }
        st.insert("inputs".to_string(), Value::Map(inputs));
        Value::Map(st)
    }
}

enum MessageOutcome {
    Continue,
    Break,
    Fail(RuntimeError),
}

fn control_channel_closed(node_name: &str) -> RuntimeError {
    RuntimeError::fatal(format!(
        "a controlling channel of '{}' has been closed",
        node_name
    ))
}

/// Resolves with the index and result of whichever pipe yields first. The
/// poll order rotates with `start` so ready inputs take turns. Pipe `recv`
/// removes a tuple only in the poll that returns it, so the losing futures
/// can be dropped without losing tuples.
async fn recv_any(pipes: &[(String, PipeReceiver)], start: usize) -> (usize, Option<Tuple>) {
    let n = pipes.len();
    let futures = (0..n).map(|offset| {
        let idx = (start + offset) % n;
        let (_, r) = &pipes[idx];
        Box::pin(async move { (idx, r.recv().await) })
    });
    futures_util::future::select_all(futures).await.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{pipe, DropMode};
    use async_trait::async_trait;
    use std::time::Duration;

    fn tuple(n: i64) -> Tuple {
        Tuple::new(Map::new()).with_field("int", n)
    }

    struct Collecting {
        tuples: StdMutex<Vec<Tuple>>,
    }

    impl Collecting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                tuples: StdMutex::new(Vec::new()),
            })
        }
        fn ints(&self) -> Vec<i64> {
            self.tuples
                .lock()
                .unwrap()
                .iter()
                .map(|t| t.get_int("int").unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Writer for Collecting {
        async fn write(&self, _ctx: &Context, tuple: Tuple) -> crate::error::Result<()> {
            self.tuples.lock().unwrap().push(tuple);
            Ok(())
        }
    }

    struct FailingWriter;

    #[async_trait]
    impl Writer for FailingWriter {
        async fn write(&self, _ctx: &Context, tuple: Tuple) -> crate::error::Result<()> {
            if tuple.get_int("int") == Some(13) {
                Err(RuntimeError::fatal("unlucky tuple"))
            } else {
                Err(RuntimeError::Runtime("skip".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn test_single_input_pour() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Box, "b");
        let (rx, tx) = pipe("in", 8, DropMode::None);
        fan_in.add("in", rx).unwrap();

        let sink = Collecting::new();
        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), sink.clone(), 1));
        fan_in.state().wait_for(NodeState::Running).await;

        for i in 0..4 {
            tx.write(&ctx, &tuple(i)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.ints(), vec![0, 1, 2, 3]);

        fan_in.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_two_inputs_merge() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Box, "b");
        let (rx_a, tx_a) = pipe("a", 8, DropMode::None);
        let (rx_b, tx_b) = pipe("b", 8, DropMode::None);
        fan_in.add("a", rx_a).unwrap();
        fan_in.add("b", rx_b).unwrap();

        let sink = Collecting::new();
        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), sink.clone(), 1));
        fan_in.state().wait_for(NodeState::Running).await;

        tx_a.write(&ctx, &tuple(1)).await.unwrap();
        tx_b.write(&ctx, &tuple(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut got = sink.ints();
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);

        fan_in.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_add_receiver_while_running() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Sink, "s");
        let (rx_a, tx_a) = pipe("a", 8, DropMode::None);
        fan_in.add("a", rx_a).unwrap();

        let sink = Collecting::new();
        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), sink.clone(), 1));
        fan_in.state().wait_for(NodeState::Running).await;

        let (rx_b, tx_b) = pipe("b", 8, DropMode::None);
        fan_in.add("b", rx_b).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx_a.write(&ctx, &tuple(1)).await.unwrap();
        tx_b.write(&ctx, &tuple(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut got = sink.ints();
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);

        fan_in.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_input_rejected() {
        let fan_in = FanIn::new(NodeKind::Box, "b");
        let (rx, _tx) = pipe("a", 8, DropMode::None);
        fan_in.add("a", rx.clone()).unwrap();
        assert!(fan_in.add("a", rx).is_err());
    }

    #[tokio::test]
    async fn test_stop_on_disconnect() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Box, "b");
        let (rx, tx) = pipe("in", 8, DropMode::None);
        fan_in.add("in", rx).unwrap();
        fan_in.stop_on_disconnect();

        let sink = Collecting::new();
        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), sink.clone(), 1));
        fan_in.state().wait_for(NodeState::Running).await;

        tx.write(&ctx, &tuple(1)).await.unwrap();
        tx.close();

        // Queued tuple is processed before EOF removes the input, then the
        // worker terminates because its input set is empty.
        handle.await.unwrap().unwrap();
        assert_eq!(sink.ints(), vec![1]);
        assert_eq!(fan_in.state().get(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_graceful_stop_drains_available() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Sink, "s");
        let (rx, tx) = pipe("in", 8, DropMode::None);
        fan_in.add("in", rx).unwrap();
        fan_in.enable_graceful_stop();

        let sink = Collecting::new();
        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), sink.clone(), 1));
        fan_in.state().wait_for(NodeState::Running).await;

        for i in 0..3 {
            tx.write(&ctx, &tuple(i)).await.unwrap();
        }
        fan_in.stop().await;
        handle.await.unwrap().unwrap();
        assert_eq!(sink.ints(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_node_and_drains() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Box, "b");
        let (rx, tx) = pipe("in", 2, DropMode::None);
        fan_in.add("in", rx).unwrap();

        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), Arc::new(FailingWriter), 1));
        fan_in.state().wait_for(NodeState::Running).await;

        // Non-fatal errors skip tuples; the fatal one stops the node.
        tx.write(&ctx, &tuple(1)).await.unwrap();
        tx.write(&ctx, &tuple(13)).await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(fan_in.state().get(), NodeState::Stopped);

        // The drain keeps consuming so this write does not block forever
        // (until the drain closes the pipe).
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.write(&ctx, &tuple(2)).await;
    }

    #[tokio::test]
    async fn test_parallel_workers_receive_everything() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Box, "b");
        let (rx, tx) = pipe("in", 64, DropMode::None);
        fan_in.add("in", rx).unwrap();
        fan_in.stop_on_disconnect();

        let sink = Collecting::new();
        // Two workers: no tuple is lost or duplicated, order is unspecified.
        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), sink.clone(), 2));
        fan_in.state().wait_for(NodeState::Running).await;

        for i in 0..32 {
            tx.write(&ctx, &tuple(i)).await.unwrap();
        }
        tx.close();
        handle.await.unwrap().unwrap();

        let mut got = sink.ints();
        got.sort_unstable();
        assert_eq!(got, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_status_counters() {
        let ctx = Arc::new(Context::new());
        let fan_in = FanIn::new(NodeKind::Box, "b");
        let (rx, tx) = pipe("in", 8, DropMode::None);
        fan_in.add("in", rx).unwrap();

        let sink = Collecting::new();
        let handle = tokio::spawn(fan_in.clone().run(ctx.clone(), sink.clone(), 1));
        fan_in.state().wait_for(NodeState::Running).await;
        tx.write(&ctx, &tuple(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let st = fan_in.status();
        assert_eq!(st.get("num_received_total"), Some(&Value::Int(1)));
        assert_eq!(st.get("num_errors"), Some(&Value::Int(0)));

        fan_in.stop().await;
        handle.await.unwrap().unwrap();
    }
}
