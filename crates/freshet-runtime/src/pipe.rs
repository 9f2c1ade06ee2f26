//! Bounded pipes connecting topology nodes
//!
//! A pipe is a bounded FIFO with one sender and one receiver handle. The
//! sender side decides the capacity and drop mode. Suspension is built on
//! `tokio::sync::Notify` with the enable-before-check pattern, so wakeups
//! cannot be lost between releasing the queue lock and awaiting.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::fanout::FanOut;
use freshet_core::Tuple;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// Behavior of `write` when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropMode {
    /// Block the writer until space is available. This is the default.
    #[default]
    None,
    /// Discard the tuple being written.
    Latest,
    /// Discard the tuple at the head of the queue to make room. Bounded to
    /// one eviction per call; residual contention degrades to `Latest`.
    Oldest,
}

struct PipeShared {
    queue: Mutex<VecDeque<Tuple>>,
    capacity: usize,
    closed: AtomicBool,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
}

impl PipeShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Creates a pipe. Tuples written through the sender have their `input_name`
/// overwritten with `input_name`, which is how the receiving node tells its
/// input edges apart.
pub fn pipe(input_name: &str, capacity: usize, drop_mode: DropMode) -> (PipeReceiver, Arc<PipeSender>) {
    let shared = Arc::new(PipeShared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity: capacity.max(1),
        closed: AtomicBool::new(false),
        readable: Notify::new(),
        writable: Notify::new(),
        dropped: AtomicU64::new(0),
    });
    let sender = Arc::new(PipeSender {
        shared: shared.clone(),
        input_name: input_name.to_string(),
        drop_mode,
        sent: AtomicU64::new(0),
        registered: Mutex::new(Vec::new()),
    });
    let receiver = PipeReceiver {
        shared,
        sender: sender.clone(),
    };
    (receiver, sender)
}

pub struct PipeSender {
    shared: Arc<PipeShared>,
    input_name: String,
    drop_mode: DropMode,
    sent: AtomicU64,
    /// Fan-outs this sender is registered with, notified on close so the
    /// owner learns the destination is gone without writing to it first.
    registered: Mutex<Vec<(String, Weak<FanOut>)>>,
}

impl PipeSender {
    /// Writes a tuple into the pipe. Returns [`RuntimeError::PipeClosed`]
    /// when the receiver is gone; this never panics and never reports drops.
    pub async fn write(&self, ctx: &Context, tuple: &Tuple) -> Result<()> {
        self.write_with(ctx, tuple, |_| {}).await
    }

    /// Writes a tuple, reporting queue-overflow victims to `dropped`.
    pub async fn write_with(
        &self,
        _ctx: &Context,
        tuple: &Tuple,
        dropped: impl Fn(Tuple),
    ) -> Result<()> {
        // A shared tuple must not be mutated in place, so the copy happens
        // before input_name is overwritten.
        let mut t = if tuple.is_shared() {
            tuple.shallow_copy()
        } else {
            tuple.clone()
        };
        t.input_name = self.input_name.clone();

        match self.drop_mode {
            DropMode::None => self.write_blocking(t).await,
            DropMode::Latest | DropMode::Oldest => {
                let (victim, enqueued) = {
                    let mut queue = self.shared.queue.lock().unwrap();
                    if self.shared.is_closed() {
                        return Err(RuntimeError::PipeClosed);
                    }
                    let mut victim = None;
                    if queue.len() >= self.shared.capacity && self.drop_mode == DropMode::Oldest {
                        victim = queue.pop_front();
                    }
                    if queue.len() < self.shared.capacity {
                        queue.push_back(t);
                        (victim, true)
                    } else {
                        // Latest mode, or the single Oldest eviction did not
                        // make room: the new tuple is the victim.
                        (Some(t), false)
                    }
                };
                if let Some(v) = victim {
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    dropped(v);
                }
                if enqueued {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    self.shared.readable.notify_waiters();
                }
                Ok(())
            }
        }
    }

    async fn write_blocking(&self, t: Tuple) -> Result<()> {
        let mut t = Some(t);
        let mut notified = std::pin::pin!(self.shared.writable.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if self.shared.is_closed() {
                    return Err(RuntimeError::PipeClosed);
                }
                if queue.len() < self.shared.capacity {
                    queue.push_back(t.take().expect("tuple consumed twice"));
                    drop(queue);
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    self.shared.readable.notify_waiters();
                    return Ok(());
                }
            }
            notified.as_mut().await;
            notified.set(self.shared.writable.notified());
        }
    }

    /// Idempotent close. Marks the pipe closed under the queue lock (so no
    /// writer is mid-enqueue), wakes everything so the receiver can drain to
    /// EOF, and notifies registered fan-outs on separate tasks to break
    /// close-callback-close recursion.
    pub fn close(&self) {
        {
            let _queue = self.shared.queue.lock().unwrap();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        self.shared.readable.notify_waiters();
        self.shared.writable.notify_waiters();

        let registered = std::mem::take(&mut *self.registered.lock().unwrap());
        if registered.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            for (name, dst) in registered {
                handle.spawn(async move {
                    if let Some(fan_out) = dst.upgrade() {
                        fan_out.remove(&name).await;
                    }
                });
            }
        }
    }

    pub(crate) fn register(&self, name: &str, fan_out: &Arc<FanOut>) {
        self.registered
            .lock()
            .unwrap()
            .push((name.to_string(), Arc::downgrade(fan_out)));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Total tuples successfully enqueued.
    pub fn count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// (queued, capacity); (0, 0) once closed.
    pub fn queue_status(&self) -> (usize, usize) {
        if self.shared.is_closed() {
            return (0, 0);
        }
        (self.shared.queue.lock().unwrap().len(), self.shared.capacity)
    }
}

/// Receiving end of a pipe. Cloneable so several fan-in workers can pull
/// from the same edge.
#[derive(Clone)]
pub struct PipeReceiver {
    shared: Arc<PipeShared>,
    sender: Arc<PipeSender>,
}

impl PipeReceiver {
    /// Receives the next tuple, waiting when the queue is empty. Returns
    /// `None` once the pipe is closed and fully drained. Cancel safe: a
    /// tuple is only removed in the same poll that returns it.
    pub async fn recv(&self) -> Option<Tuple> {
        let mut notified = std::pin::pin!(self.shared.readable.notified());
        loop {
            notified.as_mut().enable();
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if let Some(t) = queue.pop_front() {
                    drop(queue);
                    self.shared.writable.notify_waiters();
                    return Some(t);
                }
                if self.shared.is_closed() {
                    return None;
                }
            }
            notified.as_mut().await;
            notified.set(self.shared.readable.notified());
        }
    }

    /// Non-blocking receive; `None` means "nothing immediately available"
    /// (which includes EOF - callers check `is_closed` when it matters).
    pub fn try_recv(&self) -> Option<Tuple> {
        let mut queue = self.shared.queue.lock().unwrap();
        let t = queue.pop_front();
        if t.is_some() {
            drop(queue);
            self.shared.writable.notify_waiters();
        }
        t
    }

    /// Closing the receiver does not close the queue directly; the sender
    /// side performs the close so a writer blocked on a full queue cannot
    /// deadlock against it.
    pub fn close(&self) {
        let sender = self.sender.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                sender.close();
            });
        } else {
            sender.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub(crate) fn sender(&self) -> &Arc<PipeSender> {
        &self.sender
    }
}
