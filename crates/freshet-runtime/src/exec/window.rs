//! Windowed tuple buffers
//!
//! One window per FROM relation. Entries stay in arrival order; eviction is
//! from the head when the declared range is exceeded. For time-based units
//! the range is measured against the arriving tuple's timestamp, so window
//! progress follows tuple time rather than the wall clock.
//!
//! Every admission gets a sequence number. It is the tuple's identity for
//! emitter diffing: re-admitting an identical payload is still a new row,
//! which is what makes ISTREAM over a `RANGE 1 TUPLES` window behave as a
//! plain stream filter.

use chrono::Duration;
use freshet_core::ast::{WindowSpec, WindowUnit};
use freshet_core::Tuple;
use std::collections::VecDeque;

pub struct Window {
    spec: WindowSpec,
    buf: VecDeque<(u64, Tuple)>,
    next_seq: u64,
}

impl Window {
    pub fn new(spec: WindowSpec) -> Self {
        Self {
            spec,
            buf: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Admits a tuple, evicting from the head until the bound holds again.
    pub fn push(&mut self, tuple: Tuple) {
        let seq = self.next_seq;
        self.next_seq += 1;
        match self.spec.unit {
            WindowUnit::Tuples => {
                self.buf.push_back((seq, tuple));
                while self.buf.len() > self.spec.range as usize {
                    self.buf.pop_front();
                }
            }
            WindowUnit::Seconds | WindowUnit::Milliseconds => {
                let range = match self.spec.unit {
                    WindowUnit::Seconds => Duration::seconds(self.spec.range),
                    _ => Duration::milliseconds(self.spec.range),
                };
                let cutoff = tuple.timestamp - range;
                self.buf.push_back((seq, tuple));
                while self
                    .buf
                    .front()
                    .map(|(_, head)| head.timestamp < cutoff)
                    .unwrap_or(false)
                {
                    self.buf.pop_front();
                }
            }
        }
    }

    /// (admission sequence, tuple) pairs in arrival order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &Tuple)> {
        self.buf.iter().map(|(seq, t)| (*seq, t))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether a `RANGE 1 TUPLES` window backs this relation; grouped
    /// queries may project bare columns only from such windows.
    pub fn is_singleton(&self) -> bool {
        self.spec.unit == WindowUnit::Tuples && self.spec.range == 1
    }
}
