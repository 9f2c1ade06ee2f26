//! Emitters: turning window result sets into output streams
//!
//! RSTREAM relays the whole result set after every input tuple. ISTREAM
//! emits rows newly present compared to the previous result set, DSTREAM
//! rows that disappeared. The differences are multiset differences over a
//! canonical row encoding; floats compare bit-for-bit.

use chrono::{DateTime, Utc};
use freshet_core::ast::{Emitter, EmitterMode, Sampler};
use freshet_core::{Map, TraceEvent, Value};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// One projected row plus the metadata its output tuple will carry.
///
/// Row identity covers the projected data and, for non-grouped rows, the
/// window admission sequence of every source tuple in the row. Re-admitting
/// an identical payload therefore still counts as a new row; grouped rows
/// pass no origins and compare by data alone.
#[derive(Debug, Clone)]
pub struct OutputRow {
    pub data: Map,
    pub timestamp: DateTime<Utc>,
    pub trace: Vec<TraceEvent>,
    pub batch_id: u64,
    key: Vec<u8>,
}

impl OutputRow {
    pub fn new(
        data: Map,
        origins: &[u64],
        timestamp: DateTime<Utc>,
        trace: Vec<TraceEvent>,
        batch_id: u64,
    ) -> Self {
        let mut key = Vec::with_capacity(origins.len() * 8 + 32);
        for origin in origins {
            key.extend_from_slice(&origin.to_le_bytes());
        }
        Value::Map(data.clone()).encode_canonical(&mut key);
        Self {
            data,
            timestamp,
            trace,
            batch_id,
            key,
        }
    }
}

/// Per-box emitter state: the previous result set and sampler bookkeeping.
pub struct EmitterState {
    mode: EmitterMode,
    prev: Vec<OutputRow>,
    limit_remaining: Option<i64>,
    every_kth: Option<i64>,
    trigger_count: u64,
    sample_percent: Option<f64>,
    interval: Option<Duration>,
    last_emit: Option<Instant>,
}

impl EmitterState {
    pub fn new(emitter: &Emitter) -> Self {
        let mut state = Self {
            mode: emitter.mode,
            prev: Vec::new(),
            limit_remaining: None,
            every_kth: None,
            trigger_count: 0,
            sample_percent: None,
            interval: None,
            last_emit: None,
        };
        for sampler in &emitter.samplers {
            match sampler {
                Sampler::Limit(k) => state.limit_remaining = Some(*k),
                Sampler::EveryKth(k) => state.every_kth = Some(*k),
                Sampler::SamplePercent(p) => state.sample_percent = Some(*p),
                Sampler::EveryInterval { millis } => {
                    state.interval = Some(Duration::from_millis(*millis as u64))
                }
            }
        }
        state
    }

    /// Feeds the result set produced by one input tuple and returns the rows
    /// to emit after mode selection and sampling.
    pub fn emit(&mut self, current: Vec<OutputRow>) -> Vec<OutputRow> {
        let selected = match self.mode {
            EmitterMode::Rstream => current.clone(),
            EmitterMode::Istream => multiset_difference(&current, &self.prev),
            EmitterMode::Dstream => multiset_difference(&self.prev, &current),
        };
        self.prev = current;

        self.trigger_count += 1;
        if let Some(k) = self.every_kth {
            if self.trigger_count % k as u64 != 0 {
                return Vec::new();
            }
        }

        let mut out = Vec::with_capacity(selected.len());
        for row in selected {
            if let Some(0) = self.limit_remaining {
                break;
            }
            if let Some(p) = self.sample_percent {
                if !rand::thread_rng().gen_bool((p / 100.0).clamp(0.0, 1.0)) {
                    continue;
                }
            }
            if let Some(interval) = self.interval {
                let now = Instant::now();
                if let Some(last) = self.last_emit {
                    if now.duration_since(last) < interval {
                        continue;
                    }
                }
                self.last_emit = Some(now);
            }
            if let Some(remaining) = &mut self.limit_remaining {
                *remaining -= 1;
            }
            out.push(row);
        }
        out
    }
}

/// Rows of `minuend` not matched by `subtrahend`, multiset semantics,
/// preserving order.
fn multiset_difference(minuend: &[OutputRow], subtrahend: &[OutputRow]) -> Vec<OutputRow> {
    let mut counts: FxHashMap<&[u8], usize> = FxHashMap::default();
    for row in subtrahend {
        *counts.entry(row.key.as_slice()).or_insert(0) += 1;
    }
    let mut out = Vec::new();
    for row in minuend {
        match counts.get_mut(row.key.as_slice()) {
            Some(n) if *n > 0 => *n -= 1,
            _ => out.push(row.clone()),
        }
    }
    out
}
