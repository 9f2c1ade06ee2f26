//! Tuples flowing through topologies

use crate::value::{Map, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Header flags of a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TupleFlags(u8);

impl TupleFlags {
    /// The tuple is visible to more than one downstream consumer. Once set,
    /// the data map must not be mutated in place; mutation requires a copy.
    pub const SHARED: TupleFlags = TupleFlags(1);

    pub fn set(&mut self, flag: TupleFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: TupleFlags) {
        self.0 &= !flag.0;
    }

    pub fn is_set(&self, flag: TupleFlags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

/// Kind of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEventType {
    /// The tuple arrived at a node.
    Input,
    /// The tuple left a node.
    Output,
}

/// One hop in a tuple's journey through the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub event_type: TraceEventType,
    /// Name of the node the event happened at.
    pub msg: String,
    pub time: DateTime<Utc>,
}

impl TraceEvent {
    pub fn input(node: impl Into<String>) -> Self {
        Self {
            event_type: TraceEventType::Input,
            msg: node.into(),
            time: Utc::now(),
        }
    }

    pub fn output(node: impl Into<String>) -> Self {
        Self {
            event_type: TraceEventType::Output,
            msg: node.into(),
            time: Utc::now(),
        }
    }
}

/// A tuple: a value object carrying one record through the topology.
///
/// The data map is behind an `Arc` so that fanning a tuple out to several
/// destinations shares the payload instead of deep-copying it. All mutation
/// goes through [`Tuple::data_mut`], which copies on write, so a shared map
/// is never modified in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuple {
    data: Arc<Map>,
    /// Physical time of the represented event.
    pub timestamp: DateTime<Utc>,
    /// Time the tuple entered the topology.
    pub processed_at: DateTime<Utc>,
    pub flags: TupleFlags,
    /// Name of the input edge the tuple arrived on.
    pub input_name: String,
    pub trace: Vec<TraceEvent>,
    /// Monotonically increasing id assigned by the owning source.
    pub batch_id: u64,
}

impl Tuple {
    pub fn new(data: Map) -> Self {
        let now = Utc::now();
        Self {
            data: Arc::new(data),
            timestamp: now,
            processed_at: now,
            flags: TupleFlags::default(),
            input_name: String::new(),
            trace: Vec::new(),
            batch_id: 0,
        }
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data_mut().insert(key.into(), value.into());
        self
    }

    pub fn with_batch_id(mut self, id: u64) -> Self {
        self.batch_id = id;
        self
    }

    pub fn data(&self) -> &Map {
        &self.data
    }

    /// Mutable access to the data map. Copies the map when it is shared with
    /// another tuple, keeping the shared-flag invariant intact.
    pub fn data_mut(&mut self) -> &mut Map {
        Arc::make_mut(&mut self.data)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(|v| v.as_int())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn is_shared(&self) -> bool {
        self.flags.is_set(TupleFlags::SHARED)
    }

    pub fn set_shared(&mut self) {
        self.flags.set(TupleFlags::SHARED);
    }

    /// Copies the header while sharing the data map. The copy starts out
    /// unshared; the sender decides whether to mark it again.
    pub fn shallow_copy(&self) -> Tuple {
        let mut t = self.clone();
        t.flags.clear(TupleFlags::SHARED);
        t
    }

    pub fn add_trace_event(&mut self, event: TraceEvent) {
        self.trace.push(event);
    }

    /// True when both tuples still point at the same data allocation.
    pub fn shares_data_with(&self, other: &Tuple) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_builder() {
        let t = Tuple::new(Map::new())
            .with_field("int", 4i64)
            .with_field("name", "x");
        assert_eq!(t.get_int("int"), Some(4));
        assert_eq!(t.get_str("name"), Some("x"));
        assert_eq!(t.batch_id, 0);
    }

    #[test]
    fn test_flags() {
        let mut f = TupleFlags::default();
        assert!(!f.is_set(TupleFlags::SHARED));
        f.set(TupleFlags::SHARED);
        assert!(f.is_set(TupleFlags::SHARED));
        f.clear(TupleFlags::SHARED);
        assert!(!f.is_set(TupleFlags::SHARED));
    }

    #[test]
    fn test_shallow_copy_shares_data() {
        let mut t = Tuple::new(Map::new()).with_field("a", 1i64);
        t.set_shared();
        let c = t.shallow_copy();
        assert!(t.shares_data_with(&c));
        assert!(!c.is_shared());
        assert_eq!(c.get_int("a"), Some(1));
    }

    #[test]
    fn test_copy_on_write_leaves_original_untouched() {
        let t = Tuple::new(Map::new()).with_field("a", 1i64);
        let mut c = t.shallow_copy();
        c.data_mut().insert("a".to_string(), Value::Int(2));
        assert_eq!(t.get_int("a"), Some(1));
        assert_eq!(c.get_int("a"), Some(2));
        assert!(!t.shares_data_with(&c));
    }

    #[test]
    fn test_trace_accumulates_in_order() {
        let mut t = Tuple::new(Map::new());
        t.add_trace_event(TraceEvent::output("source"));
        t.add_trace_event(TraceEvent::input("box"));
        assert_eq!(t.trace.len(), 2);
        assert_eq!(t.trace[0].event_type, TraceEventType::Output);
        assert_eq!(t.trace[0].msg, "source");
        assert_eq!(t.trace[1].event_type, TraceEventType::Input);
    }
}
