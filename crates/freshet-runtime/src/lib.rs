//! Freshet Runtime - the streaming dataflow engine
//!
//! This crate executes FQL topologies: sources feed fan-outs, bounded pipes
//! carry tuples into the fan-ins of boxes, boxes maintain windows and emit
//! result deltas, and sinks consume the output. The planner applies parsed
//! statements to a running topology.

pub mod context;
pub mod error;
pub mod exec;
pub mod fanin;
pub mod fanout;
pub mod pipe;
pub mod planner;
pub mod registry;
pub mod sink;
pub mod source;
pub mod state;
pub mod topology;
pub mod udf;
pub mod udsf;
pub mod writer;

pub use context::Context;
pub use error::{Result, RuntimeError};
pub use fanin::FanIn;
pub use fanout::{FanOut, FanOutEvent};
pub use pipe::{pipe, DropMode, PipeReceiver, PipeSender};
pub use planner::{AdHocSelect, ApplyResult, TopologyBuilder};
pub use registry::Registry;
pub use sink::{CollectorSink, ConsoleSink, Sink};
pub use source::{BatchSource, Source};
pub use state::{MemoryStateStore, SharedState, StateStore};
pub use topology::{NodeKind, NodeState, Topology};
pub use udf::{ArgType, Udf, UdfRegistry};
pub use udsf::Udsf;
pub use writer::Writer;
