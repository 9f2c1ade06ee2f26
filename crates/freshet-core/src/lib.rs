//! Freshet Core - Values, tuples and the FQL AST
//!
//! This crate provides the foundational types for the Freshet continuous
//! query engine: the dynamic [`Value`] model, JSON-style path navigation
//! over values, the [`Tuple`] flowing through topologies, and the abstract
//! syntax tree produced by the FQL parser.

pub mod ast;
pub mod path;
pub mod span;
pub mod tuple;
pub mod value;

pub use path::Path;
pub use span::{Span, Spanned};
pub use tuple::{TraceEvent, TraceEventType, Tuple, TupleFlags};
pub use value::{Map, Value, ValueError};
