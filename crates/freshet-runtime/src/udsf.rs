//! User-defined stream functions
//!
//! A UDSF is a stream transformation instantiated from a FROM relation of
//! the form `name(args)`. The planner materializes a hidden node that
//! consumes the declared input stream and runs `process` per tuple.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::writer::Writer;
use async_trait::async_trait;
use freshet_core::{Tuple, Value};

#[async_trait]
pub trait Udsf: Send + Sync {
    /// Name of the stream this instance consumes.
    fn input_stream(&self) -> &str;

    async fn process(&self, ctx: &Context, tuple: Tuple, writer: &dyn Writer) -> Result<()>;
}

/// Adapts a UDSF into the writer chain of its hidden node.
pub struct UdsfWriter {
    udsf: std::sync::Arc<dyn Udsf>,
    out: std::sync::Arc<dyn Writer>,
}

impl UdsfWriter {
    pub fn new(udsf: std::sync::Arc<dyn Udsf>, out: std::sync::Arc<dyn Writer>) -> Self {
        Self { udsf, out }
    }
}

#[async_trait]
impl Writer for UdsfWriter {
    async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
        self.udsf.process(ctx, tuple, self.out.as_ref()).await
    }
}

/// `duplicate('stream', n)`: re-emits every input tuple n times.
pub struct DuplicateUdsf {
    input: String,
    copies: i64,
}

impl DuplicateUdsf {
    pub fn from_args(args: &[Value]) -> Result<Self> {
        if args.len() != 2 {
            return Err(RuntimeError::plan(
                "duplicate takes a stream name and a copy count",
            ));
        }
        let input = args[0]
            .as_str()
            .ok_or_else(|| RuntimeError::plan("the first argument of duplicate must be a stream name"))?
            .to_string();
        let copies = args[1].to_int().map_err(|_| {
            RuntimeError::plan("the second argument of duplicate must be an integer")
        })?;
        if copies < 1 {
            return Err(RuntimeError::plan("the copy count must be positive"));
        }
        Ok(Self { input, copies })
    }
}

#[async_trait]
impl Udsf for DuplicateUdsf {
    fn input_stream(&self) -> &str {
        &self.input
    }

    async fn process(&self, ctx: &Context, tuple: Tuple, writer: &dyn Writer) -> Result<()> {
        for _ in 0..self.copies - 1 {
            writer.write(ctx, tuple.shallow_copy()).await?;
        }
        writer.write(ctx, tuple).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_core::Map;
    use std::sync::{Arc, Mutex};

    struct Collecting {
        tuples: Mutex<Vec<Tuple>>,
    }

    #[async_trait]
    impl Writer for Collecting {
        async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
            self.tuples.lock().unwrap().push(tuple);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_emits_n_copies() {
        let ctx = Context::new();
        let udsf =
            DuplicateUdsf::from_args(&[Value::Str("source".to_string()), Value::Int(3)]).unwrap();
        assert_eq!(udsf.input_stream(), "source");

        let out = Arc::new(Collecting {
            tuples: Mutex::new(Vec::new()),
        });
        let tuple = Tuple::new(Map::new()).with_field("int", 7i64);
        udsf.process(&ctx, tuple, out.as_ref()).await.unwrap();

        let tuples = out.tuples.lock().unwrap();
        assert_eq!(tuples.len(), 3);
        assert!(tuples.iter().all(|t| t.get_int("int") == Some(7)));
    }

    #[test]
    fn test_duplicate_argument_validation() {
        assert!(DuplicateUdsf::from_args(&[Value::Int(1)]).is_err());
        assert!(
            DuplicateUdsf::from_args(&[Value::Str("s".to_string()), Value::Int(0)]).is_err()
        );
        assert!(DuplicateUdsf::from_args(&[Value::Int(1), Value::Int(2)]).is_err());
    }
}
