//! Runtime error kinds
//!
//! `PipeClosed` is a sentinel: writers treat it as "destination gone, remove
//! silently" and it is never surfaced to users. `Fatal` terminates the node
//! it occurs on; `Temporary` marks errors where a retry could succeed.

use freshet_core::ValueError;
use freshet_parser::ParseError;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("plan error: {0}")]
    Plan(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("temporary error: {0}")]
    Temporary(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("pipe closed")]
    PipeClosed,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn plan(msg: impl Into<String>) -> Self {
        RuntimeError::Plan(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        RuntimeError::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Fatal(_))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, RuntimeError::Temporary(_))
    }

    /// Wraps any error as fatal, leaving already-fatal errors untouched.
    pub fn fatalize(self) -> Self {
        match self {
            RuntimeError::Fatal(_) => self,
            other => RuntimeError::Fatal(other.to_string()),
        }
    }
}

impl From<ValueError> for RuntimeError {
    fn from(e: ValueError) -> Self {
        RuntimeError::Type(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatalize() {
        let e = RuntimeError::Runtime("boom".to_string()).fatalize();
        assert!(e.is_fatal());
        let e = RuntimeError::Fatal("already".to_string()).fatalize();
        assert_eq!(e.to_string(), "fatal error: already");
    }

    #[test]
    fn test_kind_helpers() {
        assert!(RuntimeError::Temporary("x".into()).is_temporary());
        assert!(!RuntimeError::PipeClosed.is_fatal());
    }
}
