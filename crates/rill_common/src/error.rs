//! Error taxonomy for the engine.
//!
//! Errors are categorized by how callers should react:
//!
//! - **User errors** are returned to the client verbatim (bad statements,
//!   unknown schema objects).
//! - **Internal errors** are assigned a monotonic sequence number; the caller
//!   only sees the number while the full detail is logged server-side.
//! - **Transient errors** (cluster not ready, leader movement, timeouts) are
//!   retried with backoff up to a deadline.
//! - **Fatal errors** indicate integrity violations (wrong shard prefix,
//!   sequence regression, corrupt encodings). The state machines panic on
//!   these instead, since replay from the replicated log is the only safe
//!   recovery.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Convenience result alias used throughout the engine crates.
pub type Result<T> = std::result::Result<T, Error>;

static INTERNAL_ERROR_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid request from a client; the message is safe to return verbatim.
    #[error("{0}")]
    User(String),

    /// Named schema object does not exist.
    #[error("unknown table or view: {0}")]
    UnknownTable(String),

    /// Unexpected server-side failure. Clients receive only the sequence
    /// number; the detail was logged when the error was created.
    #[error("internal error - sequence {seq}")]
    Internal { seq: u64 },

    /// The replication group is not yet ready to serve; retryable.
    #[error("cluster not ready")]
    NotReady,

    /// Retryable failure (e.g. leadership movement, peer restart).
    #[error("transient failure: {0}")]
    Transient(String),

    /// A deadline elapsed before the operation completed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed persisted or wire data.
    #[error("corrupt encoding: {0}")]
    Corrupt(String),

    /// Integrity violation; the process cannot safely continue the operation.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// Record an internal error: logs the full detail, returns the opaque
    /// sequence-numbered error for the client.
    pub fn internal(detail: impl Display) -> Self {
        let seq = INTERNAL_ERROR_SEQ.fetch_add(1, Ordering::Relaxed);
        tracing::error!(seq, %detail, "internal error");
        Error::Internal { seq }
    }

    pub fn user(msg: impl Into<String>) -> Self {
        Error::User(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// True for errors a caller should retry after a short delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotReady | Error::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_get_distinct_sequences() {
        let a = Error::internal("boom");
        let b = Error::internal("bang");
        let (Error::Internal { seq: sa }, Error::Internal { seq: sb }) = (a, b) else {
            panic!("expected internal errors");
        };
        assert_ne!(sa, sb);
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::NotReady.is_retryable());
        assert!(Error::Transient("leader moved".into()).is_retryable());
        assert!(!Error::user("bad statement").is_retryable());
        assert!(!Error::fatal("wrong shard").is_retryable());
    }
}
