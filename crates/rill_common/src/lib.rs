//! Shared primitives for the Rill engine: the column/value model, row
//! batches flowing through the push executors, binary codecs for rows and
//! order-preserving keys, and the error taxonomy used across crates.
//!
//! These types are kept in a small, dependency-light crate because they are
//! used by the storage, replication and push-execution layers alike.

pub mod codec;
pub mod error;
pub mod row;
pub mod types;

pub use error::{Error, Result};
pub use row::{Row, Rows, RowsBatch, RowsEntry};
pub use types::{ColumnType, Decimal, Value};
