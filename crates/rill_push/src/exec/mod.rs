//! Push executors.
//!
//! A push DAG is built once per materialized view (or source) and driven
//! bottom-up: each executor transforms a [`RowsBatch`] and hands the result
//! to its parent. Executors are wired child-to-parent at build time and
//! never block; all persistence goes through the [`ExecutionContext`]'s
//! write batch, which the surrounding scheduler action proposes as one
//! replication entry.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use rill_common::{ColumnType, Result, RowsBatch};
use rill_store::{Cluster, WriteBatch};

use crate::forward::Forwarder;

pub mod agg;
pub mod project;
pub mod scan;
pub mod select;
pub mod table;
pub mod union;

/// Mutable state threaded through one DAG invocation: the write batch the
/// invocation builds, plus handles for forwarding rows to other shards.
pub struct ExecutionContext {
    pub batch: WriteBatch,
    pub cluster: Arc<dyn Cluster>,
    pub forwarder: Arc<Forwarder>,
    /// Set when the invocation queued rows for another shard, so the
    /// caller schedules a transfer after the batch commits.
    pub queued_forwards: bool,
}

impl ExecutionContext {
    pub fn new(shard_id: u64, cluster: Arc<dyn Cluster>, forwarder: Arc<Forwarder>) -> Self {
        Self {
            batch: WriteBatch::new(shard_id, false),
            cluster,
            forwarder,
            queued_forwards: false,
        }
    }

    pub fn shard_id(&self) -> u64 {
        self.batch.shard_id
    }
}

#[async_trait]
pub trait PushExecutor: Send + Sync {
    fn col_names(&self) -> &[String];
    fn col_types(&self) -> &[ColumnType];
    /// Indexes of the key columns within this executor's output schema.
    fn key_cols(&self) -> &[usize];

    /// Wire the downstream executor; called once at build time.
    fn set_parent(&self, parent: Arc<dyn PushExecutor>);

    async fn handle_rows(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> Result<()>;
}

/// Schema plus parent pointer shared by the executor implementations.
pub struct ExecutorBase {
    col_names: Vec<String>,
    col_types: Vec<ColumnType>,
    key_cols: Vec<usize>,
    parent: OnceLock<Arc<dyn PushExecutor>>,
}

impl ExecutorBase {
    pub fn new(col_names: Vec<String>, col_types: Vec<ColumnType>, key_cols: Vec<usize>) -> Self {
        Self {
            col_names,
            col_types,
            key_cols,
            parent: OnceLock::new(),
        }
    }

    pub fn col_names(&self) -> &[String] {
        &self.col_names
    }

    pub fn col_types(&self) -> &[ColumnType] {
        &self.col_types
    }

    pub fn key_cols(&self) -> &[usize] {
        &self.key_cols
    }

    pub fn set_parent(&self, parent: Arc<dyn PushExecutor>) {
        if self.parent.set(parent).is_err() {
            panic!("executor parent already wired");
        }
    }

    pub async fn forward(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> Result<()> {
        match self.parent.get() {
            Some(parent) => parent.handle_rows(batch, ctx).await,
            // The DAG sink (a table executor) has no parent.
            None => Ok(()),
        }
    }
}
