//! Scan executor.
//!
//! The leaf of a materialized view's DAG, bound to the feeding table. At
//! runtime the push engine never scans live data; this node receives the
//! feeding table's row stream (and the fill's snapshot pages) and applies
//! the optional column projection.

use std::sync::Arc;

use async_trait::async_trait;

use rill_common::{ColumnType, Error, Result, Row, Rows, RowsBatch, RowsEntry};

use crate::exec::{ExecutionContext, ExecutorBase, PushExecutor};
use crate::meta::TableInfo;

pub struct Scan {
    base: ExecutorBase,
    /// Indexes into the feeding table's columns; identity when the scan
    /// selects every column.
    cols: Vec<usize>,
    identity: bool,
}

impl Scan {
    pub fn new(table: &TableInfo, cols: Option<Vec<usize>>) -> Result<Self> {
        let cols = match cols {
            Some(cols) => cols,
            None => (0..table.column_types.len()).collect(),
        };
        let identity = cols.iter().copied().eq(0..table.column_types.len());
        let mut names = Vec::with_capacity(cols.len());
        let mut types = Vec::with_capacity(cols.len());
        for &col in &cols {
            if col >= table.column_types.len() {
                return Err(Error::user(format!(
                    "scan column {col} out of range for table {}",
                    table.name
                )));
            }
            names.push(table.column_names[col].clone());
            types.push(table.column_types[col]);
        }
        // Key columns must be part of the scan output.
        let mut key_cols = Vec::with_capacity(table.pk_cols.len());
        for pk_col in &table.pk_cols {
            let position = cols.iter().position(|c| c == pk_col).ok_or_else(|| {
                Error::user(format!(
                    "scan of table {} must include key column {pk_col}",
                    table.name
                ))
            })?;
            key_cols.push(position);
        }
        Ok(Self {
            base: ExecutorBase::new(names, types, key_cols),
            cols,
            identity,
        })
    }

    fn project(&self, row: &Row) -> Row {
        Row::new(self.cols.iter().map(|c| row.value(*c).clone()).collect())
    }
}

#[async_trait]
impl PushExecutor for Scan {
    fn col_names(&self) -> &[String] {
        self.base.col_names()
    }

    fn col_types(&self) -> &[ColumnType] {
        self.base.col_types()
    }

    fn key_cols(&self) -> &[usize] {
        self.base.key_cols()
    }

    fn set_parent(&self, parent: Arc<dyn PushExecutor>) {
        self.base.set_parent(parent);
    }

    async fn handle_rows(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> Result<()> {
        if self.identity {
            return self.base.forward(batch, ctx).await;
        }
        let mut rows = Rows::with_capacity(batch.len());
        let mut entries = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let prev = batch.previous_row(i).map(|row| {
                rows.append(self.project(row));
                rows.len() - 1
            });
            let curr = batch.current_row(i).map(|row| {
                rows.append(self.project(row));
                rows.len() - 1
            });
            entries.push(RowsEntry::new(prev, curr));
        }
        self.base.forward(RowsBatch::new(rows, entries), ctx).await
    }
}
