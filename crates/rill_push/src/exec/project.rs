//! Projection executor.

use std::sync::Arc;

use async_trait::async_trait;

use rill_common::{ColumnType, Error, Result, Row, Rows, RowsBatch, RowsEntry};

use crate::exec::{ExecutionContext, ExecutorBase, PushExecutor};
use crate::plan::Expr;

/// Evaluates one expression per output column. Key columns must survive
/// the projection as plain column references so downstream executors can
/// still identify rows; the constructor derives the new key positions.
pub struct Projection {
    base: ExecutorBase,
    exprs: Vec<Expr>,
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection").field("exprs", &self.exprs).finish()
    }
}

impl Projection {
    pub fn new(
        exprs: Vec<Expr>,
        output_names: Vec<String>,
        child_types: &[ColumnType],
        child_key_cols: &[usize],
    ) -> Result<Self> {
        let mut col_types = Vec::with_capacity(exprs.len());
        for expr in &exprs {
            col_types.push(expr.result_type(child_types)?);
        }
        let mut key_cols = Vec::with_capacity(child_key_cols.len());
        for key_col in child_key_cols {
            let position = exprs
                .iter()
                .position(|e| matches!(e, Expr::ColumnRef(idx) if idx == key_col));
            match position {
                Some(position) => key_cols.push(position),
                None => {
                    return Err(Error::user(
                        "projection must preserve the key columns of its input",
                    ));
                }
            }
        }
        Ok(Self {
            base: ExecutorBase::new(output_names, col_types, key_cols),
            exprs,
        })
    }

    fn project_row(&self, row: &Row) -> Result<Row> {
        let mut values = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            values.push(expr.eval(row)?);
        }
        Ok(Row::new(values))
    }
}

#[async_trait]
impl PushExecutor for Projection {
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
        let mut rows = Rows::with_capacity(batch.len());
        let mut entries = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let prev = match batch.previous_row(i) {
                Some(row) => {
                    rows.append(self.project_row(row)?);
                    Some(rows.len() - 1)
                }
                None => None,
            };
            let curr = match batch.current_row(i) {
                Some(row) => {
                    rows.append(self.project_row(row)?);
                    Some(rows.len() - 1)
                }
                None => None,
            };
            entries.push(RowsEntry::new(prev, curr));
        }
        self.base.forward(RowsBatch::new(rows, entries), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use rill_common::Value;
    use rill_store::{keys, Cluster, LocalCluster};

    use crate::forward::Forwarder;
    use crate::plan::BinOp;

    struct Collector {
        seen: Mutex<Vec<RowsBatch>>,
    }

    #[async_trait]
    impl PushExecutor for Collector {
        fn col_names(&self) -> &[String] {
            &[]
        }
        fn col_types(&self) -> &[ColumnType] {
            &[]
        }
        fn key_cols(&self) -> &[usize] {
            &[]
        }
        fn set_parent(&self, _parent: Arc<dyn PushExecutor>) {}
        async fn handle_rows(&self, batch: RowsBatch, _ctx: &mut ExecutionContext) -> Result<()> {
            self.seen.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn context(dir: &tempfile::TempDir) -> ExecutionContext {
        let cluster: Arc<dyn Cluster> = LocalCluster::new(1, dir.path()).unwrap();
        let forwarder = Forwarder::new(cluster.clone());
        ExecutionContext::new(keys::DATA_SHARD_BASE, cluster, forwarder)
    }

    fn child_types() -> Vec<ColumnType> {
        vec![ColumnType::BigInt, ColumnType::Varchar, ColumnType::Int]
    }

    #[tokio::test]
    async fn projects_rows_and_remaps_key_columns() {
        let projection = Projection::new(
            vec![Expr::column(2), Expr::column(0)],
            vec!["v".into(), "id".into()],
            &child_types(),
            &[0],
        )
        .unwrap();
        // The key column moved from child position 0 to output position 1.
        assert_eq!(projection.key_cols(), &[1]);

        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        projection.set_parent(collector.clone());

        let mut rows = Rows::new();
        rows.append(Row::new(vec![
            Value::Int(1),
            Value::Varchar("a".into()),
            Value::Int(10),
        ]));
        rows.append(Row::new(vec![
            Value::Int(1),
            Value::Varchar("a".into()),
            Value::Int(20),
        ]));
        let batch = RowsBatch::new(rows, vec![RowsEntry::new(Some(0), Some(1))]);

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        projection.handle_rows(batch, &mut ctx).await.unwrap();

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let out = &seen[0];
        assert_eq!(out.len(), 1);
        assert_eq!(
            out.previous_row(0).unwrap().values(),
            &[Value::Int(10), Value::Int(1)]
        );
        assert_eq!(
            out.current_row(0).unwrap().values(),
            &[Value::Int(20), Value::Int(1)]
        );
    }

    #[tokio::test]
    async fn evaluates_expressions_per_row() {
        let projection = Projection::new(
            vec![
                Expr::column(0),
                Expr::binary(BinOp::Add, Expr::column(2), Expr::literal(Value::Int(5))),
            ],
            vec!["id".into(), "v_plus".into()],
            &child_types(),
            &[0],
        )
        .unwrap();
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        projection.set_parent(collector.clone());

        let mut rows = Rows::new();
        rows.append(Row::new(vec![
            Value::Int(7),
            Value::Varchar("x".into()),
            Value::Int(10),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        projection
            .handle_rows(RowsBatch::from_current(rows), &mut ctx)
            .await
            .unwrap();

        let seen = collector.seen.lock().unwrap();
        assert_eq!(
            seen[0].current_row(0).unwrap().values(),
            &[Value::Int(7), Value::Int(15)]
        );
    }

    #[test]
    fn rejects_projections_that_drop_key_columns() {
        let err = Projection::new(
            vec![Expr::column(1)],
            vec!["name".into()],
            &child_types(),
            &[0],
        )
        .unwrap_err();
        assert!(matches!(err, Error::User(_)));
    }
}
