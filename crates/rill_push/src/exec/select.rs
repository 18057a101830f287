//! Selection (filter) executor.

use std::sync::Arc;

use async_trait::async_trait;

use rill_common::{ColumnType, Result, Row, Rows, RowsBatch, RowsEntry};

use crate::exec::{ExecutionContext, ExecutorBase, PushExecutor};
use crate::plan::Expr;

/// Filters each side of an entry independently: a previous row that
/// matched and a current row that no longer does turns an update into a
/// delete downstream, and vice versa.
pub struct Selection {
    base: ExecutorBase,
    predicates: Vec<Expr>,
}

impl Selection {
    pub fn new(
        predicates: Vec<Expr>,
        child_names: Vec<String>,
        child_types: Vec<ColumnType>,
        child_key_cols: Vec<usize>,
    ) -> Self {
        Self {
            base: ExecutorBase::new(child_names, child_types, child_key_cols),
            predicates,
        }
    }

    fn matches(&self, row: &Row) -> Result<bool> {
        for predicate in &self.predicates {
            if !predicate.eval_predicate(row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl PushExecutor for Selection {
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
        let mut rows = Rows::new();
        let mut entries = Vec::new();
        for i in 0..batch.len() {
            let prev = match batch.previous_row(i) {
                Some(row) if self.matches(row)? => {
                    rows.append(row.clone());
                    Some(rows.len() - 1)
                }
                _ => None,
            };
            let curr = match batch.current_row(i) {
                Some(row) if self.matches(row)? => {
                    rows.append(row.clone());
                    Some(rows.len() - 1)
                }
                _ => None,
            };
            if prev.is_some() || curr.is_some() {
                entries.push(RowsEntry::new(prev, curr));
            }
        }
        if entries.is_empty() {
            return Ok(());
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

    fn selection_over_v_gt_5() -> (Selection, Arc<Collector>) {
        let selection = Selection::new(
            vec![Expr::binary(
                BinOp::Gt,
                Expr::column(1),
                Expr::literal(Value::Int(5)),
            )],
            vec!["k".into(), "v".into()],
            vec![ColumnType::BigInt, ColumnType::Int],
            vec![0],
        );
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        selection.set_parent(collector.clone());
        (selection, collector)
    }

    fn row(k: i64, v: i64) -> Row {
        Row::new(vec![Value::Int(k), Value::Int(v)])
    }

    #[tokio::test]
    async fn filters_each_side_independently() {
        let (selection, collector) = selection_over_v_gt_5();

        let mut rows = Rows::new();
        rows.append(row(1, 10)); // prev of entry 0: matches
        rows.append(row(1, 3)); //  curr of entry 0: fails
        rows.append(row(2, 2)); //  prev of entry 1: fails
        rows.append(row(2, 8)); //  curr of entry 1: matches
        rows.append(row(3, 1)); //  prev of entry 2: fails
        rows.append(row(3, 2)); //  curr of entry 2: fails
        let batch = RowsBatch::new(
            rows,
            vec![
                RowsEntry::new(Some(0), Some(1)),
                RowsEntry::new(Some(2), Some(3)),
                RowsEntry::new(Some(4), Some(5)),
            ],
        );

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        selection.handle_rows(batch, &mut ctx).await.unwrap();

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let out = &seen[0];
        // An update leaving the predicate becomes a delete; one entering
        // it becomes an insert; one outside on both sides is dropped.
        assert_eq!(out.len(), 2);
        assert_eq!(out.previous_row(0), Some(&row(1, 10)));
        assert_eq!(out.current_row(0), None);
        assert_eq!(out.previous_row(1), None);
        assert_eq!(out.current_row(1), Some(&row(2, 8)));
    }

    #[tokio::test]
    async fn fully_filtered_batches_are_not_forwarded() {
        let (selection, collector) = selection_over_v_gt_5();

        let mut rows = Rows::new();
        rows.append(row(1, 1));
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        selection
            .handle_rows(RowsBatch::from_current(rows), &mut ctx)
            .await
            .unwrap();

        assert!(collector.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn null_predicate_results_do_not_match() {
        let (selection, collector) = selection_over_v_gt_5();

        let mut rows = Rows::new();
        rows.append(Row::new(vec![Value::Int(1), Value::Null]));
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        selection
            .handle_rows(RowsBatch::from_current(rows), &mut ctx)
            .await
            .unwrap();

        assert!(collector.seen.lock().unwrap().is_empty());
    }
}
