//! Union-all executor.
//!
//! Appends a branch tag column so rows from different inputs can never
//! collide on their keys downstream; the tag participates in the key. The
//! tag base comes from the cluster sequence at build time, so rebuilt
//! views get fresh tags.

use std::sync::Arc;

use async_trait::async_trait;

use rill_common::{ColumnType, Error, Result, Row, Rows, RowsBatch, RowsEntry, Value};

use crate::exec::{ExecutionContext, ExecutorBase, PushExecutor};

pub struct UnionAll {
    base: ExecutorBase,
}

impl UnionAll {
    /// All children must share a schema; the output appends a BigInt tag
    /// column which joins the key.
    pub fn new(
        child_names: Vec<String>,
        child_types: Vec<ColumnType>,
        child_key_cols: Vec<usize>,
    ) -> Arc<Self> {
        let mut names = child_names;
        names.push("__branch".to_string());
        let mut types = child_types;
        types.push(ColumnType::BigInt);
        let tag_col = types.len() - 1;
        let mut key_cols = child_key_cols;
        key_cols.push(tag_col);
        Arc::new(Self {
            base: ExecutorBase::new(names, types, key_cols),
        })
    }

    /// The executor a branch child forwards to; tags rows with
    /// `tag_base + index`.
    pub fn branch(self: &Arc<Self>, tag_base: u64, index: usize) -> Arc<UnionBranch> {
        Arc::new(UnionBranch {
            union: self.clone(),
            tag: (tag_base + index as u64) as i64,
        })
    }

    pub fn validate_children(children: &[&dyn PushExecutor]) -> Result<()> {
        let Some(first) = children.first() else {
            return Err(Error::user("union requires at least one input"));
        };
        for child in &children[1..] {
            if child.col_types() != first.col_types() {
                return Err(Error::user("union inputs must share a schema"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PushExecutor for UnionAll {
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

    /// Rows arrive already tagged through a [`UnionBranch`].
    async fn handle_rows(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> Result<()> {
        self.base.forward(batch, ctx).await
    }
}

/// Per-input adapter that appends the branch tag.
pub struct UnionBranch {
    union: Arc<UnionAll>,
    tag: i64,
}

impl UnionBranch {
    fn tag_row(&self, row: &Row) -> Row {
        let mut values = row.values().to_vec();
        values.push(Value::Int(self.tag));
        Row::new(values)
    }
}

#[async_trait]
impl PushExecutor for UnionBranch {
    fn col_names(&self) -> &[String] {
        self.union.col_names()
    }

    fn col_types(&self) -> &[ColumnType] {
        self.union.col_types()
    }

    fn key_cols(&self) -> &[usize] {
        self.union.key_cols()
    }

    fn set_parent(&self, _parent: Arc<dyn PushExecutor>) {
        panic!("union branches forward through their union");
    }

    async fn handle_rows(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> Result<()> {
        let mut rows = Rows::with_capacity(batch.len());
        let mut entries = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let prev = batch.previous_row(i).map(|row| {
                rows.append(self.tag_row(row));
                rows.len() - 1
            });
            let curr = batch.current_row(i).map(|row| {
                rows.append(self.tag_row(row));
                rows.len() - 1
            });
            entries.push(RowsEntry::new(prev, curr));
        }
        self.union
            .handle_rows(RowsBatch::new(rows, entries), ctx)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use rill_store::{keys, Cluster, LocalCluster};

    use crate::forward::Forwarder;

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

    struct StubExec {
        names: Vec<String>,
        types: Vec<ColumnType>,
    }

    #[async_trait]
    impl PushExecutor for StubExec {
        fn col_names(&self) -> &[String] {
            &self.names
        }
        fn col_types(&self) -> &[ColumnType] {
            &self.types
        }
        fn key_cols(&self) -> &[usize] {
            &[]
        }
        fn set_parent(&self, _parent: Arc<dyn PushExecutor>) {}
        async fn handle_rows(&self, _batch: RowsBatch, _ctx: &mut ExecutionContext) -> Result<()> {
            Ok(())
        }
    }

    fn context(dir: &tempfile::TempDir) -> ExecutionContext {
        let cluster: Arc<dyn Cluster> = LocalCluster::new(1, dir.path()).unwrap();
        let forwarder = Forwarder::new(cluster.clone());
        ExecutionContext::new(keys::DATA_SHARD_BASE, cluster, forwarder)
    }

    fn union_over(names: &[&str], types: Vec<ColumnType>) -> Arc<UnionAll> {
        UnionAll::new(
            names.iter().map(|n| n.to_string()).collect(),
            types,
            vec![0],
        )
    }

    #[tokio::test]
    async fn branches_tag_rows_and_extend_the_key() {
        let union = union_over(&["id", "v"], vec![ColumnType::BigInt, ColumnType::Varchar]);
        assert_eq!(union.col_names().last().map(String::as_str), Some("__branch"));
        assert_eq!(union.key_cols(), &[0, 2]);

        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        union.set_parent(collector.clone());
        let branch_a = union.branch(100, 0);
        let branch_b = union.branch(100, 1);

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        // The same logical row arrives through both inputs.
        for branch in [&branch_a, &branch_b] {
            let mut rows = Rows::new();
            rows.append(Row::new(vec![Value::Int(1), Value::Varchar("x".into())]));
            branch
                .handle_rows(RowsBatch::from_current(rows), &mut ctx)
                .await
                .unwrap();
        }

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let first = seen[0].current_row(0).unwrap();
        let second = seen[1].current_row(0).unwrap();
        // Identical except for the branch tag, which keeps their keys
        // distinct downstream.
        assert_eq!(first.value(0), second.value(0));
        assert_eq!(first.value(1), second.value(1));
        assert_eq!(first.value(2), &Value::Int(100));
        assert_eq!(second.value(2), &Value::Int(101));
    }

    #[tokio::test]
    async fn branches_tag_both_sides_of_updates() {
        let union = union_over(&["id"], vec![ColumnType::BigInt]);
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        union.set_parent(collector.clone());
        let branch = union.branch(7, 0);

        let mut rows = Rows::new();
        rows.append(Row::new(vec![Value::Int(1)]));
        let batch = RowsBatch::new(rows, vec![RowsEntry::new(Some(0), None)]);
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        branch.handle_rows(batch, &mut ctx).await.unwrap();

        let seen = collector.seen.lock().unwrap();
        let out = &seen[0];
        assert_eq!(
            out.previous_row(0).unwrap().values(),
            &[Value::Int(1), Value::Int(7)]
        );
        assert!(out.current_row(0).is_none());
    }

    #[test]
    fn mismatched_child_schemas_are_rejected() {
        let a = StubExec {
            names: vec!["id".into()],
            types: vec![ColumnType::BigInt],
        };
        let b = StubExec {
            names: vec!["id".into()],
            types: vec![ColumnType::Varchar],
        };
        let same = StubExec {
            names: vec!["id".into()],
            types: vec![ColumnType::BigInt],
        };

        assert!(UnionAll::validate_children(&[&a, &same]).is_ok());
        let err = UnionAll::validate_children(&[&a, &b]).unwrap_err();
        assert!(matches!(err, Error::User(_)));
        assert!(UnionAll::validate_children(&[]).is_err());
    }
}
