//! End-to-end engine behavior on a single-process cluster: ingest,
//! materialized views, aggregation under deletes, fills under concurrent
//! ingest, and replay tolerance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rill_common::{ColumnType, Result, Value};
use rill_push::{
    AggExpr, AggFunction, BinOp, EngineConfig, Expr, FakeBroker, MessageProvider, PhysicalPlan,
    PushEngine, SourceInfo, TableInfo,
};
use rill_store::{Cluster, LocalCluster};

const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

async fn start_engine(num_shards: usize) -> (tempfile::TempDir, Arc<PushEngine>) {
    let dir = tempfile::tempdir().unwrap();
    let cluster: Arc<dyn Cluster> = LocalCluster::new(num_shards, dir.path()).unwrap();
    let engine = PushEngine::new(cluster.clone(), EngineConfig::default());
    cluster.start().await.unwrap();
    engine.start().await.unwrap();
    (dir, engine)
}

fn source_info(name: &str, columns: &[(&str, ColumnType)], pk_cols: &[usize]) -> SourceInfo {
    SourceInfo {
        table: TableInfo {
            id: 0,
            name: name.to_string(),
            column_names: columns.iter().map(|(n, _)| n.to_string()).collect(),
            column_types: columns.iter().map(|(_, t)| *t).collect(),
            pk_cols: pk_cols.to_vec(),
        },
        topic: name.to_string(),
    }
}

/// Poll until `check` passes or the timeout elapses; returns the final
/// evaluation.
async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn sorted_rows(engine: &Arc<PushEngine>, table: &str) -> Result<Vec<Vec<Value>>> {
    let rows = engine.scan_table(table, -1).await?;
    let mut out: Vec<Vec<Value>> = rows.iter().map(|r| r.values().to_vec()).collect();
    out.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
    Ok(out)
}

#[tokio::test]
async fn point_insert_and_key_replay() {
    let (_dir, engine) = start_engine(4).await;
    let broker = FakeBroker::new(1);
    engine
        .create_source(
            source_info(
                "s",
                &[("a", ColumnType::Int), ("b", ColumnType::Varchar)],
                &[0],
            ),
            broker.clone(),
        )
        .await
        .unwrap();

    broker.push(br#"{"a":1}"#.to_vec(), Some(br#"{"a":1,"b":"x"}"#.to_vec()));
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "s").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(1), Value::Varchar("x".into())]]
            })
        })
        .await
    );

    // Same key again: the stored row is replaced, not duplicated.
    broker.push(br#"{"a":1}"#.to_vec(), Some(br#"{"a":1,"b":"y"}"#.to_vec()));
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "s").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(1), Value::Varchar("y".into())]]
            })
        })
        .await
    );
}

#[tokio::test]
async fn aggregation_under_delete() {
    let (_dir, engine) = start_engine(4).await;
    let broker = FakeBroker::new(2);
    engine
        .create_source(
            source_info(
                "s",
                &[
                    ("id", ColumnType::BigInt),
                    ("k", ColumnType::Int),
                    ("v", ColumnType::Int),
                ],
                &[0],
            ),
            broker.clone(),
        )
        .await
        .unwrap();

    // select k, sum(v), min(v) from s group by k
    let plan = PhysicalPlan::HashAgg {
        group_by: vec![1],
        aggs: vec![
            AggExpr {
                func: AggFunction::Sum,
                arg: Some(Expr::column(2)),
            },
            AggExpr {
                func: AggFunction::Min,
                arg: Some(Expr::column(2)),
            },
        ],
        child: Box::new(PhysicalPlan::TableScan {
            table_name: "s".into(),
            cols: None,
        }),
    };
    engine.create_materialized_view("m", &plan).await.unwrap();

    for (id, k, v) in [(1, 1, 10), (2, 1, 5), (3, 2, 7)] {
        broker.push(
            format!(r#"{{"id":{id}}}"#).into_bytes(),
            Some(format!(r#"{{"id":{id},"k":{k},"v":{v}}}"#).into_bytes()),
        );
    }
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "m").await.map_or(false, |rows| {
                rows == vec![
                    vec![Value::Int(1), Value::Int(15), Value::Int(5)],
                    vec![Value::Int(2), Value::Int(7), Value::Int(7)],
                ]
            })
        })
        .await,
        "aggregate state after inserts: {:?}",
        sorted_rows(&engine, "m").await
    );

    // Tombstone for (1, 10): sum drops, min survives via the multiset.
    broker.push(br#"{"id":1}"#.to_vec(), None);
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "m").await.map_or(false, |rows| {
                rows == vec![
                    vec![Value::Int(1), Value::Int(5), Value::Int(5)],
                    vec![Value::Int(2), Value::Int(7), Value::Int(7)],
                ]
            })
        })
        .await,
        "aggregate state after delete: {:?}",
        sorted_rows(&engine, "m").await
    );

    // Deleting the last row of a group removes the group.
    broker.push(br#"{"id":3}"#.to_vec(), None);
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "m").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(1), Value::Int(5), Value::Int(5)]]
            })
        })
        .await
    );
}

#[tokio::test]
async fn selection_and_projection_track_updates() {
    let (_dir, engine) = start_engine(4).await;
    let broker = FakeBroker::new(2);
    engine
        .create_source(
            source_info(
                "s",
                &[
                    ("id", ColumnType::BigInt),
                    ("k", ColumnType::Int),
                    ("v", ColumnType::Int),
                ],
                &[0],
            ),
            broker.clone(),
        )
        .await
        .unwrap();

    // select id, v from s where k = 1
    let plan = PhysicalPlan::Projection {
        exprs: vec![Expr::column(0), Expr::column(2)],
        child: Box::new(PhysicalPlan::Selection {
            predicates: vec![Expr::binary(
                BinOp::Eq,
                Expr::column(1),
                Expr::literal(Value::Int(1)),
            )],
            child: Box::new(PhysicalPlan::TableScan {
                table_name: "s".into(),
                cols: None,
            }),
        }),
    };
    engine.create_materialized_view("f", &plan).await.unwrap();

    for (id, k, v) in [(1, 1, 10), (2, 2, 20), (3, 1, 30)] {
        broker.push(
            format!(r#"{{"id":{id}}}"#).into_bytes(),
            Some(format!(r#"{{"id":{id},"k":{k},"v":{v}}}"#).into_bytes()),
        );
    }
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "f").await.map_or(false, |rows| {
                rows == vec![
                    vec![Value::Int(1), Value::Int(10)],
                    vec![Value::Int(3), Value::Int(30)],
                ]
            })
        })
        .await,
        "filtered view after inserts: {:?}",
        sorted_rows(&engine, "f").await
    );

    // Updating a row out of the predicate deletes it downstream.
    broker.push(
        br#"{"id":1}"#.to_vec(),
        Some(br#"{"id":1,"k":2,"v":10}"#.to_vec()),
    );
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "f").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(3), Value::Int(30)]]
            })
        })
        .await
    );

    // Updating a row into the predicate inserts it.
    broker.push(
        br#"{"id":2}"#.to_vec(),
        Some(br#"{"id":2,"k":1,"v":20}"#.to_vec()),
    );
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "f").await.map_or(false, |rows| {
                rows == vec![
                    vec![Value::Int(2), Value::Int(20)],
                    vec![Value::Int(3), Value::Int(30)],
                ]
            })
        })
        .await
    );

    // A tombstone removes the matching row from the view.
    broker.push(br#"{"id":3}"#.to_vec(), None);
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "f").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(2), Value::Int(20)]]
            })
        })
        .await
    );
}

#[tokio::test]
async fn union_all_keeps_rows_from_both_sources_distinct() {
    let (_dir, engine) = start_engine(4).await;
    let broker_a = FakeBroker::new(1);
    let broker_b = FakeBroker::new(1);
    for (name, broker) in [("a", &broker_a), ("b", &broker_b)] {
        engine
            .create_source(
                source_info(
                    name,
                    &[("id", ColumnType::BigInt), ("val", ColumnType::Varchar)],
                    &[0],
                ),
                broker.clone(),
            )
            .await
            .unwrap();
    }

    let plan = PhysicalPlan::UnionAll {
        children: vec![
            PhysicalPlan::TableScan {
                table_name: "a".into(),
                cols: None,
            },
            PhysicalPlan::TableScan {
                table_name: "b".into(),
                cols: None,
            },
        ],
    };
    engine.create_materialized_view("u", &plan).await.unwrap();

    // The same key in both sources must land as two tagged rows.
    broker_a.push(br#"{"id":1}"#.to_vec(), Some(br#"{"id":1,"val":"from-a"}"#.to_vec()));
    broker_b.push(br#"{"id":1}"#.to_vec(), Some(br#"{"id":1,"val":"from-b"}"#.to_vec()));
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "u").await.map_or(false, |rows| {
                if rows.len() != 2 {
                    return false;
                }
                let values: Vec<&Value> = rows.iter().map(|row| &row[1]).collect();
                let tags_distinct = rows[0][2] != rows[1][2];
                values
                    == vec![
                        &Value::Varchar("from-a".into()),
                        &Value::Varchar("from-b".into()),
                    ]
                    && tags_distinct
            })
        })
        .await,
        "union rows: {:?}",
        sorted_rows(&engine, "u").await
    );

    // Deleting from one source removes only that branch's row.
    broker_a.push(br#"{"id":1}"#.to_vec(), None);
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "u").await.map_or(false, |rows| {
                rows.len() == 1 && rows[0][1] == Value::Varchar("from-b".into())
            })
        })
        .await,
        "union rows after delete: {:?}",
        sorted_rows(&engine, "u").await
    );
}

#[tokio::test]
async fn cross_shard_aggregate_counts() {
    let (_dir, engine) = start_engine(8).await;
    let broker = FakeBroker::new(4);
    engine
        .create_source(
            source_info(
                "s",
                &[("id", ColumnType::BigInt), ("k", ColumnType::Int)],
                &[0],
            ),
            broker.clone(),
        )
        .await
        .unwrap();

    let plan = PhysicalPlan::HashAgg {
        group_by: vec![1],
        aggs: vec![AggExpr {
            func: AggFunction::Count,
            arg: None,
        }],
        child: Box::new(PhysicalPlan::TableScan {
            table_name: "s".into(),
            cols: None,
        }),
    };
    engine.create_materialized_view("counts", &plan).await.unwrap();

    const TOTAL: i64 = 120;
    for id in 0..TOTAL {
        broker.push(
            format!(r#"{{"id":{id}}}"#).into_bytes(),
            Some(format!(r#"{{"id":{id},"k":{}}}"#, id % 3).into_bytes()),
        );
    }

    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "counts").await.map_or(false, |rows| {
                rows.len() == 3
                    && rows
                        .iter()
                        .map(|row| match row[1] {
                            Value::Int(count) => count,
                            _ => 0,
                        })
                        .sum::<i64>()
                        == TOTAL
                    && rows.iter().all(|row| row[1] == Value::Int(TOTAL / 3))
            })
        })
        .await,
        "counts: {:?}",
        sorted_rows(&engine, "counts").await
    );
}

#[tokio::test]
async fn fill_is_complete_under_concurrent_ingest() {
    let (_dir, engine) = start_engine(4).await;
    let broker = FakeBroker::new(2);
    engine
        .create_source(
            source_info(
                "s",
                &[("id", ColumnType::BigInt), ("v", ColumnType::Int)],
                &[0],
            ),
            broker.clone(),
        )
        .await
        .unwrap();

    for id in 0..100i64 {
        broker.push(
            format!(r#"{{"id":{id}}}"#).into_bytes(),
            Some(format!(r#"{{"id":{id},"v":{id}}}"#).into_bytes()),
        );
    }
    assert!(
        wait_until(|| async {
            engine
                .scan_table("s", -1)
                .await
                .map_or(false, |rows| rows.len() == 100)
        })
        .await
    );

    // Keep ingesting while the view is being filled.
    let pusher_broker = broker.clone();
    let pusher = tokio::spawn(async move {
        for id in 100..150i64 {
            pusher_broker.push(
                format!(r#"{{"id":{id}}}"#).into_bytes(),
                Some(format!(r#"{{"id":{id},"v":{id}}}"#).into_bytes()),
            );
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let plan = PhysicalPlan::TableScan {
        table_name: "s".into(),
        cols: None,
    };
    engine.create_materialized_view("copy", &plan).await.unwrap();
    pusher.await.unwrap();

    // Snapshot rows + captured tail + post-install stream must add up to
    // every ingested row, exactly once.
    assert!(
        wait_until(|| async {
            engine
                .scan_table("copy", -1)
                .await
                .map_or(false, |rows| rows.len() == 150)
        })
        .await,
        "copy has {:?} rows",
        engine.scan_table("copy", -1).await.map(|r| r.len())
    );
}

/// Delivers every retained message regardless of the committed offsets it
/// reports: the shape of a crash that happened after ingest but before the
/// broker offset commit.
struct ReplayingProvider {
    inner: Arc<FakeBroker>,
    reported_committed: HashMap<i32, i64>,
}

#[async_trait::async_trait]
impl MessageProvider for ReplayingProvider {
    async fn start(&self) -> Result<()> {
        // Deliberately no rewind: deliver from the beginning.
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }

    async fn get_message(&self, poll_timeout: Duration) -> Result<Option<rill_push::Message>> {
        self.inner.get_message(poll_timeout).await
    }

    async fn commit_offsets(&self, offsets: &HashMap<i32, i64>) -> Result<()> {
        self.inner.commit_offsets(offsets).await
    }

    fn committed_offsets(&self) -> HashMap<i32, i64> {
        self.reported_committed.clone()
    }
}

#[tokio::test]
async fn replayed_offsets_are_skipped() {
    let (_dir, engine) = start_engine(4).await;
    let broker = FakeBroker::new(1);
    // Two messages were fully processed before the "crash": the broker
    // already has their offsets committed.
    broker.push_to_partition(0, br#"{"a":1}"#.to_vec(), Some(br#"{"a":1,"b":"old1"}"#.to_vec()));
    broker.push_to_partition(0, br#"{"a":2}"#.to_vec(), Some(br#"{"a":2,"b":"old2"}"#.to_vec()));
    broker.push_to_partition(0, br#"{"a":3}"#.to_vec(), Some(br#"{"a":3,"b":"new"}"#.to_vec()));

    let provider = Arc::new(ReplayingProvider {
        inner: broker.clone(),
        reported_committed: HashMap::from([(0, 2)]),
    });
    engine
        .create_source(
            source_info(
                "s",
                &[("a", ColumnType::Int), ("b", ColumnType::Varchar)],
                &[0],
            ),
            provider,
        )
        .await
        .unwrap();

    // Only the message past the committed offset lands.
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "s").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(3), Value::Varchar("new".into())]]
            })
        })
        .await,
        "rows: {:?}",
        sorted_rows(&engine, "s").await
    );
}

#[tokio::test]
async fn duplicate_ingest_leaves_aggregates_unchanged() {
    let (_dir, engine) = start_engine(4).await;
    let broker = FakeBroker::new(1);
    engine
        .create_source(
            source_info(
                "s",
                &[("id", ColumnType::BigInt), ("k", ColumnType::Int)],
                &[0],
            ),
            broker.clone(),
        )
        .await
        .unwrap();
    let plan = PhysicalPlan::HashAgg {
        group_by: vec![1],
        aggs: vec![AggExpr {
            func: AggFunction::Count,
            arg: None,
        }],
        child: Box::new(PhysicalPlan::TableScan {
            table_name: "s".into(),
            cols: None,
        }),
    };
    engine.create_materialized_view("m", &plan).await.unwrap();

    broker.push(br#"{"id":1}"#.to_vec(), Some(br#"{"id":1,"k":9}"#.to_vec()));
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "m").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(9), Value::Int(1)]]
            })
        })
        .await
    );

    // The same row arrives again (at-least-once upstream): the table
    // replaces it and the aggregate sees a retract+add, netting zero.
    broker.push(br#"{"id":1}"#.to_vec(), Some(br#"{"id":1,"k":9}"#.to_vec()));
    broker.push(br#"{"id":2}"#.to_vec(), Some(br#"{"id":2,"k":9}"#.to_vec()));
    assert!(
        wait_until(|| async {
            sorted_rows(&engine, "m").await.map_or(false, |rows| {
                rows == vec![vec![Value::Int(9), Value::Int(2)]]
            })
        })
        .await,
        "aggregate after replay: {:?}",
        sorted_rows(&engine, "m").await
    );
}

#[tokio::test]
async fn dropped_view_leaves_no_data_behind() {
    let (_dir, engine) = start_engine(4).await;
    let broker = FakeBroker::new(1);
    engine
        .create_source(
            source_info(
                "s",
                &[("id", ColumnType::BigInt), ("v", ColumnType::Int)],
                &[0],
            ),
            broker.clone(),
        )
        .await
        .unwrap();
    let plan = PhysicalPlan::TableScan {
        table_name: "s".into(),
        cols: None,
    };
    engine.create_materialized_view("m", &plan).await.unwrap();

    broker.push(br#"{"id":1}"#.to_vec(), Some(br#"{"id":1,"v":5}"#.to_vec()));
    assert!(
        wait_until(|| async {
            engine
                .scan_table("m", -1)
                .await
                .map_or(false, |rows| rows.len() == 1)
        })
        .await
    );

    let mv_table_id = engine.lookup_table("m").unwrap().id;
    engine.drop_materialized_view("m").await.unwrap();
    assert!(engine.lookup_table("m").is_none());

    // Every shard's range for the view's table id is empty.
    let cluster = engine.cluster();
    for shard_id in cluster.all_shard_ids() {
        let lower = rill_store::keys::table_prefix(shard_id, mv_table_id);
        let upper = rill_store::keys::table_prefix(shard_id, mv_table_id + 1);
        let pairs = cluster.local_scan(&lower, &upper, -1).unwrap();
        assert!(pairs.is_empty(), "shard {shard_id} still has view data");
    }

    // The source remains usable and can be dropped once unconsumed.
    engine.drop_source("s").await.unwrap();
}
