//! Replicated cluster facade against three in-process nodes.

use std::sync::Arc;
use std::time::Duration;

use rill_common::Result;
use rill_repl::{LocalRouter, LocalTransport};
use rill_store::keys;
use rill_store::{
    Cluster, ClusterConfig, KvPair, QueryExecutionInfo, RemoteQueryCallback, ReplCluster,
    ShardListener, ShardListenerFactory, WriteBatch,
};

struct NopListener;
impl ShardListener for NopListener {
    fn remote_write_occurred(&self) {}
    fn close(&self) {}
}

struct NopFactory;
impl ShardListenerFactory for NopFactory {
    fn create_shard_listener(&self, _shard_id: u64) -> Box<dyn ShardListener> {
        Box::new(NopListener)
    }
}

/// Echoes the queried table id as its "row count" framing so the test can
/// see which query reached the state machine.
struct EchoQuery;
impl RemoteQueryCallback for EchoQuery {
    fn execute_remote_pull_query(&self, info: &QueryExecutionInfo) -> Result<Vec<u8>> {
        Ok(info.table_id.to_be_bytes().to_vec())
    }
}

async fn three_node_cluster(dir: &std::path::Path) -> Vec<Arc<ReplCluster>> {
    let router = LocalRouter::new();
    let transport = LocalTransport::new(router.clone());
    let mut clusters = Vec::new();
    for node_id in 0..3u64 {
        let mut cfg = ClusterConfig::new(
            node_id,
            vec![0, 1, 2],
            2,
            dir.join(format!("node-{node_id}")),
        );
        // Keep test failures fast if something is genuinely broken.
        cfg.initial_call_timeout = Duration::from_secs(30);
        let cluster = ReplCluster::new(cfg, transport.clone()).unwrap();
        router.register(&cluster.host());
        cluster.register_shard_listener_factory(Arc::new(NopFactory));
        cluster.register_remote_query_callback(Arc::new(EchoQuery));
        clusters.push(cluster);
    }
    for cluster in &clusters {
        cluster.start().await.unwrap();
    }
    clusters
}

fn user_key(shard_id: u64, pk: &[u8]) -> Vec<u8> {
    let mut key = keys::table_prefix(shard_id, keys::USER_TABLE_BASE);
    key.extend_from_slice(pk);
    key
}

#[tokio::test]
async fn batches_replicate_to_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let clusters = three_node_cluster(dir.path()).await;

    let shard = keys::DATA_SHARD_BASE;
    let mut batch = WriteBatch::new(shard, false);
    batch.add_put(user_key(shard, b"pk1"), b"row1".to_vec());
    batch.add_put(user_key(shard, b"pk2"), b"row2".to_vec());
    clusters[1].write_batch(batch).await.unwrap();

    for cluster in &clusters {
        assert_eq!(
            cluster.local_get(&user_key(shard, b"pk1")).unwrap(),
            Some(b"row1".to_vec())
        );
        let pairs: Vec<KvPair> = cluster
            .local_scan(
                &keys::table_prefix(shard, keys::USER_TABLE_BASE),
                &keys::table_prefix(shard, keys::USER_TABLE_BASE + 1),
                -1,
            )
            .unwrap();
        assert_eq!(pairs.len(), 2);
    }

    // Range delete through the shard group empties the table everywhere.
    clusters[0]
        .delete_all_data_in_range_for_shard(
            shard,
            &keys::USER_TABLE_BASE.to_be_bytes(),
            &(keys::USER_TABLE_BASE + 1).to_be_bytes(),
        )
        .await
        .unwrap();
    for cluster in &clusters {
        assert_eq!(cluster.local_get(&user_key(shard, b"pk1")).unwrap(), None);
    }
}

#[tokio::test]
async fn sequences_are_cluster_wide_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let clusters = three_node_cluster(dir.path()).await;

    let mut seen = Vec::new();
    for i in 0..6usize {
        let cluster = &clusters[i % 3];
        seen.push(cluster.generate_cluster_sequence("table").await.unwrap());
    }
    let expected: Vec<u64> = (0..6).collect();
    assert_eq!(seen, expected);

    // Independent sequence names do not interfere.
    assert_eq!(
        clusters[2].generate_cluster_sequence("other").await.unwrap(),
        0
    );
}

#[tokio::test]
async fn locks_are_exclusive_across_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let clusters = three_node_cluster(dir.path()).await;

    assert!(clusters[0].get_lock("schema").await.unwrap());
    assert!(!clusters[1].get_lock("schema").await.unwrap());
    assert!(!clusters[2].get_lock("schema/sub").await.unwrap());
    assert!(clusters[1].release_lock("schema").await.unwrap());
    assert!(clusters[2].get_lock("schema/sub").await.unwrap());
}

#[tokio::test]
async fn pull_queries_reach_the_shard_state_machine() {
    let dir = tempfile::tempdir().unwrap();
    let clusters = three_node_cluster(dir.path()).await;

    let info = QueryExecutionInfo {
        shard_id: keys::DATA_SHARD_BASE + 1,
        table_id: 1234,
        limit: -1,
    };
    let result = clusters[2].execute_remote_pull_query(&info).await.unwrap();
    assert_eq!(result, 1234u64.to_be_bytes().to_vec());
}
