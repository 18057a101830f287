//! Forwarder/receiver delivery guarantees, including the crash-between-
//! add-and-delete window that causes re-forwarding.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rill_common::Result;
use rill_push::exec::ExecutionContext;
use rill_push::forward::{Forwarder, RemoteRowHandler};
use rill_store::keys;
use rill_store::{Cluster, LocalCluster};

struct RecordingHandler {
    seen: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
}

#[async_trait]
impl RemoteRowHandler for RecordingHandler {
    async fn handle_remote_rows(
        &self,
        rows_by_consumer: BTreeMap<u64, Vec<Vec<u8>>>,
        _ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let mut seen = self.seen.lock().unwrap();
        for (consumer, payloads) in rows_by_consumer {
            for payload in payloads {
                seen.push((consumer, payload));
            }
        }
        Ok(())
    }
}

async fn queue_rows(
    cluster: &Arc<dyn Cluster>,
    forwarder: &Arc<Forwarder>,
    local_shard: u64,
    remote_shard: u64,
    consumer: u64,
    payloads: &[&[u8]],
) {
    let mut ctx = ExecutionContext::new(local_shard, cluster.clone(), forwarder.clone());
    for payload in payloads {
        forwarder
            .queue_for_remote_send(&mut ctx, remote_shard, consumer, payload.to_vec())
            .unwrap();
    }
    cluster.write_batch(ctx.batch).await.unwrap();
}

#[tokio::test]
async fn reforwarding_after_crash_delivers_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let cluster: Arc<dyn Cluster> = LocalCluster::new(4, dir.path()).unwrap();
    let forwarder = Forwarder::new(cluster.clone());
    let local = keys::DATA_SHARD_BASE;
    let remote = keys::DATA_SHARD_BASE + 1;

    queue_rows(&cluster, &forwarder, local, remote, 42, &[b"row-a", b"row-b"]).await;

    // Transfer without deleting the forwarded entries: the shape of a
    // crash after the add batch committed but before the delete batch.
    forwarder.transfer_data(local, false).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = RecordingHandler { seen: seen.clone() };
    forwarder
        .handle_received_rows(remote, &handler)
        .await
        .unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);

    // Recovery re-forwards the same entries; the receiver must drop them.
    forwarder.transfer_data(local, true).await.unwrap();
    forwarder
        .handle_received_rows(remote, &handler)
        .await
        .unwrap();
    let final_seen = seen.lock().unwrap().clone();
    assert_eq!(final_seen.len(), 2, "duplicates reached the handler");
    assert_eq!(final_seen[0], (42, b"row-a".to_vec()));
    assert_eq!(final_seen[1], (42, b"row-b".to_vec()));

    // Both queues end up empty.
    let fwd = cluster
        .local_scan(
            &keys::forwarder_prefix(local),
            &keys::table_prefix(local, keys::FORWARDER_TID + 1),
            -1,
        )
        .unwrap();
    assert!(fwd.is_empty());
    let rcv = cluster
        .local_scan(
            &keys::receiver_prefix(remote),
            &keys::table_prefix(remote, keys::RECEIVER_TID + 1),
            -1,
        )
        .unwrap();
    assert!(rcv.is_empty());
}

#[tokio::test]
async fn transfer_reschedules_until_large_queues_drain() {
    let dir = tempfile::tempdir().unwrap();
    let cluster: Arc<dyn Cluster> = LocalCluster::new(4, dir.path()).unwrap();
    let forwarder = Forwarder::new(cluster.clone());
    let local = keys::DATA_SHARD_BASE;
    let remote = keys::DATA_SHARD_BASE + 1;

    // Well past one transfer pass worth of entries.
    let payloads: Vec<Vec<u8>> = (0..250u32).map(|i| i.to_be_bytes().to_vec()).collect();
    let payload_refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
    queue_rows(&cluster, &forwarder, local, remote, 11, &payload_refs).await;

    let scheduler = rill_push::ShardScheduler::new(local);
    forwarder.schedule_transfer(&scheduler, local);

    // The trigger must keep rescheduling itself until nothing is queued.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let queued = cluster
            .local_scan(
                &keys::forwarder_prefix(local),
                &keys::table_prefix(local, keys::FORWARDER_TID + 1),
                -1,
            )
            .unwrap();
        if queued.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} forwarder entries still queued",
            queued.len()
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    // Every entry arrived, exactly once and in order.
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = RecordingHandler { seen: seen.clone() };
    loop {
        let processed = forwarder
            .handle_received_rows(remote, &handler)
            .await
            .unwrap();
        if processed == 0 {
            break;
        }
    }
    let got: Vec<Vec<u8>> = seen.lock().unwrap().iter().map(|(_, p)| p.clone()).collect();
    assert_eq!(got, payloads);
}

#[tokio::test]
async fn rows_for_different_shards_group_into_separate_batches() {
    let dir = tempfile::tempdir().unwrap();
    let cluster: Arc<dyn Cluster> = LocalCluster::new(4, dir.path()).unwrap();
    let forwarder = Forwarder::new(cluster.clone());
    let local = keys::DATA_SHARD_BASE;

    queue_rows(&cluster, &forwarder, local, keys::DATA_SHARD_BASE + 1, 7, &[b"to-17"]).await;
    queue_rows(&cluster, &forwarder, local, keys::DATA_SHARD_BASE + 2, 7, &[b"to-18"]).await;
    forwarder.transfer_data(local, true).await.unwrap();

    for (shard, expected) in [
        (keys::DATA_SHARD_BASE + 1, b"to-17".to_vec()),
        (keys::DATA_SHARD_BASE + 2, b"to-18".to_vec()),
    ] {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = RecordingHandler { seen: seen.clone() };
        forwarder.handle_received_rows(shard, &handler).await.unwrap();
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(7, expected)]);
    }
}

#[tokio::test]
async fn sender_sequences_apply_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let cluster: Arc<dyn Cluster> = LocalCluster::new(4, dir.path()).unwrap();
    let forwarder = Forwarder::new(cluster.clone());
    let local = keys::DATA_SHARD_BASE;
    let remote = keys::DATA_SHARD_BASE + 3;

    let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
    let payload_refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
    queue_rows(&cluster, &forwarder, local, remote, 9, &payload_refs).await;
    forwarder.transfer_data(local, true).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = RecordingHandler { seen: seen.clone() };
    forwarder.handle_received_rows(remote, &handler).await.unwrap();
    let seen = seen.lock().unwrap().clone();
    let got: Vec<Vec<u8>> = seen.into_iter().map(|(_, p)| p).collect();
    assert_eq!(got, payloads);
}
