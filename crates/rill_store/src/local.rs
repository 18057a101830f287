//! Single-process cluster.
//!
//! Applies write batches straight to the local KV store and invokes shard
//! listeners inline, with no replication layer. This node is the processor
//! for every shard. Used for single-node deployments and as the engine
//! test harness; the batch/notification semantics match the replicated
//! cluster so the push engine cannot tell them apart.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use rill_common::codec::read_u64_le;
use rill_common::{Error, Result};

use crate::cluster::{
    Cluster, KvPair, MembershipListener, QueryExecutionInfo, RemoteQueryCallback, ShardListener,
    ShardListenerFactory, WriteBatch,
};
use crate::group_sm::sequence_value_key;
use crate::keys;
use crate::kv::{KvSnapshot, KvStore};

pub struct LocalCluster {
    node_id: u64,
    shards: Vec<u64>,
    kv: Arc<KvStore>,
    listener_factory: RwLock<Option<Arc<dyn ShardListenerFactory>>>,
    query_callback: RwLock<Option<Arc<dyn RemoteQueryCallback>>>,
    listeners: Mutex<HashMap<u64, Box<dyn ShardListener>>>,
    sequence_lock: Mutex<()>,
    held_locks: Mutex<HashSet<String>>,
}

impl LocalCluster {
    pub fn new(num_shards: usize, data_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let kv = Arc::new(KvStore::open(data_dir)?);
        let shards = (0..num_shards as u64)
            .map(|i| keys::DATA_SHARD_BASE + i)
            .collect();
        Ok(Arc::new(Self {
            node_id: 0,
            shards,
            kv,
            listener_factory: RwLock::new(None),
            query_callback: RwLock::new(None),
            listeners: Mutex::new(HashMap::new()),
            sequence_lock: Mutex::new(()),
            held_locks: Mutex::new(HashSet::new()),
        }))
    }

    fn trigger_listener(&self, shard_id: u64) {
        let factory = self
            .listener_factory
            .read()
            .expect("listener factory lock poisoned")
            .clone();
        let Some(factory) = factory else {
            return;
        };
        let mut listeners = self.listeners.lock().expect("listeners lock poisoned");
        let listener = listeners
            .entry(shard_id)
            .or_insert_with(|| factory.create_shard_listener(shard_id));
        listener.remote_write_occurred();
    }

    fn check_batch(&self, batch: &WriteBatch) {
        for (key, _) in batch.puts() {
            assert_eq!(
                keys::shard_of_key(key),
                batch.shard_id,
                "key written to wrong shard"
            );
        }
        for key in batch.deletes() {
            assert_eq!(
                keys::shard_of_key(key),
                batch.shard_id,
                "key deleted from wrong shard"
            );
        }
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    fn node_id(&self) -> u64 {
        self.node_id
    }

    fn all_shard_ids(&self) -> Vec<u64> {
        self.shards.clone()
    }

    fn local_shard_ids(&self) -> Vec<u64> {
        self.shards.clone()
    }

    fn processor_shard_ids(&self) -> Vec<u64> {
        self.shards.clone()
    }

    fn register_shard_listener_factory(&self, factory: Arc<dyn ShardListenerFactory>) {
        *self
            .listener_factory
            .write()
            .expect("listener factory lock poisoned") = Some(factory);
    }

    fn register_remote_query_callback(&self, callback: Arc<dyn RemoteQueryCallback>) {
        *self
            .query_callback
            .write()
            .expect("query callback lock poisoned") = Some(callback);
    }

    fn register_membership_listener(&self, _listener: Arc<dyn MembershipListener>) {}

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .drain()
            .for_each(|(_, listener)| listener.close());
        self.kv.sync()
    }

    async fn write_batch(&self, mut batch: WriteBatch) -> Result<()> {
        if batch.shard_id < keys::DATA_SHARD_BASE {
            panic!("invalid shard id {} in write batch", batch.shard_id);
        }
        self.check_batch(&batch);
        self.kv.write(batch.puts(), batch.deletes())?;
        batch.fire_committed_callbacks();
        if batch.notify_remote {
            self.trigger_listener(batch.shard_id);
        }
        Ok(())
    }

    fn local_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.kv.get(key)
    }

    fn local_scan(&self, lower: &[u8], upper: &[u8], limit: i64) -> Result<Vec<KvPair>> {
        self.kv.scan(lower, upper, limit)
    }

    fn create_snapshot(&self) -> Result<KvSnapshot> {
        Ok(self.kv.snapshot())
    }

    fn local_scan_with_snapshot(
        &self,
        snapshot: &KvSnapshot,
        lower: &[u8],
        upper: &[u8],
        limit: i64,
    ) -> Result<Vec<KvPair>> {
        self.kv.scan_snapshot(snapshot, lower, upper, limit)
    }

    async fn delete_all_data_in_range_for_shard(
        &self,
        shard_id: u64,
        start_suffix: &[u8],
        end_suffix: &[u8],
    ) -> Result<()> {
        let mut start = keys::shard_prefix(shard_id);
        start.extend_from_slice(start_suffix);
        let mut end = keys::shard_prefix(shard_id);
        end.extend_from_slice(end_suffix);
        self.kv.delete_range(&start, &end)?;
        Ok(())
    }

    async fn delete_all_data_in_range_for_all_shards(
        &self,
        start_suffix: &[u8],
        end_suffix: &[u8],
    ) -> Result<()> {
        for shard_id in self.shards.clone() {
            self.delete_all_data_in_range_for_shard(shard_id, start_suffix, end_suffix)
                .await?;
        }
        Ok(())
    }

    async fn generate_cluster_sequence(&self, name: &str) -> Result<u64> {
        let _guard = self.sequence_lock.lock().expect("sequence lock poisoned");
        let key = sequence_value_key(name);
        let current = match self.kv.get(&key)? {
            Some(value) => {
                let mut offset = 0;
                read_u64_le(&value, &mut offset)?
            }
            None => 0,
        };
        self.kv
            .write(&[(key, (current + 1).to_le_bytes().to_vec())], &[])?;
        Ok(current)
    }

    async fn get_lock(&self, prefix: &str) -> Result<bool> {
        let mut held = self.held_locks.lock().expect("locks lock poisoned");
        let blocked = held
            .iter()
            .any(|h| h.starts_with(prefix) || prefix.starts_with(h.as_str()));
        if blocked {
            return Ok(false);
        }
        held.insert(prefix.to_string());
        Ok(true)
    }

    async fn release_lock(&self, prefix: &str) -> Result<bool> {
        let mut held = self.held_locks.lock().expect("locks lock poisoned");
        held.remove(prefix);
        Ok(true)
    }

    async fn execute_remote_pull_query(&self, info: &QueryExecutionInfo) -> Result<Vec<u8>> {
        let callback = self
            .query_callback
            .read()
            .expect("query callback lock poisoned")
            .clone()
            .ok_or_else(|| Error::user("no remote query callback registered"))?;
        callback.execute_remote_pull_query(info)
    }

    async fn remove_node(&self, _node_id: u64) -> Result<()> {
        Ok(())
    }

    fn register_prefix_to_delete(&self, prefix: &[u8]) -> Result<()> {
        self.kv.meta_put(prefix, &[])
    }

    fn unregister_prefix_to_delete(&self, prefix: &[u8]) -> Result<()> {
        self.kv.meta_delete(prefix)
    }

    fn prefixes_to_delete(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .kv
            .meta_scan_all()?
            .into_iter()
            .map(|pair| pair.key)
            .collect())
    }
}
