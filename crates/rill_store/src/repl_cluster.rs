//! Cluster facade backed by the replication layer.
//!
//! Wraps group propose/read with a uniform retry policy: retryable errors
//! (cluster not ready, peers still starting) are retried every
//! `retry_delay` until the operation deadline. The first access to any
//! group uses a long deadline so a cold cluster can assemble; subsequent
//! calls use a short one.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use rill_common::{Error, Result};
use rill_repl::{GroupConfig, NodeHost, SmResult, Transport};

use crate::cluster::{
    calc_processor, Cluster, KvPair, MembershipListener, QueryExecutionInfo, RemoteQueryCallback,
    ShardListenerFactory, WriteBatch,
};
use crate::group_sm::{
    LockStateMachine, SequenceStateMachine, GET_LOCK_COMMAND, LOCK_RESPONSE_OK, LOCK_RESULT_FALSE,
    LOCK_RESULT_TRUE, RELEASE_LOCK_COMMAND, SEQ_RESPONSE_OK,
};
use crate::keys;
use crate::kv::{KvSnapshot, KvStore};
use crate::shard_sm::{
    ShardStateMachine, LOOKUP_PING, LOOKUP_QUERY, SM_CMD_DELETE_RANGE, SM_CMD_FORWARD_WRITE,
    SM_CMD_REMOVE_NODE, SM_CMD_WRITE, SM_RESPONSE_OK,
};

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub node_id: u64,
    /// All node ids, in cluster order; shard allocation walks this list.
    pub nodes: Vec<u64>,
    pub num_shards: usize,
    pub replication_factor: usize,
    pub data_dir: PathBuf,
    pub data_snapshot_entries: u64,
    pub data_compaction_overhead: u64,
    pub singleton_snapshot_entries: u64,
    pub singleton_compaction_overhead: u64,
    /// Deadline for calls against a group that has answered before.
    pub call_timeout: Duration,
    /// Deadline for the first call against each group, covering peer
    /// startup.
    pub initial_call_timeout: Duration,
    pub retry_delay: Duration,
}

impl ClusterConfig {
    pub fn new(node_id: u64, nodes: Vec<u64>, num_shards: usize, data_dir: PathBuf) -> Self {
        Self {
            node_id,
            nodes,
            num_shards,
            replication_factor: 3,
            data_dir,
            data_snapshot_entries: 10_000,
            data_compaction_overhead: 2_500,
            singleton_snapshot_entries: 1_000,
            singleton_compaction_overhead: 250,
            call_timeout: Duration::from_secs(10),
            initial_call_timeout: Duration::from_secs(15 * 60),
            retry_delay: Duration::from_millis(100),
        }
    }
}

pub struct ReplCluster {
    cfg: ClusterConfig,
    kv: Arc<KvStore>,
    host: Arc<NodeHost>,
    transport: Arc<dyn Transport>,
    shard_allocs: HashMap<u64, Vec<u64>>,
    all_shards: Vec<u64>,
    local_shards: Vec<u64>,
    listener_factory: RwLock<Option<Arc<dyn ShardListenerFactory>>>,
    query_callback: RwLock<Option<Arc<dyn RemoteQueryCallback>>>,
    membership_listener: RwLock<Option<Arc<dyn MembershipListener>>>,
    first_group_access: Mutex<HashSet<u64>>,
}

impl ReplCluster {
    pub fn new(cfg: ClusterConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        if cfg.nodes.len() < keys::SINGLETON_GROUP_SIZE {
            return Err(Error::user(format!(
                "minimum cluster size is {} nodes",
                keys::SINGLETON_GROUP_SIZE
            )));
        }
        if !cfg.nodes.contains(&cfg.node_id) {
            return Err(Error::user(format!(
                "node {} is not in the cluster node list",
                cfg.node_id
            )));
        }
        let kv = Arc::new(KvStore::open(cfg.data_dir.join("kv"))?);
        let host = NodeHost::new(cfg.node_id, cfg.data_dir.join("repl"), transport.clone());

        // Static allocation: replicas of shard i are nodes[(i + j) mod n].
        let num_nodes = cfg.nodes.len();
        let rf = cfg.replication_factor.min(num_nodes).max(1);
        let mut shard_allocs = HashMap::new();
        let mut all_shards = Vec::with_capacity(cfg.num_shards);
        let mut local_shards = Vec::new();
        for i in 0..cfg.num_shards {
            let shard_id = keys::DATA_SHARD_BASE + i as u64;
            let replicas: Vec<u64> = (0..rf).map(|j| cfg.nodes[(i + j) % num_nodes]).collect();
            if replicas.contains(&cfg.node_id) {
                local_shards.push(shard_id);
            }
            all_shards.push(shard_id);
            shard_allocs.insert(shard_id, replicas);
        }

        Ok(Arc::new(Self {
            cfg,
            kv,
            host,
            transport,
            shard_allocs,
            all_shards,
            local_shards,
            listener_factory: RwLock::new(None),
            query_callback: RwLock::new(None),
            membership_listener: RwLock::new(None),
            first_group_access: Mutex::new(HashSet::new()),
        }))
    }

    /// The replication host, exposed so the process can register it with
    /// its transport router.
    pub fn host(&self) -> Arc<NodeHost> {
        self.host.clone()
    }

    pub fn kv(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    pub fn shard_replicas(&self, shard_id: u64) -> Option<&[u64]> {
        self.shard_allocs.get(&shard_id).map(|v| v.as_slice())
    }

    fn singleton_members(&self) -> Vec<u64> {
        self.cfg.nodes[..keys::SINGLETON_GROUP_SIZE].to_vec()
    }

    /// First member of the group, the node proposals are forwarded to when
    /// this node does not replicate the group.
    fn group_target(&self, group_id: u64) -> Result<u64> {
        if group_id == keys::SEQUENCE_GROUP_ID || group_id == keys::LOCKS_GROUP_ID {
            return Ok(self.cfg.nodes[0]);
        }
        self.shard_allocs
            .get(&group_id)
            .and_then(|replicas| replicas.first().copied())
            .ok_or_else(|| Error::user(format!("unknown shard {group_id}")))
    }

    fn timeout_for(&self, group_id: u64) -> Duration {
        let mut accessed = self
            .first_group_access
            .lock()
            .expect("first access lock poisoned");
        if accessed.insert(group_id) {
            self.cfg.initial_call_timeout
        } else {
            self.cfg.call_timeout
        }
    }

    async fn propose_once(&self, group_id: u64, command: Vec<u8>) -> Result<SmResult> {
        if self.host_has_group(group_id) {
            self.host.propose(group_id, command).await
        } else {
            self.transport
                .forward_propose(self.group_target(group_id)?, group_id, command)
                .await
        }
    }

    async fn read_once(&self, group_id: u64, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.host_has_group(group_id) {
            self.host.sync_read(group_id, payload).await
        } else {
            self.transport
                .forward_read(self.group_target(group_id)?, group_id, payload)
                .await
        }
    }

    fn host_has_group(&self, group_id: u64) -> bool {
        if group_id == keys::SEQUENCE_GROUP_ID || group_id == keys::LOCKS_GROUP_ID {
            return self.singleton_members().contains(&self.cfg.node_id);
        }
        self.local_shards.contains(&group_id)
    }

    async fn propose_with_retry(&self, group_id: u64, command: Vec<u8>) -> Result<SmResult> {
        let deadline = self.timeout_for(group_id);
        let start = Instant::now();
        loop {
            match self.propose_once(group_id, command.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() => {
                    if start.elapsed() >= deadline {
                        return Err(Error::Timeout(format!(
                            "propose to group {group_id} timed out: {err}"
                        )));
                    }
                    tokio::time::sleep(self.cfg.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn read_with_retry(&self, group_id: u64, payload: Vec<u8>) -> Result<Vec<u8>> {
        let deadline = self.timeout_for(group_id);
        let start = Instant::now();
        loop {
            match self.read_once(group_id, payload.clone()).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() => {
                    if start.elapsed() >= deadline {
                        return Err(Error::Timeout(format!(
                            "read from group {group_id} timed out: {err}"
                        )));
                    }
                    tokio::time::sleep(self.cfg.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl Cluster for ReplCluster {
    fn node_id(&self) -> u64 {
        self.cfg.node_id
    }

    fn all_shard_ids(&self) -> Vec<u64> {
        self.all_shards.clone()
    }

    fn local_shard_ids(&self) -> Vec<u64> {
        self.local_shards.clone()
    }

    fn processor_shard_ids(&self) -> Vec<u64> {
        self.local_shards
            .iter()
            .copied()
            .filter(|shard_id| {
                calc_processor(&self.shard_allocs[shard_id], *shard_id, self.cfg.node_id)
            })
            .collect()
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

    fn register_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        *self
            .membership_listener
            .write()
            .expect("membership lock poisoned") = Some(listener);
    }

    async fn start(&self) -> Result<()> {
        let factory = self
            .listener_factory
            .read()
            .expect("listener factory lock poisoned")
            .clone()
            .ok_or_else(|| Error::user("shard listener factory must be registered before start"))?;
        let query_callback = self
            .query_callback
            .read()
            .expect("query callback lock poisoned")
            .clone()
            .ok_or_else(|| Error::user("remote query callback must be registered before start"))?;

        // Singleton groups run on the first three nodes.
        let singleton_members = self.singleton_members();
        if singleton_members.contains(&self.cfg.node_id) {
            self.host.start_group(
                GroupConfig {
                    group_id: keys::SEQUENCE_GROUP_ID,
                    node_id: self.cfg.node_id,
                    members: singleton_members.clone(),
                    snapshot_entries: self.cfg.singleton_snapshot_entries,
                    compaction_overhead: self.cfg.singleton_compaction_overhead,
                },
                Box::new(SequenceStateMachine::new(self.kv.clone())),
            )?;
            self.host.start_group(
                GroupConfig {
                    group_id: keys::LOCKS_GROUP_ID,
                    node_id: self.cfg.node_id,
                    members: singleton_members,
                    snapshot_entries: self.cfg.singleton_snapshot_entries,
                    compaction_overhead: self.cfg.singleton_compaction_overhead,
                },
                Box::new(LockStateMachine::new(self.kv.clone())),
            )?;
        }

        for &shard_id in &self.local_shards {
            let replicas = self.shard_allocs[&shard_id].clone();
            self.host.start_group(
                GroupConfig {
                    group_id: shard_id,
                    node_id: self.cfg.node_id,
                    members: replicas.clone(),
                    snapshot_entries: self.cfg.data_snapshot_entries,
                    compaction_overhead: self.cfg.data_compaction_overhead,
                },
                Box::new(ShardStateMachine::new(
                    shard_id,
                    self.cfg.node_id,
                    replicas,
                    self.kv.clone(),
                    factory.clone(),
                    query_callback.clone(),
                )),
            )?;
        }

        // Wait for every group to answer a read: this is the quorum gate
        // that holds startup until enough peers are up.
        tracing::info!(node = self.cfg.node_id, "waiting for cluster quorum");
        for group_id in self
            .all_shards
            .iter()
            .copied()
            .chain([keys::SEQUENCE_GROUP_ID, keys::LOCKS_GROUP_ID])
        {
            self.read_with_retry(group_id, vec![LOOKUP_PING]).await?;
        }
        tracing::info!(node = self.cfg.node_id, "cluster quorum attained");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.host.stop()?;
        self.kv.sync()
    }

    async fn write_batch(&self, mut batch: WriteBatch) -> Result<()> {
        if batch.shard_id < keys::DATA_SHARD_BASE {
            panic!("invalid shard id {} in write batch", batch.shard_id);
        }
        let tag = if batch.notify_remote {
            SM_CMD_FORWARD_WRITE
        } else {
            SM_CMD_WRITE
        };
        let mut command = vec![tag];
        batch.serialize(&mut command);
        let result = self.propose_with_retry(batch.shard_id, command).await?;
        if result.value != SM_RESPONSE_OK {
            return Err(Error::internal(format!(
                "unexpected write batch response {} from shard {}",
                result.value, batch.shard_id
            )));
        }
        batch.fire_committed_callbacks();
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

        let mut command = vec![SM_CMD_DELETE_RANGE];
        rill_common::codec::write_bytes(&mut command, &start);
        rill_common::codec::write_bytes(&mut command, &end);
        let result = self.propose_with_retry(shard_id, command).await?;
        if result.value != SM_RESPONSE_OK {
            return Err(Error::internal(format!(
                "unexpected delete range response {} from shard {shard_id}",
                result.value
            )));
        }
        Ok(())
    }

    async fn delete_all_data_in_range_for_all_shards(
        &self,
        start_suffix: &[u8],
        end_suffix: &[u8],
    ) -> Result<()> {
        for shard_id in self.all_shards.clone() {
            self.delete_all_data_in_range_for_shard(shard_id, start_suffix, end_suffix)
                .await?;
        }
        Ok(())
    }

    async fn generate_cluster_sequence(&self, name: &str) -> Result<u64> {
        let command = SequenceStateMachine::encode_command(name);
        let result = self
            .propose_with_retry(keys::SEQUENCE_GROUP_ID, command)
            .await?;
        if result.value != SEQ_RESPONSE_OK {
            return Err(Error::internal(format!(
                "unexpected sequence response {}",
                result.value
            )));
        }
        let mut offset = 0;
        rill_common::codec::read_u64_le(&result.data, &mut offset)
    }

    async fn get_lock(&self, prefix: &str) -> Result<bool> {
        let command = LockStateMachine::encode_command(GET_LOCK_COMMAND, prefix);
        let result = self.propose_with_retry(keys::LOCKS_GROUP_ID, command).await?;
        if result.value != LOCK_RESPONSE_OK {
            return Err(Error::internal(format!(
                "unexpected lock response {}",
                result.value
            )));
        }
        match result.data.first() {
            Some(&LOCK_RESULT_TRUE) => Ok(true),
            Some(&LOCK_RESULT_FALSE) => Ok(false),
            other => Err(Error::internal(format!(
                "unexpected lock result payload {other:?}"
            ))),
        }
    }

    async fn release_lock(&self, prefix: &str) -> Result<bool> {
        let command = LockStateMachine::encode_command(RELEASE_LOCK_COMMAND, prefix);
        let result = self.propose_with_retry(keys::LOCKS_GROUP_ID, command).await?;
        if result.value != LOCK_RESPONSE_OK {
            return Err(Error::internal(format!(
                "unexpected lock response {}",
                result.value
            )));
        }
        Ok(result.data.first() == Some(&LOCK_RESULT_TRUE))
    }

    async fn execute_remote_pull_query(&self, info: &QueryExecutionInfo) -> Result<Vec<u8>> {
        if info.shard_id < keys::DATA_SHARD_BASE {
            panic!("invalid shard id {} in pull query", info.shard_id);
        }
        let mut payload = vec![LOOKUP_QUERY];
        payload.extend_from_slice(&info.serialize());
        self.read_with_retry(info.shard_id, payload).await
    }

    async fn remove_node(&self, node_id: u64) -> Result<()> {
        // Drop the node from the replication layer first so the sequencer
        // role moves off it, then route the removal through every shard
        // state machine so all replicas recompute their processor in log
        // order. Every surviving node performs the same call when it
        // observes the failure; the state machines ignore repeats.
        self.host.remove_member_everywhere(node_id);
        let mut command = vec![SM_CMD_REMOVE_NODE];
        command.extend_from_slice(&(node_id as u32).to_be_bytes());
        for shard_id in self.all_shards.clone() {
            let result = self.propose_with_retry(shard_id, command.clone()).await?;
            if result.value != SM_RESPONSE_OK {
                return Err(Error::internal(format!(
                    "unexpected remove node response {} from shard {shard_id}",
                    result.value
                )));
            }
        }
        let listener = self
            .membership_listener
            .read()
            .expect("membership lock poisoned")
            .clone();
        if let Some(listener) = listener {
            listener.node_left(node_id);
        }
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
