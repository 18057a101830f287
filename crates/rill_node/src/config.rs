//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Command-line configuration for a Rill node.
#[derive(Clone, Debug, Parser)]
#[command(name = "rill-node", about = "Rill streaming materialized-view node")]
pub struct NodeConfig {
    /// This node's id within the cluster.
    #[arg(long, default_value_t = 0)]
    pub node_id: u64,

    /// Deployment id; nodes of different clusters must not mix state.
    #[arg(long, default_value_t = 1)]
    pub cluster_id: u64,

    /// All node ids in the cluster, in allocation order. A single entry
    /// runs the node without the replication layer.
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub nodes: Vec<u64>,

    /// Number of data shards.
    #[arg(long, default_value_t = 16)]
    pub num_shards: usize,

    /// Replicas per shard (replicated mode only).
    #[arg(long, default_value_t = 3)]
    pub replication_factor: usize,

    /// Root directory for KV state and replication logs.
    #[arg(long, default_value = "rill-data")]
    pub data_dir: PathBuf,

    /// Applied entries between replication-log truncations for data
    /// shards.
    #[arg(long, default_value_t = 10_000)]
    pub data_snapshot_entries: u64,

    /// Entries retained behind the truncation point.
    #[arg(long, default_value_t = 2_500)]
    pub data_compaction_overhead: u64,

    /// Broker poll timeout in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub poll_timeout_ms: u64,

    /// Maximum messages consumed per poll batch.
    #[arg(long, default_value_t = 1000)]
    pub max_poll_messages: usize,
}

impl NodeConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Per-node state lives under `<data_dir>/node-<id>`.
    pub fn node_data_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.node_id))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.num_shards > 0, "num-shards must be positive");
        anyhow::ensure!(
            self.nodes.contains(&self.node_id),
            "node id {} is not in the node list",
            self.node_id
        );
        Ok(())
    }
}
