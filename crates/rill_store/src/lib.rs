//! Storage layer: the fjall-backed KV adapter, the per-shard replicated
//! state machine, the singleton sequence/lock state machines, and the
//! cluster facade the push engine talks to.

pub mod cluster;
pub mod group_sm;
pub mod keys;
pub mod kv;
pub mod local;
pub mod repl_cluster;
pub mod shard_sm;

pub use cluster::{
    calc_processor, Cluster, KvPair, MembershipListener, QueryExecutionInfo, RemoteQueryCallback,
    ShardListener, ShardListenerFactory, WriteBatch,
};
pub use kv::{KvSnapshot, KvStore};
pub use local::LocalCluster;
pub use repl_cluster::{ClusterConfig, ReplCluster};
