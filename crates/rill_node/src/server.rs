//! Server wiring: storage, cluster, push engine.

use std::sync::Arc;
use std::time::Duration;

use rill_common::Result;
use rill_push::{EngineConfig, PushEngine};
use rill_repl::{LocalRouter, LocalTransport, Transport};
use rill_store::{Cluster, ClusterConfig, LocalCluster, ReplCluster};

use crate::config::NodeConfig;

pub struct Server {
    cluster: Arc<dyn Cluster>,
    engine: Arc<PushEngine>,
}

impl Server {
    /// Start a node. Single-entry node lists run without the replication
    /// layer; multi-node deployments share a transport (in-process by
    /// default; a network transport plugs in through
    /// [`Server::start_with_transport`]).
    pub async fn start(cfg: &NodeConfig) -> Result<Server> {
        if cfg.nodes.len() <= 1 {
            let cluster: Arc<dyn Cluster> =
                LocalCluster::new(cfg.num_shards, cfg.node_data_dir())?;
            return Self::finish_start(cfg, cluster).await;
        }
        let router = LocalRouter::new();
        let transport = LocalTransport::new(router.clone());
        Self::start_with_transport(cfg, transport, Some(router)).await
    }

    pub async fn start_with_transport(
        cfg: &NodeConfig,
        transport: Arc<dyn Transport>,
        router: Option<Arc<LocalRouter>>,
    ) -> Result<Server> {
        let mut cluster_cfg = ClusterConfig::new(
            cfg.node_id,
            cfg.nodes.clone(),
            cfg.num_shards,
            cfg.node_data_dir(),
        );
        cluster_cfg.replication_factor = cfg.replication_factor;
        cluster_cfg.data_snapshot_entries = cfg.data_snapshot_entries;
        cluster_cfg.data_compaction_overhead = cfg.data_compaction_overhead;
        let repl = ReplCluster::new(cluster_cfg, transport)?;
        if let Some(router) = router {
            router.register(&repl.host());
        }
        let cluster: Arc<dyn Cluster> = repl;
        Self::finish_start(cfg, cluster).await
    }

    async fn finish_start(cfg: &NodeConfig, cluster: Arc<dyn Cluster>) -> Result<Server> {
        let engine = PushEngine::new(
            cluster.clone(),
            EngineConfig {
                poll_timeout: cfg.poll_timeout(),
                max_poll_messages: cfg.max_poll_messages,
            },
        );
        cluster.start().await?;
        engine.start().await?;
        tracing::info!(node = cfg.node_id, shards = cfg.num_shards, "node started");
        Ok(Server { cluster, engine })
    }

    pub fn engine(&self) -> &Arc<PushEngine> {
        &self.engine
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub async fn stop(&self) -> Result<()> {
        self.engine.stop().await?;
        // Give in-flight fire-and-forget actions a beat to drain before
        // the store flushes.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.cluster.stop().await?;
        tracing::info!("node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn single_node_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = NodeConfig::parse_from([
            "rill-node",
            "--num-shards",
            "4",
            "--data-dir",
            dir.path().to_str().unwrap(),
        ]);
        let server = Server::start(&cfg).await.unwrap();
        assert!(server.engine().lookup_table("missing").is_none());
        server.stop().await.unwrap();
    }
}
