//! In-process transport.
//!
//! Routes requests between `NodeHost` instances registered in a shared
//! router. This serves single-process clusters and the test harness; a
//! network deployment implements [`Transport`] over its RPC layer instead.
//! Unregistered targets surface as `NotReady` so callers retry while peers
//! start up.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;

use rill_common::{Error, Result};

use crate::node::NodeHost;
use crate::types::{
    GroupId, NodeId, ReplicateRequest, ReplicateResponse, SmResult, SnapshotPayload, Transport,
};

/// Registry of live node hosts in this process.
#[derive(Default)]
pub struct LocalRouter {
    nodes: RwLock<HashMap<NodeId, Weak<NodeHost>>>,
}

impl LocalRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<NodeHost>) {
        let mut nodes = self.nodes.write().expect("router lock poisoned");
        nodes.insert(node.node_id(), Arc::downgrade(node));
    }

    pub fn deregister(&self, node_id: NodeId) {
        let mut nodes = self.nodes.write().expect("router lock poisoned");
        nodes.remove(&node_id);
    }

    fn lookup(&self, node_id: NodeId) -> Result<Arc<NodeHost>> {
        let nodes = self.nodes.read().expect("router lock poisoned");
        nodes
            .get(&node_id)
            .and_then(Weak::upgrade)
            .ok_or(Error::NotReady)
    }
}

/// [`Transport`] implementation backed by a [`LocalRouter`].
pub struct LocalTransport {
    router: Arc<LocalRouter>,
}

impl LocalTransport {
    pub fn new(router: Arc<LocalRouter>) -> Arc<Self> {
        Arc::new(Self { router })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn replicate(
        &self,
        target: NodeId,
        req: ReplicateRequest,
    ) -> Result<ReplicateResponse> {
        self.router.lookup(target)?.handle_replicate(req)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        group_id: GroupId,
        snapshot: SnapshotPayload,
    ) -> Result<ReplicateResponse> {
        self.router
            .lookup(target)?
            .handle_install_snapshot(group_id, snapshot)
    }

    async fn forward_propose(
        &self,
        target: NodeId,
        group_id: GroupId,
        command: Vec<u8>,
    ) -> Result<SmResult> {
        self.router
            .lookup(target)?
            .handle_forward_propose(group_id, command)
            .await
    }

    async fn forward_read(
        &self,
        target: NodeId,
        group_id: GroupId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.router
            .lookup(target)?
            .handle_forward_read(group_id, payload)
            .await
    }
}
