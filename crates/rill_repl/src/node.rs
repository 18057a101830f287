//! Multi-group node host.
//!
//! One `NodeHost` runs per process per node identity; it owns every
//! replication group the node participates in and is the target the
//! transport routes incoming traffic to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rill_common::{Error, Result};

use crate::group::Group;
use crate::types::{
    GroupConfig, GroupId, NodeId, ReplicateRequest, ReplicateResponse, SmResult, SnapshotPayload,
    StateMachine, Transport,
};

pub struct NodeHost {
    node_id: NodeId,
    log_dir: PathBuf,
    transport: Arc<dyn Transport>,
    groups: RwLock<HashMap<GroupId, Arc<Group>>>,
}

impl NodeHost {
    pub fn new(node_id: NodeId, log_dir: PathBuf, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            log_dir,
            transport,
            groups: RwLock::new(HashMap::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Create and start a group on this node.
    pub fn start_group(&self, config: GroupConfig, sm: Box<dyn StateMachine>) -> Result<()> {
        let group = Group::new(config, sm, &self.log_dir, self.transport.clone())?;
        group.start()?;
        let mut groups = self.groups.write().expect("groups lock poisoned");
        groups.insert(group.group_id(), group);
        Ok(())
    }

    fn group(&self, group_id: GroupId) -> Result<Arc<Group>> {
        let groups = self.groups.read().expect("groups lock poisoned");
        groups.get(&group_id).cloned().ok_or(Error::NotReady)
    }

    pub async fn propose(&self, group_id: GroupId, command: Vec<u8>) -> Result<SmResult> {
        self.group(group_id)?.propose(command).await
    }

    pub async fn sync_read(&self, group_id: GroupId, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.group(group_id)?.sync_read(payload).await
    }

    /// Drop a node from every group's replica set (membership event).
    pub fn remove_member_everywhere(&self, node_id: NodeId) {
        let groups = self.groups.read().expect("groups lock poisoned");
        for group in groups.values() {
            group.remove_member(node_id);
        }
    }

    pub fn group_ids(&self) -> Vec<GroupId> {
        let groups = self.groups.read().expect("groups lock poisoned");
        groups.keys().copied().collect()
    }

    /// Flush logs and state machines (explicit checkpoint).
    pub fn sync_all(&self) -> Result<()> {
        let groups = self.groups.read().expect("groups lock poisoned");
        for group in groups.values() {
            group.sync()?;
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut groups = self.groups.write().expect("groups lock poisoned");
        for (_, group) in groups.drain() {
            group.close()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transport-facing handlers.
    // ------------------------------------------------------------------

    pub fn handle_replicate(&self, req: ReplicateRequest) -> Result<ReplicateResponse> {
        self.group(req.group_id)?.handle_replicate(req)
    }

    pub fn handle_install_snapshot(
        &self,
        group_id: GroupId,
        snapshot: SnapshotPayload,
    ) -> Result<ReplicateResponse> {
        self.group(group_id)?.handle_install_snapshot(snapshot)
    }

    pub async fn handle_forward_propose(
        &self,
        group_id: GroupId,
        command: Vec<u8>,
    ) -> Result<SmResult> {
        self.group(group_id)?.propose(command).await
    }

    pub async fn handle_forward_read(
        &self,
        group_id: GroupId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.group(group_id)?.sync_read(payload).await
    }
}
