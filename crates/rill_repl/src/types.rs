//! Shared types for the replication engine.
//!
//! These are kept in a small module because they are used by both the group
//! engine and the storage layer's state machines.

use std::io;

use async_trait::async_trait;

use rill_common::Result;

/// Logical identifier for a replication group (one per shard, plus the
/// singleton sequence and lock groups).
pub type GroupId = u64;
/// Node identifier within the cluster.
pub type NodeId = u64;

/// One command in a group's replicated log.
#[derive(Clone, Debug)]
pub struct Entry {
    pub index: u64,
    pub command: Vec<u8>,
}

/// Result of applying one entry: a numeric status plus optional payload.
#[derive(Clone, Debug, Default)]
pub struct SmResult {
    pub value: u64,
    pub data: Vec<u8>,
}

/// Per-group configuration.
#[derive(Clone, Debug)]
pub struct GroupConfig {
    pub group_id: GroupId,
    pub node_id: NodeId,
    pub members: Vec<NodeId>,
    /// Truncate the log once this many entries have been applied past the
    /// current floor.
    pub snapshot_entries: u64,
    /// Entries retained behind the truncation point for slow followers.
    pub compaction_overhead: u64,
}

impl GroupConfig {
    pub fn quorum(&self) -> usize {
        (self.members.len() / 2) + 1
    }
}

/// Point-in-time capture of a state machine, streamed to lagging members.
pub trait StateSnapshot: Send {
    fn save(&self, writer: &mut dyn io::Write) -> Result<()>;
}

/// On-disk state machine driven by a replication group.
///
/// Implementations persist their own applied index atomically with the
/// state mutations, which is what makes log replay after a crash
/// exactly-once. `update` is never invoked concurrently with itself;
/// `lookup` may run concurrently with nothing else (the group serializes
/// reads and applies through one lock).
pub trait StateMachine: Send + 'static {
    /// Called once on group start; returns the persisted applied index so
    /// the log can replay from there.
    fn open(&mut self) -> Result<u64>;

    /// Apply a batch of committed entries in log order.
    fn update(&mut self, entries: &[Entry]) -> Result<Vec<SmResult>>;

    /// Read-only query against the current applied state.
    fn lookup(&self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Flush state durably (explicit checkpoints only; the log is the
    /// source of truth between checkpoints).
    fn sync(&self) -> Result<()>;

    /// Capture a consistent snapshot for transfer to another member.
    fn prepare_snapshot(&self) -> Result<Box<dyn StateSnapshot>>;

    /// Replace local state from a snapshot stream.
    fn recover_from_snapshot(&mut self, reader: &mut dyn io::Read) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Entries pushed from the sequencer to a member.
#[derive(Clone, Debug)]
pub struct ReplicateRequest {
    pub group_id: GroupId,
    pub from: NodeId,
    /// Index immediately before `entries[0]`; 0 for the first entry.
    pub prev_index: u64,
    pub entries: Vec<Entry>,
}

/// Ack carrying the member's highest contiguous log index. `ok == false`
/// signals a gap: the sequencer re-sends from `match_index + 1` or installs
/// a snapshot.
#[derive(Clone, Copy, Debug)]
pub struct ReplicateResponse {
    pub ok: bool,
    pub match_index: u64,
}

/// Serialized state-machine snapshot plus the index it covers.
#[derive(Clone, Debug)]
pub struct SnapshotPayload {
    pub last_index: u64,
    pub data: Vec<u8>,
}

/// Transport between group members.
///
/// The engine is transport-agnostic; implementations can use gRPC,
/// in-memory routing, or test harnesses. A target that is not reachable yet
/// should surface as a retryable error so callers can wait out peer
/// startup.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn replicate(&self, target: NodeId, req: ReplicateRequest)
        -> Result<ReplicateResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        group_id: GroupId,
        snapshot: SnapshotPayload,
    ) -> Result<ReplicateResponse>;

    /// Forward a proposal from a non-sequencer member to the sequencer.
    async fn forward_propose(
        &self,
        target: NodeId,
        group_id: GroupId,
        command: Vec<u8>,
    ) -> Result<SmResult>;

    /// Forward a read to the sequencer so it observes all applied entries.
    async fn forward_read(
        &self,
        target: NodeId,
        group_id: GroupId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>>;
}
