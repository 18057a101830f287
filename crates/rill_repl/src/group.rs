//! A single replication group.
//!
//! Proposals are serialized through the group's sequencer (the first member
//! of the replica set): the sequencer assigns log indexes, makes entries
//! durable locally, pushes them to the other members, and applies them to
//! the state machine once a quorum has acknowledged. Members that fall
//! behind are caught up from the retained log suffix, or by a state-machine
//! snapshot when the suffix has been truncated.
//!
//! A proposal that fails with a retryable error may or may not have
//! committed; callers retry, and state-machine commands are designed so a
//! re-application is harmless (absolute-value writes, receiver-side
//! de-duplication).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rill_common::{Error, Result};

use crate::log::GroupLog;
use crate::types::{
    Entry, GroupConfig, NodeId, ReplicateRequest, ReplicateResponse, SmResult, SnapshotPayload,
    StateMachine, Transport,
};

pub struct Group {
    config: GroupConfig,
    members: RwLock<Vec<NodeId>>,
    log: GroupLog,
    sm: Mutex<Box<dyn StateMachine>>,
    transport: Arc<dyn Transport>,
    applied: AtomicU64,
    applied_since_truncate: AtomicU64,
    propose_lock: tokio::sync::Mutex<()>,
}

impl Group {
    pub fn new(
        config: GroupConfig,
        sm: Box<dyn StateMachine>,
        log_dir: &Path,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let log = GroupLog::open(log_dir.join(format!("group-{}.wal", config.group_id)))?;
        let members = config.members.clone();
        Ok(Arc::new(Self {
            config,
            members: RwLock::new(members),
            log,
            sm: Mutex::new(sm),
            transport,
            applied: AtomicU64::new(0),
            applied_since_truncate: AtomicU64::new(0),
            propose_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Open the state machine and replay the log suffix past its persisted
    /// applied index.
    pub fn start(&self) -> Result<()> {
        let mut sm = self.sm.lock().expect("sm lock poisoned");
        let applied = sm.open()?;
        self.applied.store(applied, Ordering::SeqCst);

        if self.log.last_index() < applied {
            // The log was truncated at or before the state machine's applied
            // index (snapshot install or clean shutdown); realign the floor.
            self.log.reset_to(applied)?;
        } else if let Some(suffix) = self.log.entries_from(applied + 1) {
            if !suffix.is_empty() {
                tracing::info!(
                    group = self.config.group_id,
                    from = suffix[0].index,
                    count = suffix.len(),
                    "replaying log entries"
                );
                sm.update(&suffix)?;
                self.applied
                    .store(suffix.last().map_or(applied, |e| e.index), Ordering::SeqCst);
            }
        }
        Ok(())
    }

    pub fn group_id(&self) -> u64 {
        self.config.group_id
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().expect("members lock poisoned").clone()
    }

    /// The member that sequences proposals: deterministically the first of
    /// the current replica set.
    pub fn sequencer(&self) -> Option<NodeId> {
        self.members
            .read()
            .expect("members lock poisoned")
            .first()
            .copied()
    }

    /// Drop a member from the replica set; the sequencer role follows the
    /// new first member. Unknown nodes are ignored.
    pub fn remove_member(&self, node_id: NodeId) {
        let mut members = self.members.write().expect("members lock poisoned");
        members.retain(|m| *m != node_id);
    }

    fn quorum(&self) -> usize {
        let members = self.members.read().expect("members lock poisoned");
        (members.len() / 2) + 1
    }

    pub async fn propose(self: &Arc<Self>, command: Vec<u8>) -> Result<SmResult> {
        let Some(sequencer) = self.sequencer() else {
            return Err(Error::NotReady);
        };
        if sequencer != self.config.node_id {
            return self
                .transport
                .forward_propose(sequencer, self.config.group_id, command)
                .await;
        }

        let _guard = self.propose_lock.lock().await;
        let index = self
            .log
            .last_index()
            .max(self.applied.load(Ordering::SeqCst))
            + 1;
        let entry = Entry { index, command };
        self.log.append(std::slice::from_ref(&entry))?;

        let peers: Vec<NodeId> = self
            .members()
            .into_iter()
            .filter(|m| *m != self.config.node_id)
            .collect();
        let mut acks = 1usize;
        for peer in peers {
            match self.replicate_to(peer, index).await {
                Ok(()) => acks += 1,
                Err(err) => {
                    tracing::debug!(
                        group = self.config.group_id,
                        peer,
                        error = %err,
                        "replication to peer failed"
                    );
                }
            }
        }
        if acks < self.quorum() {
            return Err(Error::NotReady);
        }

        let mut results = self.apply_entries(std::slice::from_ref(&entry))?;
        drop(_guard);
        self.maybe_truncate()?;
        results
            .pop()
            .ok_or_else(|| Error::internal("state machine returned no result"))
    }

    /// Read against the sequencer's applied state so the result reflects
    /// every committed proposal.
    pub async fn sync_read(self: &Arc<Self>, payload: Vec<u8>) -> Result<Vec<u8>> {
        let Some(sequencer) = self.sequencer() else {
            return Err(Error::NotReady);
        };
        if sequencer != self.config.node_id {
            return self
                .transport
                .forward_read(sequencer, self.config.group_id, payload)
                .await;
        }
        // Taking the propose lock orders the read after any in-flight apply.
        let _guard = self.propose_lock.lock().await;
        let sm = self.sm.lock().expect("sm lock poisoned");
        sm.lookup(&payload)
    }

    /// Push entries `[from_index ..]` to one peer, falling back to a
    /// snapshot install when the log suffix no longer reaches far enough.
    async fn replicate_to(self: &Arc<Self>, peer: NodeId, up_to: u64) -> Result<()> {
        let mut from_index = up_to;
        loop {
            let Some(entries) = self.log.entries_from(from_index) else {
                return self.install_snapshot_on(peer, up_to).await;
            };
            let req = ReplicateRequest {
                group_id: self.config.group_id,
                from: self.config.node_id,
                prev_index: from_index - 1,
                entries,
            };
            let resp = self.transport.replicate(peer, req).await?;
            if resp.ok {
                return Ok(());
            }
            if resp.match_index + 1 >= from_index {
                return Err(Error::Transient(format!(
                    "peer {peer} rejected replication without progress"
                )));
            }
            from_index = resp.match_index + 1;
        }
    }

    async fn install_snapshot_on(self: &Arc<Self>, peer: NodeId, up_to: u64) -> Result<()> {
        let snapshot = self.snapshot_payload()?;
        let resp = self
            .transport
            .install_snapshot(peer, self.config.group_id, snapshot)
            .await?;
        if !resp.ok {
            return Err(Error::Transient(format!(
                "peer {peer} rejected snapshot install"
            )));
        }
        if resp.match_index < up_to {
            if let Some(entries) = self.log.entries_from(resp.match_index + 1) {
                if !entries.is_empty() {
                    let req = ReplicateRequest {
                        group_id: self.config.group_id,
                        from: self.config.node_id,
                        prev_index: resp.match_index,
                        entries,
                    };
                    let resp = self.transport.replicate(peer, req).await?;
                    if !resp.ok {
                        return Err(Error::Transient(format!(
                            "peer {peer} rejected post-snapshot entries"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Capture the state machine as transferable bytes.
    pub fn snapshot_payload(&self) -> Result<SnapshotPayload> {
        let (snapshot, last_index) = {
            let sm = self.sm.lock().expect("sm lock poisoned");
            (sm.prepare_snapshot()?, self.applied.load(Ordering::SeqCst))
        };
        let mut data = Vec::new();
        snapshot.save(&mut data)?;
        Ok(SnapshotPayload { last_index, data })
    }

    /// Member-side handling of pushed entries.
    pub fn handle_replicate(&self, req: ReplicateRequest) -> Result<ReplicateResponse> {
        let last = self
            .log
            .last_index()
            .max(self.applied.load(Ordering::SeqCst));
        if req.prev_index > last {
            // Gap: ask the sequencer to back up.
            return Ok(ReplicateResponse {
                ok: false,
                match_index: last,
            });
        }
        let fresh: Vec<Entry> = req
            .entries
            .into_iter()
            .filter(|e| e.index > last)
            .collect();
        if fresh.is_empty() {
            return Ok(ReplicateResponse {
                ok: true,
                match_index: last,
            });
        }
        self.log.append(&fresh)?;
        self.apply_entries(&fresh)?;
        self.maybe_truncate()?;
        Ok(ReplicateResponse {
            ok: true,
            match_index: fresh.last().map_or(last, |e| e.index),
        })
    }

    /// Member-side snapshot install: replace state wholesale, then continue
    /// from the snapshot's index.
    pub fn handle_install_snapshot(&self, snapshot: SnapshotPayload) -> Result<ReplicateResponse> {
        let applied = self.applied.load(Ordering::SeqCst);
        if snapshot.last_index <= applied {
            // Already past the snapshot; nothing to install.
            return Ok(ReplicateResponse {
                ok: true,
                match_index: applied,
            });
        }
        {
            let mut sm = self.sm.lock().expect("sm lock poisoned");
            let mut reader = snapshot.data.as_slice();
            sm.recover_from_snapshot(&mut reader)?;
        }
        self.applied.store(snapshot.last_index, Ordering::SeqCst);
        self.log.reset_to(snapshot.last_index)?;
        Ok(ReplicateResponse {
            ok: true,
            match_index: snapshot.last_index,
        })
    }

    fn apply_entries(&self, entries: &[Entry]) -> Result<Vec<SmResult>> {
        let mut sm = self.sm.lock().expect("sm lock poisoned");
        let results = sm.update(entries)?;
        if let Some(last) = entries.last() {
            self.applied.store(last.index, Ordering::SeqCst);
            self.applied_since_truncate
                .fetch_add(entries.len() as u64, Ordering::Relaxed);
        }
        Ok(results)
    }

    fn maybe_truncate(&self) -> Result<()> {
        if self.config.snapshot_entries == 0 {
            return Ok(());
        }
        if self.applied_since_truncate.load(Ordering::Relaxed) < self.config.snapshot_entries {
            return Ok(());
        }
        self.applied_since_truncate.store(0, Ordering::Relaxed);
        let floor = self
            .applied
            .load(Ordering::SeqCst)
            .saturating_sub(self.config.compaction_overhead);
        self.log.truncate_below(floor)
    }

    pub fn sync(&self) -> Result<()> {
        self.log.sync()?;
        let sm = self.sm.lock().expect("sm lock poisoned");
        sm.sync()
    }

    pub fn close(&self) -> Result<()> {
        let mut sm = self.sm.lock().expect("sm lock poisoned");
        sm.close()
    }
}
