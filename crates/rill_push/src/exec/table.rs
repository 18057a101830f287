//! Table executor: persists the row stream of a source or materialized
//! view and feeds consuming DAGs, including bootstrapping a new consumer
//! from a snapshot while rows keep arriving (the fill protocol).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use rill_common::codec::{decode_row, encode_row, increment_bytes, read_u8};
use rill_common::{ColumnType, Error, Result, Row, Rows, RowsBatch, RowsEntry};
use rill_store::keys;
use rill_store::{Cluster, KvPair};

use crate::exec::{ExecutionContext, PushExecutor};
use crate::forward::Forwarder;
use crate::meta::TableInfo;
use crate::sched::ShardScheduler;

/// Below this many outstanding captured rows the catch-up loop finishes
/// under the write lock, guaranteeing it is fully caught up when the new
/// consumer is installed.
const LOCK_AND_LOAD_MAX_ROWS: usize = 10;
/// Rows per snapshot page pushed during a fill.
const FILL_MAX_BATCH_SIZE: i64 = 1000;
/// How long to wait for in-flight batches to commit before snapshotting.
const UNCOMMITTED_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TableExecutor {
    table: TableInfo,
    cluster: Arc<dyn Cluster>,
    consuming_nodes: RwLock<HashMap<String, Arc<dyn PushExecutor>>>,
    /// Row processing takes this read; a fill takes write while it flips
    /// capture state or finishes catch-up.
    lock: tokio::sync::RwLock<()>,
    filling: AtomicBool,
    fill_table_id: AtomicU64,
    /// Last capture sequence written per shard during a fill.
    last_sequences: Mutex<HashMap<u64, i64>>,
    /// Shards with a built-but-not-yet-committed batch; commit callbacks
    /// clear entries.
    uncommitted_batches: Arc<Mutex<HashSet<u64>>>,
}

impl TableExecutor {
    pub fn new(table: TableInfo, cluster: Arc<dyn Cluster>) -> Arc<Self> {
        Arc::new(Self {
            table,
            cluster,
            consuming_nodes: RwLock::new(HashMap::new()),
            lock: tokio::sync::RwLock::new(()),
            filling: AtomicBool::new(false),
            fill_table_id: AtomicU64::new(0),
            last_sequences: Mutex::new(HashMap::new()),
            uncommitted_batches: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn table_info(&self) -> &TableInfo {
        &self.table
    }

    pub fn add_consuming_node(&self, name: &str, node: Arc<dyn PushExecutor>) {
        self.consuming_nodes
            .write()
            .expect("consumers lock poisoned")
            .insert(name.to_string(), node);
    }

    pub fn remove_consuming_node(&self, name: &str) {
        self.consuming_nodes
            .write()
            .expect("consumers lock poisoned")
            .remove(name);
    }

    pub fn consuming_node_names(&self) -> Vec<String> {
        self.consuming_nodes
            .read()
            .expect("consumers lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    fn consumers(&self) -> Vec<Arc<dyn PushExecutor>> {
        self.consuming_nodes
            .read()
            .expect("consumers lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    async fn forward_and_capture(
        &self,
        batch: RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        for consumer in self.consumers() {
            consumer.handle_rows(batch.clone(), ctx).await?;
        }
        if self.filling.load(Ordering::SeqCst) && !batch.is_empty() {
            self.capture_changes(self.fill_table_id.load(Ordering::SeqCst), &batch, ctx)?;
        }
        Ok(())
    }

    /// Write the batch's mutations into the fill table, in the same
    /// consensus batch as the table writes so capture and table state
    /// cannot diverge.
    fn capture_changes(
        &self,
        fill_table_id: u64,
        batch: &RowsBatch,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let shard_id = ctx.shard_id();
        let mut sequences = self
            .last_sequences
            .lock()
            .expect("fill sequences lock poisoned");
        let mut next = sequences.get(&shard_id).map_or(0, |last| last + 1);
        for i in 0..batch.len() {
            let payload =
                encode_capture(batch.previous_row(i), batch.current_row(i), &self.table.column_types)?;
            ctx.batch
                .add_put(capture_key(shard_id, fill_table_id, next), payload);
            next += 1;
        }
        sequences.insert(shard_id, next - 1);
        Ok(())
    }

    async fn wait_for_no_uncommitted_batches(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self
                .uncommitted_batches
                .lock()
                .expect("uncommitted lock poisoned")
                .is_empty()
            {
                return Ok(());
            }
            if start.elapsed() > UNCOMMITTED_WAIT_TIMEOUT {
                return Err(Error::Timeout(
                    "waiting for uncommitted batches before fill".into(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Fill `pe` with every row of this table, capture concurrent changes,
    /// replay them, and install `pe` as a consumer once in sync.
    pub async fn fill_to(
        self: &Arc<Self>,
        pe: Arc<dyn PushExecutor>,
        consumer_name: &str,
        forwarder: &Arc<Forwarder>,
        schedulers: &HashMap<u64, Arc<ShardScheduler>>,
    ) -> Result<()> {
        tracing::debug!(table = %self.table.name, consumer = consumer_name, "starting fill");

        let fill_table_id = self.cluster.generate_cluster_sequence("table").await?
            + keys::USER_TABLE_BASE;

        // Register the fill prefixes so a crash mid-fill is cleaned up on
        // the next startup.
        let shard_ids: Vec<u64> = schedulers.keys().copied().collect();
        let mut prefixes = Vec::with_capacity(shard_ids.len());
        for &shard_id in &shard_ids {
            let prefix = keys::table_prefix(shard_id, fill_table_id);
            self.cluster.register_prefix_to_delete(&prefix)?;
            prefixes.push(prefix);
        }

        // Lock out row processing; anything already past the lock must
        // commit before the snapshot or it would be missed by both the
        // snapshot and the capture.
        let guard = self.lock.write().await;
        self.wait_for_no_uncommitted_batches().await?;
        self.filling.store(true, Ordering::SeqCst);
        self.fill_table_id.store(fill_table_id, Ordering::SeqCst);
        let snapshot = Arc::new(self.cluster.create_snapshot()?);
        drop(guard);

        // Stream the snapshot into the new consumer, one task per shard.
        let mut join_handles = Vec::with_capacity(shard_ids.len());
        for &shard_id in &shard_ids {
            let this = self.clone();
            let pe = pe.clone();
            let forwarder = forwarder.clone();
            let snapshot = snapshot.clone();
            join_handles.push(tokio::spawn(async move {
                this.replay_shard_snapshot(shard_id, &snapshot, &pe, &forwarder)
                    .await
            }));
        }
        for handle in join_handles {
            handle
                .await
                .map_err(|err| Error::internal(format!("fill task panicked: {err}")))??;
        }
        drop(snapshot);
        tracing::debug!(table = %self.table.name, "snapshot replayed, catching up tail");

        // Catch-up: replay captured changes in rounds until the remainder
        // is small enough to finish under the write lock.
        let mut start_seqs: HashMap<u64, i64> = HashMap::new();
        loop {
            let guard = self.lock.write().await;

            let mut end_seqs: HashMap<u64, i64> = HashMap::new();
            let mut rows_to_fill = 0usize;
            {
                let sequences = self
                    .last_sequences
                    .lock()
                    .expect("fill sequences lock poisoned");
                for (&shard_id, &last) in sequences.iter() {
                    let prev = start_seqs.get(&shard_id).copied().unwrap_or(-1);
                    if last > prev {
                        end_seqs.insert(shard_id, last + 1);
                        rows_to_fill += (last - prev) as usize;
                        start_seqs.entry(shard_id).or_insert(0);
                    }
                }
            }

            let lock_and_load = rows_to_fill < LOCK_AND_LOAD_MAX_ROWS;
            if !lock_and_load {
                // Too much tail to hold the lock for; replay outside it
                // and go around again.
                drop(guard);
                self.replay_changes(&start_seqs, &end_seqs, fill_table_id, &pe, forwarder)
                    .await?;
                for (shard_id, end) in end_seqs {
                    start_seqs.insert(shard_id, end);
                }
                continue;
            }

            if rows_to_fill > 0 {
                self.replay_changes(&start_seqs, &end_seqs, fill_table_id, &pe, forwarder)
                    .await?;
            }
            self.filling.store(false, Ordering::SeqCst);
            self.last_sequences
                .lock()
                .expect("fill sequences lock poisoned")
                .clear();
            self.add_consuming_node(consumer_name, pe.clone());
            drop(guard);
            break;
        }

        // Fill data is transient; wipe it everywhere and drop the crash
        // registrations.
        let start_suffix = fill_table_id.to_be_bytes();
        let end_suffix = (fill_table_id + 1).to_be_bytes();
        for &shard_id in &shard_ids {
            self.cluster
                .delete_all_data_in_range_for_shard(shard_id, &start_suffix, &end_suffix)
                .await?;
        }
        for prefix in &prefixes {
            self.cluster.unregister_prefix_to_delete(prefix)?;
        }

        // An aggregation in the new DAG forwarded rows during the fill;
        // move them now. A whole fill can queue far more than one transfer
        // pass, so the trigger reschedules itself until the queue drains.
        for (&shard_id, scheduler) in schedulers {
            forwarder.schedule_transfer(scheduler, shard_id);
        }

        tracing::debug!(table = %self.table.name, consumer = consumer_name, "fill complete");
        Ok(())
    }

    async fn replay_shard_snapshot(
        &self,
        shard_id: u64,
        snapshot: &rill_store::KvSnapshot,
        pe: &Arc<dyn PushExecutor>,
        forwarder: &Arc<Forwarder>,
    ) -> Result<()> {
        let mut lower = keys::table_prefix(shard_id, self.table.id);
        let upper = keys::table_prefix(shard_id, self.table.id + 1);
        loop {
            let page =
                self.cluster
                    .local_scan_with_snapshot(snapshot, &lower, &upper, FILL_MAX_BATCH_SIZE)?;
            if page.is_empty() {
                return Ok(());
            }
            let last_key = page[page.len() - 1].key.clone();
            let full = page.len() as i64 == FILL_MAX_BATCH_SIZE;
            self.send_fill_page(shard_id, page, pe, forwarder).await?;
            if !full {
                return Ok(());
            }
            lower = increment_bytes(&last_key);
        }
    }

    async fn send_fill_page(
        &self,
        shard_id: u64,
        page: Vec<KvPair>,
        pe: &Arc<dyn PushExecutor>,
        forwarder: &Arc<Forwarder>,
    ) -> Result<()> {
        let mut rows = Rows::with_capacity(page.len());
        for pair in &page {
            let mut offset = 0usize;
            rows.append(decode_row(&pair.value, &self.table.column_types, &mut offset)?);
        }
        let mut ctx = ExecutionContext::new(shard_id, self.cluster.clone(), forwarder.clone());
        pe.handle_rows(RowsBatch::from_current(rows), &mut ctx).await?;
        self.cluster.write_batch(ctx.batch).await
    }

    async fn replay_changes(
        &self,
        start_seqs: &HashMap<u64, i64>,
        end_seqs: &HashMap<u64, i64>,
        fill_table_id: u64,
        pe: &Arc<dyn PushExecutor>,
        forwarder: &Arc<Forwarder>,
    ) -> Result<()> {
        for (&shard_id, &end_seq) in end_seqs {
            let start_seq = start_seqs.get(&shard_id).copied().unwrap_or(0);
            let lower = capture_key(shard_id, fill_table_id, start_seq);
            let upper = capture_key(shard_id, fill_table_id, end_seq);
            let pairs = self.cluster.local_scan(&lower, &upper, -1)?;
            if pairs.is_empty() {
                continue;
            }
            let mut rows = Rows::new();
            let mut entries = Vec::with_capacity(pairs.len());
            for pair in &pairs {
                let (prev, curr) = decode_capture(&pair.value, &self.table.column_types)?;
                let prev_idx = prev.map(|row| {
                    rows.append(row);
                    rows.len() - 1
                });
                let curr_idx = curr.map(|row| {
                    rows.append(row);
                    rows.len() - 1
                });
                entries.push(RowsEntry::new(prev_idx, curr_idx));
            }
            let mut ctx =
                ExecutionContext::new(shard_id, self.cluster.clone(), forwarder.clone());
            pe.handle_rows(RowsBatch::new(rows, entries), &mut ctx).await?;
            self.cluster.write_batch(ctx.batch).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PushExecutor for TableExecutor {
    fn col_names(&self) -> &[String] {
        &self.table.column_names
    }

    fn col_types(&self) -> &[ColumnType] {
        &self.table.column_types
    }

    fn key_cols(&self) -> &[usize] {
        &self.table.pk_cols
    }

    fn set_parent(&self, _parent: Arc<dyn PushExecutor>) {
        panic!("table executors feed consumers, not a parent");
    }

    async fn handle_rows(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> Result<()> {
        let _guard = self.lock.read().await;

        // Track the in-flight batch; the fill protocol waits these out
        // before snapshotting. The callback fires after the proposal
        // commits, outside this lock.
        let shard_id = ctx.shard_id();
        self.uncommitted_batches
            .lock()
            .expect("uncommitted lock poisoned")
            .insert(shard_id);
        let uncommitted = self.uncommitted_batches.clone();
        ctx.batch.add_committed_callback(Box::new(move || {
            uncommitted
                .lock()
                .expect("uncommitted lock poisoned")
                .remove(&shard_id);
        }));

        let mut rows = Rows::new();
        let mut entries = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            match batch.current_row(i) {
                Some(curr) => {
                    let key = self.table.row_key(shard_id, curr)?;
                    let stored = match ctx.batch.get_pending(&key) {
                        Some(pending) => pending.map(|v| v.to_vec()),
                        None => ctx.cluster.local_get(&key)?,
                    };
                    // An existing row under the same key becomes the
                    // previous image, so downstream sees delete+insert;
                    // sources replaying the same key rely on this.
                    let prev_idx = match stored {
                        Some(value) => {
                            let mut offset = 0usize;
                            rows.append(decode_row(&value, &self.table.column_types, &mut offset)?);
                            Some(rows.len() - 1)
                        }
                        None => None,
                    };
                    rows.append(curr.clone());
                    let curr_idx = rows.len() - 1;
                    let mut value = Vec::new();
                    encode_row(curr, &self.table.column_types, &mut value)?;
                    ctx.batch.add_put(key, value);
                    entries.push(RowsEntry::new(prev_idx, Some(curr_idx)));
                }
                None => {
                    let Some(prev) = batch.previous_row(i) else {
                        return Err(Error::corrupt("row entry with neither side"));
                    };
                    let key = self.table.row_key(shard_id, prev)?;
                    let stored = match ctx.batch.get_pending(&key) {
                        Some(pending) => pending.map(|v| v.to_vec()),
                        None => ctx.cluster.local_get(&key)?,
                    };
                    // Deleting a row that is not there is a no-op; replays
                    // and key-only deletes both end up here.
                    let Some(value) = stored else {
                        continue;
                    };
                    let mut offset = 0usize;
                    rows.append(decode_row(&value, &self.table.column_types, &mut offset)?);
                    entries.push(RowsEntry::new(Some(rows.len() - 1), None));
                    ctx.batch.add_delete(key);
                }
            }
        }

        self.forward_and_capture(RowsBatch::new(rows, entries), ctx)
            .await
    }
}

fn capture_key(shard_id: u64, fill_table_id: u64, sequence: i64) -> Vec<u8> {
    let mut key = keys::table_prefix(shard_id, fill_table_id);
    key.extend_from_slice(&((sequence as u64) ^ (1u64 << 63)).to_be_bytes());
    key
}

/// `u8 flags (bit0 prev, bit1 curr)` + encoded rows. Deletes are captured
/// too, so a fill replays the exact mutation stream.
fn encode_capture(
    prev: Option<&Row>,
    curr: Option<&Row>,
    col_types: &[ColumnType],
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(32);
    let flags = u8::from(prev.is_some()) | (u8::from(curr.is_some()) << 1);
    buf.push(flags);
    if let Some(prev) = prev {
        encode_row(prev, col_types, &mut buf)?;
    }
    if let Some(curr) = curr {
        encode_row(curr, col_types, &mut buf)?;
    }
    Ok(buf)
}

fn decode_capture(data: &[u8], col_types: &[ColumnType]) -> Result<(Option<Row>, Option<Row>)> {
    let mut offset = 0usize;
    let flags = read_u8(data, &mut offset)?;
    let prev = if flags & 1 != 0 {
        Some(decode_row(data, col_types, &mut offset)?)
    } else {
        None
    };
    let curr = if flags & 2 != 0 {
        Some(decode_row(data, col_types, &mut offset)?)
    } else {
        None
    };
    Ok((prev, curr))
}
