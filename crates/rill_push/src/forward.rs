//! Cross-shard row transfer.
//!
//! The write side queues rows under the forwarder prefix of the producing
//! shard, in the same batch as the writes that generated them, stamped
//! with the shard's next forwarder sequence. A transfer pass scans that
//! prefix, rewrites the entries under the receiver prefix of each target
//! shard (a forward-write, so the target's processor is notified), then
//! deletes the forwarded entries in an independent proposal. A crash
//! between the two re-forwards rows; the receive side drops anything at or
//! below the last sequence it recorded per sender, so delivery is
//! at-least-once on the wire and exactly-once into the DAG.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use rill_common::codec::{decode_row, encode_row, read_u64_le, read_u8};
use rill_common::{ColumnType, Error, Result, Row};
use rill_store::keys;
use rill_store::{Cluster, WriteBatch};

use crate::exec::ExecutionContext;
use crate::sched::ShardScheduler;

/// Entries moved per transfer pass; a full pass reschedules itself.
pub const TRANSFER_BATCH_SIZE: i64 = 100;
/// Entries consumed per receive pass; a full pass reschedules itself.
pub const RECEIVE_BATCH_SIZE: i64 = 100;

pub const PAYLOAD_UPSERT: u8 = 1;
pub const PAYLOAD_DELETE_BY_KEY: u8 = 2;

/// Encode an inserted/updated row for transfer.
pub fn encode_upsert(row: &Row, col_types: &[ColumnType]) -> Result<Vec<u8>> {
    let mut buf = vec![PAYLOAD_UPSERT];
    encode_row(row, col_types, &mut buf)?;
    Ok(buf)
}

/// Encode a delete carrying only key columns (non-key columns null).
pub fn encode_delete_by_key(key_row: &Row, col_types: &[ColumnType]) -> Result<Vec<u8>> {
    let mut buf = vec![PAYLOAD_DELETE_BY_KEY];
    encode_row(key_row, col_types, &mut buf)?;
    Ok(buf)
}

/// Decode a transferred row payload into its kind tag and row.
pub fn decode_row_payload(data: &[u8], col_types: &[ColumnType]) -> Result<(u8, Row)> {
    let mut offset = 0usize;
    let kind = read_u8(data, &mut offset)?;
    if kind != PAYLOAD_UPSERT && kind != PAYLOAD_DELETE_BY_KEY {
        return Err(Error::corrupt(format!("unknown row payload kind {kind}")));
    }
    let row = decode_row(data, col_types, &mut offset)?;
    Ok((kind, row))
}

/// Consumes the per-consumer row bundles a receive pass produced; the
/// engine implements this by dispatching on consumer id.
#[async_trait]
pub trait RemoteRowHandler: Send + Sync {
    async fn handle_remote_rows(
        &self,
        rows_by_consumer: BTreeMap<u64, Vec<Vec<u8>>>,
        ctx: &mut ExecutionContext,
    ) -> Result<()>;
}

pub struct Forwarder {
    cluster: Arc<dyn Cluster>,
    /// Next forwarder sequence per local shard. Written through to the KV
    /// store inside the producing batch; the cache may run ahead of
    /// storage if a proposal fails, which leaves harmless gaps in the
    /// sequence (receivers only require monotonicity).
    forward_seqs: Mutex<HashMap<u64, u64>>,
}

impl Forwarder {
    pub fn new(cluster: Arc<dyn Cluster>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            forward_seqs: Mutex::new(HashMap::new()),
        })
    }

    /// Queue `payload` for delivery to `consumer_id` on `remote_shard`.
    /// The forwarder entry and the sequence bump ride in the caller's
    /// batch, so they commit atomically with the writes that produced the
    /// row.
    pub fn queue_for_remote_send(
        &self,
        ctx: &mut ExecutionContext,
        remote_shard: u64,
        consumer_id: u64,
        payload: Vec<u8>,
    ) -> Result<()> {
        let local_shard = ctx.shard_id();
        let sequence = self.next_forward_sequence(local_shard)?;
        ctx.batch.add_put(
            keys::forwarder_key(local_shard, remote_shard, sequence, consumer_id),
            payload,
        );
        ctx.batch.add_put(
            keys::forwarder_seq_key(local_shard),
            (sequence + 1).to_le_bytes().to_vec(),
        );
        self.forward_seqs
            .lock()
            .expect("forward seq lock poisoned")
            .insert(local_shard, sequence + 1);
        ctx.queued_forwards = true;
        Ok(())
    }

    /// Sequences start at 1 so a receiver's initial last-received of 0
    /// accepts the first row.
    fn next_forward_sequence(&self, local_shard: u64) -> Result<u64> {
        let mut cache = self
            .forward_seqs
            .lock()
            .expect("forward seq lock poisoned");
        if let Some(seq) = cache.get(&local_shard) {
            return Ok(*seq);
        }
        let stored = match self.cluster.local_get(&keys::forwarder_seq_key(local_shard))? {
            Some(value) => {
                let mut offset = 0;
                read_u64_le(&value, &mut offset)?
            }
            None => 1,
        };
        cache.insert(local_shard, stored);
        Ok(stored)
    }

    /// Queue transfer passes for `local_shard` until its forwarder queue
    /// drains below a full batch. Each pass is its own scheduler action,
    /// so other shard work interleaves between passes.
    pub fn schedule_transfer(self: &Arc<Self>, scheduler: &Arc<ShardScheduler>, local_shard: u64) {
        let forwarder = self.clone();
        let scheduler_handle = scheduler.clone();
        scheduler.schedule_fire_and_forget(async move {
            let moved = forwarder.transfer_data(local_shard, true).await?;
            if moved as i64 == TRANSFER_BATCH_SIZE {
                forwarder.schedule_transfer(&scheduler_handle, local_shard);
            }
            Ok(())
        });
    }

    /// Move queued entries to their target shards. Returns the number of
    /// entries scanned so the caller can reschedule when the pass was
    /// full.
    pub async fn transfer_data(&self, local_shard: u64, delete: bool) -> Result<usize> {
        let prefix = keys::forwarder_prefix(local_shard);
        let upper = keys::table_prefix(local_shard, keys::FORWARDER_TID + 1);
        let pairs = self
            .cluster
            .local_scan(&prefix, &upper, TRANSFER_BATCH_SIZE)?;
        if pairs.is_empty() {
            return Ok(0);
        }

        // The scan comes back ordered by (remote shard, sequence), so one
        // linear pass groups entries per target.
        let mut add_batch: Option<WriteBatch> = None;
        let mut delete_batch = WriteBatch::new(local_shard, false);
        let mut batches: Vec<WriteBatch> = Vec::new();
        let mut current_remote = 0u64;
        for pair in &pairs {
            let (remote_shard, sequence, consumer_id) = keys::decode_forwarder_key(&pair.key);
            if add_batch.is_none() || remote_shard != current_remote {
                if let Some(batch) = add_batch.take() {
                    batches.push(batch);
                }
                add_batch = Some(WriteBatch::new(remote_shard, true));
                current_remote = remote_shard;
            }
            add_batch.as_mut().expect("add batch exists").add_put(
                keys::receiver_key(remote_shard, local_shard, sequence, consumer_id),
                pair.value.clone(),
            );
            delete_batch.add_delete(pair.key.clone());
        }
        if let Some(batch) = add_batch.take() {
            batches.push(batch);
        }

        // Adds first, deletes after: a crash in between re-forwards, which
        // the receiver de-duplicates.
        for batch in batches {
            self.cluster.write_batch(batch).await?;
        }
        if delete {
            self.cluster.write_batch(delete_batch).await?;
        }
        Ok(pairs.len())
    }

    /// Drain the receiver prefix of `receiving_shard`: de-duplicate per
    /// sender, bundle fresh rows per consumer, let the handler run the
    /// push DAG, and commit downstream writes + sequence updates + queue
    /// deletions as one batch.
    pub async fn handle_received_rows(
        self: &Arc<Self>,
        receiving_shard: u64,
        handler: &dyn RemoteRowHandler,
    ) -> Result<usize> {
        let prefix = keys::receiver_prefix(receiving_shard);
        let upper = keys::table_prefix(receiving_shard, keys::RECEIVER_TID + 1);
        let pairs = self.cluster.local_scan(&prefix, &upper, RECEIVE_BATCH_SIZE)?;
        if pairs.is_empty() {
            return Ok(0);
        }

        let mut ctx =
            ExecutionContext::new(receiving_shard, self.cluster.clone(), self.clone());
        let mut last_received: HashMap<u64, u64> = HashMap::new();
        let mut rows_by_consumer: BTreeMap<u64, Vec<Vec<u8>>> = BTreeMap::new();

        for pair in &pairs {
            let (sending_shard, sequence, consumer_id) = keys::decode_receiver_key(&pair.key);
            let last = match last_received.get(&sending_shard) {
                Some(last) => *last,
                None => {
                    let stored = self.last_receiving_sequence(receiving_shard, sending_shard)?;
                    last_received.insert(sending_shard, stored);
                    stored
                }
            };
            if sequence > last {
                rows_by_consumer
                    .entry(consumer_id)
                    .or_default()
                    .push(pair.value.clone());
                last_received.insert(sending_shard, sequence);
            } else {
                // Re-forwarded after a crash; already processed.
                tracing::debug!(
                    shard = receiving_shard,
                    sender = sending_shard,
                    sequence,
                    "dropping duplicate forwarded row"
                );
            }
            ctx.batch.add_delete(pair.key.clone());
        }

        if !rows_by_consumer.is_empty() {
            handler.handle_remote_rows(rows_by_consumer, &mut ctx).await?;
        }
        for (sending_shard, sequence) in &last_received {
            ctx.batch.add_put(
                keys::receiver_seq_key(receiving_shard, *sending_shard),
                sequence.to_le_bytes().to_vec(),
            );
        }

        let queued = ctx.queued_forwards;
        self.cluster.write_batch(ctx.batch).await?;
        if queued {
            // Downstream executors forwarded rows onward (chained MVs);
            // move them now rather than waiting for the next trigger. The
            // receive action already owns the shard, so drain in place.
            loop {
                let moved = self.transfer_data(receiving_shard, true).await?;
                if (moved as i64) < TRANSFER_BATCH_SIZE {
                    break;
                }
            }
        }
        Ok(pairs.len())
    }

    fn last_receiving_sequence(&self, receiving_shard: u64, sending_shard: u64) -> Result<u64> {
        match self
            .cluster
            .local_get(&keys::receiver_seq_key(receiving_shard, sending_shard))?
        {
            Some(value) => {
                let mut offset = 0;
                read_u64_le(&value, &mut offset)
            }
            None => Ok(0),
        }
    }
}
