//! Source ingest.
//!
//! A source routes parsed broker mutations to the shard that owns each
//! row's key, through the forwarder so delivery is de-duplicated, then the
//! owning shard's receive path hands them to the source's table executor.
//! The same path is used when the row already lives on the ingest shard,
//! keeping ordering and idempotency uniform.

pub mod broker;
pub mod consumer;
pub mod parser;

use std::sync::Arc;
use std::time::Duration;

use xxhash_rust::xxh3::xxh3_64;

use rill_common::Result;
use rill_store::Cluster;

use crate::exec::table::TableExecutor;
use crate::exec::ExecutionContext;
use crate::forward::{encode_delete_by_key, encode_upsert, Forwarder, TRANSFER_BATCH_SIZE};
use crate::meta::SourceInfo;
use crate::sched::ShardScheduler;
use crate::source::broker::{Message, MessageProvider};
use crate::source::consumer::MessageConsumer;
use crate::source::parser::{MessageParser, ParsedMutation};

pub struct Source {
    info: SourceInfo,
    table_exec: Arc<TableExecutor>,
    cluster: Arc<dyn Cluster>,
    forwarder: Arc<Forwarder>,
    all_shards: Vec<u64>,
    /// Ingest actions run on this local shard's scheduler.
    scheduler: Arc<ShardScheduler>,
    parser: MessageParser,
    consumer: std::sync::Mutex<Option<Arc<MessageConsumer>>>,
}

impl Source {
    pub fn new(
        info: SourceInfo,
        table_exec: Arc<TableExecutor>,
        cluster: Arc<dyn Cluster>,
        forwarder: Arc<Forwarder>,
        all_shards: Vec<u64>,
        scheduler: Arc<ShardScheduler>,
    ) -> Arc<Self> {
        let parser = MessageParser::new(info.table.clone());
        Arc::new(Self {
            info,
            table_exec,
            cluster,
            forwarder,
            all_shards,
            scheduler,
            parser,
            consumer: std::sync::Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.info.table.name
    }

    pub fn table_executor(&self) -> &Arc<TableExecutor> {
        &self.table_exec
    }

    pub async fn start_ingest(
        self: &Arc<Self>,
        provider: Arc<dyn MessageProvider>,
        poll_timeout: Duration,
        max_messages: usize,
    ) -> Result<()> {
        let consumer =
            MessageConsumer::start(provider, self.clone(), poll_timeout, max_messages).await?;
        *self.consumer.lock().expect("consumer lock poisoned") = Some(Arc::new(consumer));
        Ok(())
    }

    pub async fn stop_ingest(&self) -> Result<()> {
        let consumer = self
            .consumer
            .lock()
            .expect("consumer lock poisoned")
            .take();
        if let Some(consumer) = consumer {
            consumer.stop().await?;
        }
        Ok(())
    }

    /// Ingest one poll batch: parse, route by key hash, queue on the
    /// forwarder and transfer. Runs as a single scheduler action, so the
    /// queued rows commit as one proposal before offsets are committed.
    pub(crate) async fn handle_messages(self: &Arc<Self>, messages: Vec<Message>) -> Result<()> {
        let this = self.clone();
        self.scheduler
            .schedule(async move {
                let shard_id = this.scheduler.shard_id();
                let mut ctx =
                    ExecutionContext::new(shard_id, this.cluster.clone(), this.forwarder.clone());
                for message in &messages {
                    let (payload, pk_bytes) = match this.parser.parse_message(message)? {
                        ParsedMutation::Upsert(row) => (
                            encode_upsert(&row, &this.info.table.column_types)?,
                            this.info.table.pk_bytes(&row)?,
                        ),
                        ParsedMutation::DeleteByKey(row) => (
                            encode_delete_by_key(&row, &this.info.table.column_types)?,
                            this.info.table.pk_bytes(&row)?,
                        ),
                    };
                    let owner = this.all_shards
                        [(xxh3_64(&pk_bytes) % this.all_shards.len() as u64) as usize];
                    this.forwarder.queue_for_remote_send(
                        &mut ctx,
                        owner,
                        this.info.table.id,
                        payload,
                    )?;
                }
                let queued = ctx.queued_forwards;
                this.cluster.write_batch(ctx.batch).await?;
                if queued {
                    // A poll batch can queue more rows than one transfer
                    // pass moves; hand the remainder to a rescheduling
                    // trigger so ingest is not held up.
                    let moved = this.forwarder.transfer_data(shard_id, true).await?;
                    if moved as i64 == TRANSFER_BATCH_SIZE {
                        this.forwarder.schedule_transfer(&this.scheduler, shard_id);
                    }
                }
                Ok(())
            })
            .await
    }
}
