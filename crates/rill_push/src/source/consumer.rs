//! Broker poll loop.
//!
//! One consumer task per source. Offsets are committed to the broker only
//! after the ingest action has committed, so a crash between the two
//! replays messages; replays are detected against the offsets that were
//! committed at subscription time and ignored, and anything past that is
//! absorbed by the table executor's idempotent upsert handling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rill_common::Result;

use crate::source::broker::{Message, MessageProvider};
use crate::source::Source;

pub struct MessageConsumer {
    running: Arc<AtomicBool>,
    provider: Arc<dyn MessageProvider>,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MessageConsumer {
    pub async fn start(
        provider: Arc<dyn MessageProvider>,
        source: Arc<Source>,
        poll_timeout: Duration,
        max_messages: usize,
    ) -> Result<Self> {
        provider.start().await?;
        let startup_committed = provider.committed_offsets();
        let running = Arc::new(AtomicBool::new(true));

        let loop_provider = provider.clone();
        let loop_running = running.clone();
        let handle = tokio::spawn(async move {
            poll_loop(
                loop_provider,
                source,
                loop_running,
                startup_committed,
                poll_timeout,
                max_messages,
            )
            .await;
        });

        Ok(Self {
            running,
            provider,
            handle: std::sync::Mutex::new(Some(handle)),
        })
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let handle = self
            .handle
            .lock()
            .expect("consumer handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.provider.stop().await
    }
}

async fn poll_loop(
    provider: Arc<dyn MessageProvider>,
    source: Arc<Source>,
    running: Arc<AtomicBool>,
    startup_committed: HashMap<i32, i64>,
    poll_timeout: Duration,
    max_messages: usize,
) {
    while running.load(Ordering::SeqCst) {
        let (messages, offsets_to_commit) =
            match get_batch(&provider, &startup_committed, poll_timeout, max_messages).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(source = %source.name(), error = %err, "broker poll failed");
                    break;
                }
            };

        if !messages.is_empty() {
            // Blocks until the rows are durably ingested; this ordering is
            // the idempotency anchor for offset commits.
            if let Err(err) = source.handle_messages(messages).await {
                tracing::error!(source = %source.name(), error = %err, "ingest failed");
                break;
            }
        }

        // There can be offsets without messages when duplicates were
        // skipped; committing them moves the broker past the replay.
        if !offsets_to_commit.is_empty() {
            if let Err(err) = provider.commit_offsets(&offsets_to_commit).await {
                tracing::error!(source = %source.name(), error = %err, "offset commit failed");
                break;
            }
        }
    }
    running.store(false, Ordering::SeqCst);
}

async fn get_batch(
    provider: &Arc<dyn MessageProvider>,
    startup_committed: &HashMap<i32, i64>,
    poll_timeout: Duration,
    max_messages: usize,
) -> Result<(Vec<Message>, HashMap<i32, i64>)> {
    let start = Instant::now();
    let mut remaining = poll_timeout;
    let mut messages = Vec::new();
    let mut offsets_to_commit = HashMap::new();

    while messages.len() < max_messages {
        let Some(message) = provider.get_message(remaining).await? else {
            break;
        };
        // The committed offset is one past the last processed offset, so
        // the last offset actually seen before startup is committed - 1.
        let last_seen = startup_committed
            .get(&message.partition)
            .map_or(-1, |committed| committed - 1);
        offsets_to_commit.insert(message.partition, message.offset + 1);
        if message.offset <= last_seen {
            // Replayed after a crash between ingest and offset commit.
            tracing::warn!(
                partition = message.partition,
                offset = message.offset,
                "duplicate message delivery attempted, ignoring"
            );
            break;
        }
        messages.push(message);

        let elapsed = start.elapsed();
        if elapsed >= poll_timeout {
            break;
        }
        remaining = poll_timeout - elapsed;
    }
    Ok((messages, offsets_to_commit))
}
