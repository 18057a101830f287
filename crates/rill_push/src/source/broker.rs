//! Broker client interface and the in-process broker used by tests and
//! local runs.
//!
//! The real broker client is an external collaborator; the engine only
//! depends on this trait. Offsets follow the usual broker convention: the
//! committed offset is one past the last processed message.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use xxhash_rust::xxh3::xxh3_64;

use rill_common::Result;

#[derive(Clone, Debug)]
pub struct Message {
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    /// `None` is a tombstone: delete the row identified by `key`.
    pub value: Option<Vec<u8>>,
}

#[async_trait]
pub trait MessageProvider: Send + Sync + 'static {
    /// Subscribe; positions resume from the committed offsets.
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Next message, or `None` once `poll_timeout` elapses.
    async fn get_message(&self, poll_timeout: Duration) -> Result<Option<Message>>;
    async fn commit_offsets(&self, offsets: &HashMap<i32, i64>) -> Result<()>;
    /// Offsets committed as of subscription time.
    fn committed_offsets(&self) -> HashMap<i32, i64>;
}

/// In-memory multi-partition broker. Messages are retained so a consumer
/// restart replays everything past the committed offsets, which is exactly
/// the at-least-once behavior the ingest path must absorb.
pub struct FakeBroker {
    partitions: Mutex<Vec<Vec<Message>>>,
    positions: Mutex<Vec<usize>>,
    committed: Mutex<HashMap<i32, i64>>,
    notify: tokio::sync::Notify,
}

impl FakeBroker {
    pub fn new(num_partitions: usize) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            partitions: Mutex::new(vec![Vec::new(); num_partitions.max(1)]),
            positions: Mutex::new(vec![0; num_partitions.max(1)]),
            committed: Mutex::new(HashMap::new()),
            notify: tokio::sync::Notify::new(),
        })
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.lock().expect("broker lock poisoned").len()
    }

    /// Append a message, routing by key hash like a keyed producer.
    pub fn push(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> (i32, i64) {
        let partition = (xxh3_64(&key) % self.num_partitions() as u64) as i32;
        self.push_to_partition(partition, key, value)
    }

    pub fn push_to_partition(
        &self,
        partition: i32,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    ) -> (i32, i64) {
        let mut partitions = self.partitions.lock().expect("broker lock poisoned");
        let log = &mut partitions[partition as usize];
        let offset = log.len() as i64;
        log.push(Message {
            partition,
            offset,
            key,
            value,
        });
        drop(partitions);
        self.notify.notify_waiters();
        (partition, offset)
    }

    /// Rewind consumption to the committed offsets, as a restarted
    /// consumer group would observe.
    pub fn rewind_to_committed(&self) {
        let committed = self.committed.lock().expect("broker lock poisoned");
        let mut positions = self.positions.lock().expect("broker lock poisoned");
        for (partition, position) in positions.iter_mut().enumerate() {
            *position = committed
                .get(&(partition as i32))
                .map_or(0, |offset| (*offset).max(0) as usize);
        }
    }

    fn try_next(&self) -> Option<Message> {
        let partitions = self.partitions.lock().expect("broker lock poisoned");
        let mut positions = self.positions.lock().expect("broker lock poisoned");
        for (idx, log) in partitions.iter().enumerate() {
            if positions[idx] < log.len() {
                let message = log[positions[idx]].clone();
                positions[idx] += 1;
                return Some(message);
            }
        }
        None
    }
}

#[async_trait]
impl MessageProvider for FakeBroker {
    async fn start(&self) -> Result<()> {
        self.rewind_to_committed();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn get_message(&self, poll_timeout: Duration) -> Result<Option<Message>> {
        let deadline = tokio::time::Instant::now() + poll_timeout;
        loop {
            if let Some(message) = self.try_next() {
                return Ok(Some(message));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
        }
    }

    async fn commit_offsets(&self, offsets: &HashMap<i32, i64>) -> Result<()> {
        let mut committed = self.committed.lock().expect("broker lock poisoned");
        for (partition, offset) in offsets {
            committed.insert(*partition, *offset);
        }
        Ok(())
    }

    fn committed_offsets(&self) -> HashMap<i32, i64> {
        self.committed.lock().expect("broker lock poisoned").clone()
    }
}
