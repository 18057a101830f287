//! The replicated state machine for one data shard.
//!
//! One instance exists per (node, shard). All replicas apply writes
//! identically; exactly one replica (the processor) additionally runs the
//! push DAG, and is prodded through its shard listener whenever an applied
//! batch contained forward writes. The applied log index is persisted in
//! the same atomic KV batch as the entries it covers, which makes
//! re-application after a crash exactly-once.

use std::io::{Read, Write};
use std::sync::Arc;

use rill_common::codec::{read_u32_be, read_u64_le};
use rill_common::{Error, Result};
use rill_repl::{Entry, SmResult, StateMachine, StateSnapshot};

use crate::cluster::{
    calc_processor, deserialize_write_batch, QueryExecutionInfo, RemoteQueryCallback,
    ShardListener, ShardListenerFactory,
};
use crate::keys;
use crate::kv::{KvSnapshot, KvStore};

pub const SM_CMD_WRITE: u8 = 1;
pub const SM_CMD_FORWARD_WRITE: u8 = 2;
pub const SM_CMD_REMOVE_NODE: u8 = 3;
pub const SM_CMD_DELETE_RANGE: u8 = 4;

pub const SM_RESPONSE_OK: u64 = 1;

pub const LOOKUP_PING: u8 = 1;
pub const LOOKUP_QUERY: u8 = 2;

/// Page size used when streaming a shard snapshot.
const SNAPSHOT_SCAN_PAGE: i64 = 10_000;
/// Pairs per KV batch when ingesting a snapshot stream.
const SNAPSHOT_INGEST_CHUNK: usize = 10_000;

pub struct ShardStateMachine {
    shard_id: u64,
    node_id: u64,
    replicas: Vec<u64>,
    processor: bool,
    kv: Arc<KvStore>,
    listener: Option<Box<dyn ShardListener>>,
    listener_factory: Arc<dyn ShardListenerFactory>,
    query_callback: Arc<dyn RemoteQueryCallback>,
}

impl ShardStateMachine {
    pub fn new(
        shard_id: u64,
        node_id: u64,
        replicas: Vec<u64>,
        kv: Arc<KvStore>,
        listener_factory: Arc<dyn ShardListenerFactory>,
        query_callback: Arc<dyn RemoteQueryCallback>,
    ) -> Self {
        let processor = calc_processor(&replicas, shard_id, node_id);
        let listener =
            processor.then(|| listener_factory.create_shard_listener(shard_id));
        Self {
            shard_id,
            node_id,
            replicas,
            processor,
            kv,
            listener,
            listener_factory,
            query_callback,
        }
    }

    fn check_key(&self, key: &[u8]) {
        // Sanity guard: a batch routed to this shard must only write keys
        // under this shard's prefix. A violation means corruption or a bug,
        // and continuing would spread it to all replicas.
        let shard = keys::shard_of_key(key);
        if shard != self.shard_id {
            panic!(
                "key for shard {shard} written through state machine of shard {}",
                self.shard_id
            );
        }
    }

    fn maybe_trigger_remote_write(&self) {
        if self.processor {
            if let Some(listener) = &self.listener {
                listener.remote_write_occurred();
            }
        }
    }

    fn handle_remove_node(&mut self, command: &[u8]) -> Result<()> {
        let mut offset = 1usize;
        let removed = read_u32_be(command, &mut offset)? as u64;
        if !self.replicas.contains(&removed) {
            // Every node proposes the removal when it observes the
            // membership change, so it may already be applied.
            return Ok(());
        }
        self.replicas.retain(|n| *n != removed);
        let now_processor = calc_processor(&self.replicas, self.shard_id, self.node_id);
        if now_processor != self.processor {
            if let Some(listener) = self.listener.take() {
                listener.close();
            }
            self.processor = now_processor;
            if now_processor {
                self.listener = Some(
                    self.listener_factory
                        .create_shard_listener(self.shard_id),
                );
            }
        }
        Ok(())
    }

    fn flush(
        &self,
        puts: &mut Vec<(Vec<u8>, Vec<u8>)>,
        deletes: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        if puts.is_empty() && deletes.is_empty() {
            return Ok(());
        }
        self.kv.write(puts, deletes)?;
        puts.clear();
        deletes.clear();
        Ok(())
    }
}

impl StateMachine for ShardStateMachine {
    fn open(&mut self) -> Result<u64> {
        let key = keys::last_log_index_key(self.shard_id);
        match self.kv.get(&key)? {
            Some(value) => {
                let mut offset = 0;
                read_u64_le(&value, &mut offset)
            }
            None => Ok(0),
        }
    }

    fn update(&mut self, entries: &[Entry]) -> Result<Vec<SmResult>> {
        let mut puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut deletes: Vec<Vec<u8>> = Vec::new();
        let mut has_forward = false;
        let mut results = Vec::with_capacity(entries.len());

        for entry in entries {
            let command = &entry.command;
            let tag = *command
                .first()
                .ok_or_else(|| Error::corrupt("empty shard command"))?;
            match tag {
                SM_CMD_WRITE | SM_CMD_FORWARD_WRITE => {
                    let mut offset = 1usize;
                    let (batch_puts, batch_deletes) =
                        deserialize_write_batch(command, &mut offset)?;
                    for (key, value) in batch_puts {
                        self.check_key(&key);
                        puts.push((key, value));
                    }
                    for key in batch_deletes {
                        self.check_key(&key);
                        deletes.push(key);
                    }
                    if tag == SM_CMD_FORWARD_WRITE {
                        has_forward = true;
                    }
                }
                SM_CMD_REMOVE_NODE => self.handle_remove_node(command)?,
                SM_CMD_DELETE_RANGE => {
                    // Range deletes cannot ride in the same KV batch as
                    // point writes; flush what precedes them to preserve
                    // entry order.
                    self.flush(&mut puts, &mut deletes)?;
                    let mut offset = 1usize;
                    let start = rill_common::codec::read_bytes(command, &mut offset)?.to_vec();
                    let end = rill_common::codec::read_bytes(command, &mut offset)?.to_vec();
                    self.kv.delete_range(&start, &end)?;
                }
                other => panic!("unexpected shard command tag {other}"),
            }
            results.push(SmResult {
                value: SM_RESPONSE_OK,
                data: Vec::new(),
            });
        }

        if let Some(last) = entries.last() {
            puts.push((
                keys::last_log_index_key(self.shard_id),
                last.index.to_le_bytes().to_vec(),
            ));
        }
        self.flush(&mut puts, &mut deletes)?;

        // A forward write moves rows between shards; the processor replica
        // kicks its receive path once per applied batch.
        if has_forward {
            self.maybe_trigger_remote_write();
        }
        Ok(results)
    }

    fn lookup(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let tag = *payload
            .first()
            .ok_or_else(|| Error::corrupt("empty lookup payload"))?;
        match tag {
            LOOKUP_PING => Ok(Vec::new()),
            LOOKUP_QUERY => {
                let info = QueryExecutionInfo::deserialize(&payload[1..])?;
                self.query_callback.execute_remote_pull_query(&info)
            }
            other => Err(Error::corrupt(format!("unknown lookup tag {other}"))),
        }
    }

    fn sync(&self) -> Result<()> {
        self.kv.sync()
    }

    fn prepare_snapshot(&self) -> Result<Box<dyn StateSnapshot>> {
        Ok(Box::new(ShardSnapshot {
            shard_id: self.shard_id,
            kv: self.kv.clone(),
            snapshot: self.kv.snapshot(),
        }))
    }

    fn recover_from_snapshot(&mut self, reader: &mut dyn Read) -> Result<()> {
        let start = keys::shard_prefix(self.shard_id);
        let end = keys::shard_prefix(self.shard_id + 1);
        self.kv.delete_range(&start, &end)?;

        let mut chunk: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        loop {
            let Some(key) = read_framed(reader)? else {
                break;
            };
            let value = read_framed(reader)?
                .ok_or_else(|| Error::corrupt("snapshot stream truncated at value"))?;
            chunk.push((key, value));
            if chunk.len() >= SNAPSHOT_INGEST_CHUNK {
                self.kv.write(&chunk, &[])?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            self.kv.write(&chunk, &[])?;
        }

        // A forward write may have been in flight when the snapshot was
        // taken; re-kick the receive path (idempotent).
        self.maybe_trigger_remote_write();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(listener) = self.listener.take() {
            listener.close();
        }
        Ok(())
    }
}

/// Streams every pair under the shard's prefix framed as
/// `(u32 klen, key, u32 vlen, value)*`.
struct ShardSnapshot {
    shard_id: u64,
    kv: Arc<KvStore>,
    snapshot: KvSnapshot,
}

impl StateSnapshot for ShardSnapshot {
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let mut lower = keys::shard_prefix(self.shard_id);
        let upper = keys::shard_prefix(self.shard_id + 1);
        loop {
            let page = self
                .kv
                .scan_snapshot(&self.snapshot, &lower, &upper, SNAPSHOT_SCAN_PAGE)?;
            for pair in &page {
                write_framed(writer, &pair.key)?;
                write_framed(writer, &pair.value)?;
            }
            if (page.len() as i64) < SNAPSHOT_SCAN_PAGE {
                return Ok(());
            }
            lower = rill_common::codec::increment_bytes(&page[page.len() - 1].key);
        }
    }
}

fn write_framed(writer: &mut dyn Write, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .and_then(|_| writer.write_all(bytes))
        .map_err(|err| Error::internal(format!("snapshot write: {err}")))
}

/// Read one length-prefixed frame; `None` at clean end of stream.
fn read_framed(reader: &mut dyn Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(Error::internal(format!("snapshot read: {err}"))),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .map_err(|err| Error::corrupt(format!("snapshot stream truncated: {err}")))?;
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::WriteBatch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        triggers: Arc<AtomicUsize>,
    }

    impl ShardListener for CountingListener {
        fn remote_write_occurred(&self) {
            self.triggers.fetch_add(1, Ordering::SeqCst);
        }
        fn close(&self) {}
    }

    struct CountingFactory {
        triggers: Arc<AtomicUsize>,
    }

    impl ShardListenerFactory for CountingFactory {
        fn create_shard_listener(&self, _shard_id: u64) -> Box<dyn ShardListener> {
            Box::new(CountingListener {
                triggers: self.triggers.clone(),
            })
        }
    }

    struct NoQuery;
    impl RemoteQueryCallback for NoQuery {
        fn execute_remote_pull_query(&self, _info: &QueryExecutionInfo) -> Result<Vec<u8>> {
            Ok(8u64.to_be_bytes().to_vec())
        }
    }

    const SHARD: u64 = keys::DATA_SHARD_BASE;

    fn sm(
        kv: Arc<KvStore>,
        node_id: u64,
        replicas: Vec<u64>,
    ) -> (ShardStateMachine, Arc<AtomicUsize>) {
        let triggers = Arc::new(AtomicUsize::new(0));
        let machine = ShardStateMachine::new(
            SHARD,
            node_id,
            replicas,
            kv,
            Arc::new(CountingFactory {
                triggers: triggers.clone(),
            }),
            Arc::new(NoQuery),
        );
        (machine, triggers)
    }

    fn write_entry(index: u64, tag: u8, puts: &[(&[u8], &[u8])]) -> Entry {
        let mut batch = WriteBatch::new(SHARD, tag == SM_CMD_FORWARD_WRITE);
        for (k, v) in puts {
            batch.add_put(k.to_vec(), v.to_vec());
        }
        let mut command = vec![tag];
        batch.serialize(&mut command);
        Entry { index, command }
    }

    fn data_key(suffix: &[u8]) -> Vec<u8> {
        let mut key = keys::table_prefix(SHARD, keys::USER_TABLE_BASE);
        key.extend_from_slice(suffix);
        key
    }

    #[test]
    fn applies_writes_and_persists_index() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        // Node 0 is the processor for an even shard with replicas [0, 1].
        let (mut machine, triggers) = sm(kv.clone(), 0, vec![0, 1]);
        assert_eq!(machine.open().unwrap(), 0);

        let key = data_key(b"pk1");
        let entry = write_entry(1, SM_CMD_WRITE, &[(&key, b"row")]);
        machine.update(&[entry]).unwrap();

        assert_eq!(kv.get(&key).unwrap(), Some(b"row".to_vec()));
        assert_eq!(machine.open().unwrap(), 1);
        assert_eq!(triggers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn forward_write_triggers_processor_once_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        let (mut machine, triggers) = sm(kv, 0, vec![0, 1]);

        let entries = vec![
            write_entry(1, SM_CMD_FORWARD_WRITE, &[(&data_key(b"a"), b"1")]),
            write_entry(2, SM_CMD_FORWARD_WRITE, &[(&data_key(b"b"), b"2")]),
        ];
        machine.update(&entries).unwrap();
        assert_eq!(triggers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_processor_replica_does_not_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        let (mut machine, triggers) = sm(kv, 1, vec![0, 1]);
        let entry = write_entry(1, SM_CMD_FORWARD_WRITE, &[(&data_key(b"a"), b"1")]);
        machine.update(&[entry]).unwrap();
        assert_eq!(triggers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_node_moves_processor() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        // shard % 2 == 0 so node 0 is processor; after removing node 0,
        // node 1 takes over.
        let (mut machine, triggers) = sm(kv, 1, vec![0, 1]);

        let mut command = vec![SM_CMD_REMOVE_NODE];
        command.extend_from_slice(&0u32.to_be_bytes());
        machine
            .update(&[Entry { index: 1, command }])
            .unwrap();

        let entry = write_entry(2, SM_CMD_FORWARD_WRITE, &[(&data_key(b"a"), b"1")]);
        machine.update(&[entry]).unwrap();
        assert_eq!(triggers.load(Ordering::SeqCst), 1);

        // Removing an unknown node is ignored.
        let mut command = vec![SM_CMD_REMOVE_NODE];
        command.extend_from_slice(&9u32.to_be_bytes());
        machine
            .update(&[Entry { index: 3, command }])
            .unwrap();
    }

    #[test]
    #[should_panic(expected = "written through state machine")]
    fn wrong_shard_key_panics() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        let (mut machine, _) = sm(kv, 0, vec![0]);
        let mut foreign = keys::table_prefix(SHARD + 1, keys::USER_TABLE_BASE);
        foreign.extend_from_slice(b"pk");
        let entry = write_entry(1, SM_CMD_WRITE, &[(&foreign, b"x")]);
        let _ = machine.update(&[entry]);
    }

    #[test]
    fn snapshot_save_recover_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        let (mut machine, _) = sm(kv.clone(), 0, vec![0]);

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0u8..50)
            .map(|i| (data_key(&[i]), vec![i, i]))
            .collect();
        let entry_puts: Vec<(&[u8], &[u8])> = pairs
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        machine
            .update(&[write_entry(1, SM_CMD_WRITE, &entry_puts)])
            .unwrap();

        let snapshot = machine.prepare_snapshot().unwrap();
        let mut stream = Vec::new();
        snapshot.save(&mut stream).unwrap();

        // Recover into a fresh store, as a lagging replica would.
        let dir2 = tempfile::tempdir().unwrap();
        let kv2 = Arc::new(KvStore::open(dir2.path()).unwrap());
        let (mut machine2, _) = sm(kv2.clone(), 0, vec![0]);
        let mut reader = stream.as_slice();
        machine2.recover_from_snapshot(&mut reader).unwrap();

        for (key, value) in &pairs {
            assert_eq!(kv2.get(key).unwrap().as_ref(), Some(value));
        }
        // The applied index key travels inside the shard prefix, so open()
        // reflects the snapshot position.
        assert_eq!(machine2.open().unwrap(), 1);
    }
}
