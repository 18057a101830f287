//! State machines of the two singleton groups: cluster-wide sequences and
//! advisory named locks.
//!
//! Both persist their state (and their applied log index) in the data
//! partition under their group id prefix, so the same snapshot and replay
//! machinery as the shard state machines applies.

use std::io::{Read, Write};
use std::sync::Arc;

use rill_common::codec::{read_string, read_u64_le, write_string};
use rill_common::{Error, Result};
use rill_repl::{Entry, SmResult, StateMachine, StateSnapshot};

use crate::keys;
use crate::kv::{KvSnapshot, KvStore};

pub const SEQ_RESPONSE_OK: u64 = 1;
pub const LOCK_RESPONSE_OK: u64 = 1;

pub const GET_LOCK_COMMAND: &str = "get";
pub const RELEASE_LOCK_COMMAND: &str = "release";

pub const LOCK_RESULT_TRUE: u8 = 1;
pub const LOCK_RESULT_FALSE: u8 = 2;

fn applied_index_key(group_id: u64) -> Vec<u8> {
    keys::table_prefix(group_id, keys::LAST_LOG_INDEX_TID)
}

fn read_applied(kv: &KvStore, group_id: u64) -> Result<u64> {
    match kv.get(&applied_index_key(group_id))? {
        Some(value) => {
            let mut offset = 0;
            read_u64_le(&value, &mut offset)
        }
        None => Ok(0),
    }
}

/// Streams every pair under one group's prefix, shared by both singleton
/// state machines.
struct GroupSnapshot {
    group_id: u64,
    kv: Arc<KvStore>,
    snapshot: KvSnapshot,
}

impl StateSnapshot for GroupSnapshot {
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let lower = keys::shard_prefix(self.group_id);
        let upper = keys::shard_prefix(self.group_id + 1);
        let pairs = self.kv.scan_snapshot(&self.snapshot, &lower, &upper, -1)?;
        for pair in &pairs {
            write_frame(writer, &pair.key)?;
            write_frame(writer, &pair.value)?;
        }
        Ok(())
    }
}

fn write_frame(writer: &mut dyn Write, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .and_then(|_| writer.write_all(bytes))
        .map_err(|err| Error::internal(format!("group snapshot write: {err}")))
}

fn recover_group(kv: &KvStore, group_id: u64, reader: &mut dyn Read) -> Result<()> {
    let lower = keys::shard_prefix(group_id);
    let upper = keys::shard_prefix(group_id + 1);
    kv.delete_range(&lower, &upper)?;
    let mut puts = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(Error::internal(format!("group snapshot read: {err}"))),
        }
        let key_len = u32::from_be_bytes(len_buf) as usize;
        let mut key = vec![0u8; key_len];
        reader
            .read_exact(&mut key)
            .map_err(|err| Error::corrupt(format!("group snapshot truncated: {err}")))?;
        reader
            .read_exact(&mut len_buf)
            .map_err(|err| Error::corrupt(format!("group snapshot truncated: {err}")))?;
        let value_len = u32::from_be_bytes(len_buf) as usize;
        let mut value = vec![0u8; value_len];
        reader
            .read_exact(&mut value)
            .map_err(|err| Error::corrupt(format!("group snapshot truncated: {err}")))?;
        puts.push((key, value));
    }
    kv.write(&puts, &[])
}

// ---------------------------------------------------------------------------
// Sequence state machine.
// ---------------------------------------------------------------------------

/// Monotonic named sequences. The propose payload is the sequence name; the
/// result carries the prior value (little-endian u64) and the stored value
/// is incremented. Atomicity comes from all proposals being serialized
/// through the group.
pub struct SequenceStateMachine {
    kv: Arc<KvStore>,
}

/// Storage key of one named sequence; shared with the single-process
/// cluster so both persist sequences identically.
pub fn sequence_value_key(name: &str) -> Vec<u8> {
    let mut key = keys::table_prefix(keys::SEQUENCE_GROUP_ID, keys::SEQUENCE_VALUES_TID);
    key.extend_from_slice(name.as_bytes());
    key
}

impl SequenceStateMachine {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    pub fn encode_command(name: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + name.len());
        write_string(&mut buf, name);
        buf
    }
}

impl StateMachine for SequenceStateMachine {
    fn open(&mut self) -> Result<u64> {
        read_applied(&self.kv, keys::SEQUENCE_GROUP_ID)
    }

    fn update(&mut self, entries: &[Entry]) -> Result<Vec<SmResult>> {
        let mut results = Vec::with_capacity(entries.len());
        let mut puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(entries.len() + 1);
        for entry in entries {
            let mut offset = 0usize;
            let name = read_string(&entry.command, &mut offset)?;
            let key = sequence_value_key(&name);
            // Later entries in this batch may touch the same sequence;
            // prefer the pending write over the stored value.
            let pending: Option<&(Vec<u8>, Vec<u8>)> =
                puts.iter().rev().find(|pair| pair.0 == key);
            let current = match pending {
                Some(pair) => {
                    let mut o = 0;
                    read_u64_le(&pair.1, &mut o)?
                }
                None => match self.kv.get(&key)? {
                    Some(value) => {
                        let mut o = 0;
                        read_u64_le(&value, &mut o)?
                    }
                    None => 0,
                },
            };
            puts.push((key, (current + 1).to_le_bytes().to_vec()));
            results.push(SmResult {
                value: SEQ_RESPONSE_OK,
                data: current.to_le_bytes().to_vec(),
            });
        }
        if let Some(last) = entries.last() {
            puts.push((
                applied_index_key(keys::SEQUENCE_GROUP_ID),
                last.index.to_le_bytes().to_vec(),
            ));
        }
        self.kv.write(&puts, &[])?;
        Ok(results)
    }

    fn lookup(&self, _payload: &[u8]) -> Result<Vec<u8>> {
        // Only used as a readiness ping.
        Ok(Vec::new())
    }

    fn sync(&self) -> Result<()> {
        self.kv.sync()
    }

    fn prepare_snapshot(&self) -> Result<Box<dyn StateSnapshot>> {
        Ok(Box::new(GroupSnapshot {
            group_id: keys::SEQUENCE_GROUP_ID,
            kv: self.kv.clone(),
            snapshot: self.kv.snapshot(),
        }))
    }

    fn recover_from_snapshot(&mut self, reader: &mut dyn Read) -> Result<()> {
        recover_group(&self.kv, keys::SEQUENCE_GROUP_ID, reader)
    }
}

// ---------------------------------------------------------------------------
// Lock state machine.
// ---------------------------------------------------------------------------

/// Advisory named locks keyed by prefix string. A get succeeds iff no held
/// lock contains or is contained by the requested prefix; release is
/// unconditional. The result payload is a single byte (true/false).
pub struct LockStateMachine {
    kv: Arc<KvStore>,
}

impl LockStateMachine {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    fn lock_key(prefix: &str) -> Vec<u8> {
        let mut key = keys::table_prefix(keys::LOCKS_GROUP_ID, keys::LOCKS_TID);
        key.extend_from_slice(prefix.as_bytes());
        key
    }

    pub fn encode_command(command: &str, prefix: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + command.len() + prefix.len());
        write_string(&mut buf, command);
        write_string(&mut buf, prefix);
        buf
    }

    fn held_prefixes(&self) -> Result<Vec<String>> {
        let lower = keys::table_prefix(keys::LOCKS_GROUP_ID, keys::LOCKS_TID);
        let upper = keys::table_prefix(keys::LOCKS_GROUP_ID, keys::LOCKS_TID + 1);
        let pairs = self.kv.scan(&lower, &upper, -1)?;
        pairs
            .into_iter()
            .map(|pair| {
                String::from_utf8(pair.key[16..].to_vec())
                    .map_err(|_| Error::corrupt("lock prefix is not utf8"))
            })
            .collect()
    }
}

impl StateMachine for LockStateMachine {
    fn open(&mut self) -> Result<u64> {
        read_applied(&self.kv, keys::LOCKS_GROUP_ID)
    }

    fn update(&mut self, entries: &[Entry]) -> Result<Vec<SmResult>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut offset = 0usize;
            let command = read_string(&entry.command, &mut offset)?;
            let prefix = read_string(&entry.command, &mut offset)?;
            let data = match command.as_str() {
                GET_LOCK_COMMAND => {
                    let held = self.held_prefixes()?;
                    let blocked = held
                        .iter()
                        .any(|h| h.starts_with(&prefix) || prefix.starts_with(h.as_str()));
                    if blocked {
                        vec![LOCK_RESULT_FALSE]
                    } else {
                        self.kv.write(&[(Self::lock_key(&prefix), Vec::new())], &[])?;
                        vec![LOCK_RESULT_TRUE]
                    }
                }
                RELEASE_LOCK_COMMAND => {
                    self.kv.write(&[], &[Self::lock_key(&prefix)])?;
                    vec![LOCK_RESULT_TRUE]
                }
                other => {
                    return Err(Error::corrupt(format!("unknown lock command {other}")));
                }
            };
            results.push(SmResult {
                value: LOCK_RESPONSE_OK,
                data,
            });
        }
        if let Some(last) = entries.last() {
            self.kv.write(
                &[(
                    applied_index_key(keys::LOCKS_GROUP_ID),
                    last.index.to_le_bytes().to_vec(),
                )],
                &[],
            )?;
        }
        Ok(results)
    }

    fn lookup(&self, _payload: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn sync(&self) -> Result<()> {
        self.kv.sync()
    }

    fn prepare_snapshot(&self) -> Result<Box<dyn StateSnapshot>> {
        Ok(Box::new(GroupSnapshot {
            group_id: keys::LOCKS_GROUP_ID,
            kv: self.kv.clone(),
            snapshot: self.kv.snapshot(),
        }))
    }

    fn recover_from_snapshot(&mut self, reader: &mut dyn Read) -> Result<()> {
        recover_group(&self.kv, keys::LOCKS_GROUP_ID, reader)
    }
}
