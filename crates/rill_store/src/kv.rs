//! Local KV adapter over a fjall keyspace.
//!
//! All replicated data lives in one `data` partition whose keys carry the
//! big-endian shard/table prefix; node-local bookkeeping (pending-delete
//! registrations) lives in a separate `meta` partition that is never
//! replicated. Scans return owned copies because the underlying iterator
//! may reuse its buffers. Durability between entries is provided by the
//! replication log; `sync` exists for explicit checkpoints.

use std::path::Path;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use rill_common::{Error, Result};

use crate::cluster::KvPair;

/// Chunk size for range deletes so one delete cannot build an unbounded
/// batch in memory.
const DELETE_RANGE_CHUNK: usize = 10_000;

pub struct KvStore {
    keyspace: Keyspace,
    data: PartitionHandle,
    meta: PartitionHandle,
}

/// Point-in-time view of the data partition; writes after creation are
/// invisible to it.
pub struct KvSnapshot {
    inner: fjall::Snapshot,
}

impl KvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .map_err(|err| Error::internal(format!("open keyspace: {err}")))?;
        let data = keyspace
            .open_partition("data", PartitionCreateOptions::default())
            .map_err(|err| Error::internal(format!("open data partition: {err}")))?;
        let meta = keyspace
            .open_partition("meta", PartitionCreateOptions::default())
            .map_err(|err| Error::internal(format!("open meta partition: {err}")))?;
        Ok(Self {
            keyspace,
            data,
            meta,
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .data
            .get(key)
            .map_err(|err| Error::internal(format!("kv get: {err}")))?;
        Ok(value.map(|v| v.to_vec()))
    }

    /// Scan `[lower, upper)` returning at most `limit` pairs (`-1` for
    /// unbounded). Keys and values are copied out of the iterator.
    pub fn scan(&self, lower: &[u8], upper: &[u8], limit: i64) -> Result<Vec<KvPair>> {
        let iter = self.data.range(lower.to_vec()..upper.to_vec());
        collect_pairs(iter, limit)
    }

    /// Apply puts and deletes as one atomic batch.
    pub fn write(&self, puts: &[(Vec<u8>, Vec<u8>)], deletes: &[Vec<u8>]) -> Result<()> {
        let mut batch = self.keyspace.batch();
        for (key, value) in puts {
            batch.insert(&self.data, key.clone(), value.clone());
        }
        for key in deletes {
            batch.remove(&self.data, key.clone());
        }
        batch
            .commit()
            .map_err(|err| Error::internal(format!("kv batch commit: {err}")))
    }

    /// Delete every key in `[lower, upper)`, committing in bounded chunks.
    pub fn delete_range(&self, lower: &[u8], upper: &[u8]) -> Result<usize> {
        let mut removed = 0usize;
        loop {
            let page = self.scan(lower, upper, DELETE_RANGE_CHUNK as i64)?;
            if page.is_empty() {
                return Ok(removed);
            }
            let mut batch = self.keyspace.batch();
            for pair in &page {
                batch.remove(&self.data, pair.key.clone());
            }
            batch
                .commit()
                .map_err(|err| Error::internal(format!("kv range delete: {err}")))?;
            removed += page.len();
            if page.len() < DELETE_RANGE_CHUNK {
                return Ok(removed);
            }
        }
    }

    pub fn snapshot(&self) -> KvSnapshot {
        KvSnapshot {
            inner: self.data.snapshot(),
        }
    }

    pub fn scan_snapshot(
        &self,
        snapshot: &KvSnapshot,
        lower: &[u8],
        upper: &[u8],
        limit: i64,
    ) -> Result<Vec<KvPair>> {
        let iter = snapshot.inner.range(lower.to_vec()..upper.to_vec());
        collect_pairs(iter, limit)
    }

    /// Flush everything durably; used at explicit checkpoints only.
    pub fn sync(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(|err| Error::internal(format!("kv sync: {err}")))
    }

    // ------------------------------------------------------------------
    // Node-local meta partition (pending-delete registrations).
    // ------------------------------------------------------------------

    pub fn meta_put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.meta
            .insert(key, value)
            .map_err(|err| Error::internal(format!("meta put: {err}")))
    }

    pub fn meta_delete(&self, key: &[u8]) -> Result<()> {
        self.meta
            .remove(key)
            .map_err(|err| Error::internal(format!("meta delete: {err}")))
    }

    pub fn meta_scan_all(&self) -> Result<Vec<KvPair>> {
        let mut out = Vec::new();
        for item in self.meta.iter() {
            let (key, value) = item.map_err(|err| Error::internal(format!("meta scan: {err}")))?;
            out.push(KvPair {
                key: key.to_vec(),
                value: value.to_vec(),
            });
        }
        Ok(out)
    }
}

fn collect_pairs<I, E>(iter: I, limit: i64) -> Result<Vec<KvPair>>
where
    I: Iterator<Item = std::result::Result<fjall::KvPair, E>>,
    E: std::fmt::Display,
{
    let mut pairs = Vec::new();
    for item in iter {
        if limit >= 0 && pairs.len() as i64 >= limit {
            break;
        }
        let (key, value) = item.map_err(|err| Error::internal(format!("kv scan: {err}")))?;
        pairs.push(KvPair {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }
    Ok(pairs)
}
