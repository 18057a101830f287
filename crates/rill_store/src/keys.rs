//! Key layout.
//!
//! Every key in the data partition starts with the owning group's 8-byte
//! big-endian id (shard id for data shards, 1 for the sequence group, 2 for
//! the lock group), followed by an 8-byte big-endian table id. Big-endian
//! prefixes make the lexicographic order match numeric order, so range
//! scans stay inside one shard and one table.
//!
//! Do not renumber the reserved table ids: they are persisted.

/// First data shard id; ids below this are reserved for singleton groups.
pub const DATA_SHARD_BASE: u64 = 16;

/// Replication group id of the cluster-wide sequence state machine.
pub const SEQUENCE_GROUP_ID: u64 = 1;
/// Replication group id of the cluster-wide lock state machine.
pub const LOCKS_GROUP_ID: u64 = 2;
/// Fixed replica count of the two singleton groups.
pub const SINGLETON_GROUP_SIZE: usize = 3;

/// Rows queued on the producing shard for cross-shard transfer.
pub const FORWARDER_TID: u64 = 1;
/// Per-shard forwarder sequence counter.
pub const FORWARDER_SEQ_TID: u64 = 2;
/// Rows landed at the receiving shard, awaiting processing.
pub const RECEIVER_TID: u64 = 3;
/// Per-(receiver, sender) last-received sequence.
pub const RECEIVER_SEQ_TID: u64 = 4;
/// Last applied replication log index for the shard.
pub const LAST_LOG_INDEX_TID: u64 = 5;
/// Sequence values of the sequence group.
pub const SEQUENCE_VALUES_TID: u64 = 6;
/// Held advisory locks of the lock group.
pub const LOCKS_TID: u64 = 7;
/// First table id handed out for user tables and internal MV tables.
pub const USER_TABLE_BASE: u64 = 1000;

pub fn shard_prefix(shard_id: u64) -> Vec<u8> {
    shard_id.to_be_bytes().to_vec()
}

/// `shard || table` prefix with spare capacity for a key suffix.
pub fn table_prefix(shard_id: u64, table_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&shard_id.to_be_bytes());
    key.extend_from_slice(&table_id.to_be_bytes());
    key
}

pub fn shard_of_key(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[..8]);
    u64::from_be_bytes(buf)
}

// ---------------------------------------------------------------------------
// Forwarder / receiver keys. All fields big-endian: receivers depend on the
// scan order of these keys being ascending sender-sequence order.
// ---------------------------------------------------------------------------

pub fn forwarder_key(
    local_shard: u64,
    remote_shard: u64,
    sequence: u64,
    consumer_id: u64,
) -> Vec<u8> {
    let mut key = table_prefix(local_shard, FORWARDER_TID);
    key.extend_from_slice(&remote_shard.to_be_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key.extend_from_slice(&consumer_id.to_be_bytes());
    key
}

pub fn forwarder_prefix(local_shard: u64) -> Vec<u8> {
    table_prefix(local_shard, FORWARDER_TID)
}

pub fn forwarder_seq_key(local_shard: u64) -> Vec<u8> {
    table_prefix(local_shard, FORWARDER_SEQ_TID)
}

/// `(remote_shard, sequence, consumer_id)` from a forwarder key.
pub fn decode_forwarder_key(key: &[u8]) -> (u64, u64, u64) {
    debug_assert!(key.len() == 40, "forwarder key has fixed layout");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..24]);
    let remote = u64::from_be_bytes(buf);
    buf.copy_from_slice(&key[24..32]);
    let seq = u64::from_be_bytes(buf);
    buf.copy_from_slice(&key[32..40]);
    let consumer = u64::from_be_bytes(buf);
    (remote, seq, consumer)
}

pub fn receiver_key(
    receiving_shard: u64,
    sending_shard: u64,
    sequence: u64,
    consumer_id: u64,
) -> Vec<u8> {
    let mut key = table_prefix(receiving_shard, RECEIVER_TID);
    key.extend_from_slice(&sending_shard.to_be_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key.extend_from_slice(&consumer_id.to_be_bytes());
    key
}

pub fn receiver_prefix(receiving_shard: u64) -> Vec<u8> {
    table_prefix(receiving_shard, RECEIVER_TID)
}

pub fn receiver_seq_key(receiving_shard: u64, sending_shard: u64) -> Vec<u8> {
    let mut key = table_prefix(receiving_shard, RECEIVER_SEQ_TID);
    key.extend_from_slice(&sending_shard.to_be_bytes());
    key
}

/// `(sending_shard, sequence, consumer_id)` from a receiver key.
pub fn decode_receiver_key(key: &[u8]) -> (u64, u64, u64) {
    debug_assert!(key.len() == 40, "receiver key has fixed layout");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..24]);
    let sender = u64::from_be_bytes(buf);
    buf.copy_from_slice(&key[24..32]);
    let seq = u64::from_be_bytes(buf);
    buf.copy_from_slice(&key[32..40]);
    let consumer = u64::from_be_bytes(buf);
    (sender, seq, consumer)
}

pub fn last_log_index_key(shard_id: u64) -> Vec<u8> {
    table_prefix(shard_id, LAST_LOG_INDEX_TID)
}
