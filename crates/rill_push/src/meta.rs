//! Table and source descriptors.
//!
//! The schema catalog itself is an external collaborator; these are the
//! descriptors the engine needs at runtime to encode keys and rows.

use rill_common::codec::encode_key_cols;
use rill_common::{ColumnType, Result, Row};

use rill_store::keys;

#[derive(Clone, Debug)]
pub struct TableInfo {
    pub id: u64,
    pub name: String,
    pub column_names: Vec<String>,
    pub column_types: Vec<ColumnType>,
    /// Indexes of the primary-key columns, in key order.
    pub pk_cols: Vec<usize>,
}

impl TableInfo {
    /// Full storage key of `row` on `shard_id`:
    /// `shard || table || encoded primary key`.
    pub fn row_key(&self, shard_id: u64, row: &Row) -> Result<Vec<u8>> {
        let mut key = keys::table_prefix(shard_id, self.id);
        encode_key_cols(row, &self.pk_cols, &self.column_types, &mut key)?;
        Ok(key)
    }

    /// Encoded primary key alone, used for shard routing.
    pub fn pk_bytes(&self, row: &Row) -> Result<Vec<u8>> {
        let mut key = Vec::with_capacity(24);
        encode_key_cols(row, &self.pk_cols, &self.column_types, &mut key)?;
        Ok(key)
    }
}

/// A source table fed from a broker topic.
#[derive(Clone, Debug)]
pub struct SourceInfo {
    pub table: TableInfo,
    pub topic: String,
}
