//! Incremental hash aggregation.
//!
//! Aggregation runs in two stages. The partial stage runs on every shard
//! that produces rows: it folds the batch into per-group partial state
//! persisted under the partial table of that shard, and forwards the
//! (previous, current) partial-state pair to the shard that owns the
//! group. The full stage runs on the owning shard as a remote consumer:
//! it retracts the previous partial contribution, merges the current one
//! into the full table, and emits (previous, current) result rows
//! downstream. Group ownership is `xxh3(encoded group key) mod shards`,
//! so every replica routes identically.
//!
//! Mutations carry delta semantics: a previous row subtracts, a current
//! row adds. min, max and firstrow keep a counted multiset per group so
//! retraction is exact under deletes; firstrow resolves to the smallest
//! encoded value, which keeps replicas deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use xxhash_rust::xxh3::xxh3_64;

use rill_common::codec::{
    decode_row, encode_key_col, encode_row, read_bytes, read_u64_be, read_u8,
};
use rill_common::{ColumnType, Decimal, Error, Result, Row, Rows, RowsBatch, RowsEntry, Value};
use rill_store::keys;

use crate::exec::{ExecutionContext, ExecutorBase, PushExecutor};
use crate::plan::{to_f64, AggExpr, AggFunction};

const AGG_PAYLOAD_PAIR: u8 = 3;

pub struct Aggregator {
    base: ExecutorBase,
    group_by_cols: Vec<usize>,
    group_types: Vec<ColumnType>,
    aggs: Vec<AggExpr>,
    /// Declared type of each function's argument (None for `count(*)`);
    /// multiset keys are encoded against it so mixed-scale decimals order
    /// correctly.
    arg_types: Vec<Option<ColumnType>>,
    partial_table_id: u64,
    full_table_id: u64,
    all_shards: Vec<u64>,
}

impl Aggregator {
    pub fn new(
        child_names: &[String],
        child_types: &[ColumnType],
        group_by_cols: Vec<usize>,
        aggs: Vec<AggExpr>,
        partial_table_id: u64,
        full_table_id: u64,
        all_shards: Vec<u64>,
    ) -> Result<Arc<Self>> {
        if all_shards.is_empty() {
            return Err(Error::user("aggregator requires at least one shard"));
        }
        let mut names = Vec::with_capacity(group_by_cols.len() + aggs.len());
        let mut types = Vec::with_capacity(group_by_cols.len() + aggs.len());
        let mut group_types = Vec::with_capacity(group_by_cols.len());
        for &col in &group_by_cols {
            if col >= child_types.len() {
                return Err(Error::user(format!("group-by column {col} out of range")));
            }
            names.push(child_names[col].clone());
            types.push(child_types[col]);
            group_types.push(child_types[col]);
        }
        let mut arg_types = Vec::with_capacity(aggs.len());
        for (idx, agg) in aggs.iter().enumerate() {
            names.push(format!("{}_{idx}", func_name(agg.func)));
            types.push(result_type(agg, child_types)?);
            arg_types.push(match &agg.arg {
                Some(expr) => Some(expr.result_type(child_types)?),
                None => None,
            });
        }
        let key_cols = (0..group_by_cols.len()).collect();
        Ok(Arc::new(Self {
            base: ExecutorBase::new(names, types, key_cols),
            group_by_cols,
            group_types,
            aggs,
            arg_types,
            partial_table_id,
            full_table_id,
            all_shards,
        }))
    }

    /// Consumer id the receive path dispatches on.
    pub fn consumer_id(&self) -> u64 {
        self.full_table_id
    }

    pub fn partial_table_id(&self) -> u64 {
        self.partial_table_id
    }

    pub fn full_table_id(&self) -> u64 {
        self.full_table_id
    }

    fn group_key(&self, row: &Row) -> Result<Vec<u8>> {
        let mut key = Vec::with_capacity(16);
        for (idx, &col) in self.group_by_cols.iter().enumerate() {
            encode_key_col(row.value(col), &self.group_types[idx], &mut key)?;
        }
        Ok(key)
    }

    fn group_row_bytes(&self, row: &Row) -> Result<Vec<u8>> {
        let values: Vec<Value> = self
            .group_by_cols
            .iter()
            .map(|&c| row.value(c).clone())
            .collect();
        let mut buf = Vec::new();
        encode_row(&Row::new(values), &self.group_types, &mut buf)?;
        Ok(buf)
    }

    fn owner_shard(&self, group_key: &[u8]) -> u64 {
        let hash = xxh3_64(group_key);
        self.all_shards[(hash % self.all_shards.len() as u64) as usize]
    }

    fn new_state(&self) -> AggState {
        AggState::new(self.aggs.len())
    }

    fn apply_row(&self, state: &mut AggState, sign: i64, row: &Row) -> Result<()> {
        if state.group_row.is_empty() {
            state.group_row = self.group_row_bytes(row)?;
        }
        state.row_count += sign;
        for (idx, agg) in self.aggs.iter().enumerate() {
            let arg = match &agg.arg {
                Some(expr) => Some(expr.eval(row)?),
                None => None,
            };
            state.funcs[idx].apply(agg.func, sign, arg.as_ref(), self.arg_types[idx].as_ref())?;
        }
        Ok(())
    }

    /// Full-stage processing of one transferred payload bundle; registered
    /// with the engine as the remote consumer for `full_table_id`.
    pub async fn handle_remote_rows(
        &self,
        payloads: Vec<Vec<u8>>,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let shard_id = ctx.shard_id();
        let mut rows = Rows::new();
        let mut entries = Vec::new();
        for payload in payloads {
            let (group_key, prev_blob, curr_blob) = decode_agg_pair(&payload)?;
            let mut full_key = keys::table_prefix(shard_id, self.full_table_id);
            full_key.extend_from_slice(&group_key);

            let stored = match ctx.batch.get_pending(&full_key) {
                Some(pending) => pending.map(|v| v.to_vec()),
                None => ctx.cluster.local_get(&full_key)?,
            };
            let old_state = match &stored {
                Some(data) => Some(AggState::decode(data)?),
                None => None,
            };
            let old_out = match &old_state {
                Some(state) if state.row_count > 0 => {
                    Some(self.output_row(state)?)
                }
                _ => None,
            };

            let mut state = old_state.unwrap_or_else(|| self.new_state());
            if let Some(blob) = prev_blob {
                state.merge(&AggState::decode(&blob)?, -1);
            }
            if let Some(blob) = curr_blob {
                state.merge(&AggState::decode(&blob)?, 1);
            }
            state.prune();

            let new_out = if state.row_count > 0 {
                ctx.batch.add_put(full_key, state.encode());
                Some(self.output_row(&state)?)
            } else {
                ctx.batch.add_delete(full_key);
                None
            };

            let prev_idx = old_out.map(|row| {
                rows.append(row);
                rows.len() - 1
            });
            let curr_idx = new_out.map(|row| {
                rows.append(row);
                rows.len() - 1
            });
            if prev_idx.is_some() || curr_idx.is_some() {
                entries.push(RowsEntry::new(prev_idx, curr_idx));
            }
        }
        if entries.is_empty() {
            return Ok(());
        }
        self.base.forward(RowsBatch::new(rows, entries), ctx).await
    }

    fn output_row(&self, state: &AggState) -> Result<Row> {
        let mut offset = 0usize;
        let group = decode_row(&state.group_row, &self.group_types, &mut offset)?;
        let mut values = group.into_values();
        for (idx, agg) in self.aggs.iter().enumerate() {
            values.push(state.funcs[idx].output(agg.func)?);
        }
        Ok(Row::new(values))
    }
}

#[async_trait]
impl PushExecutor for Aggregator {
    fn col_names(&self) -> &[String] {
        self.base.col_names()
    }

    fn col_types(&self) -> &[ColumnType] {
        self.base.col_types()
    }

    fn key_cols(&self) -> &[usize] {
        self.base.key_cols()
    }

    fn set_parent(&self, parent: Arc<dyn PushExecutor>) {
        self.base.set_parent(parent);
    }

    /// Partial stage: fold the batch into this shard's partial state and
    /// forward the state delta to each group's owning shard.
    async fn handle_rows(&self, batch: RowsBatch, ctx: &mut ExecutionContext) -> Result<()> {
        let shard_id = ctx.shard_id();
        // Group the batch's mutations; BTreeMap keeps replica-identical
        // iteration order.
        let mut changes: BTreeMap<Vec<u8>, Vec<(i64, Row)>> = BTreeMap::new();
        for i in 0..batch.len() {
            if let Some(prev) = batch.previous_row(i) {
                changes
                    .entry(self.group_key(prev)?)
                    .or_default()
                    .push((-1, prev.clone()));
            }
            if let Some(curr) = batch.current_row(i) {
                changes
                    .entry(self.group_key(curr)?)
                    .or_default()
                    .push((1, curr.clone()));
            }
        }

        for (group_key, group_changes) in changes {
            let mut partial_key = keys::table_prefix(shard_id, self.partial_table_id);
            partial_key.extend_from_slice(&group_key);

            let stored = match ctx.batch.get_pending(&partial_key) {
                Some(pending) => pending.map(|v| v.to_vec()),
                None => ctx.cluster.local_get(&partial_key)?,
            };
            let (mut state, prev_blob) = match stored {
                Some(data) => (AggState::decode(&data)?, Some(data)),
                None => (self.new_state(), None),
            };
            for (sign, row) in &group_changes {
                self.apply_row(&mut state, *sign, row)?;
            }
            state.prune();

            let curr_blob = if state.row_count > 0 {
                let encoded = state.encode();
                ctx.batch.add_put(partial_key, encoded.clone());
                Some(encoded)
            } else {
                ctx.batch.add_delete(partial_key);
                None
            };

            let payload = encode_agg_pair(&group_key, prev_blob.as_deref(), curr_blob.as_deref());
            let owner = self.owner_shard(&group_key);
            let forwarder = ctx.forwarder.clone();
            forwarder.queue_for_remote_send(ctx, owner, self.full_table_id, payload)?;
        }
        Ok(())
    }
}

fn func_name(func: AggFunction) -> &'static str {
    match func {
        AggFunction::Sum => "sum",
        AggFunction::Count => "count",
        AggFunction::Avg => "avg",
        AggFunction::Min => "min",
        AggFunction::Max => "max",
        AggFunction::FirstRow => "firstrow",
    }
}

fn result_type(agg: &AggExpr, child_types: &[ColumnType]) -> Result<ColumnType> {
    let arg_type = match &agg.arg {
        Some(expr) => Some(expr.result_type(child_types)?),
        None => None,
    };
    Ok(match agg.func {
        AggFunction::Count => ColumnType::BigInt,
        AggFunction::Avg => ColumnType::Double,
        AggFunction::Sum => match arg_type {
            Some(ColumnType::Double) => ColumnType::Double,
            Some(decimal @ ColumnType::Decimal { .. }) => decimal,
            _ => ColumnType::BigInt,
        },
        AggFunction::Min | AggFunction::Max | AggFunction::FirstRow => arg_type
            .ok_or_else(|| Error::user("aggregate function requires an argument"))?,
    })
}

// ---------------------------------------------------------------------------
// Aggregate state.
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct AggState {
    /// Encoded group-column values, set on first application.
    group_row: Vec<u8>,
    /// Live source rows contributing to the group; zero means the group is
    /// gone.
    row_count: i64,
    funcs: Vec<FuncState>,
}

#[derive(Clone, Debug)]
enum FuncState {
    SumInt(i64),
    SumDouble(f64),
    SumDecimal(Decimal),
    Count(i64),
    Avg { sum: f64, count: i64 },
    /// Counted multiset keyed by the order-preserving encoding of the
    /// value, retaining the value encoding for output.
    Multiset(BTreeMap<Vec<u8>, MultisetEntry>),
    Unset,
}

#[derive(Clone, Debug)]
struct MultisetEntry {
    value: Vec<u8>,
    count: i64,
}

impl AggState {
    fn new(n_funcs: usize) -> Self {
        Self {
            group_row: Vec::new(),
            row_count: 0,
            funcs: vec![FuncState::Unset; n_funcs],
        }
    }

    fn merge(&mut self, other: &AggState, sign: i64) {
        if self.group_row.is_empty() {
            self.group_row = other.group_row.clone();
        }
        self.row_count += sign * other.row_count;
        for (mine, theirs) in self.funcs.iter_mut().zip(other.funcs.iter()) {
            mine.merge(theirs, sign);
        }
    }

    /// Drop multiset entries whose count fell to zero (or below, which can
    /// only happen transiently between a retract and its matching add).
    fn prune(&mut self) {
        for func in &mut self.funcs {
            if let FuncState::Multiset(entries) = func {
                entries.retain(|_, entry| entry.count > 0);
            }
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.group_row.len());
        buf.push(1); // state version
        buf.extend_from_slice(&(self.group_row.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.group_row);
        buf.extend_from_slice(&(self.row_count as u64).to_be_bytes());
        buf.extend_from_slice(&(self.funcs.len() as u32).to_be_bytes());
        for func in &self.funcs {
            func.encode(&mut buf);
        }
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let version = read_u8(data, &mut offset)?;
        if version != 1 {
            return Err(Error::corrupt(format!("unknown agg state version {version}")));
        }
        let group_row = read_bytes(data, &mut offset)?.to_vec();
        let row_count = read_u64_be(data, &mut offset)? as i64;
        let n_funcs = rill_common::codec::read_u32_be(data, &mut offset)? as usize;
        let mut funcs = Vec::with_capacity(n_funcs);
        for _ in 0..n_funcs {
            funcs.push(FuncState::decode(data, &mut offset)?);
        }
        Ok(Self {
            group_row,
            row_count,
            funcs,
        })
    }
}

const STATE_SUM_INT: u8 = 1;
const STATE_SUM_DOUBLE: u8 = 2;
const STATE_SUM_DECIMAL: u8 = 3;
const STATE_COUNT: u8 = 4;
const STATE_AVG: u8 = 5;
const STATE_MULTISET: u8 = 6;
const STATE_UNSET: u8 = 7;

impl FuncState {
    fn apply(
        &mut self,
        func: AggFunction,
        sign: i64,
        arg: Option<&Value>,
        arg_type: Option<&ColumnType>,
    ) -> Result<()> {
        match func {
            AggFunction::Count => {
                // count(*) counts every row; count(expr) skips nulls.
                if arg.map_or(true, |v| !v.is_null()) {
                    let count = self.as_count();
                    *count += sign;
                }
                Ok(())
            }
            AggFunction::Sum => {
                let Some(value) = arg.filter(|v| !v.is_null()) else {
                    return Ok(());
                };
                match value {
                    Value::Int(v) => {
                        let sum = self.as_sum_int();
                        *sum += sign * v;
                    }
                    Value::Double(v) => {
                        let sum = self.as_sum_double();
                        *sum += sign as f64 * v;
                    }
                    Value::Decimal(d) => {
                        let sum = self.as_sum_decimal();
                        *sum = if sign >= 0 { sum.add(d) } else { sum.sub(d) };
                    }
                    other => {
                        return Err(Error::user(format!("sum over non-numeric {other:?}")));
                    }
                }
                Ok(())
            }
            AggFunction::Avg => {
                let Some(value) = arg.filter(|v| !v.is_null()) else {
                    return Ok(());
                };
                let v = to_f64(value)?;
                let (sum, count) = self.as_avg();
                *sum += sign as f64 * v;
                *count += sign;
                Ok(())
            }
            AggFunction::Min | AggFunction::Max | AggFunction::FirstRow => {
                let Some(value) = arg.filter(|v| !v.is_null()) else {
                    return Ok(());
                };
                let col_type = arg_type
                    .copied()
                    .unwrap_or_else(|| scalar_column_type(value));
                let mut key = Vec::new();
                encode_key_col(value, &col_type, &mut key)?;
                let value_bytes = encode_scalar(value);
                let entries = self.as_multiset();
                let count = {
                    let entry = entries.entry(key.clone()).or_insert(MultisetEntry {
                        value: value_bytes,
                        count: 0,
                    });
                    entry.count += sign;
                    entry.count
                };
                if count <= 0 {
                    entries.remove(&key);
                }
                Ok(())
            }
        }
    }

    fn merge(&mut self, other: &FuncState, sign: i64) {
        match other {
            FuncState::Unset => {}
            FuncState::SumInt(v) => {
                let sum = self.as_sum_int();
                *sum += sign * v;
            }
            FuncState::SumDouble(v) => {
                let sum = self.as_sum_double();
                *sum += sign as f64 * v;
            }
            FuncState::SumDecimal(v) => {
                let sum = self.as_sum_decimal();
                *sum = if sign >= 0 { sum.add(v) } else { sum.sub(v) };
            }
            FuncState::Count(v) => {
                let count = self.as_count();
                *count += sign * v;
            }
            FuncState::Avg { sum, count } => {
                let (my_sum, my_count) = self.as_avg();
                *my_sum += sign as f64 * sum;
                *my_count += sign * count;
            }
            FuncState::Multiset(theirs) => {
                let entries = self.as_multiset();
                for (key, entry) in theirs {
                    let mine = entries.entry(key.clone()).or_insert(MultisetEntry {
                        value: entry.value.clone(),
                        count: 0,
                    });
                    mine.count += sign * entry.count;
                }
            }
        }
    }

    fn output(&self, func: AggFunction) -> Result<Value> {
        Ok(match (func, self) {
            (_, FuncState::Unset) => Value::Null,
            (AggFunction::Sum, FuncState::SumInt(v)) => Value::Int(*v),
            (AggFunction::Sum, FuncState::SumDouble(v)) => Value::Double(*v),
            (AggFunction::Sum, FuncState::SumDecimal(v)) => Value::Decimal(*v),
            (AggFunction::Count, FuncState::Count(v)) => Value::Int(*v),
            (AggFunction::Avg, FuncState::Avg { sum, count }) => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Double(sum / *count as f64)
                }
            }
            (AggFunction::Min | AggFunction::FirstRow, FuncState::Multiset(entries)) => {
                multiset_value(entries.iter().find(|(_, e)| e.count > 0))?
            }
            (AggFunction::Max, FuncState::Multiset(entries)) => {
                multiset_value(entries.iter().rev().find(|(_, e)| e.count > 0))?
            }
            (func, state) => {
                return Err(Error::internal(format!(
                    "aggregate state mismatch: {func:?} with {state:?}"
                )));
            }
        })
    }

    fn as_sum_int(&mut self) -> &mut i64 {
        if matches!(self, FuncState::Unset) {
            *self = FuncState::SumInt(0);
        }
        match self {
            FuncState::SumInt(v) => v,
            _ => panic!("aggregate state changed type"),
        }
    }

    fn as_sum_double(&mut self) -> &mut f64 {
        if matches!(self, FuncState::Unset) {
            *self = FuncState::SumDouble(0.0);
        }
        match self {
            FuncState::SumDouble(v) => v,
            _ => panic!("aggregate state changed type"),
        }
    }

    fn as_sum_decimal(&mut self) -> &mut Decimal {
        if matches!(self, FuncState::Unset) {
            *self = FuncState::SumDecimal(Decimal::zero());
        }
        match self {
            FuncState::SumDecimal(v) => v,
            _ => panic!("aggregate state changed type"),
        }
    }

    fn as_count(&mut self) -> &mut i64 {
        if matches!(self, FuncState::Unset) {
            *self = FuncState::Count(0);
        }
        match self {
            FuncState::Count(v) => v,
            _ => panic!("aggregate state changed type"),
        }
    }

    fn as_avg(&mut self) -> (&mut f64, &mut i64) {
        if matches!(self, FuncState::Unset) {
            *self = FuncState::Avg { sum: 0.0, count: 0 };
        }
        match self {
            FuncState::Avg { sum, count } => (sum, count),
            _ => panic!("aggregate state changed type"),
        }
    }

    fn as_multiset(&mut self) -> &mut BTreeMap<Vec<u8>, MultisetEntry> {
        if matches!(self, FuncState::Unset) {
            *self = FuncState::Multiset(BTreeMap::new());
        }
        match self {
            FuncState::Multiset(entries) => entries,
            _ => panic!("aggregate state changed type"),
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            FuncState::Unset => buf.push(STATE_UNSET),
            FuncState::SumInt(v) => {
                buf.push(STATE_SUM_INT);
                buf.extend_from_slice(&(*v as u64).to_be_bytes());
            }
            FuncState::SumDouble(v) => {
                buf.push(STATE_SUM_DOUBLE);
                buf.extend_from_slice(&v.to_bits().to_be_bytes());
            }
            FuncState::SumDecimal(v) => {
                buf.push(STATE_SUM_DECIMAL);
                rill_common::codec::write_string(buf, &v.to_string());
            }
            FuncState::Count(v) => {
                buf.push(STATE_COUNT);
                buf.extend_from_slice(&(*v as u64).to_be_bytes());
            }
            FuncState::Avg { sum, count } => {
                buf.push(STATE_AVG);
                buf.extend_from_slice(&sum.to_bits().to_be_bytes());
                buf.extend_from_slice(&(*count as u64).to_be_bytes());
            }
            FuncState::Multiset(entries) => {
                buf.push(STATE_MULTISET);
                buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
                for (key, entry) in entries {
                    rill_common::codec::write_bytes(buf, key);
                    rill_common::codec::write_bytes(buf, &entry.value);
                    buf.extend_from_slice(&(entry.count as u64).to_be_bytes());
                }
            }
        }
    }

    fn decode(data: &[u8], offset: &mut usize) -> Result<Self> {
        let tag = read_u8(data, offset)?;
        Ok(match tag {
            STATE_UNSET => FuncState::Unset,
            STATE_SUM_INT => FuncState::SumInt(read_u64_be(data, offset)? as i64),
            STATE_SUM_DOUBLE => FuncState::SumDouble(f64::from_bits(read_u64_be(data, offset)?)),
            STATE_SUM_DECIMAL => {
                let text = rill_common::codec::read_string(data, offset)?;
                FuncState::SumDecimal(Decimal::parse(&text)?)
            }
            STATE_COUNT => FuncState::Count(read_u64_be(data, offset)? as i64),
            STATE_AVG => FuncState::Avg {
                sum: f64::from_bits(read_u64_be(data, offset)?),
                count: read_u64_be(data, offset)? as i64,
            },
            STATE_MULTISET => {
                let count = rill_common::codec::read_u32_be(data, offset)? as usize;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key = read_bytes(data, offset)?.to_vec();
                    let value = read_bytes(data, offset)?.to_vec();
                    let entry_count = read_u64_be(data, offset)? as i64;
                    entries.insert(
                        key,
                        MultisetEntry {
                            value,
                            count: entry_count,
                        },
                    );
                }
                FuncState::Multiset(entries)
            }
            other => return Err(Error::corrupt(format!("unknown agg state tag {other}"))),
        })
    }
}

fn scalar_column_type(value: &Value) -> ColumnType {
    match value {
        Value::Null | Value::Int(_) => ColumnType::BigInt,
        Value::Double(_) => ColumnType::Double,
        Value::Decimal(d) => ColumnType::Decimal {
            precision: 38,
            scale: d.scale(),
        },
        Value::Varchar(_) => ColumnType::Varchar,
        Value::Timestamp(_) => ColumnType::Timestamp,
    }
}

const SCALAR_INT: u8 = 1;
const SCALAR_DOUBLE: u8 = 2;
const SCALAR_DECIMAL: u8 = 3;
const SCALAR_VARCHAR: u8 = 4;
const SCALAR_TIMESTAMP: u8 = 5;

/// Self-describing scalar encoding for multiset values, so the original
/// value (including its type) survives the round trip through state.
fn encode_scalar(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    match value {
        Value::Int(v) => {
            buf.push(SCALAR_INT);
            buf.extend_from_slice(&(*v as u64).to_be_bytes());
        }
        Value::Double(v) => {
            buf.push(SCALAR_DOUBLE);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Decimal(d) => {
            buf.push(SCALAR_DECIMAL);
            rill_common::codec::write_string(&mut buf, &d.to_string());
        }
        Value::Varchar(s) => {
            buf.push(SCALAR_VARCHAR);
            rill_common::codec::write_string(&mut buf, s);
        }
        Value::Timestamp(v) => {
            buf.push(SCALAR_TIMESTAMP);
            buf.extend_from_slice(&(*v as u64).to_be_bytes());
        }
        Value::Null => unreachable!("nulls never enter a multiset"),
    }
    buf
}

fn decode_scalar(data: &[u8]) -> Result<Value> {
    let mut offset = 0usize;
    let tag = read_u8(data, &mut offset)?;
    Ok(match tag {
        SCALAR_INT => Value::Int(read_u64_be(data, &mut offset)? as i64),
        SCALAR_DOUBLE => Value::Double(f64::from_bits(read_u64_be(data, &mut offset)?)),
        SCALAR_DECIMAL => {
            let text = rill_common::codec::read_string(data, &mut offset)?;
            Value::Decimal(Decimal::parse(&text)?)
        }
        SCALAR_VARCHAR => Value::Varchar(rill_common::codec::read_string(data, &mut offset)?),
        SCALAR_TIMESTAMP => Value::Timestamp(read_u64_be(data, &mut offset)? as i64),
        other => return Err(Error::corrupt(format!("unknown scalar tag {other}"))),
    })
}

fn multiset_value(entry: Option<(&Vec<u8>, &MultisetEntry)>) -> Result<Value> {
    match entry {
        Some((_, entry)) => decode_scalar(&entry.value),
        None => Ok(Value::Null),
    }
}

/// `(group key, previous partial state, current partial state)` shipped
/// from the partial to the full stage.
fn encode_agg_pair(group_key: &[u8], prev: Option<&[u8]>, curr: Option<&[u8]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(
        16 + group_key.len() + prev.map_or(0, |p| p.len()) + curr.map_or(0, |c| c.len()),
    );
    buf.push(AGG_PAYLOAD_PAIR);
    rill_common::codec::write_bytes(&mut buf, group_key);
    let flags = u8::from(prev.is_some()) | (u8::from(curr.is_some()) << 1);
    buf.push(flags);
    if let Some(prev) = prev {
        rill_common::codec::write_bytes(&mut buf, prev);
    }
    if let Some(curr) = curr {
        rill_common::codec::write_bytes(&mut buf, curr);
    }
    buf
}

fn decode_agg_pair(data: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)> {
    let mut offset = 0usize;
    let tag = read_u8(data, &mut offset)?;
    if tag != AGG_PAYLOAD_PAIR {
        return Err(Error::corrupt(format!("unexpected agg payload tag {tag}")));
    }
    let group_key = read_bytes(data, &mut offset)?.to_vec();
    let flags = read_u8(data, &mut offset)?;
    let prev = if flags & 1 != 0 {
        Some(read_bytes(data, &mut offset)?.to_vec())
    } else {
        None
    };
    let curr = if flags & 2 != 0 {
        Some(read_bytes(data, &mut offset)?.to_vec())
    } else {
        None
    };
    Ok((group_key, prev, curr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Option<Value> {
        Some(Value::Int(v))
    }

    #[test]
    fn min_max_exact_under_deletes() {
        let mut min_state = FuncState::Unset;
        let mut max_state = FuncState::Unset;
        for v in [10i64, 5, 7, 5] {
            min_state.apply(AggFunction::Min, 1, int(v).as_ref(), None).unwrap();
            max_state.apply(AggFunction::Max, 1, int(v).as_ref(), None).unwrap();
        }
        assert_eq!(min_state.output(AggFunction::Min).unwrap(), Value::Int(5));
        assert_eq!(max_state.output(AggFunction::Max).unwrap(), Value::Int(10));

        // One of the duplicate 5s retracts; the minimum stays 5.
        min_state.apply(AggFunction::Min, -1, int(5).as_ref(), None).unwrap();
        assert_eq!(min_state.output(AggFunction::Min).unwrap(), Value::Int(5));
        // The second retraction removes it.
        min_state.apply(AggFunction::Min, -1, int(5).as_ref(), None).unwrap();
        assert_eq!(min_state.output(AggFunction::Min).unwrap(), Value::Int(7));

        max_state.apply(AggFunction::Max, -1, int(10).as_ref(), None).unwrap();
        assert_eq!(max_state.output(AggFunction::Max).unwrap(), Value::Int(7));
    }

    #[test]
    fn sum_avg_count_deltas() {
        let mut sum = FuncState::Unset;
        let mut avg = FuncState::Unset;
        let mut count = FuncState::Unset;
        for v in [10i64, 5, 7] {
            sum.apply(AggFunction::Sum, 1, int(v).as_ref(), None).unwrap();
            avg.apply(AggFunction::Avg, 1, int(v).as_ref(), None).unwrap();
            count.apply(AggFunction::Count, 1, None, None).unwrap();
        }
        sum.apply(AggFunction::Sum, -1, int(10).as_ref(), None).unwrap();
        avg.apply(AggFunction::Avg, -1, int(10).as_ref(), None).unwrap();
        count.apply(AggFunction::Count, -1, None, None).unwrap();

        assert_eq!(sum.output(AggFunction::Sum).unwrap(), Value::Int(12));
        assert_eq!(avg.output(AggFunction::Avg).unwrap(), Value::Double(6.0));
        assert_eq!(count.output(AggFunction::Count).unwrap(), Value::Int(2));

        // Nulls are ignored by sum/avg, counted only by count(*).
        sum.apply(AggFunction::Sum, 1, Some(&Value::Null), None).unwrap();
        assert_eq!(sum.output(AggFunction::Sum).unwrap(), Value::Int(12));
    }

    #[test]
    fn state_round_trip() {
        let mut state = AggState::new(3);
        state.group_row = vec![1, 2, 3];
        state.row_count = 4;
        state.funcs[0]
            .apply(AggFunction::Sum, 1, int(22).as_ref(), None)
            .unwrap();
        state.funcs[1]
            .apply(AggFunction::Min, 1, Some(&Value::Varchar("zz".into())), None)
            .unwrap();
        state.funcs[2]
            .apply(AggFunction::Avg, 1, int(3).as_ref(), None)
            .unwrap();

        let decoded = AggState::decode(&state.encode()).unwrap();
        assert_eq!(decoded.row_count, 4);
        assert_eq!(decoded.group_row, vec![1, 2, 3]);
        assert_eq!(
            decoded.funcs[0].output(AggFunction::Sum).unwrap(),
            Value::Int(22)
        );
        assert_eq!(
            decoded.funcs[1].output(AggFunction::Min).unwrap(),
            Value::Varchar("zz".into())
        );
    }

    #[test]
    fn merge_retract_then_add_is_a_delta() {
        // Simulate the full stage: old partial (sum 15) replaced by new
        // partial (sum 10) must shift the full sum by -5.
        let mut full = AggState::new(1);
        full.row_count = 3;
        full.funcs[0] = FuncState::SumInt(30);

        let mut prev = AggState::new(1);
        prev.row_count = 2;
        prev.funcs[0] = FuncState::SumInt(15);
        let mut curr = AggState::new(1);
        curr.row_count = 1;
        curr.funcs[0] = FuncState::SumInt(10);

        full.merge(&prev, -1);
        full.merge(&curr, 1);
        assert_eq!(full.row_count, 2);
        assert_eq!(full.funcs[0].output(AggFunction::Sum).unwrap(), Value::Int(25));
    }

    #[test]
    fn pair_payload_round_trip() {
        let payload = encode_agg_pair(b"gk", Some(b"prev"), None);
        let (key, prev, curr) = decode_agg_pair(&payload).unwrap();
        assert_eq!(key, b"gk".to_vec());
        assert_eq!(prev, Some(b"prev".to_vec()));
        assert_eq!(curr, None);
    }
}
