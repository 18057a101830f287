//! Binary codecs for rows and keys.
//!
//! Row values are encoded with a null bitmap followed by the columns in
//! declared order: numerics fixed-width little-endian, varchar and decimal
//! length-prefixed. Key columns use a separate order-preserving encoding so
//! that the lexicographic order of encoded keys matches the value order;
//! keys always sit under a big-endian `shard || table` prefix, which keeps
//! range scans shard-local.

use crate::error::{Error, Result};
use crate::row::{Row, Rows};
use crate::types::{ColumnType, Decimal, Value};

// ---------------------------------------------------------------------------
// Cursor-style readers. All framing integers are big-endian; fixed-width
// column values are little-endian (see the row codec below).
// ---------------------------------------------------------------------------

pub fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    if *offset + 1 > data.len() {
        return Err(Error::corrupt("short u8"));
    }
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

pub fn read_u32_be(data: &[u8], offset: &mut usize) -> Result<u32> {
    if *offset + 4 > data.len() {
        return Err(Error::corrupt("short u32"));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub fn read_u64_be(data: &[u8], offset: &mut usize) -> Result<u64> {
    if *offset + 8 > data.len() {
        return Err(Error::corrupt("short u64"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

pub fn read_u64_le(data: &[u8], offset: &mut usize) -> Result<u64> {
    if *offset + 8 > data.len() {
        return Err(Error::corrupt("short u64"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_i64_le(data: &[u8], offset: &mut usize) -> Result<i64> {
    Ok(read_u64_le(data, offset)? as i64)
}

pub fn read_f64_le(data: &[u8], offset: &mut usize) -> Result<f64> {
    Ok(f64::from_bits(read_u64_le(data, offset)?))
}

pub fn read_bytes<'a>(data: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32_be(data, offset)? as usize;
    if *offset + len > data.len() {
        return Err(Error::corrupt("short byte slice"));
    }
    let out = &data[*offset..*offset + len];
    *offset += len;
    Ok(out)
}

pub fn read_string(data: &[u8], offset: &mut usize) -> Result<String> {
    let bytes = read_bytes(data, offset)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::corrupt("invalid utf8 string"))
}

pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

pub fn write_string(buf: &mut Vec<u8>, text: &str) {
    write_bytes(buf, text.as_bytes());
}

// ---------------------------------------------------------------------------
// Row value codec.
// ---------------------------------------------------------------------------

/// Append the encoded form of `row` to `buf`.
pub fn encode_row(row: &Row, col_types: &[ColumnType], buf: &mut Vec<u8>) -> Result<()> {
    if row.len() != col_types.len() {
        return Err(Error::corrupt(format!(
            "row has {} columns, schema has {}",
            row.len(),
            col_types.len()
        )));
    }
    let bitmap_len = (col_types.len() + 7) / 8;
    let bitmap_start = buf.len();
    buf.resize(bitmap_start + bitmap_len, 0);
    for (idx, (value, col_type)) in row.values().iter().zip(col_types.iter()).enumerate() {
        if value.is_null() {
            buf[bitmap_start + idx / 8] |= 1 << (idx % 8);
            continue;
        }
        if !col_type.accepts(value) {
            return Err(Error::corrupt(format!(
                "value {value:?} does not match column type {col_type:?}"
            )));
        }
        match value {
            Value::Null => unreachable!(),
            Value::Int(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Double(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
            Value::Timestamp(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Decimal(v) => write_string(buf, &v.to_string()),
            Value::Varchar(v) => write_string(buf, v),
        }
    }
    Ok(())
}

/// Decode one row encoded by [`encode_row`].
pub fn decode_row(data: &[u8], col_types: &[ColumnType], offset: &mut usize) -> Result<Row> {
    let bitmap_len = (col_types.len() + 7) / 8;
    if *offset + bitmap_len > data.len() {
        return Err(Error::corrupt("short null bitmap"));
    }
    let bitmap = data[*offset..*offset + bitmap_len].to_vec();
    *offset += bitmap_len;
    let mut values = Vec::with_capacity(col_types.len());
    for (idx, col_type) in col_types.iter().enumerate() {
        if bitmap[idx / 8] & (1 << (idx % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value = match col_type {
            ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt => {
                Value::Int(read_i64_le(data, offset)?)
            }
            ColumnType::Double => Value::Double(read_f64_le(data, offset)?),
            ColumnType::Timestamp => Value::Timestamp(read_i64_le(data, offset)?),
            ColumnType::Decimal { .. } => {
                let text = read_string(data, offset)?;
                Value::Decimal(Decimal::parse(&text)?)
            }
            ColumnType::Varchar => Value::Varchar(read_string(data, offset)?),
        };
        values.push(value);
    }
    Ok(Row::new(values))
}

/// Encode a set of rows as `u64 rowCount` followed by the rows. This is the
/// wire framing used for lookup responses and fill pages.
pub fn encode_rows(rows: &Rows, col_types: &[ColumnType]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + rows.len() * 16);
    buf.extend_from_slice(&(rows.len() as u64).to_be_bytes());
    for row in rows.iter() {
        encode_row(row, col_types, &mut buf)?;
    }
    Ok(buf)
}

/// Decode the framing produced by [`encode_rows`].
pub fn decode_rows(data: &[u8], col_types: &[ColumnType]) -> Result<Rows> {
    let mut offset = 0usize;
    let count = read_u64_be(data, &mut offset)? as usize;
    let mut rows = Rows::with_capacity(count);
    for _ in 0..count {
        rows.append(decode_row(data, col_types, &mut offset)?);
    }
    if offset != data.len() {
        return Err(Error::corrupt("trailing bytes after rows"));
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Order-preserving key codec.
// ---------------------------------------------------------------------------

/// Append the order-preserving encoding of one key column.
///
/// Every column starts with a null marker byte (nulls sort first), then:
/// integers and timestamps sign-flipped big-endian, doubles sign-magnitude
/// flipped, decimals as a sign-flipped mantissa rescaled to the column
/// scale, varchar in padded 9-byte groups with a continuation marker.
pub fn encode_key_col(value: &Value, col_type: &ColumnType, buf: &mut Vec<u8>) -> Result<()> {
    if value.is_null() {
        buf.push(0);
        return Ok(());
    }
    if !col_type.accepts(value) {
        return Err(Error::corrupt(format!(
            "key value {value:?} does not match column type {col_type:?}"
        )));
    }
    buf.push(1);
    match value {
        Value::Null => unreachable!(),
        Value::Int(v) | Value::Timestamp(v) => {
            buf.extend_from_slice(&((*v as u64) ^ (1u64 << 63)).to_be_bytes());
        }
        Value::Double(v) => {
            let bits = v.to_bits();
            // Flip all bits for negatives, just the sign bit for positives,
            // so encoded order matches numeric order.
            let flipped = if bits & (1u64 << 63) != 0 {
                !bits
            } else {
                bits | (1u64 << 63)
            };
            buf.extend_from_slice(&flipped.to_be_bytes());
        }
        Value::Decimal(v) => {
            let scale = match col_type {
                ColumnType::Decimal { scale, .. } => *scale,
                _ => v.scale(),
            };
            let mantissa = v.rescaled_mantissa(scale);
            buf.extend_from_slice(&((mantissa as u128) ^ (1u128 << 127)).to_be_bytes());
        }
        Value::Varchar(v) => encode_key_bytes(v.as_bytes(), buf),
    }
    Ok(())
}

/// Append the key-column encoding of the given columns of `row`.
pub fn encode_key_cols(
    row: &Row,
    key_cols: &[usize],
    col_types: &[ColumnType],
    buf: &mut Vec<u8>,
) -> Result<()> {
    for &col in key_cols {
        encode_key_col(row.value(col), &col_types[col], buf)?;
    }
    Ok(())
}

/// Order-preserving byte-string encoding: 8-byte groups padded with zeros,
/// each followed by a marker byte (9 = more groups follow, 0..=8 = number of
/// significant bytes in the final group).
fn encode_key_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    let mut chunks = bytes.chunks(8).peekable();
    if chunks.peek().is_none() {
        buf.extend_from_slice(&[0u8; 8]);
        buf.push(0);
        return;
    }
    while let Some(chunk) = chunks.next() {
        buf.extend_from_slice(chunk);
        buf.resize(buf.len() + (8 - chunk.len()), 0);
        if chunks.peek().is_some() {
            buf.push(9);
        } else {
            buf.push(chunk.len() as u8);
        }
    }
}

/// Smallest byte string strictly greater than `key`, used to resume scans
/// after a page. Keys here always contain a non-0xFF byte (the shard/table
/// prefix), so the carry terminates.
pub fn increment_bytes(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    for idx in (0..out.len()).rev() {
        if out[idx] != 0xFF {
            out[idx] += 1;
            return out;
        }
        out[idx] = 0;
    }
    debug_assert!(false, "cannot increment all-0xFF key");
    key.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<ColumnType> {
        vec![
            ColumnType::BigInt,
            ColumnType::Varchar,
            ColumnType::Double,
            ColumnType::Decimal {
                precision: 10,
                scale: 2,
            },
            ColumnType::Timestamp,
        ]
    }

    #[test]
    fn row_round_trip_with_nulls() {
        let types = schema();
        let row = Row::new(vec![
            Value::Int(-42),
            Value::Null,
            Value::Double(2.5),
            Value::Decimal(Decimal::parse("19.99").unwrap()),
            Value::Timestamp(1_700_000_000_000_000),
        ]);
        let mut buf = Vec::new();
        encode_row(&row, &types, &mut buf).unwrap();
        let mut offset = 0;
        let decoded = decode_row(&buf, &types, &mut offset).unwrap();
        assert_eq!(offset, buf.len());
        assert_eq!(decoded, row);
    }

    #[test]
    fn rows_framing_round_trip() {
        let types = vec![ColumnType::Int, ColumnType::Varchar];
        let mut rows = Rows::new();
        rows.append(Row::new(vec![Value::Int(1), Value::Varchar("x".into())]));
        rows.append(Row::new(vec![Value::Int(2), Value::Null]));
        let encoded = encode_rows(&rows, &types).unwrap();
        let decoded = decode_rows(&encoded, &types).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.row(1).value(0), &Value::Int(2));
        assert_eq!(decoded.row(1).value(1), &Value::Null);
    }

    fn key_for(value: Value, col_type: ColumnType) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_key_col(&value, &col_type, &mut buf).unwrap();
        buf
    }

    #[test]
    fn int_keys_order_preserving() {
        let values = [-1_000_000i64, -1, 0, 1, 42, i64::MAX];
        let keys: Vec<_> = values
            .iter()
            .map(|v| key_for(Value::Int(*v), ColumnType::BigInt))
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn double_keys_order_preserving() {
        let values = [-1e9f64, -2.5, -0.0, 0.5, 3.25, 1e12];
        let keys: Vec<_> = values
            .iter()
            .map(|v| key_for(Value::Double(*v), ColumnType::Double))
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn varchar_keys_order_preserving() {
        let values = ["", "a", "ab", "ab\u{0}", "abcdefgh", "abcdefghi", "b"];
        let keys: Vec<_> = values
            .iter()
            .map(|v| key_for(Value::Varchar((*v).into()), ColumnType::Varchar))
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "{pair:?}");
        }
    }

    #[test]
    fn decimal_keys_use_column_scale() {
        let col = ColumnType::Decimal {
            precision: 10,
            scale: 2,
        };
        let one_five = key_for(Value::Decimal(Decimal::parse("1.5").unwrap()), col);
        let one_fifty = key_for(Value::Decimal(Decimal::parse("1.50").unwrap()), col);
        assert_eq!(one_five, one_fifty);
        let two = key_for(Value::Decimal(Decimal::parse("2").unwrap()), col);
        assert!(one_five < two);
    }

    #[test]
    fn null_sorts_first() {
        let null_key = key_for(Value::Null, ColumnType::BigInt);
        let min_key = key_for(Value::Int(i64::MIN), ColumnType::BigInt);
        assert!(null_key < min_key);
    }

    #[test]
    fn increment_bytes_carries() {
        assert_eq!(increment_bytes(&[0, 1, 2]), vec![0, 1, 3]);
        assert_eq!(increment_bytes(&[0, 1, 0xFF]), vec![0, 2, 0]);
    }
}
