//! Broker message decoding.
//!
//! Message bodies are JSON objects keyed by column name; keys are JSON
//! objects holding the primary-key columns. A missing column decodes to
//! null (primary-key columns excepted). Pluggable decoder registries are
//! an external concern; JSON is the built-in format.

use rill_common::{ColumnType, Error, Result, Row, Value};

use crate::meta::TableInfo;
use crate::source::broker::Message;

/// One decoded mutation from the broker.
#[derive(Debug)]
pub enum ParsedMutation {
    Upsert(Row),
    /// Row with only the key columns populated; the table executor
    /// resolves the stored image.
    DeleteByKey(Row),
}

pub struct MessageParser {
    table: TableInfo,
}

impl MessageParser {
    pub fn new(table: TableInfo) -> Self {
        Self { table }
    }

    pub fn parse_message(&self, message: &Message) -> Result<ParsedMutation> {
        match &message.value {
            Some(body) => Ok(ParsedMutation::Upsert(self.parse_row(body, false)?)),
            None => Ok(ParsedMutation::DeleteByKey(
                self.parse_row(&message.key, true)?,
            )),
        }
    }

    /// Decode a JSON object into a row; `key_only` restricts required
    /// fields to the primary key and nulls everything else.
    fn parse_row(&self, data: &[u8], key_only: bool) -> Result<Row> {
        let parsed: serde_json::Value = serde_json::from_slice(data)
            .map_err(|err| Error::user(format!("invalid message body: {err}")))?;
        let serde_json::Value::Object(fields) = parsed else {
            return Err(Error::user("message body must be a JSON object"));
        };
        let mut values = Vec::with_capacity(self.table.column_types.len());
        for (idx, name) in self.table.column_names.iter().enumerate() {
            let is_key_col = self.table.pk_cols.contains(&idx);
            if key_only && !is_key_col {
                values.push(Value::Null);
                continue;
            }
            let value = match fields.get(name) {
                Some(field) => json_to_value(&self.table.column_types[idx], field)?,
                None => Value::Null,
            };
            if is_key_col && value.is_null() {
                return Err(Error::user(format!(
                    "message missing key column {name}"
                )));
            }
            values.push(value);
        }
        Ok(Row::new(values))
    }
}

fn json_to_value(col_type: &ColumnType, field: &serde_json::Value) -> Result<Value> {
    if field.is_null() {
        return Ok(Value::Null);
    }
    Ok(match col_type {
        ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt => Value::Int(
            field
                .as_i64()
                .ok_or_else(|| Error::user(format!("expected integer, got {field}")))?,
        ),
        ColumnType::Double => Value::Double(
            field
                .as_f64()
                .ok_or_else(|| Error::user(format!("expected number, got {field}")))?,
        ),
        ColumnType::Decimal { .. } => {
            let text = match field {
                serde_json::Value::String(text) => text.clone(),
                serde_json::Value::Number(number) => number.to_string(),
                other => {
                    return Err(Error::user(format!("expected decimal, got {other}")));
                }
            };
            Value::Decimal(rill_common::Decimal::parse(&text)?)
        }
        ColumnType::Varchar => Value::Varchar(
            field
                .as_str()
                .ok_or_else(|| Error::user(format!("expected string, got {field}")))?
                .to_string(),
        ),
        ColumnType::Timestamp => {
            let text = field
                .as_str()
                .ok_or_else(|| Error::user(format!("expected timestamp string, got {field}")))?;
            Value::timestamp_from_str(text)?
        }
    })
}
