//! Column types and runtime values.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Declared type of a table column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    TinyInt,
    Int,
    BigInt,
    Double,
    Decimal { precision: u8, scale: u8 },
    Varchar,
    Timestamp,
}

impl ColumnType {
    /// True when the runtime value is representable by this column type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::TinyInt | ColumnType::Int | ColumnType::BigInt, Value::Int(_)) => true,
            (ColumnType::Double, Value::Double(_)) => true,
            (ColumnType::Decimal { .. }, Value::Decimal(_)) => true,
            (ColumnType::Varchar, Value::Varchar(_)) => true,
            (ColumnType::Timestamp, Value::Timestamp(_)) => true,
            _ => false,
        }
    }
}

/// Runtime value of a single column. Tiny/int/bigint all use `Int`; the
/// declared column type governs encoding, not arithmetic.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Double(f64),
    Decimal(Decimal),
    Varchar(String),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse a timestamp literal (`YYYY-MM-DD HH:MM:SS[.ffffff]`).
    pub fn timestamp_from_str(text: &str) -> Result<Value> {
        let parsed = chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|err| Error::user(format!("invalid timestamp {text:?}: {err}")))?;
        Ok(Value::Timestamp(parsed.and_utc().timestamp_micros()))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Varchar(v) => write!(f, "{v}"),
            Value::Timestamp(micros) => {
                match chrono::DateTime::from_timestamp_micros(*micros) {
                    Some(ts) => write!(f, "{}", ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f")),
                    None => write!(f, "{micros}us"),
                }
            }
        }
    }
}

/// Fixed-point decimal: `mantissa * 10^-scale`.
///
/// Precision is validated at parse time; arithmetic rescales to the larger
/// scale, which is enough for the aggregate functions the engine supports.
#[derive(Clone, Copy, Debug)]
pub struct Decimal {
    mantissa: i128,
    scale: u8,
}

impl Decimal {
    pub fn new(mantissa: i128, scale: u8) -> Self {
        Self { mantissa, scale }
    }

    pub fn zero() -> Self {
        Self {
            mantissa: 0,
            scale: 0,
        }
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let (neg, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(Error::user(format!("invalid decimal {text:?}")));
        }
        if frac_part.len() > 38 {
            return Err(Error::user(format!("decimal scale too large: {text:?}")));
        }
        let mut mantissa: i128 = 0;
        for ch in int_part.chars().chain(frac_part.chars()) {
            let digit = ch
                .to_digit(10)
                .ok_or_else(|| Error::user(format!("invalid decimal {text:?}")))?;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(digit)))
                .ok_or_else(|| Error::user(format!("decimal overflow: {text:?}")))?;
        }
        if neg {
            mantissa = -mantissa;
        }
        Ok(Self {
            mantissa,
            scale: frac_part.len() as u8,
        })
    }

    /// Return the mantissa rescaled to `scale`, used by the key codec so a
    /// column's keys share one scale.
    pub fn rescaled_mantissa(&self, scale: u8) -> i128 {
        match scale.cmp(&self.scale) {
            Ordering::Equal => self.mantissa,
            Ordering::Greater => {
                let factor = 10i128.saturating_pow(u32::from(scale - self.scale));
                self.mantissa.saturating_mul(factor)
            }
            Ordering::Less => {
                let factor = 10i128.saturating_pow(u32::from(self.scale - scale));
                self.mantissa / factor
            }
        }
    }

    pub fn add(&self, other: &Decimal) -> Decimal {
        let scale = self.scale.max(other.scale);
        Decimal {
            mantissa: self.rescaled_mantissa(scale) + other.rescaled_mantissa(scale),
            scale,
        }
    }

    pub fn sub(&self, other: &Decimal) -> Decimal {
        let scale = self.scale.max(other.scale);
        Decimal {
            mantissa: self.rescaled_mantissa(scale) - other.rescaled_mantissa(scale),
            scale,
        }
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let scale = self.scale.max(other.scale);
        self.rescaled_mantissa(scale)
            .cmp(&other.rescaled_mantissa(scale))
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let neg = self.mantissa < 0;
        let abs = self.mantissa.unsigned_abs();
        let divisor = 10u128.pow(u32::from(self.scale));
        let int_part = abs / divisor;
        let frac_part = abs % divisor;
        let sign = if neg { "-" } else { "" };
        write!(
            f,
            "{sign}{int_part}.{frac_part:0width$}",
            width = self.scale as usize
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_parse_and_display() {
        let d = Decimal::parse("123.45").unwrap();
        assert_eq!(d.mantissa(), 12345);
        assert_eq!(d.scale(), 2);
        assert_eq!(d.to_string(), "123.45");

        let neg = Decimal::parse("-0.05").unwrap();
        assert_eq!(neg.to_string(), "-0.05");
    }

    #[test]
    fn decimal_arithmetic_rescales() {
        let a = Decimal::parse("1.5").unwrap();
        let b = Decimal::parse("0.25").unwrap();
        assert_eq!(a.add(&b).to_string(), "1.75");
        assert_eq!(a.sub(&b).to_string(), "1.25");
        assert!(a > b);
        assert_eq!(Decimal::parse("1.50").unwrap(), a);
    }

    #[test]
    fn timestamp_parse_round_trips() {
        let v = Value::timestamp_from_str("2024-03-01 12:30:45.5").unwrap();
        let Value::Timestamp(micros) = v else {
            panic!("expected timestamp");
        };
        assert_eq!(micros % 1_000_000, 500_000);
    }
}
