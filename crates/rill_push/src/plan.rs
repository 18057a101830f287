//! Physical plan input and the expression language it carries.
//!
//! The SQL parser and planner are external collaborators: the engine
//! consumes a finished physical plan tree and builds the push DAG from it.
//! Expressions cover column references, literals and the binary operators
//! the streaming operators evaluate per row.

use rill_common::{ColumnType, Error, Result, Row, Value};

/// One node of the physical plan handed to the engine.
#[derive(Clone, Debug)]
pub enum PhysicalPlan {
    /// Leaf bound to an existing source or materialized view. `cols`
    /// optionally projects/reorders columns; `None` keeps all.
    TableScan {
        table_name: String,
        cols: Option<Vec<usize>>,
    },
    Projection {
        exprs: Vec<Expr>,
        child: Box<PhysicalPlan>,
    },
    Selection {
        predicates: Vec<Expr>,
        child: Box<PhysicalPlan>,
    },
    HashAgg {
        /// Child column indexes to group by.
        group_by: Vec<usize>,
        aggs: Vec<AggExpr>,
        child: Box<PhysicalPlan>,
    },
    UnionAll {
        children: Vec<PhysicalPlan>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFunction {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    FirstRow,
}

#[derive(Clone, Debug)]
pub struct AggExpr {
    pub func: AggFunction,
    /// Argument expression; `None` only for `count(*)`.
    pub arg: Option<Expr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Clone, Debug)]
pub enum Expr {
    ColumnRef(usize),
    Literal(Value),
    BinaryOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn column(idx: usize) -> Expr {
        Expr::ColumnRef(idx)
    }

    pub fn literal(value: Value) -> Expr {
        Expr::Literal(value)
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Evaluate against one row. Null operands propagate to null; a
    /// selection treats anything but true as a non-match.
    pub fn eval(&self, row: &Row) -> Result<Value> {
        match self {
            Expr::ColumnRef(idx) => {
                if *idx >= row.len() {
                    return Err(Error::user(format!("column index {idx} out of range")));
                }
                Ok(row.value(*idx).clone())
            }
            Expr::Literal(value) => Ok(value.clone()),
            Expr::BinaryOp { op, left, right } => {
                let lhs = left.eval(row)?;
                let rhs = right.eval(row)?;
                eval_binop(*op, lhs, rhs)
            }
        }
    }

    /// True iff the expression evaluates to boolean true (represented as a
    /// non-zero integer).
    pub fn eval_predicate(&self, row: &Row) -> Result<bool> {
        Ok(matches!(self.eval(row)?, Value::Int(v) if v != 0))
    }

    /// Result column type given the child schema.
    pub fn result_type(&self, input: &[ColumnType]) -> Result<ColumnType> {
        match self {
            Expr::ColumnRef(idx) => input
                .get(*idx)
                .copied()
                .ok_or_else(|| Error::user(format!("column index {idx} out of range"))),
            Expr::Literal(value) => Ok(match value {
                Value::Null | Value::Int(_) => ColumnType::BigInt,
                Value::Double(_) => ColumnType::Double,
                Value::Decimal(d) => ColumnType::Decimal {
                    precision: 38,
                    scale: d.scale(),
                },
                Value::Varchar(_) => ColumnType::Varchar,
                Value::Timestamp(_) => ColumnType::Timestamp,
            }),
            Expr::BinaryOp { op, left, right } => match op {
                BinOp::Eq
                | BinOp::NotEq
                | BinOp::Lt
                | BinOp::LtEq
                | BinOp::Gt
                | BinOp::GtEq
                | BinOp::And
                | BinOp::Or => Ok(ColumnType::TinyInt),
                BinOp::Add | BinOp::Sub | BinOp::Mul => {
                    let lt = left.result_type(input)?;
                    let rt = right.result_type(input)?;
                    Ok(numeric_result_type(lt, rt))
                }
                BinOp::Div => Ok(ColumnType::Double),
            },
        }
    }
}

fn numeric_result_type(left: ColumnType, right: ColumnType) -> ColumnType {
    match (left, right) {
        (ColumnType::Double, _) | (_, ColumnType::Double) => ColumnType::Double,
        (ColumnType::Decimal { precision, scale }, _)
        | (_, ColumnType::Decimal { precision, scale }) => ColumnType::Decimal { precision, scale },
        _ => ColumnType::BigInt,
    }
}

fn bool_value(v: bool) -> Value {
    Value::Int(i64::from(v))
}

fn eval_binop(op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }
    match op {
        BinOp::And | BinOp::Or => {
            let (Value::Int(l), Value::Int(r)) = (&lhs, &rhs) else {
                return Err(Error::user("boolean operator applied to non-boolean"));
            };
            let out = match op {
                BinOp::And => (*l != 0) && (*r != 0),
                _ => (*l != 0) || (*r != 0),
            };
            Ok(bool_value(out))
        }
        BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let ordering = compare_values(&lhs, &rhs)?;
            let out = match op {
                BinOp::Eq => ordering == std::cmp::Ordering::Equal,
                BinOp::NotEq => ordering != std::cmp::Ordering::Equal,
                BinOp::Lt => ordering == std::cmp::Ordering::Less,
                BinOp::LtEq => ordering != std::cmp::Ordering::Greater,
                BinOp::Gt => ordering == std::cmp::Ordering::Greater,
                _ => ordering != std::cmp::Ordering::Less,
            };
            Ok(bool_value(out))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arithmetic(op, lhs, rhs),
    }
}

/// Total order across comparable value pairs; mixed numeric types compare
/// through f64.
pub fn compare_values(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering> {
    use std::cmp::Ordering;
    let ord = match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => l.cmp(r),
        (Value::Timestamp(l), Value::Timestamp(r)) => l.cmp(r),
        (Value::Varchar(l), Value::Varchar(r)) => l.cmp(r),
        (Value::Decimal(l), Value::Decimal(r)) => l.cmp(r),
        (Value::Double(l), Value::Double(r)) => {
            l.partial_cmp(r).unwrap_or(Ordering::Equal)
        }
        (l, r) => {
            let lf = to_f64(l)?;
            let rf = to_f64(r)?;
            lf.partial_cmp(&rf).unwrap_or(Ordering::Equal)
        }
    };
    Ok(ord)
}

pub fn to_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Int(v) | Value::Timestamp(v) => Ok(*v as f64),
        Value::Double(v) => Ok(*v),
        Value::Decimal(d) => {
            let scale_factor = 10f64.powi(i32::from(d.scale()));
            Ok(d.mantissa() as f64 / scale_factor)
        }
        other => Err(Error::user(format!("value {other:?} is not numeric"))),
    }
}

fn arithmetic(op: BinOp, lhs: Value, rhs: Value) -> Result<Value> {
    if op == BinOp::Div {
        let r = to_f64(&rhs)?;
        if r == 0.0 {
            return Ok(Value::Null);
        }
        return Ok(Value::Double(to_f64(&lhs)? / r));
    }
    match (&lhs, &rhs) {
        (Value::Int(l), Value::Int(r)) => {
            let out = match op {
                BinOp::Add => l.wrapping_add(*r),
                BinOp::Sub => l.wrapping_sub(*r),
                _ => l.wrapping_mul(*r),
            };
            Ok(Value::Int(out))
        }
        (Value::Decimal(l), Value::Decimal(r)) => match op {
            BinOp::Add => Ok(Value::Decimal(l.add(r))),
            BinOp::Sub => Ok(Value::Decimal(l.sub(r))),
            _ => {
                let out = to_f64(&lhs)? * to_f64(&rhs)?;
                Ok(Value::Double(out))
            }
        },
        _ => {
            let l = to_f64(&lhs)?;
            let r = to_f64(&rhs)?;
            let out = match op {
                BinOp::Add => l + r,
                BinOp::Sub => l - r,
                _ => l * r,
            };
            Ok(Value::Double(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_common::Decimal;

    fn row() -> Row {
        Row::new(vec![
            Value::Int(5),
            Value::Varchar("abc".into()),
            Value::Double(2.0),
            Value::Null,
        ])
    }

    #[test]
    fn comparison_and_boolean_logic() {
        let gt = Expr::binary(BinOp::Gt, Expr::column(0), Expr::literal(Value::Int(3)));
        assert!(gt.eval_predicate(&row()).unwrap());

        let eq = Expr::binary(
            BinOp::Eq,
            Expr::column(1),
            Expr::literal(Value::Varchar("abc".into())),
        );
        let both = Expr::binary(BinOp::And, gt, eq);
        assert!(both.eval_predicate(&row()).unwrap());
    }

    #[test]
    fn null_propagates_and_fails_predicates() {
        let cmp = Expr::binary(BinOp::Eq, Expr::column(3), Expr::literal(Value::Int(1)));
        assert_eq!(cmp.eval(&row()).unwrap(), Value::Null);
        assert!(!cmp.eval_predicate(&row()).unwrap());
    }

    #[test]
    fn arithmetic_types() {
        let add = Expr::binary(BinOp::Add, Expr::column(0), Expr::literal(Value::Int(2)));
        assert_eq!(add.eval(&row()).unwrap(), Value::Int(7));

        let mixed = Expr::binary(BinOp::Mul, Expr::column(0), Expr::column(2));
        assert_eq!(mixed.eval(&row()).unwrap(), Value::Double(10.0));

        let div0 = Expr::binary(BinOp::Div, Expr::column(0), Expr::literal(Value::Int(0)));
        assert_eq!(div0.eval(&row()).unwrap(), Value::Null);

        let dec = Expr::binary(
            BinOp::Add,
            Expr::literal(Value::Decimal(Decimal::parse("1.25").unwrap())),
            Expr::literal(Value::Decimal(Decimal::parse("0.75").unwrap())),
        );
        assert_eq!(
            dec.eval(&row()).unwrap(),
            Value::Decimal(Decimal::parse("2.00").unwrap())
        );
    }
}
