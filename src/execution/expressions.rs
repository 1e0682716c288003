// Evaluation of bound expressions against a row context.
//
// Three-valued logic throughout: NULL propagates through arithmetic and
// comparison, AND/OR follow the SQL truth tables, and division by zero
// yields NULL rather than an error. Integer arithmetic overflow is an
// error. Column references are positional; resolution happened at
// compile time.

use crate::common::{Row, Value};
use crate::error::{DbError, Result};
use crate::sql::ast::{BinaryOp, UnaryOp};
use crate::sql::resolver::{BoundExpr, ScalarFunc};
use std::cmp::Ordering;

pub fn eval(expr: &BoundExpr, row: &Row, params: &[Value]) -> Result<Value> {
    match expr {
        BoundExpr::Literal(v) => Ok(v.clone()),
        BoundExpr::Column { offset, name, .. } => row.get(*offset).cloned().ok_or_else(|| {
            DbError::Execution(format!(
                "column '{}' (offset {}) out of range for row of {}",
                name,
                offset,
                row.len()
            ))
        }),
        BoundExpr::Parameter { index } => params.get(*index).cloned().ok_or_else(|| {
            DbError::Execution(format!("missing value for parameter ?{}", index + 1))
        }),
        BoundExpr::Unary { op, operand } => {
            let value = eval(operand, row, params)?;
            eval_unary(*op, value)
        }
        BoundExpr::Binary { op, left, right } => eval_binary(*op, left, right, row, params),
        BoundExpr::IsNull { operand, negated } => {
            let value = eval(operand, row, params)?;
            Ok(Value::Boolean(value.is_null() != *negated))
        }
        BoundExpr::Like {
            operand,
            pattern,
            negated,
        } => {
            let text = eval(operand, row, params)?;
            let pattern = eval(pattern, row, params)?;
            match (text, pattern) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::Text(t), Value::Text(p)) => {
                    let matched = like_match(&t.chars().collect::<Vec<_>>(), &p.chars().collect::<Vec<_>>());
                    Ok(Value::Boolean(matched != *negated))
                }
                _ => Err(DbError::TypeMismatch("LIKE requires text operands".into())),
            }
        }
        BoundExpr::Aggregate { .. } => Err(DbError::Execution(
            "aggregate evaluated outside an aggregation".into(),
        )),
        BoundExpr::Function { func, args } => {
            let value = eval(&args[0], row, params)?;
            eval_scalar(*func, value)
        }
    }
}

/// Evaluate a predicate: TRUE passes, FALSE and NULL do not.
pub fn eval_predicate(expr: &BoundExpr, row: &Row, params: &[Value]) -> Result<bool> {
    Ok(matches!(eval(expr, row, params)?, Value::Boolean(true)))
}

fn eval_unary(op: UnaryOp, value: Value) -> Result<Value> {
    match op {
        UnaryOp::Neg => match value {
            Value::Null => Ok(Value::Null),
            Value::Integer(i) => i
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| DbError::Overflow("negation".into())),
            Value::Real(r) => Ok(Value::Real(-r)),
            other => Err(DbError::TypeMismatch(format!("cannot negate {:?}", other))),
        },
        UnaryOp::Not => match value {
            Value::Null => Ok(Value::Null),
            Value::Boolean(b) => Ok(Value::Boolean(!b)),
            other => Err(DbError::TypeMismatch(format!("NOT of non-boolean {:?}", other))),
        },
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &BoundExpr,
    right: &BoundExpr,
    row: &Row,
    params: &[Value],
) -> Result<Value> {
    match op {
        BinaryOp::And => {
            let l = eval(left, row, params)?;
            if l == Value::Boolean(false) {
                return Ok(Value::Boolean(false));
            }
            let r = eval(right, row, params)?;
            Ok(match (l, r) {
                (_, Value::Boolean(false)) => Value::Boolean(false),
                (Value::Boolean(true), Value::Boolean(true)) => Value::Boolean(true),
                _ => Value::Null,
            })
        }
        BinaryOp::Or => {
            let l = eval(left, row, params)?;
            if l == Value::Boolean(true) {
                return Ok(Value::Boolean(true));
            }
            let r = eval(right, row, params)?;
            Ok(match (l, r) {
                (_, Value::Boolean(true)) => Value::Boolean(true),
                (Value::Boolean(false), Value::Boolean(false)) => Value::Boolean(false),
                _ => Value::Null,
            })
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let l = eval(left, row, params)?;
            let r = eval(right, row, params)?;
            arithmetic(op, l, r)
        }
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::LtEq
        | BinaryOp::Gt
        | BinaryOp::GtEq => {
            let l = eval(left, row, params)?;
            let r = eval(right, row, params)?;
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = l.compare(&r)?;
            Ok(Value::Boolean(match op {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::NotEq => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::LtEq => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::GtEq => ord != Ordering::Less,
                _ => unreachable!(),
            }))
        }
    }
}

pub fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Result<Value> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => int_arithmetic(op, a, b),
        (Value::Real(a), Value::Real(b)) => Ok(real_arithmetic(op, a, b)),
        (Value::Integer(a), Value::Real(b)) => Ok(real_arithmetic(op, a as f64, b)),
        (Value::Real(a), Value::Integer(b)) => Ok(real_arithmetic(op, a, b as f64)),
        (a, b) => Err(DbError::TypeMismatch(format!(
            "arithmetic on {:?} and {:?}",
            a, b
        ))),
    }
}

fn int_arithmetic(op: BinaryOp, a: i64, b: i64) -> Result<Value> {
    let overflow = |what: &str| DbError::Overflow(format!("{} of {} and {}", what, a, b));
    match op {
        BinaryOp::Add => a
            .checked_add(b)
            .map(Value::Integer)
            .ok_or_else(|| overflow("addition")),
        BinaryOp::Sub => a
            .checked_sub(b)
            .map(Value::Integer)
            .ok_or_else(|| overflow("subtraction")),
        BinaryOp::Mul => a
            .checked_mul(b)
            .map(Value::Integer)
            .ok_or_else(|| overflow("multiplication")),
        BinaryOp::Div => {
            if b == 0 {
                Ok(Value::Null)
            } else {
                a.checked_div(b)
                    .map(Value::Integer)
                    .ok_or_else(|| overflow("division"))
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                Ok(Value::Null)
            } else {
                a.checked_rem(b)
                    .map(Value::Integer)
                    .ok_or_else(|| overflow("modulo"))
            }
        }
        _ => unreachable!(),
    }
}

fn real_arithmetic(op: BinaryOp, a: f64, b: f64) -> Value {
    match op {
        BinaryOp::Add => Value::Real(a + b),
        BinaryOp::Sub => Value::Real(a - b),
        BinaryOp::Mul => Value::Real(a * b),
        BinaryOp::Div => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Real(a / b)
            }
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Real(a % b)
            }
        }
        _ => unreachable!(),
    }
}

fn eval_scalar(func: ScalarFunc, value: Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match (func, value) {
        (ScalarFunc::Upper, Value::Text(s)) => Ok(Value::Text(s.to_uppercase())),
        (ScalarFunc::Lower, Value::Text(s)) => Ok(Value::Text(s.to_lowercase())),
        (ScalarFunc::Trim, Value::Text(s)) => Ok(Value::Text(s.trim().to_string())),
        (ScalarFunc::Length, Value::Text(s)) => Ok(Value::Integer(s.chars().count() as i64)),
        (_, other) => Err(DbError::TypeMismatch(format!(
            "string function on {:?}",
            other
        ))),
    }
}

/// SQL LIKE: `%` matches any run (including empty), `_` any single
/// character. Case-sensitive.
fn like_match(text: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('%') => {
            like_match(text, &pattern[1..])
                || (!text.is_empty() && like_match(&text[1..], pattern))
        }
        Some('_') => !text.is_empty() && like_match(&text[1..], &pattern[1..]),
        Some(c) => text.first() == Some(c) && like_match(&text[1..], &pattern[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataType;

    fn col(offset: usize, ty: DataType) -> BoundExpr {
        BoundExpr::Column {
            offset,
            ty,
            nullable: true,
            name: format!("c{}", offset),
        }
    }

    fn lit(v: Value) -> BoundExpr {
        BoundExpr::Literal(v)
    }

    fn bin(op: BinaryOp, l: BoundExpr, r: BoundExpr) -> BoundExpr {
        BoundExpr::Binary {
            op,
            left: Box::new(l),
            right: Box::new(r),
        }
    }

    #[test]
    fn test_integer_arithmetic() {
        let row = vec![Value::Integer(30)];
        let expr = bin(BinaryOp::Add, col(0, DataType::Integer), lit(Value::Integer(1)));
        assert_eq!(eval(&expr, &row, &[]).unwrap(), Value::Integer(31));
    }

    #[test]
    fn test_division_by_zero_is_null() {
        let expr = bin(BinaryOp::Div, lit(Value::Integer(5)), lit(Value::Integer(0)));
        assert_eq!(eval(&expr, &vec![], &[]).unwrap(), Value::Null);
        let expr = bin(BinaryOp::Div, lit(Value::Real(5.0)), lit(Value::Real(0.0)));
        assert_eq!(eval(&expr, &vec![], &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let expr = bin(
            BinaryOp::Add,
            lit(Value::Integer(i64::MAX)),
            lit(Value::Integer(1)),
        );
        assert!(matches!(eval(&expr, &vec![], &[]), Err(DbError::Overflow(_))));
    }

    #[test]
    fn test_null_propagation() {
        let expr = bin(BinaryOp::Add, lit(Value::Null), lit(Value::Integer(1)));
        assert_eq!(eval(&expr, &vec![], &[]).unwrap(), Value::Null);
        let expr = bin(BinaryOp::Eq, lit(Value::Null), lit(Value::Integer(1)));
        assert_eq!(eval(&expr, &vec![], &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_three_valued_and_or() {
        let t = lit(Value::Boolean(true));
        let f = lit(Value::Boolean(false));
        let n = lit(Value::Null);
        assert_eq!(
            eval(&bin(BinaryOp::And, f.clone(), n.clone()), &vec![], &[]).unwrap(),
            Value::Boolean(false)
        );
        assert_eq!(
            eval(&bin(BinaryOp::And, t.clone(), n.clone()), &vec![], &[]).unwrap(),
            Value::Null
        );
        assert_eq!(
            eval(&bin(BinaryOp::Or, t.clone(), n.clone()), &vec![], &[]).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            eval(&bin(BinaryOp::Or, f, n), &vec![], &[]).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_predicate_null_is_not_true() {
        let expr = bin(BinaryOp::Eq, lit(Value::Null), lit(Value::Integer(1)));
        assert!(!eval_predicate(&expr, &vec![], &[]).unwrap());
    }

    #[test]
    fn test_mixed_numeric_comparison() {
        let expr = bin(BinaryOp::Gt, lit(Value::Real(1.5)), lit(Value::Integer(1)));
        assert_eq!(eval(&expr, &vec![], &[]).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_like_patterns() {
        let like = |text: &str, pattern: &str| {
            let expr = BoundExpr::Like {
                operand: Box::new(lit(Value::Text(text.into()))),
                pattern: Box::new(lit(Value::Text(pattern.into()))),
                negated: false,
            };
            eval(&expr, &vec![], &[]).unwrap() == Value::Boolean(true)
        };
        assert!(like("Alice", "A%"));
        assert!(like("Alice", "%ice"));
        assert!(like("Alice", "A_i_e"));
        assert!(like("Alice", "%"));
        assert!(!like("Bob", "A%"));
        assert!(!like("Alice", "a%"));
    }

    #[test]
    fn test_is_null() {
        let expr = BoundExpr::IsNull {
            operand: Box::new(lit(Value::Null)),
            negated: false,
        };
        assert_eq!(eval(&expr, &vec![], &[]).unwrap(), Value::Boolean(true));
        let expr = BoundExpr::IsNull {
            operand: Box::new(lit(Value::Integer(1))),
            negated: true,
        };
        assert_eq!(eval(&expr, &vec![], &[]).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_scalar_functions() {
        let call = |func, v: Value| {
            eval(
                &BoundExpr::Function {
                    func,
                    args: vec![lit(v)],
                },
                &vec![],
                &[],
            )
            .unwrap()
        };
        assert_eq!(call(ScalarFunc::Upper, Value::Text("abc".into())), Value::Text("ABC".into()));
        assert_eq!(call(ScalarFunc::Lower, Value::Text("AbC".into())), Value::Text("abc".into()));
        assert_eq!(call(ScalarFunc::Trim, Value::Text("  x ".into())), Value::Text("x".into()));
        assert_eq!(call(ScalarFunc::Length, Value::Text("héllo".into())), Value::Integer(5));
        assert_eq!(call(ScalarFunc::Length, Value::Null), Value::Null);
    }

    #[test]
    fn test_parameters() {
        let expr = bin(
            BinaryOp::Eq,
            col(0, DataType::Integer),
            BoundExpr::Parameter { index: 0 },
        );
        let row = vec![Value::Integer(7)];
        assert_eq!(
            eval(&expr, &row, &[Value::Integer(7)]).unwrap(),
            Value::Boolean(true)
        );
        assert!(eval(&expr, &row, &[]).is_err());
    }
}
