// Logical rewrites: constant folding, predicate simplification, and
// conjunct splitting for pushdown. Applied to fixpoint before plan
// construction.

use crate::common::Value;
use crate::error::Result;
use crate::execution::expressions;
use crate::sql::ast::{BinaryOp, UnaryOp};
use crate::sql::resolver::BoundExpr;

/// Fold and simplify until nothing changes.
pub fn rewrite(expr: BoundExpr) -> Result<BoundExpr> {
    let mut current = expr;
    loop {
        let (folded, changed) = fold_once(current)?;
        current = folded;
        if !changed {
            return Ok(current);
        }
    }
}

fn is_const(expr: &BoundExpr) -> bool {
    match expr {
        BoundExpr::Literal(_) => true,
        BoundExpr::Unary { operand, .. } => is_const(operand),
        BoundExpr::Binary { left, right, .. } => is_const(left) && is_const(right),
        BoundExpr::IsNull { operand, .. } => is_const(operand),
        BoundExpr::Like {
            operand, pattern, ..
        } => is_const(operand) && is_const(pattern),
        BoundExpr::Function { args, .. } => args.iter().all(is_const),
        _ => false,
    }
}

fn fold_once(expr: BoundExpr) -> Result<(BoundExpr, bool)> {
    // Constant subtree: evaluate now. Errors (e.g. overflow) are left
    // in place to surface at execution with full context.
    if is_const(&expr) && !matches!(expr, BoundExpr::Literal(_)) {
        if let Ok(value) = expressions::eval(&expr, &Vec::new(), &[]) {
            return Ok((BoundExpr::Literal(value), true));
        }
    }
    match expr {
        BoundExpr::Binary { op, left, right } => {
            let (l, lc) = fold_once(*left)?;
            let (r, rc) = fold_once(*right)?;
            let simplified = simplify_binary(op, l, r);
            let changed = lc || rc || simplified.1;
            Ok((simplified.0, changed))
        }
        BoundExpr::Unary { op, operand } => {
            let (inner, changed) = fold_once(*operand)?;
            match (op, &inner) {
                // Double negation.
                (
                    UnaryOp::Not,
                    BoundExpr::Unary {
                        op: UnaryOp::Not,
                        operand,
                    },
                ) => Ok(((**operand).clone(), true)),
                (UnaryOp::Not, BoundExpr::Literal(Value::Boolean(b))) => {
                    Ok((BoundExpr::Literal(Value::Boolean(!b)), true))
                }
                _ => Ok((
                    BoundExpr::Unary {
                        op,
                        operand: Box::new(inner),
                    },
                    changed,
                )),
            }
        }
        BoundExpr::IsNull { operand, negated } => {
            let (inner, changed) = fold_once(*operand)?;
            Ok((
                BoundExpr::IsNull {
                    operand: Box::new(inner),
                    negated,
                },
                changed,
            ))
        }
        BoundExpr::Like {
            operand,
            pattern,
            negated,
        } => {
            let (o, oc) = fold_once(*operand)?;
            let (p, pc) = fold_once(*pattern)?;
            Ok((
                BoundExpr::Like {
                    operand: Box::new(o),
                    pattern: Box::new(p),
                    negated,
                },
                oc || pc,
            ))
        }
        BoundExpr::Aggregate { func, arg } => match arg {
            Some(arg) => {
                let (inner, changed) = fold_once(*arg)?;
                Ok((
                    BoundExpr::Aggregate {
                        func,
                        arg: Some(Box::new(inner)),
                    },
                    changed,
                ))
            }
            None => Ok((BoundExpr::Aggregate { func, arg: None }, false)),
        },
        BoundExpr::Function { func, args } => {
            let mut changed = false;
            let mut folded = Vec::with_capacity(args.len());
            for arg in args {
                let (inner, c) = fold_once(arg)?;
                changed |= c;
                folded.push(inner);
            }
            Ok((BoundExpr::Function { func, args: folded }, changed))
        }
        other => Ok((other, false)),
    }
}

fn simplify_binary(op: BinaryOp, left: BoundExpr, right: BoundExpr) -> (BoundExpr, bool) {
    use BoundExpr::Literal;
    use Value::Boolean;
    match op {
        BinaryOp::And => match (&left, &right) {
            (Literal(Boolean(true)), _) => (right, true),
            (_, Literal(Boolean(true))) => (left, true),
            (Literal(Boolean(false)), _) | (_, Literal(Boolean(false))) => {
                (Literal(Boolean(false)), true)
            }
            _ => (rebuild(op, left, right), false),
        },
        BinaryOp::Or => match (&left, &right) {
            (Literal(Boolean(false)), _) => (right, true),
            (_, Literal(Boolean(false))) => (left, true),
            (Literal(Boolean(true)), _) | (_, Literal(Boolean(true))) => {
                (Literal(Boolean(true)), true)
            }
            _ => (rebuild(op, left, right), false),
        },
        _ => (rebuild(op, left, right), false),
    }
}

fn rebuild(op: BinaryOp, left: BoundExpr, right: BoundExpr) -> BoundExpr {
    BoundExpr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Split a predicate into its top-level conjuncts.
pub fn split_conjuncts(expr: BoundExpr, out: &mut Vec<BoundExpr>) {
    match expr {
        BoundExpr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            split_conjuncts(*left, out);
            split_conjuncts(*right, out);
        }
        other => out.push(other),
    }
}

/// Rebuild a conjunction from parts. `None` when the list is empty.
pub fn join_conjuncts(mut parts: Vec<BoundExpr>) -> Option<BoundExpr> {
    let mut result = parts.pop()?;
    while let Some(part) = parts.pop() {
        result = BoundExpr::Binary {
            op: BinaryOp::And,
            left: Box::new(part),
            right: Box::new(result),
        };
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::DataType;

    fn col(offset: usize) -> BoundExpr {
        BoundExpr::Column {
            offset,
            ty: DataType::Integer,
            nullable: true,
            name: format!("c{}", offset),
        }
    }

    fn lit_i(i: i64) -> BoundExpr {
        BoundExpr::Literal(Value::Integer(i))
    }

    fn bin(op: BinaryOp, l: BoundExpr, r: BoundExpr) -> BoundExpr {
        BoundExpr::Binary {
            op,
            left: Box::new(l),
            right: Box::new(r),
        }
    }

    #[test]
    fn test_constant_folding() {
        // 1 + 2 * 3 folds to 7.
        let expr = bin(
            BinaryOp::Add,
            lit_i(1),
            bin(BinaryOp::Mul, lit_i(2), lit_i(3)),
        );
        assert_eq!(rewrite(expr).unwrap(), lit_i(7));
    }

    #[test]
    fn test_true_and_x_simplifies() {
        let expr = bin(
            BinaryOp::And,
            BoundExpr::Literal(Value::Boolean(true)),
            bin(BinaryOp::Eq, col(0), lit_i(1)),
        );
        let rewritten = rewrite(expr).unwrap();
        assert!(matches!(
            rewritten,
            BoundExpr::Binary { op: BinaryOp::Eq, .. }
        ));
    }

    #[test]
    fn test_false_and_x_collapses() {
        let expr = bin(
            BinaryOp::And,
            BoundExpr::Literal(Value::Boolean(false)),
            bin(BinaryOp::Eq, col(0), lit_i(1)),
        );
        assert_eq!(
            rewrite(expr).unwrap(),
            BoundExpr::Literal(Value::Boolean(false))
        );
    }

    #[test]
    fn test_double_negation() {
        let expr = BoundExpr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(BoundExpr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(bin(BinaryOp::Eq, col(0), lit_i(1))),
            }),
        };
        assert!(matches!(
            rewrite(expr).unwrap(),
            BoundExpr::Binary { op: BinaryOp::Eq, .. }
        ));
    }

    #[test]
    fn test_split_and_join_conjuncts() {
        let expr = bin(
            BinaryOp::And,
            bin(BinaryOp::Eq, col(0), lit_i(1)),
            bin(
                BinaryOp::And,
                bin(BinaryOp::Gt, col(1), lit_i(2)),
                bin(BinaryOp::Lt, col(2), lit_i(3)),
            ),
        );
        let mut parts = Vec::new();
        split_conjuncts(expr, &mut parts);
        assert_eq!(parts.len(), 3);
        let rejoined = join_conjuncts(parts).unwrap();
        let mut reparts = Vec::new();
        split_conjuncts(rejoined, &mut reparts);
        assert_eq!(reparts.len(), 3);
    }

    #[test]
    fn test_folding_preserves_division_by_zero_semantics() {
        // 1/0 folds to NULL, matching runtime semantics.
        let expr = bin(BinaryOp::Div, lit_i(1), lit_i(0));
        assert_eq!(rewrite(expr).unwrap(), BoundExpr::Literal(Value::Null));
    }
}
