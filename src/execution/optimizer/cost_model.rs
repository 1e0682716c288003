// Cost model: constant selectivity defaults combined multiplicatively,
// CPU cost per tuple plus weighted page I/O.

use crate::sql::ast::{BinaryOp, UnaryOp};
use crate::sql::resolver::BoundExpr;

/// Relative cost of touching a page versus processing a tuple.
pub const PAGE_IO_WEIGHT: f64 = 4.0;

/// Penalty per buffered row for memory-hungry operators (hash tables,
/// sorts, materialized inners).
pub const MEMORY_PENALTY: f64 = 0.01;

pub const EQUALITY_SELECTIVITY: f64 = 0.10;
pub const RANGE_SELECTIVITY: f64 = 0.30;
pub const IS_NULL_SELECTIVITY: f64 = 0.05;
pub const DEFAULT_SELECTIVITY: f64 = 0.33;

/// Rows assumed to fit on one page when estimating scan I/O.
const ROWS_PER_PAGE: f64 = 64.0;

/// Estimated fraction of input rows a predicate passes. Conjuncts
/// multiply (independence assumption); disjuncts use inclusion–
/// exclusion; NOT complements.
pub fn selectivity(predicate: &BoundExpr) -> f64 {
    match predicate {
        BoundExpr::Binary { op, left, right } => match op {
            BinaryOp::And => selectivity(left) * selectivity(right),
            BinaryOp::Or => {
                let l = selectivity(left);
                let r = selectivity(right);
                (l + r - l * r).clamp(0.0, 1.0)
            }
            BinaryOp::Eq => EQUALITY_SELECTIVITY,
            BinaryOp::NotEq => 1.0 - EQUALITY_SELECTIVITY,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => RANGE_SELECTIVITY,
            _ => DEFAULT_SELECTIVITY,
        },
        BoundExpr::Unary {
            op: UnaryOp::Not,
            operand,
        } => (1.0 - selectivity(operand)).clamp(0.0, 1.0),
        BoundExpr::IsNull { negated, .. } => {
            if *negated {
                1.0 - IS_NULL_SELECTIVITY
            } else {
                IS_NULL_SELECTIVITY
            }
        }
        BoundExpr::Like { .. } => DEFAULT_SELECTIVITY,
        BoundExpr::Literal(crate::common::Value::Boolean(false)) => 0.0,
        BoundExpr::Literal(crate::common::Value::Boolean(true)) => 1.0,
        _ => DEFAULT_SELECTIVITY,
    }
}

pub fn scan_cost(table_rows: f64) -> f64 {
    let pages = (table_rows / ROWS_PER_PAGE).max(1.0);
    table_rows + pages * PAGE_IO_WEIGHT
}

pub fn nested_loop_cost(outer_cost: f64, outer_rows: f64, inner_cost: f64, inner_rows: f64) -> f64 {
    // The inner side is materialized once, then rescanned per outer row.
    outer_cost + inner_cost + outer_rows * inner_rows + inner_rows * MEMORY_PENALTY
}

pub fn hash_join_cost(left_cost: f64, left_rows: f64, right_cost: f64, right_rows: f64) -> f64 {
    let build_rows = left_rows.min(right_rows);
    left_cost + right_cost + left_rows + right_rows + build_rows * MEMORY_PENALTY
}

pub fn merge_join_cost(left_cost: f64, left_rows: f64, right_cost: f64, right_rows: f64) -> f64 {
    left_cost + right_cost + left_rows + right_rows
}

pub fn sort_cost(input_cost: f64, rows: f64) -> f64 {
    let n = rows.max(2.0);
    input_cost + n * n.log2() + rows * MEMORY_PENALTY
}

pub fn aggregate_cost(input_cost: f64, input_rows: f64, groups: f64) -> f64 {
    input_cost + input_rows + groups * MEMORY_PENALTY
}

/// Output cardinality of a grouped aggregation: a constant fraction of
/// the input per grouping column, floored at one group.
pub fn group_count(input_rows: f64, group_exprs: usize) -> f64 {
    if group_exprs == 0 {
        1.0
    } else {
        let fraction = (0.1 * group_exprs as f64).min(1.0);
        (input_rows * fraction).clamp(1.0, input_rows.max(1.0))
    }
}
