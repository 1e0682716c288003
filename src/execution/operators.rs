// Volcano execution: every physical operator is one arm of a closed
// enum with a uniform open/next/close contract. `open` may acquire
// locks and cursors, `next` produces one row or end-of-stream, `close`
// is idempotent and must run on every exit path. Execution within one
// statement is single-threaded and cooperative; cancellation and the
// query deadline are checked between row productions.

use crate::common::{DataType, Row, Value};
use crate::error::{DbError, Result};
use crate::execution::expressions::{eval, eval_predicate};
use crate::execution::plan::{Plan, PlanOp};
use crate::execution::sort::{SortConfig, SortedRows, Sorter};
use crate::execution::ExecContext;
use crate::sql::ast::JoinKind;
use crate::sql::resolver::{AggFunc, BoundExpr};
use crate::storage::heap::HeapScan;
use crate::storage::TableHeap;
use crate::transaction::types::{IsolationLevel, LockMode, ResourceId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub enum Operator {
    SeqScan(SeqScanOp),
    Filter(FilterOp),
    Project(ProjectOp),
    NestedLoop(NestedLoopJoinOp),
    HashJoin(HashJoinOp),
    MergeJoin(MergeJoinOp),
    HashAggregate(HashAggregateOp),
    Sort(SortOp),
    Limit(LimitOp),
}

impl Operator {
    /// Build an operator tree from a physical plan.
    pub fn build(plan: &Plan) -> Result<Operator> {
        let mut children: Vec<Operator> = plan
            .children
            .iter()
            .map(Operator::build)
            .collect::<Result<Vec<_>>>()?;
        let child_widths: Vec<usize> = plan.children.iter().map(|c| c.output_width()).collect();
        let op = match &plan.op {
            PlanOp::SeqScan { table, predicate } => Operator::SeqScan(SeqScanOp {
                table: table.clone(),
                predicate: predicate.clone(),
                heap: None,
                scan: None,
            }),
            PlanOp::IndexScan { .. } => {
                return Err(DbError::Planning(
                    "index scans are not implemented".into(),
                ))
            }
            PlanOp::Filter { predicate } => Operator::Filter(FilterOp {
                predicate: predicate.clone(),
                child: Box::new(children.remove(0)),
            }),
            PlanOp::Project { exprs } => Operator::Project(ProjectOp {
                exprs: exprs.clone(),
                child: Box::new(children.remove(0)),
            }),
            PlanOp::NestedLoopJoin { kind, on } => {
                let right = Box::new(children.remove(1));
                let left = Box::new(children.remove(0));
                Operator::NestedLoop(NestedLoopJoinOp {
                    kind: *kind,
                    on: on.clone(),
                    left,
                    right,
                    left_width: child_widths[0],
                    right_width: child_widths[1],
                    inner: Vec::new(),
                    inner_matched: Vec::new(),
                    outer_row: None,
                    inner_idx: 0,
                    outer_matched: false,
                    drain_idx: 0,
                })
            }
            PlanOp::HashJoin {
                kind,
                left_key,
                right_key,
                build_left,
            } => {
                let coerce_real = matches!(left_key.ty(), Some(DataType::Real))
                    || matches!(right_key.ty(), Some(DataType::Real));
                let right = Box::new(children.remove(1));
                let left = Box::new(children.remove(0));
                Operator::HashJoin(HashJoinOp {
                    kind: *kind,
                    build_left: *build_left,
                    left_key: left_key.clone(),
                    right_key: right_key.clone(),
                    left,
                    right,
                    left_width: child_widths[0],
                    right_width: child_widths[1],
                    coerce_real,
                    build_rows: Vec::new(),
                    build_index: HashMap::new(),
                    build_matched: Vec::new(),
                    pending: VecDeque::new(),
                    probe_done: false,
                    drain_idx: 0,
                })
            }
            PlanOp::MergeJoin {
                kind,
                left_key,
                right_key,
            } => {
                if *kind != JoinKind::Inner {
                    return Err(DbError::Planning(
                        "merge join supports inner joins only".into(),
                    ));
                }
                let right = Box::new(children.remove(1));
                let left = Box::new(children.remove(0));
                Operator::MergeJoin(MergeJoinOp {
                    left_key: left_key.clone(),
                    right_key: right_key.clone(),
                    left,
                    right,
                    left_row: None,
                    left_exhausted: false,
                    run: Vec::new(),
                    run_key: None,
                    run_idx: 0,
                    lookahead: None,
                    right_exhausted: false,
                })
            }
            PlanOp::HashAggregate { group_by, aggs } => {
                let child = if children.is_empty() {
                    None
                } else {
                    Some(Box::new(children.remove(0)))
                };
                Operator::HashAggregate(HashAggregateOp {
                    group_by: group_by.clone(),
                    aggs: aggs.clone(),
                    child,
                    groups: Vec::new(),
                    emit_idx: 0,
                })
            }
            PlanOp::Sort { keys } => Operator::Sort(SortOp {
                keys: keys.clone(),
                child: Box::new(children.remove(0)),
                output: None,
            }),
            PlanOp::Limit { limit, offset } => Operator::Limit(LimitOp {
                limit: *limit,
                offset: *offset,
                child: Box::new(children.remove(0)),
                skipped: 0,
                emitted: 0,
            }),
        };
        Ok(op)
    }

    pub fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        match self {
            Operator::SeqScan(op) => op.open(ctx),
            Operator::Filter(op) => op.child.open(ctx),
            Operator::Project(op) => op.child.open(ctx),
            Operator::NestedLoop(op) => op.open(ctx),
            Operator::HashJoin(op) => op.open(ctx),
            Operator::MergeJoin(op) => {
                op.left.open(ctx)?;
                op.right.open(ctx)
            }
            Operator::HashAggregate(op) => op.open(ctx),
            Operator::Sort(op) => op.open(ctx),
            Operator::Limit(op) => op.child.open(ctx),
        }
    }

    pub fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        match self {
            Operator::SeqScan(op) => op.next(ctx),
            Operator::Filter(op) => loop {
                match op.child.next(ctx)? {
                    None => return Ok(None),
                    Some(row) => {
                        if eval_predicate(&op.predicate, &row, &ctx.params)? {
                            return Ok(Some(row));
                        }
                    }
                }
            },
            Operator::Project(op) => match op.child.next(ctx)? {
                None => Ok(None),
                Some(row) => {
                    let mut out = Vec::with_capacity(op.exprs.len());
                    for (expr, _) in &op.exprs {
                        out.push(eval(expr, &row, &ctx.params)?);
                    }
                    Ok(Some(out))
                }
            },
            Operator::NestedLoop(op) => op.next(ctx),
            Operator::HashJoin(op) => op.next(ctx),
            Operator::MergeJoin(op) => op.next(ctx),
            Operator::HashAggregate(op) => op.next(ctx),
            Operator::Sort(op) => match &mut op.output {
                Some(sorted) => sorted.next_row(),
                None => Err(DbError::Execution("sort next before open".into())),
            },
            Operator::Limit(op) => {
                while op.skipped < op.offset {
                    match op.child.next(ctx)? {
                        None => return Ok(None),
                        Some(_) => op.skipped += 1,
                    }
                }
                if let Some(limit) = op.limit {
                    if op.emitted >= limit {
                        return Ok(None);
                    }
                }
                match op.child.next(ctx)? {
                    None => Ok(None),
                    Some(row) => {
                        op.emitted += 1;
                        Ok(Some(row))
                    }
                }
            }
        }
    }

    /// Close cursors and children. Safe to call more than once and on
    /// partially opened trees.
    pub fn close(&mut self, ctx: &ExecContext) {
        match self {
            Operator::SeqScan(op) => {
                op.scan = None;
                op.heap = None;
            }
            Operator::Filter(op) => op.child.close(ctx),
            Operator::Project(op) => op.child.close(ctx),
            Operator::NestedLoop(op) => {
                op.inner.clear();
                op.left.close(ctx);
                op.right.close(ctx);
            }
            Operator::HashJoin(op) => {
                op.build_rows.clear();
                op.build_index.clear();
                op.pending.clear();
                op.left.close(ctx);
                op.right.close(ctx);
            }
            Operator::MergeJoin(op) => {
                op.run.clear();
                op.left.close(ctx);
                op.right.close(ctx);
            }
            Operator::HashAggregate(op) => {
                op.groups.clear();
                if let Some(child) = &mut op.child {
                    child.close(ctx);
                }
            }
            Operator::Sort(op) => {
                op.output = None;
                op.child.close(ctx);
            }
            Operator::Limit(op) => op.child.close(ctx),
        }
    }
}

pub struct SeqScanOp {
    table: crate::catalog::TableInfo,
    predicate: Option<BoundExpr>,
    heap: Option<Arc<TableHeap>>,
    scan: Option<HeapScan>,
}

impl SeqScanOp {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        // Serializable takes a table-level shared lock (the predicate
        // range, since there are no index ranges); everyone else
        // announces intent and locks rows individually.
        let mode = match ctx.isolation {
            IsolationLevel::Serializable => LockMode::Shared,
            _ => LockMode::IntentionShared,
        };
        ctx.locks.acquire_hierarchy(
            ctx.txn_id,
            ResourceId::Table(self.table.id),
            mode,
            ctx.deadline,
        )?;
        let heap = ctx.catalog.table_heap(&self.table.name, ctx.deadline)?;
        self.scan = Some(heap.scan());
        self.heap = Some(heap);
        Ok(())
    }

    fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        let heap = self
            .heap
            .as_ref()
            .ok_or_else(|| DbError::Execution("scan next before open".into()))?
            .clone();
        let scan = self
            .scan
            .as_mut()
            .ok_or_else(|| DbError::Execution("scan next before open".into()))?;
        loop {
            ctx.check()?;
            let (rid, row) = match scan.next(&heap, &self.table.columns, ctx.deadline)? {
                None => return Ok(None),
                Some(entry) => entry,
            };
            let row = match ctx.isolation {
                IsolationLevel::ReadUncommitted | IsolationLevel::Serializable => row,
                IsolationLevel::ReadCommitted => {
                    let resource = ResourceId::Row {
                        table: self.table.id,
                        rid,
                    };
                    ctx.locks.acquire_hierarchy(
                        ctx.txn_id,
                        resource,
                        LockMode::Shared,
                        ctx.deadline,
                    )?;
                    let current = heap.get(&self.table.columns, rid, ctx.deadline)?;
                    ctx.locks.release(ctx.txn_id, resource);
                    match current {
                        None => continue,
                        Some(row) => row,
                    }
                }
                IsolationLevel::RepeatableRead => {
                    let resource = ResourceId::Row {
                        table: self.table.id,
                        rid,
                    };
                    ctx.locks.acquire_hierarchy(
                        ctx.txn_id,
                        resource,
                        LockMode::Shared,
                        ctx.deadline,
                    )?;
                    match heap.get(&self.table.columns, rid, ctx.deadline)? {
                        None => continue,
                        Some(row) => row,
                    }
                }
            };
            match &self.predicate {
                Some(predicate) => {
                    if eval_predicate(predicate, &row, &ctx.params)? {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(Some(row)),
            }
        }
    }
}

pub struct FilterOp {
    predicate: BoundExpr,
    child: Box<Operator>,
}

pub struct ProjectOp {
    exprs: Vec<(BoundExpr, String)>,
    child: Box<Operator>,
}

pub struct NestedLoopJoinOp {
    kind: JoinKind,
    on: Option<BoundExpr>,
    left: Box<Operator>,
    right: Box<Operator>,
    left_width: usize,
    right_width: usize,
    inner: Vec<Row>,
    inner_matched: Vec<bool>,
    outer_row: Option<Row>,
    inner_idx: usize,
    outer_matched: bool,
    drain_idx: usize,
}

impl NestedLoopJoinOp {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.left.open(ctx)?;
        self.right.open(ctx)?;
        // Materialize the inner side once; it is rescanned per outer
        // row.
        self.inner.clear();
        while let Some(row) = self.right.next(ctx)? {
            self.inner.push(row);
        }
        self.inner_matched = vec![false; self.inner.len()];
        self.outer_row = None;
        self.inner_idx = 0;
        self.drain_idx = 0;
        Ok(())
    }

    fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            ctx.check()?;
            if self.outer_row.is_none() {
                match self.left.next(ctx)? {
                    Some(row) => {
                        self.outer_row = Some(row);
                        self.inner_idx = 0;
                        self.outer_matched = false;
                    }
                    None => {
                        // Outer exhausted. A right-outer join still owes
                        // the unmatched inner rows, null-extended.
                        if self.kind == JoinKind::RightOuter {
                            while self.drain_idx < self.inner.len() {
                                let idx = self.drain_idx;
                                self.drain_idx += 1;
                                if !self.inner_matched[idx] {
                                    let mut row = vec![Value::Null; self.left_width];
                                    row.extend(self.inner[idx].iter().cloned());
                                    return Ok(Some(row));
                                }
                            }
                        }
                        return Ok(None);
                    }
                }
            }
            let outer = self.outer_row.as_ref().unwrap();
            while self.inner_idx < self.inner.len() {
                let idx = self.inner_idx;
                self.inner_idx += 1;
                let mut combined = Vec::with_capacity(self.left_width + self.right_width);
                combined.extend(outer.iter().cloned());
                combined.extend(self.inner[idx].iter().cloned());
                let passes = match &self.on {
                    None => true,
                    Some(on) => eval_predicate(on, &combined, &ctx.params)?,
                };
                if passes {
                    self.outer_matched = true;
                    self.inner_matched[idx] = true;
                    return Ok(Some(combined));
                }
            }
            // Inner exhausted for this outer row.
            let unmatched_left = self.kind == JoinKind::LeftOuter && !self.outer_matched;
            let outer = self.outer_row.take().unwrap();
            if unmatched_left {
                let mut row = outer;
                row.extend(std::iter::repeat(Value::Null).take(self.right_width));
                return Ok(Some(row));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyPart {
    Null,
    Int(i64),
    Real(u64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
}

/// Join key: NULL never matches, so `None` is returned for it.
fn join_key(value: &Value, coerce_real: bool) -> Option<KeyPart> {
    match value {
        Value::Null => None,
        Value::Integer(i) => {
            if coerce_real {
                Some(KeyPart::Real((*i as f64).to_bits()))
            } else {
                Some(KeyPart::Int(*i))
            }
        }
        Value::Real(r) => Some(KeyPart::Real(r.to_bits())),
        Value::Boolean(b) => Some(KeyPart::Bool(*b)),
        Value::Text(s) => Some(KeyPart::Text(s.clone())),
        Value::Blob(b) => Some(KeyPart::Blob(b.clone())),
    }
}

/// Grouping key: NULLs group together, so NULL is representable.
fn group_key(value: &Value) -> KeyPart {
    match value {
        Value::Null => KeyPart::Null,
        Value::Integer(i) => KeyPart::Int(*i),
        Value::Real(r) => KeyPart::Real(r.to_bits()),
        Value::Boolean(b) => KeyPart::Bool(*b),
        Value::Text(s) => KeyPart::Text(s.clone()),
        Value::Blob(b) => KeyPart::Blob(b.clone()),
    }
}

pub struct HashJoinOp {
    kind: JoinKind,
    build_left: bool,
    left_key: BoundExpr,
    right_key: BoundExpr,
    left: Box<Operator>,
    right: Box<Operator>,
    left_width: usize,
    right_width: usize,
    coerce_real: bool,
    build_rows: Vec<Row>,
    build_index: HashMap<KeyPart, Vec<usize>>,
    build_matched: Vec<bool>,
    pending: VecDeque<Row>,
    probe_done: bool,
    drain_idx: usize,
}

impl HashJoinOp {
    fn build_side(&mut self) -> &mut Box<Operator> {
        if self.build_left {
            &mut self.left
        } else {
            &mut self.right
        }
    }

    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.left.open(ctx)?;
        self.right.open(ctx)?;
        let build_key = if self.build_left {
            self.left_key.clone()
        } else {
            self.right_key.clone()
        };
        let coerce = self.coerce_real;
        loop {
            ctx.check()?;
            let row = match self.build_side().next(ctx)? {
                None => break,
                Some(row) => row,
            };
            let key_value = eval(&build_key, &row, &ctx.params)?;
            let idx = self.build_rows.len();
            self.build_rows.push(row);
            self.build_matched.push(false);
            if let Some(key) = join_key(&key_value, coerce) {
                self.build_index.entry(key).or_default().push(idx);
            }
        }
        self.pending.clear();
        self.probe_done = false;
        self.drain_idx = 0;
        Ok(())
    }

    fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            if self.probe_done {
                // LeftOuter with the left side built: emit its unmatched
                // rows, null-extended on the right.
                if self.kind == JoinKind::LeftOuter && self.build_left {
                    while self.drain_idx < self.build_rows.len() {
                        let idx = self.drain_idx;
                        self.drain_idx += 1;
                        if !self.build_matched[idx] {
                            let mut row = self.build_rows[idx].clone();
                            row.extend(std::iter::repeat(Value::Null).take(self.right_width));
                            return Ok(Some(row));
                        }
                    }
                }
                return Ok(None);
            }
            ctx.check()?;
            let (probe_key_expr, probe_side_is_left) = if self.build_left {
                (self.right_key.clone(), false)
            } else {
                (self.left_key.clone(), true)
            };
            let probe_row = {
                let probe = if probe_side_is_left {
                    &mut self.left
                } else {
                    &mut self.right
                };
                probe.next(ctx)?
            };
            let probe_row = match probe_row {
                None => {
                    self.probe_done = true;
                    continue;
                }
                Some(row) => row,
            };
            let key_value = eval(&probe_key_expr, &probe_row, &ctx.params)?;
            let matches = join_key(&key_value, self.coerce_real)
                .and_then(|key| self.build_index.get(&key))
                .cloned()
                .unwrap_or_default();
            if matches.is_empty() {
                // LeftOuter preserving the probe (left) side.
                if self.kind == JoinKind::LeftOuter && !self.build_left {
                    let mut row = probe_row;
                    row.extend(std::iter::repeat(Value::Null).take(self.right_width));
                    return Ok(Some(row));
                }
                continue;
            }
            for idx in matches {
                self.build_matched[idx] = true;
                let mut combined = Vec::with_capacity(self.left_width + self.right_width);
                if self.build_left {
                    combined.extend(self.build_rows[idx].iter().cloned());
                    combined.extend(probe_row.iter().cloned());
                } else {
                    combined.extend(probe_row.iter().cloned());
                    combined.extend(self.build_rows[idx].iter().cloned());
                }
                self.pending.push_back(combined);
            }
        }
    }
}

pub struct MergeJoinOp {
    left_key: BoundExpr,
    right_key: BoundExpr,
    left: Box<Operator>,
    right: Box<Operator>,
    left_row: Option<Row>,
    left_exhausted: bool,
    /// Current run of right rows sharing one key value.
    run: Vec<Row>,
    run_key: Option<Value>,
    run_idx: usize,
    lookahead: Option<Row>,
    right_exhausted: bool,
}

impl MergeJoinOp {
    fn advance_left(&mut self, ctx: &ExecContext) -> Result<()> {
        self.left_row = self.left.next(ctx)?;
        if self.left_row.is_none() {
            self.left_exhausted = true;
        }
        Ok(())
    }

    fn next_right(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        if let Some(row) = self.lookahead.take() {
            return Ok(Some(row));
        }
        if self.right_exhausted {
            return Ok(None);
        }
        let row = self.right.next(ctx)?;
        if row.is_none() {
            self.right_exhausted = true;
        }
        Ok(row)
    }

    /// Load the run of right rows whose key equals the first key ≥
    /// `target`.
    fn load_run_at_least(&mut self, ctx: &ExecContext, target: &Value) -> Result<()> {
        loop {
            let row = match self.next_right(ctx)? {
                None => {
                    self.run.clear();
                    self.run_key = None;
                    return Ok(());
                }
                Some(row) => row,
            };
            let key = eval(&self.right_key, &row, &ctx.params)?;
            if key.is_null() {
                continue;
            }
            if key.sort_cmp(target) == std::cmp::Ordering::Less {
                continue;
            }
            // Collect the full run for this key.
            self.run.clear();
            self.run_idx = 0;
            self.run.push(row);
            loop {
                let peek = match self.next_right(ctx)? {
                    None => break,
                    Some(row) => row,
                };
                let peek_key = eval(&self.right_key, &peek, &ctx.params)?;
                if !peek_key.is_null() && peek_key.sort_cmp(&key) == std::cmp::Ordering::Equal {
                    self.run.push(peek);
                } else {
                    self.lookahead = Some(peek);
                    break;
                }
            }
            self.run_key = Some(key);
            return Ok(());
        }
    }

    fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        if self.left_row.is_none() && !self.left_exhausted {
            self.advance_left(ctx)?;
        }
        loop {
            ctx.check()?;
            let left_row = match &self.left_row {
                None => return Ok(None),
                Some(row) => row.clone(),
            };
            let left_key = eval(&self.left_key, &left_row, &ctx.params)?;
            if left_key.is_null() {
                self.advance_left(ctx)?;
                continue;
            }
            let run_cmp = match &self.run_key {
                Some(run_key) => Some(left_key.sort_cmp(run_key)),
                None => None,
            };
            match run_cmp {
                Some(std::cmp::Ordering::Equal) => {
                    if self.run_idx < self.run.len() {
                        let idx = self.run_idx;
                        self.run_idx += 1;
                        let mut combined = left_row;
                        combined.extend(self.run[idx].iter().cloned());
                        return Ok(Some(combined));
                    }
                    // Run consumed for this left row; the next left row
                    // may share the key.
                    self.run_idx = 0;
                    self.advance_left(ctx)?;
                }
                Some(std::cmp::Ordering::Less) => {
                    self.advance_left(ctx)?;
                }
                Some(std::cmp::Ordering::Greater) | None => {
                    self.load_run_at_least(ctx, &left_key)?;
                    if self.run_key.is_none() {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

enum AggState {
    Count(i64),
    SumInt(Option<i64>),
    SumReal(Option<f64>),
    Avg { sum: f64, count: i64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl AggState {
    fn new(func: AggFunc, arg: &Option<BoundExpr>) -> AggState {
        match func {
            AggFunc::CountStar | AggFunc::Count => AggState::Count(0),
            AggFunc::Sum => match arg.as_ref().and_then(|a| a.ty()) {
                Some(DataType::Real) => AggState::SumReal(None),
                _ => AggState::SumInt(None),
            },
            AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggFunc::Min => AggState::Min(None),
            AggFunc::Max => AggState::Max(None),
        }
    }

    fn update(&mut self, value: Option<Value>) -> Result<()> {
        match self {
            AggState::Count(n) => match value {
                // COUNT(*) counts rows; COUNT(expr) skips NULLs.
                None => *n += 1,
                Some(v) if !v.is_null() => *n += 1,
                _ => {}
            },
            AggState::SumInt(acc) => {
                if let Some(Value::Integer(i)) = value {
                    let current = acc.unwrap_or(0);
                    *acc = Some(current.checked_add(i).ok_or_else(|| {
                        DbError::Overflow("SUM".into())
                    })?);
                }
            }
            AggState::SumReal(acc) => match value {
                Some(Value::Real(r)) => *acc = Some(acc.unwrap_or(0.0) + r),
                Some(Value::Integer(i)) => *acc = Some(acc.unwrap_or(0.0) + i as f64),
                _ => {}
            },
            AggState::Avg { sum, count } => match value {
                Some(Value::Real(r)) => {
                    *sum += r;
                    *count += 1;
                }
                Some(Value::Integer(i)) => {
                    *sum += i as f64;
                    *count += 1;
                }
                _ => {}
            },
            AggState::Min(current) => {
                let is_min = true;
                if let Some(v) = value {
                    if !v.is_null() {
                        let replace = match current {
                            None => true,
                            Some(best) => {
                                let ord = v.compare(best)?;
                                if is_min {
                                    ord == std::cmp::Ordering::Less
                                } else {
                                    ord == std::cmp::Ordering::Greater
                                }
                            }
                        };
                        if replace {
                            *self = if is_min {
                                AggState::Min(Some(v))
                            } else {
                                AggState::Max(Some(v))
                            };
                        }
                    }
                }
            }
            AggState::Max(current) => {
                let is_min = false;
                if let Some(v) = value {
                    if !v.is_null() {
                        let replace = match current {
                            None => true,
                            Some(best) => {
                                let ord = v.compare(best)?;
                                if is_min {
                                    ord == std::cmp::Ordering::Less
                                } else {
                                    ord == std::cmp::Ordering::Greater
                                }
                            }
                        };
                        if replace {
                            *self = if is_min {
                                AggState::Min(Some(v))
                            } else {
                                AggState::Max(Some(v))
                            };
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize(self) -> Value {
        match self {
            AggState::Count(n) => Value::Integer(n),
            AggState::SumInt(acc) => acc.map(Value::Integer).unwrap_or(Value::Null),
            AggState::SumReal(acc) => acc.map(Value::Real).unwrap_or(Value::Null),
            AggState::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Real(sum / count as f64)
                }
            }
            AggState::Min(v) | AggState::Max(v) => v.unwrap_or(Value::Null),
        }
    }
}

pub struct HashAggregateOp {
    group_by: Vec<BoundExpr>,
    aggs: Vec<(AggFunc, Option<BoundExpr>)>,
    child: Option<Box<Operator>>,
    groups: Vec<(Vec<Value>, Vec<AggState>)>,
    emit_idx: usize,
}

impl HashAggregateOp {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.groups.clear();
        self.emit_idx = 0;
        let mut index: HashMap<Vec<KeyPart>, usize> = HashMap::new();
        if let Some(child) = &mut self.child {
            child.open(ctx)?;
            while let Some(row) = child.next(ctx)? {
                ctx.check()?;
                let mut key_values = Vec::with_capacity(self.group_by.len());
                for expr in &self.group_by {
                    key_values.push(eval(expr, &row, &ctx.params)?);
                }
                let key: Vec<KeyPart> = key_values.iter().map(group_key).collect();
                let group_idx = match index.get(&key) {
                    Some(&idx) => idx,
                    None => {
                        let states = self
                            .aggs
                            .iter()
                            .map(|(func, arg)| AggState::new(*func, arg))
                            .collect();
                        self.groups.push((key_values, states));
                        index.insert(key, self.groups.len() - 1);
                        self.groups.len() - 1
                    }
                };
                let states = &mut self.groups[group_idx].1;
                for (state, (_, arg)) in states.iter_mut().zip(&self.aggs) {
                    let value = match arg {
                        None => None,
                        Some(expr) => Some(eval(expr, &row, &ctx.params)?),
                    };
                    state.update(value)?;
                }
            }
        }
        // A grand aggregate (no GROUP BY) yields one row even over an
        // empty input.
        if self.group_by.is_empty() && self.groups.is_empty() {
            let states = self
                .aggs
                .iter()
                .map(|(func, arg)| AggState::new(*func, arg))
                .collect();
            self.groups.push((Vec::new(), states));
        }
        Ok(())
    }

    fn next(&mut self, _ctx: &ExecContext) -> Result<Option<Row>> {
        if self.emit_idx >= self.groups.len() {
            return Ok(None);
        }
        let (keys, states) = std::mem::replace(
            &mut self.groups[self.emit_idx],
            (Vec::new(), Vec::new()),
        );
        self.emit_idx += 1;
        let mut row = keys;
        for state in states {
            row.push(state.finalize());
        }
        Ok(Some(row))
    }
}

pub struct SortOp {
    keys: Vec<(BoundExpr, bool)>,
    child: Box<Operator>,
    output: Option<SortedRows>,
}

impl SortOp {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.child.open(ctx)?;
        let desc: Vec<bool> = self.keys.iter().map(|(_, d)| *d).collect();
        let mut sorter = Sorter::new(SortConfig::default(), desc);
        while let Some(row) = self.child.next(ctx)? {
            ctx.check()?;
            let mut keys = Vec::with_capacity(self.keys.len());
            for (expr, _) in &self.keys {
                keys.push(eval(expr, &row, &ctx.params)?);
            }
            sorter.push(keys, row)?;
        }
        self.output = Some(sorter.finish()?);
        Ok(())
    }
}

pub struct LimitOp {
    limit: Option<u64>,
    offset: u64,
    child: Box<Operator>,
    skipped: u64,
    emitted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Column};
    use crate::execution::executor::run_select_plan;
    use crate::execution::plan::PhysicalPlan;
    use crate::storage::buffer::BufferPool;
    use crate::storage::disk::DiskManager;
    use crate::storage::space::SpaceManager;
    use crate::transaction::lock_manager::LockManager;
    use crate::transaction::TransactionManager;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    struct Fixture {
        catalog: Arc<Catalog>,
        txns: Arc<TransactionManager>,
    }

    fn fixture(dir: &tempfile::TempDir) -> Fixture {
        let disk = Arc::new(DiskManager::open(dir.path().join("op.adb"), 4096).unwrap());
        let buffer = Arc::new(BufferPool::new(32, Arc::clone(&disk)));
        let space = Arc::new(SpaceManager::new(Arc::clone(&disk)));
        let catalog = Arc::new(
            Catalog::open(
                Arc::clone(&disk),
                Arc::clone(&buffer),
                Arc::clone(&space),
                deadline(),
            )
            .unwrap(),
        );
        let locks = Arc::new(LockManager::new());
        let txns = Arc::new(TransactionManager::new(locks, buffer, disk));
        Fixture { catalog, txns }
    }

    fn ctx(f: &Fixture) -> ExecContext {
        let txn_id = f.txns.begin(IsolationLevel::ReadCommitted);
        ExecContext {
            txn_id,
            isolation: IsolationLevel::ReadCommitted,
            catalog: Arc::clone(&f.catalog),
            locks: Arc::clone(f.txns.lock_manager()),
            txns: Arc::clone(&f.txns),
            deadline: deadline(),
            cancelled: Arc::new(AtomicBool::new(false)),
            params: Vec::new(),
        }
    }

    fn int_col(offset: usize, name: &str) -> BoundExpr {
        BoundExpr::Column {
            offset,
            ty: DataType::Integer,
            nullable: true,
            name: name.to_string(),
        }
    }

    fn scan_plan(table: &crate::catalog::TableInfo) -> Plan {
        Plan {
            op: PlanOp::SeqScan {
                table: table.clone(),
                predicate: None,
            },
            children: Vec::new(),
            rows: table.row_count as f64,
            cost: 1.0,
        }
    }

    /// Merge join streams matching runs from two sorted inputs,
    /// handling duplicate keys on both sides.
    #[test]
    fn test_merge_join_over_sorted_inputs() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        f.catalog
            .create_table("l", vec![Column::new("k", DataType::Integer)], deadline())
            .unwrap();
        f.catalog
            .create_table(
                "r",
                vec![
                    Column::new("k", DataType::Integer),
                    Column::new("v", DataType::Integer),
                ],
                deadline(),
            )
            .unwrap();
        let l = f.catalog.get_table("l").unwrap();
        let r = f.catalog.get_table("r").unwrap();
        let l_heap = f.catalog.table_heap("l", deadline()).unwrap();
        let r_heap = f.catalog.table_heap("r", deadline()).unwrap();
        for k in [1i64, 2, 2, 5] {
            l_heap.insert(&l.columns, &[Value::Integer(k)], deadline()).unwrap();
        }
        for (k, v) in [(2i64, 20i64), (2, 21), (3, 30), (5, 50)] {
            r_heap
                .insert(&r.columns, &[Value::Integer(k), Value::Integer(v)], deadline())
                .unwrap();
        }

        let sort = |input: Plan, key: BoundExpr| Plan {
            rows: input.rows,
            cost: input.cost,
            op: PlanOp::Sort {
                keys: vec![(key, false)],
            },
            children: vec![input],
        };
        let join = Plan {
            op: PlanOp::MergeJoin {
                kind: JoinKind::Inner,
                left_key: int_col(0, "k"),
                right_key: int_col(0, "k"),
            },
            children: vec![
                sort(scan_plan(&l), int_col(0, "k")),
                sort(scan_plan(&r), int_col(0, "k")),
            ],
            rows: 4.0,
            cost: 4.0,
        };
        let plan = PhysicalPlan {
            root: Plan {
                rows: 4.0,
                cost: 5.0,
                op: PlanOp::Project {
                    exprs: vec![
                        (int_col(0, "k"), "k".into()),
                        (int_col(2, "v"), "v".into()),
                    ],
                },
                children: vec![join],
            },
            output: vec![
                ("k".into(), Some(DataType::Integer)),
                ("v".into(), Some(DataType::Integer)),
            ],
            schema_version: f.catalog.schema_version(),
        };

        let ctx = ctx(&f);
        let result = run_select_plan(&plan, &ctx).unwrap();
        // 2 left rows with k=2 each match 2 right rows, plus 5↔50.
        let mut pairs: Vec<(i64, i64)> = result
            .rows
            .iter()
            .map(|row| match (&row[0], &row[1]) {
                (Value::Integer(a), Value::Integer(b)) => (*a, *b),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        pairs.sort_unstable();
        assert_eq!(pairs, vec![(2, 20), (2, 20), (2, 21), (2, 21), (5, 50)]);
        f.txns.rollback(ctx.txn_id, &f.catalog, deadline()).unwrap();
    }

    /// Cancellation surfaces between `next` calls.
    #[test]
    fn test_cancel_flag_aborts_execution() {
        let dir = tempdir().unwrap();
        let f = fixture(&dir);
        f.catalog
            .create_table("t", vec![Column::new("x", DataType::Integer)], deadline())
            .unwrap();
        let t = f.catalog.get_table("t").unwrap();
        let heap = f.catalog.table_heap("t", deadline()).unwrap();
        for i in 0..10 {
            heap.insert(&t.columns, &[Value::Integer(i)], deadline()).unwrap();
        }
        let mut ctx = ctx(&f);
        ctx.cancelled = Arc::new(AtomicBool::new(true));
        let plan = PhysicalPlan {
            root: scan_plan(&t),
            output: vec![("x".into(), Some(DataType::Integer))],
            schema_version: f.catalog.schema_version(),
        };
        assert!(matches!(
            run_select_plan(&plan, &ctx),
            Err(DbError::Cancelled)
        ));
    }
}
