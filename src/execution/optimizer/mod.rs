// Cost-based optimizer: logical rewrites to fixpoint, predicate and
// projection placement, left-deep join enumeration (dynamic programming
// up to six tables, greedy beyond), and physical operator selection.
//
// Join reordering only happens when every join is inner; outer joins
// are planned in FROM order with their ON conditions intact, and WHERE
// stays above them so null-extended rows filter correctly.

pub mod cost_model;
pub mod rules;

use crate::common::DataType;
use crate::error::{DbError, Result};
use crate::execution::plan::{PhysicalPlan, Plan, PlanOp};
use crate::sql::ast::JoinKind;
use crate::sql::resolver::{BoundExpr, BoundSelect};
use std::collections::HashMap;

/// Largest FROM-list that gets exhaustive dynamic-programming join
/// enumeration; beyond this the greedy heuristic takes over.
pub const DP_TABLE_LIMIT: usize = 6;

pub fn optimize(select: &BoundSelect, schema_version: u32) -> Result<PhysicalPlan> {
    Optimizer::new(select)?.run(schema_version)
}

struct Optimizer<'a> {
    select: &'a BoundSelect,
    /// Flat FROM-order base offset of each table.
    from_base: Vec<usize>,
    /// Physical base offset of each table once join order is chosen.
    phys_base: Vec<usize>,
}

/// A predicate together with the set of tables it references.
struct PooledPred {
    expr: BoundExpr,
    tables: Vec<usize>,
}

impl<'a> Optimizer<'a> {
    fn new(select: &'a BoundSelect) -> Result<Self> {
        let mut from_base = Vec::with_capacity(select.tables.len());
        let mut offset = 0;
        for table in &select.tables {
            from_base.push(offset);
            offset += table.width();
        }
        Ok(Self {
            select,
            phys_base: from_base.clone(),
            from_base,
        })
    }

    fn run(mut self, schema_version: u32) -> Result<PhysicalPlan> {
        if self.select.tables.is_empty() {
            return self.constant_select(schema_version);
        }
        let all_inner = self
            .select
            .joins
            .iter()
            .all(|j| j.kind == JoinKind::Inner);

        let mut plan = if all_inner {
            self.plan_inner_joins()?
        } else {
            self.plan_in_from_order()?
        };

        // Aggregation rewires every expression above it.
        let mut items: Vec<(BoundExpr, String)> = self.select.items.clone();
        let mut order_by: Vec<(BoundExpr, bool)> = self.select.order_by.clone();
        let mut having = self.select.having.clone();
        for (expr, _) in items.iter_mut() {
            *expr = rules::rewrite(expr.clone())?;
        }
        for (expr, _) in order_by.iter_mut() {
            *expr = rules::rewrite(expr.clone())?;
        }
        if let Some(h) = having.take() {
            having = Some(rules::rewrite(h)?);
        }

        if self.select.has_aggregates {
            // The same rewrite runs on the group list so structural
            // matching against items stays exact.
            let group_flat: Vec<BoundExpr> = self
                .select
                .group_by
                .iter()
                .map(|g| rules::rewrite(g.clone()))
                .collect::<Result<Vec<_>>>()?;
            let mut aggs_flat: Vec<BoundExpr> = Vec::new();
            for (expr, _) in &items {
                collect_aggregates(expr, &mut aggs_flat);
            }
            if let Some(h) = &having {
                collect_aggregates(h, &mut aggs_flat);
            }
            for (expr, _) in &order_by {
                collect_aggregates(expr, &mut aggs_flat);
            }

            let group_phys: Vec<BoundExpr> = group_flat
                .iter()
                .map(|g| self.to_phys(g.clone()))
                .collect();
            let agg_descr = aggs_flat
                .iter()
                .map(|a| match a {
                    BoundExpr::Aggregate { func, arg } => (
                        *func,
                        arg.as_ref().map(|arg| self.to_phys((**arg).clone())),
                    ),
                    _ => unreachable!(),
                })
                .collect::<Vec<_>>();

            let input_rows = plan.rows;
            let groups = cost_model::group_count(input_rows, group_phys.len());
            let cost = cost_model::aggregate_cost(plan.cost, input_rows, groups);
            plan = Plan {
                op: PlanOp::HashAggregate {
                    group_by: group_phys,
                    aggs: agg_descr,
                },
                children: vec![plan],
                rows: groups,
                cost,
            };

            // Above the aggregate, expressions address [groups ++ aggs].
            for (expr, _) in items.iter_mut() {
                *expr = rewrite_over_aggregate(expr.clone(), &group_flat, &aggs_flat)?;
            }
            if let Some(h) = having.take() {
                let rewritten = rewrite_over_aggregate(h, &group_flat, &aggs_flat)?;
                let selectivity = cost_model::selectivity(&rewritten);
                plan = Plan {
                    rows: (plan.rows * selectivity).max(0.0),
                    cost: plan.cost + plan.rows,
                    op: PlanOp::Filter {
                        predicate: rewritten,
                    },
                    children: vec![plan],
                };
            }
            for (expr, _) in order_by.iter_mut() {
                *expr = rewrite_over_aggregate(expr.clone(), &group_flat, &aggs_flat)?;
            }
        } else {
            for (expr, _) in items.iter_mut() {
                *expr = self.to_phys(expr.clone());
            }
            for (expr, _) in order_by.iter_mut() {
                *expr = self.to_phys(expr.clone());
            }
        }

        let output: Vec<(String, Option<DataType>)> = items
            .iter()
            .map(|(expr, name)| (name.clone(), expr.ty()))
            .collect();

        plan = self.finish(plan, items, order_by)?;

        Ok(PhysicalPlan {
            root: plan,
            output,
            schema_version,
        })
    }

    /// SELECT without FROM: a single projected row.
    fn constant_select(self, schema_version: u32) -> Result<PhysicalPlan> {
        let mut items = self.select.items.clone();
        for (expr, _) in items.iter_mut() {
            *expr = rules::rewrite(expr.clone())?;
        }
        let output = items
            .iter()
            .map(|(expr, name)| (name.clone(), expr.ty()))
            .collect();
        // Project over a Limit-less empty scan is meaningless here;
        // model it as a one-row aggregate with no groups and no inputs.
        let base = Plan {
            op: PlanOp::HashAggregate {
                group_by: Vec::new(),
                aggs: Vec::new(),
            },
            children: Vec::new(),
            rows: 1.0,
            cost: 1.0,
        };
        let plan = Plan {
            rows: 1.0,
            cost: base.cost + 1.0,
            op: PlanOp::Project { exprs: items },
            children: vec![base],
        };
        Ok(PhysicalPlan {
            root: plan,
            output,
            schema_version,
        })
    }

    /// Sort / project / distinct / limit tail, ordered so DISTINCT
    /// never destroys an ORDER BY.
    fn finish(
        &self,
        mut plan: Plan,
        items: Vec<(BoundExpr, String)>,
        order_by: Vec<(BoundExpr, bool)>,
    ) -> Result<Plan> {
        if !self.select.distinct {
            if !order_by.is_empty() {
                let cost = cost_model::sort_cost(plan.cost, plan.rows);
                plan = Plan {
                    rows: plan.rows,
                    cost,
                    op: PlanOp::Sort { keys: order_by },
                    children: vec![plan],
                };
            }
            plan = Plan {
                rows: plan.rows,
                cost: plan.cost + plan.rows,
                op: PlanOp::Project { exprs: items },
                children: vec![plan],
            };
        } else {
            // Project first, de-duplicate over the projected row, then
            // sort by select-list position.
            let projected: Vec<BoundExpr> = items
                .iter()
                .enumerate()
                .map(|(i, (expr, name))| BoundExpr::Column {
                    offset: i,
                    ty: expr.ty().unwrap_or(DataType::Text),
                    nullable: true,
                    name: name.clone(),
                })
                .collect();
            let mut sort_keys = Vec::with_capacity(order_by.len());
            for (expr, desc) in &order_by {
                let idx = items
                    .iter()
                    .position(|(item, _)| item == expr)
                    .ok_or_else(|| {
                        DbError::Semantic(
                            "ORDER BY with DISTINCT must name a select-list expression".into(),
                        )
                    })?;
                sort_keys.push((projected[idx].clone(), *desc));
            }
            plan = Plan {
                rows: plan.rows,
                cost: plan.cost + plan.rows,
                op: PlanOp::Project { exprs: items },
                children: vec![plan],
            };
            let groups = plan.rows.max(1.0) * 0.9;
            plan = Plan {
                cost: cost_model::aggregate_cost(plan.cost, plan.rows, groups),
                rows: groups,
                op: PlanOp::HashAggregate {
                    group_by: projected,
                    aggs: Vec::new(),
                },
                children: vec![plan],
            };
            if !sort_keys.is_empty() {
                let cost = cost_model::sort_cost(plan.cost, plan.rows);
                plan = Plan {
                    rows: plan.rows,
                    cost,
                    op: PlanOp::Sort { keys: sort_keys },
                    children: vec![plan],
                };
            }
        }

        if self.select.limit.is_some() || self.select.offset.is_some() {
            let limit = self.select.limit;
            let offset = self.select.offset.unwrap_or(0);
            let rows = match limit {
                Some(n) => plan.rows.min(n as f64),
                None => plan.rows,
            };
            plan = Plan {
                rows,
                cost: plan.cost,
                op: PlanOp::Limit { limit, offset },
                children: vec![plan],
            };
        }
        Ok(plan)
    }

    // ---- inner-join planning with pushdown and reordering ----

    fn plan_inner_joins(&mut self) -> Result<Plan> {
        let ntables = self.select.tables.len();

        // Pool every conjunct from WHERE and from inner ON conditions.
        let mut pool: Vec<PooledPred> = Vec::new();
        let mut conjuncts = Vec::new();
        if let Some(filter) = &self.select.filter {
            rules::split_conjuncts(rules::rewrite(filter.clone())?, &mut conjuncts);
        }
        for join in &self.select.joins {
            if let Some(on) = &join.on {
                rules::split_conjuncts(rules::rewrite(on.clone())?, &mut conjuncts);
            }
        }
        // Folded tautologies filter nothing.
        conjuncts.retain(|c| !matches!(c, BoundExpr::Literal(crate::common::Value::Boolean(true))));
        let mut scan_preds: Vec<Vec<BoundExpr>> = vec![Vec::new(); ntables];
        for conjunct in conjuncts {
            let tables = self.tables_of(&conjunct);
            match tables.len() {
                0 => pool.push(PooledPred {
                    expr: conjunct,
                    tables,
                }),
                1 => scan_preds[tables[0]].push(conjunct),
                _ => pool.push(PooledPred {
                    expr: conjunct,
                    tables,
                }),
            }
        }

        // Scan estimates after pushdown.
        let mut scan_rows = Vec::with_capacity(ntables);
        for (t, preds) in scan_preds.iter().enumerate() {
            let base = self.select.tables[t].info.row_count as f64;
            let sel: f64 = preds.iter().map(cost_model::selectivity).product();
            scan_rows.push((base * sel).max(0.0));
        }

        let order = if ntables == 1 {
            vec![0]
        } else if ntables <= DP_TABLE_LIMIT {
            self.dp_order(&scan_rows, &pool)
        } else {
            self.greedy_order(&scan_rows, &pool)
        };

        // Physical layout follows the chosen order.
        let mut next_base = 0;
        for &t in &order {
            self.phys_base[t] = next_base;
            next_base += self.select.tables[t].width();
        }

        let mut applied = vec![false; pool.len()];
        let mut in_plan = vec![false; ntables];
        let mut plan = self.scan_plan(order[0], &scan_preds[order[0]], scan_rows[order[0]]);
        in_plan[order[0]] = true;

        for &t in order.iter().skip(1) {
            let scan = self.scan_plan(t, &scan_preds[t], scan_rows[t]);
            in_plan[t] = true;

            // Predicates now fully covered.
            let mut join_preds: Vec<usize> = Vec::new();
            for (i, pred) in pool.iter().enumerate() {
                if applied[i] {
                    continue;
                }
                if pred.tables.iter().all(|&pt| in_plan[pt]) {
                    join_preds.push(i);
                    applied[i] = true;
                }
            }

            // Prefer a hash join on an equi-conjunct that bridges the
            // accumulated side and the new table.
            let equi = join_preds.iter().copied().find(|&i| {
                self.equi_bridge(&pool[i].expr, t, &in_plan).is_some()
            });

            let sel: f64 = join_preds
                .iter()
                .map(|&i| cost_model::selectivity(&pool[i].expr))
                .product();
            let out_rows = (plan.rows * scan.rows * sel).max(0.0);

            plan = match equi {
                Some(eq_idx) => {
                    let (left_side, right_side) =
                        self.equi_bridge(&pool[eq_idx].expr, t, &in_plan).unwrap();
                    let left_key = self.to_phys(left_side);
                    let mut right_key = right_side;
                    let base = self.from_base[t];
                    right_key.remap_columns(&move |o| o - base);
                    let build_left = plan.rows <= scan.rows;
                    let cost =
                        cost_model::hash_join_cost(plan.cost, plan.rows, scan.cost, scan.rows);
                    let mut joined = Plan {
                        op: PlanOp::HashJoin {
                            kind: JoinKind::Inner,
                            left_key,
                            right_key,
                            build_left,
                        },
                        children: vec![plan, scan],
                        rows: out_rows,
                        cost,
                    };
                    // Residual predicates become a filter on top.
                    let residual: Vec<BoundExpr> = join_preds
                        .iter()
                        .copied()
                        .filter(|&i| i != eq_idx)
                        .map(|i| self.to_phys(pool[i].expr.clone()))
                        .collect();
                    if let Some(predicate) = rules::join_conjuncts(residual) {
                        joined = Plan {
                            rows: joined.rows,
                            cost: joined.cost + joined.rows,
                            op: PlanOp::Filter { predicate },
                            children: vec![joined],
                        };
                    }
                    joined
                }
                None => {
                    let on = rules::join_conjuncts(
                        join_preds
                            .iter()
                            .map(|&i| self.to_phys(pool[i].expr.clone()))
                            .collect(),
                    );
                    let cost = cost_model::nested_loop_cost(
                        plan.cost, plan.rows, scan.cost, scan.rows,
                    );
                    Plan {
                        op: PlanOp::NestedLoopJoin {
                            kind: JoinKind::Inner,
                            on,
                        },
                        children: vec![plan, scan],
                        rows: out_rows,
                        cost,
                    }
                }
            };
        }

        // Anything still unapplied (e.g. parameter-only predicates, or
        // any predicate on a single-table query that reached the pool)
        // filters the final result.
        let leftover: Vec<BoundExpr> = pool
            .iter()
            .enumerate()
            .filter(|(i, _)| !applied[*i])
            .map(|(_, p)| self.to_phys(p.expr.clone()))
            .collect();
        if let Some(predicate) = rules::join_conjuncts(leftover) {
            let sel = cost_model::selectivity(&predicate);
            plan = Plan {
                rows: (plan.rows * sel).max(0.0),
                cost: plan.cost + plan.rows,
                op: PlanOp::Filter { predicate },
                children: vec![plan],
            };
        }
        Ok(plan)
    }

    /// Plan without reordering or pushdown; required when outer joins
    /// are present. The physical layout equals the FROM layout.
    fn plan_in_from_order(&mut self) -> Result<Plan> {
        let mut plan = self.scan_plan(0, &[], self.select.tables[0].info.row_count as f64);
        for (i, join) in self.select.joins.iter().enumerate() {
            let t = i + 1;
            let scan = self.scan_plan(t, &[], self.select.tables[t].info.row_count as f64);
            let on = match &join.on {
                Some(on) => Some(rules::rewrite(on.clone())?),
                None => None,
            };
            let sel = on.as_ref().map(cost_model::selectivity).unwrap_or(1.0);
            let mut rows = (plan.rows * scan.rows * sel).max(0.0);
            // An outer join preserves at least its outer side.
            match join.kind {
                JoinKind::LeftOuter => rows = rows.max(plan.rows),
                JoinKind::RightOuter => rows = rows.max(scan.rows),
                JoinKind::Inner => {}
            }
            let cost = cost_model::nested_loop_cost(plan.cost, plan.rows, scan.cost, scan.rows);
            plan = Plan {
                op: PlanOp::NestedLoopJoin {
                    kind: join.kind,
                    on,
                },
                children: vec![plan, scan],
                rows,
                cost,
            };
        }
        if let Some(filter) = &self.select.filter {
            let predicate = rules::rewrite(filter.clone())?;
            if !matches!(
                predicate,
                BoundExpr::Literal(crate::common::Value::Boolean(true))
            ) {
                let sel = cost_model::selectivity(&predicate);
                plan = Plan {
                    rows: (plan.rows * sel).max(0.0),
                    cost: plan.cost + plan.rows,
                    op: PlanOp::Filter { predicate },
                    children: vec![plan],
                };
            }
        }
        Ok(plan)
    }

    fn scan_plan(&self, t: usize, preds: &[BoundExpr], est_rows: f64) -> Plan {
        let table = self.select.tables[t].info.clone();
        let base = self.from_base[t];
        let predicate = rules::join_conjuncts(
            preds
                .iter()
                .cloned()
                .map(|mut p| {
                    p.remap_columns(&move |o| o - base);
                    p
                })
                .collect(),
        );
        let table_rows = table.row_count as f64;
        Plan {
            op: PlanOp::SeqScan { table, predicate },
            children: Vec::new(),
            rows: est_rows,
            cost: cost_model::scan_cost(table_rows),
        }
    }

    /// If `expr` is `a = b` with one side entirely over tables already
    /// in the plan and the other entirely over table `t`, return
    /// (plan-side key, t-side key) in flat offsets.
    fn equi_bridge(
        &self,
        expr: &BoundExpr,
        t: usize,
        in_plan: &[bool],
    ) -> Option<(BoundExpr, BoundExpr)> {
        if let BoundExpr::Binary {
            op: crate::sql::ast::BinaryOp::Eq,
            left,
            right,
        } = expr
        {
            let lt = self.tables_of(left);
            let rt = self.tables_of(right);
            if lt.is_empty() || rt.is_empty() {
                return None;
            }
            let l_in_plan = lt.iter().all(|&x| in_plan[x] && x != t);
            let r_is_t = rt.iter().all(|&x| x == t);
            if l_in_plan && r_is_t {
                return Some(((**left).clone(), (**right).clone()));
            }
            let r_in_plan = rt.iter().all(|&x| in_plan[x] && x != t);
            let l_is_t = lt.iter().all(|&x| x == t);
            if r_in_plan && l_is_t {
                return Some(((**right).clone(), (**left).clone()));
            }
        }
        None
    }

    /// Distinct FROM-table indices an expression references.
    fn tables_of(&self, expr: &BoundExpr) -> Vec<usize> {
        let mut offsets = Vec::new();
        expr.collect_columns(&mut offsets);
        let mut tables: Vec<usize> = offsets
            .into_iter()
            .map(|o| self.table_of_offset(o))
            .collect();
        tables.sort_unstable();
        tables.dedup();
        tables
    }

    fn table_of_offset(&self, offset: usize) -> usize {
        for (t, &base) in self.from_base.iter().enumerate().rev() {
            if offset >= base {
                return t;
            }
        }
        0
    }

    /// Rewrite flat FROM offsets into the chosen physical layout.
    fn to_phys(&self, mut expr: BoundExpr) -> BoundExpr {
        let from_base = self.from_base.clone();
        let phys_base = self.phys_base.clone();
        let table_of = move |o: usize| {
            let mut t = 0;
            for (i, &base) in from_base.iter().enumerate() {
                if o >= base {
                    t = i;
                }
            }
            phys_base[t] + (o - from_base[t])
        };
        expr.remap_columns(&table_of);
        expr
    }

    fn dp_order(&self, scan_rows: &[f64], pool: &[PooledPred]) -> Vec<usize> {
        let n = scan_rows.len();
        #[derive(Clone)]
        struct Entry {
            rows: f64,
            cost: f64,
            order: Vec<usize>,
        }
        let mut best: HashMap<u32, Entry> = HashMap::new();
        for t in 0..n {
            best.insert(
                1 << t,
                Entry {
                    rows: scan_rows[t],
                    cost: cost_model::scan_cost(scan_rows[t]),
                    order: vec![t],
                },
            );
        }
        for size in 2..=n {
            let masks: Vec<u32> = (1u32..(1 << n))
                .filter(|m| m.count_ones() as usize == size)
                .collect();
            for mask in masks {
                let mut candidate: Option<Entry> = None;
                for t in 0..n {
                    if mask & (1 << t) == 0 {
                        continue;
                    }
                    let prev_mask = mask & !(1 << t);
                    let prev = match best.get(&prev_mask) {
                        Some(entry) => entry.clone(),
                        None => continue,
                    };
                    let sel = self.connecting_selectivity(pool, prev_mask, t);
                    let rows = (prev.rows * scan_rows[t] * sel).max(0.0);
                    let cost = cost_model::hash_join_cost(
                        prev.cost,
                        prev.rows,
                        cost_model::scan_cost(scan_rows[t]),
                        scan_rows[t],
                    );
                    if candidate.as_ref().map_or(true, |c| cost < c.cost) {
                        let mut order = prev.order;
                        order.push(t);
                        candidate = Some(Entry { rows, cost, order });
                    }
                }
                if let Some(entry) = candidate {
                    best.insert(mask, entry);
                }
            }
        }
        best.remove(&((1u32 << n) - 1))
            .map(|e| e.order)
            .unwrap_or_else(|| (0..n).collect())
    }

    fn greedy_order(&self, scan_rows: &[f64], pool: &[PooledPred]) -> Vec<usize> {
        let n = scan_rows.len();
        let mut remaining: Vec<usize> = (0..n).collect();
        // Start from the smallest estimated input.
        remaining.sort_by(|&a, &b| scan_rows[a].total_cmp(&scan_rows[b]));
        let mut order = vec![remaining.remove(0)];
        let mut mask: u32 = 1 << order[0];
        let mut rows = scan_rows[order[0]];
        while !remaining.is_empty() {
            let (pos, _, next_rows) = remaining
                .iter()
                .enumerate()
                .map(|(pos, &t)| {
                    let sel = self.connecting_selectivity(pool, mask, t);
                    (pos, t, (rows * scan_rows[t] * sel).max(0.0))
                })
                .min_by(|a, b| a.2.total_cmp(&b.2))
                .unwrap();
            let t = remaining.remove(pos);
            order.push(t);
            mask |= 1 << t;
            rows = next_rows;
        }
        order
    }

    /// Combined selectivity of pool predicates that become applicable
    /// when `t` joins the set in `mask`.
    fn connecting_selectivity(&self, pool: &[PooledPred], mask: u32, t: usize) -> f64 {
        let new_mask = mask | (1 << t);
        pool.iter()
            .filter(|p| {
                !p.tables.is_empty()
                    && p.tables.iter().any(|&pt| pt == t)
                    && p.tables.iter().all(|&pt| new_mask & (1 << pt) != 0)
            })
            .map(|p| cost_model::selectivity(&p.expr))
            .product()
    }
}

fn collect_aggregates(expr: &BoundExpr, out: &mut Vec<BoundExpr>) {
    match expr {
        BoundExpr::Aggregate { .. } => {
            if !out.contains(expr) {
                out.push(expr.clone());
            }
        }
        BoundExpr::Unary { operand, .. } | BoundExpr::IsNull { operand, .. } => {
            collect_aggregates(operand, out)
        }
        BoundExpr::Binary { left, right, .. } => {
            collect_aggregates(left, out);
            collect_aggregates(right, out);
        }
        BoundExpr::Like {
            operand, pattern, ..
        } => {
            collect_aggregates(operand, out);
            collect_aggregates(pattern, out);
        }
        BoundExpr::Function { args, .. } => {
            for arg in args {
                collect_aggregates(arg, out);
            }
        }
        _ => {}
    }
}

/// Rewrite an expression so it addresses the aggregate's output layout
/// `[group exprs… , aggregates…]`. Matching is structural against the
/// pre-remap (flat) forms.
fn rewrite_over_aggregate(
    expr: BoundExpr,
    groups: &[BoundExpr],
    aggs: &[BoundExpr],
) -> Result<BoundExpr> {
    if let Some(idx) = groups.iter().position(|g| *g == expr) {
        return Ok(BoundExpr::Column {
            offset: idx,
            ty: expr.ty().unwrap_or(DataType::Text),
            nullable: true,
            name: expr.describe(),
        });
    }
    if let Some(idx) = aggs.iter().position(|a| *a == expr) {
        return Ok(BoundExpr::Column {
            offset: groups.len() + idx,
            ty: expr.ty().unwrap_or(DataType::Text),
            nullable: true,
            name: expr.describe(),
        });
    }
    Ok(match expr {
        BoundExpr::Unary { op, operand } => BoundExpr::Unary {
            op,
            operand: Box::new(rewrite_over_aggregate(*operand, groups, aggs)?),
        },
        BoundExpr::Binary { op, left, right } => BoundExpr::Binary {
            op,
            left: Box::new(rewrite_over_aggregate(*left, groups, aggs)?),
            right: Box::new(rewrite_over_aggregate(*right, groups, aggs)?),
        },
        BoundExpr::IsNull { operand, negated } => BoundExpr::IsNull {
            operand: Box::new(rewrite_over_aggregate(*operand, groups, aggs)?),
            negated,
        },
        BoundExpr::Like {
            operand,
            pattern,
            negated,
        } => BoundExpr::Like {
            operand: Box::new(rewrite_over_aggregate(*operand, groups, aggs)?),
            pattern: Box::new(rewrite_over_aggregate(*pattern, groups, aggs)?),
            negated,
        },
        BoundExpr::Function { func, args } => BoundExpr::Function {
            func,
            args: args
                .into_iter()
                .map(|a| rewrite_over_aggregate(a, groups, aggs))
                .collect::<Result<Vec<_>>>()?,
        },
        BoundExpr::Column { name, .. } => {
            return Err(DbError::AggregatePlacement(name));
        }
        leaf => leaf,
    })
}
