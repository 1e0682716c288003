// Statement executors. SELECT pulls rows through a volcano operator
// tree; INSERT/UPDATE/DELETE consume a row source and apply heap
// operations under X locks, logging before-images to the enclosing
// transaction; DDL runs under an exclusive database lock.
//
// Writes are two-phase: matching rows are collected and locked first,
// then mutated, so an update that relocates a row can never be seen
// again by its own scan.

use crate::catalog::TableInfo;
use crate::common::{RecordId, Row, Value};
use crate::error::{DbError, Result};
use crate::execution::expressions::{eval, eval_predicate};
use crate::execution::operators::Operator;
use crate::execution::optimizer;
use crate::execution::plan::PhysicalPlan;
use crate::execution::{ExecContext, QueryResult};
use crate::sql::parser;
use crate::sql::resolver::{
    bind_constant_expr, BoundDelete, BoundExpr, BoundInsert, BoundStatement, BoundUpdate,
    ResolvedStatement,
};
use crate::transaction::types::{LockMode, ResourceId, UndoRecord};
use log::debug;

/// Execute a resolved statement inside the context's transaction.
/// Transaction-control statements are the dispatcher's business and
/// rejected here.
pub fn execute_statement(resolved: &ResolvedStatement, ctx: &ExecContext) -> Result<QueryResult> {
    // A plan compiled against an older schema must not run.
    if resolved.schema_version != ctx.catalog.schema_version() {
        return Err(DbError::Planning(
            "schema changed since compilation; statement must be re-prepared".into(),
        ));
    }
    if resolved.param_count > ctx.params.len() {
        return Err(DbError::Execution(format!(
            "statement expects {} parameters, got {}",
            resolved.param_count,
            ctx.params.len()
        )));
    }
    match &resolved.stmt {
        BoundStatement::Select(select) => {
            let plan = optimizer::optimize(select, resolved.schema_version)?;
            run_select_plan(&plan, ctx)
        }
        BoundStatement::Insert(insert) => execute_insert(insert, resolved.schema_version, ctx),
        BoundStatement::Update(update) => execute_update(update, ctx),
        BoundStatement::Delete(delete) => execute_delete(delete, ctx),
        BoundStatement::CreateTable(create) => {
            ctx.locks
                .acquire(ctx.txn_id, ResourceId::Database, LockMode::Exclusive, ctx.deadline)?;
            ctx.catalog
                .create_table(&create.name, create.columns.clone(), ctx.deadline)?;
            ctx.txns.push_undo(
                ctx.txn_id,
                UndoRecord::CreateTable {
                    name: create.name.clone(),
                },
            )?;
            Ok(QueryResult::empty())
        }
        BoundStatement::DropTable(drop) => {
            ctx.locks
                .acquire(ctx.txn_id, ResourceId::Database, LockMode::Exclusive, ctx.deadline)?;
            if !ctx.catalog.table_exists(&drop.name) {
                if drop.if_exists {
                    return Ok(QueryResult::empty());
                }
                return Err(DbError::NotFound(drop.name.clone()));
            }
            let info = ctx.catalog.drop_table(&drop.name, ctx.deadline)?;
            ctx.txns
                .push_undo(ctx.txn_id, UndoRecord::DropTable { info })?;
            Ok(QueryResult::empty())
        }
        BoundStatement::Begin
        | BoundStatement::Commit
        | BoundStatement::Rollback { .. }
        | BoundStatement::Savepoint { .. } => Err(DbError::Execution(
            "transaction control reached the statement executor".into(),
        )),
    }
}

/// Pull every row out of a compiled SELECT plan, closing the operator
/// tree on all exit paths.
pub fn run_select_plan(plan: &PhysicalPlan, ctx: &ExecContext) -> Result<QueryResult> {
    let mut root = Operator::build(&plan.root)?;
    if let Err(e) = root.open(ctx) {
        root.close(ctx);
        return Err(e);
    }
    let mut rows = Vec::new();
    let outcome = loop {
        match root.next(ctx) {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    root.close(ctx);
    outcome?;
    let (columns, column_types) = plan
        .output
        .iter()
        .map(|(name, ty)| (name.clone(), *ty))
        .unzip();
    Ok(QueryResult::with_rows(columns, column_types, rows))
}

fn execute_insert(
    insert: &BoundInsert,
    schema_version: u32,
    ctx: &ExecContext,
) -> Result<QueryResult> {
    let table = &insert.table;
    ctx.locks.acquire_hierarchy(
        ctx.txn_id,
        ResourceId::Table(table.id),
        LockMode::IntentionExclusive,
        ctx.deadline,
    )?;
    let heap = ctx.catalog.table_heap(&table.name, ctx.deadline)?;

    // Materialize the source rows before writing anything, so an
    // INSERT … SELECT over its own table sees a stable snapshot.
    let mut source_rows: Vec<Row> = Vec::new();
    for bound_row in &insert.rows {
        let mut values = Vec::with_capacity(bound_row.len());
        for expr in bound_row {
            values.push(eval(expr, &Vec::new(), &ctx.params)?);
        }
        source_rows.push(values);
    }
    if let Some(select) = &insert.select {
        let plan = optimizer::optimize(select, schema_version)?;
        let result = run_select_plan(&plan, ctx)?;
        source_rows.extend(result.rows);
    }

    let mut count = 0usize;
    for values in source_rows {
        let row = complete_row(ctx, table, &insert.column_map, values)?;
        let rid = heap.insert(&table.columns, &row, ctx.deadline)?;
        ctx.locks.acquire_hierarchy(
            ctx.txn_id,
            ResourceId::Row {
                table: table.id,
                rid,
            },
            LockMode::Exclusive,
            ctx.deadline,
        )?;
        ctx.txns.push_undo(
            ctx.txn_id,
            UndoRecord::Insert {
                table: table.name.clone(),
                rid,
            },
        )?;
        count += 1;
    }
    let _ = ctx
        .catalog
        .adjust_row_count(&table.name, count as i64, ctx.deadline);
    debug!("inserted {} rows into '{}'", count, table.name);
    Ok(QueryResult::with_affected(count))
}

fn execute_update(update: &BoundUpdate, ctx: &ExecContext) -> Result<QueryResult> {
    let table = &update.table;
    ctx.locks.acquire_hierarchy(
        ctx.txn_id,
        ResourceId::Table(table.id),
        LockMode::IntentionExclusive,
        ctx.deadline,
    )?;
    let heap = ctx.catalog.table_heap(&table.name, ctx.deadline)?;
    let targets = collect_write_set(ctx, table, &heap, &update.filter)?;

    let mut count = 0usize;
    for (rid, before) in targets {
        let mut after = before.clone();
        for (idx, expr) in &update.assignments {
            let value = eval(expr, &before, &ctx.params)?;
            let column = &table.columns[*idx];
            let value = value.coerce_to(column.data_type)?;
            if value.is_null() && !column.nullable {
                return Err(DbError::Constraint(format!(
                    "column '{}' cannot be NULL",
                    column.name
                )));
            }
            after[*idx] = value;
        }
        let placed = heap.update(&table.columns, rid, &after, ctx.deadline)?;
        if placed != rid {
            // A relocated image is what scans will deliver; lock it
            // under the same transaction as the original.
            ctx.locks.acquire_hierarchy(
                ctx.txn_id,
                ResourceId::Row {
                    table: table.id,
                    rid: placed,
                },
                LockMode::Exclusive,
                ctx.deadline,
            )?;
        }
        ctx.txns.push_undo(
            ctx.txn_id,
            UndoRecord::Update {
                table: table.name.clone(),
                rid,
                before,
            },
        )?;
        count += 1;
    }
    debug!("updated {} rows in '{}'", count, table.name);
    Ok(QueryResult::with_affected(count))
}

fn execute_delete(delete: &BoundDelete, ctx: &ExecContext) -> Result<QueryResult> {
    let table = &delete.table;
    ctx.locks.acquire_hierarchy(
        ctx.txn_id,
        ResourceId::Table(table.id),
        LockMode::IntentionExclusive,
        ctx.deadline,
    )?;
    let heap = ctx.catalog.table_heap(&table.name, ctx.deadline)?;
    let targets = collect_write_set(ctx, table, &heap, &delete.filter)?;

    let mut count = 0usize;
    for (rid, before) in targets {
        heap.delete(&table.columns, rid, ctx.deadline)?;
        ctx.txns.push_undo(
            ctx.txn_id,
            UndoRecord::Delete {
                table: table.name.clone(),
                rid,
                before,
            },
        )?;
        count += 1;
    }
    let _ = ctx
        .catalog
        .adjust_row_count(&table.name, -(count as i64), ctx.deadline);
    debug!("deleted {} rows from '{}'", count, table.name);
    Ok(QueryResult::with_affected(count))
}

/// Phase one of a write: scan, filter, X-lock each matching row, and
/// re-read it under the lock. Nothing is mutated until the whole write
/// set is collected.
fn collect_write_set(
    ctx: &ExecContext,
    table: &TableInfo,
    heap: &crate::storage::TableHeap,
    filter: &Option<BoundExpr>,
) -> Result<Vec<(RecordId, Row)>> {
    let mut scan = heap.scan();
    let mut targets = Vec::new();
    while let Some((rid, row)) = scan.next(heap, &table.columns, ctx.deadline)? {
        ctx.check()?;
        let matched = match filter {
            None => true,
            Some(predicate) => eval_predicate(predicate, &row, &ctx.params)?,
        };
        if !matched {
            continue;
        }
        ctx.locks.acquire_hierarchy(
            ctx.txn_id,
            ResourceId::Row {
                table: table.id,
                rid,
            },
            LockMode::Exclusive,
            ctx.deadline,
        )?;
        // The image may have changed while we waited for the lock.
        let current = match heap.get(&table.columns, rid, ctx.deadline)? {
            None => continue,
            Some(current) => current,
        };
        let still_matched = match filter {
            None => true,
            Some(predicate) => eval_predicate(predicate, &current, &ctx.params)?,
        };
        if still_matched {
            targets.push((rid, current));
        }
    }
    Ok(targets)
}

/// Build a full table row from insert-list values, filling omitted
/// columns from their DEFAULT or NULL, coercing, and enforcing
/// NOT NULL.
fn complete_row(
    ctx: &ExecContext,
    table: &TableInfo,
    column_map: &[usize],
    values: Vec<Value>,
) -> Result<Row> {
    let mut slots: Vec<Option<Value>> = vec![None; table.columns.len()];
    for (value, &idx) in values.into_iter().zip(column_map) {
        slots[idx] = Some(value);
    }
    let mut row = Vec::with_capacity(table.columns.len());
    for (column, slot) in table.columns.iter().zip(slots) {
        let value = match slot {
            Some(value) => value,
            None => match &column.default {
                Some(sql) => {
                    let expr = parser::parse_expression(sql)?;
                    let bound = bind_constant_expr(&ctx.catalog, &expr)?;
                    eval(&bound, &Vec::new(), &ctx.params)?
                }
                None => Value::Null,
            },
        };
        let value = value.coerce_to(column.data_type)?;
        if value.is_null() && !column.nullable {
            return Err(DbError::Constraint(format!(
                "column '{}' cannot be NULL",
                column.name
            )));
        }
        row.push(value);
    }
    Ok(row)
}
