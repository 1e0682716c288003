// Name and type resolution.
//
// Turns parsed statements into bound statements: every column reference
// becomes a flat positional offset into the row produced by the FROM
// clause (tables concatenated in declaration order), every expression
// carries an inferred type, and aggregate placement is validated.
// BETWEEN and IN are desugared here so the execution engine only sees
// the core expression forms.

use crate::catalog::{Catalog, Column, TableInfo};
use crate::common::{DataType, Value};
use crate::error::{DbError, Result};
use crate::sql::ast::{
    BinaryOp, Expr, InsertSource, JoinKind, SelectItem, SelectStmt, Statement, TableConstraint,
    UnaryOp,
};
use std::fmt::Write as _;

/// Statement classification, fed to dispatcher routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    DropTable,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Unknown,
}

impl StatementKind {
    pub fn of(stmt: &Statement) -> Self {
        match stmt {
            Statement::Select(_) => StatementKind::Select,
            Statement::Insert(_) => StatementKind::Insert,
            Statement::Update(_) => StatementKind::Update,
            Statement::Delete(_) => StatementKind::Delete,
            Statement::CreateTable(_) => StatementKind::CreateTable,
            Statement::DropTable(_) => StatementKind::DropTable,
            Statement::Begin => StatementKind::Begin,
            Statement::Commit => StatementKind::Commit,
            Statement::Rollback { .. } => StatementKind::Rollback,
            Statement::Savepoint { .. } => StatementKind::Savepoint,
        }
    }

    /// Classify raw SQL by its leading keyword. Anything unrecognized
    /// is `Unknown`, never a sentinel value.
    pub fn from_leading_keyword(word: &str) -> Self {
        match word.to_ascii_uppercase().as_str() {
            "SELECT" => StatementKind::Select,
            "INSERT" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            "CREATE" => StatementKind::CreateTable,
            "DROP" => StatementKind::DropTable,
            "BEGIN" => StatementKind::Begin,
            "COMMIT" => StatementKind::Commit,
            "ROLLBACK" => StatementKind::Rollback,
            "SAVEPOINT" => StatementKind::Savepoint,
            _ => StatementKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    CountStar,
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::CountStar => "count",
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarFunc {
    Upper,
    Lower,
    Trim,
    Length,
}

/// Expression with names resolved to row offsets and types inferred.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundExpr {
    Literal(Value),
    Column {
        offset: usize,
        ty: DataType,
        nullable: bool,
        name: String,
    },
    Parameter {
        index: usize,
    },
    Unary {
        op: UnaryOp,
        operand: Box<BoundExpr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<BoundExpr>,
        right: Box<BoundExpr>,
    },
    IsNull {
        operand: Box<BoundExpr>,
        negated: bool,
    },
    Like {
        operand: Box<BoundExpr>,
        pattern: Box<BoundExpr>,
        negated: bool,
    },
    Aggregate {
        func: AggFunc,
        arg: Option<Box<BoundExpr>>,
    },
    Function {
        func: ScalarFunc,
        args: Vec<BoundExpr>,
    },
}

impl BoundExpr {
    /// Inferred type; `None` is the type of NULL (and of parameters
    /// until bound).
    pub fn ty(&self) -> Option<DataType> {
        match self {
            BoundExpr::Literal(v) => v.data_type(),
            BoundExpr::Column { ty, .. } => Some(*ty),
            BoundExpr::Parameter { .. } => None,
            BoundExpr::Unary { op, operand } => match op {
                UnaryOp::Neg => operand.ty(),
                UnaryOp::Not => Some(DataType::Boolean),
            },
            BoundExpr::Binary { op, left, right } => match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
                    match (left.ty(), right.ty()) {
                        (Some(DataType::Real), _) | (_, Some(DataType::Real)) => {
                            Some(DataType::Real)
                        }
                        (None, None) => None,
                        _ => Some(DataType::Integer),
                    }
                }
                _ => Some(DataType::Boolean),
            },
            BoundExpr::IsNull { .. } => Some(DataType::Boolean),
            BoundExpr::Like { .. } => Some(DataType::Boolean),
            BoundExpr::Aggregate { func, arg } => match func {
                AggFunc::CountStar | AggFunc::Count => Some(DataType::Integer),
                AggFunc::Sum => arg.as_ref().and_then(|a| a.ty()),
                AggFunc::Avg => Some(DataType::Real),
                AggFunc::Min | AggFunc::Max => arg.as_ref().and_then(|a| a.ty()),
            },
            BoundExpr::Function { func, .. } => match func {
                ScalarFunc::Upper | ScalarFunc::Lower | ScalarFunc::Trim => Some(DataType::Text),
                ScalarFunc::Length => Some(DataType::Integer),
            },
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        match self {
            BoundExpr::Aggregate { .. } => true,
            BoundExpr::Literal(_) | BoundExpr::Column { .. } | BoundExpr::Parameter { .. } => false,
            BoundExpr::Unary { operand, .. } => operand.contains_aggregate(),
            BoundExpr::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            BoundExpr::IsNull { operand, .. } => operand.contains_aggregate(),
            BoundExpr::Like { operand, pattern, .. } => {
                operand.contains_aggregate() || pattern.contains_aggregate()
            }
            BoundExpr::Function { args, .. } => args.iter().any(|a| a.contains_aggregate()),
        }
    }

    /// Collect every referenced column offset.
    pub fn collect_columns(&self, out: &mut Vec<usize>) {
        match self {
            BoundExpr::Column { offset, .. } => out.push(*offset),
            BoundExpr::Literal(_) | BoundExpr::Parameter { .. } => {}
            BoundExpr::Unary { operand, .. } | BoundExpr::IsNull { operand, .. } => {
                operand.collect_columns(out)
            }
            BoundExpr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            BoundExpr::Like { operand, pattern, .. } => {
                operand.collect_columns(out);
                pattern.collect_columns(out);
            }
            BoundExpr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.collect_columns(out);
                }
            }
            BoundExpr::Function { args, .. } => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
        }
    }

    /// Rewrite column offsets through `f`. Used when the optimizer
    /// permutes the join order or stacks operators with new layouts.
    pub fn remap_columns(&mut self, f: &dyn Fn(usize) -> usize) {
        match self {
            BoundExpr::Column { offset, .. } => *offset = f(*offset),
            BoundExpr::Literal(_) | BoundExpr::Parameter { .. } => {}
            BoundExpr::Unary { operand, .. } | BoundExpr::IsNull { operand, .. } => {
                operand.remap_columns(f)
            }
            BoundExpr::Binary { left, right, .. } => {
                left.remap_columns(f);
                right.remap_columns(f);
            }
            BoundExpr::Like { operand, pattern, .. } => {
                operand.remap_columns(f);
                pattern.remap_columns(f);
            }
            BoundExpr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.remap_columns(f);
                }
            }
            BoundExpr::Function { args, .. } => {
                for arg in args {
                    arg.remap_columns(f);
                }
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BoundExpr::Literal(v) => v.to_string(),
            BoundExpr::Column { name, .. } => name.clone(),
            BoundExpr::Parameter { index } => format!("?{}", index + 1),
            BoundExpr::Unary { operand, .. } => operand.describe(),
            BoundExpr::Binary { left, right, .. } => {
                let mut s = left.describe();
                let _ = write!(s, "…{}", right.describe());
                s
            }
            BoundExpr::IsNull { operand, .. } => operand.describe(),
            BoundExpr::Like { operand, .. } => operand.describe(),
            BoundExpr::Aggregate { func, arg } => match arg {
                Some(arg) => format!("{}({})", func.name(), arg.describe()),
                None => format!("{}(*)", func.name()),
            },
            BoundExpr::Function { func, args } => {
                let inner = args
                    .iter()
                    .map(|a| a.describe())
                    .collect::<Vec<_>>()
                    .join(", ");
                let name = match func {
                    ScalarFunc::Upper => "upper",
                    ScalarFunc::Lower => "lower",
                    ScalarFunc::Trim => "trim",
                    ScalarFunc::Length => "length",
                };
                format!("{}({})", name, inner)
            }
        }
    }
}

/// A table bound into a FROM clause.
#[derive(Debug, Clone)]
pub struct BoundTable {
    pub info: TableInfo,
    pub alias: Option<String>,
    /// Flat offset of this table's first column in the FROM-order row.
    pub offset: usize,
}

impl BoundTable {
    pub fn width(&self) -> usize {
        self.info.columns.len()
    }

    pub fn binding_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.info.name)
    }
}

/// `joins[i]` connects `tables[i + 1]` to the tables before it. A
/// comma-separated FROM item arrives as an inner join with no
/// condition (a cross join the optimizer reshapes with WHERE
/// conjuncts).
#[derive(Debug, Clone)]
pub struct BoundJoin {
    pub kind: JoinKind,
    pub on: Option<BoundExpr>,
}

#[derive(Debug, Clone)]
pub struct BoundSelect {
    pub tables: Vec<BoundTable>,
    pub joins: Vec<BoundJoin>,
    pub items: Vec<(BoundExpr, String)>,
    pub distinct: bool,
    pub filter: Option<BoundExpr>,
    pub group_by: Vec<BoundExpr>,
    pub having: Option<BoundExpr>,
    pub order_by: Vec<(BoundExpr, bool)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub has_aggregates: bool,
}

#[derive(Debug, Clone)]
pub struct BoundInsert {
    pub table: TableInfo,
    /// Target column positions, in insert-list order.
    pub column_map: Vec<usize>,
    pub rows: Vec<Vec<BoundExpr>>,
    pub select: Option<Box<BoundSelect>>,
}

#[derive(Debug, Clone)]
pub struct BoundUpdate {
    pub table: TableInfo,
    pub assignments: Vec<(usize, BoundExpr)>,
    pub filter: Option<BoundExpr>,
}

#[derive(Debug, Clone)]
pub struct BoundDelete {
    pub table: TableInfo,
    pub filter: Option<BoundExpr>,
}

#[derive(Debug, Clone)]
pub struct BoundCreateTable {
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct BoundDropTable {
    pub name: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone)]
pub enum BoundStatement {
    Select(BoundSelect),
    Insert(BoundInsert),
    Update(BoundUpdate),
    Delete(BoundDelete),
    CreateTable(BoundCreateTable),
    DropTable(BoundDropTable),
    Begin,
    Commit,
    Rollback { to_savepoint: Option<String> },
    Savepoint { name: String },
}

#[derive(Debug, Clone)]
pub struct ResolvedStatement {
    pub stmt: BoundStatement,
    pub kind: StatementKind,
    /// Schema version this statement was bound against; checked at
    /// dispatch so DDL in between forces a recompile.
    pub schema_version: u32,
    pub param_count: usize,
}

struct Scope<'a> {
    tables: Vec<BoundTable>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn empty() -> Scope<'static> {
        Scope {
            tables: Vec::new(),
            parent: None,
        }
    }

    fn resolve(&self, table: Option<&str>, name: &str) -> Result<BoundExpr> {
        let lowered = name.to_lowercase();
        match table {
            Some(qualifier) => {
                let q = qualifier.to_lowercase();
                let table = self.tables.iter().find(|t| t.binding_name() == q);
                match table {
                    Some(t) => match t.info.column_index(&lowered) {
                        Some(idx) => Ok(column_ref(t, idx)),
                        None => Err(DbError::NotFound(format!("{}.{}", q, lowered))),
                    },
                    None => match self.parent {
                        Some(parent) => parent.resolve(Some(qualifier), name),
                        None => Err(DbError::NotFound(q)),
                    },
                }
            }
            None => {
                let mut matches = Vec::new();
                for t in &self.tables {
                    if let Some(idx) = t.info.column_index(&lowered) {
                        matches.push(column_ref(t, idx));
                    }
                }
                match matches.len() {
                    1 => Ok(matches.pop().unwrap()),
                    0 => match self.parent {
                        Some(parent) => parent.resolve(None, name),
                        None => Err(DbError::NotFound(lowered)),
                    },
                    _ => Err(DbError::Ambiguous(lowered)),
                }
            }
        }
    }
}

fn column_ref(table: &BoundTable, idx: usize) -> BoundExpr {
    let column = &table.info.columns[idx];
    BoundExpr::Column {
        offset: table.offset + idx,
        ty: column.data_type,
        nullable: column.nullable,
        name: column.name.clone(),
    }
}

pub struct Resolver<'a> {
    catalog: &'a Catalog,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    pub fn resolve(&self, stmt: &Statement) -> Result<ResolvedStatement> {
        let kind = StatementKind::of(stmt);
        let mut binder = Binder {
            catalog: self.catalog,
            param_count: 0,
        };
        let bound = match stmt {
            Statement::Select(select) => {
                BoundStatement::Select(binder.bind_select(select, None)?)
            }
            Statement::Insert(insert) => {
                let table = self.catalog.get_table(&insert.table.name)?;
                let column_map: Vec<usize> = if insert.columns.is_empty() {
                    (0..table.columns.len()).collect()
                } else {
                    let mut map = Vec::with_capacity(insert.columns.len());
                    for name in &insert.columns {
                        let idx = table.column_index(name).ok_or_else(|| {
                            DbError::NotFound(format!("{}.{}", table.name, name))
                        })?;
                        if map.contains(&idx) {
                            return Err(DbError::Semantic(format!(
                                "column '{}' specified twice",
                                name
                            )));
                        }
                        map.push(idx);
                    }
                    map
                };
                let (rows, select) = match &insert.source {
                    InsertSource::Values(tuples) => {
                        let scope = Scope::empty();
                        let mut rows = Vec::with_capacity(tuples.len());
                        for tuple in tuples {
                            if tuple.len() != column_map.len() {
                                return Err(DbError::Semantic(format!(
                                    "INSERT expects {} values, got {}",
                                    column_map.len(),
                                    tuple.len()
                                )));
                            }
                            let mut row = Vec::with_capacity(tuple.len());
                            for (expr, &col_idx) in tuple.iter().zip(&column_map) {
                                let bound = binder.bind_expr(expr, &scope)?;
                                check_assignable(&table.columns[col_idx], bound.ty())?;
                                row.push(bound);
                            }
                            rows.push(row);
                        }
                        (rows, None)
                    }
                    InsertSource::Select(select) => {
                        let bound = binder.bind_select(select, None)?;
                        if bound.items.len() != column_map.len() {
                            return Err(DbError::Semantic(format!(
                                "INSERT expects {} columns, SELECT yields {}",
                                column_map.len(),
                                bound.items.len()
                            )));
                        }
                        for ((expr, _), &col_idx) in bound.items.iter().zip(&column_map) {
                            check_assignable(&table.columns[col_idx], expr.ty())?;
                        }
                        (Vec::new(), Some(Box::new(bound)))
                    }
                };
                BoundStatement::Insert(BoundInsert {
                    table,
                    column_map,
                    rows,
                    select,
                })
            }
            Statement::Update(update) => {
                let table = self.catalog.get_table(&update.table.name)?;
                let scope = Scope {
                    tables: vec![BoundTable {
                        info: table.clone(),
                        alias: update.table.alias.clone(),
                        offset: 0,
                    }],
                    parent: None,
                };
                let mut assignments = Vec::with_capacity(update.assignments.len());
                for (name, expr) in &update.assignments {
                    let idx = table
                        .column_index(name)
                        .ok_or_else(|| DbError::NotFound(format!("{}.{}", table.name, name)))?;
                    let bound = binder.bind_expr(expr, &scope)?;
                    if bound.contains_aggregate() {
                        return Err(DbError::Semantic(
                            "aggregates are not allowed in UPDATE assignments".into(),
                        ));
                    }
                    check_assignable(&table.columns[idx], bound.ty())?;
                    assignments.push((idx, bound));
                }
                let filter = self.bind_filter(&mut binder, &update.filter, &scope)?;
                BoundStatement::Update(BoundUpdate {
                    table,
                    assignments,
                    filter,
                })
            }
            Statement::Delete(delete) => {
                let table = self.catalog.get_table(&delete.table.name)?;
                let scope = Scope {
                    tables: vec![BoundTable {
                        info: table.clone(),
                        alias: delete.table.alias.clone(),
                        offset: 0,
                    }],
                    parent: None,
                };
                let filter = self.bind_filter(&mut binder, &delete.filter, &scope)?;
                BoundStatement::Delete(BoundDelete { table, filter })
            }
            Statement::CreateTable(create) => {
                BoundStatement::CreateTable(self.bind_create_table(&mut binder, create)?)
            }
            Statement::DropTable(drop) => {
                if !drop.if_exists && !self.catalog.table_exists(&drop.name) {
                    return Err(DbError::NotFound(drop.name.to_lowercase()));
                }
                BoundStatement::DropTable(BoundDropTable {
                    name: drop.name.to_lowercase(),
                    if_exists: drop.if_exists,
                })
            }
            Statement::Begin => BoundStatement::Begin,
            Statement::Commit => BoundStatement::Commit,
            Statement::Rollback { to_savepoint } => BoundStatement::Rollback {
                to_savepoint: to_savepoint.clone(),
            },
            Statement::Savepoint { name } => BoundStatement::Savepoint { name: name.clone() },
        };
        Ok(ResolvedStatement {
            stmt: bound,
            kind,
            schema_version: self.catalog.schema_version(),
            param_count: binder.param_count,
        })
    }

    fn bind_filter(
        &self,
        binder: &mut Binder<'_>,
        filter: &Option<Expr>,
        scope: &Scope<'_>,
    ) -> Result<Option<BoundExpr>> {
        match filter {
            None => Ok(None),
            Some(expr) => {
                let bound = binder.bind_expr(expr, scope)?;
                if bound.contains_aggregate() {
                    return Err(DbError::Semantic(
                        "aggregates are not allowed in WHERE".into(),
                    ));
                }
                check_boolean(&bound, "WHERE")?;
                Ok(Some(bound))
            }
        }
    }

    fn bind_create_table(
        &self,
        binder: &mut Binder<'_>,
        create: &crate::sql::ast::CreateTableStmt,
    ) -> Result<BoundCreateTable> {
        let name = create.name.to_lowercase();
        if self.catalog.table_exists(&name) {
            return Err(DbError::Semantic(format!("table '{}' already exists", name)));
        }
        let mut columns: Vec<Column> = Vec::with_capacity(create.columns.len());
        for def in &create.columns {
            let col_name = def.name.to_lowercase();
            if columns.iter().any(|c| c.name == col_name) {
                return Err(DbError::Semantic(format!(
                    "duplicate column '{}'",
                    col_name
                )));
            }
            let mut column = Column::new(col_name, def.data_type);
            column.nullable = !def.not_null;
            column.primary_key = def.primary_key;
            column.unique = def.unique;
            if def.primary_key {
                column.nullable = false;
            }
            if let Some(default) = &def.default {
                let bound = binder.bind_expr(default, &Scope::empty())?;
                if bound.contains_aggregate() {
                    return Err(DbError::Semantic(
                        "aggregates are not allowed in DEFAULT".into(),
                    ));
                }
                check_assignable(&column, bound.ty()).map_err(|_| {
                    DbError::TypeMismatch(format!(
                        "DEFAULT for '{}' is not assignable to {}",
                        column.name, column.data_type
                    ))
                })?;
                column.default = Some(render_expr(default));
            }
            columns.push(column);
        }

        // Column CHECK expressions see the table's own columns.
        let scope_info = TableInfo {
            id: 0,
            name: name.clone(),
            columns: columns.clone(),
            root_page: 0,
            row_count: 0,
            created_at: chrono::Utc::now(),
        };
        let scope = Scope {
            tables: vec![BoundTable {
                info: scope_info,
                alias: None,
                offset: 0,
            }],
            parent: None,
        };
        for def in &create.columns {
            if let Some(check) = &def.check {
                let bound = binder.bind_expr(check, &scope)?;
                check_boolean(&bound, "CHECK")?;
            }
        }

        for constraint in &create.constraints {
            match constraint {
                TableConstraint::PrimaryKey { columns: pk, .. } => {
                    if pk.len() > 1 {
                        return Err(DbError::Constraint(
                            "composite primary keys are not supported".into(),
                        ));
                    }
                    if columns.iter().any(|c| c.primary_key) {
                        return Err(DbError::Constraint(
                            "multiple PRIMARY KEY declarations".into(),
                        ));
                    }
                    let target = pk[0].to_lowercase();
                    let column = columns
                        .iter_mut()
                        .find(|c| c.name == target)
                        .ok_or_else(|| DbError::NotFound(target.clone()))?;
                    column.primary_key = true;
                    column.nullable = false;
                }
                TableConstraint::Unique { columns: uniq, .. } => {
                    for name in uniq {
                        let target = name.to_lowercase();
                        let column = columns
                            .iter_mut()
                            .find(|c| c.name == target)
                            .ok_or_else(|| DbError::NotFound(target.clone()))?;
                        column.unique = true;
                    }
                }
                TableConstraint::ForeignKey {
                    columns: local,
                    ref_table,
                    ref_columns,
                    ..
                } => {
                    let referenced = self.catalog.get_table(ref_table)?;
                    if local.len() != ref_columns.len() {
                        return Err(DbError::Constraint(
                            "FOREIGN KEY column count mismatch".into(),
                        ));
                    }
                    for (l, r) in local.iter().zip(ref_columns) {
                        let local_col = columns
                            .iter()
                            .find(|c| c.name == l.to_lowercase())
                            .ok_or_else(|| DbError::NotFound(l.to_lowercase()))?;
                        let ref_col = referenced
                            .column(r)
                            .ok_or_else(|| DbError::NotFound(format!("{}.{}", ref_table, r)))?;
                        if local_col.data_type != ref_col.data_type {
                            return Err(DbError::Constraint(format!(
                                "FOREIGN KEY '{}' type {} does not match {}.{} type {}",
                                local_col.name,
                                local_col.data_type,
                                referenced.name,
                                ref_col.name,
                                ref_col.data_type
                            )));
                        }
                    }
                }
                TableConstraint::Check { expr, .. } => {
                    let bound = binder.bind_expr(expr, &scope)?;
                    check_boolean(&bound, "CHECK")?;
                }
            }
        }

        let pk_count = columns.iter().filter(|c| c.primary_key).count();
        if pk_count > 1 {
            return Err(DbError::Constraint(
                "multiple PRIMARY KEY declarations".into(),
            ));
        }
        Ok(BoundCreateTable { name, columns })
    }
}

/// Bind an expression with no columns in scope (DEFAULT expressions,
/// constants re-parsed from catalog text).
pub fn bind_constant_expr(catalog: &Catalog, expr: &Expr) -> Result<BoundExpr> {
    let mut binder = Binder {
        catalog,
        param_count: 0,
    };
    binder.bind_expr(expr, &Scope::empty())
}

struct Binder<'a> {
    catalog: &'a Catalog,
    param_count: usize,
}

impl<'a> Binder<'a> {
    fn bind_select(
        &mut self,
        select: &SelectStmt,
        parent: Option<&Scope<'_>>,
    ) -> Result<BoundSelect> {
        let mut tables: Vec<BoundTable> = Vec::new();
        let mut joins: Vec<BoundJoin> = Vec::new();
        let mut offset = 0usize;
        let mut pending_on: Vec<(usize, JoinKind, &Expr)> = Vec::new();

        for (i, item) in select.from.iter().enumerate() {
            let info = self.catalog.get_table(&item.base.name)?;
            offset = push_table(&mut tables, info, item.base.alias.clone(), offset)?;
            if i > 0 {
                joins.push(BoundJoin {
                    kind: JoinKind::Inner,
                    on: None,
                });
            }
            for join in &item.joins {
                let info = self.catalog.get_table(&join.table.name)?;
                offset = push_table(&mut tables, info, join.table.alias.clone(), offset)?;
                joins.push(BoundJoin {
                    kind: join.kind,
                    on: None,
                });
                pending_on.push((joins.len() - 1, join.kind, &join.on));
            }
        }

        let scope = Scope { tables, parent };

        // ON conditions bind against the full FROM scope.
        for (join_idx, _, on) in pending_on {
            let bound = self.bind_expr(on, &scope)?;
            check_boolean(&bound, "ON")?;
            if bound.contains_aggregate() {
                return Err(DbError::Semantic("aggregates are not allowed in ON".into()));
            }
            joins[join_idx].on = Some(bound);
        }

        // Select list, expanding wildcards in declaration order.
        let mut items: Vec<(BoundExpr, String)> = Vec::new();
        if select.items.is_empty() {
            return Err(DbError::Semantic("empty select list".into()));
        }
        for item in &select.items {
            match item {
                SelectItem::Wildcard => {
                    if scope.tables.is_empty() {
                        return Err(DbError::Semantic("'*' with no FROM tables".into()));
                    }
                    for table in &scope.tables {
                        for idx in 0..table.width() {
                            items.push((
                                column_ref(table, idx),
                                table.info.columns[idx].name.clone(),
                            ));
                        }
                    }
                }
                SelectItem::QualifiedWildcard(qualifier) => {
                    let q = qualifier.to_lowercase();
                    let table = scope
                        .tables
                        .iter()
                        .find(|t| t.binding_name() == q)
                        .ok_or_else(|| DbError::NotFound(q.clone()))?;
                    for idx in 0..table.width() {
                        items.push((
                            column_ref(table, idx),
                            table.info.columns[idx].name.clone(),
                        ));
                    }
                }
                SelectItem::Expr { expr, alias } => {
                    let bound = self.bind_expr(expr, &scope)?;
                    let name = alias.clone().unwrap_or_else(|| item_name(expr, &bound));
                    items.push((bound, name));
                }
            }
        }

        let filter = match &select.filter {
            None => None,
            Some(expr) => {
                let bound = self.bind_expr(expr, &scope)?;
                if bound.contains_aggregate() {
                    return Err(DbError::Semantic(
                        "aggregates are not allowed in WHERE".into(),
                    ));
                }
                check_boolean(&bound, "WHERE")?;
                Some(bound)
            }
        };

        let mut group_by = Vec::with_capacity(select.group_by.len());
        for expr in &select.group_by {
            let bound = self.bind_expr(expr, &scope)?;
            if bound.contains_aggregate() {
                return Err(DbError::Semantic(
                    "aggregates are not allowed in GROUP BY".into(),
                ));
            }
            group_by.push(bound);
        }

        let having = match &select.having {
            None => None,
            Some(expr) => {
                let bound = self.bind_expr(expr, &scope)?;
                check_boolean(&bound, "HAVING")?;
                Some(bound)
            }
        };

        let mut order_by = Vec::with_capacity(select.order_by.len());
        for item in &select.order_by {
            let bound = self.bind_expr(&item.expr, &scope)?;
            order_by.push((bound, item.desc));
        }

        let has_aggregates = items.iter().any(|(e, _)| e.contains_aggregate())
            || having
                .as_ref()
                .map(|h| h.contains_aggregate())
                .unwrap_or(false)
            || order_by.iter().any(|(e, _)| e.contains_aggregate())
            || !group_by.is_empty();

        if has_aggregates {
            for (expr, name) in &items {
                validate_aggregate_placement(expr, &group_by, name)?;
            }
            if let Some(having) = &having {
                validate_aggregate_placement(having, &group_by, "HAVING")?;
            }
            for (expr, _) in &order_by {
                validate_aggregate_placement(expr, &group_by, "ORDER BY")?;
            }
        }

        Ok(BoundSelect {
            tables: scope.tables,
            joins,
            items,
            distinct: select.distinct,
            filter,
            group_by,
            having,
            order_by,
            limit: select.limit,
            offset: select.offset,
            has_aggregates,
        })
    }

    fn bind_expr(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<BoundExpr> {
        match expr {
            Expr::Literal(v) => Ok(BoundExpr::Literal(v.clone())),
            Expr::Column { table, name, span } => {
                scope.resolve(table.as_deref(), name).map_err(|e| match e {
                    DbError::NotFound(n) => DbError::Semantic(format!(
                        "name '{}' not found at {}:{}",
                        n, span.line, span.column
                    )),
                    other => other,
                })
            }
            Expr::Parameter { index } => {
                self.param_count = self.param_count.max(index + 1);
                Ok(BoundExpr::Parameter { index: *index })
            }
            Expr::Unary { op, operand } => {
                let bound = self.bind_expr(operand, scope)?;
                match op {
                    UnaryOp::Neg => {
                        if !matches!(
                            bound.ty(),
                            None | Some(DataType::Integer) | Some(DataType::Real)
                        ) {
                            return Err(DbError::TypeMismatch(format!(
                                "cannot negate {}",
                                bound.describe()
                            )));
                        }
                    }
                    UnaryOp::Not => check_boolean(&bound, "NOT")?,
                }
                Ok(BoundExpr::Unary {
                    op: *op,
                    operand: Box::new(bound),
                })
            }
            Expr::Binary { op, left, right } => {
                let l = self.bind_expr(left, scope)?;
                let r = self.bind_expr(right, scope)?;
                check_binary(*op, &l, &r)?;
                Ok(BoundExpr::Binary {
                    op: *op,
                    left: Box::new(l),
                    right: Box::new(r),
                })
            }
            Expr::IsNull { operand, negated } => {
                let bound = self.bind_expr(operand, scope)?;
                Ok(BoundExpr::IsNull {
                    operand: Box::new(bound),
                    negated: *negated,
                })
            }
            Expr::Like {
                operand,
                pattern,
                negated,
            } => {
                let o = self.bind_expr(operand, scope)?;
                let p = self.bind_expr(pattern, scope)?;
                for side in [&o, &p] {
                    if !matches!(side.ty(), None | Some(DataType::Text)) {
                        return Err(DbError::TypeMismatch(format!(
                            "LIKE requires text operands, got {}",
                            side.describe()
                        )));
                    }
                }
                Ok(BoundExpr::Like {
                    operand: Box::new(o),
                    pattern: Box::new(p),
                    negated: *negated,
                })
            }
            Expr::Between {
                operand,
                low,
                high,
                negated,
            } => {
                // operand >= low AND operand <= high
                let o = self.bind_expr(operand, scope)?;
                let lo = self.bind_expr(low, scope)?;
                let hi = self.bind_expr(high, scope)?;
                check_binary(BinaryOp::GtEq, &o, &lo)?;
                check_binary(BinaryOp::LtEq, &o, &hi)?;
                let range = BoundExpr::Binary {
                    op: BinaryOp::And,
                    left: Box::new(BoundExpr::Binary {
                        op: BinaryOp::GtEq,
                        left: Box::new(o.clone()),
                        right: Box::new(lo),
                    }),
                    right: Box::new(BoundExpr::Binary {
                        op: BinaryOp::LtEq,
                        left: Box::new(o),
                        right: Box::new(hi),
                    }),
                };
                Ok(negate_if(range, *negated))
            }
            Expr::InList {
                operand,
                list,
                negated,
            } => {
                // operand = a OR operand = b OR ...
                let o = self.bind_expr(operand, scope)?;
                let mut disjunction: Option<BoundExpr> = None;
                for item in list {
                    if matches!(item, Expr::Subquery(_)) {
                        return Err(DbError::Planning(
                            "IN (SELECT …) is not executable".into(),
                        ));
                    }
                    let bound = self.bind_expr(item, scope)?;
                    check_binary(BinaryOp::Eq, &o, &bound)?;
                    let eq = BoundExpr::Binary {
                        op: BinaryOp::Eq,
                        left: Box::new(o.clone()),
                        right: Box::new(bound),
                    };
                    disjunction = Some(match disjunction {
                        None => eq,
                        Some(prev) => BoundExpr::Binary {
                            op: BinaryOp::Or,
                            left: Box::new(prev),
                            right: Box::new(eq),
                        },
                    });
                }
                let expr = disjunction
                    .ok_or_else(|| DbError::Semantic("empty IN list".into()))?;
                Ok(negate_if(expr, *negated))
            }
            Expr::Function {
                name,
                args,
                star,
                distinct,
                span,
            } => self.bind_function(name, args, *star, *distinct, *span, scope),
            Expr::Subquery(select) => {
                // Name- and type-check the inner query (correlation is
                // legal in the AST), then refuse to plan it.
                let _ = self.bind_select(select, Some(scope))?;
                Err(DbError::Planning(
                    "subquery execution is not supported".into(),
                ))
            }
        }
    }

    fn bind_function(
        &mut self,
        name: &str,
        args: &[Expr],
        star: bool,
        distinct: bool,
        span: crate::sql::token::Span,
        scope: &Scope<'_>,
    ) -> Result<BoundExpr> {
        let upper = name.to_ascii_uppercase();
        if distinct {
            return Err(DbError::Semantic(format!(
                "DISTINCT aggregates are not supported ({})",
                upper
            )));
        }
        let agg = match upper.as_str() {
            "COUNT" => Some(if star { AggFunc::CountStar } else { AggFunc::Count }),
            "SUM" => Some(AggFunc::Sum),
            "AVG" => Some(AggFunc::Avg),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            _ => None,
        };
        if let Some(func) = agg {
            if func == AggFunc::CountStar {
                return Ok(BoundExpr::Aggregate {
                    func,
                    arg: None,
                });
            }
            if star {
                return Err(DbError::Semantic(format!("{}(*) is not defined", upper)));
            }
            if args.len() != 1 {
                return Err(DbError::Semantic(format!(
                    "{} takes exactly one argument",
                    upper
                )));
            }
            let arg = self.bind_expr(&args[0], scope)?;
            if arg.contains_aggregate() {
                return Err(DbError::Semantic("aggregates cannot nest".into()));
            }
            if matches!(func, AggFunc::Sum | AggFunc::Avg)
                && !matches!(
                    arg.ty(),
                    None | Some(DataType::Integer) | Some(DataType::Real)
                )
            {
                return Err(DbError::TypeMismatch(format!(
                    "{} requires a numeric argument",
                    upper
                )));
            }
            return Ok(BoundExpr::Aggregate {
                func,
                arg: Some(Box::new(arg)),
            });
        }
        let func = match upper.as_str() {
            "UPPER" => ScalarFunc::Upper,
            "LOWER" => ScalarFunc::Lower,
            "TRIM" => ScalarFunc::Trim,
            "LENGTH" => ScalarFunc::Length,
            _ => {
                return Err(DbError::Semantic(format!(
                    "unknown function '{}' at {}:{}",
                    name, span.line, span.column
                )))
            }
        };
        if star || args.len() != 1 {
            return Err(DbError::Semantic(format!(
                "{} takes exactly one argument",
                upper
            )));
        }
        let arg = self.bind_expr(&args[0], scope)?;
        if !matches!(arg.ty(), None | Some(DataType::Text)) {
            return Err(DbError::TypeMismatch(format!(
                "{} requires a text argument",
                upper
            )));
        }
        Ok(BoundExpr::Function {
            func,
            args: vec![arg],
        })
    }
}

fn push_table(
    tables: &mut Vec<BoundTable>,
    info: TableInfo,
    alias: Option<String>,
    offset: usize,
) -> Result<usize> {
    let alias = alias.map(|a| a.to_lowercase());
    let binding = alias.clone().unwrap_or_else(|| info.name.clone());
    if tables.iter().any(|t| t.binding_name() == binding) {
        return Err(DbError::Ambiguous(binding));
    }
    let width = info.columns.len();
    tables.push(BoundTable {
        info,
        alias,
        offset,
    });
    Ok(offset + width)
}

fn item_name(expr: &Expr, bound: &BoundExpr) -> String {
    match expr {
        Expr::Column { name, .. } => name.to_lowercase(),
        Expr::Function { name, star, .. } => {
            if *star {
                format!("{}(*)", name.to_lowercase())
            } else {
                bound.describe()
            }
        }
        _ => bound.describe(),
    }
}

fn negate_if(expr: BoundExpr, negated: bool) -> BoundExpr {
    if negated {
        BoundExpr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(expr),
        }
    } else {
        expr
    }
}

fn check_assignable(column: &Column, source: Option<DataType>) -> Result<()> {
    if column.data_type.assignable_from(source) {
        Ok(())
    } else {
        Err(DbError::TypeMismatch(format!(
            "cannot assign {} to column '{}' of type {}",
            source
                .map(|ty| ty.to_string())
                .unwrap_or_else(|| "NULL".to_string()),
            column.name,
            column.data_type
        )))
    }
}

fn check_boolean(expr: &BoundExpr, context: &str) -> Result<()> {
    match expr.ty() {
        None | Some(DataType::Boolean) => Ok(()),
        Some(other) => Err(DbError::TypeMismatch(format!(
            "{} requires a boolean, got {}",
            context, other
        ))),
    }
}

fn check_binary(op: BinaryOp, left: &BoundExpr, right: &BoundExpr) -> Result<()> {
    let numeric =
        |ty: Option<DataType>| matches!(ty, None | Some(DataType::Integer) | Some(DataType::Real));
    match op {
        BinaryOp::And | BinaryOp::Or => {
            check_boolean(left, "AND/OR")?;
            check_boolean(right, "AND/OR")
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            if numeric(left.ty()) && numeric(right.ty()) {
                Ok(())
            } else {
                Err(DbError::TypeMismatch(format!(
                    "arithmetic requires numeric operands, got {} and {}",
                    left.describe(),
                    right.describe()
                )))
            }
        }
        _ => {
            let (l, r) = (left.ty(), right.ty());
            let comparable = match (l, r) {
                (None, _) | (_, None) => true,
                (Some(a), Some(b)) => a == b || (a.is_numeric() && b.is_numeric()),
            };
            if comparable {
                Ok(())
            } else {
                Err(DbError::TypeMismatch(format!(
                    "cannot compare {} with {}",
                    l.map(|t| t.to_string()).unwrap_or_else(|| "NULL".into()),
                    r.map(|t| t.to_string()).unwrap_or_else(|| "NULL".into()),
                )))
            }
        }
    }
}

/// Every non-aggregate leaf of `expr` must come from GROUP BY.
fn validate_aggregate_placement(
    expr: &BoundExpr,
    group_by: &[BoundExpr],
    context: &str,
) -> Result<()> {
    if group_by.iter().any(|g| g == expr) {
        return Ok(());
    }
    match expr {
        BoundExpr::Aggregate { .. } => Ok(()),
        BoundExpr::Literal(_) | BoundExpr::Parameter { .. } => Ok(()),
        BoundExpr::Column { name, .. } => Err(DbError::AggregatePlacement(format!(
            "{} (in {})",
            name, context
        ))),
        BoundExpr::Unary { operand, .. } | BoundExpr::IsNull { operand, .. } => {
            validate_aggregate_placement(operand, group_by, context)
        }
        BoundExpr::Binary { left, right, .. } => {
            validate_aggregate_placement(left, group_by, context)?;
            validate_aggregate_placement(right, group_by, context)
        }
        BoundExpr::Like {
            operand, pattern, ..
        } => {
            validate_aggregate_placement(operand, group_by, context)?;
            validate_aggregate_placement(pattern, group_by, context)
        }
        BoundExpr::Function { args, .. } => {
            for arg in args {
                validate_aggregate_placement(arg, group_by, context)?;
            }
            Ok(())
        }
    }
}

/// Render an expression back to SQL text. Used to persist DEFAULT
/// expressions in the catalog.
pub fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(Value::Text(s)) => format!("'{}'", s.replace('\'', "''")),
        Expr::Literal(v) => v.to_string(),
        Expr::Column { table: Some(t), name, .. } => format!("{}.{}", t, name),
        Expr::Column { table: None, name, .. } => name.clone(),
        Expr::Parameter { index } => format!("?{}", index + 1),
        Expr::Unary { op, operand } => match op {
            UnaryOp::Neg => format!("-{}", render_expr(operand)),
            UnaryOp::Not => format!("NOT {}", render_expr(operand)),
        },
        Expr::Binary { op, left, right } => {
            let op = match op {
                BinaryOp::And => "AND",
                BinaryOp::Or => "OR",
                BinaryOp::Eq => "=",
                BinaryOp::NotEq => "<>",
                BinaryOp::Lt => "<",
                BinaryOp::LtEq => "<=",
                BinaryOp::Gt => ">",
                BinaryOp::GtEq => ">=",
                BinaryOp::Add => "+",
                BinaryOp::Sub => "-",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                BinaryOp::Mod => "%",
            };
            format!("({} {} {})", render_expr(left), op, render_expr(right))
        }
        Expr::IsNull { operand, negated } => format!(
            "({} IS {}NULL)",
            render_expr(operand),
            if *negated { "NOT " } else { "" }
        ),
        Expr::Between {
            operand,
            low,
            high,
            negated,
        } => format!(
            "({} {}BETWEEN {} AND {})",
            render_expr(operand),
            if *negated { "NOT " } else { "" },
            render_expr(low),
            render_expr(high)
        ),
        Expr::InList {
            operand,
            list,
            negated,
        } => {
            let items = list.iter().map(render_expr).collect::<Vec<_>>().join(", ");
            format!(
                "({} {}IN ({}))",
                render_expr(operand),
                if *negated { "NOT " } else { "" },
                items
            )
        }
        Expr::Like {
            operand,
            pattern,
            negated,
        } => format!(
            "({} {}LIKE {})",
            render_expr(operand),
            if *negated { "NOT " } else { "" },
            render_expr(pattern)
        ),
        Expr::Function { name, args, star, .. } => {
            if *star {
                format!("{}(*)", name)
            } else {
                let inner = args.iter().map(render_expr).collect::<Vec<_>>().join(", ");
                format!("{}({})", name, inner)
            }
        }
        Expr::Subquery(_) => "(SELECT …)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::BufferPool;
    use crate::storage::disk::DiskManager;
    use crate::storage::space::SpaceManager;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn catalog(dir: &tempfile::TempDir) -> Catalog {
        let disk = Arc::new(DiskManager::open(dir.path().join("r.adb"), 4096).unwrap());
        let buffer = Arc::new(BufferPool::new(32, Arc::clone(&disk)));
        let space = Arc::new(SpaceManager::new(Arc::clone(&disk)));
        let catalog = Catalog::open(disk, buffer, space, deadline()).unwrap();
        catalog
            .create_table(
                "users",
                vec![
                    Column::new("id", DataType::Integer).primary_key(),
                    Column::new("name", DataType::Text).not_null(),
                    Column::new("age", DataType::Integer),
                ],
                deadline(),
            )
            .unwrap();
        catalog
            .create_table(
                "orders",
                vec![
                    Column::new("uid", DataType::Integer),
                    Column::new("amt", DataType::Real),
                ],
                deadline(),
            )
            .unwrap();
        catalog
    }

    fn resolve_one(catalog: &Catalog, sql: &str) -> Result<ResolvedStatement> {
        let (mut stmts, errors) = crate::sql::parser::parse(sql);
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        Resolver::new(catalog).resolve(&stmts.remove(0))
    }

    #[test]
    fn test_qualified_and_unqualified_resolution() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let resolved =
            resolve_one(&catalog, "SELECT u.name, age FROM users u WHERE id = 1").unwrap();
        assert_eq!(resolved.kind, StatementKind::Select);
        let select = match resolved.stmt {
            BoundStatement::Select(s) => s,
            _ => panic!(),
        };
        match &select.items[0].0 {
            BoundExpr::Column { offset, ty, .. } => {
                assert_eq!(*offset, 1);
                assert_eq!(*ty, DataType::Text);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_name() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let err = resolve_one(&catalog, "SELECT missing FROM users").unwrap_err();
        assert!(matches!(err, DbError::Semantic(_)));
    }

    #[test]
    fn test_ambiguous_name_across_tables() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        catalog
            .create_table(
                "profiles",
                vec![Column::new("id", DataType::Integer)],
                deadline(),
            )
            .unwrap();
        let err = resolve_one(&catalog, "SELECT id FROM users, profiles").unwrap_err();
        assert!(matches!(err, DbError::Ambiguous(_)));
    }

    #[test]
    fn test_wildcard_expansion_order() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let resolved = resolve_one(&catalog, "SELECT * FROM users, orders").unwrap();
        let select = match resolved.stmt {
            BoundStatement::Select(s) => s,
            _ => panic!(),
        };
        let names: Vec<&str> = select.items.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "age", "uid", "amt"]);
        // Offsets are flat across both tables.
        match &select.items[3].0 {
            BoundExpr::Column { offset, .. } => assert_eq!(*offset, 3),
            _ => panic!(),
        }
    }

    #[test]
    fn test_alias_shadows_real_name() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        // Once aliased, the real name is not a valid qualifier.
        assert!(resolve_one(&catalog, "SELECT users.name FROM users u").is_err());
        assert!(resolve_one(&catalog, "SELECT u.name FROM users u").is_ok());
    }

    #[test]
    fn test_arithmetic_type_inference() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let resolved =
            resolve_one(&catalog, "SELECT age + 1, amt * 2 FROM users, orders").unwrap();
        let select = match resolved.stmt {
            BoundStatement::Select(s) => s,
            _ => panic!(),
        };
        assert_eq!(select.items[0].0.ty(), Some(DataType::Integer));
        assert_eq!(select.items[1].0.ty(), Some(DataType::Real));
    }

    #[test]
    fn test_arithmetic_on_text_rejected() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        assert!(matches!(
            resolve_one(&catalog, "SELECT name + 1 FROM users"),
            Err(DbError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_aggregate_placement_rejection() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let err = resolve_one(&catalog, "SELECT name, COUNT(*) FROM users").unwrap_err();
        match err {
            DbError::AggregatePlacement(msg) => assert!(msg.contains("name")),
            other => panic!("expected aggregate placement error, got {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_in_where_rejected() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let err =
            resolve_one(&catalog, "SELECT COUNT(*) FROM users WHERE COUNT(*) > 1").unwrap_err();
        assert!(matches!(err, DbError::Semantic(_)));
    }

    #[test]
    fn test_group_by_composition_allowed() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        // uid appears in GROUP BY; uid + 1 is composed of it.
        assert!(resolve_one(
            &catalog,
            "SELECT uid + 1, SUM(amt) FROM orders GROUP BY uid"
        )
        .is_ok());
    }

    #[test]
    fn test_function_types() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let resolved = resolve_one(
            &catalog,
            "SELECT COUNT(*), SUM(amt), AVG(amt), MAX(amt) FROM orders",
        )
        .unwrap();
        let select = match resolved.stmt {
            BoundStatement::Select(s) => s,
            _ => panic!(),
        };
        assert_eq!(select.items[0].0.ty(), Some(DataType::Integer));
        assert_eq!(select.items[1].0.ty(), Some(DataType::Real));
        assert_eq!(select.items[2].0.ty(), Some(DataType::Real));
        assert_eq!(select.items[3].0.ty(), Some(DataType::Real));
    }

    #[test]
    fn test_insert_arity_and_types() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        assert!(resolve_one(&catalog, "INSERT INTO users VALUES (1, 'A', 30)").is_ok());
        assert!(matches!(
            resolve_one(&catalog, "INSERT INTO users VALUES (1, 'A')"),
            Err(DbError::Semantic(_))
        ));
        assert!(matches!(
            resolve_one(&catalog, "INSERT INTO users VALUES ('x', 'A', 30)"),
            Err(DbError::TypeMismatch(_))
        ));
        // Integer widens into a REAL column.
        assert!(resolve_one(&catalog, "INSERT INTO orders VALUES (1, 10)").is_ok());
    }

    #[test]
    fn test_drop_table_requires_existence() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        assert!(matches!(
            resolve_one(&catalog, "DROP TABLE missing"),
            Err(DbError::NotFound(_))
        ));
        assert!(resolve_one(&catalog, "DROP TABLE IF EXISTS missing").is_ok());
    }

    #[test]
    fn test_create_table_fk_validation() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        assert!(resolve_one(
            &catalog,
            "CREATE TABLE t (uid INTEGER, FOREIGN KEY (uid) REFERENCES users (id))"
        )
        .is_ok());
        assert!(matches!(
            resolve_one(
                &catalog,
                "CREATE TABLE t (uid TEXT, FOREIGN KEY (uid) REFERENCES users (id))"
            ),
            Err(DbError::Constraint(_))
        ));
        assert!(resolve_one(
            &catalog,
            "CREATE TABLE t (uid INTEGER, FOREIGN KEY (uid) REFERENCES missing (id))"
        )
        .is_err());
    }

    #[test]
    fn test_default_type_checked() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        assert!(resolve_one(&catalog, "CREATE TABLE t (n INTEGER DEFAULT 5)").is_ok());
        assert!(matches!(
            resolve_one(&catalog, "CREATE TABLE t (n INTEGER DEFAULT 'x')"),
            Err(DbError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_schema_version_recorded() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let before = resolve_one(&catalog, "SELECT id FROM users").unwrap();
        catalog
            .create_table("extra", vec![Column::new("x", DataType::Integer)], deadline())
            .unwrap();
        let after = resolve_one(&catalog, "SELECT id FROM users").unwrap();
        assert!(after.schema_version > before.schema_version);
    }

    #[test]
    fn test_subquery_resolves_names_then_refuses_planning() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let err = resolve_one(
            &catalog,
            "SELECT name FROM users WHERE id IN (SELECT uid FROM orders)",
        )
        .unwrap_err();
        assert!(matches!(err, DbError::Planning(_)));
    }

    #[test]
    fn test_parameter_count() {
        let dir = tempdir().unwrap();
        let catalog = catalog(&dir);
        let resolved =
            resolve_one(&catalog, "SELECT name FROM users WHERE id = ? AND age > ?").unwrap();
        assert_eq!(resolved.param_count, 2);
    }

    #[test]
    fn test_classification_has_unknown() {
        assert_eq!(
            StatementKind::from_leading_keyword("VACUUM"),
            StatementKind::Unknown
        );
        assert_eq!(
            StatementKind::from_leading_keyword("select"),
            StatementKind::Select
        );
    }
}
