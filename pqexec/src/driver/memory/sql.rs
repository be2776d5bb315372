//! The SQL subset understood by the in-memory driver
//!
//! Queries are parsed with `sqlparser`'s PostgreSQL dialect and lowered into
//! a small [`Statement`] enum with every `$n` placeholder already bound.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;

use sqlparser::ast::{
    self, visit_expressions, BinaryOperator, Expr, FromTable, ObjectType, OrderByKind,
    SelectItem, SetExpr, TableFactor, TableWithJoins, UnaryOperator, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// A stored value. `None` is SQL NULL.
pub(super) type Cell = Option<String>;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Item {
    Column(String),
    Literal(Cell),
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Projection {
    Star,
    Count,
    Items(Vec<Item>),
}

/// Conjunction of `column = value` tests.
pub(super) type Filter = Vec<(String, Cell)>;

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Statement {
    Begin,
    Commit,
    Rollback,
    CreateTable {
        name: String,
        columns: Vec<String>,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Cell>>,
        returning: Option<Projection>,
    },
    Select {
        projection: Projection,
        from: Option<String>,
        filter: Filter,
        order_by: Option<(String, bool)>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Cell)>,
        filter: Filter,
        returning: Option<Projection>,
    },
    Delete {
        table: String,
        filter: Filter,
        returning: Option<Projection>,
    },
}

impl Statement {
    /// Whether the statement changes stored data.
    pub(super) fn is_write(&self) -> bool {
        !matches!(
            self,
            Statement::Begin | Statement::Commit | Statement::Rollback | Statement::Select { .. }
        )
    }
}

/// Parse one statement, binding `$n` parameters. `Ok(None)` is an empty
/// query.
pub(super) fn parse(query: &str, params: &[&str]) -> Result<Option<Statement>, String> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, query)
        .map_err(|e| format!("syntax error: {e}"))?;
    if statements.len() > 1 {
        return Err("cannot insert multiple commands into a prepared statement".to_string());
    }
    let Some(statement) = statements.pop() else {
        return Ok(None);
    };

    let required = required_params(&statement)?;
    if required != params.len() {
        return Err(format!(
            "bind message supplies {} parameters, but prepared statement \"\" requires {}",
            params.len(),
            required
        ));
    }

    Lower { params }.statement(statement).map(Some)
}

/// Highest `$n` referenced anywhere in the statement.
fn required_params(statement: &ast::Statement) -> Result<usize, String> {
    let mut required = 0;
    let flow = visit_expressions(statement, |expr| {
        if let Expr::Value(value) = expr {
            if let Value::Placeholder(placeholder) = &value.value {
                match placeholder_index(placeholder) {
                    Some(n) => required = required.max(n),
                    None => return ControlFlow::Break(placeholder.clone()),
                }
            }
        }
        ControlFlow::Continue(())
    });
    match flow {
        ControlFlow::Break(placeholder) => {
            Err(format!("syntax error at or near \"{placeholder}\""))
        }
        ControlFlow::Continue(()) => Ok(required),
    }
}

fn placeholder_index(placeholder: &str) -> Option<usize> {
    placeholder
        .strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
}

/// A name as PostgreSQL resolves it: unquoted names fold to lower case and
/// only the last part of a qualified name is kept.
fn resolve(name: &impl fmt::Display) -> String {
    let text = name.to_string();
    let last = text.rsplit('.').next().unwrap_or_default();
    match last.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => last.to_lowercase(),
    }
}

fn unsupported(what: impl fmt::Display) -> String {
    format!("feature not supported: {what}")
}

/// Lowers parsed statements, binding parameters as it goes.
struct Lower<'a> {
    params: &'a [&'a str],
}

impl Lower<'_> {
    fn statement(&self, statement: ast::Statement) -> Result<Statement, String> {
        match statement {
            ast::Statement::StartTransaction { .. } => Ok(Statement::Begin),
            ast::Statement::Commit { .. } => Ok(Statement::Commit),
            ast::Statement::Rollback { .. } => Ok(Statement::Rollback),
            ast::Statement::CreateTable(create) => Ok(Statement::CreateTable {
                name: resolve(&create.name),
                columns: create.columns.iter().map(|c| resolve(&c.name)).collect(),
                if_not_exists: create.if_not_exists,
            }),
            ast::Statement::Drop {
                object_type: ObjectType::Table,
                if_exists,
                names,
                ..
            } => match names.as_slice() {
                [name] => Ok(Statement::DropTable {
                    name: resolve(name),
                    if_exists,
                }),
                _ => Err(unsupported("DROP TABLE with several tables")),
            },
            ast::Statement::Insert(insert) => {
                let columns = if insert.columns.is_empty() {
                    None
                } else {
                    Some(insert.columns.iter().map(resolve).collect())
                };
                let rows = match insert.source.as_deref().map(|q| q.body.as_ref()) {
                    Some(SetExpr::Values(values)) => values
                        .rows
                        .iter()
                        .map(|row| row.iter().map(|e| self.value(e)).collect())
                        .collect::<Result<Vec<_>, String>>()?,
                    _ => return Err(unsupported("INSERT without a VALUES list")),
                };
                Ok(Statement::Insert {
                    table: resolve(&insert.table),
                    columns,
                    rows,
                    returning: self.returning(insert.returning.as_deref())?,
                })
            }
            ast::Statement::Query(query) => self.select(*query),
            ast::Statement::Update(update) => {
                let assignments = update
                    .assignments
                    .iter()
                    .map(|a| Ok((resolve(&a.target), self.value(&a.value)?)))
                    .collect::<Result<Vec<_>, String>>()?;
                Ok(Statement::Update {
                    table: table_name(&update.table)?,
                    assignments,
                    filter: self.filter(update.selection.as_ref())?,
                    returning: self.returning(update.returning.as_deref())?,
                })
            }
            ast::Statement::Delete(delete) => {
                let tables = match &delete.from {
                    FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => {
                        tables
                    }
                };
                let table = match tables.as_slice() {
                    [table] => table_name(table)?,
                    _ => return Err(unsupported("DELETE from several tables")),
                };
                Ok(Statement::Delete {
                    table,
                    filter: self.filter(delete.selection.as_ref())?,
                    returning: self.returning(delete.returning.as_deref())?,
                })
            }
            other => Err(unsupported(other)),
        }
    }

    fn select(&self, query: ast::Query) -> Result<Statement, String> {
        let order_by = match &query.order_by {
            Some(order_by) => Some(order_column(order_by)?),
            None => None,
        };
        let select = match *query.body {
            SetExpr::Select(select) => select,
            other => return Err(unsupported(other)),
        };
        let from = match select.from.as_slice() {
            [] => None,
            [table] => Some(table_name(table)?),
            _ => return Err(unsupported("SELECT from several tables")),
        };
        Ok(Statement::Select {
            projection: self.projection(&select.projection)?,
            from,
            filter: self.filter(select.selection.as_ref())?,
            order_by,
        })
    }

    fn projection(&self, items: &[SelectItem]) -> Result<Projection, String> {
        match items {
            [SelectItem::Wildcard(_)] => return Ok(Projection::Star),
            [SelectItem::UnnamedExpr(Expr::Function(f))]
                if f.to_string().eq_ignore_ascii_case("count(*)") =>
            {
                return Ok(Projection::Count)
            }
            _ => {}
        }
        items
            .iter()
            .map(|item| match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    self.item(expr)
                }
                other => Err(unsupported(other)),
            })
            .collect::<Result<Vec<_>, String>>()
            .map(Projection::Items)
    }

    fn item(&self, expr: &Expr) -> Result<Item, String> {
        match expr {
            Expr::Identifier(ident) => Ok(Item::Column(resolve(ident))),
            other => self.value(other).map(Item::Literal),
        }
    }

    fn returning(&self, items: Option<&[SelectItem]>) -> Result<Option<Projection>, String> {
        let Some(items) = items else {
            return Ok(None);
        };
        match self.projection(items)? {
            Projection::Count => Err("aggregate functions are not allowed in RETURNING".to_string()),
            projection => Ok(Some(projection)),
        }
    }

    fn filter(&self, selection: Option<&Expr>) -> Result<Filter, String> {
        let mut filter = Vec::new();
        if let Some(expr) = selection {
            self.conjuncts(expr, &mut filter)?;
        }
        Ok(filter)
    }

    fn conjuncts(&self, expr: &Expr, filter: &mut Filter) -> Result<(), String> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.conjuncts(left, filter)?;
                self.conjuncts(right, filter)
            }
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => match left.as_ref() {
                Expr::Identifier(column) => {
                    filter.push((resolve(column), self.value(right)?));
                    Ok(())
                }
                other => Err(unsupported(other)),
            },
            Expr::Nested(inner) => self.conjuncts(inner, filter),
            other => Err(unsupported(other)),
        }
    }

    fn value(&self, expr: &Expr) -> Result<Cell, String> {
        match expr {
            Expr::Value(value) => self.literal(&value.value),
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => Ok(self.value(expr)?.map(|n| format!("-{n}"))),
            Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => self.value(inner),
            Expr::Identifier(ident) => Err(format!("column \"{}\" does not exist", resolve(ident))),
            other => Err(unsupported(other)),
        }
    }

    fn literal(&self, value: &Value) -> Result<Cell, String> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n, _) => Ok(Some(n.clone())),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(if *b { "t" } else { "f" }.to_string())),
            Value::Placeholder(placeholder) => placeholder_index(placeholder)
                .and_then(|n| self.params.get(n - 1))
                .map(|v| Some(v.to_string()))
                .ok_or_else(|| format!("there is no parameter {placeholder}")),
            other => Err(unsupported(other)),
        }
    }
}

fn table_name(table: &TableWithJoins) -> Result<String, String> {
    if !table.joins.is_empty() {
        return Err(unsupported("JOIN"));
    }
    match &table.relation {
        TableFactor::Table { name, .. } => Ok(resolve(name)),
        other => Err(unsupported(other)),
    }
}

/// The single `column [ASC|DESC]` ordering supported; `true` means descending.
fn order_column(order_by: &ast::OrderBy) -> Result<(String, bool), String> {
    match &order_by.kind {
        OrderByKind::Expressions(exprs) => match exprs.as_slice() {
            [only] => match &only.expr {
                Expr::Identifier(column) => Ok((resolve(column), only.options.asc == Some(false))),
                other => Err(unsupported(other)),
            },
            _ => Err(unsupported("ORDER BY on several columns")),
        },
        OrderByKind::All(_) => Err(unsupported("ORDER BY ALL")),
    }
}

/// Outcome of a statement that succeeded.
#[derive(Debug, Clone, PartialEq)]
pub(super) enum Outcome {
    Command,
    Rows { nfields: usize, rows: Vec<Vec<Cell>> },
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    fn index_of(&self, table: &str, column: &str) -> Result<usize, String> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| format!("column \"{column}\" of relation \"{table}\" does not exist"))
    }

    fn matching(&self, table: &str, filter: &Filter) -> Result<Vec<usize>, String> {
        let tests = filter
            .iter()
            .map(|(column, value)| Ok((self.index_of(table, column)?, value)))
            .collect::<Result<Vec<_>, String>>()?;
        Ok(self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                tests
                    .iter()
                    .all(|(idx, value)| value.is_some() && &row[*idx] == *value)
            })
            .map(|(i, _)| i)
            .collect())
    }

    fn project(
        &self,
        table: &str,
        projection: &Projection,
        rows: &[&Vec<Cell>],
    ) -> Result<Outcome, String> {
        match projection {
            Projection::Star => Ok(Outcome::Rows {
                nfields: self.columns.len(),
                rows: rows.iter().map(|r| (*r).clone()).collect(),
            }),
            Projection::Count => Ok(Outcome::Rows {
                nfields: 1,
                rows: vec![vec![Some(rows.len().to_string())]],
            }),
            Projection::Items(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(match item {
                        Item::Column(c) => Ok(self.index_of(table, c)?),
                        Item::Literal(v) => Err(v.clone()),
                    });
                }
                let rows = rows
                    .iter()
                    .map(|row| {
                        resolved
                            .iter()
                            .map(|r| match r {
                                Ok(idx) => row[*idx].clone(),
                                Err(literal) => literal.clone(),
                            })
                            .collect()
                    })
                    .collect();
                Ok(Outcome::Rows {
                    nfields: items.len(),
                    rows,
                })
            }
        }
    }
}

/// Tables keyed by name.
#[derive(Debug, Clone, Default)]
pub(super) struct Database {
    tables: BTreeMap<String, Table>,
}

impl Database {
    fn table(&self, name: &str) -> Result<&Table, String> {
        self.tables
            .get(name)
            .ok_or_else(|| format!("relation \"{name}\" does not exist"))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table, String> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| format!("relation \"{name}\" does not exist"))
    }

    /// Run a data statement. Transaction control is handled by the caller.
    pub(super) fn apply(&mut self, statement: &Statement) -> Result<Outcome, String> {
        match statement {
            Statement::Begin | Statement::Commit | Statement::Rollback => Ok(Outcome::Command),
            Statement::CreateTable {
                name,
                columns,
                if_not_exists,
            } => {
                if self.tables.contains_key(name) {
                    if *if_not_exists {
                        return Ok(Outcome::Command);
                    }
                    return Err(format!("relation \"{name}\" already exists"));
                }
                self.tables.insert(
                    name.clone(),
                    Table {
                        columns: columns.clone(),
                        rows: Vec::new(),
                    },
                );
                Ok(Outcome::Command)
            }
            Statement::DropTable { name, if_exists } => {
                if self.tables.remove(name).is_none() && !*if_exists {
                    return Err(format!("table \"{name}\" does not exist"));
                }
                Ok(Outcome::Command)
            }
            Statement::Insert {
                table,
                columns,
                rows,
                returning,
            } => self.insert(table, columns.as_deref(), rows, returning.as_ref()),
            Statement::Select {
                projection,
                from,
                filter,
                order_by,
            } => match from {
                Some(table) => self.select(table, projection, filter, order_by.as_ref()),
                None => select_literals(projection),
            },
            Statement::Update {
                table,
                assignments,
                filter,
                returning,
            } => {
                let t = self.table_mut(table)?;
                let targets = assignments
                    .iter()
                    .map(|(column, value)| Ok((t.index_of(table, column)?, value.clone())))
                    .collect::<Result<Vec<_>, String>>()?;
                let matched = t.matching(table, filter)?;
                for &i in &matched {
                    for (idx, value) in &targets {
                        t.rows[i][*idx] = value.clone();
                    }
                }
                let t = &*t;
                returned(t, table, returning.as_ref(), matched.iter().map(|&i| &t.rows[i]))
            }
            Statement::Delete {
                table,
                filter,
                returning,
            } => {
                let t = self.table_mut(table)?;
                let matched = t.matching(table, filter)?;
                let mut removed = Vec::with_capacity(matched.len());
                for &i in matched.iter().rev() {
                    removed.push(t.rows.remove(i));
                }
                removed.reverse();
                returned(t, table, returning.as_ref(), removed.iter())
            }
        }
    }

    fn insert(
        &mut self,
        table: &str,
        columns: Option<&[String]>,
        rows: &[Vec<Cell>],
        returning: Option<&Projection>,
    ) -> Result<Outcome, String> {
        let t = self.table_mut(table)?;
        let targets: Vec<usize> = match columns {
            Some(columns) => columns
                .iter()
                .map(|c| t.index_of(table, c))
                .collect::<Result<_, _>>()?,
            None => (0..t.columns.len()).collect(),
        };

        let mut inserted = Vec::with_capacity(rows.len());
        for values in rows {
            match values.len().cmp(&targets.len()) {
                Ordering::Greater => {
                    return Err("INSERT has more expressions than target columns".to_string())
                }
                Ordering::Less if columns.is_some() => {
                    return Err("INSERT has more target columns than expressions".to_string())
                }
                _ => {}
            }
            let mut row = vec![None; t.columns.len()];
            for (idx, value) in targets.iter().zip(values) {
                row[*idx] = value.clone();
            }
            inserted.push(row);
        }

        t.rows.extend(inserted.iter().cloned());
        returned(t, table, returning, inserted.iter())
    }

    fn select(
        &self,
        table: &str,
        projection: &Projection,
        filter: &Filter,
        order_by: Option<&(String, bool)>,
    ) -> Result<Outcome, String> {
        let t = self.table(table)?;
        let mut rows: Vec<&Vec<Cell>> = t
            .matching(table, filter)?
            .into_iter()
            .map(|i| &t.rows[i])
            .collect();
        if let Some((column, descending)) = order_by {
            let idx = t.index_of(table, column)?;
            rows.sort_by(|a, b| compare_cells(&a[idx], &b[idx]));
            if *descending {
                rows.reverse();
            }
        }
        t.project(table, projection, &rows)
    }
}

fn returned<'r>(
    t: &Table,
    table: &str,
    returning: Option<&Projection>,
    rows: impl Iterator<Item = &'r Vec<Cell>>,
) -> Result<Outcome, String> {
    match returning {
        Some(projection) => t.project(table, projection, &rows.collect::<Vec<_>>()),
        None => Ok(Outcome::Command),
    }
}

fn select_literals(projection: &Projection) -> Result<Outcome, String> {
    match projection {
        Projection::Items(items) => {
            let row = items
                .iter()
                .map(|item| match item {
                    Item::Literal(v) => Ok(v.clone()),
                    Item::Column(c) => Err(format!("column \"{c}\" does not exist")),
                })
                .collect::<Result<Vec<_>, String>>()?;
            Ok(Outcome::Rows {
                nfields: row.len(),
                rows: vec![row],
            })
        }
        _ => Err("SELECT * with no tables specified is not valid".to_string()),
    }
}

/// NULLs sort last; numbers compare numerically.
fn compare_cells(a: &Cell, b: &Cell) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(b),
        },
    }
}
