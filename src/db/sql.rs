//! SQL rendering for the sqlx backend.
//!
//! Turns a [`QueryState`] into dialect-specific SQL text plus positional
//! parameters. Identifiers matching the safe-identifier grammar are quoted;
//! anything else in a select list, join target or `on` clause is passed
//! through as a raw expression. `NULL` is always rendered inline, since an
//! untyped null parameter is rejected by Postgres in most positions.

use crate::db::DatabaseType;
use crate::error::{DbError, DbResult};
use crate::models::entity::is_zero_value;
use crate::models::{
    Condition, Connective, Filter, ModelMeta, Operator, QueryState, Row, is_safe_identifier,
};
use serde_json::Value;

/// Rendered SQL with its parameters in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.sql, self.params)
    }
}

/// One multi-row `INSERT`, covering rows that share the same column set.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub statement: Statement,
    /// The rows as sent, without zero-valued primary keys.
    pub rows: Vec<Row>,
    /// Whether the statement ends in `RETURNING *`.
    pub returning: bool,
}

/// Quote an identifier, leaving `*` and non-identifier expressions untouched.
pub fn quote(db: DatabaseType, ident: &str) -> String {
    if ident == "*" {
        return ident.to_string();
    }
    if let Some(prefix) = ident.strip_suffix(".*") {
        if is_safe_identifier(prefix) {
            return format!("{}.*", quote(db, prefix));
        }
        return ident.to_string();
    }
    if !is_safe_identifier(ident) {
        return ident.to_string();
    }
    let q = match db {
        DatabaseType::MySql => '`',
        DatabaseType::Postgres | DatabaseType::SQLite => '"',
    };
    ident
        .split('.')
        .map(|part| {
            let escaped = part.replace(q, &format!("{q}{q}"));
            format!("{q}{escaped}{q}")
        })
        .collect::<Vec<_>>()
        .join(".")
}

struct Writer {
    db: DatabaseType,
    sql: String,
    params: Vec<Value>,
}

impl Writer {
    fn new(db: DatabaseType) -> Self {
        Self {
            db,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        self.sql.push_str(text);
    }

    fn push_ident(&mut self, ident: &str) {
        let quoted = quote(self.db, ident);
        self.sql.push_str(&quoted);
    }

    /// Column that must be a plain identifier.
    fn push_column(&mut self, column: &str) -> DbResult<()> {
        if !is_safe_identifier(column) {
            return Err(DbError::validation(format!("invalid column name: {column}")));
        }
        self.push_ident(column);
        Ok(())
    }

    fn push_value(&mut self, value: &Value) {
        if value.is_null() {
            self.sql.push_str("NULL");
            return;
        }
        self.params.push(value.clone());
        match self.db {
            DatabaseType::Postgres => {
                let n = self.params.len();
                self.sql.push_str(&format!("${n}"));
            }
            DatabaseType::MySql | DatabaseType::SQLite => self.sql.push('?'),
        }
    }

    fn push_values(&mut self, values: &[Value]) {
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.push_value(value);
        }
    }

    /// Copy a raw fragment, replacing each `?` outside quotes with the next binding.
    fn push_raw(&mut self, sql: &str, bindings: &[Value]) -> DbResult<()> {
        let expected = count_placeholders(sql);
        if expected != bindings.len() {
            return Err(DbError::validation(format!(
                "raw expression expects {} bindings, got {}",
                expected,
                bindings.len()
            )));
        }
        let mut next = bindings.iter();
        let mut quote: Option<char> = None;
        for ch in sql.chars() {
            match (quote, ch) {
                (Some(q), c) if c == q => {
                    quote = None;
                    self.sql.push(c);
                }
                (Some(_), c) => self.sql.push(c),
                (None, '\'' | '"' | '`') => {
                    quote = Some(ch);
                    self.sql.push(ch);
                }
                (None, '?') => match next.next() {
                    Some(value) => self.push_value(value),
                    None => self.sql.push('?'),
                },
                (None, c) => self.sql.push(c),
            }
        }
        Ok(())
    }

    fn push_condition(&mut self, condition: &Condition) -> DbResult<()> {
        match condition {
            Condition::Compare { column, op, value } => {
                self.push_column(column)?;
                match (value.is_null(), op) {
                    (true, Operator::Eq) => self.push(" IS NULL"),
                    (true, Operator::Ne) => self.push(" IS NOT NULL"),
                    _ => {
                        self.push(&format!(" {} ", op.as_sql()));
                        self.push_value(value);
                    }
                }
            }
            Condition::In {
                column,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // IN () is a syntax error; keep its meaning instead.
                    self.push(if *negated { "1 = 1" } else { "1 = 0" });
                    return Ok(());
                }
                self.push_column(column)?;
                self.push(if *negated { " NOT IN (" } else { " IN (" });
                self.push_values(values);
                self.push(")");
            }
            Condition::Null { column, negated } => {
                self.push_column(column)?;
                self.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Condition::Between { column, low, high } => {
                self.push_column(column)?;
                self.push(" BETWEEN ");
                self.push_value(low);
                self.push(" AND ");
                self.push_value(high);
            }
            Condition::Fields(row) => {
                if row.is_empty() {
                    self.push("1 = 1");
                    return Ok(());
                }
                for (i, (column, value)) in row.iter().enumerate() {
                    if i > 0 {
                        self.push(" AND ");
                    }
                    self.push_column(column)?;
                    if value.is_null() {
                        self.push(" IS NULL");
                    } else {
                        self.push(" = ");
                        self.push_value(value);
                    }
                }
            }
            Condition::Raw { sql, bindings } => self.push_raw(sql, bindings)?,
        }
        Ok(())
    }

    fn push_filters(&mut self, filters: &[Filter]) -> DbResult<()> {
        for (i, filter) in filters.iter().enumerate() {
            if i > 0 {
                self.push(match filter.connective {
                    Connective::And => " AND ",
                    Connective::Or => " OR ",
                });
            }
            self.push("(");
            self.push_condition(&filter.condition)?;
            self.push(")");
        }
        Ok(())
    }

    /// `WHERE` clause from the filters plus the soft-delete scope.
    fn push_where(&mut self, meta: &ModelMeta, state: &QueryState) -> DbResult<()> {
        let scope = meta.scope_column(state.scoped);
        if state.filters.is_empty() && scope.is_none() {
            return Ok(());
        }
        self.push(" WHERE ");
        if !state.filters.is_empty() {
            if scope.is_some() {
                self.push("(");
            }
            self.push_filters(&state.filters)?;
            if scope.is_some() {
                self.push(") AND ");
            }
        }
        if let Some(column) = scope {
            self.push_scope(&meta.table, column);
        }
        Ok(())
    }

    fn push_scope(&mut self, table: &str, column: &str) {
        self.push_ident(&format!("{table}.{column}"));
        self.push(" IS NULL");
    }

    fn push_from(&mut self, meta: &ModelMeta, state: &QueryState) {
        self.push(" FROM ");
        self.push_ident(&meta.table);
        for join in &state.joins {
            self.push(&format!(" {} ", join.kind.as_sql()));
            self.push_ident(&join.table);
            self.push(" ON ");
            self.push(&join.on);
        }
    }

    fn push_group_by(&mut self, state: &QueryState) -> DbResult<()> {
        if !state.group_by.is_empty() {
            self.push(" GROUP BY ");
            for (i, column) in state.group_by.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.push_ident(column);
            }
        }
        if !state.having.is_empty() {
            self.push(" HAVING ");
            for (i, condition) in state.having.iter().enumerate() {
                if i > 0 {
                    self.push(" AND ");
                }
                self.push("(");
                self.push_condition(condition)?;
                self.push(")");
            }
        }
        Ok(())
    }

    fn push_order_limit(&mut self, state: &QueryState) {
        if !state.orders.is_empty() {
            self.push(" ORDER BY ");
            for (i, order) in state.orders.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.push_ident(&order.column);
                self.push(&format!(" {}", order.direction.as_sql()));
            }
        }
        match (state.limit, state.offset) {
            (Some(limit), _) => self.push(&format!(" LIMIT {limit}")),
            // OFFSET alone is not valid in these dialects.
            (None, Some(_)) => match self.db {
                DatabaseType::SQLite => self.push(" LIMIT -1"),
                DatabaseType::MySql => self.push(" LIMIT 18446744073709551615"),
                DatabaseType::Postgres => {}
            },
            (None, None) => {}
        }
        if let Some(offset) = state.offset {
            self.push(&format!(" OFFSET {offset}"));
        }
    }

    fn push_select_body(&mut self, meta: &ModelMeta, state: &QueryState) -> DbResult<()> {
        self.push("SELECT ");
        if state.selects.is_empty() {
            if state.joins.is_empty() {
                self.push("*");
            } else {
                self.push_ident(&format!("{}.*", meta.table));
            }
        } else {
            for (i, column) in state.selects.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.push_ident(column);
            }
        }
        self.push_from(meta, state);
        self.push_where(meta, state)?;
        self.push_group_by(state)
    }

    fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
        }
    }
}

fn count_placeholders(sql: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut count = 0;
    for ch in sql.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (None, '?') => count += 1,
            _ => {}
        }
    }
    count
}

/// Raw SQL with `?` placeholders rewritten for the dialect.
pub fn raw(db: DatabaseType, sql: &str, bindings: &[Value]) -> DbResult<Statement> {
    let mut w = Writer::new(db);
    w.push_raw(sql, bindings)?;
    Ok(w.finish())
}

/// `SELECT` for the accumulated state. A raw query replaces the rendered one.
pub fn select(db: DatabaseType, meta: &ModelMeta, state: &QueryState) -> DbResult<Statement> {
    if let Some(query) = &state.raw {
        return raw(db, &query.sql, &query.bindings);
    }
    let mut w = Writer::new(db);
    w.push_select_body(meta, state)?;
    w.push_order_limit(state);
    Ok(w.finish())
}

/// `SELECT COUNT(*) AS aggregate`, ignoring ordering, limit and offset.
pub fn count(db: DatabaseType, meta: &ModelMeta, state: &QueryState) -> DbResult<Statement> {
    let mut w = Writer::new(db);
    if let Some(query) = &state.raw {
        w.push("SELECT COUNT(*) AS aggregate FROM (");
        w.push_raw(&query.sql, &query.bindings)?;
        w.push(") AS aggregate_table");
    } else if !state.group_by.is_empty() {
        w.push("SELECT COUNT(*) AS aggregate FROM (");
        w.push_select_body(meta, state)?;
        w.push(") AS aggregate_table");
    } else {
        w.push("SELECT COUNT(*) AS aggregate");
        w.push_from(meta, state);
        w.push_where(meta, state)?;
    }
    Ok(w.finish())
}

/// `INSERT` statements for `rows`, grouping consecutive rows with the same columns.
///
/// A primary key that is null or zero is left out so the database assigns it.
pub fn insert(db: DatabaseType, meta: &ModelMeta, rows: &[Row]) -> DbResult<Vec<InsertStatement>> {
    let mut groups: Vec<Vec<Row>> = Vec::new();
    for row in rows {
        let mut row = row.clone();
        if row.get(&meta.primary_key).is_some_and(is_zero_value) {
            row.remove(&meta.primary_key);
        }
        if let Some(column) = row.keys().find(|c| !is_safe_identifier(c)) {
            return Err(DbError::validation(format!("invalid column name: {column}")));
        }
        match groups.last_mut() {
            Some(group) if !row.is_empty() && same_columns(&group[0], &row) => group.push(row),
            _ => groups.push(vec![row]),
        }
    }

    let returning = db.supports_returning();
    let mut statements = Vec::with_capacity(groups.len());
    for group in groups {
        let mut w = Writer::new(db);
        w.push("INSERT INTO ");
        w.push_ident(&meta.table);
        let columns: Vec<&String> = group[0].keys().collect();
        if columns.is_empty() {
            w.push(match db {
                DatabaseType::MySql => " () VALUES ()",
                DatabaseType::Postgres | DatabaseType::SQLite => " DEFAULT VALUES",
            });
        } else {
            w.push(" (");
            for (i, column) in columns.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push_ident(column);
            }
            w.push(") VALUES ");
            for (i, row) in group.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push("(");
                for (j, column) in columns.iter().enumerate() {
                    if j > 0 {
                        w.push(", ");
                    }
                    w.push_value(row.get(column.as_str()).unwrap_or(&Value::Null));
                }
                w.push(")");
            }
        }
        if returning {
            w.push(" RETURNING *");
        }
        statements.push(InsertStatement {
            statement: w.finish(),
            rows: group,
            returning,
        });
    }
    Ok(statements)
}

fn same_columns(a: &Row, b: &Row) -> bool {
    a.len() == b.len() && a.keys().zip(b.keys()).all(|(x, y)| x == y)
}

/// `UPDATE ... SET` for the matching rows. `None` when there is nothing to set.
pub fn update(
    db: DatabaseType,
    meta: &ModelMeta,
    state: &QueryState,
    values: &Row,
) -> DbResult<Option<Statement>> {
    if values.is_empty() {
        return Ok(None);
    }
    ensure_no_joins(state, "update")?;
    let mut w = Writer::new(db);
    w.push("UPDATE ");
    w.push_ident(&meta.table);
    w.push(" SET ");
    for (i, (column, value)) in values.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.push_column(column)?;
        w.push(" = ");
        w.push_value(value);
    }
    w.push_where(meta, state)?;
    Ok(Some(w.finish()))
}

/// Delete the matching rows.
///
/// With the soft-delete scope active this stamps the soft-delete column with
/// `now` instead of removing rows; rows already marked are left alone.
pub fn delete(db: DatabaseType, meta: &ModelMeta, state: &QueryState, now: &Value) -> DbResult<Statement> {
    ensure_no_joins(state, "delete")?;
    let mut w = Writer::new(db);
    match meta.scope_column(state.scoped) {
        Some(column) => {
            w.push("UPDATE ");
            w.push_ident(&meta.table);
            w.push(" SET ");
            w.push_column(column)?;
            w.push(" = ");
            w.push_value(now);
        }
        None => {
            w.push("DELETE FROM ");
            w.push_ident(&meta.table);
        }
    }
    w.push_where(meta, state)?;
    Ok(w.finish())
}

/// Rows of `table` whose `column` is one of `values`, for eager loading.
pub fn select_in(
    db: DatabaseType,
    table: &str,
    column: &str,
    values: &[Value],
    scope_column: Option<&str>,
) -> DbResult<Statement> {
    let mut w = Writer::new(db);
    w.push("SELECT * FROM ");
    w.push_ident(table);
    w.push(" WHERE ");
    w.push_condition(&Condition::In {
        column: column.to_string(),
        values: values.to_vec(),
        negated: false,
    })?;
    if let Some(scope) = scope_column {
        w.push(" AND ");
        w.push_scope(table, scope);
    }
    Ok(w.finish())
}

fn ensure_no_joins(state: &QueryState, operation: &str) -> DbResult<()> {
    if state.joins.is_empty() {
        Ok(())
    } else {
        Err(DbError::unsupported("sqlx", format!("joins in {operation}")))
    }
}
