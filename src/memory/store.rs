//! In-process table store and predicate evaluation.

use crate::context::Context;
use crate::eager::{RelatedFetcher, key_of};
use crate::error::{DbError, DbResult};
use crate::models::entity::is_zero_value;
use crate::models::{Condition, Connective, Filter, Operator, OrderBy, Direction, Row};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

pub(crate) const BACKEND: &str = "memory";

static RAW_COMPARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)*)\s*(=|==|!=|<>|<=|>=|<|>|like)\s*\?$")
        .expect("raw compare pattern compiles")
});

static RAW_NULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([a-z_][a-z0-9_]*(?:\.[a-z_][a-z0-9_]*)*)\s+is\s+(not\s+)?null$")
        .expect("raw null pattern compiles")
});

static RAW_AND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+and\s+").expect("raw and pattern compiles"));

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("duplicate primary key {key} in table {table}")]
    DuplicateKey { table: String, key: String },

    #[error("store is closed")]
    Closed,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub rows: Vec<Row>,
    next_id: i64,
}

impl Table {
    /// Insert `row`, assigning the next integer key when its key is zero or missing.
    fn insert(&mut self, table: &str, primary_key: &str, mut row: Row) -> Result<Row, StoreError> {
        let id = row.get(primary_key).cloned().unwrap_or(Value::Null);
        if is_zero_value(&id) {
            self.next_id = self.next_id.max(0) + 1;
            row.insert(primary_key.to_string(), Value::from(self.next_id));
        } else {
            if let Some(n) = id.as_i64() {
                self.next_id = self.next_id.max(n);
            }
            let key = key_of(&id);
            if self
                .rows
                .iter()
                .any(|existing| existing.get(primary_key).and_then(key_of) == key)
            {
                return Err(StoreError::DuplicateKey {
                    table: table.to_string(),
                    key: key.unwrap_or_default(),
                });
            }
        }
        self.rows.push(row.clone());
        Ok(row)
    }
}

pub(crate) type Tables = HashMap<String, Table>;

/// Shared handle to one in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().await
    }

    /// Independent copy of the current contents.
    pub async fn snapshot(&self) -> MemoryStore {
        let tables = self.tables.lock().await.clone();
        MemoryStore {
            tables: Arc::new(Mutex::new(tables)),
        }
    }

    /// Replace the contents with those of `other`.
    pub async fn restore(&self, other: &MemoryStore) {
        let contents = other.tables.lock().await.clone();
        *self.tables.lock().await = contents;
    }

    pub async fn insert(
        &self,
        ctx: &Context,
        table: &str,
        primary_key: &str,
        rows: Vec<Row>,
    ) -> DbResult<Vec<Row>> {
        let mut tables = self.tables.lock().await;
        ctx.check("Create")?;
        // Work on a copy so a duplicate key halfway through leaves nothing behind.
        let mut staged = tables.get(table).cloned().unwrap_or_default();
        let mut created = Vec::with_capacity(rows.len());
        for row in rows {
            let row = staged
                .insert(table, primary_key, row)
                .map_err(|e| DbError::backend("Create", "insert failed", e))?;
            created.push(row);
        }
        tables.insert(table.to_string(), staged);
        Ok(created)
    }

    /// Rows of `table` in insertion order.
    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RelatedFetcher for MemoryStore {
    async fn fetch_in(
        &self,
        ctx: &Context,
        table: &str,
        column: &str,
        values: &[Value],
        scope_column: Option<&str>,
    ) -> DbResult<Vec<Row>> {
        ctx.check("EagerLoad")?;
        let keys: HashSet<String> = values.iter().filter_map(key_of).collect();
        let column = column_key(column);
        let tables = self.tables.lock().await;
        Ok(tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| scope_column.is_none_or(|c| is_null(row.get(c))))
                    .filter(|row| {
                        row.get(column)
                            .and_then(key_of)
                            .is_some_and(|key| keys.contains(&key))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Filters compiled into OR-separated groups of AND-ed conditions.
///
/// `a AND b OR c` is `(a AND b) OR c`, as SQL reads it.
#[derive(Debug, Default)]
pub(crate) struct Predicate {
    groups: Vec<Vec<Condition>>,
    scope_column: Option<String>,
}

impl Predicate {
    pub fn compile(filters: &[Filter], scope_column: Option<&str>) -> DbResult<Self> {
        let mut groups: Vec<Vec<Condition>> = Vec::new();
        for (i, filter) in filters.iter().enumerate() {
            if i == 0 || filter.connective == Connective::Or {
                groups.push(Vec::new());
            }
            let conditions = match &filter.condition {
                Condition::Raw { sql, bindings } => parse_raw(sql, bindings)?,
                other => vec![other.clone()],
            };
            if let Some(group) = groups.last_mut() {
                group.extend(conditions);
            }
        }
        Ok(Self {
            groups,
            scope_column: scope_column.map(str::to_string),
        })
    }

    pub fn matches(&self, row: &Row) -> bool {
        if let Some(column) = &self.scope_column {
            if !is_null(row.get(column.as_str())) {
                return false;
            }
        }
        self.groups.is_empty()
            || self
                .groups
                .iter()
                .any(|group| group.iter().all(|condition| eval(condition, row)))
    }
}

/// Split a raw `col op ? AND col IS NULL` expression into conditions.
fn parse_raw(sql: &str, bindings: &[Value]) -> DbResult<Vec<Condition>> {
    let mut bindings = bindings.iter();
    let mut conditions = Vec::new();
    for part in RAW_AND.split(sql.trim()) {
        let part = part.trim().trim_start_matches('(').trim_end_matches(')').trim();
        if let Some(caps) = RAW_COMPARE.captures(part) {
            let op = Operator::parse(&caps[2]).ok_or_else(|| unsupported_raw(sql))?;
            let value = bindings.next().cloned().ok_or_else(|| {
                DbError::validation(format!("raw condition {:?} is missing a binding", sql))
            })?;
            conditions.push(Condition::compare(&caps[1], op, value));
        } else if let Some(caps) = RAW_NULL.captures(part) {
            conditions.push(Condition::Null {
                column: caps[1].to_string(),
                negated: caps.get(2).is_some(),
            });
        } else {
            return Err(unsupported_raw(sql));
        }
    }
    if bindings.next().is_some() {
        return Err(DbError::validation(format!(
            "raw condition {:?} has more bindings than placeholders",
            sql
        )));
    }
    Ok(conditions)
}

fn unsupported_raw(sql: &str) -> DbError {
    DbError::unsupported(BACKEND, format!("raw condition {:?}", sql))
}

fn eval(condition: &Condition, row: &Row) -> bool {
    match condition {
        Condition::Compare { column, op, value } => {
            let Some(actual) = row.get(column_key(column)) else {
                return false;
            };
            match op {
                Operator::Like => like(actual, value),
                op => compare(actual, value).is_some_and(|ord| match op {
                    Operator::Eq => ord == Ordering::Equal,
                    Operator::Ne => ord != Ordering::Equal,
                    Operator::Lt => ord == Ordering::Less,
                    Operator::Lte => ord != Ordering::Greater,
                    Operator::Gt => ord == Ordering::Greater,
                    Operator::Gte => ord != Ordering::Less,
                    Operator::Like => false,
                }),
            }
        }
        Condition::In {
            column,
            values,
            negated,
        } => {
            let actual = row.get(column_key(column));
            if is_null(actual) {
                return false;
            }
            let actual = actual.unwrap_or(&Value::Null);
            let found = values
                .iter()
                .any(|v| compare(actual, v) == Some(Ordering::Equal));
            found != *negated
        }
        Condition::Null { column, negated } => is_null(row.get(column_key(column))) != *negated,
        Condition::Between { column, low, high } => row.get(column_key(column)).is_some_and(|v| {
            compare(v, low).is_some_and(|o| o != Ordering::Less)
                && compare(v, high).is_some_and(|o| o != Ordering::Greater)
        }),
        Condition::Fields(fields) => fields.iter().all(|(column, expected)| {
            let actual = row.get(column_key(column));
            if expected.is_null() {
                is_null(actual)
            } else {
                actual.and_then(|a| compare(a, expected)) == Some(Ordering::Equal)
            }
        }),
        // Expanded by Predicate::compile.
        Condition::Raw { .. } => false,
    }
}

/// SQL-style comparison. Anything involving NULL is unknown.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => match (integer(x), integer(y)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::String(y)) => compare_with_text(x, y),
        (Value::String(x), Value::Number(y)) => compare_with_text(y, x).map(Ordering::reverse),
        (Value::Bool(x), Value::Number(y)) => Some(i64::from(*x).cmp(&y.as_i64()?)),
        (Value::Number(x), Value::Bool(y)) => Some(x.as_i64()?.cmp(&i64::from(*y))),
        _ => (a == b).then_some(Ordering::Equal),
    }
}

/// Integers compare exactly; `as_f64` loses precision above 2^53.
fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn compare_with_text(n: &Number, text: &str) -> Option<Ordering> {
    if let (Some(n), Ok(text)) = (integer(n), text.parse::<i128>()) {
        return Some(n.cmp(&text));
    }
    n.as_f64()?.partial_cmp(&text.parse::<f64>().ok()?)
}

/// Case-insensitive `LIKE` with `%` and `_` wildcards.
fn like(actual: &Value, pattern: &Value) -> bool {
    let (Value::String(actual), Value::String(pattern)) = (actual, pattern) else {
        return false;
    };
    let mut expr = String::from("(?is)^");
    for ch in pattern.chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).is_ok_and(|re| re.is_match(actual))
}

/// Order rows in place. NULLs sort first, as SQLite and MySQL do.
pub(crate) fn sort_rows(rows: &mut [Row], orders: &[OrderBy]) {
    if orders.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for order in orders {
            let column = column_key(&order.column);
            let (x, y) = (a.get(column), b.get(column));
            let ord = match (is_null(x), is_null(y)) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => x
                    .zip(y)
                    .and_then(|(x, y)| compare(x, y))
                    .unwrap_or(Ordering::Equal),
            };
            let ord = match order.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Qualified names (`users.id`) resolve to their last segment.
pub(crate) fn column_key(column: &str) -> &str {
    column.rsplit('.').next().unwrap_or(column)
}

pub(crate) fn is_null(value: Option<&Value>) -> bool {
    value.is_none_or(Value::is_null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryState;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn predicate(state: QueryState) -> Predicate {
        Predicate::compile(&state.filters, None).unwrap()
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let state = QueryState::default()
            .and(Condition::eq("a", 1))
            .and(Condition::eq("b", 1))
            .or(Condition::eq("c", 1));
        let p = predicate(state);
        assert!(p.matches(&row(json!({"a": 1, "b": 1, "c": 0}))));
        assert!(p.matches(&row(json!({"a": 0, "b": 0, "c": 1}))));
        assert!(!p.matches(&row(json!({"a": 1, "b": 0, "c": 0}))));
    }

    #[test]
    fn test_null_never_compares_equal() {
        let p = predicate(QueryState::default().and(Condition::compare("n", Operator::Ne, 3)));
        assert!(!p.matches(&row(json!({"n": null}))));
        assert!(p.matches(&row(json!({"n": 4}))));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = 9_007_199_254_740_993_i64;
        assert_eq!(compare(&json!(big), &json!(big - 1)), Some(Ordering::Greater));
        assert_eq!(compare(&json!(u64::MAX), &json!(u64::MAX - 1)), Some(Ordering::Greater));
        assert_eq!(compare(&json!(-1), &json!(u64::MAX)), Some(Ordering::Less));
        assert_eq!(compare(&json!(big.to_string()), &json!(big - 1)), Some(Ordering::Greater));
        assert_eq!(compare(&json!(1.5), &json!(1)), Some(Ordering::Greater));

        let p = predicate(QueryState::default().and(Condition::eq("n", big)));
        assert!(p.matches(&row(json!({"n": big}))));
        assert!(!p.matches(&row(json!({"n": big - 1}))));
    }

    #[test]
    fn test_in_and_not_in() {
        let p = predicate(QueryState::default().and(Condition::In {
            column: "users.id".into(),
            values: vec![json!(1), json!("2")],
            negated: false,
        }));
        assert!(p.matches(&row(json!({"id": 2}))));
        assert!(!p.matches(&row(json!({"id": 3}))));

        let p = predicate(QueryState::default().and(Condition::In {
            column: "id".into(),
            values: vec![],
            negated: true,
        }));
        assert!(p.matches(&row(json!({"id": 3}))));
    }

    #[test]
    fn test_like_is_case_insensitive() {
        let p = predicate(
            QueryState::default().and(Condition::compare("name", Operator::Like, "al%")),
        );
        assert!(p.matches(&row(json!({"name": "Alice"}))));
        assert!(!p.matches(&row(json!({"name": "Bob"}))));
    }

    #[test]
    fn test_raw_conditions_are_parsed() {
        let p = predicate(
            QueryState::default().and(Condition::raw("age >= ? AND deleted_at IS NULL", vec![json!(18)])),
        );
        assert!(p.matches(&row(json!({"age": 21, "deleted_at": null}))));
        assert!(!p.matches(&row(json!({"age": 12}))));
    }

    #[test]
    fn test_unparseable_raw_is_unsupported() {
        let state = QueryState::default().and(Condition::raw("a = ? OR b = ?", vec![json!(1), json!(2)]));
        let err = Predicate::compile(&state.filters, None).unwrap_err();
        assert!(matches!(err, DbError::Unsupported { .. }));
    }

    #[test]
    fn test_raw_binding_count_mismatch() {
        let state = QueryState::default().and(Condition::raw("a = ?", vec![]));
        assert!(Predicate::compile(&state.filters, None).unwrap_err().is_validation());
    }

    #[test]
    fn test_scope_column_hides_marked_rows() {
        let p = Predicate::compile(&[], Some("deleted_at")).unwrap();
        assert!(p.matches(&row(json!({"id": 1}))));
        assert!(!p.matches(&row(json!({"id": 1, "deleted_at": "2024-01-01T00:00:00Z"}))));
    }

    #[test]
    fn test_sort_puts_nulls_first() {
        let mut rows = vec![
            row(json!({"n": 2})),
            row(json!({"n": null})),
            row(json!({"n": 1})),
        ];
        let state = QueryState::default().order_by("n", "asc");
        sort_rows(&mut rows, &state.orders);
        let ns: Vec<Value> = rows.iter().map(|r| r["n"].clone()).collect();
        assert_eq!(ns, vec![json!(null), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let created = store
            .insert(&ctx, "t", "id", vec![row(json!({"id": 0})), row(json!({"id": 7}))])
            .await
            .unwrap();
        assert_eq!(created[0]["id"], json!(1));

        let next = store.insert(&ctx, "t", "id", vec![row(json!({}))]).await.unwrap();
        assert_eq!(next[0]["id"], json!(8));

        let err = store
            .insert(&ctx, "t", "id", vec![row(json!({"id": 9})), row(json!({"id": 1}))])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Backend { .. }));
        assert_eq!(store.rows("t").await.len(), 3);
    }
}
