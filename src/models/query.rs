//! Query clause model shared by every backend.
//!
//! [`QueryState`] is the accumulated, backend-neutral description of a
//! query. Builders never mutate a state in place: every clause method
//! consumes a clone and returns the extended copy.

use crate::models::entity::{Model, Row};
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::LazyLock;

static SAFE_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z_][a-zA-Z0-9_]*)*$")
        .expect("identifier pattern compiles")
});

/// Letters, digits and underscores, optionally dot-qualified (`users.id`).
pub fn is_safe_identifier(column: &str) -> bool {
    SAFE_IDENTIFIER.is_match(column)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    /// Trimmed, case-insensitive `ASC`/`DESC`; anything else is `Asc`.
    pub fn normalize(direction: &str) -> Self {
        match direction.trim().to_uppercase().as_str() {
            "DESC" => Self::Desc,
            _ => Self::Asc,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
}

impl Operator {
    pub fn parse(op: &str) -> Option<Self> {
        match op.trim().to_uppercase().as_str() {
            "=" | "==" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            "LIKE" => Some(Self::Like),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Like => "LIKE",
        }
    }
}

/// A single filter predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        column: String,
        op: Operator,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
        negated: bool,
    },
    Null {
        column: String,
        negated: bool,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    /// Column equality for every entry, as produced from an entity's non-zero fields.
    Fields(Row),
    /// Backend expression with `?` placeholders.
    Raw { sql: String, bindings: Vec<Value> },
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Operator::Eq, value)
    }

    pub fn compare(column: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn raw(sql: impl Into<String>, bindings: impl IntoIterator<Item = Value>) -> Self {
        Self::Raw {
            sql: sql.into(),
            bindings: bindings.into_iter().collect(),
        }
    }

    pub fn fields(row: Row) -> Self {
        Self::Fields(row)
    }
}

impl From<Row> for Condition {
    fn from(row: Row) -> Self {
        Self::Fields(row)
    }
}

impl From<&str> for Condition {
    fn from(sql: &str) -> Self {
        Self::raw(sql, Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub connective: Connective,
    pub condition: Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Join,
    Left,
    Right,
    Inner,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Join => "JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Inner => "INNER JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub on: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawQuery {
    pub sql: String,
    pub bindings: Vec<Value>,
}

/// Static facts about the entity a builder is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMeta {
    pub table: String,
    pub primary_key: String,
    pub soft_delete_column: Option<String>,
}

impl ModelMeta {
    pub fn of(model: &dyn Model) -> Self {
        Self {
            table: model.table_name().to_string(),
            primary_key: model.primary_key().to_string(),
            soft_delete_column: model.soft_delete_column().map(str::to_string),
        }
    }

    /// Soft-delete column when `scoped` is set, `None` otherwise.
    pub fn scope_column(&self, scoped: bool) -> Option<&str> {
        if scoped {
            self.soft_delete_column.as_deref()
        } else {
            None
        }
    }
}

/// Accumulated clauses of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub selects: Vec<String>,
    pub filters: Vec<Filter>,
    pub joins: Vec<Join>,
    pub group_by: Vec<String>,
    pub having: Vec<Condition>,
    pub orders: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub eager: Vec<String>,
    pub scoped: bool,
    pub raw: Option<RawQuery>,
}

impl Default for QueryState {
    fn default() -> Self {
        Self {
            selects: Vec::new(),
            filters: Vec::new(),
            joins: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            orders: Vec::new(),
            limit: None,
            offset: None,
            eager: Vec::new(),
            scoped: true,
            raw: None,
        }
    }
}

impl QueryState {
    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selects.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.filters.push(Filter {
            connective: Connective::And,
            condition,
        });
        self
    }

    pub fn or(mut self, condition: Condition) -> Self {
        self.filters.push(Filter {
            connective: Connective::Or,
            condition,
        });
        self
    }

    pub fn join(mut self, kind: JoinKind, table: impl Into<String>, on: impl Into<String>) -> Self {
        self.joins.push(Join {
            kind,
            table: table.into(),
            on: on.into(),
        });
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn having(mut self, condition: Condition) -> Self {
        self.having.push(condition);
        self
    }

    /// Invalid column names leave the ordering untouched.
    pub fn order_by(mut self, column: &str, direction: &str) -> Self {
        if !is_safe_identifier(column) {
            return self;
        }
        self.orders.push(OrderBy {
            column: column.to_string(),
            direction: Direction::normalize(direction),
        });
        self
    }

    /// Negative values leave the state unchanged.
    pub fn limit(mut self, limit: i64) -> Self {
        if let Ok(limit) = u64::try_from(limit) {
            self.limit = Some(limit);
        }
        self
    }

    /// Negative values leave the state unchanged.
    pub fn offset(mut self, offset: i64) -> Self {
        if let Ok(offset) = u64::try_from(offset) {
            self.offset = Some(offset);
        }
        self
    }

    pub fn with<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for relation in relations {
            let relation = relation.into();
            if !self.eager.contains(&relation) {
                self.eager.push(relation);
            }
        }
        self
    }

    pub fn scoped(mut self, scoped: bool) -> Self {
        self.scoped = scoped;
        self
    }

    pub fn raw(mut self, sql: impl Into<String>, bindings: Vec<Value>) -> Self {
        self.raw = Some(RawQuery {
            sql: sql.into(),
            bindings,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_safe_identifier_grammar() {
        assert!(is_safe_identifier("name"));
        assert!(is_safe_identifier("_private"));
        assert!(is_safe_identifier("users.created_at"));
        assert!(is_safe_identifier("a.b.c"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("1abc"));
        assert!(!is_safe_identifier("name; DROP TABLE users"));
        assert!(!is_safe_identifier("users."));
        assert!(!is_safe_identifier("users..id"));
        assert!(!is_safe_identifier("na-me"));
    }

    #[test]
    fn test_direction_normalization() {
        assert_eq!(Direction::normalize("desc"), Direction::Desc);
        assert_eq!(Direction::normalize("  DeSc "), Direction::Desc);
        assert_eq!(Direction::normalize("asc"), Direction::Asc);
        assert_eq!(Direction::normalize("descending"), Direction::Asc);
        assert_eq!(Direction::normalize(""), Direction::Asc);
    }

    #[test]
    fn test_direction_random_strings_default_to_asc() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let len = rng.gen_range(0..8);
            let s: String = (0..len)
                .map(|_| rng.gen_range(b'!'..=b'~') as char)
                .collect();
            let expected = if s.trim().eq_ignore_ascii_case("desc") {
                Direction::Desc
            } else {
                Direction::Asc
            };
            assert_eq!(Direction::normalize(&s), expected, "input {:?}", s);
        }
    }

    #[test]
    fn test_invalid_order_column_is_dropped() {
        let state = QueryState::default().order_by("name; --", "DESC");
        assert!(state.orders.is_empty());

        let state = QueryState::default().order_by("users.name", "desc");
        assert_eq!(
            state.orders,
            vec![OrderBy {
                column: "users.name".into(),
                direction: Direction::Desc
            }]
        );
    }

    #[test]
    fn test_negative_limit_and_offset_are_ignored() {
        let base = QueryState::default().limit(10).offset(5);
        let same = base.clone().limit(-1).offset(-20);
        assert_eq!(same, base);

        let changed = base.limit(0).offset(0);
        assert_eq!(changed.limit, Some(0));
        assert_eq!(changed.offset, Some(0));
    }

    #[test]
    fn test_with_deduplicates_relations() {
        let state = QueryState::default().with(["posts", "roles"]).with(["posts"]);
        assert_eq!(state.eager, vec!["posts".to_string(), "roles".to_string()]);
    }

    #[test]
    fn test_operator_parse() {
        assert_eq!(Operator::parse(">="), Some(Operator::Gte));
        assert_eq!(Operator::parse("like"), Some(Operator::Like));
        assert_eq!(Operator::parse("<>"), Some(Operator::Ne));
        assert_eq!(Operator::parse("~"), None);
    }
}
