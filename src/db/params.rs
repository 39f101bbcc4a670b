//! Parameter binding utilities for database queries.
//!
//! Row values arrive as `serde_json::Value`. [`BindValue::from_json`] picks
//! the SQL type each value is sent as, per dialect; the `bind_*` functions
//! attach it to a dialect-specific query.

use crate::db::DatabaseType;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// A value ready to be bound.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
}

impl BindValue {
    pub fn from_json(value: &Value, db: DatabaseType) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let (Some(u), DatabaseType::MySql) = (n.as_u64(), db) {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or_default())
                }
            }
            // Timestamp columns on Postgres and MySQL reject text parameters.
            Value::String(s) if db != DatabaseType::SQLite => {
                match DateTime::parse_from_rfc3339(s) {
                    Ok(ts) => Self::Timestamp(ts.with_timezone(&Utc)),
                    Err(_) => Self::String(s.clone()),
                }
            }
            Value::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    pub fn from_all(values: &[Value], db: DatabaseType) -> Vec<Self> {
        values.iter().map(|v| Self::from_json(v, db)).collect()
    }
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &BindValue,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Bool(v) => query.bind(*v),
        BindValue::Int(v) => query.bind(*v),
        BindValue::UInt(v) => query.bind(*v),
        BindValue::Float(v) => query.bind(*v),
        BindValue::String(v) => query.bind(v.clone()),
        BindValue::Timestamp(v) => query.bind(*v),
        BindValue::Json(v) => query.bind(Json(v.clone())),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &BindValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Bool(v) => query.bind(*v),
        BindValue::Int(v) => query.bind(*v),
        // Postgres has no unsigned 64-bit type; from_json never produces this for it.
        BindValue::UInt(v) => query.bind(*v as f64),
        BindValue::Float(v) => query.bind(*v),
        BindValue::String(v) => query.bind(v.clone()),
        BindValue::Timestamp(v) => query.bind(*v),
        BindValue::Json(v) => query.bind(Json(v.clone())),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &BindValue,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        BindValue::Null => query.bind(None::<String>),
        BindValue::Bool(v) => query.bind(*v),
        BindValue::Int(v) => query.bind(*v),
        BindValue::UInt(v) => query.bind(*v as f64),
        BindValue::Float(v) => query.bind(*v),
        BindValue::String(v) => query.bind(v.clone()),
        BindValue::Timestamp(v) => query.bind(v.to_rfc3339()),
        // SQLite doesn't have native JSON type, store as string
        BindValue::Json(v) => query.bind(v.to_string()),
    }
}
