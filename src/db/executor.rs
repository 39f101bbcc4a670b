//! Statement execution against a pool or an open transaction.
//!
//! # Architecture
//!
//! [`SqlExecutor`] decides *where* a statement runs: on a connection checked
//! out of the pool, or on the connection held by a transaction. The
//! dialect submodules decide *how*: each is generic over `sqlx::Executor`
//! so the same code serves `&Pool` and `&mut Connection`.
//!
//! Each submodule provides identical functionality adapted to the database's
//! type system.

use crate::context::Context;
use crate::db::DatabaseType;
use crate::db::params::BindValue;
use crate::db::pool::DbPool;
use crate::db::transaction::{DbTransaction, TxHandle};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::Row;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

/// Result of a statement that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    /// Auto-increment id of the first inserted row, where the dialect reports one.
    pub last_insert_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum SqlExecutor {
    Pool(DbPool),
    Transaction(TxHandle),
}

impl SqlExecutor {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            SqlExecutor::Pool(pool) => pool.db_type(),
            SqlExecutor::Transaction(tx) => tx.db_type(),
        }
    }

    pub fn transaction(&self) -> Option<&TxHandle> {
        match self {
            SqlExecutor::Pool(_) => None,
            SqlExecutor::Transaction(tx) => Some(tx),
        }
    }

    /// Run a query and decode every returned row.
    pub async fn fetch_all(
        &self,
        ctx: &Context,
        operation: &str,
        sql: &str,
        params: &[Value],
    ) -> DbResult<Vec<Row>> {
        let params = BindValue::from_all(params, self.db_type());
        let start = Instant::now();
        debug!(operation, sql = %sql, params = params.len(), "Executing query");

        let rows = ctx
            .run(operation, async {
                let result = match self {
                    SqlExecutor::Pool(pool) => impl_db_dispatch!(DbPool, pool, {
                        MySql(p) => mysql::fetch_all(p, sql, &params).await,
                        Postgres(p) => postgres::fetch_all(p, sql, &params).await,
                        SQLite(p) => sqlite::fetch_all(p, sql, &params).await,
                    }),
                    SqlExecutor::Transaction(tx) => {
                        let mut guard = tx.lock().await;
                        let inner = guard.as_mut().ok_or_else(|| tx.inactive())?;
                        impl_db_dispatch!(DbTransaction, inner, {
                            MySql(t) => mysql::fetch_all(&mut **t, sql, &params).await,
                            Postgres(t) => postgres::fetch_all(&mut **t, sql, &params).await,
                            SQLite(t) => sqlite::fetch_all(&mut **t, sql, &params).await,
                        })
                    }
                };
                result.map_err(|e| DbError::from_sqlx(operation, e))
            })
            .await?;

        debug!(
            operation,
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Query finished"
        );
        Ok(rows)
    }

    /// Run a statement that returns no rows.
    pub async fn execute(
        &self,
        ctx: &Context,
        operation: &str,
        sql: &str,
        params: &[Value],
    ) -> DbResult<ExecOutcome> {
        let params = BindValue::from_all(params, self.db_type());
        debug!(operation, sql = %sql, params = params.len(), "Executing statement");

        let outcome = ctx
            .run(operation, async {
                let result = match self {
                    SqlExecutor::Pool(pool) => impl_db_dispatch!(DbPool, pool, {
                        MySql(p) => mysql::execute(p, sql, &params).await,
                        Postgres(p) => postgres::execute(p, sql, &params).await,
                        SQLite(p) => sqlite::execute(p, sql, &params).await,
                    }),
                    SqlExecutor::Transaction(tx) => {
                        let mut guard = tx.lock().await;
                        let inner = guard.as_mut().ok_or_else(|| tx.inactive())?;
                        impl_db_dispatch!(DbTransaction, inner, {
                            MySql(t) => mysql::execute(&mut **t, sql, &params).await,
                            Postgres(t) => postgres::execute(&mut **t, sql, &params).await,
                            SQLite(t) => sqlite::execute(&mut **t, sql, &params).await,
                        })
                    }
                };
                result.map_err(|e| DbError::from_sqlx(operation, e))
            })
            .await?;

        debug!(operation, rows_affected = outcome.rows_affected, "Statement finished");
        Ok(outcome)
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Statements without parameters go through the simple query protocol so that
// multi-statement scripts and savepoint commands run unprepared.

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use sqlx::MySql;

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[BindValue],
    ) -> Result<Vec<Row>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = MySql>,
    {
        let rows = if params.is_empty() {
            executor.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            query.fetch_all(executor).await?
        };
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[BindValue],
    ) -> Result<ExecOutcome, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = MySql>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            query.execute(executor).await?
        };
        let last_insert_id = match result.last_insert_id() {
            0 => None,
            id => i64::try_from(id).ok(),
        };
        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id,
        })
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use sqlx::Postgres;

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[BindValue],
    ) -> Result<Vec<Row>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let rows = if params.is_empty() {
            executor.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            query.fetch_all(executor).await?
        };
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[BindValue],
    ) -> Result<ExecOutcome, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            query.execute(executor).await?
        };
        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        })
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use sqlx::Sqlite;

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[BindValue],
    ) -> Result<Vec<Row>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let rows = if params.is_empty() {
            executor.fetch_all(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            query.fetch_all(executor).await?
        };
        Ok(rows.iter().map(RowToJson::to_json_map).collect())
    }

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[BindValue],
    ) -> Result<ExecOutcome, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let result = if params.is_empty() {
            executor.execute(sql).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            query.execute(executor).await?
        };
        let last_insert_id = match result.last_insert_rowid() {
            0 => None,
            id => Some(id),
        };
        Ok(ExecOutcome {
            rows_affected: result.rows_affected(),
            last_insert_id,
        })
    }
}
