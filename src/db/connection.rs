//! Adapter and connection for the sqlx backend.
//!
//! The dialect comes from the driver name (`sqlx:postgres`) when it carries
//! one, otherwise from the DSN scheme. Transactions hold one pooled
//! connection for their whole duration; nested transactions become
//! savepoints on it.

use crate::config::Config;
use crate::connection::{Adapter, Connection, TransactionFn};
use crate::context::Context;
use crate::db::DatabaseType;
use crate::db::builder::{SqlSession, SqlxQueryBuilderFactory};
use crate::db::executor::SqlExecutor;
use crate::db::pool::DbPool;
use crate::db::sql;
use crate::error::{DbError, DbResult};
use crate::models::Row;
use crate::query_builder::Session;
use crate::registry::QueryBuilderRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SqlxAdapter {
    builders: QueryBuilderRegistry,
}

impl SqlxAdapter {
    pub const NAME: &'static str = "sqlx";

    pub fn new(builders: QueryBuilderRegistry) -> Self {
        Self { builders }
    }
}

/// Dialect named by the driver, falling back to the DSN scheme.
pub fn resolve_database_type(config: &Config) -> DbResult<DatabaseType> {
    if let Some(dialect) = config.driver_dialect() {
        return DatabaseType::from_dialect(dialect)
            .ok_or_else(|| DbError::validation(format!("unsupported sql dialect: {dialect}")));
    }
    DatabaseType::from_connection_string(&config.dsn).ok_or_else(|| {
        DbError::validation(
            "cannot infer the sql dialect from the dsn; use a driver such as sqlx:postgres",
        )
    })
}

#[async_trait]
impl Adapter for SqlxAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn connect(&self, config: &Config) -> DbResult<Arc<dyn Connection>> {
        let db_type = resolve_database_type(config)?;
        let pool = DbPool::connect(config, db_type).await?;
        info!(
            db_type = %db_type,
            dsn = %config.masked_dsn(),
            "Connection pool established"
        );
        Ok(Arc::new(SqlxConnection::new(
            config.clone(),
            pool,
            self.builders.clone(),
        )))
    }
}

pub struct SqlxConnection {
    config: Config,
    pool: DbPool,
    session: Arc<SqlSession>,
    builders: QueryBuilderRegistry,
}

impl SqlxConnection {
    pub fn new(config: Config, pool: DbPool, builders: QueryBuilderRegistry) -> Self {
        let session = Arc::new(SqlSession::new(SqlExecutor::Pool(pool.clone())));
        Self {
            config,
            pool,
            session,
            builders,
        }
    }

    /// A connection sharing this one's pool but running on `session`.
    fn scoped(&self, session: Arc<SqlSession>) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            pool: self.pool.clone(),
            session,
            builders: self.builders.clone(),
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn executor(&self) -> &SqlExecutor {
        self.session.executor()
    }

    /// Whether this connection runs inside a transaction.
    pub fn in_transaction(&self) -> bool {
        self.executor().transaction().is_some()
    }
}

impl fmt::Debug for SqlxConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlxConnection")
            .field("driver", &self.config.driver)
            .field("dsn", &self.config.masked_dsn())
            .field("db_type", &self.db_type())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[async_trait]
impl Connection for SqlxConnection {
    fn config(&self) -> &Config {
        &self.config
    }

    fn driver(&self) -> &str {
        &self.config.driver
    }

    fn session(&self) -> Session {
        self.session.clone()
    }

    fn query_builder_factory(&self) -> &str {
        SqlxQueryBuilderFactory::NAME
    }

    fn query_builders(&self) -> &QueryBuilderRegistry {
        &self.builders
    }

    async fn ping(&self, ctx: &Context) -> DbResult<()> {
        self.executor().fetch_all(ctx, "Ping", "SELECT 1", &[]).await?;
        Ok(())
    }

    /// Closes the pool. Transaction-scoped connections leave it open.
    async fn close(&self) -> DbResult<()> {
        if self.in_transaction() {
            debug!("Ignoring close on a transaction-scoped connection");
            return Ok(());
        }
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!(db_type = %self.db_type(), "Connection pool closed");
        }
        Ok(())
    }

    async fn select(&self, ctx: &Context, query: &str, bindings: Vec<Value>) -> DbResult<Vec<Row>> {
        let (sql, params) = sql::raw(self.db_type(), query, &bindings)?.into_parts();
        self.executor().fetch_all(ctx, "Select", &sql, &params).await
    }

    async fn statement(&self, ctx: &Context, query: &str, bindings: Vec<Value>) -> DbResult<u64> {
        let (sql, params) = sql::raw(self.db_type(), query, &bindings)?.into_parts();
        let outcome = self.executor().execute(ctx, "Statement", &sql, &params).await?;
        Ok(outcome.rows_affected)
    }

    async fn server_version(&self) -> Option<String> {
        self.pool.server_version().await
    }

    async fn transaction(&self, ctx: &Context, f: TransactionFn) -> DbResult<()> {
        ctx.check("Transaction")?;
        self.session
            .atomically(ctx, |session| {
                let tx_conn: Arc<dyn Connection> = self.scoped(session);
                f(tx_conn)
            })
            .await
    }
}
