//! Query builder rendering SQL and running it through a [`SqlSession`].

use crate::context::Context;
use crate::db::DatabaseType;
use crate::db::executor::SqlExecutor;
use crate::db::sql::{self, InsertStatement};
use crate::db::transaction::{DbTransaction, TxHandle};
use crate::eager::{self, RelatedFetcher};
use crate::error::{DbError, DbResult};
use crate::models::entity::now_value;
use crate::models::{Entity, ModelMeta, QueryState, Row};
use crate::query_builder::{QueryBuilder, QueryBuilderFactory, Session, downcast_session};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) const BACKEND: &str = "sqlx";

/// Session shared by a connection and the builders created from it.
#[derive(Debug, Clone)]
pub struct SqlSession {
    executor: SqlExecutor,
}

impl SqlSession {
    pub fn new(executor: SqlExecutor) -> Self {
        Self { executor }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.executor.db_type()
    }

    pub fn executor(&self) -> &SqlExecutor {
        &self.executor
    }

    /// Run `f` against a session bound to one unit of work.
    ///
    /// On a pool this begins a transaction; inside a transaction it opens a
    /// savepoint instead. If `f` fails, or `ctx` is done before the commit,
    /// the work is rolled back and the original error returned.
    pub async fn atomically<T, F, Fut>(&self, ctx: &Context, f: F) -> DbResult<T>
    where
        F: FnOnce(Arc<SqlSession>) -> Fut + Send,
        Fut: Future<Output = DbResult<T>> + Send,
        T: Send,
    {
        match &self.executor {
            SqlExecutor::Pool(pool) => {
                let tx = ctx.run("Begin", DbTransaction::begin(pool)).await?;
                let handle = TxHandle::new(tx);
                let session = Arc::new(Self::new(SqlExecutor::Transaction(handle.clone())));
                let result = match f(session).await {
                    Ok(value) => ctx.check("Commit").map(|()| value),
                    Err(err) => Err(err),
                };
                match result {
                    Ok(value) => {
                        handle.commit().await?;
                        Ok(value)
                    }
                    Err(err) => {
                        handle.rollback_quietly().await;
                        Err(err)
                    }
                }
            }
            SqlExecutor::Transaction(parent) => {
                let nested = parent.nested();
                let savepoint = nested.savepoint_name();
                let executor = SqlExecutor::Transaction(nested);
                executor
                    .execute(ctx, "Savepoint", &format!("SAVEPOINT {savepoint}"), &[])
                    .await?;
                debug!(transaction_id = %parent.id(), savepoint = %savepoint, "Savepoint created");

                let session = Arc::new(Self::new(executor.clone()));
                let result = match f(session).await {
                    Ok(value) => ctx.check("Commit").map(|()| value),
                    Err(err) => Err(err),
                };
                match result {
                    Ok(value) => {
                        executor
                            .execute(ctx, "Release", &format!("RELEASE SAVEPOINT {savepoint}"), &[])
                            .await?;
                        Ok(value)
                    }
                    Err(err) => {
                        // The rollback must run even when ctx is what failed.
                        let rollback = executor
                            .execute(
                                &Context::background(),
                                "Rollback",
                                &format!("ROLLBACK TO SAVEPOINT {savepoint}"),
                                &[],
                            )
                            .await;
                        if let Err(rollback_err) = rollback {
                            warn!(
                                savepoint = %savepoint,
                                error = %rollback_err,
                                "Failed to roll back to savepoint"
                            );
                        }
                        Err(err)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RelatedFetcher for SqlSession {
    async fn fetch_in(
        &self,
        ctx: &Context,
        table: &str,
        column: &str,
        values: &[Value],
        scope_column: Option<&str>,
    ) -> DbResult<Vec<Row>> {
        let (sql, params) =
            sql::select_in(self.db_type(), table, column, values, scope_column)?.into_parts();
        self.executor.fetch_all(ctx, "EagerLoad", &sql, &params).await
    }
}

#[derive(Debug, Default)]
pub struct SqlxQueryBuilderFactory;

impl SqlxQueryBuilderFactory {
    pub const NAME: &'static str = "sqlx";
}

impl QueryBuilderFactory for SqlxQueryBuilderFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn new_query_builder(
        &self,
        model: Arc<dyn Entity>,
        session: Session,
    ) -> DbResult<Box<dyn QueryBuilder>> {
        let session = downcast_session::<SqlSession>(Self::NAME, session)?;
        Ok(Box::new(SqlxQueryBuilder::new(session, model)))
    }
}

#[derive(Debug, Clone)]
pub struct SqlxQueryBuilder {
    session: Arc<SqlSession>,
    model: Arc<dyn Entity>,
    meta: ModelMeta,
    state: QueryState,
}

impl SqlxQueryBuilder {
    pub fn new(session: Arc<SqlSession>, model: Arc<dyn Entity>) -> Self {
        let meta = ModelMeta::of(model.as_ref());
        Self {
            session,
            model,
            meta,
            state: QueryState::default(),
        }
    }

    fn db_type(&self) -> DatabaseType {
        self.session.db_type()
    }

    fn executor(&self) -> &SqlExecutor {
        self.session.executor()
    }
}

/// Run insert statements in order, filling in generated keys.
async fn run_inserts(
    ctx: &Context,
    executor: &SqlExecutor,
    primary_key: &str,
    statements: Vec<InsertStatement>,
) -> DbResult<Vec<Row>> {
    let mut created = Vec::new();
    for insert in statements {
        let (sql, params) = insert.statement.into_parts();
        if insert.returning {
            created.extend(executor.fetch_all(ctx, "Create", &sql, &params).await?);
            continue;
        }
        let outcome = executor.execute(ctx, "Create", &sql, &params).await?;
        for (offset, mut row) in insert.rows.into_iter().enumerate() {
            // Multi-row inserts report the id of the first row; the rest follow it.
            if let (false, Some(first)) = (row.contains_key(primary_key), outcome.last_insert_id) {
                row.insert(primary_key.to_string(), Value::from(first + offset as i64));
            }
            created.push(row);
        }
    }
    Ok(created)
}

/// Read the `aggregate` column of a count query.
fn aggregate_of(rows: &[Row]) -> DbResult<i64> {
    let value = rows
        .first()
        .and_then(|row| row.get("aggregate").or_else(|| row.values().next()));
    match value {
        None => Ok(0),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| DbError::internal(format!("count returned {n}"))),
        // MySQL may hand back DECIMAL aggregates as text.
        Some(Value::String(s)) => s
            .parse::<i64>()
            .map_err(|_| DbError::internal(format!("count returned {s:?}"))),
        Some(other) => Err(DbError::internal(format!("count returned {other}"))),
    }
}

#[async_trait]
impl QueryBuilder for SqlxQueryBuilder {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn model(&self) -> &Arc<dyn Entity> {
        &self.model
    }

    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn state(&self) -> &QueryState {
        &self.state
    }

    fn with_state(&self, state: QueryState) -> Box<dyn QueryBuilder> {
        Box::new(Self {
            session: Arc::clone(&self.session),
            model: Arc::clone(&self.model),
            meta: self.meta.clone(),
            state,
        })
    }

    async fn get(&self, ctx: &Context) -> DbResult<Vec<Row>> {
        let (sql, params) = sql::select(self.db_type(), &self.meta, &self.state)?.into_parts();
        let mut rows = self.executor().fetch_all(ctx, "Get", &sql, &params).await?;

        let plans = eager::plans(self.model.as_ref(), &self.state.eager);
        eager::load(ctx, self.session.as_ref(), &plans, &mut rows).await?;
        Ok(rows)
    }

    async fn count(&self, ctx: &Context) -> DbResult<i64> {
        let (sql, params) = sql::count(self.db_type(), &self.meta, &self.state)?.into_parts();
        let rows = self.executor().fetch_all(ctx, "Count", &sql, &params).await?;
        aggregate_of(&rows)
    }

    async fn create(&self, ctx: &Context, rows: Vec<Row>) -> DbResult<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let statements = sql::insert(self.db_type(), &self.meta, &rows)?;
        debug!(
            table = %self.meta.table,
            rows = rows.len(),
            statements = statements.len(),
            "Inserting rows"
        );
        let primary_key = self.meta.primary_key.as_str();
        if statements.len() == 1 {
            return run_inserts(ctx, self.executor(), primary_key, statements).await;
        }
        // Rows with differing column sets split into several statements.
        self.session
            .atomically(ctx, |session| async move {
                run_inserts(ctx, session.executor(), primary_key, statements).await
            })
            .await
    }

    async fn create_in_batches(
        &self,
        ctx: &Context,
        rows: Vec<Row>,
        batch_size: usize,
    ) -> DbResult<Vec<Row>> {
        if batch_size == 0 {
            return Err(DbError::validation("batch size must be positive"));
        }
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        self.session
            .atomically(ctx, |session| async move {
                let builder = SqlxQueryBuilder::new(session, model);
                let mut created = Vec::with_capacity(rows.len());
                for chunk in rows.chunks(batch_size) {
                    created.extend(builder.create(ctx, chunk.to_vec()).await?);
                }
                Ok::<_, DbError>(created)
            })
            .await
    }

    async fn update(&self, ctx: &Context, values: Row) -> DbResult<u64> {
        let Some(statement) = sql::update(self.db_type(), &self.meta, &self.state, &values)? else {
            return Ok(0);
        };
        let (sql, params) = statement.into_parts();
        let outcome = self.executor().execute(ctx, "Update", &sql, &params).await?;
        Ok(outcome.rows_affected)
    }

    async fn delete(&self, ctx: &Context) -> DbResult<u64> {
        let (sql, params) =
            sql::delete(self.db_type(), &self.meta, &self.state, &now_value())?.into_parts();
        let outcome = self.executor().execute(ctx, "Delete", &sql, &params).await?;
        Ok(outcome.rows_affected)
    }

    async fn exec(&self, ctx: &Context, sql: &str, bindings: Vec<Value>) -> DbResult<u64> {
        let (sql, params) = sql::raw(self.db_type(), sql, &bindings)?.into_parts();
        let outcome = self.executor().execute(ctx, "Exec", &sql, &params).await?;
        Ok(outcome.rows_affected)
    }

    fn to_sql(&self) -> DbResult<(String, Vec<Value>)> {
        Ok(sql::select(self.db_type(), &self.meta, &self.state)?.into_parts())
    }
}
