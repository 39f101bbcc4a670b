//! Low-level fluent query builder contract.
//!
//! A backend implements the four accessor methods and the terminal
//! operations; every clause method is provided here on top of
//! [`QueryBuilder::with_state`], so all backends share the same
//! never-mutate-the-receiver discipline.

use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{Condition, Entity, JoinKind, ModelMeta, QueryState, Row};
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Backend session handed from a connection to a query-builder factory.
///
/// Each backend downcasts it to its own session type.
pub type Session = Arc<dyn Any + Send + Sync>;

/// Creates query builders bound to one entity type and one backend session.
pub trait QueryBuilderFactory: Send + Sync {
    fn name(&self) -> &str;

    fn new_query_builder(
        &self,
        model: Arc<dyn Entity>,
        session: Session,
    ) -> DbResult<Box<dyn QueryBuilder>>;
}

/// Downcast a [`Session`] to the backend's concrete session type.
pub fn downcast_session<S: Any + Send + Sync>(factory: &str, session: Session) -> DbResult<Arc<S>> {
    session.downcast::<S>().map_err(|_| {
        DbError::validation(format!(
            "query builder factory {} cannot use a session of another backend",
            factory
        ))
    })
}

#[async_trait]
pub trait QueryBuilder: Send + Sync + fmt::Debug {
    /// Backend family name, used in error messages.
    fn backend(&self) -> &str;

    /// Prototype of the entity type this builder is bound to.
    fn model(&self) -> &Arc<dyn Entity>;

    fn meta(&self) -> &ModelMeta;

    fn state(&self) -> &QueryState;

    /// A builder on the same model and session carrying `state` instead.
    fn with_state(&self, state: QueryState) -> Box<dyn QueryBuilder>;

    fn select(&self, columns: &[&str]) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().select(columns.iter().copied()))
    }

    fn filter(&self, condition: Condition) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().and(condition))
    }

    fn or_filter(&self, condition: Condition) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().or(condition))
    }

    fn filter_in(&self, column: &str, values: Vec<Value>) -> Box<dyn QueryBuilder> {
        self.filter(Condition::In {
            column: column.to_string(),
            values,
            negated: false,
        })
    }

    fn filter_not_in(&self, column: &str, values: Vec<Value>) -> Box<dyn QueryBuilder> {
        self.filter(Condition::In {
            column: column.to_string(),
            values,
            negated: true,
        })
    }

    fn filter_null(&self, column: &str) -> Box<dyn QueryBuilder> {
        self.filter(Condition::Null {
            column: column.to_string(),
            negated: false,
        })
    }

    fn filter_not_null(&self, column: &str) -> Box<dyn QueryBuilder> {
        self.filter(Condition::Null {
            column: column.to_string(),
            negated: true,
        })
    }

    fn filter_between(&self, column: &str, low: Value, high: Value) -> Box<dyn QueryBuilder> {
        self.filter(Condition::Between {
            column: column.to_string(),
            low,
            high,
        })
    }

    fn join(&self, table: &str, on: &str) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().join(JoinKind::Join, table, on))
    }

    fn left_join(&self, table: &str, on: &str) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().join(JoinKind::Left, table, on))
    }

    fn right_join(&self, table: &str, on: &str) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().join(JoinKind::Right, table, on))
    }

    fn inner_join(&self, table: &str, on: &str) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().join(JoinKind::Inner, table, on))
    }

    fn group_by(&self, columns: &[&str]) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().group_by(columns.iter().copied()))
    }

    fn having(&self, condition: Condition) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().having(condition))
    }

    fn order_by(&self, column: &str, direction: &str) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().order_by(column, direction))
    }

    fn limit(&self, limit: i64) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().limit(limit))
    }

    fn offset(&self, offset: i64) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().offset(offset))
    }

    fn with(&self, relations: &[&str]) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().with(relations.iter().copied()))
    }

    /// Accepted for API compatibility; relation counts are not computed.
    fn with_count(&self, _relations: &[&str]) -> Box<dyn QueryBuilder> {
        self.clone_builder()
    }

    fn scoped(&self) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().scoped(true))
    }

    fn unscoped(&self) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().scoped(false))
    }

    /// Replace the generated SELECT with a raw statement.
    fn raw(&self, sql: &str, bindings: Vec<Value>) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone().raw(sql, bindings))
    }

    fn clone_builder(&self) -> Box<dyn QueryBuilder> {
        self.with_state(self.state().clone())
    }

    /// Drop every clause, keeping only the model and the session.
    fn reset(&self) -> Box<dyn QueryBuilder> {
        self.with_state(QueryState::default())
    }

    /// Row whose primary key equals `id`.
    async fn find(&self, ctx: &Context, id: Value) -> DbResult<Option<Row>> {
        let primary_key = self.meta().primary_key.clone();
        self.filter(Condition::eq(primary_key, id)).first(ctx).await
    }

    /// First matching row, ordered by primary key unless an ordering is set.
    async fn first(&self, ctx: &Context) -> DbResult<Option<Row>> {
        let builder = if self.state().orders.is_empty() {
            self.order_by(&self.meta().primary_key, "ASC")
        } else {
            self.clone_builder()
        };
        let rows = builder.limit(1).get(ctx).await?;
        Ok(rows.into_iter().next())
    }

    async fn get(&self, ctx: &Context) -> DbResult<Vec<Row>>;

    async fn count(&self, ctx: &Context) -> DbResult<i64>;

    async fn exists(&self, ctx: &Context) -> DbResult<bool> {
        Ok(self.count(ctx).await? > 0)
    }

    /// Insert `rows` and return them as persisted, generated keys included.
    async fn create(&self, ctx: &Context, rows: Vec<Row>) -> DbResult<Vec<Row>>;

    /// Insert `rows` in chunks of `batch_size`.
    ///
    /// The default runs one `create` per chunk with no shared unit of work.
    /// The built-in backends override it so a failing chunk leaves nothing.
    async fn create_in_batches(
        &self,
        ctx: &Context,
        rows: Vec<Row>,
        batch_size: usize,
    ) -> DbResult<Vec<Row>> {
        if batch_size == 0 {
            return Err(DbError::validation("batch size must be positive"));
        }
        let mut created = Vec::with_capacity(rows.len());
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<Row> = rows.by_ref().take(batch_size).collect();
            created.extend(self.create(ctx, chunk).await?);
        }
        Ok(created)
    }

    /// Apply `values` to every matching row; returns the affected count.
    async fn update(&self, ctx: &Context, values: Row) -> DbResult<u64>;

    /// Remove matching rows. Scoped builders on soft-delete models mark them instead.
    async fn delete(&self, ctx: &Context) -> DbResult<u64>;

    /// Run a raw statement on the builder's session.
    async fn exec(&self, ctx: &Context, sql: &str, bindings: Vec<Value>) -> DbResult<u64>;

    /// Values of `column` across matching rows.
    async fn pluck(&self, ctx: &Context, column: &str) -> DbResult<Vec<Value>> {
        let key = column.rsplit('.').next().unwrap_or(column).to_string();
        let rows = self.select(&[column]).get(ctx).await?;
        Ok(rows
            .into_iter()
            .map(|mut row| row.remove(&key).unwrap_or(Value::Null))
            .collect())
    }

    /// Rendered statement and its bindings, without executing.
    fn to_sql(&self) -> DbResult<(String, Vec<Value>)>;
}

