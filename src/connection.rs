//! Connection and adapter contracts.
//!
//! An [`Adapter`] turns a [`Config`] into a live [`Connection`]. Connections
//! own one backend session, hand out repositories bound to it, and host
//! transactions: the callback receives a transaction-scoped connection whose
//! repositories take part in the same unit of work.

use crate::config::Config;
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::{Entity, Model, Record, Row};
use crate::query_builder::{QueryBuilder, Session};
use crate::registry::QueryBuilderRegistry;
use crate::repository::Repository;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Unit-of-work callback. Returning `Err` rolls the transaction back.
pub type TransactionFn =
    Box<dyn FnOnce(Arc<dyn Connection>) -> BoxFuture<'static, DbResult<()>> + Send>;

#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, config: &Config) -> DbResult<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn config(&self) -> &Config;

    /// Driver name the connection was opened with.
    fn driver(&self) -> &str;

    /// Session handed to query-builder factories.
    fn session(&self) -> Session;

    /// Name of the query-builder factory serving this connection.
    fn query_builder_factory(&self) -> &str;

    fn query_builders(&self) -> &QueryBuilderRegistry;

    async fn ping(&self, ctx: &Context) -> DbResult<()>;

    async fn close(&self) -> DbResult<()>;

    /// Raw query returning column-name/value maps.
    async fn select(&self, ctx: &Context, query: &str, bindings: Vec<Value>)
    -> DbResult<Vec<Row>>;

    /// Raw statement returning the affected-row count.
    async fn statement(&self, ctx: &Context, query: &str, bindings: Vec<Value>) -> DbResult<u64>;

    async fn transaction(&self, ctx: &Context, f: TransactionFn) -> DbResult<()>;

    /// Version string reported by the server, when the backend has one.
    async fn server_version(&self) -> Option<String> {
        None
    }

    /// Query builder for `model` on this connection's session.
    async fn query_builder(&self, model: Arc<dyn Entity>) -> DbResult<Box<dyn QueryBuilder>> {
        let factory = self
            .query_builders()
            .get(self.query_builder_factory())
            .await?;
        factory.new_query_builder(model, self.session())
    }

    /// Repository over `model`'s entity type.
    ///
    /// `None`, or a model without a table name, is rejected.
    async fn new_repository(&self, model: Option<Box<dyn Entity>>) -> DbResult<Repository> {
        let Some(model) = model else {
            return Err(DbError::validation("model cannot be nil"));
        };
        if model.table_name().is_empty() {
            return Err(DbError::validation(format!(
                "model {} must declare a table name",
                model.entity_type()
            )));
        }
        let model: Arc<dyn Entity> = Arc::from(model);
        let builder = self.query_builder(Arc::clone(&model)).await?;
        Ok(Repository::new(builder, model))
    }
}

/// Typed conveniences over [`Connection`].
#[async_trait]
pub trait ConnectionExt: Connection {
    async fn repository<T: Record>(&self) -> DbResult<Repository> {
        self.new_repository(Some(Box::new(T::default()))).await
    }

    async fn transaction_with<F, Fut>(&self, ctx: &Context, f: F) -> DbResult<()>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut + Send + 'static,
        Fut: Future<Output = DbResult<()>> + Send + 'static,
    {
        let callback: TransactionFn =
            Box::new(move |tx| -> BoxFuture<'static, DbResult<()>> { Box::pin(f(tx)) });
        self.transaction(ctx, callback).await
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}
