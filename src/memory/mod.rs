//! In-process backend.
//!
//! Tables live in a [`MemoryStore`] keyed by DSN, so two connections opened
//! with the same DSN through one adapter see the same data. Transactions run
//! against a snapshot that replaces the parent's contents on commit.

mod builder;
mod store;

pub use builder::{MemoryQueryBuilder, MemoryQueryBuilderFactory};
pub use store::{MemoryStore, StoreError};

use crate::config::Config;
use crate::connection::{Adapter, Connection, TransactionFn};
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::Row;
use crate::query_builder::Session;
use crate::registry::QueryBuilderRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use store::BACKEND;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct MemoryAdapter {
    builders: QueryBuilderRegistry,
    databases: Mutex<HashMap<String, MemoryStore>>,
}

impl MemoryAdapter {
    pub const NAME: &'static str = "memory";

    pub fn new(builders: QueryBuilderRegistry) -> Self {
        Self {
            builders,
            databases: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn connect(&self, config: &Config) -> DbResult<Arc<dyn Connection>> {
        let store = self
            .databases
            .lock()
            .await
            .entry(config.dsn.clone())
            .or_default()
            .clone();
        info!(dsn = %config.dsn, "Opened in-memory database");
        Ok(Arc::new(MemoryConnection {
            config: config.clone(),
            store,
            builders: self.builders.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            depth: 0,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    config: Config,
    store: MemoryStore,
    builders: QueryBuilderRegistry,
    closed: Arc<AtomicBool>,
    depth: usize,
}

impl MemoryConnection {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Nesting level; zero outside any transaction.
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn ensure_open(&self, operation: &str) -> DbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::backend(
                operation,
                "connection is closed",
                StoreError::Closed,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn config(&self) -> &Config {
        &self.config
    }

    fn driver(&self) -> &str {
        &self.config.driver
    }

    fn session(&self) -> Session {
        Arc::new(self.store.clone())
    }

    fn query_builder_factory(&self) -> &str {
        MemoryQueryBuilderFactory::NAME
    }

    fn query_builders(&self) -> &QueryBuilderRegistry {
        &self.builders
    }

    async fn ping(&self, ctx: &Context) -> DbResult<()> {
        ctx.check("Ping")?;
        self.ensure_open("Ping")
    }

    async fn close(&self) -> DbResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(driver = %self.config.driver, "Closed in-memory connection");
        }
        Ok(())
    }

    async fn select(
        &self,
        _ctx: &Context,
        _query: &str,
        _bindings: Vec<Value>,
    ) -> DbResult<Vec<Row>> {
        Err(DbError::unsupported(BACKEND, "raw select"))
    }

    async fn statement(&self, _ctx: &Context, _query: &str, _bindings: Vec<Value>) -> DbResult<u64> {
        Err(DbError::unsupported(BACKEND, "raw statements"))
    }

    async fn transaction(&self, ctx: &Context, f: TransactionFn) -> DbResult<()> {
        ctx.check("Transaction")?;
        self.ensure_open("Transaction")?;

        let snapshot = self.store.snapshot().await;
        let tx = Arc::new(MemoryConnection {
            config: self.config.clone(),
            store: snapshot.clone(),
            builders: self.builders.clone(),
            closed: Arc::clone(&self.closed),
            depth: self.depth + 1,
        });
        debug!(depth = tx.depth, "Memory transaction started");

        f(tx).await?;
        ctx.check("Commit")?;
        self.store.restore(&snapshot).await;
        debug!(depth = self.depth + 1, "Memory transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionExt;
    use crate::models::{Condition, Model, slot};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Account {
        id: i64,
        owner: String,
        balance: i64,
    }

    impl Model for Account {
        fn table_name(&self) -> &str {
            "accounts"
        }
        fn id(&self) -> Value {
            json!(self.id)
        }
        fn set_id(&mut self, id: Value) {
            self.id = id.as_i64().unwrap_or_default();
        }
    }

    async fn open(dsn: &str) -> (Arc<MemoryAdapter>, Arc<dyn Connection>) {
        let builders = QueryBuilderRegistry::query_builders();
        builders
            .register(Arc::new(MemoryQueryBuilderFactory), ["memory"])
            .await
            .unwrap();
        let adapter = Arc::new(MemoryAdapter::new(builders));
        let config = Config::new().with_driver("memory").with_dsn(dsn);
        let conn = adapter.connect(&config).await.unwrap();
        (adapter, conn)
    }

    fn account(owner: &str, balance: i64) -> crate::models::EntitySlot {
        slot(Account {
            owner: owner.into(),
            balance,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_same_dsn_shares_data() {
        let (adapter, conn) = open("shared").await;
        let ctx = Context::background();
        let repo = conn.repository::<Account>().await.unwrap();
        repo.create(&ctx, &mut [account("ann", 10)]).await.unwrap();

        let config = Config::new().with_driver("memory").with_dsn("shared");
        let other = adapter.connect(&config).await.unwrap();
        let repo = other.repository::<Account>().await.unwrap();
        assert_eq!(repo.count(&ctx).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let (_, conn) = open("tx").await;
        let ctx = Context::background();

        conn.transaction_with(&ctx, |tx| async move {
            let repo = tx.repository::<Account>().await?;
            repo.create(&Context::background(), &mut [account("kept", 1)])
                .await
        })
        .await
        .unwrap();

        let err = conn
            .transaction_with(&ctx, |tx| async move {
                let repo = tx.repository::<Account>().await?;
                repo.create(&Context::background(), &mut [account("dropped", 2)])
                    .await?;
                Err::<(), _>(DbError::validation("abort"))
            })
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let repo = conn.repository::<Account>().await.unwrap();
        assert_eq!(repo.count(&ctx).await.unwrap(), 1);
        let kept = repo
            .filter(Condition::eq("owner", "kept"))
            .first_as::<Account>(&ctx)
            .await
            .unwrap();
        assert!(kept.is_some());
    }

    #[tokio::test]
    async fn test_nested_transaction_rolls_back_inner_only() {
        let (_, conn) = open("nested").await;
        let ctx = Context::background();

        conn.transaction_with(&ctx, |tx| async move {
            let ctx = Context::background();
            tx.repository::<Account>()
                .await?
                .create(&ctx, &mut [account("outer", 1)])
                .await?;
            let inner = tx
                .transaction_with(&ctx, |inner| async move {
                    inner
                        .repository::<Account>()
                        .await?
                        .create(&Context::background(), &mut [account("inner", 2)])
                        .await?;
                    Err::<(), _>(DbError::validation("inner fails"))
                })
                .await;
            assert!(inner.is_err());
            Ok::<(), DbError>(())
        })
        .await
        .unwrap();

        let repo = conn.repository::<Account>().await.unwrap();
        let owners: Vec<String> = repo.pluck(&ctx, "owner").await.unwrap();
        assert_eq!(owners, vec!["outer".to_string()]);
    }

    #[tokio::test]
    async fn test_ping_fails_after_close() {
        let (_, conn) = open("closing").await;
        let ctx = Context::background();
        conn.ping(&ctx).await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.ping(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_raw_escape_hatches_are_unsupported() {
        let (_, conn) = open("raw").await;
        let ctx = Context::background();
        assert!(matches!(
            conn.select(&ctx, "SELECT 1", vec![]).await,
            Err(DbError::Unsupported { .. })
        ));
        assert!(matches!(
            conn.statement(&ctx, "DELETE FROM accounts", vec![]).await,
            Err(DbError::Unsupported { .. })
        ));
    }
}
