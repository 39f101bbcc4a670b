//! Models and connection helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use dbkit::models::{SoftDelete, Timestamps};
use dbkit::query_builder::Session;
use dbkit::{
    Adapter, AdapterRegistry, Config, Connection, Context, DbError, DbResult, Model,
    QueryBuilderRegistry, Relationship, Row, TransactionFn, connect, register_defaults,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(flatten)]
    pub timestamps: Timestamps,
    #[serde(flatten)]
    pub soft_delete: SoftDelete,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub posts: Vec<Post>,
}

impl User {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
            ..Default::default()
        }
    }
}

impl Model for User {
    fn table_name(&self) -> &str {
        "users"
    }

    fn id(&self) -> Value {
        json!(self.id)
    }

    fn set_id(&mut self, id: Value) {
        self.id = id.as_i64().unwrap_or_default();
    }

    fn relationships(&self) -> HashMap<String, Relationship> {
        HashMap::from([(
            "posts".to_string(),
            Relationship::has_many(Post::default(), "user_id", "id"),
        )])
    }

    fn soft_delete_column(&self) -> Option<&str> {
        Some("deleted_at")
    }

    fn timestamps(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Box<User>>,
}

impl Post {
    pub fn new(user_id: i64, title: &str) -> Self {
        Self {
            user_id,
            title: title.to_string(),
            ..Default::default()
        }
    }
}

impl Model for Post {
    fn table_name(&self) -> &str {
        "posts"
    }

    fn id(&self) -> Value {
        json!(self.id)
    }

    fn set_id(&mut self, id: Value) {
        self.id = id.as_i64().unwrap_or_default();
    }

    fn relationships(&self) -> HashMap<String, Relationship> {
        HashMap::from([(
            "author".to_string(),
            Relationship::belongs_to(User::default(), "user_id", "id"),
        )])
    }
}

/// Fresh registries with the built-in backends registered.
pub async fn registries() -> (AdapterRegistry, QueryBuilderRegistry) {
    let adapters = AdapterRegistry::adapters();
    let builders = QueryBuilderRegistry::query_builders();
    register_defaults(&adapters, &builders)
        .await
        .expect("register built-in backends");
    (adapters, builders)
}

pub async fn memory_connection(dsn: &str) -> Arc<dyn Connection> {
    let (adapters, _) = registries().await;
    let config = Config::new().with_driver("memory").with_dsn(dsn);
    connect(&Context::background(), config, &adapters)
        .await
        .expect("connect to memory backend")
}

pub const USERS_DDL_SQLITE: &str = "CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    created_at TEXT,
    updated_at TEXT,
    deleted_at TEXT
)";

pub const POSTS_DDL_SQLITE: &str = "CREATE TABLE posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    title TEXT NOT NULL
)";

/// Adapter wrapping the memory backend that counts calls and can fail pings.
pub struct SpyAdapter {
    inner: dbkit::memory::MemoryAdapter,
    fail_ping: bool,
    pub connects: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl SpyAdapter {
    pub fn new(builders: QueryBuilderRegistry, fail_ping: bool) -> Self {
        Self {
            inner: dbkit::memory::MemoryAdapter::new(builders),
            fail_ping,
            connects: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for SpyAdapter {
    fn name(&self) -> &str {
        "spy"
    }

    async fn connect(&self, config: &Config) -> DbResult<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.connect(config).await?;
        Ok(Arc::new(SpyConnection {
            inner,
            fail_ping: self.fail_ping,
            closes: Arc::clone(&self.closes),
        }))
    }
}

#[derive(Debug)]
pub struct SpyConnection {
    inner: Arc<dyn Connection>,
    fail_ping: bool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for SpyConnection {
    fn config(&self) -> &Config {
        self.inner.config()
    }

    fn driver(&self) -> &str {
        self.inner.driver()
    }

    fn session(&self) -> Session {
        self.inner.session()
    }

    fn query_builder_factory(&self) -> &str {
        self.inner.query_builder_factory()
    }

    fn query_builders(&self) -> &QueryBuilderRegistry {
        self.inner.query_builders()
    }

    async fn ping(&self, ctx: &Context) -> DbResult<()> {
        if self.fail_ping {
            return Err(DbError::connection(
                "server went away",
                "Check that the database is running",
            ));
        }
        self.inner.ping(ctx).await
    }

    async fn close(&self) -> DbResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }

    async fn select(&self, ctx: &Context, query: &str, bindings: Vec<Value>) -> DbResult<Vec<Row>> {
        self.inner.select(ctx, query, bindings).await
    }

    async fn statement(&self, ctx: &Context, query: &str, bindings: Vec<Value>) -> DbResult<u64> {
        self.inner.statement(ctx, query, bindings).await
    }

    async fn transaction(&self, ctx: &Context, f: TransactionFn) -> DbResult<()> {
        self.inner.transaction(ctx, f).await
    }
}
