//! dbkit: a database-agnostic data-access toolkit.
//!
//! Entities are plain serde structs implementing [`Model`]. A
//! [`Repository`] offers entity-level CRUD over a [`QueryBuilder`], which a
//! backend supplies through a [`Connection`]. Backends are plugged in by name
//! through the [`registry`]: an in-memory engine (`memory`) and an sqlx
//! engine for SQLite, PostgreSQL and MySQL (`sqlx:*`) ship with the crate.
//!
//! ```ignore
//! let (adapters, builders) = (Registry::adapters(), Registry::query_builders());
//! register_defaults(&adapters, &builders).await?;
//! let config = Config::new().with_driver("sqlx:sqlite").with_dsn("sqlite:app.db");
//! let conn = connect(&Context::background(), config, &adapters).await?;
//! let users = conn.repository::<User>().await?;
//! ```

pub mod bridge;
pub mod config;
pub mod connect;
pub mod connection;
pub mod context;
pub mod db;
pub mod eager;
pub mod error;
pub mod memory;
pub mod migration;
pub mod models;
pub mod query_builder;
pub mod registry;
pub mod repository;
pub mod seeder;

pub use config::Config;
pub use connect::{connect, connect_with, register_defaults};
pub use connection::{Adapter, Connection, ConnectionExt, TransactionFn};
pub use context::Context;
pub use error::{DbError, DbResult};
pub use migration::{Migrator, SqlMigrator};
pub use models::{Condition, Entity, EntitySlot, Model, Record, Relationship, Row, slot};
pub use query_builder::{QueryBuilder, QueryBuilderFactory};
pub use registry::{AdapterRegistry, QueryBuilderRegistry, Registry};
pub use repository::Repository;
pub use seeder::{Seeder, SeederRunner};
