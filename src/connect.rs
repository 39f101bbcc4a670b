//! Connection bring-up.
//!
//! [`connect`] validates a [`Config`], resolves its adapter, connects, and
//! pings once. A connection whose first ping fails is closed before the error
//! is returned.

use crate::config::{Config, ConfigOption};
use crate::connection::{Adapter, Connection};
use crate::context::Context;
use crate::db::{SqlxAdapter, SqlxQueryBuilderFactory};
use crate::error::{DbError, DbResult};
use crate::memory::{MemoryAdapter, MemoryQueryBuilderFactory};
use crate::registry::{AdapterRegistry, QueryBuilderRegistry};
use std::sync::Arc;
use tracing::{info, warn};

pub async fn connect(
    ctx: &Context,
    config: Config,
    adapters: &AdapterRegistry,
) -> DbResult<Arc<dyn Connection>> {
    connect_with(ctx, config, adapters, Vec::new()).await
}

/// Like [`connect`], applying `options` to `config` first.
pub async fn connect_with(
    ctx: &Context,
    mut config: Config,
    adapters: &AdapterRegistry,
    options: Vec<ConfigOption>,
) -> DbResult<Arc<dyn Connection>> {
    config.apply(options);
    config.validate()?;

    let adapter: Arc<dyn Adapter> = match &config.adapter {
        Some(adapter) => Arc::clone(adapter),
        None => adapters.get(&config.driver).await?,
    };

    info!(
        driver = %config.driver,
        adapter = adapter.name(),
        dsn = %config.masked_dsn(),
        "Connecting to database"
    );
    let conn = adapter.connect(&config).await?;

    if let Err(err) = conn.ping(ctx).await {
        warn!(driver = %config.driver, error = %err, "Initial ping failed, closing connection");
        if let Err(close_err) = conn.close().await {
            warn!(error = %close_err, "Failed to close connection after ping failure");
        }
        return Err(DbError::backend(
            "Connect",
            "initial database ping failed",
            err,
        ));
    }

    info!(driver = %config.driver, "Database connection established");
    Ok(conn)
}

/// Register the built-in adapter families and their query-builder factories.
pub async fn register_defaults(
    adapters: &AdapterRegistry,
    builders: &QueryBuilderRegistry,
) -> DbResult<()> {
    let memory = Arc::new(MemoryAdapter::new(builders.clone()));
    adapters
        .register(memory, [MemoryAdapter::NAME, "memory:default"])
        .await?;
    builders
        .register(
            Arc::new(MemoryQueryBuilderFactory),
            [MemoryQueryBuilderFactory::NAME],
        )
        .await?;

    let sqlx = Arc::new(SqlxAdapter::new(builders.clone()));
    adapters
        .register(
            sqlx,
            [SqlxAdapter::NAME, "sqlx:sqlite", "sqlx:postgres", "sqlx:mysql"],
        )
        .await?;
    builders
        .register(
            Arc::new(SqlxQueryBuilderFactory),
            [SqlxQueryBuilderFactory::NAME],
        )
        .await?;
    Ok(())
}
