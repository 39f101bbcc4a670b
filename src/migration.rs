//! Schema migrations.
//!
//! [`SqlMigrator`] drives `sqlx::migrate` over the same per-dialect pools the
//! SQL backend uses. Migrations are reversible file pairs
//! (`<version>_<name>.up.sql` / `<version>_<name>.down.sql`) under the
//! configured migrations path.

use crate::config::Config;
use crate::context::Context;
use crate::db::DbPool;
use crate::db::macros::impl_db_dispatch;
use crate::db::connection::resolve_database_type;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::migrate::{Migrate, MigrateError, Migrator as SqlxMigrator};
use sqlx::{Database, Pool};
use std::path::Path;
use tracing::{debug, info};

#[async_trait]
pub trait Migrator: Send + Sync {
    /// Apply every pending migration. Nothing pending is success.
    async fn up(&self, ctx: &Context) -> DbResult<()>;

    /// Revert the last `steps` applied migrations. `steps <= 0` does nothing.
    async fn down(&self, ctx: &Context, steps: i64) -> DbResult<()>;

    /// Revert everything, then apply everything.
    async fn fresh(&self, ctx: &Context) -> DbResult<()>;

    /// Release the migration source and the database handle.
    async fn close(&self) -> (DbResult<()>, DbResult<()>);
}

/// Check the fields a migrator needs.
pub fn validate_config(config: &Config) -> DbResult<()> {
    if config.migrations_path.trim().is_empty() {
        return Err(DbError::validation("migrations path is required"));
    }
    if config.dsn.trim().is_empty() {
        return Err(DbError::validation("database dsn is required"));
    }
    if config.driver.trim().is_empty() {
        return Err(DbError::validation("database driver is required"));
    }
    Ok(())
}

pub struct SqlMigrator {
    pool: DbPool,
    migrations: SqlxMigrator,
}

impl SqlMigrator {
    /// Open a dedicated pool and load the migrations of `config`.
    pub async fn new(config: &Config) -> DbResult<Self> {
        validate_config(config)?;
        let db_type = resolve_database_type(config)?;
        let pool = DbPool::connect(config, db_type).await?;
        match Self::with_pool(pool.clone(), &config.migrations_path).await {
            Ok(migrator) => Ok(migrator),
            Err(err) => {
                pool.close().await;
                Err(err)
            }
        }
    }

    /// Use an existing pool.
    pub async fn with_pool(pool: DbPool, migrations_path: impl AsRef<Path>) -> DbResult<Self> {
        let path = migrations_path.as_ref();
        let migrations = SqlxMigrator::new(path).await.map_err(|e| {
            DbError::migration(
                format!("failed to load migrations from {}", path.display()),
                Some(Box::new(e)),
            )
        })?;
        debug!(
            path = %path.display(),
            count = migrations.iter().filter(|m| !m.migration_type.is_down_migration()).count(),
            "Migrations loaded"
        );
        Ok(Self { pool, migrations })
    }

    /// Versions already applied, ascending.
    pub async fn applied_versions(&self) -> DbResult<Vec<i64>> {
        let mut versions = impl_db_dispatch!(DbPool, &self.pool, {
            MySql(p) => applied_versions(p).await,
            Postgres(p) => applied_versions(p).await,
            SQLite(p) => applied_versions(p).await,
        })?;
        versions.sort_unstable();
        Ok(versions)
    }

    async fn run_pending(&self) -> Result<(), MigrateError> {
        impl_db_dispatch!(DbPool, &self.pool, {
            MySql(p) => self.migrations.run(p).await,
            Postgres(p) => self.migrations.run(p).await,
            SQLite(p) => self.migrations.run(p).await,
        })
    }

    /// Revert every applied migration newer than `target`.
    async fn undo_to(&self, target: i64) -> Result<(), MigrateError> {
        impl_db_dispatch!(DbPool, &self.pool, {
            MySql(p) => self.migrations.undo(p, target).await,
            Postgres(p) => self.migrations.undo(p, target).await,
            SQLite(p) => self.migrations.undo(p, target).await,
        })
    }
}

async fn applied_versions<DB>(pool: &Pool<DB>) -> Result<Vec<i64>, MigrateError>
where
    DB: Database,
    DB::Connection: Migrate,
{
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table().await?;
    let applied = conn.list_applied_migrations().await?;
    Ok(applied.into_iter().map(|m| m.version).collect())
}

/// Version to undo down to when reverting `steps` of `applied` (ascending).
fn down_target(applied: &[i64], steps: usize) -> i64 {
    if steps >= applied.len() {
        0
    } else {
        applied[applied.len() - steps - 1]
    }
}

#[async_trait]
impl Migrator for SqlMigrator {
    async fn up(&self, ctx: &Context) -> DbResult<()> {
        ctx.run("MigrateUp", async {
            self.run_pending().await?;
            Ok::<(), DbError>(())
        })
        .await?;
        info!("Migrations applied");
        Ok(())
    }

    async fn down(&self, ctx: &Context, steps: i64) -> DbResult<()> {
        let Ok(steps) = usize::try_from(steps) else {
            return Ok(());
        };
        if steps == 0 {
            return Ok(());
        }
        ctx.run("MigrateDown", async {
            let applied = self.applied_versions().await?;
            if applied.is_empty() {
                return Ok::<(), DbError>(());
            }
            let target = down_target(&applied, steps);
            self.undo_to(target).await?;
            info!(steps, target, "Migrations reverted");
            Ok(())
        })
        .await
    }

    async fn fresh(&self, ctx: &Context) -> DbResult<()> {
        ctx.run("MigrateFresh", async {
            self.undo_to(0).await?;
            self.run_pending().await?;
            Ok::<(), DbError>(())
        })
        .await?;
        info!("Migrations re-applied from scratch");
        Ok(())
    }

    async fn close(&self) -> (DbResult<()>, DbResult<()>) {
        // File sources hold no handle.
        let source = Ok(());
        self.pool.close().await;
        debug!("Migration pool closed");
        (source, Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_order() {
        let config = Config::new().with_driver("sqlx:sqlite").with_dsn("sqlite::memory:");
        let config = config.with_migrations_path("");
        assert_eq!(
            validate_config(&config).unwrap_err().to_string(),
            "Validation failed: migrations path is required"
        );

        let config = Config::new().with_migrations_path("migrations").with_driver("sqlx");
        assert!(
            validate_config(&config)
                .unwrap_err()
                .to_string()
                .contains("dsn is required")
        );

        let config = Config::new().with_migrations_path("migrations").with_dsn("sqlite::memory:");
        assert!(
            validate_config(&config)
                .unwrap_err()
                .to_string()
                .contains("driver is required")
        );
    }

    #[test]
    fn test_down_target() {
        assert_eq!(down_target(&[1, 2, 3], 1), 2);
        assert_eq!(down_target(&[1, 2, 3], 2), 1);
        assert_eq!(down_target(&[1, 2, 3], 3), 0);
        assert_eq!(down_target(&[1, 2, 3], 10), 0);
    }

    #[tokio::test]
    async fn test_missing_directory_is_migration_error() {
        let config = Config::new()
            .with_driver("sqlx:sqlite")
            .with_dsn("sqlite::memory:")
            .with_migrations_path("/definitely/not/here");
        let err = SqlMigrator::new(&config).await.err().unwrap();
        assert!(matches!(err, DbError::Migration { .. }));
    }
}
