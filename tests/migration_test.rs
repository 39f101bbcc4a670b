//! Integration tests for file-based migrations on SQLite.

mod common;

use dbkit::migration::validate_config;
use dbkit::{Config, Context, DbError, Migrator, SqlMigrator};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_migrations(dir: &Path) {
    let files = [
        (
            "1_create_users.up.sql",
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL);",
        ),
        ("1_create_users.down.sql", "DROP TABLE users;"),
        (
            "2_create_posts.up.sql",
            "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, user_id INTEGER NOT NULL, title TEXT NOT NULL);",
        ),
        ("2_create_posts.down.sql", "DROP TABLE posts;"),
    ];
    for (name, sql) in files {
        fs::write(dir.join(name), sql).expect("write migration file");
    }
}

fn setup() -> (TempDir, Config) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let migrations = dir.path().join("migrations");
    fs::create_dir(&migrations).expect("create migrations dir");
    write_migrations(&migrations);

    let config = Config::new()
        .with_driver("sqlx:sqlite")
        .with_dsn(format!("sqlite:{}", dir.path().join("app.db").display()))
        .with_migrations_path(migrations.display().to_string());
    (dir, config)
}

#[tokio::test]
async fn test_up_down_fresh() {
    let (_dir, config) = setup();
    let ctx = Context::background();
    let migrator = SqlMigrator::new(&config).await.unwrap();

    migrator.up(&ctx).await.unwrap();
    assert_eq!(migrator.applied_versions().await.unwrap(), vec![1, 2]);

    // Nothing pending is still success.
    migrator.up(&ctx).await.unwrap();

    migrator.down(&ctx, 1).await.unwrap();
    assert_eq!(migrator.applied_versions().await.unwrap(), vec![1]);

    migrator.down(&ctx, 0).await.unwrap();
    migrator.down(&ctx, -2).await.unwrap();
    assert_eq!(migrator.applied_versions().await.unwrap(), vec![1]);

    migrator.fresh(&ctx).await.unwrap();
    assert_eq!(migrator.applied_versions().await.unwrap(), vec![1, 2]);

    migrator.down(&ctx, 10).await.unwrap();
    assert!(migrator.applied_versions().await.unwrap().is_empty());

    let (source, database) = migrator.close().await;
    assert!(source.is_ok());
    assert!(database.is_ok());
}

#[tokio::test]
async fn test_migrated_tables_are_usable() {
    let (_dir, config) = setup();
    let ctx = Context::background();
    let migrator = SqlMigrator::new(&config).await.unwrap();
    migrator.up(&ctx).await.unwrap();
    let _ = migrator.close().await;

    let (adapters, _) = common::registries().await;
    let conn = dbkit::connect(&ctx, config, &adapters).await.unwrap();
    let tables = conn
        .select(
            &ctx,
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'posts') ORDER BY name",
            vec![],
        )
        .await
        .unwrap();
    let names: Vec<&str> = tables.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, vec!["posts", "users"]);
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_context_applies_nothing() {
    let (_dir, config) = setup();
    let migrator = SqlMigrator::new(&config).await.unwrap();
    let ctx = Context::background();
    ctx.cancel();

    let err = migrator.up(&ctx).await.unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));
    assert!(migrator.applied_versions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_config_requirements() {
    let (_dir, config) = setup();

    let err = validate_config(&config.clone().with_migrations_path("")).unwrap_err();
    assert_eq!(err.to_string(), "Validation failed: migrations path is required");

    // The bare family name infers the dialect from the dsn.
    let inferred = SqlMigrator::new(&config.clone().with_driver("sqlx")).await.unwrap();
    let _ = inferred.close().await;

    let err = SqlMigrator::new(&config.clone().with_driver("sqlx:oracle"))
        .await
        .err()
        .unwrap();
    assert_eq!(err.to_string(), "Validation failed: unsupported sql dialect: oracle");

    let missing = config.with_migrations_path("/no/such/migrations");
    let err = SqlMigrator::new(&missing).await.err().unwrap();
    assert!(matches!(err, DbError::Migration { .. }));
}
