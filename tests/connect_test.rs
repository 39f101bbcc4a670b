//! Integration tests for connection bring-up through the facade.

mod common;

use common::{SpyAdapter, User, registries};
use dbkit::config::options;
use dbkit::{
    Adapter, AdapterRegistry, Config, ConnectionExt, Context, DbError, QueryBuilderRegistry,
    connect, connect_with,
};
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;

async fn spy_registry(fail_ping: bool) -> (AdapterRegistry, Arc<SpyAdapter>) {
    let (adapters, builders) = registries().await;
    let spy = Arc::new(SpyAdapter::new(builders, fail_ping));
    let adapter: Arc<dyn Adapter> = spy.clone();
    adapters.register(adapter, ["spy"]).await.unwrap();
    (adapters, spy)
}

#[tokio::test]
async fn test_failed_ping_closes_connection_once() {
    let (adapters, spy) = spy_registry(true).await;
    let config = Config::new().with_driver("spy").with_dsn("flaky");

    let err = connect(&Context::background(), config, &adapters)
        .await
        .unwrap_err();

    assert_eq!(spy.connect_count(), 1);
    assert_eq!(spy.close_count(), 1);
    assert!(err.to_string().contains("initial database ping failed"));
    let cause = err.source().map(ToString::to_string).unwrap_or_default();
    assert_eq!(cause, "Connection failed: server went away");
}

#[tokio::test]
async fn test_successful_connect_leaves_connection_open() {
    let (adapters, spy) = spy_registry(false).await;
    let config = Config::new().with_driver("spy").with_dsn("steady");

    let conn = connect(&Context::background(), config, &adapters)
        .await
        .unwrap();
    assert_eq!(spy.close_count(), 0);

    conn.close().await.unwrap();
    assert_eq!(spy.close_count(), 1);
}

#[tokio::test]
async fn test_cancelled_context_fails_the_initial_ping() {
    let (adapters, _) = registries().await;
    let ctx = Context::background();
    ctx.cancel();

    let config = Config::new().with_driver("memory").with_dsn("cancelled");
    let err = connect(&ctx, config, &adapters).await.unwrap_err();
    assert!(err.to_string().contains("initial database ping failed"));
}

#[tokio::test]
async fn test_missing_fields_fail_before_adapter_lookup() {
    let (adapters, spy) = spy_registry(false).await;
    let ctx = Context::background();

    let err = connect(&ctx, Config::new().with_dsn("x"), &adapters)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Validation failed: database driver is required");

    let err = connect(&ctx, Config::new().with_driver("spy"), &adapters)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Validation failed: database dsn is required");
    assert_eq!(spy.connect_count(), 0);
}

#[tokio::test]
async fn test_unknown_driver() {
    let (adapters, _) = registries().await;
    let config = Config::new().with_driver("oracle").with_dsn("x");
    let err = connect(&Context::background(), config, &adapters)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Lookup { .. }));
    assert_eq!(err.to_string(), "unknown database adapter \"oracle\"");
}

#[tokio::test]
async fn test_options_apply_before_validation() {
    let adapters = AdapterRegistry::adapters();
    let builders = QueryBuilderRegistry::query_builders();
    let spy = Arc::new(SpyAdapter::new(builders, false));

    let config = Config::new().with_driver("anything").with_dsn("opts");
    let conn = connect_with(
        &Context::background(),
        config,
        &adapters,
        vec![
            options::with_adapter(spy.clone()),
            options::with_setting("tenant", "acme"),
            options::with_pool(2, 4, Duration::from_secs(30)),
        ],
    )
    .await
    .unwrap();

    assert_eq!(spy.connect_count(), 1);
    let config = conn.config();
    assert_eq!(config.setting("tenant"), Some(&serde_json::json!("acme")));
    assert_eq!(config.max_idle_conns, 2);
    assert_eq!(config.max_open_conns, 4);
}

#[tokio::test]
async fn test_memory_repository_through_defaults() {
    let conn = common::memory_connection("defaults").await;
    let ctx = Context::background();
    let users = conn.repository::<User>().await.unwrap();

    users
        .create(&ctx, &mut [dbkit::slot(User::new("ann", "ann@example.com"))])
        .await
        .unwrap();
    assert_eq!(users.count(&ctx).await.unwrap(), 1);

    assert!(conn.ping(&ctx).await.is_ok());
    conn.close().await.unwrap();
    assert!(conn.ping(&ctx).await.is_err());
}
