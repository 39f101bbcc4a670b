//! Integration tests for adapter and query-builder registration.

mod common;

use common::SpyAdapter;
use dbkit::error::LookupKind;
use dbkit::memory::{MemoryAdapter, MemoryQueryBuilderFactory};
use dbkit::{Adapter, AdapterRegistry, Config, Context, DbError, QueryBuilderRegistry, connect};
use std::sync::Arc;

#[tokio::test]
async fn test_aliases_share_one_adapter_instance() {
    let adapters = AdapterRegistry::adapters();
    let builders = QueryBuilderRegistry::query_builders();
    builders
        .register(Arc::new(MemoryQueryBuilderFactory), ["memory"])
        .await
        .unwrap();

    let spy = Arc::new(SpyAdapter::new(builders, false));
    let adapter: Arc<dyn Adapter> = spy.clone();
    adapters.register(adapter, ["fam:a", "fam:b"]).await.unwrap();

    let a = adapters.get("fam:a").await.unwrap();
    let b = adapters.get("fam:b").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.name(), "spy");

    let config = Config::new().with_driver("fam:a").with_dsn("alias");
    let conn = connect(&Context::background(), config, &adapters)
        .await
        .unwrap();
    assert_eq!(conn.driver(), "fam:a");
    assert_eq!(spy.connect_count(), 1);
    assert_eq!(spy.close_count(), 0);
}

#[tokio::test]
async fn test_empty_name_is_a_configuration_error() {
    let adapters = AdapterRegistry::adapters();
    let adapter: Arc<dyn Adapter> =
        Arc::new(MemoryAdapter::new(QueryBuilderRegistry::query_builders()));

    let err = adapters.register(Arc::clone(&adapter), [""]).await.unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));

    let err = adapters
        .register(adapter, Vec::<String>::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
    assert!(adapters.list().await.is_empty());
}

#[tokio::test]
async fn test_reregistering_overwrites_without_duplicates() {
    let adapters = AdapterRegistry::adapters();
    let builders = QueryBuilderRegistry::query_builders();
    let first: Arc<dyn Adapter> = Arc::new(MemoryAdapter::new(builders.clone()));
    let second: Arc<dyn Adapter> = Arc::new(SpyAdapter::new(builders, false));

    adapters.register(first, ["db"]).await.unwrap();
    adapters.register(Arc::clone(&second), ["db"]).await.unwrap();

    let found = adapters.get("db").await.unwrap();
    assert!(Arc::ptr_eq(&found, &second));
    assert_eq!(adapters.list().await, vec!["db"]);
}

#[tokio::test]
async fn test_missing_names_report_their_kind() {
    let adapters = AdapterRegistry::adapters();
    let builders = QueryBuilderRegistry::query_builders();

    let err = adapters.get("nope").await.err().unwrap();
    assert!(matches!(
        err,
        DbError::Lookup { kind: LookupKind::Adapter, ref name } if name == "nope"
    ));

    let err = builders.get("nope").await.err().unwrap();
    assert_eq!(
        err.to_string(),
        "query builder factory not found for adapter: nope"
    );
}

#[tokio::test]
async fn test_missing_query_builder_factory_fails_repository() {
    use dbkit::ConnectionExt;

    let adapters = AdapterRegistry::adapters();
    // Builders registry left empty on purpose.
    let adapter: Arc<dyn Adapter> =
        Arc::new(MemoryAdapter::new(QueryBuilderRegistry::query_builders()));
    adapters.register(adapter, ["memory"]).await.unwrap();

    let config = Config::new().with_driver("memory").with_dsn("no-builders");
    let conn = connect(&Context::background(), config, &adapters)
        .await
        .unwrap();
    let err = conn.repository::<common::User>().await.unwrap_err();
    assert!(matches!(
        err,
        DbError::Lookup {
            kind: LookupKind::QueryBuilderFactory,
            ..
        }
    ));
}
