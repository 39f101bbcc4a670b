//! Name-to-implementation registries for adapters and query-builder factories.
//!
//! A [`Registry`] is an explicit value: construct one at startup, register the
//! backends you need, and hand it to the code that resolves names. Readers
//! share a read lock; registration takes the write lock.

use crate::connection::Adapter;
use crate::error::{DbError, DbResult, LookupKind};
use crate::query_builder::QueryBuilderFactory;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub type AdapterRegistry = Registry<dyn Adapter>;
pub type QueryBuilderRegistry = Registry<dyn QueryBuilderFactory>;

pub struct Registry<T: ?Sized> {
    kind: LookupKind,
    entries: Arc<RwLock<HashMap<String, Arc<T>>>>,
}

impl<T: ?Sized> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized + Send + Sync> Registry<T> {
    /// Create an empty registry whose lookup failures report `kind`.
    pub fn new(kind: LookupKind) -> Self {
        Self {
            kind,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `implementation` under every name in `names`.
    ///
    /// An existing entry under the same name is replaced. No entry is
    /// written when `names` is empty or any name is empty.
    pub async fn register<I, S>(&self, implementation: Arc<T>, names: I) -> DbResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            return Err(DbError::configuration(format!(
                "{} registration requires at least one name",
                self.label()
            )));
        }
        if names.iter().any(|name| name.is_empty()) {
            return Err(DbError::configuration(format!(
                "{} name cannot be empty",
                self.label()
            )));
        }

        let mut entries = self.entries.write().await;
        for name in names {
            if entries
                .insert(name.clone(), Arc::clone(&implementation))
                .is_some()
            {
                warn!(name = %name, kind = self.label(), "Overwriting registered implementation");
            } else {
                debug!(name = %name, kind = self.label(), "Registered implementation");
            }
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> DbResult<Arc<T>> {
        let entries = self.entries.read().await;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::lookup(self.kind, name))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Registered names, sorted and without duplicates.
    pub async fn list(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries
            .keys()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn label(&self) -> &'static str {
        match self.kind {
            LookupKind::Adapter => "adapter",
            LookupKind::QueryBuilderFactory => "query builder factory",
        }
    }
}

impl Registry<dyn Adapter> {
    pub fn adapters() -> Self {
        Self::new(LookupKind::Adapter)
    }
}

impl Registry<dyn QueryBuilderFactory> {
    pub fn query_builders() -> Self {
        Self::new(LookupKind::QueryBuilderFactory)
    }
}

/// Process-wide registries for binaries that do not wire their own.
///
/// Library code takes registries as parameters and never reaches for these.
pub fn default_registries() -> &'static (AdapterRegistry, QueryBuilderRegistry) {
    static DEFAULTS: OnceLock<(AdapterRegistry, QueryBuilderRegistry)> = OnceLock::new();
    DEFAULTS.get_or_init(|| (AdapterRegistry::adapters(), QueryBuilderRegistry::query_builders()))
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct Hello(&'static str);

    impl Greeter for Hello {
        fn greet(&self) -> String {
            format!("hello {}", self.0)
        }
    }

    fn registry() -> Registry<dyn Greeter> {
        Registry::new(LookupKind::Adapter)
    }

    #[tokio::test]
    async fn test_register_then_get_returns_same_instance() {
        let registry = registry();
        let greeter: Arc<dyn Greeter> = Arc::new(Hello("a"));
        registry
            .register(Arc::clone(&greeter), ["fam:a", "fam:b"])
            .await
            .unwrap();

        let a = registry.get("fam:a").await.unwrap();
        let b = registry.get("fam:b").await.unwrap();
        assert!(Arc::ptr_eq(&a, &greeter));
        assert!(Arc::ptr_eq(&b, &greeter));
    }

    #[tokio::test]
    async fn test_empty_name_is_configuration_error() {
        let registry = registry();
        let err = registry
            .register(Arc::new(Hello("a")), ["ok", ""])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
        // Nothing partially registered.
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_names_is_configuration_error() {
        let registry = registry();
        let err = registry
            .register(Arc::new(Hello("a")), Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_unknown_name_is_lookup_error() {
        let registry = registry();
        match registry.get("missing").await {
            Err(DbError::Lookup { name, .. }) => assert_eq!(name, "missing"),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("lookup should fail"),
        }
    }

    #[tokio::test]
    async fn test_reregistration_overwrites() {
        let registry = registry();
        registry.register(Arc::new(Hello("old")), ["x"]).await.unwrap();
        registry.register(Arc::new(Hello("new")), ["x"]).await.unwrap();
        assert_eq!(registry.get("x").await.unwrap().greet(), "hello new");
        assert_eq!(registry.list().await, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_list_is_sorted_without_duplicates() {
        let registry = registry();
        registry
            .register(Arc::new(Hello("a")), ["b", "a", "b"])
            .await
            .unwrap();
        registry.register(Arc::new(Hello("c")), ["c"]).await.unwrap();
        assert_eq!(registry.list().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let registry = registry();
        let clone = registry.clone();
        registry.register(Arc::new(Hello("a")), ["a"]).await.unwrap();
        assert!(clone.contains("a").await);
    }

    #[tokio::test]
    async fn test_concurrent_readers() {
        let registry = registry();
        registry.register(Arc::new(Hello("a")), ["a"]).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get("a").await.map(|g| g.greet())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "hello a");
        }
    }
}
