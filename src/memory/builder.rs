//! Query builder evaluating clauses against a [`MemoryStore`].

use super::store::{BACKEND, MemoryStore, Predicate, column_key, sort_rows};
use crate::context::Context;
use crate::eager;
use crate::error::{DbError, DbResult};
use crate::models::{Entity, ModelMeta, QueryState, Row, entity::now_value};
use crate::query_builder::{QueryBuilder, QueryBuilderFactory, Session, downcast_session};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct MemoryQueryBuilderFactory;

impl MemoryQueryBuilderFactory {
    pub const NAME: &'static str = "memory";
}

impl QueryBuilderFactory for MemoryQueryBuilderFactory {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn new_query_builder(
        &self,
        model: Arc<dyn Entity>,
        session: Session,
    ) -> DbResult<Box<dyn QueryBuilder>> {
        let store = downcast_session::<MemoryStore>(Self::NAME, session)?;
        Ok(Box::new(MemoryQueryBuilder::new((*store).clone(), model)))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryQueryBuilder {
    store: MemoryStore,
    model: Arc<dyn Entity>,
    meta: ModelMeta,
    state: QueryState,
}

impl MemoryQueryBuilder {
    pub fn new(store: MemoryStore, model: Arc<dyn Entity>) -> Self {
        let meta = ModelMeta::of(model.as_ref());
        Self {
            store,
            model,
            meta,
            state: QueryState::default(),
        }
    }

    fn predicate(&self) -> DbResult<Predicate> {
        Predicate::compile(
            &self.state.filters,
            self.meta.scope_column(self.state.scoped),
        )
    }

    /// Reject clauses this backend cannot evaluate.
    fn ensure_supported(&self, with_projection: bool) -> DbResult<()> {
        let state = &self.state;
        if !state.joins.is_empty() {
            return Err(DbError::unsupported(BACKEND, "joins"));
        }
        if !state.group_by.is_empty() || !state.having.is_empty() {
            return Err(DbError::unsupported(BACKEND, "group by / having"));
        }
        if state.raw.is_some() {
            return Err(DbError::unsupported(BACKEND, "raw queries"));
        }
        if with_projection && state.selects.iter().any(|s| !is_plain_column(s)) {
            return Err(DbError::unsupported(BACKEND, "select expressions"));
        }
        Ok(())
    }

    fn project(&self, rows: Vec<Row>) -> Vec<Row> {
        let columns: Vec<&str> = self
            .state
            .selects
            .iter()
            .filter(|s| !s.ends_with('*'))
            .map(|s| column_key(s))
            .collect();
        if columns.is_empty() {
            return rows;
        }
        rows.into_iter()
            .map(|mut row| {
                row.retain(|key, _| {
                    columns.contains(&key.as_str()) || self.state.eager.contains(key)
                });
                row
            })
            .collect()
    }
}

fn is_plain_column(select: &str) -> bool {
    select == "*" || select.ends_with(".*") || crate::models::is_safe_identifier(select)
}

#[async_trait]
impl QueryBuilder for MemoryQueryBuilder {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn model(&self) -> &Arc<dyn Entity> {
        &self.model
    }

    fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    fn state(&self) -> &QueryState {
        &self.state
    }

    fn with_state(&self, state: QueryState) -> Box<dyn QueryBuilder> {
        Box::new(Self {
            store: self.store.clone(),
            model: Arc::clone(&self.model),
            meta: self.meta.clone(),
            state,
        })
    }

    async fn get(&self, ctx: &Context) -> DbResult<Vec<Row>> {
        ctx.check("Get")?;
        self.ensure_supported(true)?;
        let predicate = self.predicate()?;

        let mut rows: Vec<Row> = {
            let tables = self.store.lock().await;
            tables
                .get(&self.meta.table)
                .map(|t| t.rows.iter().filter(|r| predicate.matches(r)).cloned().collect())
                .unwrap_or_default()
        };
        sort_rows(&mut rows, &self.state.orders);

        let offset = usize::try_from(self.state.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = self
            .state
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        let mut rows: Vec<Row> = rows.into_iter().skip(offset).take(limit).collect();

        let plans = eager::plans(self.model.as_ref(), &self.state.eager);
        eager::load(ctx, &self.store, &plans, &mut rows).await?;

        debug!(table = %self.meta.table, rows = rows.len(), "Memory query evaluated");
        Ok(self.project(rows))
    }

    async fn count(&self, ctx: &Context) -> DbResult<i64> {
        ctx.check("Count")?;
        self.ensure_supported(false)?;
        let predicate = self.predicate()?;
        let tables = self.store.lock().await;
        let count = tables
            .get(&self.meta.table)
            .map(|t| t.rows.iter().filter(|r| predicate.matches(r)).count())
            .unwrap_or(0);
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn create(&self, ctx: &Context, rows: Vec<Row>) -> DbResult<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .insert(ctx, &self.meta.table, &self.meta.primary_key, rows)
            .await
    }

    /// All batches land under one store lock, so a failing row leaves none
    /// of the earlier batches behind.
    async fn create_in_batches(
        &self,
        ctx: &Context,
        rows: Vec<Row>,
        batch_size: usize,
    ) -> DbResult<Vec<Row>> {
        if batch_size == 0 {
            return Err(DbError::validation("batch size must be positive"));
        }
        debug!(
            table = %self.meta.table,
            rows = rows.len(),
            batch_size,
            "Inserting rows in batches"
        );
        self.create(ctx, rows).await
    }

    async fn update(&self, ctx: &Context, values: Row) -> DbResult<u64> {
        self.ensure_supported(false)?;
        let predicate = self.predicate()?;
        let mut tables = self.store.lock().await;
        ctx.check("Update")?;
        let Some(table) = tables.get_mut(&self.meta.table) else {
            return Ok(0);
        };
        let mut affected = 0;
        for row in table.rows.iter_mut().filter(|r| predicate.matches(r)) {
            for (column, value) in &values {
                row.insert(column_key(column).to_string(), value.clone());
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, ctx: &Context) -> DbResult<u64> {
        self.ensure_supported(false)?;
        let predicate = self.predicate()?;
        let soft_column = self.meta.scope_column(self.state.scoped).map(str::to_string);
        let mut tables = self.store.lock().await;
        ctx.check("Delete")?;
        let Some(table) = tables.get_mut(&self.meta.table) else {
            return Ok(0);
        };

        let affected = match soft_column {
            Some(column) => {
                let now = now_value();
                let mut marked = 0;
                for row in table.rows.iter_mut().filter(|r| predicate.matches(r)) {
                    row.insert(column.clone(), now.clone());
                    marked += 1;
                }
                marked
            }
            None => {
                let before = table.rows.len();
                table.rows.retain(|r| !predicate.matches(r));
                (before - table.rows.len()) as u64
            }
        };
        debug!(table = %self.meta.table, affected, "Memory rows deleted");
        Ok(affected)
    }

    async fn exec(&self, _ctx: &Context, _sql: &str, _bindings: Vec<Value>) -> DbResult<u64> {
        Err(DbError::unsupported(BACKEND, "raw statements"))
    }

    fn to_sql(&self) -> DbResult<(String, Vec<Value>)> {
        Err(DbError::unsupported(BACKEND, "SQL rendering"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Condition, Model, Record};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Item {
        id: i64,
        name: String,
        deleted_at: Option<String>,
    }

    impl Model for Item {
        fn table_name(&self) -> &str {
            "items"
        }
        fn id(&self) -> Value {
            json!(self.id)
        }
        fn set_id(&mut self, id: Value) {
            self.id = id.as_i64().unwrap_or_default();
        }
        fn soft_delete_column(&self) -> Option<&str> {
            Some("deleted_at")
        }
    }

    fn builder() -> MemoryQueryBuilder {
        fn prototype<T: Record>() -> Arc<dyn Entity> {
            Arc::new(T::default())
        }
        MemoryQueryBuilder::new(MemoryStore::new(), prototype::<Item>())
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn seeded() -> MemoryQueryBuilder {
        let qb = builder();
        qb.create(
            &Context::background(),
            vec![
                row(json!({"name": "a"})),
                row(json!({"name": "b"})),
                row(json!({"name": "c"})),
            ],
        )
        .await
        .unwrap();
        qb
    }

    #[tokio::test]
    async fn test_clauses_do_not_mutate_receiver() {
        let qb = builder();
        let limited = qb.limit(5).filter(Condition::eq("name", "a"));
        assert!(qb.state().filters.is_empty());
        assert_eq!(qb.state().limit, None);
        assert_eq!(limited.state().limit, Some(5));
    }

    #[tokio::test]
    async fn test_order_limit_offset() {
        let qb = seeded().await;
        let rows = qb
            .order_by("id", "desc")
            .offset(1)
            .limit(1)
            .get(&Context::background())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("b"));
    }

    #[tokio::test]
    async fn test_exists_follows_count() {
        let qb = seeded().await;
        let ctx = Context::background();
        assert!(qb.filter(Condition::eq("name", "c")).exists(&ctx).await.unwrap());
        assert!(!qb.filter(Condition::eq("name", "z")).exists(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_soft_delete_then_unscoped() {
        let qb = seeded().await;
        let ctx = Context::background();
        let affected = qb.filter(Condition::eq("name", "a")).delete(&ctx).await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(qb.count(&ctx).await.unwrap(), 2);
        assert_eq!(qb.unscoped().count(&ctx).await.unwrap(), 3);

        let removed = qb
            .unscoped()
            .filter(Condition::eq("name", "a"))
            .delete(&ctx)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(qb.unscoped().count(&ctx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_select_projects_columns() {
        let qb = seeded().await;
        let names = qb.pluck(&Context::background(), "items.name").await.unwrap();
        assert_eq!(names, vec![json!("a"), json!("b"), json!("c")]);
    }

    #[tokio::test]
    async fn test_reset_drops_clauses() {
        let qb = seeded().await;
        let reset = qb.filter(Condition::eq("name", "a")).limit(1).reset();
        assert_eq!(reset.count(&Context::background()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_joins_are_unsupported() {
        let qb = builder().join("other", "other.item_id = items.id");
        let err = qb.get(&Context::background()).await.unwrap_err();
        assert!(matches!(err, DbError::Unsupported { .. }));
        assert!(qb.to_sql().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_context_writes_nothing() {
        let qb = builder();
        let ctx = Context::background();
        ctx.cancel();
        let err = qb.create(&ctx, vec![row(json!({"name": "x"}))]).await.unwrap_err();
        assert!(matches!(err, DbError::Cancelled { .. }));
        assert_eq!(qb.count(&Context::background()).await.unwrap(), 0);
    }
}
