//! High-level repository over one entity type and one backend session.
//!
//! Repositories are cheap to clone and never change after construction:
//! every clause method returns a new repository wrapping a new builder.
//! Terminal operations decode backend rows into entities of the
//! repository's concrete type.

use crate::bridge::{self, Batch};
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::entity::{self, now_value};
use crate::models::{
    CREATED_AT, Condition, Entity, EntitySlot, Model, QueryState, Record, Row, UPDATED_AT,
};
use crate::query_builder::QueryBuilder;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Repository {
    builder: Arc<dyn QueryBuilder>,
    prototype: Arc<dyn Entity>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("model", &self.prototype.entity_type())
            .field("table", &self.prototype.table_name())
            .field("builder", &self.builder)
            .finish()
    }
}

impl Repository {
    pub fn new(builder: Box<dyn QueryBuilder>, prototype: Arc<dyn Entity>) -> Self {
        Self {
            builder: Arc::from(builder),
            prototype,
        }
    }

    fn derive(&self, builder: Box<dyn QueryBuilder>) -> Self {
        Self {
            builder: Arc::from(builder),
            prototype: Arc::clone(&self.prototype),
        }
    }

    /// The underlying builder, carrying every clause added so far.
    pub fn query_builder(&self) -> Box<dyn QueryBuilder> {
        self.builder.clone_builder()
    }

    pub fn model(&self) -> &dyn Entity {
        self.prototype.as_ref()
    }

    // --- Query building ---

    pub fn with(&self, relations: &[&str]) -> Self {
        self.derive(self.builder.with(relations))
    }

    pub fn filter(&self, condition: impl Into<Condition>) -> Self {
        self.derive(self.builder.filter(condition.into()))
    }

    pub fn or_filter(&self, condition: impl Into<Condition>) -> Self {
        self.derive(self.builder.or_filter(condition.into()))
    }

    /// Include soft-deleted rows.
    pub fn unscoped(&self) -> Self {
        self.derive(self.builder.unscoped())
    }

    /// Negative values are ignored.
    pub fn limit(&self, limit: i64) -> Self {
        self.derive(self.builder.limit(limit))
    }

    /// Negative values are ignored.
    pub fn offset(&self, offset: i64) -> Self {
        self.derive(self.builder.offset(offset))
    }

    /// Unsafe column names are ignored; directions other than `DESC` mean `ASC`.
    pub fn order_by(&self, column: &str, direction: &str) -> Self {
        self.derive(self.builder.order_by(column, direction))
    }

    // --- Read operations ---

    pub async fn find(&self, ctx: &Context, id: impl Into<Value>) -> DbResult<Option<Box<dyn Entity>>> {
        match self.builder.find(ctx, id.into()).await? {
            Some(row) => Ok(Some(self.decode(row)?)),
            None => Ok(None),
        }
    }

    pub async fn find_or_fail(&self, ctx: &Context, id: impl Into<Value>) -> DbResult<Box<dyn Entity>> {
        self.find(ctx, id).await?.ok_or(DbError::NotFound)
    }

    pub async fn first(&self, ctx: &Context) -> DbResult<Option<Box<dyn Entity>>> {
        match self.builder.first(ctx).await? {
            Some(row) => Ok(Some(self.decode(row)?)),
            None => Ok(None),
        }
    }

    pub async fn first_or_fail(&self, ctx: &Context) -> DbResult<Box<dyn Entity>> {
        self.first(ctx).await?.ok_or(DbError::NotFound)
    }

    pub async fn get(&self, ctx: &Context) -> DbResult<Vec<Box<dyn Entity>>> {
        let builder = Arc::clone(&self.builder);
        bridge::execute_and_decode(self.prototype.as_ref(), |mut batch| async move {
            for row in builder.get(ctx).await? {
                batch.push_row(row)?;
            }
            Ok::<_, DbError>(batch)
        })
        .await
    }

    pub async fn find_as<T: Record>(&self, ctx: &Context, id: impl Into<Value>) -> DbResult<Option<T>> {
        match self.builder.find(ctx, id.into()).await? {
            Some(row) => Ok(bridge::decode_rows::<T>(vec![row])?.pop()),
            None => Ok(None),
        }
    }

    pub async fn first_as<T: Record>(&self, ctx: &Context) -> DbResult<Option<T>> {
        match self.builder.first(ctx).await? {
            Some(row) => Ok(bridge::decode_rows::<T>(vec![row])?.pop()),
            None => Ok(None),
        }
    }

    pub async fn get_as<T: Record>(&self, ctx: &Context) -> DbResult<Vec<T>> {
        bridge::decode_rows(self.builder.get(ctx).await?)
    }

    /// Values of one column across matching rows.
    pub async fn pluck<T: DeserializeOwned>(&self, ctx: &Context, column: &str) -> DbResult<Vec<T>> {
        self.builder
            .pluck(ctx, column)
            .await?
            .into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|e| {
                    DbError::validation(format!("cannot decode column {}: {}", column, e))
                })
            })
            .collect()
    }

    pub async fn count(&self, ctx: &Context) -> DbResult<i64> {
        self.builder.count(ctx).await
    }

    pub async fn exists(&self, ctx: &Context) -> DbResult<bool> {
        self.builder.exists(ctx).await
    }

    // --- Write operations ---

    /// Persist `entities`, writing generated keys back into them.
    ///
    /// An empty slice is a no-op. A single entity is inserted directly;
    /// several go through one homogeneous batch insert.
    pub async fn create(&self, ctx: &Context, entities: &mut [EntitySlot]) -> DbResult<()> {
        match entities {
            [] => {
                debug!(table = self.prototype.table_name(), "Create called with no entities");
                Ok(())
            }
            [slot] => {
                let entity = self.expect_entity(slot.as_deref_mut(), 0)?;
                ctx.check("create")?;
                debug!(table = self.prototype.table_name(), "Creating single entity");
                let row = self.insert_row(entity)?;
                let created = self.builder.create(ctx, vec![row]).await?;
                let row = created
                    .into_iter()
                    .next()
                    .ok_or_else(|| DbError::internal("backend returned no row for create"))?;
                entity.fill(row)
            }
            _ => {
                let mut batch = self.prototype.to_batch(entities)?;
                ctx.check("create")?;
                debug!(
                    table = self.prototype.table_name(),
                    count = batch.len(),
                    "Creating entity batch"
                );
                let rows = self.stamp_created(batch.rows()?);
                let created = self.builder.create(ctx, rows).await?;
                batch.apply_rows(created)?;
                write_back(entities, batch.to_entities());
                Ok(())
            }
        }
    }

    /// Persist `entities` in chunks of `batch_size`.
    pub async fn create_in_batches(
        &self,
        ctx: &Context,
        entities: &mut [EntitySlot],
        batch_size: i64,
    ) -> DbResult<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let batch_size = usize::try_from(batch_size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| DbError::validation("batch size must be positive"))?;

        let mut batch = self.prototype.to_batch(entities)?;
        ctx.check("create_in_batches")?;
        debug!(
            table = self.prototype.table_name(),
            count = batch.len(),
            batch_size,
            "Creating entities in batches"
        );
        let rows = self.stamp_created(batch.rows()?);
        let created = self.builder.create_in_batches(ctx, rows, batch_size).await?;
        batch.apply_rows(created)?;
        write_back(entities, batch.to_entities());
        Ok(())
    }

    /// Write every field of each entity to the row with its primary key.
    ///
    /// Entities are updated one at a time; the first failure stops the rest.
    /// An entity whose row is missing (or soft-deleted, unless the repository
    /// is unscoped) fails with [`DbError::NotFound`].
    pub async fn update(&self, ctx: &Context, entities: &mut [EntitySlot]) -> DbResult<()> {
        for (index, slot) in entities.iter_mut().enumerate() {
            let entity = self.expect_entity(slot.as_deref_mut(), index)?;
            ctx.check("update")?;
            let mut values = entity::persistable_row(entity)?;
            let primary_key = entity.primary_key().to_string();
            values.remove(&primary_key);
            values.remove(CREATED_AT);
            if entity.timestamps() {
                values.insert(UPDATED_AT.to_string(), now_value());
            }
            let affected = self
                .write_builder()
                .filter(Condition::eq(primary_key, entity.id()))
                .update(ctx, values.clone())
                .await?;
            if affected == 0 {
                return Err(DbError::NotFound);
            }
            entity.fill(values)?;
        }
        Ok(())
    }

    /// Remove `entities`. Soft-delete models are marked deleted instead.
    pub async fn delete(&self, ctx: &Context, entities: &[EntitySlot]) -> DbResult<()> {
        self.remove(ctx, entities, self.write_builder()).await
    }

    /// Remove `entities` physically, even for soft-delete models.
    pub async fn force_delete(&self, ctx: &Context, entities: &[EntitySlot]) -> DbResult<()> {
        self.remove(ctx, entities, self.write_builder().unscoped()).await
    }

    async fn remove(
        &self,
        ctx: &Context,
        entities: &[EntitySlot],
        builder: Box<dyn QueryBuilder>,
    ) -> DbResult<()> {
        let ids = match entities {
            [] => return Ok(()),
            [slot] => {
                let Some(entity) = slot.as_deref() else {
                    return Err(nil_entity(0));
                };
                vec![entity.id()]
            }
            _ => {
                let batch = self.prototype.to_batch(entities)?;
                batch.to_entities().iter().map(|e| e.id()).collect()
            }
        };
        if let Some(index) = ids.iter().position(entity::is_zero_value) {
            return Err(DbError::validation(format!(
                "model at index {} has no primary key value",
                index
            )));
        }
        ctx.check("delete")?;
        let primary_key = self.prototype.primary_key().to_string();
        let affected = builder.filter_in(&primary_key, ids).delete(ctx).await?;
        debug!(table = self.prototype.table_name(), affected, "Deleted entities");
        Ok(())
    }

    // --- Upserts ---

    /// First row matching `condition`'s non-zero fields, or a newly created
    /// one built from `create` (or `condition` when `create` is `None`).
    pub async fn first_or_create(
        &self,
        ctx: &Context,
        condition: &dyn Entity,
        create: Option<&dyn Entity>,
    ) -> DbResult<Box<dyn Entity>> {
        let filter = Condition::Fields(entity::condition_row(condition)?);
        if let Some(existing) = self.write_builder().filter(filter).first(ctx).await? {
            return self.decode(existing);
        }

        let mut slots = [Some(create.unwrap_or(condition).clone_entity())];
        self.create(ctx, &mut slots).await?;
        let [created] = slots;
        created.ok_or_else(|| DbError::internal("created entity went missing"))
    }

    /// Apply `values` to the first row matching `condition`, or create a new
    /// row from `condition` merged with `values`.
    pub async fn update_or_create(
        &self,
        ctx: &Context,
        condition: &dyn Entity,
        values: Row,
    ) -> DbResult<Box<dyn Entity>> {
        let filter = Condition::Fields(entity::condition_row(condition)?);
        if let Some(existing) = self.write_builder().filter(filter).first(ctx).await? {
            let mut entity = self.decode(existing)?;
            let mut patch = values;
            if entity.timestamps() {
                patch.insert(UPDATED_AT.to_string(), now_value());
            }
            ctx.check("update_or_create")?;
            let affected = self
                .write_builder()
                .filter(Condition::eq(entity.primary_key().to_string(), entity.id()))
                .update(ctx, patch.clone())
                .await?;
            if affected == 0 {
                return Err(DbError::NotFound);
            }
            entity.fill(patch)?;
            return Ok(entity);
        }

        let mut entity = condition.clone_entity();
        entity.fill(values)?;
        let mut slots = [Some(entity)];
        self.create(ctx, &mut slots).await?;
        let [created] = slots;
        created.ok_or_else(|| DbError::internal("created entity went missing"))
    }

    // --- Helpers ---

    /// A fresh builder keeping only this repository's scoping and eager loads.
    fn write_builder(&self) -> Box<dyn QueryBuilder> {
        let current = self.builder.state();
        self.builder.with_state(QueryState {
            scoped: current.scoped,
            eager: current.eager.clone(),
            ..QueryState::default()
        })
    }

    fn decode(&self, row: Row) -> DbResult<Box<dyn Entity>> {
        let mut entity = self.prototype.new_instance();
        entity.fill(row)?;
        Ok(entity)
    }

    fn expect_entity<'a>(
        &self,
        entity: Option<&'a mut (dyn Entity + 'static)>,
        index: usize,
    ) -> DbResult<&'a mut (dyn Entity + 'static)> {
        let entity = entity.ok_or_else(|| nil_entity(index))?;
        let expected = self.prototype.entity_type();
        if entity.entity_type() != expected {
            return Err(DbError::validation(format!(
                "model at index {} is not assignable to expected type {}",
                index, expected
            )));
        }
        Ok(entity)
    }

    fn insert_row(&self, entity: &dyn Entity) -> DbResult<Row> {
        let row = entity::persistable_row(entity)?;
        Ok(self.stamp_created(vec![row]).remove(0))
    }

    fn stamp_created(&self, mut rows: Vec<Row>) -> Vec<Row> {
        if !self.prototype.timestamps() {
            return rows;
        }
        let now = now_value();
        for row in &mut rows {
            for column in [CREATED_AT, UPDATED_AT] {
                let missing = row.get(column).is_none_or(Value::is_null);
                if missing {
                    row.insert(column.to_string(), now.clone());
                }
            }
        }
        rows
    }
}

fn nil_entity(index: usize) -> DbError {
    DbError::validation(format!("model at index {} cannot be nil", index))
}

fn write_back(slots: &mut [EntitySlot], entities: Vec<Box<dyn Entity>>) {
    for (slot, entity) in slots.iter_mut().zip(entities) {
        *slot = Some(entity);
    }
}
