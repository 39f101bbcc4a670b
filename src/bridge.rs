//! Type bridging between polymorphic entity collections and homogeneous ones.
//!
//! Repositories accept `&[EntitySlot]`, a collection of boxed entities of
//! any concrete type. Bulk backend operations need a single concrete
//! collection instead, so the bridge converts between the two. The generic
//! functions here are monomorphized per entity type; [`Entity::to_batch`]
//! and [`Entity::new_batch`] dispatch to them from a prototype when the
//! concrete type is only known at runtime.
//!
//! The bridge treats an empty input as an error. Deciding that an empty
//! write is a no-op belongs to the repository, which checks before calling
//! in here.

use crate::error::{DbError, DbResult};
use crate::models::entity::{self, Entity, EntitySlot, EntityType, Record, Row};
use downcast_rs::{DowncastSync, impl_downcast};
use std::fmt;
use std::future::Future;

/// A homogeneous collection of one concrete entity type.
///
/// Implemented for `Vec<T>`; backends that need the concrete vector can
/// recover it with `downcast_ref::<Vec<T>>()`.
pub trait Batch: DowncastSync + fmt::Debug {
    fn element_type(&self) -> EntityType;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writable rows, one per element, relation fields removed.
    fn rows(&self) -> DbResult<Vec<Row>>;

    /// Decode `row` into a new element appended at the end.
    fn push_row(&mut self, row: Row) -> DbResult<()>;

    /// Merge `rows` into the existing elements position by position.
    fn apply_rows(&mut self, rows: Vec<Row>) -> DbResult<()>;

    /// Upcast every element back into the polymorphic form.
    fn to_entities(&self) -> Vec<Box<dyn Entity>>;
}
impl_downcast!(sync Batch);

impl<T: Record> Batch for Vec<T> {
    fn element_type(&self) -> EntityType {
        EntityType::of::<T>()
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn rows(&self) -> DbResult<Vec<Row>> {
        self.iter()
            .map(|item| entity::persistable_row(item))
            .collect()
    }

    fn push_row(&mut self, row: Row) -> DbResult<()> {
        let mut item = T::default();
        item.fill(row)?;
        self.push(item);
        Ok(())
    }

    fn apply_rows(&mut self, rows: Vec<Row>) -> DbResult<()> {
        if rows.len() != self.len() {
            return Err(DbError::internal(format!(
                "backend returned {} rows for {} entities",
                rows.len(),
                self.len()
            )));
        }
        for (item, row) in self.iter_mut().zip(rows) {
            item.fill(row)?;
        }
        Ok(())
    }

    fn to_entities(&self) -> Vec<Box<dyn Entity>> {
        self.iter()
            .map(|item| Box::new(item.clone()) as Box<dyn Entity>)
            .collect()
    }
}

/// Zero value of the prototype's concrete type.
pub fn new_instance(prototype: &dyn Entity) -> Box<dyn Entity> {
    prototype.new_instance()
}

/// Concrete type descriptor of an entity.
pub fn concrete_type(entity: &dyn Entity) -> EntityType {
    entity.entity_type()
}

/// Convert a polymorphic collection into `Vec<T>`.
///
/// Fails when `entities` is empty, or at the first index (left to right)
/// holding a missing entity or an entity of another concrete type.
pub fn to_homogeneous<T: Record>(entities: &[EntitySlot]) -> DbResult<Vec<T>> {
    if entities.is_empty() {
        return Err(DbError::validation("models slice cannot be empty"));
    }

    let mut items = Vec::with_capacity(entities.len());
    for (index, slot) in entities.iter().enumerate() {
        let Some(entity) = slot else {
            return Err(DbError::validation(format!(
                "model at index {} cannot be nil",
                index
            )));
        };
        let Some(item) = entity.downcast_ref::<T>() else {
            return Err(DbError::validation(format!(
                "model at index {} is not assignable to expected type {}",
                index,
                std::any::type_name::<T>()
            )));
        };
        items.push(item.clone());
    }
    Ok(items)
}

/// Runtime-typed form of [`to_homogeneous`]: the element type is the prototype's.
pub fn to_homogeneous_like(
    prototype: &dyn Entity,
    entities: &[EntitySlot],
) -> DbResult<Box<dyn Batch>> {
    prototype.to_batch(entities)
}

/// Upcast a homogeneous collection into the polymorphic form.
///
/// Every `T: Record` is an [`Entity`], so the upcast cannot fail.
pub fn from_homogeneous<T: Record>(items: Vec<T>) -> Vec<Box<dyn Entity>> {
    items
        .into_iter()
        .map(|item| Box::new(item) as Box<dyn Entity>)
        .collect()
}

/// Run `executor` against an empty homogeneous collection of the
/// prototype's type and decode whatever it filled in.
///
/// The executor's error is returned unchanged.
pub async fn execute_and_decode<F, Fut>(
    prototype: &dyn Entity,
    executor: F,
) -> DbResult<Vec<Box<dyn Entity>>>
where
    F: FnOnce(Box<dyn Batch>) -> Fut,
    Fut: Future<Output = DbResult<Box<dyn Batch>>>,
{
    let batch = executor(prototype.new_batch()).await?;
    Ok(batch.to_entities())
}

/// Decode rows straight into a concrete type.
pub fn decode_rows<T: Record>(rows: Vec<Row>) -> DbResult<Vec<T>> {
    let mut items: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        items.push_row(row)?;
    }
    Ok(items)
}
