//! Entity capability set.
//!
//! [`Model`] is the minimal capability set every domain type exposes
//! (table, primary key, identifier, relationships). [`Entity`] is its
//! object-safe, type-erased form: anything that is a `Model` and can be
//! serialized through serde gets it for free via [`Record`].

use crate::bridge::{self, Batch};
use crate::error::{DbError, DbResult};
use crate::models::relationship::Relationship;
use chrono::{DateTime, Utc};
use downcast_rs::{DowncastSync, impl_downcast};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

/// A single row as seen by backends: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// One position in a polymorphic entity collection. `None` is a missing entity.
pub type EntitySlot = Option<Box<dyn Entity>>;

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const DELETED_AT: &str = "deleted_at";

pub trait Model: Send + Sync + 'static {
    fn table_name(&self) -> &str;

    fn primary_key(&self) -> &str {
        "id"
    }

    /// Current identifier. Its shape is up to the entity; the toolkit never inspects it.
    fn id(&self) -> Value;

    fn set_id(&mut self, id: Value);

    fn relationships(&self) -> HashMap<String, Relationship> {
        HashMap::new()
    }

    /// Column marking soft-deleted rows. `None` disables soft delete.
    fn soft_delete_column(&self) -> Option<&str> {
        None
    }

    /// Whether `created_at` / `updated_at` are stamped on writes.
    fn timestamps(&self) -> bool {
        false
    }
}

/// Concrete entity types usable with repositories.
///
/// Blanket-implemented; deriving `Serialize`, `Deserialize`, `Default`,
/// `Clone` and `Debug` on a [`Model`] is enough.
pub trait Record: Model + Serialize + DeserializeOwned + Default + Clone + fmt::Debug {}

impl<T> Record for T where T: Model + Serialize + DeserializeOwned + Default + Clone + fmt::Debug {}

/// Runtime descriptor of a concrete entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityType {
    id: TypeId,
    name: &'static str,
}

impl EntityType {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Type-erased entity.
pub trait Entity: Model + DowncastSync + fmt::Debug {
    fn to_row(&self) -> DbResult<Row>;

    /// Overwrite fields present in `row`, keeping the rest.
    fn fill(&mut self, row: Row) -> DbResult<()>;

    /// Zero value of the same concrete type.
    fn new_instance(&self) -> Box<dyn Entity>;

    fn clone_entity(&self) -> Box<dyn Entity>;

    fn entity_type(&self) -> EntityType;

    /// Empty homogeneous collection of this entity's concrete type.
    fn new_batch(&self) -> Box<dyn Batch>;

    /// Bridge `entities` into a homogeneous collection of this entity's concrete type.
    fn to_batch(&self, entities: &[EntitySlot]) -> DbResult<Box<dyn Batch>>;
}
impl_downcast!(sync Entity);

impl<T: Record> Entity for T {
    fn to_row(&self) -> DbResult<Row> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(DbError::validation(format!(
                "entity {} must serialize to an object, got {}",
                std::any::type_name::<T>(),
                value_kind(&other)
            ))),
        }
    }

    fn fill(&mut self, row: Row) -> DbResult<()> {
        let mut current = self.to_row()?;
        current.extend(row);
        *self = serde_json::from_value(Value::Object(current)).map_err(|e| {
            DbError::validation(format!(
                "cannot decode row into {}: {}",
                std::any::type_name::<T>(),
                e
            ))
        })?;
        Ok(())
    }

    fn new_instance(&self) -> Box<dyn Entity> {
        Box::new(T::default())
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn entity_type(&self) -> EntityType {
        EntityType::of::<T>()
    }

    fn new_batch(&self) -> Box<dyn Batch> {
        Box::new(Vec::<T>::new())
    }

    fn to_batch(&self, entities: &[EntitySlot]) -> DbResult<Box<dyn Batch>> {
        let items: Vec<T> = bridge::to_homogeneous(entities)?;
        Ok(Box::new(items))
    }
}

/// Box a concrete entity into a collection slot.
pub fn slot<T: Record>(entity: T) -> EntitySlot {
    Some(Box::new(entity))
}

/// Row of the entity minus relation fields, ready to be written.
pub fn persistable_row(entity: &dyn Entity) -> DbResult<Row> {
    let mut row = entity.to_row()?;
    for name in entity.relationships().keys() {
        row.remove(name);
    }
    Ok(row)
}

/// Row holding only the entity's non-zero fields, used as an equality condition.
pub fn condition_row(entity: &dyn Entity) -> DbResult<Row> {
    let mut row = persistable_row(entity)?;
    row.retain(|_, value| !is_zero_value(value));
    Ok(row)
}

pub fn is_zero_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Embeddable `created_at` / `updated_at` pair. Use with `#[serde(flatten)]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Embeddable soft-delete marker. Use with `#[serde(flatten)]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SoftDelete {
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl SoftDelete {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Current time in the textual form rows carry.
pub fn now_value() -> Value {
    Value::String(Utc::now().to_rfc3339())
}
