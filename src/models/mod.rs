//! Data models shared by the repository layer and every backend.
//!
//! This module re-exports the entity capability set, relationship
//! descriptors, and the backend-neutral query clause model.

pub mod entity;
pub mod query;
pub mod relationship;

// Re-export commonly used types
pub use entity::{
    CREATED_AT, DELETED_AT, Entity, EntitySlot, EntityType, Model, Record, Row, SoftDelete,
    Timestamps, UPDATED_AT, slot,
};
pub use query::{
    Condition, Connective, Direction, Filter, Join, JoinKind, ModelMeta, Operator, OrderBy,
    QueryState, RawQuery, is_safe_identifier,
};
pub use relationship::{LoadPlan, LoadStrategy, RelatedTable, Relationship, RelationshipKind};
