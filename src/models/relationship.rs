//! Relationship descriptors and the eager-load plans derived from them.

use crate::models::entity::Model;
use std::fmt;
use std::sync::Arc;

/// How one model relates to another.
///
/// The key-pair variants carry the column on the related table
/// (`foreign_key`) and the column on the owning side (`owner_key`).
/// `BelongsToMany` carries only the join table.
#[derive(Clone)]
pub enum Relationship {
    HasOne {
        related: Arc<dyn Model>,
        foreign_key: String,
        owner_key: String,
    },
    HasMany {
        related: Arc<dyn Model>,
        foreign_key: String,
        owner_key: String,
    },
    BelongsTo {
        related: Arc<dyn Model>,
        foreign_key: String,
        owner_key: String,
    },
    BelongsToMany {
        related: Arc<dyn Model>,
        join_table: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    HasOne,
    HasMany,
    BelongsTo,
    BelongsToMany,
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::HasOne => "HasOne",
            Self::HasMany => "HasMany",
            Self::BelongsTo => "BelongsTo",
            Self::BelongsToMany => "BelongsToMany",
        };
        f.write_str(name)
    }
}

impl Relationship {
    pub fn has_one(
        related: impl Model,
        foreign_key: impl Into<String>,
        owner_key: impl Into<String>,
    ) -> Self {
        Self::HasOne {
            related: Arc::new(related),
            foreign_key: foreign_key.into(),
            owner_key: owner_key.into(),
        }
    }

    pub fn has_many(
        related: impl Model,
        foreign_key: impl Into<String>,
        owner_key: impl Into<String>,
    ) -> Self {
        Self::HasMany {
            related: Arc::new(related),
            foreign_key: foreign_key.into(),
            owner_key: owner_key.into(),
        }
    }

    pub fn belongs_to(
        related: impl Model,
        foreign_key: impl Into<String>,
        owner_key: impl Into<String>,
    ) -> Self {
        Self::BelongsTo {
            related: Arc::new(related),
            foreign_key: foreign_key.into(),
            owner_key: owner_key.into(),
        }
    }

    pub fn belongs_to_many(related: impl Model, join_table: impl Into<String>) -> Self {
        Self::BelongsToMany {
            related: Arc::new(related),
            join_table: join_table.into(),
        }
    }

    pub fn kind(&self) -> RelationshipKind {
        match self {
            Self::HasOne { .. } => RelationshipKind::HasOne,
            Self::HasMany { .. } => RelationshipKind::HasMany,
            Self::BelongsTo { .. } => RelationshipKind::BelongsTo,
            Self::BelongsToMany { .. } => RelationshipKind::BelongsToMany,
        }
    }

    pub fn related(&self) -> &Arc<dyn Model> {
        match self {
            Self::HasOne { related, .. }
            | Self::HasMany { related, .. }
            | Self::BelongsTo { related, .. }
            | Self::BelongsToMany { related, .. } => related,
        }
    }

    /// Empty for `BelongsToMany`.
    pub fn foreign_key(&self) -> &str {
        match self {
            Self::HasOne { foreign_key, .. }
            | Self::HasMany { foreign_key, .. }
            | Self::BelongsTo { foreign_key, .. } => foreign_key,
            Self::BelongsToMany { .. } => "",
        }
    }

    /// Empty for `BelongsToMany`.
    pub fn owner_key(&self) -> &str {
        match self {
            Self::HasOne { owner_key, .. }
            | Self::HasMany { owner_key, .. }
            | Self::BelongsTo { owner_key, .. } => owner_key,
            Self::BelongsToMany { .. } => "",
        }
    }

    /// Empty for every variant except `BelongsToMany`.
    pub fn join_table(&self) -> &str {
        match self {
            Self::BelongsToMany { join_table, .. } => join_table,
            _ => "",
        }
    }

    /// Resolve how to load this relation for rows of `parent`.
    pub fn plan(&self, name: &str, parent: &dyn Model) -> LoadPlan {
        let related = self.related();
        let target = RelatedTable {
            table: related.table_name().to_string(),
            primary_key: related.primary_key().to_string(),
            soft_delete_column: related.soft_delete_column().map(str::to_string),
        };
        let or_pk = |key: &str, model: &dyn Model| {
            if key.is_empty() {
                model.primary_key().to_string()
            } else {
                key.to_string()
            }
        };

        let strategy = match self {
            Self::HasOne {
                foreign_key,
                owner_key,
                ..
            } => LoadStrategy::Direct {
                parent_column: or_pk(owner_key, parent),
                related_column: foreign_key.clone(),
                many: false,
            },
            Self::HasMany {
                foreign_key,
                owner_key,
                ..
            } => LoadStrategy::Direct {
                parent_column: or_pk(owner_key, parent),
                related_column: foreign_key.clone(),
                many: true,
            },
            Self::BelongsTo {
                foreign_key,
                owner_key,
                ..
            } => LoadStrategy::Direct {
                parent_column: foreign_key.clone(),
                related_column: or_pk(owner_key, related.as_ref()),
                many: false,
            },
            Self::BelongsToMany { join_table, .. } => LoadStrategy::Pivot {
                join_table: join_table.clone(),
                parent_column: parent.primary_key().to_string(),
                join_parent_column: pivot_column(parent),
                join_related_column: pivot_column(related.as_ref()),
                related_column: related.primary_key().to_string(),
            },
        };

        LoadPlan {
            name: name.to_string(),
            target,
            strategy,
        }
    }
}

impl fmt::Debug for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relationship")
            .field("kind", &self.kind())
            .field("related", &self.related().table_name())
            .field("foreign_key", &self.foreign_key())
            .field("owner_key", &self.owner_key())
            .field("join_table", &self.join_table())
            .finish()
    }
}

/// Join-table column naming a model: singular table name plus primary key, e.g. `user_id`.
pub fn pivot_column(model: &dyn Model) -> String {
    let table = model.table_name();
    let singular = table.strip_suffix('s').unwrap_or(table);
    format!("{}_{}", singular, model.primary_key())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedTable {
    pub table: String,
    pub primary_key: String,
    pub soft_delete_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStrategy {
    /// Related rows whose `related_column` equals the parent's `parent_column`.
    Direct {
        parent_column: String,
        related_column: String,
        many: bool,
    },
    /// Related rows reached through a join table.
    Pivot {
        join_table: String,
        parent_column: String,
        join_parent_column: String,
        join_related_column: String,
        related_column: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    pub name: String,
    pub target: RelatedTable,
    pub strategy: LoadStrategy,
}
