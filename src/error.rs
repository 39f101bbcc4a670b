//! Error types for dbkit.
//!
//! Every fallible operation returns [`DbResult`]. The variants follow the
//! toolkit's error taxonomy: configuration mistakes made while wiring the
//! registries, validation failures on caller input, lookups of unknown
//! names, missing records, and opaque backend failures that keep their
//! original cause reachable through [`std::error::Error::source`].

use thiserror::Error;

/// Boxed cause carried by backend-level errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("{}", lookup_message(.kind, .name))]
    Lookup { kind: LookupKind, name: String },

    #[error("record not found")]
    NotFound,

    #[error("db operation '{operation}' failed: {message}: {source}")]
    Backend {
        operation: String,
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Timeout: {operation} exceeded its deadline")]
    Timeout { operation: String },

    #[error("Unsupported by the {backend} backend: {feature}")]
    Unsupported { backend: String, feature: String },

    #[error("failed to run seeder {seeder}: {source}")]
    Seed {
        seeder: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Migration failed: {message}")]
    Migration {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// What kind of registry entry a lookup was searching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Adapter,
    QueryBuilderFactory,
}

fn lookup_message(kind: &LookupKind, name: &str) -> String {
    match kind {
        LookupKind::Adapter => format!("unknown database adapter {:?}", name),
        LookupKind::QueryBuilderFactory => {
            format!("query builder factory not found for adapter: {}", name)
        }
    }
}

impl DbError {
    /// Create a configuration error (broken startup wiring).
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a lookup error for an unknown registry name.
    pub fn lookup(kind: LookupKind, name: impl Into<String>) -> Self {
        Self::Lookup {
            kind,
            name: name.into(),
        }
    }

    /// Wrap a backend failure with the operation that produced it.
    pub fn backend(
        operation: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
            source: source.into(),
        }
    }

    /// Wrap an sqlx error with the operation name.
    ///
    /// `RowNotFound` and pool timeouts keep their dedicated variants so that
    /// callers can match on them regardless of where they surfaced.
    pub fn from_sqlx(operation: impl Into<String>, err: sqlx::Error) -> Self {
        let operation = operation.into();
        match err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::PoolTimedOut => Self::Timeout { operation },
            sqlx::Error::Database(db_err) => {
                let message = match db_err.code() {
                    Some(code) => format!("{} (SQLSTATE: {})", db_err.message(), code),
                    None => db_err.message().to_string(),
                };
                Self::Backend {
                    operation,
                    message,
                    source: Box::new(sqlx::Error::Database(db_err)),
                }
            }
            other => Self::Backend {
                operation,
                message: "database driver error".to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an unsupported-feature error.
    pub fn unsupported(backend: impl Into<String>, feature: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            feature: feature.into(),
        }
    }

    /// Wrap a seeder failure.
    pub fn seed(seeder: impl Into<String>, source: DbError) -> Self {
        Self::Seed {
            seeder: seeder.into(),
            source: Box::new(source),
        }
    }

    /// Create a migration error, optionally carrying the underlying cause.
    pub fn migration(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Migration {
            message: message.into(),
            source,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Timeout { .. } => {
                Some("Consider increasing the deadline or optimizing the operation")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::from_sqlx("query", err)
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::migration(err.to_string(), Some(Box::new(err)))
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::validation(format!("entity serialization failed: {}", err))
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
