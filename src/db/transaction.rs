//! Transactions on a dedicated pooled connection.
//!
//! The outermost unit of work owns a sqlx [`Transaction`]; nested units run
//! as savepoints on the same connection. The handle is shared by every
//! transaction-scoped connection and query builder, and is emptied once the
//! transaction is committed or rolled back so late users get an error instead
//! of silently running outside it.

use crate::db::DatabaseType;
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    /// MySQL transaction
    MySql(Transaction<'static, MySql>),
    /// PostgreSQL transaction
    Postgres(Transaction<'static, Postgres>),
    /// SQLite transaction
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    /// Begin a transaction on a connection taken from `pool`.
    pub async fn begin(pool: &DbPool) -> DbResult<Self> {
        let tx = impl_db_dispatch!(DbPool, pool, {
            MySql(p) => DbTransaction::MySql(p.begin().await.map_err(|e| DbError::from_sqlx("Begin", e))?),
            Postgres(p) => DbTransaction::Postgres(p.begin().await.map_err(|e| DbError::from_sqlx("Begin", e))?),
            SQLite(p) => DbTransaction::SQLite(p.begin().await.map_err(|e| DbError::from_sqlx("Begin", e))?),
        });
        Ok(tx)
    }

    /// Get the database type for this transaction.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySql,
            DbTransaction::Postgres(_) => DatabaseType::Postgres,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Commit the transaction.
    pub async fn commit(self) -> DbResult<()> {
        impl_db_dispatch!(DbTransaction, self, {
            MySql(tx) => tx.commit().await,
            Postgres(tx) => tx.commit().await,
            SQLite(tx) => tx.commit().await,
        })
        .map_err(|e| DbError::from_sqlx("Commit", e))
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> DbResult<()> {
        impl_db_dispatch!(DbTransaction, self, {
            MySql(tx) => tx.rollback().await,
            Postgres(tx) => tx.rollback().await,
            SQLite(tx) => tx.rollback().await,
        })
        .map_err(|e| DbError::from_sqlx("Rollback", e))
    }
}

impl fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.db_type()).finish()
    }
}

/// Shared handle to one open transaction, at a given savepoint depth.
#[derive(Clone)]
pub struct TxHandle {
    id: Arc<str>,
    db_type: DatabaseType,
    inner: Arc<Mutex<Option<DbTransaction>>>,
    depth: usize,
}

impl TxHandle {
    pub fn new(tx: DbTransaction) -> Self {
        let id: Arc<str> = Uuid::new_v4().to_string().into();
        info!(transaction_id = %id, db_type = %tx.db_type(), "Transaction started");
        Self {
            id,
            db_type: tx.db_type(),
            inner: Arc::new(Mutex::new(Some(tx))),
            depth: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Savepoint nesting level; zero for the outermost unit of work.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Same transaction, one savepoint deeper.
    pub fn nested(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    /// Name of the savepoint this handle's depth runs under.
    pub fn savepoint_name(&self) -> String {
        format!("sp_{}", self.depth)
    }

    /// Lock the transaction slot. It is `None` once the transaction has finished.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<DbTransaction>> {
        self.inner.lock().await
    }

    pub(crate) fn inactive(&self) -> DbError {
        DbError::validation(format!("transaction {} is no longer active", self.id))
    }

    pub async fn commit(&self) -> DbResult<()> {
        let tx = self.take().await?;
        tx.commit().await?;
        info!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    pub async fn rollback(&self) -> DbResult<()> {
        let tx = self.take().await?;
        tx.rollback().await?;
        info!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }

    /// Roll back, logging instead of returning a failure. Used on error
    /// paths where the original error is the one worth reporting.
    pub async fn rollback_quietly(&self) {
        if let Err(err) = self.rollback().await {
            warn!(
                transaction_id = %self.id,
                error = %err,
                "Failed to roll back transaction"
            );
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    async fn take(&self) -> DbResult<DbTransaction> {
        self.lock().await.take().ok_or_else(|| self.inactive())
    }
}

impl fmt::Debug for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxHandle")
            .field("id", &self.id)
            .field("db_type", &self.db_type)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
