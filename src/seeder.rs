//! Seeders populate a database with fixture or bootstrap data.

use crate::connection::Connection;
use crate::context::Context;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait Seeder: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &Context, conn: Arc<dyn Connection>) -> DbResult<()>;
}

/// Runs seeders in order against one connection.
pub struct SeederRunner {
    connection: Arc<dyn Connection>,
}

impl SeederRunner {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }

    /// Stops at the first failing seeder; later seeders do not run.
    pub async fn run(&self, ctx: &Context, seeders: &[Arc<dyn Seeder>]) -> DbResult<()> {
        for seeder in seeders {
            ctx.check("Seed")?;
            debug!(seeder = seeder.name(), "Running seeder");
            seeder
                .run(ctx, Arc::clone(&self.connection))
                .await
                .map_err(|e| DbError::seed(seeder.name(), e))?;
        }
        info!(count = seeders.len(), "Seeders finished");
        Ok(())
    }
}
