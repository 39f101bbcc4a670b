//! dbkit - Main entry point.
//!
//! Connectivity checks and schema migrations for the databases the toolkit
//! supports (in-memory, SQLite, PostgreSQL, MySQL).

use clap::Parser;
use dbkit::config::{Cli, Command, MigrateAction};
use dbkit::registry::default_registries;
use dbkit::{Context, DbError, Migrator, SqlMigrator, connect, register_defaults};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

/// Context cancelled on Ctrl-C.
fn interruptible_context() -> Context {
    let ctx = Context::background();
    let token = ctx.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
    ctx
}

async fn run(cli: Cli) -> Result<(), DbError> {
    let (adapters, builders) = default_registries();
    register_defaults(adapters, builders).await?;
    let ctx = interruptible_context();

    match cli.command {
        Command::Drivers => {
            for name in adapters.list().await {
                println!("{name}");
            }
            Ok(())
        }
        Command::Ping => {
            let config = cli.to_config();
            let conn = connect(&ctx, config, adapters).await?;
            let version = conn.server_version().await;
            println!(
                "ok: driver={} server={}",
                conn.driver(),
                version.as_deref().unwrap_or("unknown")
            );
            conn.close().await
        }
        Command::Migrate { ref action } => {
            let config = cli.to_config();
            let migrator = SqlMigrator::new(&config).await?;
            let result = match *action {
                MigrateAction::Up => migrator.up(&ctx).await,
                MigrateAction::Down { steps } => migrator.down(&ctx, steps).await,
                MigrateAction::Fresh => migrator.fresh(&ctx).await,
            };
            let (source_result, db_result) = migrator.close().await;
            if let Err(e) = source_result {
                warn!(error = %e, "Failed to close migration source");
            }
            if let Err(e) = db_result {
                warn!(error = %e, "Failed to close migration database");
            }
            result
        }
    }
}

#[tokio::main]
async fn main() {
    // Parse configuration from command line and environment
    let cli = Cli::parse();

    // Initialize logging
    init_tracing(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting dbkit");

    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e}");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("Suggestion: {suggestion}");
        }
        std::process::exit(1);
    }
}
