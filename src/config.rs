//! Configuration handling for dbkit.
//!
//! [`Config`] is the library-level connection configuration. [`Cli`] is the
//! binary's view of it, parsed from command-line arguments and environment
//! variables and converted into a [`Config`].

use crate::connection::Adapter;
use crate::error::{DbError, DbResult};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_MAX_IDLE_CONNS: u32 = 10;
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 100;
pub const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_MODELS_PATH: &str = "domain";

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Connection configuration, validated once when connecting.
#[derive(Clone)]
pub struct Config {
    /// Driver name, by convention `"<family>:<dialect>"` (e.g. `sqlx:postgres`).
    pub driver: String,
    /// Contains sensitive data - log only through [`mask_dsn`].
    pub dsn: String,
    pub migrations_path: String,
    pub models_path: String,
    pub max_idle_conns: u32,
    pub max_open_conns: u32,
    pub conn_max_lifetime: Duration,
    /// Adapter used instead of a registry lookup when set.
    pub adapter: Option<Arc<dyn Adapter>>,
    /// Adapter-specific tuning.
    pub settings: HashMap<String, Value>,
}

/// A deferred modification applied to a [`Config`] before validation.
pub type ConfigOption = Box<dyn FnOnce(&mut Config) + Send>;

impl Config {
    pub fn new() -> Self {
        Self {
            driver: String::new(),
            dsn: String::new(),
            migrations_path: String::new(),
            models_path: DEFAULT_MODELS_PATH.to_string(),
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            conn_max_lifetime: DEFAULT_CONN_MAX_LIFETIME,
            adapter: None,
            settings: HashMap::new(),
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.dsn = dsn.into();
        self
    }

    pub fn with_migrations_path(mut self, path: impl Into<String>) -> Self {
        self.migrations_path = path.into();
        self
    }

    pub fn with_models_path(mut self, path: impl Into<String>) -> Self {
        self.models_path = path.into();
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn with_pool(mut self, max_idle: u32, max_open: u32, max_lifetime: Duration) -> Self {
        self.max_idle_conns = max_idle;
        self.max_open_conns = max_open;
        self.conn_max_lifetime = max_lifetime;
        self
    }

    pub fn apply(&mut self, options: impl IntoIterator<Item = ConfigOption>) {
        for option in options {
            option(self);
        }
    }

    /// Check that the fields every adapter needs are present.
    pub fn validate(&self) -> DbResult<()> {
        if self.driver.is_empty() {
            return Err(DbError::validation("database driver is required"));
        }
        if self.dsn.is_empty() {
            return Err(DbError::validation("database dsn is required"));
        }
        Ok(())
    }

    /// Driver family, the part before the first `:`.
    pub fn driver_family(&self) -> &str {
        self.driver.split(':').next().unwrap_or_default()
    }

    /// Driver dialect, the part after the first `:`, if any.
    pub fn driver_dialect(&self) -> Option<&str> {
        self.driver.split_once(':').map(|(_, dialect)| dialect)
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        match self.settings.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        match self.settings.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    pub fn masked_dsn(&self) -> String {
        mask_dsn(&self.dsn)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("driver", &self.driver)
            .field("dsn", &self.masked_dsn())
            .field("migrations_path", &self.migrations_path)
            .field("models_path", &self.models_path)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_open_conns", &self.max_open_conns)
            .field("conn_max_lifetime", &self.conn_max_lifetime)
            .field("adapter", &self.adapter.as_ref().map(|a| a.name().to_string()))
            .field("settings", &self.settings)
            .finish()
    }
}

/// Functional options accepted by [`crate::connect::connect_with`].
pub mod options {
    use super::ConfigOption;
    use crate::connection::Adapter;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    /// Use `adapter` instead of looking the driver up in the registry.
    pub fn with_adapter(adapter: Arc<dyn Adapter>) -> ConfigOption {
        Box::new(move |config| config.adapter = Some(adapter))
    }

    pub fn with_setting(key: impl Into<String>, value: impl Into<Value>) -> ConfigOption {
        let key = key.into();
        let value = value.into();
        Box::new(move |config| {
            config.settings.insert(key, value);
        })
    }

    pub fn with_pool(max_idle: u32, max_open: u32, max_lifetime: Duration) -> ConfigOption {
        Box::new(move |config| {
            config.max_idle_conns = max_idle;
            config.max_open_conns = max_open;
            config.conn_max_lifetime = max_lifetime;
        })
    }
}

/// Connection pool options resolved from a [`Config`].
///
/// The settings bag wins over the generic pool fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolOptions {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    /// Upper bound on the connections kept open while idle.
    pub max_idle_connections: Option<u32>,
    pub idle_timeout_secs: Option<u64>,
    pub acquire_timeout_secs: Option<u64>,
    pub test_before_acquire: Option<bool>,
    pub max_lifetime: Option<Duration>,
}

impl PoolOptions {
    pub fn from_config(config: &Config) -> Self {
        let to_u32 = |v: u64| u32::try_from(v).ok();
        Self {
            max_connections: config
                .setting_u64("max_connections")
                .and_then(to_u32)
                .or_else(|| (config.max_open_conns > 0).then_some(config.max_open_conns)),
            min_connections: config.setting_u64("min_connections").and_then(to_u32),
            max_idle_connections: Some(config.max_idle_conns),
            idle_timeout_secs: config.setting_u64("idle_timeout_secs"),
            acquire_timeout_secs: config.setting_u64("acquire_timeout_secs"),
            test_before_acquire: config.setting_bool("test_before_acquire"),
            max_lifetime: (!config.conn_max_lifetime.is_zero()).then_some(config.conn_max_lifetime),
        }
    }

    /// SQLite pools default to one connection regardless of `max_open_conns`.
    pub fn max_connections_or_default(&self, is_sqlite: bool, explicit: bool) -> u32 {
        match (is_sqlite, explicit) {
            (true, false) => DEFAULT_MAX_CONNECTIONS_SQLITE,
            _ => self.max_connections.unwrap_or(DEFAULT_MAX_OPEN_CONNS),
        }
    }

    /// Connections the pool keeps open when idle. sqlx has no idle cap of
    /// its own, so `max_idle_connections` bounds this floor instead; it is
    /// also never above the effective maximum.
    pub fn min_connections_or_default(&self, max_connections: u32) -> u32 {
        self.min_connections
            .unwrap_or(DEFAULT_MIN_CONNECTIONS)
            .min(self.max_idle_connections.unwrap_or(u32::MAX))
            .min(max_connections)
    }

    pub fn idle_timeout_or_default(&self) -> u64 {
        self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS)
    }

    pub fn acquire_timeout_or_default(&self) -> u64 {
        self.acquire_timeout_secs
            .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS)
    }

    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire.unwrap_or(true)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err("max_connections must be greater than 0".to_string());
            }
        }
        if let Some(min) = self.min_connections {
            if let Some(max) = self.max_connections {
                if min > max {
                    return Err(format!(
                        "min_connections ({}) cannot exceed max_connections ({})",
                        min, max
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Mask the password of a URL-shaped DSN. Other DSNs are returned as is.
pub fn mask_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("****")).is_ok() {
                url.to_string()
            } else {
                dsn.to_string()
            }
        }
        _ => dsn.to_string(),
    }
}

/// Command-line interface of the `dbkit` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbkit",
    about = "Database toolkit - connectivity checks and schema migrations",
    version
)]
pub struct Cli {
    /// Driver name, e.g. sqlx:sqlite, sqlx:postgres, sqlx:mysql
    #[arg(long, env = "DBKIT_DRIVER", global = true, default_value = "")]
    pub driver: String,

    /// Connection string
    #[arg(long, env = "DBKIT_DSN", global = true, default_value = "")]
    pub dsn: String,

    /// Directory holding reversible migration files
    #[arg(
        long,
        env = "DBKIT_MIGRATIONS_PATH",
        global = true,
        default_value = "migrations"
    )]
    pub migrations_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBKIT_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBKIT_JSON_LOGS", global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Connect, ping, and report the server
    Ping,
    /// List registered driver names
    Drivers,
    /// Run schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Revert the given number of applied migrations
    Down {
        #[arg(default_value_t = 1)]
        steps: i64,
    },
    /// Revert everything, then apply all migrations again
    Fresh,
}

impl Cli {
    pub fn to_config(&self) -> Config {
        Config::new()
            .with_driver(self.driver.clone())
            .with_dsn(self.dsn.clone())
            .with_migrations_path(self.migrations_path.clone())
    }
}
