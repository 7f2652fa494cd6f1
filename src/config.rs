use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::storage::StoreOptions;

// ============================================
// Environment variable name constants
// ============================================
pub mod env {
    pub const DBTYPE: &str = "DBTYPE";
    pub const DBPATH: &str = "DBPATH";
    pub const BATCH_SIZE: &str = "BATCH_SIZE";
    pub const REDIS_TIMEOUT_SECS: &str = "REDIS_TIMEOUT_SECS";
    pub const BUSY_TIMEOUT_MS: &str = "BUSY_TIMEOUT_MS";
    pub const DEBUG_SQL: &str = "DEBUG_SQL";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}

/// Record family accepted by `import`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Family {
    /// Primary known-exploited-vulnerabilities catalog
    Catalog,
    /// Secondary feed with exploit references
    Extended,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show version information
    Version,
    /// Print the stored fetch metadata as JSON
    Meta,
    /// Replace one record family with the JSON array in FILE
    Import {
        #[arg(value_enum)]
        family: Family,
        file: PathBuf,
    },
    /// Look up records by vulnerability ID
    Lookup {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kevstore",
    version,
    about = "Known exploited vulnerabilities store",
    long_about = "Stores known-exploited-vulnerability catalogs in SQLite, MySQL, PostgreSQL or Redis and serves lookups by CVE ID."
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Database type: sqlite3, mysql, postgres or redis
    #[arg(long, env = env::DBTYPE, default_value = "sqlite3")]
    pub dbtype: String,

    /// SQLite file path or connection string
    #[arg(long, env = env::DBPATH, default_value = "kev.sqlite3")]
    pub dbpath: String,

    /// Records written per batch
    #[arg(long, env = env::BATCH_SIZE, default_value = "50")]
    pub batch_size: usize,

    /// Redis read timeout in seconds (0 to disable)
    #[arg(long, env = env::REDIS_TIMEOUT_SECS, default_value = "0")]
    pub redis_timeout_secs: u64,

    /// SQLite busy timeout in milliseconds (0 keeps the driver default)
    #[arg(long, env = env::BUSY_TIMEOUT_MS, default_value = "0")]
    pub busy_timeout_ms: u64,

    /// Log every SQL statement
    #[arg(long, env = env::DEBUG_SQL, default_value = "false")]
    pub debug_sql: bool,

    /// Log format: json or compact
    #[arg(long, env = env::LOG_FORMAT, default_value = "compact")]
    pub log_format: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn from_args() -> Self {
        Config::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size < 1 {
            return Err(format!("{} must be at least 1", env::BATCH_SIZE));
        }
        if self.dbpath.is_empty() {
            return Err(format!("{} is required", env::DBPATH));
        }
        Ok(())
    }

    pub fn to_store_options(&self) -> StoreOptions {
        let nonzero = |d: Duration| (!d.is_zero()).then_some(d);
        StoreOptions {
            batch_size: self.batch_size,
            redis_timeout: nonzero(Duration::from_secs(self.redis_timeout_secs)),
            busy_timeout: nonzero(Duration::from_millis(self.busy_timeout_ms)),
            debug_sql: self.debug_sql,
        }
    }
}
