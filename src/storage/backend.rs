//! Backend interface shared by every store

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{StoreError, StoreResult};
use crate::models::{CatalogEntry, ExtendedEntry, FetchMeta, Response};
use crate::progress::Progress;

/// Supported store types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite3,
    Mysql,
    Postgres,
    Redis,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Sqlite3 => "sqlite3",
            BackendKind::Mysql => "mysql",
            BackendKind::Postgres => "postgres",
            BackendKind::Redis => "redis",
        }
    }

    pub fn is_relational(self) -> bool {
        !matches!(self, BackendKind::Redis)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite3" => Ok(BackendKind::Sqlite3),
            "mysql" => Ok(BackendKind::Mysql),
            "postgres" => Ok(BackendKind::Postgres),
            "redis" => Ok(BackendKind::Redis),
            other => Err(StoreError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Tunables consumed by the backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Records per write batch; must be at least 1
    pub batch_size: usize,
    /// Read timeout for the Redis connection
    pub redis_timeout: Option<Duration>,
    /// How long SQLite waits on a locked file before reporting it busy
    pub busy_timeout: Option<Duration>,
    /// Trace every SQL statement
    pub debug_sql: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            redis_timeout: None,
            busy_timeout: None,
            debug_sql: false,
        }
    }
}

/// Uniform contract every store satisfies.
///
/// Handles are only obtained through [`crate::storage::open_store`], which
/// runs the legacy-layout gate and schema migration first.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Bring the storage layout up to date. No-op on a current store.
    async fn ensure_schema(&self) -> StoreResult<()>;

    /// True if the store holds data written before fetch metadata existed
    async fn detect_legacy_layout(&self) -> StoreResult<bool>;

    async fn close(&self) -> StoreResult<()>;

    /// Stored metadata, or [`FetchMeta::default`] if none was written yet
    async fn read_fetch_meta(&self) -> StoreResult<FetchMeta>;

    /// Persist `meta` with this build's revision and schema version
    async fn write_fetch_meta(&self, meta: &FetchMeta) -> StoreResult<()>;

    /// Make the catalog family exactly `records`
    async fn replace_catalog_entries(
        &self,
        records: &[CatalogEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()>;

    /// Make the extended family exactly `records`
    async fn replace_extended_entries(
        &self,
        records: &[ExtendedEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()>;

    async fn lookup_by_id(&self, cve_id: &str) -> StoreResult<Response>;

    /// One entry per requested ID, empty when nothing matches
    async fn lookup_by_many_ids(
        &self,
        cve_ids: &[String],
    ) -> StoreResult<HashMap<String, Response>>;
}

/// Stamp this build's identity onto caller-supplied metadata
pub(crate) fn stamped(meta: &FetchMeta) -> FetchMeta {
    FetchMeta {
        revision: crate::REVISION.to_string(),
        schema_version: crate::models::LATEST_SCHEMA_VERSION,
        last_fetched_at: meta.last_fetched_at,
    }
}
