//! Relational backend (SQLite, MySQL, PostgreSQL)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     RdbDriver                         │
//! ├──────────────────────────────────────────────────────┤
//! │  Pool:    sqlx::AnyPool                               │
//! │  Dialect: Sqlite | MySql | Postgres (DDL, binds,      │
//! │           legacy probe, lock detection)               │
//! │  Replace: one transaction per family                  │
//! │           DELETE all → INSERT in batches → COMMIT     │
//! └──────────────────────────────────────────────────────┘
//! ```

mod dialect;
mod operations;
pub(crate) mod schema;

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::{AnyPool, ConnectOptions};
use tracing::{debug, error, info};

use self::dialect::Dialect;
use self::schema::FETCH_META;
use super::backend::{Backend, BackendKind, StoreOptions};
use super::error::{StoreError, StoreResult};
use crate::models::{CatalogEntry, ExtendedEntry, FetchMeta, Response};
use crate::progress::Progress;

/// Store backed by one of the supported SQL engines
pub(crate) struct RdbDriver {
    dialect: Box<dyn Dialect>,
    pool: AnyPool,
    options: StoreOptions,
}

impl RdbDriver {
    /// Connect to `target`. Does not touch the schema.
    pub(crate) async fn open(
        kind: BackendKind,
        target: &str,
        options: &StoreOptions,
    ) -> StoreResult<Self> {
        sqlx::any::install_default_drivers();

        let dialect = dialect::for_kind(kind)?;
        let url = dialect.connection_url(target)?;

        let mut connect_options = AnyConnectOptions::from_str(&url)
            .map_err(|e| StoreError::connection(kind.as_str(), target, e))?;
        if !options.debug_sql {
            connect_options = connect_options.disable_statement_logging();
        }

        let setup = dialect.session_setup(options);
        debug!(dbtype = %kind, statements = setup.len(), "Opening database connection");

        let pool = AnyPoolOptions::new()
            .max_connections(dialect.max_connections())
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(move |conn, _meta| {
                let setup = setup.clone();
                Box::pin(async move {
                    for stmt in &setup {
                        sqlx::query(stmt).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                error!(dbtype = %kind, error = %e, "Failed to open database");
                if dialect.is_locked(&e) {
                    StoreError::Locked(format!("failed to open {}: {}", target, e))
                } else {
                    StoreError::connection(kind.as_str(), target, e)
                }
            })?;

        info!(dbtype = %kind, "Database connection opened");

        Ok(Self {
            dialect,
            pool,
            options: options.clone(),
        })
    }

    /// Map a driver error, surfacing lock contention as `Locked`
    fn query_err(&self, context: &'static str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
        move |e| {
            if self.dialect.is_locked(&e) {
                StoreError::Locked(format!("{}: {}", context, e))
            } else {
                StoreError::query(context, e)
            }
        }
    }

    fn trace_sql(&self, sql: &str) {
        if self.options.debug_sql {
            debug!(sql = %sql, "Executing SQL");
        }
    }

    async fn count(&self, sql: &str, bind: Option<&str>) -> StoreResult<i64> {
        let sql = self.dialect.sql(sql);
        self.trace_sql(&sql);
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(value) = bind {
            query = query.bind(value.to_string());
        }
        query
            .fetch_one(&self.pool)
            .await
            .map_err(self.query_err("Failed to count tables"))
    }
}

#[async_trait]
impl Backend for RdbDriver {
    fn kind(&self) -> BackendKind {
        self.dialect.kind()
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let dialect = self.dialect.as_ref();
        schema::init_schema(&self.pool, dialect, |e| {
            if dialect.is_locked(&e) {
                StoreError::Locked(format!("failed to migrate: {}", e))
            } else {
                StoreError::MigrationFailed(e.to_string())
            }
        })
        .await
    }

    async fn detect_legacy_layout(&self) -> StoreResult<bool> {
        let has_meta = self
            .count(self.dialect.has_table_sql(), Some(FETCH_META.name))
            .await?;
        if has_meta > 0 {
            return Ok(false);
        }

        let tables = self.count(self.dialect.table_count_sql(), None).await?;
        debug!(tables = tables, "No fetch metadata table; checking for other tables");
        Ok(tables > 0)
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        debug!(dbtype = %self.kind(), "Database connection closed");
        Ok(())
    }

    async fn read_fetch_meta(&self) -> StoreResult<FetchMeta> {
        self.select_fetch_meta().await
    }

    async fn write_fetch_meta(&self, meta: &FetchMeta) -> StoreResult<()> {
        self.upsert_fetch_meta(meta).await
    }

    async fn replace_catalog_entries(
        &self,
        records: &[CatalogEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()> {
        self.delete_and_insert_catalog(records, progress).await
    }

    async fn replace_extended_entries(
        &self,
        records: &[ExtendedEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()> {
        self.delete_and_insert_extended(records, progress).await
    }

    async fn lookup_by_id(&self, cve_id: &str) -> StoreResult<Response> {
        let catalog = self.select_catalog(cve_id).await?;
        let extended = self.select_extended(cve_id).await?;

        let mut res = Response::default();
        for item in catalog {
            match item {
                Ok(entry) => res.catalog.push(entry),
                Err(bad) => res.undecodable.push(bad),
            }
        }
        for item in extended {
            match item {
                Ok(entry) => res.extended.push(entry),
                Err(bad) => res.undecodable.push(bad),
            }
        }
        Ok(res)
    }

    async fn lookup_by_many_ids(
        &self,
        cve_ids: &[String],
    ) -> StoreResult<HashMap<String, Response>> {
        let mut m = HashMap::with_capacity(cve_ids.len());
        for cve_id in cve_ids {
            let res = self.lookup_by_id(cve_id).await?;
            m.insert(cve_id.clone(), res);
        }
        Ok(m)
    }
}
