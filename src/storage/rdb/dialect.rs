//! Per-engine SQL differences
//!
//! Shared relational logic is written once against `sqlx::Any`; everything
//! that differs between SQLite, MySQL and PostgreSQL lives behind [`Dialect`].

use std::fmt;
use std::path::Path;

use tracing::info;

use super::schema::{ColumnKind, TableDef};
use crate::storage::backend::{BackendKind, StoreOptions};
use crate::storage::error::{StoreError, StoreResult};

pub(crate) trait Dialect: fmt::Debug + Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Turn a configured target into a URL the `Any` driver accepts
    fn connection_url(&self, target: &str) -> StoreResult<String>;

    fn column_type(&self, kind: ColumnKind) -> &'static str;

    /// DDL that creates `table` and its indexes if missing
    fn create_table(&self, table: &TableDef) -> Vec<String> {
        let mut stmts = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table.name,
            self.column_defs(table)
        )];
        for index in table.indexes {
            stmts.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                index.name, table.name, index.column
            ));
        }
        stmts
    }

    fn column_defs(&self, table: &TableDef) -> String {
        table
            .columns
            .iter()
            .map(|c| {
                let null = match c.kind {
                    ColumnKind::Id => "",
                    _ if c.nullable => " NULL",
                    _ => " NOT NULL",
                };
                format!("{} {}{}", c.name, self.column_type(c.kind), null)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Rewrite `?` placeholders into the engine's bind syntax
    fn sql(&self, sql: &str) -> String {
        sql.to_string()
    }

    /// Number of user tables in the current database/schema
    fn table_count_sql(&self) -> &'static str;

    /// Count of user tables named by the single bound parameter
    fn has_table_sql(&self) -> &'static str;

    /// Statements run on every new connection
    fn session_setup(&self, _options: &StoreOptions) -> Vec<String> {
        Vec::new()
    }

    fn max_connections(&self) -> u32 {
        5
    }

    /// Bind parameters one statement may carry
    fn max_bind_params(&self) -> usize {
        65_535
    }

    /// Whether `err` means another process holds the store
    fn is_locked(&self, _err: &sqlx::Error) -> bool {
        false
    }
}

pub(crate) fn for_kind(kind: BackendKind) -> StoreResult<Box<dyn Dialect>> {
    match kind {
        BackendKind::Sqlite3 => Ok(Box::new(Sqlite)),
        BackendKind::Mysql => Ok(Box::new(MySql)),
        BackendKind::Postgres => Ok(Box::new(Postgres)),
        BackendKind::Redis => Err(StoreError::UnsupportedBackend(format!(
            "{} is not a relational database",
            kind
        ))),
    }
}

// ============================================
// SQLite
// ============================================

#[derive(Debug)]
pub(crate) struct Sqlite;

/// SQLITE_BUSY and SQLITE_LOCKED primary result codes
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

impl Dialect for Sqlite {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite3
    }

    fn connection_url(&self, target: &str) -> StoreResult<String> {
        if target.starts_with("sqlite:") {
            return Ok(target.to_string());
        }
        if target == ":memory:" {
            return Ok("sqlite::memory:".to_string());
        }
        if target.is_empty() {
            return Err(StoreError::Configuration(
                "sqlite3 database path is empty".to_string(),
            ));
        }

        if let Some(parent) = Path::new(target).parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            info!(directory = %parent.display(), "Creating database directory");
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::connection(self.kind().as_str(), target, e)
            })?;
        }
        Ok(format!("sqlite://{}?mode=rwc", target))
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Id => "INTEGER PRIMARY KEY",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::ShortText | ColumnKind::Timestamp => "TEXT",
            ColumnKind::LongText => "TEXT",
        }
    }

    fn table_count_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'"
    }

    fn has_table_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?"
    }

    fn session_setup(&self, options: &StoreOptions) -> Vec<String> {
        let mut stmts = vec!["PRAGMA foreign_keys = ON".to_string()];
        if let Some(timeout) = options.busy_timeout {
            stmts.push(format!("PRAGMA busy_timeout = {}", timeout.as_millis()));
        }
        stmts
    }

    // One connection keeps `:memory:` databases alive and avoids
    // self-inflicted SQLITE_BUSY between pooled writers.
    fn max_connections(&self) -> u32 {
        1
    }

    // SQLITE_MAX_VARIABLE_NUMBER default since 3.32
    fn max_bind_params(&self) -> usize {
        32_766
    }

    fn is_locked(&self, err: &sqlx::Error) -> bool {
        let sqlx::Error::Database(db_err) = err else {
            return false;
        };
        if let Some(code) = db_err.code()
            && let Ok(code) = code.parse::<i64>()
        {
            let primary = code & 0xff;
            if primary == SQLITE_BUSY || primary == SQLITE_LOCKED {
                return true;
            }
        }
        let message = db_err.message();
        message.contains("database is locked") || message.contains("database table is locked")
    }
}

// ============================================
// MySQL
// ============================================

#[derive(Debug)]
pub(crate) struct MySql;

impl Dialect for MySql {
    fn kind(&self) -> BackendKind {
        BackendKind::Mysql
    }

    fn connection_url(&self, target: &str) -> StoreResult<String> {
        url_with_scheme(target, &["mysql://", "mariadb://"], "mysql://")
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Id => "BIGINT NOT NULL PRIMARY KEY",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::ShortText => "VARCHAR(255)",
            ColumnKind::Timestamp => "VARCHAR(64)",
            ColumnKind::LongText => "TEXT",
        }
    }

    // MySQL has no CREATE INDEX IF NOT EXISTS; declare indexes inline.
    fn create_table(&self, table: &TableDef) -> Vec<String> {
        let mut defs = self.column_defs(table);
        for index in table.indexes {
            defs.push_str(&format!(", INDEX {} ({})", index.name, index.column));
        }
        vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({}) DEFAULT CHARSET=utf8mb4",
            table.name, defs
        )]
    }

    fn table_count_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE()"
    }

    fn has_table_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?"
    }
}

// ============================================
// PostgreSQL
// ============================================

#[derive(Debug)]
pub(crate) struct Postgres;

impl Dialect for Postgres {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn connection_url(&self, target: &str) -> StoreResult<String> {
        url_with_scheme(target, &["postgres://", "postgresql://"], "postgres://")
    }

    fn column_type(&self, kind: ColumnKind) -> &'static str {
        match kind {
            ColumnKind::Id => "BIGINT PRIMARY KEY",
            ColumnKind::Integer => "BIGINT",
            ColumnKind::ShortText => "VARCHAR(255)",
            ColumnKind::Timestamp => "VARCHAR(64)",
            ColumnKind::LongText => "TEXT",
        }
    }

    fn sql(&self, sql: &str) -> String {
        numbered_placeholders(sql)
    }

    fn table_count_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM pg_tables WHERE schemaname = 'public'"
    }

    fn has_table_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM pg_tables WHERE schemaname = 'public' AND tablename = ?"
    }
}

fn url_with_scheme(target: &str, accepted: &[&str], default: &str) -> StoreResult<String> {
    if target.is_empty() {
        return Err(StoreError::Configuration(
            "database connection string is empty".to_string(),
        ));
    }
    if accepted.iter().any(|scheme| target.starts_with(scheme)) {
        Ok(target.to_string())
    } else {
        Ok(format!("{}{}", default, target))
    }
}

/// `?` → `$1`, `$2`, ... (no `?` appears inside literals in our SQL)
fn numbered_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut n = 0;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::rdb::schema::CATALOG_ENTRIES;
    use std::time::Duration;

    #[test]
    fn test_numbered_placeholders() {
        assert_eq!(
            numbered_placeholders("INSERT INTO t (a, b) VALUES (?, ?), (?, ?)"),
            "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(numbered_placeholders("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn test_sqlite_connection_urls() {
        let d = Sqlite;
        assert_eq!(d.connection_url(":memory:").unwrap(), "sqlite::memory:");
        assert_eq!(
            d.connection_url("sqlite://kev.db").unwrap(),
            "sqlite://kev.db"
        );
        assert_eq!(
            d.connection_url("kev.sqlite3").unwrap(),
            "sqlite://kev.sqlite3?mode=rwc"
        );
        assert!(matches!(
            d.connection_url(""),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_server_connection_urls() {
        assert_eq!(
            MySql.connection_url("root:pw@localhost/kev").unwrap(),
            "mysql://root:pw@localhost/kev"
        );
        assert_eq!(
            Postgres.connection_url("postgresql://u@h/kev").unwrap(),
            "postgresql://u@h/kev"
        );
    }

    #[test]
    fn test_mysql_declares_indexes_inline() {
        let stmts = MySql.create_table(&CATALOG_ENTRIES);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].contains("INDEX idx_catalog_entries_cve_id (cve_id)"));
        assert!(stmts[0].contains("cve_id VARCHAR(255) NOT NULL"));
    }

    #[test]
    fn test_sqlite_creates_indexes_separately() {
        let stmts = Sqlite.create_table(&CATALOG_ENTRIES);
        assert!(stmts[0].starts_with("CREATE TABLE IF NOT EXISTS catalog_entries"));
        assert!(stmts[0].contains("id INTEGER PRIMARY KEY,"));
        assert!(
            stmts
                .iter()
                .any(|s| s.contains("CREATE INDEX IF NOT EXISTS idx_catalog_entries_cve_id"))
        );
    }

    #[test]
    fn test_sqlite_session_setup_applies_busy_timeout() {
        let options = StoreOptions {
            busy_timeout: Some(Duration::from_secs(3)),
            ..StoreOptions::default()
        };
        let stmts = Sqlite.session_setup(&options);
        assert!(stmts.contains(&"PRAGMA busy_timeout = 3000".to_string()));
        assert!(stmts.contains(&"PRAGMA foreign_keys = ON".to_string()));
    }

    #[test]
    fn test_bind_limits() {
        assert_eq!(Sqlite.max_bind_params(), 32_766);
        assert_eq!(MySql.max_bind_params(), 65_535);
        assert_eq!(Postgres.max_bind_params(), 65_535);
    }

    #[test]
    fn test_redis_has_no_dialect() {
        assert!(for_kind(BackendKind::Redis).is_err());
        assert_eq!(
            for_kind(BackendKind::Postgres).unwrap().kind(),
            BackendKind::Postgres
        );
    }
}
