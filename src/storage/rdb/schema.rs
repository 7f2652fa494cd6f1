//! Declarative table model and schema initialization

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::AnyPool;
use tracing::{debug, info};

use super::dialect::Dialect;
use crate::storage::error::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    /// Writer-assigned surrogate key
    Id,
    Integer,
    /// Up to 255 characters, indexable everywhere
    ShortText,
    LongText,
    /// RFC 3339 text
    Timestamp,
}

#[derive(Debug)]
pub(crate) struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub nullable: bool,
}

#[derive(Debug)]
pub(crate) struct IndexDef {
    pub name: &'static str,
    pub column: &'static str,
}

#[derive(Debug)]
pub(crate) struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub indexes: &'static [IndexDef],
}

impl TableDef {
    /// Comma-separated column names, optionally qualified by `alias`
    pub fn column_list(&self, alias: Option<&str>) -> String {
        self.columns
            .iter()
            .map(|c| match alias {
                Some(a) => format!("{}.{}", a, c.name),
                None => c.name.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Multi-row INSERT with `?` placeholders for `rows` rows
    pub fn insert_sql(&self, rows: usize) -> String {
        let row = format!(
            "({})",
            vec!["?"; self.columns.len()].join(", ")
        );
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.name,
            self.column_list(None),
            vec![row; rows].join(", ")
        )
    }
}

const fn col(name: &'static str, kind: ColumnKind) -> ColumnDef {
    ColumnDef {
        name,
        kind,
        nullable: false,
    }
}

const fn nullable(name: &'static str, kind: ColumnKind) -> ColumnDef {
    ColumnDef {
        name,
        kind,
        nullable: true,
    }
}

use ColumnKind::{Id, Integer, LongText, ShortText, Timestamp};

pub(crate) const FETCH_META: TableDef = TableDef {
    name: "fetch_meta",
    columns: &[
        col("id", Id),
        col("revision", ShortText),
        col("schema_version", Integer),
        col("last_fetched_at", Timestamp),
    ],
    indexes: &[],
};

pub(crate) const CATALOG_ENTRIES: TableDef = TableDef {
    name: "catalog_entries",
    columns: &[
        col("id", Id),
        col("cve_id", ShortText),
        col("vendor_project", ShortText),
        col("product", ShortText),
        col("vulnerability_name", ShortText),
        col("date_added", Timestamp),
        col("short_description", LongText),
        col("required_action", LongText),
        col("due_date", Timestamp),
        col("known_ransomware_campaign_use", ShortText),
        col("notes", LongText),
    ],
    indexes: &[IndexDef {
        name: "idx_catalog_entries_cve_id",
        column: "cve_id",
    }],
};

pub(crate) const EXTENDED_ENTRIES: TableDef = TableDef {
    name: "extended_entries",
    columns: &[
        col("id", Id),
        col("vendor_project", ShortText),
        col("product", ShortText),
        col("short_description", LongText),
        col("vulnerability_name", ShortText),
        col("required_action", LongText),
        col("known_ransomware_campaign_use", ShortText),
        nullable("due_date", Timestamp),
        nullable("catalog_date_added", Timestamp),
        col("date_added", Timestamp),
    ],
    indexes: &[],
};

pub(crate) const EXTENDED_ENTRY_CVES: TableDef = TableDef {
    name: "extended_entry_cves",
    columns: &[
        col("id", Id),
        col("extended_entry_id", Integer),
        col("cve_id", ShortText),
    ],
    indexes: &[
        IndexDef {
            name: "idx_extended_entry_cves_cve_id",
            column: "cve_id",
        },
        IndexDef {
            name: "idx_extended_entry_cves_entry_id",
            column: "extended_entry_id",
        },
    ],
};

pub(crate) const EXTENDED_ENTRY_EXPLOIT_REFS: TableDef = TableDef {
    name: "extended_entry_exploit_refs",
    columns: &[
        col("id", Id),
        col("extended_entry_id", Integer),
        col("xdb_id", ShortText),
        col("xdb_url", LongText),
        col("date_added", Timestamp),
        col("exploit_type", ShortText),
        col("clone_ssh_url", LongText),
    ],
    indexes: &[IndexDef {
        name: "idx_extended_entry_exploit_refs_entry_id",
        column: "extended_entry_id",
    }],
};

pub(crate) const EXTENDED_ENTRY_REPORTED_EXPLOITATIONS: TableDef = TableDef {
    name: "extended_entry_reported_exploitations",
    columns: &[
        col("id", Id),
        col("extended_entry_id", Integer),
        col("url", LongText),
        col("date_added", Timestamp),
    ],
    indexes: &[IndexDef {
        name: "idx_extended_entry_reported_exploitations_entry_id",
        column: "extended_entry_id",
    }],
};

pub(crate) const TABLES: &[&TableDef] = &[
    &FETCH_META,
    &CATALOG_ENTRIES,
    &EXTENDED_ENTRIES,
    &EXTENDED_ENTRY_CVES,
    &EXTENDED_ENTRY_EXPLOIT_REFS,
    &EXTENDED_ENTRY_REPORTED_EXPLOITATIONS,
];

/// Tables cleared when the extended family is replaced, children first
pub(crate) const EXTENDED_TABLES: &[&TableDef] = &[
    &EXTENDED_ENTRY_REPORTED_EXPLOITATIONS,
    &EXTENDED_ENTRY_EXPLOIT_REFS,
    &EXTENDED_ENTRY_CVES,
    &EXTENDED_ENTRIES,
];

/// Create every table and index that does not exist yet
pub(crate) async fn init_schema(
    pool: &AnyPool,
    dialect: &dyn Dialect,
    map_err: impl Fn(sqlx::Error) -> StoreError,
) -> StoreResult<()> {
    debug!(dialect = %dialect.kind(), "Initializing database schema");

    let mut statements = 0;
    for table in TABLES {
        for stmt in dialect.create_table(table) {
            sqlx::query(&stmt).execute(pool).await.map_err(&map_err)?;
            statements += 1;
        }
    }

    info!(
        dialect = %dialect.kind(),
        tables = TABLES.len(),
        statements = statements,
        "Database schema initialized"
    );
    Ok(())
}

/// RFC 3339 text; years outside 0..=9999 carry an explicit sign
pub(crate) fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Inverse of [`encode_time`] over chrono's whole range, the same parser
/// serde uses for record JSON
pub(crate) fn decode_time(s: &str) -> Result<DateTime<Utc>, String> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| format!("invalid timestamp '{}': {}", s, e))
}
