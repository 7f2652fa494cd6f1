//! Relational reads and full-replace writes

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Row};
use tracing::{debug, info, warn};

use super::RdbDriver;
use super::schema::{
    CATALOG_ENTRIES, EXTENDED_ENTRIES, EXTENDED_ENTRY_CVES, EXTENDED_ENTRY_EXPLOIT_REFS,
    EXTENDED_ENTRY_REPORTED_EXPLOITATIONS, EXTENDED_TABLES, FETCH_META, TableDef, decode_time,
    encode_time,
};
use crate::models::{
    CatalogEntry, ExploitReference, ExtendedEntry, FetchMeta, ReportedExploitation,
    UndecodableRecord,
};
use crate::progress::Progress;
use crate::storage::backend::stamped;
use crate::storage::error::{StoreError, StoreResult, check_batch_size};

/// A single bound value in a generated INSERT
#[derive(Debug, Clone)]
enum SqlValue {
    Int(i64),
    Text(String),
    OptText(Option<String>),
}

type Values = Vec<SqlValue>;

fn bind_values<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    values: Vec<SqlValue>,
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::OptText(v) => query.bind(v),
        };
    }
    query
}

fn catalog_row(id: i64, e: &CatalogEntry) -> Values {
    vec![
        SqlValue::Int(id),
        SqlValue::Text(e.cve_id.clone()),
        SqlValue::Text(e.vendor_project.clone()),
        SqlValue::Text(e.product.clone()),
        SqlValue::Text(e.vulnerability_name.clone()),
        SqlValue::Text(encode_time(&e.date_added)),
        SqlValue::Text(e.short_description.clone()),
        SqlValue::Text(e.required_action.clone()),
        SqlValue::Text(encode_time(&e.due_date)),
        SqlValue::Text(e.known_ransomware_campaign_use.clone()),
        SqlValue::Text(e.notes.clone()),
    ]
}

fn extended_row(id: i64, e: &ExtendedEntry) -> Values {
    vec![
        SqlValue::Int(id),
        SqlValue::Text(e.vendor_project.clone()),
        SqlValue::Text(e.product.clone()),
        SqlValue::Text(e.short_description.clone()),
        SqlValue::Text(e.vulnerability_name.clone()),
        SqlValue::Text(e.required_action.clone()),
        SqlValue::Text(e.known_ransomware_campaign_use.clone()),
        SqlValue::OptText(e.due_date.as_ref().map(encode_time)),
        SqlValue::OptText(e.catalog_date_added.as_ref().map(encode_time)),
        SqlValue::Text(encode_time(&e.date_added)),
    ]
}

/// Child rows of one chunk of extended entries
#[derive(Default)]
struct ExtendedChildren {
    cves: Vec<Values>,
    exploit_refs: Vec<Values>,
    reported: Vec<Values>,
}

/// Writer-side id counters, one per child table
#[derive(Default)]
struct ChildIds {
    cve: i64,
    exploit_ref: i64,
    reported: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

fn decode_catalog(row: &AnyRow) -> Result<CatalogEntry, String> {
    let text = |name: &str| row.try_get::<String, _>(name).map_err(|e| e.to_string());
    Ok(CatalogEntry {
        cve_id: text("cve_id")?,
        vendor_project: text("vendor_project")?,
        product: text("product")?,
        vulnerability_name: text("vulnerability_name")?,
        date_added: decode_time(&text("date_added")?)?,
        short_description: text("short_description")?,
        required_action: text("required_action")?,
        due_date: decode_time(&text("due_date")?)?,
        known_ransomware_campaign_use: text("known_ransomware_campaign_use")?,
        notes: text("notes")?,
    })
}

fn decode_optional_time(row: &AnyRow, name: &str) -> Result<Option<DateTime<Utc>>, String> {
    let value = row
        .try_get::<Option<String>, _>(name)
        .map_err(|e| e.to_string())?;
    value.as_deref().map(decode_time).transpose()
}

fn decode_extended(row: &AnyRow) -> Result<ExtendedEntry, String> {
    let text = |name: &str| row.try_get::<String, _>(name).map_err(|e| e.to_string());
    Ok(ExtendedEntry {
        vendor_project: text("vendor_project")?,
        product: text("product")?,
        short_description: text("short_description")?,
        vulnerability_name: text("vulnerability_name")?,
        required_action: text("required_action")?,
        known_ransomware_campaign_use: text("known_ransomware_campaign_use")?,
        cve_ids: Vec::new(),
        exploit_refs: Vec::new(),
        reported_exploitations: Vec::new(),
        due_date: decode_optional_time(row, "due_date")?,
        catalog_date_added: decode_optional_time(row, "catalog_date_added")?,
        date_added: decode_time(&text("date_added")?)?,
    })
}

fn decode_exploit_ref(row: &AnyRow) -> Result<ExploitReference, String> {
    let text = |name: &str| row.try_get::<String, _>(name).map_err(|e| e.to_string());
    Ok(ExploitReference {
        xdb_id: text("xdb_id")?,
        xdb_url: text("xdb_url")?,
        date_added: decode_time(&text("date_added")?)?,
        exploit_type: text("exploit_type")?,
        clone_ssh_url: text("clone_ssh_url")?,
    })
}

fn decode_reported(row: &AnyRow) -> Result<ReportedExploitation, String> {
    let text = |name: &str| row.try_get::<String, _>(name).map_err(|e| e.to_string());
    Ok(ReportedExploitation {
        url: text("url")?,
        date_added: decode_time(&text("date_added")?)?,
    })
}

fn row_id(row: &AnyRow, column: &str) -> Option<i64> {
    row.try_get::<i64, _>(column).ok()
}

fn undecodable(table: &TableDef, id: Option<i64>, reason: String) -> UndecodableRecord {
    warn!(table = table.name, id = ?id, reason = %reason, "Skipping undecodable row");
    UndecodableRecord {
        location: table.name.to_string(),
        field: id.map(|i| i.to_string()).unwrap_or_else(|| "?".to_string()),
        reason,
    }
}

fn rows_per_statement(batch_size: usize, max_bind_params: usize, columns: usize) -> usize {
    batch_size.min(max_bind_params / columns.max(1)).max(1)
}

impl RdbDriver {
    /// INSERT `rows` into `table` in chunks of the configured batch size,
    /// capped so no statement exceeds the engine's bind limit
    async fn insert_rows(
        &self,
        conn: &mut AnyConnection,
        table: &TableDef,
        rows: Vec<Values>,
    ) -> StoreResult<()> {
        let per_statement = rows_per_statement(
            self.options.batch_size,
            self.dialect.max_bind_params(),
            table.columns.len(),
        );
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let chunk: Vec<Values> = rows.by_ref().take(per_statement).collect();
            let sql = self.dialect.sql(&table.insert_sql(chunk.len()));
            self.trace_sql(&sql);
            let query = bind_values(sqlx::query(&sql), chunk.into_iter().flatten().collect());
            query
                .execute(&mut *conn)
                .await
                .map_err(self.query_err("Failed to insert"))?;
        }
        Ok(())
    }

    async fn delete_all(&self, conn: &mut AnyConnection, table: &TableDef) -> StoreResult<()> {
        let sql = format!("DELETE FROM {}", table.name);
        self.trace_sql(&sql);
        sqlx::query(&sql)
            .execute(&mut *conn)
            .await
            .map_err(self.query_err("Failed to delete old records"))?;
        Ok(())
    }

    pub(super) async fn select_fetch_meta(&self) -> StoreResult<FetchMeta> {
        let sql = format!(
            "SELECT revision, schema_version, last_fetched_at FROM {} ORDER BY id LIMIT 1",
            FETCH_META.name
        );
        self.trace_sql(&sql);
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(self.query_err("Failed to get FetchMeta"))?;

        let Some(row) = row else {
            return Ok(FetchMeta::default());
        };

        let revision: String = row.try_get("revision").map_err(StoreError::serialization)?;
        let version: i64 = row
            .try_get("schema_version")
            .map_err(StoreError::serialization)?;
        let fetched: String = row
            .try_get("last_fetched_at")
            .map_err(StoreError::serialization)?;

        Ok(FetchMeta {
            revision,
            schema_version: u32::try_from(version).map_err(StoreError::serialization)?,
            last_fetched_at: decode_time(&fetched).map_err(StoreError::serialization)?,
        })
    }

    pub(super) async fn upsert_fetch_meta(&self, meta: &FetchMeta) -> StoreResult<()> {
        let meta = stamped(meta);
        let row = vec![
            SqlValue::Int(1),
            SqlValue::Text(meta.revision.clone()),
            SqlValue::Int(i64::from(meta.schema_version)),
            SqlValue::Text(encode_time(&meta.last_fetched_at)),
        ];

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(self.query_err("Failed to begin transaction"))?;
        let result = async {
            self.delete_all(&mut tx, &FETCH_META).await?;
            self.insert_rows(&mut tx, &FETCH_META, vec![row]).await
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(self.query_err("Failed to commit FetchMeta"))?;
                debug!(revision = %meta.revision, "FetchMeta upserted");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub(super) async fn delete_and_insert_catalog(
        &self,
        records: &[CatalogEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()> {
        check_batch_size(self.options.batch_size)?;
        for record in records {
            record.validate().map_err(StoreError::InvalidRecord)?;
        }

        info!("Inserting catalog entries...");
        let started = Instant::now();
        progress.start(records.len() as u64);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(self.query_err("Failed to begin transaction"))?;

        let result = async {
            self.delete_all(&mut tx, &CATALOG_ENTRIES).await?;

            let batch_size = self.options.batch_size;
            for (n, chunk) in records.chunks(batch_size).enumerate() {
                let base = (n * batch_size) as i64;
                let rows = chunk
                    .iter()
                    .enumerate()
                    .map(|(i, e)| catalog_row(base + i as i64 + 1, e))
                    .collect();
                self.insert_rows(&mut tx, &CATALOG_ENTRIES, rows).await?;
                progress.advance(chunk.len() as u64);
            }
            Ok::<(), StoreError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(self.query_err("Failed to commit"))?;
                progress.finish();
                info!(
                    count = records.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Catalog entries replaced"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Rolling back catalog replace");
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub(super) async fn delete_and_insert_extended(
        &self,
        records: &[ExtendedEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()> {
        check_batch_size(self.options.batch_size)?;
        for record in records {
            record.validate().map_err(StoreError::InvalidRecord)?;
        }

        info!("Inserting extended entries...");
        let started = Instant::now();
        progress.start(records.len() as u64);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(self.query_err("Failed to begin transaction"))?;

        let result = async {
            for table in EXTENDED_TABLES {
                self.delete_all(&mut tx, table).await?;
            }

            let batch_size = self.options.batch_size;
            let mut ids = ChildIds::default();
            for (n, chunk) in records.chunks(batch_size).enumerate() {
                let base = (n * batch_size) as i64;
                let mut parents = Vec::with_capacity(chunk.len());
                let mut children = ExtendedChildren::default();

                for (i, e) in chunk.iter().enumerate() {
                    let parent = base + i as i64 + 1;
                    parents.push(extended_row(parent, e));
                    for cve_id in &e.cve_ids {
                        children.cves.push(vec![
                            SqlValue::Int(next(&mut ids.cve)),
                            SqlValue::Int(parent),
                            SqlValue::Text(cve_id.clone()),
                        ]);
                    }
                    for x in &e.exploit_refs {
                        children.exploit_refs.push(vec![
                            SqlValue::Int(next(&mut ids.exploit_ref)),
                            SqlValue::Int(parent),
                            SqlValue::Text(x.xdb_id.clone()),
                            SqlValue::Text(x.xdb_url.clone()),
                            SqlValue::Text(encode_time(&x.date_added)),
                            SqlValue::Text(x.exploit_type.clone()),
                            SqlValue::Text(x.clone_ssh_url.clone()),
                        ]);
                    }
                    for r in &e.reported_exploitations {
                        children.reported.push(vec![
                            SqlValue::Int(next(&mut ids.reported)),
                            SqlValue::Int(parent),
                            SqlValue::Text(r.url.clone()),
                            SqlValue::Text(encode_time(&r.date_added)),
                        ]);
                    }
                }

                self.insert_rows(&mut tx, &EXTENDED_ENTRIES, parents).await?;
                self.insert_rows(&mut tx, &EXTENDED_ENTRY_CVES, children.cves)
                    .await?;
                self.insert_rows(&mut tx, &EXTENDED_ENTRY_EXPLOIT_REFS, children.exploit_refs)
                    .await?;
                self.insert_rows(
                    &mut tx,
                    &EXTENDED_ENTRY_REPORTED_EXPLOITATIONS,
                    children.reported,
                )
                .await?;
                progress.advance(chunk.len() as u64);
            }
            Ok::<(), StoreError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(self.query_err("Failed to commit"))?;
                progress.finish();
                info!(
                    count = records.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Extended entries replaced"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Rolling back extended replace");
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    pub(super) async fn select_catalog(
        &self,
        cve_id: &str,
    ) -> StoreResult<Vec<Result<CatalogEntry, UndecodableRecord>>> {
        let sql = self.dialect.sql(&format!(
            "SELECT {} FROM {} WHERE cve_id = ? ORDER BY id",
            CATALOG_ENTRIES.column_list(None),
            CATALOG_ENTRIES.name
        ));
        self.trace_sql(&sql);
        let rows = sqlx::query(&sql)
            .bind(cve_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(self.query_err("Failed to get catalog entries by CVE-ID"))?;

        Ok(rows
            .iter()
            .map(|row| {
                decode_catalog(row)
                    .map_err(|reason| undecodable(&CATALOG_ENTRIES, row_id(row, "id"), reason))
            })
            .collect())
    }

    pub(super) async fn select_extended(
        &self,
        cve_id: &str,
    ) -> StoreResult<Vec<Result<ExtendedEntry, UndecodableRecord>>> {
        let sql = self.dialect.sql(&format!(
            "SELECT {} FROM {} e JOIN {} c ON c.extended_entry_id = e.id WHERE c.cve_id = ? ORDER BY e.id",
            EXTENDED_ENTRIES.column_list(Some("e")),
            EXTENDED_ENTRIES.name,
            EXTENDED_ENTRY_CVES.name
        ));
        self.trace_sql(&sql);
        let rows = sqlx::query(&sql)
            .bind(cve_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(self.query_err("Failed to get extended entries by CVE-ID"))?;

        // An entry listing the same ID twice joins twice
        let mut seen = HashSet::new();
        let mut parents: BTreeMap<i64, Result<ExtendedEntry, UndecodableRecord>> = BTreeMap::new();
        let mut failed = Vec::new();
        for row in &rows {
            let Some(id) = row_id(row, "id") else {
                failed.push(undecodable(
                    &EXTENDED_ENTRIES,
                    None,
                    "missing id column".to_string(),
                ));
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            parents.insert(
                id,
                decode_extended(row).map_err(|reason| undecodable(&EXTENDED_ENTRIES, Some(id), reason)),
            );
        }

        let ids: Vec<i64> = parents
            .iter()
            .filter(|(_, p)| p.is_ok())
            .map(|(id, _)| *id)
            .collect();
        if !ids.is_empty() {
            self.hydrate_children(&ids, &mut parents).await?;
        }

        let mut out: Vec<_> = parents.into_values().collect();
        out.extend(failed.into_iter().map(Err));
        Ok(out)
    }

    async fn select_children(&self, table: &TableDef, ids: &[i64]) -> StoreResult<Vec<AnyRow>> {
        let sql = self.dialect.sql(&format!(
            "SELECT {} FROM {} WHERE extended_entry_id IN ({}) ORDER BY id",
            table.column_list(None),
            table.name,
            vec!["?"; ids.len()].join(", ")
        ));
        self.trace_sql(&sql);
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        query
            .fetch_all(&self.pool)
            .await
            .map_err(self.query_err("Failed to get nested records"))
    }

    /// Attach CVE IDs, exploit references and citations to their parents.
    /// A child that fails to decode marks its parent undecodable.
    async fn hydrate_children(
        &self,
        ids: &[i64],
        parents: &mut BTreeMap<i64, Result<ExtendedEntry, UndecodableRecord>>,
    ) -> StoreResult<()> {
        fn attach<T>(
            parents: &mut BTreeMap<i64, Result<ExtendedEntry, UndecodableRecord>>,
            table: &TableDef,
            row: &AnyRow,
            decoded: Result<T, String>,
            push: impl FnOnce(&mut ExtendedEntry, T),
        ) {
            let Some(parent) = row_id(row, "extended_entry_id") else {
                return;
            };
            let Some(slot) = parents.get_mut(&parent) else {
                return;
            };
            match decoded {
                Ok(value) => {
                    if let Ok(entry) = slot {
                        push(entry, value);
                    }
                }
                Err(reason) => {
                    if slot.is_ok() {
                        *slot = Err(undecodable(table, row_id(row, "id"), reason));
                    }
                }
            }
        }

        for row in self.select_children(&EXTENDED_ENTRY_CVES, ids).await? {
            let decoded = row.try_get::<String, _>("cve_id").map_err(|e| e.to_string());
            attach(parents, &EXTENDED_ENTRY_CVES, &row, decoded, |e, v| {
                e.cve_ids.push(v)
            });
        }
        for row in self.select_children(&EXTENDED_ENTRY_EXPLOIT_REFS, ids).await? {
            let decoded = decode_exploit_ref(&row);
            attach(parents, &EXTENDED_ENTRY_EXPLOIT_REFS, &row, decoded, |e, v| {
                e.exploit_refs.push(v)
            });
        }
        for row in self
            .select_children(&EXTENDED_ENTRY_REPORTED_EXPLOITATIONS, ids)
            .await?
        {
            let decoded = decode_reported(&row);
            attach(
                parents,
                &EXTENDED_ENTRY_REPORTED_EXPLOITATIONS,
                &row,
                decoded,
                |e, v| e.reported_exploitations.push(v),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Response;
    use crate::progress::NoProgress;
    use crate::storage::backend::{Backend, BackendKind, StoreOptions};
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn catalog(cve_id: &str) -> CatalogEntry {
        CatalogEntry {
            cve_id: cve_id.to_string(),
            vendor_project: "Accellion".to_string(),
            product: "FTA".to_string(),
            vulnerability_name: "Accellion FTA SQL Injection Vulnerability".to_string(),
            date_added: day(2021, 11, 3),
            short_description: "SQL injection via a crafted Host header".to_string(),
            required_action: "Apply updates per vendor instructions.".to_string(),
            due_date: day(2021, 11, 17),
            known_ransomware_campaign_use: "Known".to_string(),
            notes: String::new(),
        }
    }

    fn extended(cve_ids: &[&str]) -> ExtendedEntry {
        ExtendedEntry {
            vendor_project: "Accellion".to_string(),
            product: "FTA".to_string(),
            short_description: "SQL injection".to_string(),
            vulnerability_name: "Accellion FTA SQL Injection".to_string(),
            required_action: "Apply updates".to_string(),
            known_ransomware_campaign_use: "Known".to_string(),
            cve_ids: cve_ids.iter().map(|s| s.to_string()).collect(),
            exploit_refs: vec![ExploitReference {
                xdb_id: "4a1b".to_string(),
                xdb_url: "https://example.org/xdb/4a1b".to_string(),
                date_added: day(2021, 12, 1),
                exploit_type: "poc".to_string(),
                clone_ssh_url: "git@example.org:poc.git".to_string(),
            }],
            reported_exploitations: vec![ReportedExploitation {
                url: "https://example.org/report".to_string(),
                date_added: day(2021, 3, 1),
            }],
            due_date: None,
            catalog_date_added: Some(day(2021, 11, 3)),
            date_added: day(2021, 11, 4),
        }
    }

    async fn memory_store(batch_size: usize) -> RdbDriver {
        let options = StoreOptions {
            batch_size,
            ..StoreOptions::default()
        };
        let driver = RdbDriver::open(BackendKind::Sqlite3, ":memory:", &options)
            .await
            .unwrap();
        driver.ensure_schema().await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_fetch_meta_defaults_then_round_trips() {
        let store = memory_store(50).await;
        let meta = store.read_fetch_meta().await.unwrap();
        assert_eq!(meta.last_fetched_at, crate::models::never_fetched());

        let written = FetchMeta {
            revision: "ignored".to_string(),
            schema_version: 7,
            last_fetched_at: day(2024, 5, 1),
        };
        store.write_fetch_meta(&written).await.unwrap();
        store.write_fetch_meta(&written).await.unwrap();

        let read = store.read_fetch_meta().await.unwrap();
        assert_eq!(read.revision, crate::REVISION);
        assert_eq!(read.schema_version, crate::models::LATEST_SCHEMA_VERSION);
        assert_eq!(read.last_fetched_at, day(2024, 5, 1));
    }

    #[tokio::test]
    async fn test_catalog_replace_spans_batches_and_removes_stale() {
        let store = memory_store(2).await;
        let first: Vec<_> = (1..=5).map(|n| catalog(&format!("CVE-2021-{:04}", n))).collect();
        store
            .replace_catalog_entries(&first, &NoProgress)
            .await
            .unwrap();
        assert_eq!(store.lookup_by_id("CVE-2021-0005").await.unwrap().catalog.len(), 1);

        store
            .replace_catalog_entries(&first[..1], &NoProgress)
            .await
            .unwrap();
        assert!(store.lookup_by_id("CVE-2021-0005").await.unwrap().is_empty());
        assert_eq!(
            store.lookup_by_id("CVE-2021-0001").await.unwrap().catalog,
            vec![first[0].clone()]
        );
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let store = memory_store(50).await;
        let records = vec![catalog("CVE-2021-27104")];
        for _ in 0..2 {
            store
                .replace_catalog_entries(&records, &NoProgress)
                .await
                .unwrap();
        }
        let res = store.lookup_by_id("CVE-2021-27104").await.unwrap();
        assert_eq!(res.catalog.len(), 1);
    }

    #[tokio::test]
    async fn test_extended_entry_round_trips_with_children() {
        let store = memory_store(1).await;
        let multi = extended(&["CVE-2021-27101", "CVE-2021-27104", "CVE-2021-27104"]);
        let other = extended(&["CVE-2022-0001"]);
        store
            .replace_extended_entries(&[multi.clone(), other], &NoProgress)
            .await
            .unwrap();

        let res = store.lookup_by_id("CVE-2021-27104").await.unwrap();
        assert_eq!(res.extended, vec![multi.clone()]);
        assert!(res.catalog.is_empty());

        let res = store.lookup_by_id("CVE-2021-27101").await.unwrap();
        assert_eq!(res.extended, vec![multi]);
    }

    #[tokio::test]
    async fn test_invalid_record_writes_nothing() {
        let store = memory_store(50).await;
        store
            .replace_catalog_entries(&[catalog("CVE-2021-27104")], &NoProgress)
            .await
            .unwrap();

        let err = store
            .replace_catalog_entries(&[catalog("CVE-2021-0001"), catalog(" ")], &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
        assert_eq!(store.lookup_by_id("CVE-2021-27104").await.unwrap().catalog.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back_delete() {
        let store = memory_store(1).await;
        store
            .replace_catalog_entries(&[catalog("CVE-2021-27104")], &NoProgress)
            .await
            .unwrap();

        sqlx::query(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON catalog_entries \
             WHEN NEW.cve_id = 'CVE-0000-0000' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store
            .replace_catalog_entries(
                &[catalog("CVE-2021-0001"), catalog("CVE-0000-0000")],
                &NoProgress,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));

        assert_eq!(store.lookup_by_id("CVE-2021-27104").await.unwrap().catalog.len(), 1);
        assert!(store.lookup_by_id("CVE-2021-0001").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_child_insert_rolls_back_extended_replace() {
        let store = memory_store(1).await;
        let live = extended(&["CVE-2021-27104", "CVE-2021-27101"]);
        store
            .replace_extended_entries(&[live.clone()], &NoProgress)
            .await
            .unwrap();

        sqlx::query(
            "CREATE TRIGGER reject_report BEFORE INSERT ON extended_entry_reported_exploitations \
             WHEN NEW.url = 'https://example.org/rejected' BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        // First batch lands in full before the second one aborts
        let accepted = extended(&["CVE-2022-0001"]);
        let mut rejected = extended(&["CVE-2022-0002"]);
        rejected.reported_exploitations[0].url = "https://example.org/rejected".to_string();
        let err = store
            .replace_extended_entries(&[accepted, rejected], &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));

        for id in ["CVE-2021-27104", "CVE-2021-27101"] {
            let res = store.lookup_by_id(id).await.unwrap();
            assert_eq!(res.extended, vec![live.clone()]);
            assert!(res.undecodable.is_empty());
        }
        assert!(store.lookup_by_id("CVE-2022-0001").await.unwrap().is_empty());
        assert!(store.lookup_by_id("CVE-2022-0002").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_batches_stay_under_bind_limit() {
        // 11 columns x 3500 rows would need 38500 binds in one statement
        let store = memory_store(5000).await;
        let records: Vec<_> = (1..=3500)
            .map(|n| catalog(&format!("CVE-2021-{:05}", n)))
            .collect();
        store
            .replace_catalog_entries(&records, &NoProgress)
            .await
            .unwrap();

        let res = store.lookup_by_id("CVE-2021-03500").await.unwrap();
        assert_eq!(res.catalog, vec![records[3499].clone()]);
    }

    #[test]
    fn test_rows_per_statement() {
        assert_eq!(rows_per_statement(5000, 32_766, 11), 2978);
        assert_eq!(rows_per_statement(100, 32_766, 11), 100);
        assert_eq!(rows_per_statement(10, 5, 11), 1);
    }

    #[tokio::test]
    async fn test_five_digit_year_round_trips() {
        let store = memory_store(50).await;
        let mut record = catalog("CVE-2021-27104");
        record.date_added = day(10000, 1, 1);
        store
            .replace_catalog_entries(&[record.clone()], &NoProgress)
            .await
            .unwrap();

        let res = store.lookup_by_id("CVE-2021-27104").await.unwrap();
        assert_eq!(res.catalog, vec![record]);
        assert!(res.undecodable.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_row_is_reported_not_fatal() {
        let store = memory_store(50).await;
        store
            .replace_catalog_entries(&[catalog("CVE-2021-27104")], &NoProgress)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO catalog_entries (id, cve_id, vendor_project, product, vulnerability_name, \
             date_added, short_description, required_action, due_date, known_ransomware_campaign_use, notes) \
             VALUES (99, 'CVE-2021-27104', 'v', 'p', 'n', 'not-a-date', 's', 'r', 'also-bad', 'Unknown', '')",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let res = store.lookup_by_id("CVE-2021-27104").await.unwrap();
        assert_eq!(res.catalog.len(), 1);
        assert_eq!(res.undecodable.len(), 1);
        assert_eq!(res.undecodable[0].location, "catalog_entries");
        assert_eq!(res.undecodable[0].field, "99");
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let store = memory_store(0).await;
        let err = store
            .replace_catalog_entries(&[catalog("CVE-2021-27104")], &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_fresh_store_is_not_legacy() {
        let store = memory_store(50).await;
        assert!(!store.detect_legacy_layout().await.unwrap());
        let many = store
            .lookup_by_many_ids(&["CVE-1".to_string(), "CVE-2".to_string()])
            .await
            .unwrap();
        assert_eq!(many.len(), 2);
        assert!(many.values().all(Response::is_empty));
    }
}
