//! Redis backend
//!
//! # Key layout
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬────────────────────────────────┐
//! │ KEY              │ FIELD                │ VALUE                          │
//! ├──────────────────┼──────────────────────┼────────────────────────────────┤
//! │ KEV#CVE#<id>     │ <Tag>:<sha256>       │ record JSON                    │
//! │ KEV#DEP          │ Catalog | Extended   │ manifest JSON {id: [field]}    │
//! │ KEV#FETCHMETA    │ Revision             │ build revision                 │
//! │ KEV#FETCHMETA    │ SchemaVersion        │ integer                        │
//! │ KEV#FETCHMETA    │ LastFetchedAt        │ RFC 3339                       │
//! └──────────────────┴──────────────────────┴────────────────────────────────┘
//! ```
//!
//! Untagged `<md5>` fields from before family tagging are still read as
//! catalog records.

mod codec;
mod manifest;

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{AsyncCommands, AsyncConnectionConfig, RedisError};
use serde::Serialize;
use tracing::{debug, info, warn};

use self::codec::{
    FETCH_META_KEY, FIELD_LAST_FETCHED_AT, FIELD_REVISION, FIELD_SCHEMA_VERSION, Family,
    KEY_PATTERN, MANIFEST_KEY, cve_key, decode_field, field_name,
};
use self::manifest::{Manifest, ManifestOverlay};
use super::backend::{Backend, BackendKind, StoreOptions, stamped};
use super::error::{StoreError, StoreResult, check_batch_size};
use super::rdb::schema::{decode_time, encode_time};
use crate::models::{CatalogEntry, ExtendedEntry, FetchMeta, Response, never_fetched};
use crate::progress::Progress;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_COUNT: usize = 100;

/// Store backed by a Redis (or Valkey) server
pub(crate) struct RedisDriver<C = MultiplexedConnection> {
    conn: C,
    options: StoreOptions,
}

/// Hash reply with raw bytes, so one bad field cannot fail a whole reply
type RawHash = HashMap<Vec<u8>, Vec<u8>>;

fn redis_err(context: &'static str) -> impl Fn(RedisError) -> StoreError {
    move |e| StoreError::query(context, e)
}

impl RedisDriver {
    pub(crate) async fn open(target: &str, options: &StoreOptions) -> StoreResult<Self> {
        let kind = BackendKind::Redis.as_str();
        if target.is_empty() {
            return Err(StoreError::Configuration(
                "redis connection string is empty".to_string(),
            ));
        }

        let client =
            redis::Client::open(target).map_err(|e| StoreError::connection(kind, target, e))?;

        let mut config = AsyncConnectionConfig::new().set_connection_timeout(CONNECT_TIMEOUT);
        if let Some(response_timeout) = options.redis_timeout.filter(|t| !t.is_zero()) {
            config = config.set_response_timeout(response_timeout);
        }
        let mut conn = client
            .get_multiplexed_async_connection_with_config(&config)
            .await
            .map_err(|e| StoreError::connection(kind, target, e))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::connection(kind, target, e))?;
        debug!(reply = %pong, "Redis answered PING");
        info!(dbtype = kind, "Database connection opened");

        Ok(Self::with_connection(conn, options.clone()))
    }
}

impl<C> RedisDriver<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    pub(crate) fn with_connection(conn: C, options: StoreOptions) -> Self {
        Self { conn, options }
    }

    /// Previous manifest for `family`, migrating the legacy string layout
    async fn load_manifest(&self, family: Family) -> StoreResult<Manifest> {
        let mut conn = self.conn.clone();
        let key_type: String = redis::cmd("TYPE")
            .arg(MANIFEST_KEY)
            .query_async(&mut conn)
            .await
            .map_err(redis_err("Failed to get manifest key type"))?;

        match key_type.as_str() {
            "none" => Ok(Manifest::default()),
            "hash" => {
                let raw: Option<String> = conn
                    .hget(MANIFEST_KEY, family.tag())
                    .await
                    .map_err(redis_err("Failed to get manifest"))?;
                raw.map_or_else(|| Ok(Manifest::default()), |raw| Manifest::parse(&raw))
            }
            "string" => {
                // Legacy: the whole key held the catalog manifest
                let raw: String = conn
                    .get(MANIFEST_KEY)
                    .await
                    .map_err(redis_err("Failed to get legacy manifest"))?;
                let legacy = Manifest::parse(&raw)?;
                let _: () = conn
                    .del(MANIFEST_KEY)
                    .await
                    .map_err(redis_err("Failed to delete legacy manifest"))?;
                info!(fields = legacy.len(), "Migrated legacy manifest layout");

                match family {
                    Family::Catalog => Ok(legacy),
                    Family::Extended => {
                        let _: () = conn
                            .hset(MANIFEST_KEY, Family::Catalog.tag(), legacy.to_json()?)
                            .await
                            .map_err(redis_err("Failed to store migrated manifest"))?;
                        Ok(Manifest::default())
                    }
                }
            }
            other => Err(StoreError::serialization(format!(
                "unexpected {} key type '{}' (expected string, hash or none)",
                MANIFEST_KEY, other
            ))),
        }
    }

    /// Write-new, then delete-stale replace of one family
    async fn replace_family<T: Serialize>(
        &self,
        family: Family,
        records: &[T],
        ids_of: impl Fn(&T) -> Vec<&str>,
        progress: &dyn Progress,
    ) -> StoreResult<()> {
        check_batch_size(self.options.batch_size)?;

        let previous = self.load_manifest(family).await?;
        let mut overlay = ManifestOverlay::new(previous);

        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let payload = serde_json::to_string(record)?;
            let field = field_name(family, &payload);
            let ids: BTreeSet<&str> = ids_of(record).into_iter().collect();
            for id in &ids {
                overlay.record(id, &field);
            }
            prepared.push((ids, field, payload));
        }

        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(MANIFEST_KEY, family.tag(), overlay.pending().to_json()?)
            .await
            .map_err(redis_err("Failed to store pending manifest"))?;

        info!(family = family.tag(), "Inserting records...");
        let started = Instant::now();
        progress.start(records.len() as u64);

        for chunk in prepared.chunks(self.options.batch_size) {
            let mut pipe = redis::pipe();
            for (ids, field, payload) in chunk {
                for id in ids {
                    pipe.hset(cve_key(id), field, payload).ignore();
                }
            }
            let _: () = pipe
                .query_async(&mut conn)
                .await
                .map_err(redis_err("Failed to write records"))?;
            debug!(family = family.tag(), records = chunk.len(), "Batch written");
            progress.advance(chunk.len() as u64);
        }
        progress.finish();

        let (stale, next) = overlay.finish();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (id, fields) in stale.iter() {
            pipe.hdel(cve_key(id), fields.iter().collect::<Vec<_>>())
                .ignore();
        }
        pipe.hset(MANIFEST_KEY, family.tag(), next.to_json()?)
            .ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(redis_err("Failed to delete stale records"))?;

        info!(
            family = family.tag(),
            count = records.len(),
            stale = stale.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Records replaced"
        );
        Ok(())
    }
}

fn decode_hash(key: &str, fields: RawHash) -> Response {
    let mut fields: Vec<_> = fields.into_iter().collect();
    fields.sort();

    let mut res = Response::default();
    for (field, value) in &fields {
        decode_field(key, field, value, &mut res);
    }
    res
}

#[async_trait]
impl<C> Backend for RedisDriver<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        debug!("Redis needs no schema");
        Ok(())
    }

    async fn detect_legacy_layout(&self) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let has_meta: bool = conn
            .exists(FETCH_META_KEY)
            .await
            .map_err(redis_err("Failed to check fetch metadata"))?;
        if has_meta {
            return Ok(false);
        }

        // COUNT is only a hint; a page may be empty before the scan ends
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(KEY_PATTERN)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(redis_err("Failed to scan keys"))?;
            if !keys.is_empty() {
                debug!(sample = %keys[0], "Found keys without fetch metadata");
                return Ok(true);
            }
            if next == 0 {
                return Ok(false);
            }
            cursor = next;
        }
    }

    /// Nothing to release here: the multiplexed connection is shared by
    /// every clone and closes when the driver is dropped.
    async fn close(&self) -> StoreResult<()> {
        debug!("Redis connection left to close on drop");
        Ok(())
    }

    async fn read_fetch_meta(&self) -> StoreResult<FetchMeta> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(FETCH_META_KEY)
            .await
            .map_err(redis_err("Failed to get FetchMeta"))?;
        if fields.is_empty() {
            return Ok(FetchMeta::default());
        }

        let field = |name: &str| {
            fields.get(name).ok_or_else(|| {
                StoreError::serialization(format!("{} lacks field {}", FETCH_META_KEY, name))
            })
        };
        let revision = field(FIELD_REVISION)?.clone();
        let schema_version = field(FIELD_SCHEMA_VERSION)?
            .parse::<u32>()
            .map_err(StoreError::serialization)?;
        let last_fetched_at = match fields.get(FIELD_LAST_FETCHED_AT) {
            Some(raw) => decode_time(raw).map_err(StoreError::serialization)?,
            None => {
                warn!("FetchMeta has no LastFetchedAt; assuming never fetched");
                never_fetched()
            }
        };

        Ok(FetchMeta {
            revision,
            schema_version,
            last_fetched_at,
        })
    }

    async fn write_fetch_meta(&self, meta: &FetchMeta) -> StoreResult<()> {
        let meta = stamped(meta);
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                FETCH_META_KEY,
                &[
                    (FIELD_REVISION, meta.revision.clone()),
                    (FIELD_SCHEMA_VERSION, meta.schema_version.to_string()),
                    (FIELD_LAST_FETCHED_AT, encode_time(&meta.last_fetched_at)),
                ],
            )
            .await
            .map_err(redis_err("Failed to upsert FetchMeta"))?;
        debug!(revision = %meta.revision, "FetchMeta upserted");
        Ok(())
    }

    async fn replace_catalog_entries(
        &self,
        records: &[CatalogEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()> {
        for record in records {
            record.validate().map_err(StoreError::InvalidRecord)?;
        }
        self.replace_family(
            Family::Catalog,
            records,
            |r| vec![r.cve_id.as_str()],
            progress,
        )
        .await
    }

    async fn replace_extended_entries(
        &self,
        records: &[ExtendedEntry],
        progress: &dyn Progress,
    ) -> StoreResult<()> {
        for record in records {
            record.validate().map_err(StoreError::InvalidRecord)?;
        }
        self.replace_family(
            Family::Extended,
            records,
            |r| r.cve_ids.iter().map(String::as_str).collect(),
            progress,
        )
        .await
    }

    async fn lookup_by_id(&self, cve_id: &str) -> StoreResult<Response> {
        let key = cve_key(cve_id);
        let mut conn = self.conn.clone();
        let fields: RawHash = conn
            .hgetall(&key)
            .await
            .map_err(redis_err("Failed to get records by CVE-ID"))?;
        Ok(decode_hash(&key, fields))
    }

    async fn lookup_by_many_ids(
        &self,
        cve_ids: &[String],
    ) -> StoreResult<HashMap<String, Response>> {
        if cve_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<String> = cve_ids.iter().map(|id| cve_key(id)).collect();
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let mut conn = self.conn.clone();
        let results: Vec<RawHash> = pipe
            .query_async(&mut conn)
            .await
            .map_err(redis_err("Failed to get records by CVE-IDs"))?;

        Ok(cve_ids
            .iter()
            .zip(keys.iter().zip(results))
            .map(|(id, (key, fields))| (id.clone(), decode_hash(key, fields)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use redis::Value;
    use redis_test::{MockCmd, MockRedisConnection};

    use crate::progress::NoProgress;

    fn catalog(cve_id: &str) -> CatalogEntry {
        let day = Utc.with_ymd_and_hms(2021, 11, 3, 0, 0, 0).unwrap();
        CatalogEntry {
            cve_id: cve_id.to_string(),
            vendor_project: "Accellion".to_string(),
            product: "FTA".to_string(),
            vulnerability_name: "Accellion FTA SQL Injection Vulnerability".to_string(),
            date_added: day,
            short_description: "SQL injection via a crafted Host header".to_string(),
            required_action: "Apply updates per vendor instructions.".to_string(),
            due_date: day,
            known_ransomware_campaign_use: "Known".to_string(),
            notes: String::new(),
        }
    }

    fn driver(commands: Vec<MockCmd>) -> (RedisDriver<MockRedisConnection>, MockRedisConnection) {
        let conn = MockRedisConnection::new(commands);
        let options = StoreOptions {
            batch_size: 10,
            ..StoreOptions::default()
        };
        (RedisDriver::with_connection(conn.clone(), options), conn)
    }

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    /// Fails if the driver skipped any queued command
    async fn assert_drained(mut conn: MockRedisConnection) {
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.unwrap();
        assert_eq!(pong, "PONG");
    }

    #[tokio::test]
    async fn test_replace_stores_superset_manifest_before_records() {
        let record = catalog("CVE-2021-27104");
        let payload = serde_json::to_string(&record).unwrap();
        let field = field_name(Family::Catalog, &payload);

        let mut previous = Manifest::default();
        previous.insert("CVE-2021-27101", "Catalog:old");
        let mut pending = previous.clone();
        pending.insert("CVE-2021-27104", &field);
        let mut next = Manifest::default();
        next.insert("CVE-2021-27104", &field);

        let mut writes = redis::pipe();
        writes
            .hset(cve_key("CVE-2021-27104"), &field, &payload)
            .ignore();
        let mut cleanup = redis::pipe();
        cleanup.atomic();
        cleanup
            .hdel(cve_key("CVE-2021-27101"), vec!["Catalog:old"])
            .ignore();
        cleanup
            .hset(MANIFEST_KEY, "Catalog", next.to_json().unwrap())
            .ignore();

        let (store, conn) = driver(vec![
            MockCmd::new(
                redis::cmd("TYPE").arg(MANIFEST_KEY),
                Ok(Value::SimpleString("hash".to_string())),
            ),
            MockCmd::new(
                redis::cmd("HGET").arg(MANIFEST_KEY).arg("Catalog"),
                Ok(bulk(&previous.to_json().unwrap())),
            ),
            // Old and new fields are both listed before any record is written
            MockCmd::new(
                redis::cmd("HSET")
                    .arg(MANIFEST_KEY)
                    .arg("Catalog")
                    .arg(pending.to_json().unwrap()),
                Ok(Value::Int(0)),
            ),
            MockCmd::with_values(writes, Ok(vec![Value::Int(1)])),
            MockCmd::with_values(
                cleanup,
                Ok(vec![Value::Array(vec![Value::Int(1), Value::Int(0)])]),
            ),
            MockCmd::new(redis::cmd("PING"), Ok(Value::SimpleString("PONG".to_string()))),
        ]);

        store
            .replace_catalog_entries(&[record], &NoProgress)
            .await
            .unwrap();
        assert_drained(conn).await;
    }

    #[tokio::test]
    async fn test_failed_record_write_leaves_pending_manifest() {
        let record = catalog("CVE-2021-27104");
        let payload = serde_json::to_string(&record).unwrap();
        let field = field_name(Family::Catalog, &payload);
        let mut pending = Manifest::default();
        pending.insert("CVE-2021-27104", &field);

        let mut writes = redis::pipe();
        writes
            .hset(cve_key("CVE-2021-27104"), &field, &payload)
            .ignore();

        let (store, conn) = driver(vec![
            MockCmd::new(
                redis::cmd("TYPE").arg(MANIFEST_KEY),
                Ok(Value::SimpleString("none".to_string())),
            ),
            MockCmd::new(
                redis::cmd("HSET")
                    .arg(MANIFEST_KEY)
                    .arg("Catalog")
                    .arg(pending.to_json().unwrap()),
                Ok(Value::Int(1)),
            ),
            MockCmd::with_values(
                writes,
                Err::<Vec<Value>, _>(RedisError::from((redis::ErrorKind::IoError, "gone"))),
            ),
            MockCmd::new(redis::cmd("PING"), Ok(Value::SimpleString("PONG".to_string()))),
        ]);

        let err = store
            .replace_catalog_entries(&[record], &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));
        // No stale deletion ran after the failure
        assert_drained(conn).await;
    }

    #[tokio::test]
    async fn test_batch_lookup_keeps_siblings_of_non_utf8_field() {
        let record = catalog("CVE-2021-27104");
        let payload = serde_json::to_string(&record).unwrap();
        let field = field_name(Family::Catalog, &payload);

        let mut lookups = redis::pipe();
        lookups.hgetall(cve_key("CVE-2021-27104"));
        lookups.hgetall(cve_key("CVE-2021-27101"));

        let (store, _) = driver(vec![MockCmd::with_values(
            lookups,
            Ok(vec![
                Value::Array(vec![bulk(&field), bulk(&payload)]),
                Value::Array(vec![
                    bulk("Catalog:bb"),
                    Value::BulkString(vec![0xff, 0xfe]),
                ]),
            ]),
        )]);

        let ids = vec!["CVE-2021-27104".to_string(), "CVE-2021-27101".to_string()];
        let many = store.lookup_by_many_ids(&ids).await.unwrap();

        assert_eq!(many["CVE-2021-27104"].catalog, vec![record]);
        assert!(many["CVE-2021-27104"].undecodable.is_empty());
        let bad = &many["CVE-2021-27101"];
        assert!(bad.catalog.is_empty());
        assert_eq!(bad.undecodable.len(), 1);
        assert_eq!(bad.undecodable[0].location, "KEV#CVE#CVE-2021-27101");
        assert_eq!(bad.undecodable[0].field, "Catalog:bb");
    }

    #[tokio::test]
    async fn test_legacy_untagged_field_is_read_as_catalog() {
        let record = catalog("CVE-2021-27104");
        let payload = serde_json::to_string(&record).unwrap();
        let legacy = codec::legacy_fingerprint(&payload);

        let (store, _) = driver(vec![MockCmd::new(
            redis::cmd("HGETALL").arg(cve_key("CVE-2021-27104")),
            Ok(Value::Array(vec![bulk(&legacy), bulk(&payload)])),
        )]);

        let res = store.lookup_by_id("CVE-2021-27104").await.unwrap();
        assert_eq!(res.catalog, vec![record]);
        assert!(res.undecodable.is_empty());
    }
}
