//! Fetch cycle: metadata bookkeeping around a full replace

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::models::{CatalogEntry, ExtendedEntry};
use crate::progress::Progress;
use crate::storage::{Backend, StoreError, StoreResult};

/// Outcome of one completed fetch cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub family: &'static str,
    pub count: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

enum Batch<'a> {
    Catalog(&'a [CatalogEntry]),
    Extended(&'a [ExtendedEntry]),
}

impl Batch<'_> {
    fn family(&self) -> &'static str {
        match self {
            Batch::Catalog(_) => "catalog",
            Batch::Extended(_) => "extended",
        }
    }

    fn len(&self) -> usize {
        match self {
            Batch::Catalog(r) => r.len(),
            Batch::Extended(r) => r.len(),
        }
    }
}

/// Replace the catalog family and record the fetch
pub async fn ingest_catalog(
    store: &dyn Backend,
    records: &[CatalogEntry],
    progress: &dyn Progress,
) -> StoreResult<IngestReport> {
    run(store, Batch::Catalog(records), progress).await
}

/// Replace the extended family and record the fetch
pub async fn ingest_extended(
    store: &dyn Backend,
    records: &[ExtendedEntry],
    progress: &dyn Progress,
) -> StoreResult<IngestReport> {
    run(store, Batch::Extended(records), progress).await
}

async fn run(
    store: &dyn Backend,
    batch: Batch<'_>,
    progress: &dyn Progress,
) -> StoreResult<IngestReport> {
    let started = Instant::now();

    let mut meta = store.read_fetch_meta().await?;
    if meta.is_outdated() {
        return Err(StoreError::IncompatibleSchema(format!(
            "stored schema version {} does not match {}",
            meta.schema_version,
            crate::models::LATEST_SCHEMA_VERSION
        )));
    }

    // A failed first fetch still leaves a versioned store behind
    store.write_fetch_meta(&meta).await?;

    info!(family = batch.family(), count = batch.len(), "Fetched records");
    match batch {
        Batch::Catalog(records) => store.replace_catalog_entries(records, progress).await?,
        Batch::Extended(records) => store.replace_extended_entries(records, progress).await?,
    }

    meta.last_fetched_at = Utc::now();
    store.write_fetch_meta(&meta).await?;

    Ok(IngestReport {
        family: batch.family(),
        count: batch.len(),
        elapsed: started.elapsed(),
    })
}
