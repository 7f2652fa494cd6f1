//! Single entry point that hands out store handles

use tracing::{error, info, warn};

use super::backend::{Backend, BackendKind, StoreOptions};
use super::error::{StoreError, StoreResult};
use super::rdb::RdbDriver;
use super::redis::RedisDriver;

/// Open the store of type `dbtype` at `target` and run the version gate.
///
/// The gate refuses stores written before fetch metadata existed and stores
/// stamped with another schema version. Neither is migrated in place: the
/// operator has to delete the database and fetch again.
pub async fn open_store(
    dbtype: &str,
    target: &str,
    options: &StoreOptions,
) -> StoreResult<Box<dyn Backend>> {
    let kind: BackendKind = dbtype.parse()?;

    let store: Box<dyn Backend> = if kind.is_relational() {
        Box::new(RdbDriver::open(kind, target, options).await?)
    } else {
        Box::new(RedisDriver::open(target, options).await?)
    };

    if let Err(e) = gate(store.as_ref()).await {
        error!(dbtype = %kind, error = %e, "Refusing to use store");
        if let Err(close_err) = store.close().await {
            warn!(error = %close_err, "Failed to close rejected store");
        }
        return Err(e);
    }

    info!(dbtype = %kind, "Store ready");
    Ok(store)
}

async fn gate(store: &dyn Backend) -> StoreResult<()> {
    if store.detect_legacy_layout().await? {
        return Err(StoreError::IncompatibleSchema(
            "data predates fetch metadata tracking".to_string(),
        ));
    }

    store.ensure_schema().await?;

    let meta = store.read_fetch_meta().await?;
    if meta.is_outdated() {
        return Err(StoreError::IncompatibleSchema(format!(
            "stored schema version {} does not match {}",
            meta.schema_version,
            crate::models::LATEST_SCHEMA_VERSION
        )));
    }
    Ok(())
}
