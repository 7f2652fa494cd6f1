use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{error, info};

use kevstore::config::{Command, Config, Family};
use kevstore::ingest::{self, IngestReport};
use kevstore::progress::BarProgress;
use kevstore::storage::{self, Backend, StoreError};
use kevstore::{BUILD_DATE, REVISION, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_args();

    // Handle version subcommand
    if let Command::Version = &config.command {
        println!(
            "kevstore {}, commit: {}, build_date: {}",
            env!("CARGO_PKG_VERSION"),
            REVISION,
            BUILD_DATE,
        );
        return Ok(());
    }

    logging::init(&config.log_format, &config.log_level)
        .context("Failed to initialize logging")?;

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = REVISION,
        dbtype = %config.dbtype,
        "kevstore starting"
    );

    let store = storage::open_store(&config.dbtype, &config.dbpath, &config.to_store_options())
        .await
        .map_err(explain)?;

    let result = run(&config, store.as_ref()).await;

    if let Err(e) = store.close().await {
        error!(error = %e, "Failed to close store");
    }
    result
}

async fn run(config: &Config, store: &dyn Backend) -> Result<()> {
    match &config.command {
        Command::Version => Ok(()),
        Command::Meta => {
            let meta = store.read_fetch_meta().await.map_err(explain)?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
            Ok(())
        }
        Command::Import { family, file } => {
            let report = import(config, store, *family, file).await?;
            info!(
                family = report.family,
                count = report.count,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Fetch completed"
            );
            Ok(())
        }
        Command::Lookup { ids } => {
            if let [id] = ids.as_slice() {
                let res = store.lookup_by_id(id).await.map_err(explain)?;
                println!("{}", serde_json::to_string_pretty(&res)?);
            } else {
                let res: BTreeMap<_, _> = store
                    .lookup_by_many_ids(ids)
                    .await
                    .map_err(explain)?
                    .into_iter()
                    .collect();
                println!("{}", serde_json::to_string_pretty(&res)?);
            }
            Ok(())
        }
    }
}

async fn import(
    config: &Config,
    store: &dyn Backend,
    family: Family,
    file: &Path,
) -> Result<IngestReport> {
    let progress = BarProgress::for_log_format("Inserting", &config.log_format);
    let report = match family {
        Family::Catalog => {
            let records = read_records(file)?;
            ingest::ingest_catalog(store, &records, &progress).await
        }
        Family::Extended => {
            let records = read_records(file)?;
            ingest::ingest_extended(store, &records, &progress).await
        }
    };
    report.map_err(explain)
}

fn read_records<T: DeserializeOwned>(file: &Path) -> Result<Vec<T>> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", file.display()))
}

/// Attach an operator hint to errors that need one
fn explain(e: StoreError) -> anyhow::Error {
    match e {
        StoreError::Locked(_) => anyhow::Error::new(e)
            .context("Failed to open DB. Close DB connection before fetching"),
        other => anyhow::Error::new(other),
    }
}
