//! Storage core for a local mirror of known-exploited-vulnerability catalogs.
//!
//! Every handle comes from [`storage::open_store`], which refuses stores
//! written by an incompatible layout before any read or write happens.

pub mod config;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod progress;
pub mod storage;

/// Revision of this build, stamped into every stored `FetchMeta`
pub const REVISION: &str = env!("KEVSTORE_REVISION");

pub const BUILD_DATE: &str = env!("KEVSTORE_BUILD_DATE");
