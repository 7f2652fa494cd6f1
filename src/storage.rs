//! Storage layer for known exploited vulnerabilities
//!
//! # Module Structure
//! - `backend`: the `Backend` trait, backend kinds and tunables
//! - `error`: error taxonomy shared by every backend
//! - `factory`: `open_store`, the only way to obtain a handle
//! - `rdb`: SQLite, MySQL and PostgreSQL over `sqlx`
//! - `redis`: Redis with fingerprinted hash fields and a live-field manifest

mod backend;
mod error;
mod factory;
mod rdb;
mod redis;

// Re-export public types
pub use backend::{Backend, BackendKind, StoreOptions};
pub use error::{StoreError, StoreResult};
pub use factory::open_store;
