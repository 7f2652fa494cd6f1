#![allow(dead_code)]

use std::path::PathBuf;

use kevstore::models::{CatalogEntry, ExtendedEntry};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn catalog() -> Vec<CatalogEntry> {
    let raw = std::fs::read_to_string(fixture("catalog.json")).expect("Failed to read catalog fixture");
    serde_json::from_str(&raw).expect("Failed to parse catalog fixture")
}

pub fn extended() -> Vec<ExtendedEntry> {
    let raw =
        std::fs::read_to_string(fixture("extended.json")).expect("Failed to read extended fixture");
    serde_json::from_str(&raw).expect("Failed to parse extended fixture")
}

/// The Accellion FTA scenario: one catalog entry and one extended entry
/// covering four CVE IDs
pub const ACCELLION: &str = "CVE-2021-27104";
pub const ACCELLION_SIBLING_ONLY_EXTENDED: &str = "CVE-2021-27101";
