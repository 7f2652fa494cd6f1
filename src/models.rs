//! Vulnerability record shapes and fetch metadata

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written by this build. Stores stamped with any other
/// version must be deleted and fetched again.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

/// Timestamp used for "never fetched" and for unknown dates.
pub fn never_fetched() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Entry from the primary known-exploited-vulnerabilities catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub cve_id: String,
    pub vendor_project: String,
    pub product: String,
    pub vulnerability_name: String,
    pub date_added: DateTime<Utc>,
    pub short_description: String,
    pub required_action: String,
    pub due_date: DateTime<Utc>,
    /// "Known" or "Unknown" in the upstream feed
    pub known_ransomware_campaign_use: String,
    #[serde(default)]
    pub notes: String,
}

/// Entry from the secondary feed. One entry may cover several CVE IDs and
/// owns its exploit references and exploitation citations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedEntry {
    pub vendor_project: String,
    pub product: String,
    pub short_description: String,
    pub vulnerability_name: String,
    pub required_action: String,
    pub known_ransomware_campaign_use: String,
    pub cve_ids: Vec<String>,
    #[serde(default)]
    pub exploit_refs: Vec<ExploitReference>,
    #[serde(default)]
    pub reported_exploitations: Vec<ReportedExploitation>,
    pub due_date: Option<DateTime<Utc>>,
    pub catalog_date_added: Option<DateTime<Utc>>,
    pub date_added: DateTime<Utc>,
}

/// Cross-reference into an exploit database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExploitReference {
    pub xdb_id: String,
    pub xdb_url: String,
    pub date_added: DateTime<Utc>,
    pub exploit_type: String,
    pub clone_ssh_url: String,
}

/// Public report of in-the-wild exploitation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedExploitation {
    pub url: String,
    pub date_added: DateTime<Utc>,
}

impl CatalogEntry {
    /// Check the invariants required before the entry may be written
    pub fn validate(&self) -> Result<(), String> {
        if self.cve_id.trim().is_empty() {
            return Err(format!(
                "catalog entry '{}' has an empty CVE ID",
                self.vulnerability_name
            ));
        }
        Ok(())
    }
}

impl ExtendedEntry {
    /// Check the invariants required before the entry may be written
    pub fn validate(&self) -> Result<(), String> {
        if self.cve_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(format!(
                "extended entry '{}' lists an empty CVE ID",
                self.vulnerability_name
            ));
        }
        Ok(())
    }
}

/// Metadata about the last fetch. Exactly one exists per store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMeta {
    pub revision: String,
    pub schema_version: u32,
    pub last_fetched_at: DateTime<Utc>,
}

impl FetchMeta {
    /// Whether the store was written by an incompatible schema version
    pub fn is_outdated(&self) -> bool {
        self.schema_version != LATEST_SCHEMA_VERSION
    }
}

impl Default for FetchMeta {
    fn default() -> Self {
        Self {
            revision: String::new(),
            schema_version: LATEST_SCHEMA_VERSION,
            last_fetched_at: never_fetched(),
        }
    }
}

/// A stored value that could not be decoded during a lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndecodableRecord {
    /// Storage location, e.g. a table name or a key
    pub location: String,
    /// Row id or hash field within the location
    pub field: String,
    pub reason: String,
}

/// Everything stored for one vulnerability ID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catalog: Vec<CatalogEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended: Vec<ExtendedEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub undecodable: Vec<UndecodableRecord>,
}

impl Response {
    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty() && self.extended.is_empty()
    }
}
