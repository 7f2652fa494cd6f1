//! Key layout, field fingerprints and record decoding for the Redis store

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::models::{CatalogEntry, ExtendedEntry, Response, UndecodableRecord};

/// Hash of records stored for one vulnerability ID
pub(crate) const CVE_KEY_PREFIX: &str = "KEV#CVE#";
/// Hash of per-family manifests
pub(crate) const MANIFEST_KEY: &str = "KEV#DEP";
pub(crate) const FETCH_META_KEY: &str = "KEV#FETCHMETA";
/// Matches every key this store has ever written
pub(crate) const KEY_PATTERN: &str = "KEV#*";

pub(crate) const FIELD_REVISION: &str = "Revision";
pub(crate) const FIELD_SCHEMA_VERSION: &str = "SchemaVersion";
pub(crate) const FIELD_LAST_FETCHED_AT: &str = "LastFetchedAt";

/// Record family, embedded as the prefix of every hash field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    Catalog,
    Extended,
}

impl Family {
    pub fn tag(self) -> &'static str {
        match self {
            Family::Catalog => "Catalog",
            Family::Extended => "Extended",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "Catalog" => Some(Family::Catalog),
            "Extended" => Some(Family::Extended),
            _ => None,
        }
    }
}

pub(crate) fn cve_key(cve_id: &str) -> String {
    format!("{}{}", CVE_KEY_PREFIX, cve_id)
}

/// Hex SHA-256 of a serialized record
pub(crate) fn fingerprint(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex MD5 of a record, the field name of the untagged layout
pub(crate) fn legacy_fingerprint(payload: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// `<Tag>:<fingerprint>`
pub(crate) fn field_name(family: Family, payload: &str) -> String {
    format!("{}:{}", family.tag(), fingerprint(payload))
}

/// Work out which family a stored field belongs to.
///
/// Fields without a tag predate family tagging. They hold catalog records
/// and their name must equal the MD5 of the stored value.
pub(crate) fn classify(field: &str, value: &str) -> Result<Family, String> {
    match field.split_once(':') {
        Some((tag, _)) => {
            Family::from_tag(tag).ok_or_else(|| format!("unknown record tag '{}'", tag))
        }
        None if field == legacy_fingerprint(value) => Ok(Family::Catalog),
        None => Err("untagged field does not match the MD5 of its value".to_string()),
    }
}

fn decode_record(field: &str, value: &str, res: &mut Response) -> Result<(), String> {
    match classify(field, value)? {
        Family::Catalog => serde_json::from_str::<CatalogEntry>(value)
            .map(|v| res.catalog.push(v))
            .map_err(|e| e.to_string()),
        Family::Extended => serde_json::from_str::<ExtendedEntry>(value)
            .map(|v| res.extended.push(v))
            .map_err(|e| e.to_string()),
    }
}

/// Decode one raw hash field into `res`, recording failures instead of aborting
pub(crate) fn decode_field(key: &str, field: &[u8], value: &[u8], res: &mut Response) {
    let decoded = match (std::str::from_utf8(field), std::str::from_utf8(value)) {
        (Ok(field), Ok(value)) => decode_record(field, value, res),
        (Err(e), _) => Err(format!("field name is not UTF-8: {}", e)),
        (_, Err(e)) => Err(format!("value is not UTF-8: {}", e)),
    };

    if let Err(reason) = decoded {
        let field = String::from_utf8_lossy(field);
        tracing::warn!(key = %key, field = %field, reason = %reason, "Skipping undecodable field");
        res.undecodable.push(UndecodableRecord {
            location: key.to_string(),
            field: field.into_owned(),
            reason,
        });
    }
}
