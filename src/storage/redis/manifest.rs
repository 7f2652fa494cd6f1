//! Live-field manifest for one record family
//!
//! Redis has no multi-key transaction spanning a full replace, so each family
//! keeps a manifest of the hash fields it currently owns, per vulnerability ID.
//! A replace writes every incoming record first, then deletes whatever the
//! previous manifest listed that was not written again.
//!
//! ```text
//! previous ──copy──▶ superseded ──record(id, field)──▶ remove(id, field)
//!                    next       ──record(id, field)──▶ insert(id, field)
//!
//! pending()  ─▶ superseded ∪ next, persisted before any record is written
//! finish()   ─▶ (stale = superseded, next)
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::storage::error::{StoreError, StoreResult};

/// Fields owned by a family, keyed by vulnerability ID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Manifest {
    entries: BTreeMap<String, BTreeSet<String>>,
}

/// On-disk shapes: the current `[field, ...]` list, or the older
/// `{field: {}}` set written before lists were used
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFields {
    List(Vec<String>),
    Set(BTreeMap<String, serde_json::Value>),
}

impl Manifest {
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let stored: BTreeMap<String, StoredFields> = serde_json::from_str(raw)
            .map_err(|e| StoreError::serialization(format!("invalid manifest: {}", e)))?;

        let mut manifest = Self::default();
        for (id, fields) in stored {
            let fields: Vec<String> = match fields {
                StoredFields::List(list) => list,
                StoredFields::Set(set) => set.into_keys().collect(),
            };
            for field in fields {
                manifest.insert(&id, &field);
            }
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(&self.entries)?)
    }

    pub fn insert(&mut self, id: &str, field: &str) {
        self.entries
            .entry(id.to_string())
            .or_default()
            .insert(field.to_string());
    }

    /// Remove one field; IDs left with no fields disappear
    pub fn remove(&mut self, id: &str, field: &str) -> bool {
        let Some(fields) = self.entries.get_mut(id) else {
            return false;
        };
        let removed = fields.remove(field);
        if fields.is_empty() {
            self.entries.remove(id);
        }
        removed
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str, field: &str) -> bool {
        self.entries.get(id).is_some_and(|f| f.contains(field))
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of fields across all IDs
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.entries.iter().map(|(id, f)| (id.as_str(), f))
    }

    fn union(&self, other: &Manifest) -> Manifest {
        let mut out = self.clone();
        for (id, fields) in other.iter() {
            for field in fields {
                out.insert(id, field);
            }
        }
        out
    }
}

/// Tracks a replace in progress: what the new manifest will be and which
/// previously live fields nothing has superseded yet
#[derive(Debug)]
pub(crate) struct ManifestOverlay {
    superseded: Manifest,
    next: Manifest,
}

impl ManifestOverlay {
    pub fn new(previous: Manifest) -> Self {
        Self {
            superseded: previous,
            next: Manifest::default(),
        }
    }

    /// Note that `field` was written under `id`
    pub fn record(&mut self, id: &str, field: &str) {
        self.next.insert(id, field);
        self.superseded.remove(id, field);
    }

    /// Every field that is live now or may be live once the writes land.
    /// Stored ahead of the writes so an interrupted replace leaves nothing
    /// the next replace cannot find.
    pub fn pending(&self) -> Manifest {
        self.superseded.union(&self.next)
    }

    /// Returns `(stale, next)`. Only call once every record is written.
    pub fn finish(self) -> (Manifest, Manifest) {
        (self.superseded, self.next)
    }
}
