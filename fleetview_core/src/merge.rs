//! Stream batch reconciliation.
//!
//! Combines a freshly received batch with the cache:
//! 1. Collapse duplicate vehicle ids (first occurrence wins)
//! 2. Upsert every record (coordinate-regression and freshness rules live in
//!    [`LocationStore::upsert`])
//! 3. Publish the cache's valid records, nothing else
//!
//! A payload that does not parse skips 1–2 and publishes the cache as is, so
//! a malformed frame degrades to "show last known" instead of an empty map.

use std::collections::HashSet;

use crate::location::{parse_batch, LocationRecord};
use crate::store::LocationStore;

/// Result of one merge call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    /// Every valid record in the store after the merge; the only list ever
    /// handed to a renderer
    pub locations: Vec<LocationRecord>,

    /// Vehicle ids whose stored record changed
    pub changed: Vec<String>,

    /// Duplicate entries dropped from the batch
    pub duplicates_removed: usize,

    /// True when the payload was malformed and the cache was published as is
    pub fell_back: bool,
}

impl MergeReport {
    /// Valid records whose stored state changed in this merge.
    pub fn changed_locations(&self) -> impl Iterator<Item = &LocationRecord> {
        self.locations
            .iter()
            .filter(|record| self.changed.iter().any(|id| *id == record.vehicle_id))
    }
}

/// Drops repeated vehicle ids, keeping the first occurrence.
///
/// Returns the unique records in their original order and how many were
/// dropped.
pub fn dedup_by_vehicle(batch: Vec<LocationRecord>) -> (Vec<LocationRecord>, usize) {
    let total = batch.len();
    let mut seen = HashSet::with_capacity(total);
    let unique: Vec<LocationRecord> = batch
        .into_iter()
        .filter(|record| seen.insert(record.vehicle_id.clone()))
        .collect();
    let removed = total - unique.len();
    (unique, removed)
}

/// Merges a decoded batch into the store and returns what to publish.
pub fn merge(batch: Vec<LocationRecord>, store: &mut LocationStore) -> MergeReport {
    let (unique, duplicates_removed) = dedup_by_vehicle(batch);
    if duplicates_removed > 0 {
        tracing::warn!(
            duplicates = duplicates_removed,
            "Location batch contained duplicate vehicle ids; kept first occurrence"
        );
    }

    let changed = store
        .apply_batch(unique)
        .into_iter()
        .filter(|(_, outcome)| outcome.changed())
        .map(|(id, _)| id)
        .collect();

    MergeReport {
        locations: store.valid_records(),
        changed,
        duplicates_removed,
        fell_back: false,
    }
}

/// Decodes a raw frame and merges it, falling back to the cache on a parse
/// failure.
pub fn merge_payload(payload: &[u8], store: &mut LocationStore) -> MergeReport {
    match parse_batch(payload) {
        Ok(batch) => merge(batch, store),
        Err(e) => {
            tracing::warn!(error = %e, bytes = payload.len(), "Malformed location frame, showing last known");
            MergeReport {
                locations: store.valid_records(),
                fell_back: true,
                ..MergeReport::default()
            }
        }
    }
}
