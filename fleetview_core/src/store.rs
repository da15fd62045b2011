//! The last-known-location cache.
//!
//! Guarantees a displayable position for every tracked vehicle across page
//! reloads, process restarts and connection loss:
//! - coordinates never regress from valid to invalid
//! - stale-after-fresh arrivals are no-ops (timestamp-aware upsert)
//! - entries older than the retention window are dropped at load
//! - persistence failures are logged, never propagated
//!
//! The in-memory map is authoritative for the running session; the
//! [`PersistenceBackend`] only has to survive a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::config::StoreConfig;
use crate::location::LocationRecord;

/// Storage errors. Backends return these; the store logs and swallows them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// PERSISTENCE BACKENDS
// ============================================================================

/// Trait for the durable copy of the cache.
///
/// The whole store is written as one blob under one key, so a backend only
/// needs whole-value load/save semantics.
pub trait PersistenceBackend: Send + Sync {
    /// Reads the stored blob, `None` if nothing was ever saved.
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replaces the stored blob.
    fn save(&self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Deletes the stored blob.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Sled-based persistent backend.
///
/// Uses an embedded key-value database for durability.
pub struct SledBackend {
    db: sled::Db,
    key: String,
}

impl SledBackend {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P, key: impl Into<String>) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Backend(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db, key: key.into() })
    }

    /// Create a temporary store (for testing)
    #[cfg(test)]
    pub fn open_temp(key: impl Into<String>) -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| StoreError::Backend(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db, key: key.into() })
    }
}

impl PersistenceBackend for SledBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(self.key.as_bytes())
            .map(|value| value.map(|ivec| ivec.to_vec()))
            .map_err(|e| StoreError::Backend(format!("Read failed: {}", e)))
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(self.key.as_bytes(), bytes)
            .map_err(|e| StoreError::Backend(format!("Insert failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(format!("Flush failed: {}", e)))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.db
            .remove(self.key.as_bytes())
            .map_err(|e| StoreError::Backend(format!("Remove failed: {}", e)))?;
        Ok(())
    }
}

/// In-process backend for simulation and tests.
///
/// Clones share the same buffer, which lets a test "restart" a store by
/// building a new one over the same backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the backend with raw bytes (e.g. a corrupt payload).
    pub fn with_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Arc::new(Mutex::new(Some(bytes.into()))),
        }
    }

    /// Returns a copy of the stored bytes.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|blob| blob.clone())
    }
}

impl PersistenceBackend for MemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let blob = self
            .blob
            .lock()
            .map_err(|_| StoreError::Backend("memory backend poisoned".to_string()))?;
        Ok(blob.clone())
    }

    fn save(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut blob = self
            .blob
            .lock()
            .map_err(|_| StoreError::Backend("memory backend poisoned".to_string()))?;
        *blob = Some(bytes.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut blob = self
            .blob
            .lock()
            .map_err(|_| StoreError::Backend("memory backend poisoned".to_string()))?;
        *blob = None;
        Ok(())
    }
}

// ============================================================================
// LOCATION STORE
// ============================================================================

/// What an upsert did with the incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First valid sighting of this vehicle
    Inserted,
    /// Newer record replaced the stored one
    Updated,
    /// Newer record accepted, but its invalid coordinates were replaced by
    /// the stored valid ones
    KeptCoordinates,
    /// Not newer than what is stored
    Stale,
    /// First sighting without usable coordinates
    IgnoredInvalid,
}

impl UpsertOutcome {
    /// True if the stored record changed.
    pub fn changed(self) -> bool {
        matches!(
            self,
            UpsertOutcome::Inserted | UpsertOutcome::Updated | UpsertOutcome::KeptCoordinates
        )
    }
}

/// Serialized form: a list of `[vehicleId, record]` pairs.
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
struct PersistedEntries(Vec<(String, LocationRecord)>);

/// Shared handle; the store is the only mutable state readers and the
/// connection task both touch.
pub type SharedLocationStore = Arc<Mutex<LocationStore>>;

/// Locks a shared store, taking over a poisoned lock.
pub fn lock_store(store: &SharedLocationStore) -> MutexGuard<'_, LocationStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Vehicle id → last-known location, backed by a [`PersistenceBackend`].
pub struct LocationStore {
    records: BTreeMap<String, LocationRecord>,
    backend: Arc<dyn PersistenceBackend>,
    config: StoreConfig,
}

impl LocationStore {
    /// Creates an empty store. Call [`load`](Self::load) to hydrate it.
    pub fn new(backend: Arc<dyn PersistenceBackend>, config: StoreConfig) -> Self {
        Self {
            records: BTreeMap::new(),
            backend,
            config,
        }
    }

    /// Creates a store and hydrates it from the backend.
    pub fn open(backend: Arc<dyn PersistenceBackend>, config: StoreConfig, now: DateTime<Utc>) -> Self {
        let mut store = Self::new(backend, config);
        store.load(now);
        store
    }

    /// Wraps the store for sharing between the connection task and the UI.
    pub fn shared(self) -> SharedLocationStore {
        Arc::new(Mutex::new(self))
    }

    /// Hydrates memory from the backend, dropping anything outside retention.
    ///
    /// A corrupt payload is discarded and the store starts empty. Returns the
    /// number of entries kept.
    pub fn load(&mut self, now: DateTime<Utc>) -> usize {
        self.records.clear();

        let bytes = match self.backend.load() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return 0,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read location cache, starting empty");
                return 0;
            }
        };

        let entries = match serde_json::from_slice::<PersistedEntries>(&bytes) {
            Ok(PersistedEntries(entries)) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding corrupt location cache");
                if let Err(e) = self.backend.clear() {
                    tracing::warn!(error = %e, "Failed to clear corrupt location cache");
                }
                return 0;
            }
        };

        let total = entries.len();
        for (vehicle_id, record) in entries {
            if self.within_retention(&record, now) {
                self.records.insert(vehicle_id, record);
            }
        }

        tracing::info!(
            kept = self.records.len(),
            expired = total - self.records.len(),
            "Location cache loaded"
        );
        self.records.len()
    }

    fn within_retention(&self, record: &LocationRecord, now: DateTime<Utc>) -> bool {
        let Some(updated) = record.last_updated_at() else {
            return false;
        };
        match (now - updated).to_std() {
            Ok(age) => age < self.config.retention,
            // Timestamp in the future (clock skew): keep it.
            Err(_) => true,
        }
    }

    /// Applies one incoming record without persisting.
    ///
    /// Accepted when the incoming timestamp is strictly newer than the stored
    /// one, or when the stored record has no timestamp. If the accepted
    /// record's coordinates are invalid, the stored valid ones are retained.
    pub fn upsert(&mut self, id: &str, incoming: LocationRecord) -> UpsertOutcome {
        let Some(existing) = self.records.get_mut(id) else {
            if !incoming.is_valid() {
                return UpsertOutcome::IgnoredInvalid;
            }
            self.records.insert(id.to_string(), incoming);
            return UpsertOutcome::Inserted;
        };

        let newer = match (existing.last_updated_at(), incoming.last_updated_at()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(stored), Some(fresh)) => fresh > stored,
        };
        if !newer {
            return UpsertOutcome::Stale;
        }

        let mut incoming = incoming;
        let outcome = if !incoming.is_valid() && existing.is_valid() {
            incoming.latitude = existing.latitude;
            incoming.longitude = existing.longitude;
            UpsertOutcome::KeptCoordinates
        } else {
            UpsertOutcome::Updated
        };
        *existing = incoming;
        outcome
    }

    /// Applies a whole batch and persists once.
    pub fn apply_batch(&mut self, batch: Vec<LocationRecord>) -> Vec<(String, UpsertOutcome)> {
        let outcomes: Vec<(String, UpsertOutcome)> = batch
            .into_iter()
            .map(|record| {
                let id = record.vehicle_id.clone();
                let outcome = self.upsert(&id, record);
                (id, outcome)
            })
            .collect();

        if outcomes.iter().any(|(_, outcome)| outcome.changed()) {
            self.persist();
        }
        outcomes
    }

    /// Writes the full store to the backend. Failures are logged only.
    pub fn persist(&self) {
        let entries = PersistedEntries(
            self.records
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
        );

        let bytes = match serde_json::to_vec(&entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize location cache");
                return;
            }
        };

        if let Err(e) = self.backend.save(&bytes) {
            tracing::warn!(error = %e, "Failed to persist location cache");
        }
    }

    /// Every stored record, valid or not.
    pub fn get_all(&self) -> Vec<LocationRecord> {
        self.records.values().cloned().collect()
    }

    /// Stored records that pass the validity predicate.
    pub fn valid_records(&self) -> Vec<LocationRecord> {
        self.records.values().filter(|r| r.is_valid()).cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&LocationRecord> {
        self.records.get(id)
    }

    /// True iff the record was updated less than `timeout` before `now`.
    pub fn is_online_within(record: &LocationRecord, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Some(updated) = record.last_updated_at() else {
            return false;
        };
        match (now - updated).to_std() {
            Ok(age) => age < timeout,
            Err(_) => true,
        }
    }

    /// Online check using the configured default timeout.
    pub fn is_online(&self, record: &LocationRecord, now: DateTime<Utc>) -> bool {
        Self::is_online_within(record, now, self.config.online_timeout)
    }

    /// Removes one vehicle (administrative cleanup).
    pub fn remove(&mut self, id: &str) -> Option<LocationRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Forgets everything, in memory and on disk.
    pub fn clear(&mut self) {
        self.records.clear();
        if let Err(e) = self.backend.clear() {
            tracing::warn!(error = %e, "Failed to clear location cache");
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    fn memory_store() -> (LocationStore, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = LocationStore::new(Arc::new(backend.clone()), StoreConfig::default());
        (store, backend)
    }

    /// Backend whose writes always fail.
    struct BrokenBackend;

    impl PersistenceBackend for BrokenBackend {
        fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Backend("disk on fire".to_string()))
        }
        fn save(&self, _bytes: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Backend("quota exceeded".to_string()))
        }
        fn clear(&self) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk on fire".to_string()))
        }
    }

    #[test]
    fn test_first_sighting_requires_valid_coordinates() {
        let (mut store, _) = memory_store();
        let invalid = LocationRecord::new("v1").at(0.0, 0.0).updated_at(t0());
        assert_eq!(store.upsert("v1", invalid), UpsertOutcome::IgnoredInvalid);
        assert!(store.is_empty());

        let valid = LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0());
        assert_eq!(store.upsert("v1", valid), UpsertOutcome::Inserted);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_invalid_update_keeps_coordinates_but_updates_metadata() {
        let (mut store, _) = memory_store();
        store.upsert("v1", LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0()));

        let mut update = LocationRecord::new("v1").updated_at(t0() + secs(1));
        update.license_plate_number = Some("51C-999.99".to_string());
        assert_eq!(store.upsert("v1", update), UpsertOutcome::KeptCoordinates);

        let stored = store.get("v1").unwrap();
        assert_eq!(stored.latitude, Some(10.0));
        assert_eq!(stored.longitude, Some(106.0));
        assert_eq!(stored.license_plate_number.as_deref(), Some("51C-999.99"));
        assert_eq!(stored.last_updated_at(), Some(t0() + secs(1)));
    }

    #[test]
    fn test_stale_and_equal_timestamps_rejected() {
        let (mut store, _) = memory_store();
        store.upsert("v1", LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0()));

        let older = LocationRecord::new("v1").at(11.0, 107.0).updated_at(t0() - secs(5));
        assert_eq!(store.upsert("v1", older), UpsertOutcome::Stale);

        let replay = LocationRecord::new("v1").at(12.0, 108.0).updated_at(t0());
        assert_eq!(store.upsert("v1", replay), UpsertOutcome::Stale);

        let untimed = LocationRecord::new("v1").at(13.0, 109.0);
        assert_eq!(store.upsert("v1", untimed), UpsertOutcome::Stale);

        assert_eq!(store.get("v1").unwrap().latitude, Some(10.0));
    }

    #[test]
    fn test_untimed_stored_record_accepts_anything() {
        let (mut store, _) = memory_store();
        store.upsert("v1", LocationRecord::new("v1").at(10.0, 106.0));
        let next = LocationRecord::new("v1").at(10.5, 106.5);
        assert_eq!(store.upsert("v1", next), UpsertOutcome::Updated);
        assert_eq!(store.get("v1").unwrap().latitude, Some(10.5));
    }

    #[test]
    fn test_batch_persists_and_reloads() {
        let (mut store, backend) = memory_store();
        store.apply_batch(vec![
            LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0()),
            LocationRecord::new("v2").at(11.0, 107.0).updated_at(t0()),
        ]);
        assert!(backend.snapshot().is_some());

        let reloaded = LocationStore::open(Arc::new(backend), StoreConfig::default(), t0() + secs(60));
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("v2").unwrap().longitude, Some(107.0));
    }

    #[test]
    fn test_persisted_schema_is_pair_list() {
        let (mut store, backend) = memory_store();
        store.apply_batch(vec![LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0())]);

        let value: serde_json::Value = serde_json::from_slice(&backend.snapshot().unwrap()).unwrap();
        assert_eq!(value[0][0], "v1");
        assert_eq!(value[0][1]["vehicleId"], "v1");
        assert_eq!(value[0][1]["latitude"], 10.0);
    }

    #[test]
    fn test_retention_window_on_load() {
        let (mut store, backend) = memory_store();
        let now = t0();
        store.apply_batch(vec![
            LocationRecord::new("old").at(10.0, 106.0).updated_at(now - chrono::Duration::hours(25)),
            LocationRecord::new("recent").at(10.0, 106.0).updated_at(now - chrono::Duration::hours(23)),
            LocationRecord::new("untimed").at(10.0, 106.0),
        ]);

        let reloaded = LocationStore::open(Arc::new(backend), StoreConfig::default(), now);
        assert!(reloaded.get("old").is_none());
        assert!(reloaded.get("untimed").is_none());
        assert!(reloaded.get("recent").is_some());
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_corrupt_payload_starts_empty_and_is_discarded() {
        let backend = MemoryBackend::with_bytes(b"{not valid json".to_vec());
        let store = LocationStore::open(Arc::new(backend.clone()), StoreConfig::default(), t0());
        assert!(store.is_empty());
        assert!(backend.snapshot().is_none());
    }

    #[test]
    fn test_persistence_errors_are_swallowed() {
        let mut store = LocationStore::open(Arc::new(BrokenBackend), StoreConfig::default(), t0());
        let outcomes = store.apply_batch(vec![LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0())]);
        assert_eq!(outcomes[0].1, UpsertOutcome::Inserted);
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_online_predicate_boundary() {
        let record = LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0());
        let timeout = Duration::from_secs(300);
        assert!(LocationStore::is_online_within(&record, t0() + secs(299), timeout));
        assert!(!LocationStore::is_online_within(&record, t0() + secs(300), timeout));
        assert!(!LocationStore::is_online_within(&LocationRecord::new("x"), t0(), timeout));
    }

    #[test]
    fn test_remove_and_clear() {
        let (mut store, backend) = memory_store();
        store.apply_batch(vec![
            LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0()),
            LocationRecord::new("v2").at(11.0, 107.0).updated_at(t0()),
        ]);
        assert!(store.remove("v1").is_some());
        assert!(store.remove("v1").is_none());

        let reloaded = LocationStore::open(Arc::new(backend.clone()), StoreConfig::default(), t0());
        assert_eq!(reloaded.len(), 1);

        store.clear();
        assert!(store.is_empty());
        assert!(backend.snapshot().is_none());
    }

    #[test]
    fn test_sled_backend_roundtrip() {
        let backend = SledBackend::open_temp("vehicle_locations_cache").unwrap();
        assert!(backend.load().unwrap().is_none());
        backend.save(b"[]").unwrap();
        assert_eq!(backend.load().unwrap(), Some(b"[]".to_vec()));
        backend.clear().unwrap();
        assert!(backend.load().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_coordinates_never_regress(
            steps in prop::collection::vec((any::<bool>(), -80.0f64..80.0, -170.0f64..170.0, -3i64..10), 1..40)
        ) {
            let (mut store, _) = memory_store();
            store.upsert("v1", LocationRecord::new("v1").at(10.0, 106.0).updated_at(t0()));
            let mut clock = t0();

            for (valid, lat, lng, jump) in steps {
                clock += secs(jump);
                let record = if valid {
                    LocationRecord::new("v1").at(lat, lng).updated_at(clock)
                } else {
                    LocationRecord::new("v1").at(0.0, 0.0).updated_at(clock)
                };
                let before = store.get("v1").cloned().unwrap();
                store.upsert("v1", record);
                let after = store.get("v1").unwrap();

                prop_assert!(after.is_valid());
                if !valid {
                    prop_assert_eq!(after.latitude, before.latitude);
                    prop_assert_eq!(after.longitude, before.longitude);
                }
            }
        }
    }
}
