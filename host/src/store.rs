//! Persistence adapter for readings.
//!
//! `ReadingStore` is the seam handlers and the generator talk to. `RedbStore`
//! keeps readings JSON-serialized in redb, keyed by `(seconds, nanos, seq)`
//! so that table order is timestamp order with insertion order breaking
//! ties. Two side tables keep per-device lookups off the full scan: a device
//! index for deletes and a newest-key pointer per device for `latest`.
//! `UnavailableStore` stands in when no database could be opened and fails
//! every call, which pushes callers onto the fallback path.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::domain::{NewReading, Reading};
use crate::error::{StoreError, StoreResult};

/// `(unix seconds, subsecond nanos, insertion sequence)`
type ReadingKey = (i64, u32, u64);

/// Readings in timestamp order.
const READINGS: TableDefinition<ReadingKey, &[u8]> = TableDefinition::new("readings");

/// `(device_id, reading key)` for every stored reading.
const DEVICE_INDEX: TableDefinition<(&str, i64, u32, u64), ()> =
    TableDefinition::new("device_index");

/// Key of the newest reading per device.
const LATEST: TableDefinition<&str, ReadingKey> = TableDefinition::new("latest");

/// Store counters.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SEQ: &str = "next_seq";

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

fn reading_key(at: DateTime<Utc>, seq: u64) -> ReadingKey {
    (at.timestamp(), at.timestamp_subsec_nanos(), seq)
}

fn decode(bytes: &[u8]) -> StoreResult<Reading> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Document-store operations the api needs.
pub trait ReadingStore: Send + Sync {
    /// Persist a reading stamped at `at`; returns the stored record.
    fn insert(&self, reading: &NewReading, at: DateTime<Utc>) -> StoreResult<Reading>;

    /// Up to `limit` readings, newest timestamp first.
    fn recent(&self, limit: usize) -> StoreResult<Vec<Reading>>;

    /// The newest reading of every device, ordered by device id.
    fn latest_per_device(&self) -> StoreResult<Vec<Reading>>;

    /// Remove every reading of `device_id`. Returns the number removed.
    fn delete_device(&self, device_id: &str) -> StoreResult<u64>;
}

/// Open the configured database, creating its parent directory if needed.
pub fn connect(config: &DatabaseConfig) -> StoreResult<RedbStore> {
    let path = config
        .path
        .as_deref()
        .ok_or_else(|| StoreError::Unavailable("no database path configured".to_string()))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
    }
    RedbStore::open(path)
}

/// Thread-safe reading store backed by redb.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "reading store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory reading store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(READINGS).map_err(map_err!(Table))?;
        txn.open_table(DEVICE_INDEX).map_err(map_err!(Table))?;
        txn.open_table(LATEST).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

impl ReadingStore for RedbStore {
    fn insert(&self, reading: &NewReading, at: DateTime<Utc>) -> StoreResult<Reading> {
        let stored = Reading::new(
            Uuid::new_v4().to_string(),
            reading.device_id.clone(),
            reading.temperature,
            reading.humidity,
            at,
        );
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
        let device_id = stored.device_id.as_str();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let seq = meta
                .get(NEXT_SEQ)
                .map_err(map_err!(Read))?
                .map_or(0, |v| v.value());
            meta.insert(NEXT_SEQ, seq + 1).map_err(map_err!(Write))?;

            let key = reading_key(at, seq);
            let mut readings = txn.open_table(READINGS).map_err(map_err!(Table))?;
            readings
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;

            let mut index = txn.open_table(DEVICE_INDEX).map_err(map_err!(Table))?;
            index
                .insert((device_id, key.0, key.1, key.2), ())
                .map_err(map_err!(Write))?;

            // a later key wins, so equal timestamps go to the newest insert
            let mut latest = txn.open_table(LATEST).map_err(map_err!(Table))?;
            let newer = latest
                .get(device_id)
                .map_err(map_err!(Read))?
                .map_or(true, |current| current.value() < key);
            if newer {
                latest.insert(device_id, key).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(device_id = %stored.device_id, id = %stored.id, "reading stored");
        Ok(stored)
    }

    fn recent(&self, limit: usize) -> StoreResult<Vec<Reading>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(READINGS).map_err(map_err!(Table))?;
        let mut results = Vec::with_capacity(limit.min(1024));
        for entry in table.iter().map_err(map_err!(Read))?.rev().take(limit) {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn latest_per_device(&self) -> StoreResult<Vec<Reading>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let latest = txn.open_table(LATEST).map_err(map_err!(Table))?;
        let readings = txn.open_table(READINGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in latest.iter().map_err(map_err!(Read))? {
            let (_, key) = entry.map_err(map_err!(Read))?;
            if let Some(value) = readings.get(key.value()).map_err(map_err!(Read))? {
                results.push(decode(value.value())?);
            }
        }
        Ok(results)
    }

    fn delete_device(&self, device_id: &str) -> StoreResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut index = txn.open_table(DEVICE_INDEX).map_err(map_err!(Table))?;
            let keys: Vec<ReadingKey> = {
                let range = index
                    .range(
                        (device_id, i64::MIN, 0u32, 0u64)
                            ..=(device_id, i64::MAX, u32::MAX, u64::MAX),
                    )
                    .map_err(map_err!(Read))?;
                let mut keys = Vec::new();
                for entry in range {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    let (_, secs, nanos, seq) = key.value();
                    keys.push((secs, nanos, seq));
                }
                keys
            };

            let mut readings = txn.open_table(READINGS).map_err(map_err!(Table))?;
            for key in keys {
                index
                    .remove((device_id, key.0, key.1, key.2))
                    .map_err(map_err!(Write))?;
                if readings.remove(key).map_err(map_err!(Write))?.is_some() {
                    count += 1;
                }
            }

            let mut latest = txn.open_table(LATEST).map_err(map_err!(Table))?;
            latest.remove(device_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%device_id, count, "device readings deleted");
        Ok(count)
    }
}

/// Store used in degraded mode: every operation fails with the reason the
/// database could not be reached.
#[derive(Clone, Debug)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> StoreResult<T> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }
}

impl ReadingStore for UnavailableStore {
    fn insert(&self, _reading: &NewReading, _at: DateTime<Utc>) -> StoreResult<Reading> {
        self.fail()
    }

    fn recent(&self, _limit: usize) -> StoreResult<Vec<Reading>> {
        self.fail()
    }

    fn latest_per_device(&self) -> StoreResult<Vec<Reading>> {
        self.fail()
    }

    fn delete_device(&self, _device_id: &str) -> StoreResult<u64> {
        self.fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn insert_assigns_id_and_timestamps() {
        let store = RedbStore::open_in_memory().unwrap();
        let stored = store.insert(&NewReading::new("d1", 22.5, 50.0), at(0)).unwrap();

        assert!(!stored.id.is_empty());
        assert!(!stored.is_fallback());
        assert_eq!(stored.device_id, "d1");
        assert_eq!(stored.timestamp, at(0));
        assert_eq!(stored.created_at, at(0));
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let store = RedbStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.insert(&NewReading::new("d1", i as f64, 40.0), at(i)).unwrap();
        }

        let recent = store.recent(3).unwrap();
        let temps: Vec<f64> = recent.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![4.0, 3.0, 2.0]);
    }

    #[test]
    fn recent_orders_out_of_order_inserts_by_timestamp() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert(&NewReading::new("d1", 1.0, 1.0), at(10)).unwrap();
        store.insert(&NewReading::new("d1", 2.0, 2.0), at(5)).unwrap();

        let recent = store.recent(10).unwrap();
        assert_eq!(recent[0].timestamp, at(10));
        assert_eq!(recent[1].timestamp, at(5));
    }

    #[test]
    fn latest_per_device_one_record_each() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert(&NewReading::new("a", 1.0, 1.0), at(0)).unwrap();
        store.insert(&NewReading::new("b", 2.0, 2.0), at(1)).unwrap();
        store.insert(&NewReading::new("a", 3.0, 3.0), at(2)).unwrap();
        store.insert(&NewReading::new("a", 4.0, 4.0), at(1)).unwrap();

        let latest = store.latest_per_device().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].device_id, "a");
        assert_eq!(latest[0].temperature, 3.0);
        assert_eq!(latest[1].device_id, "b");
    }

    #[test]
    fn latest_per_device_tie_goes_to_last_inserted() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert(&NewReading::new("a", 1.0, 1.0), at(0)).unwrap();
        let second = store.insert(&NewReading::new("a", 2.0, 2.0), at(0)).unwrap();

        let latest = store.latest_per_device().unwrap();
        assert_eq!(latest[0].id, second.id);
    }

    #[test]
    fn delete_device_counts_and_removes() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert(&NewReading::new("a", 1.0, 1.0), at(0)).unwrap();
        store.insert(&NewReading::new("b", 1.0, 1.0), at(0)).unwrap();
        store.insert(&NewReading::new("a", 1.0, 1.0), at(0) + Duration::seconds(1)).unwrap();

        assert_eq!(store.delete_device("a").unwrap(), 2);
        assert_eq!(store.delete_device("a").unwrap(), 0);
        let remaining = store.recent(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device_id, "b");
    }

    #[test]
    fn sequence_continues_after_delete() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert(&NewReading::new("a", 1.0, 1.0), at(0)).unwrap();
        store.insert(&NewReading::new("b", 2.0, 2.0), at(0)).unwrap();
        store.delete_device("b").unwrap();
        store.insert(&NewReading::new("c", 3.0, 3.0), at(0)).unwrap();

        assert_eq!(store.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn recent_stays_newest_first_over_a_long_history() {
        let store = RedbStore::open_in_memory().unwrap();
        for i in 0..3_000 {
            let device = ["device001", "device002", "device003"][i as usize % 3];
            store
                .insert(&NewReading::new(device, i as f64, 40.0), at(i))
                .unwrap();
        }

        let recent = store.recent(100).unwrap();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].timestamp, at(2_999));
        assert_eq!(recent[99].timestamp, at(2_900));

        let latest = store.latest_per_device().unwrap();
        let temps: Vec<f64> = latest.iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![2_997.0, 2_998.0, 2_999.0]);
    }

    #[test]
    fn recent_breaks_timestamp_ties_by_newest_insert() {
        let store = RedbStore::open_in_memory().unwrap();
        let first = store.insert(&NewReading::new("a", 1.0, 1.0), at(0)).unwrap();
        let second = store.insert(&NewReading::new("b", 2.0, 2.0), at(0)).unwrap();

        let recent = store.recent(10).unwrap();
        assert_eq!(recent[0].id, second.id);
        assert_eq!(recent[1].id, first.id);
    }

    #[test]
    fn delete_clears_latest_and_device_can_come_back() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert(&NewReading::new("a", 1.0, 1.0), at(0)).unwrap();
        store.insert(&NewReading::new("b", 2.0, 2.0), at(1)).unwrap();
        store.delete_device("a").unwrap();

        let latest = store.latest_per_device().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].device_id, "b");

        // older than the deleted reading, still becomes the latest
        store.insert(&NewReading::new("a", 3.0, 3.0), at(-5)).unwrap();
        let latest = store.latest_per_device().unwrap();
        assert_eq!(latest[0].device_id, "a");
        assert_eq!(latest[0].temperature, 3.0);
        assert_eq!(store.delete_device("a").unwrap(), 1);
    }

    #[test]
    fn device_ids_sharing_a_prefix_are_kept_apart() {
        let store = RedbStore::open_in_memory().unwrap();
        store.insert(&NewReading::new("kitchen", 1.0, 1.0), at(0)).unwrap();
        store.insert(&NewReading::new("kitchen#1", 2.0, 2.0), at(1)).unwrap();

        assert_eq!(store.delete_device("kitchen").unwrap(), 1);
        let remaining = store.recent(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].device_id, "kitchen#1");
    }

    #[test]
    fn empty_store_operations() {
        let store = RedbStore::open_in_memory().unwrap();
        assert!(store.recent(100).unwrap().is_empty());
        assert!(store.latest_per_device().unwrap().is_empty());
        assert_eq!(store.delete_device("nope").unwrap(), 0);
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("telemetry.redb");

        {
            let store = RedbStore::open(&db_path).unwrap();
            store.insert(&NewReading::new("d1", 22.5, 50.0), at(0)).unwrap();
        }

        let store = RedbStore::open(&db_path).unwrap();
        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].device_id, "d1");
    }

    #[test]
    fn connect_without_path_is_unavailable() {
        let config = DatabaseConfig::default();
        assert!(matches!(connect(&config), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn connect_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: Some(dir.path().join("nested").join("telemetry.redb")),
            required: false,
        };
        assert!(connect(&config).is_ok());
    }

    #[test]
    fn unavailable_store_fails_everything() {
        let store = UnavailableStore::new("offline");
        assert!(store.insert(&NewReading::new("d1", 1.0, 1.0), at(0)).is_err());
        assert!(store.recent(10).is_err());
        assert!(store.latest_per_device().is_err());
        let err = store.delete_device("d1").unwrap_err();
        assert_eq!(err.to_string(), "database unavailable: offline");
    }
}
