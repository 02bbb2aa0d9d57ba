//! ==============================================================================
//! fallback.rs - in-memory substitute for the reading store
//! ==============================================================================
//!
//! purpose:
//!     holds what the host can still answer with when the database is down:
//!     a bounded newest-first buffer of recent readings, the set of devices
//!     an operator deleted, and the shared "last updated" timestamp.
//!
//! relationships:
//!     - owned by: context.rs (behind a tokio RwLock)
//!     - written by: generator.rs (every tick), api.rs (create/delete)
//!     - read by: api.rs (list/latest/status when the store fails)
//!
//! ==============================================================================

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::domain::{fallback_id, latest_by_device, Reading};
use crate::error::{StoreError, StoreResult};

/// maximum number of readings kept in memory
pub const FALLBACK_CAPACITY: usize = 100;

/// readings the buffer starts with, so a fresh host has something to show
const SEED_READINGS: [(&str, f64, f64); 3] = [
    ("device001", 23.5, 48.2),
    ("device002", 21.8, 52.4),
    ("device003", 24.2, 45.7),
];

#[derive(Debug, Clone)]
pub struct FallbackState {
    /// newest first
    buffer: VecDeque<Reading>,
    known_devices: Vec<String>,
    deleted: BTreeSet<String>,
    last_updated: DateTime<Utc>,
}

impl FallbackState {
    /// empty buffer, nothing deleted
    pub fn new(known_devices: Vec<String>, now: DateTime<Utc>) -> Self {
        Self {
            buffer: VecDeque::with_capacity(FALLBACK_CAPACITY),
            known_devices,
            deleted: BTreeSet::new(),
            last_updated: now,
        }
    }

    /// buffer pre-filled with the three demo readings
    pub fn seeded(known_devices: Vec<String>, now: DateTime<Utc>) -> Self {
        let mut state = Self::new(known_devices, now);
        for (device_id, temperature, humidity) in SEED_READINGS.iter().rev() {
            state.push(Reading::new(fallback_id(), *device_id, *temperature, *humidity, now));
        }
        state
    }

    /// add a reading at the front, evicting the oldest past capacity
    pub fn push(&mut self, reading: Reading) {
        self.buffer.push_front(reading);
        self.buffer.truncate(FALLBACK_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// buffer contents in insertion order, newest first
    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.buffer.iter()
    }

    /// buffer contents sorted by timestamp, newest first. Equal timestamps
    /// keep insertion order (newest first).
    pub fn sorted_desc(&self) -> Vec<Reading> {
        let mut readings: Vec<Reading> = self.buffer.iter().cloned().collect();
        readings.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        readings
    }

    /// newest buffered reading per device
    pub fn latest_per_device(&self) -> Vec<Reading> {
        // oldest insertion first, so the last-inserted reading wins ties
        latest_by_device(self.buffer.iter().rev())
    }

    /// drop every buffered reading of `device_id`, returning how many went
    pub fn remove_device(&mut self, device_id: &str) -> u64 {
        let before = self.buffer.len();
        self.buffer.retain(|r| r.device_id != device_id);
        (before - self.buffer.len()) as u64
    }

    /// stop generating readings for `device_id`
    pub fn mark_deleted(&mut self, device_id: &str) {
        self.deleted.insert(device_id.to_string());
    }

    /// take `device_id` back out of the deleted set; true if it was there
    pub fn reactivate(&mut self, device_id: &str) -> bool {
        self.deleted.remove(device_id)
    }

    pub fn is_deleted(&self, device_id: &str) -> bool {
        self.deleted.contains(device_id)
    }

    /// known devices that have not been deleted, in seed order
    pub fn active_devices(&self) -> Vec<String> {
        self.known_devices
            .iter()
            .filter(|id| !self.deleted.contains(*id))
            .cloned()
            .collect()
    }

    pub fn deleted_devices(&self) -> Vec<String> {
        self.deleted.iter().cloned().collect()
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
    }
}

/// Run `operation`; if it fails, hand the error to `on_error` and return
/// `fallback()` instead.
pub fn with_fallback<T>(
    operation: impl FnOnce() -> StoreResult<T>,
    fallback: impl FnOnce() -> T,
    on_error: impl FnOnce(&StoreError),
) -> T {
    match operation() {
        Ok(value) => value,
        Err(err) => {
            on_error(&err);
            fallback()
        }
    }
}

/// error hook used by the handlers: log and move on
pub fn log_store_error(operation: &'static str) -> impl FnOnce(&StoreError) {
    move |err| warn!(operation, error = %err, "store call failed, using in-memory data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::cell::Cell;

    fn devices() -> Vec<String> {
        vec!["device001".into(), "device002".into(), "device003".into()]
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(device: &str, secs: i64) -> Reading {
        Reading::new(fallback_id(), device, 20.0, 40.0, at(secs))
    }

    #[test]
    fn seeded_state_has_three_demo_readings() {
        let state = FallbackState::seeded(devices(), at(0));
        assert_eq!(state.len(), 3);
        let ids: Vec<_> = state.readings().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["device001", "device002", "device003"]);
        assert!(state.readings().all(Reading::is_fallback));
    }

    #[test]
    fn push_caps_buffer_and_evicts_oldest() {
        let mut state = FallbackState::new(devices(), at(0));
        for i in 0..(FALLBACK_CAPACITY as i64 + 25) {
            state.push(reading("device001", i));
        }
        assert_eq!(state.len(), FALLBACK_CAPACITY);
        // newest at the front, the first 25 evicted
        assert_eq!(state.readings().next().unwrap().timestamp, at(124));
        assert_eq!(state.readings().last().unwrap().timestamp, at(25));
    }

    #[test]
    fn sorted_desc_orders_by_timestamp() {
        let mut state = FallbackState::new(devices(), at(0));
        state.push(reading("a", 5));
        state.push(reading("b", 1));
        state.push(reading("c", 9));

        let sorted = state.sorted_desc();
        let ids: Vec<_> = sorted.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        // the buffer itself keeps insertion order
        assert_eq!(state.readings().next().unwrap().device_id, "c");
        assert_eq!(state.readings().nth(1).unwrap().device_id, "b");
    }

    #[test]
    fn latest_per_device_reduces_buffer() {
        let mut state = FallbackState::new(devices(), at(0));
        state.push(reading("a", 1));
        state.push(reading("b", 2));
        state.push(reading("a", 3));

        let latest = state.latest_per_device();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].timestamp, at(3));
    }

    #[test]
    fn latest_per_device_tie_goes_to_last_inserted() {
        let mut state = FallbackState::new(devices(), at(0));
        let first = reading("a", 1);
        let second = reading("a", 1);
        state.push(first);
        state.push(second.clone());

        assert_eq!(state.latest_per_device()[0].id, second.id);
    }

    #[test]
    fn remove_device_reports_count() {
        let mut state = FallbackState::seeded(devices(), at(0));
        state.push(reading("device001", 1));
        assert_eq!(state.remove_device("device001"), 2);
        assert_eq!(state.remove_device("device001"), 0);
        assert!(state.readings().all(|r| r.device_id != "device001"));
    }

    #[test]
    fn deleted_devices_leave_active_set_until_reactivated() {
        let mut state = FallbackState::new(devices(), at(0));
        state.mark_deleted("device002");
        assert_eq!(state.active_devices(), vec!["device001", "device003"]);
        assert_eq!(state.deleted_devices(), vec!["device002"]);
        assert!(state.is_deleted("device002"));

        assert!(state.reactivate("device002"));
        assert!(!state.reactivate("device002"));
        assert_eq!(state.active_devices().len(), 3);
    }

    #[test]
    fn unknown_devices_can_be_deleted_without_affecting_active_set() {
        let mut state = FallbackState::new(devices(), at(0));
        state.mark_deleted("sensor-x");
        assert_eq!(state.active_devices().len(), 3);
        assert_eq!(state.deleted_devices(), vec!["sensor-x"]);
    }

    #[test]
    fn touch_moves_last_updated() {
        let mut state = FallbackState::new(devices(), at(0));
        state.touch(at(0) + Duration::seconds(10));
        assert_eq!(state.last_updated(), at(10));
    }

    #[test]
    fn with_fallback_passes_through_success() {
        let hook_called = Cell::new(false);
        let value = with_fallback(|| Ok(7), || 0, |_| hook_called.set(true));
        assert_eq!(value, 7);
        assert!(!hook_called.get());
    }

    #[test]
    fn with_fallback_substitutes_and_reports_error() {
        let seen = Cell::new(false);
        let value = with_fallback(
            || Err(StoreError::Unavailable("down".into())),
            || 42,
            |err| seen.set(matches!(err, StoreError::Unavailable(_))),
        );
        assert_eq!(value, 42);
        assert!(seen.get());
    }
}
