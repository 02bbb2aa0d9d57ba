//! ==============================================================================
//! client.rs - polling data context for dashboards
//! ==============================================================================
//!
//! purpose:
//!     keeps a local picture of the readings api the way the web dashboard
//!     does: an initial full fetch, a fast "latest" poll, a slower status
//!     poll that forgets deleted devices, and per-device trend history.
//!
//! state machine:
//!
//! ```text
//!         Loading ──fetch ok──▶ Live ◀──any call ok── Degraded(reason)
//!            │                   │                        ▲
//!            └───────────────────┴─fetch_all/create/delete err
//! ```
//!
//! ```text
//!     while Degraded every failed poll substitutes freshly randomized local
//!     mock data, and create/delete run against that local copy without
//!     network i/o. the first successful response brings the context back
//!     to Live.
//! ```
//!
//! relationships:
//!     - talks to: api.rs over http (reqwest)
//!     - used by: main.rs (`watch` command)
//!
//! ==============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::domain::{
    fallback_id, DeleteResponse, HistorySample, NewReading, Reading, ReadingsResponse,
    StatusResponse,
};
use crate::error::ClientError;

/// samples kept per device for trend charts
pub const HISTORY_LEN: usize = 10;

const FETCH_ALL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_secs(3);
const DELETE_TIMEOUT: Duration = Duration::from_secs(8);

const MOCK_DEVICES: [&str; 3] = ["device001", "device002", "device003"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// nothing fetched yet
    Loading,
    /// last call reached the api
    Live,
    /// api unreachable; local mock data is being served
    Degraded { reason: String },
}

impl ConnectionState {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    /// the warning a dashboard should show, if any
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Degraded { reason } => Some(reason),
            _ => None,
        }
    }
}

/// bounded newest-first sample ring per device
#[derive(Clone, Debug, Default)]
pub struct DeviceHistory {
    samples: HashMap<String, VecDeque<HistorySample>>,
}

impl DeviceHistory {
    pub fn record(&mut self, reading: &Reading) {
        let ring = self.samples.entry(reading.device_id.clone()).or_default();
        ring.push_front(reading.sample());
        ring.truncate(HISTORY_LEN);
    }

    /// newest first; empty for unknown devices
    pub fn get(&self, device_id: &str) -> Vec<HistorySample> {
        self.samples
            .get(device_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, device_id: &str) {
        self.samples.remove(device_id);
    }
}

/// thin typed wrapper over the readings endpoints
#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// `base_url` points at the readings collection, e.g.
    /// `http://localhost:5000/api/data`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn all(&self) -> Result<ReadingsResponse, ClientError> {
        self.get_json(&self.base_url, FETCH_ALL_TIMEOUT).await
    }

    pub async fn latest(&self) -> Result<ReadingsResponse, ClientError> {
        self.get_json(&format!("{}/latest", self.base_url), POLL_TIMEOUT).await
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        self.get_json(&format!("{}/status", self.base_url), POLL_TIMEOUT).await
    }

    pub async fn create(&self, reading: &NewReading) -> Result<Reading, ClientError> {
        let resp = self
            .http
            .post(&self.base_url)
            .json(reading)
            .timeout(POLL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// `{base_url}/{device_id}` with the id percent-encoded as one segment
    fn device_url(&self, device_id: &str) -> Result<reqwest::Url, ClientError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push(device_id);
        Ok(url)
    }

    /// a 404 is an answer (`success: false`), not an error
    pub async fn delete(&self, device_id: &str) -> Result<DeleteResponse, ClientError> {
        let resp = self
            .http
            .delete(self.device_url(device_id)?)
            .timeout(DELETE_TIMEOUT)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(resp.json().await?);
        }
        Ok(resp.error_for_status()?.json().await?)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// local view of the telemetry api
pub struct DataContext {
    api: ApiClient,
    state: ConnectionState,
    device_data: Vec<Reading>,
    mock_data: Vec<Reading>,
    history: DeviceHistory,
    last_updated: Option<DateTime<Utc>>,
}

impl DataContext {
    pub fn new(api: ApiClient) -> Self {
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        let mock_data = MOCK_DEVICES
            .iter()
            .map(|id| mock_reading(id, now, &mut rng))
            .collect();
        Self {
            api,
            state: ConnectionState::Loading,
            device_data: Vec::new(),
            mock_data,
            history: DeviceHistory::default(),
            last_updated: None,
        }
    }

    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn device_data(&self) -> &[Reading] {
        &self.device_data
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn device_history(&self, device_id: &str) -> Vec<HistorySample> {
        self.history.get(device_id)
    }

    /// full refresh; the first failure switches to degraded mode
    pub async fn fetch_all(&mut self) {
        match self.api.all().await {
            Ok(resp) => self.apply_live(resp),
            Err(err) => {
                warn!(error = %err, "failed to fetch readings");
                if !self.state.is_degraded() {
                    self.state = ConnectionState::Degraded {
                        reason: format!("Error fetching data: {err}"),
                    };
                }
                self.substitute_mock_data();
            }
        }
    }

    /// fast poll; failures only matter once already degraded
    pub async fn fetch_latest(&mut self) {
        match self.api.latest().await {
            Ok(resp) => self.apply_live(resp),
            Err(err) => {
                debug!(error = %err, "latest poll failed");
                if self.state.is_degraded() {
                    self.substitute_mock_data();
                }
            }
        }
    }

    /// slow poll; forgets devices the server reports as deleted
    pub async fn fetch_status(&mut self) {
        match self.api.status().await {
            Ok(status) => {
                self.last_updated = Some(status.last_updated);
                for device_id in &status.deleted_devices {
                    self.forget_device(device_id);
                }
                self.state = ConnectionState::Live;
            }
            Err(err) => debug!(error = %err, "status poll failed"),
        }
    }

    /// submit a reading, or record it locally when the api is out of reach
    pub async fn add_device_data(&mut self, reading: NewReading) -> Reading {
        if self.state.is_degraded() {
            info!(device_id = %reading.device_id, "api unavailable, storing reading locally");
            return self.add_local(reading);
        }

        match self.api.create(&reading).await {
            Ok(stored) => {
                self.history.record(&stored);
                self.state = ConnectionState::Live;
                self.fetch_all().await;
                stored
            }
            Err(err) => {
                warn!(error = %err, "failed to submit reading");
                self.state = ConnectionState::Degraded {
                    reason: format!("Error saving data: {err}"),
                };
                self.add_local(reading)
            }
        }
    }

    /// delete a device upstream, or from the local copy when degraded
    pub async fn delete_device(&mut self, device_id: &str) -> DeleteResponse {
        if self.state.is_degraded() {
            return self.delete_local(device_id);
        }

        match self.api.delete(device_id).await {
            Ok(resp) if resp.success => {
                self.forget_device(device_id);
                self.last_updated = Some(Utc::now());
                self.state = ConnectionState::Live;
                resp
            }
            Ok(resp) => resp,
            Err(err) => {
                warn!(%device_id, error = %err, "failed to delete device, deleting locally");
                self.state = ConnectionState::Degraded {
                    reason: format!("Error deleting device: {err}"),
                };
                self.delete_local(device_id)
            }
        }
    }

    fn apply_live(&mut self, resp: ReadingsResponse) {
        for reading in &resp.data {
            self.history.record(reading);
        }
        self.device_data = resp.data;
        self.last_updated = Some(resp.last_updated);
        self.state = ConnectionState::Live;
    }

    fn substitute_mock_data(&mut self) {
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        for reading in &mut self.mock_data {
            reading.temperature = mock_temperature(&mut rng);
            reading.humidity = mock_humidity(&mut rng);
            reading.timestamp = now;
            reading.updated_at = now;
            self.history.record(reading);
        }
        self.device_data = self.mock_data.clone();
        self.last_updated = Some(now);
    }

    fn add_local(&mut self, new: NewReading) -> Reading {
        let now = Utc::now();
        let reading = Reading::new(fallback_id(), new.device_id, new.temperature, new.humidity, now);
        match self
            .mock_data
            .iter_mut()
            .find(|d| d.device_id == reading.device_id)
        {
            Some(existing) => {
                existing.temperature = reading.temperature;
                existing.humidity = reading.humidity;
                existing.timestamp = now;
                existing.updated_at = now;
            }
            None => self.mock_data.push(reading.clone()),
        }
        self.history.record(&reading);
        self.device_data = self.mock_data.clone();
        self.last_updated = Some(now);
        reading
    }

    fn delete_local(&mut self, device_id: &str) -> DeleteResponse {
        let before = self.mock_data.len();
        self.mock_data.retain(|d| d.device_id != device_id);
        let deleted_count = (before - self.mock_data.len()) as u64;
        self.forget_device(device_id);
        self.last_updated = Some(Utc::now());

        let mut active_devices: Vec<String> = Vec::new();
        for reading in &self.mock_data {
            if !active_devices.contains(&reading.device_id) {
                active_devices.push(reading.device_id.clone());
            }
        }

        DeleteResponse {
            success: true,
            message: format!("Successfully deleted device: {device_id} (local only)"),
            deleted_count: Some(deleted_count),
            active_devices: Some(active_devices),
        }
    }

    fn forget_device(&mut self, device_id: &str) {
        self.device_data.retain(|d| d.device_id != device_id);
        self.history.remove(device_id);
    }
}

/// Drive `ctx` until `shutdown` flips: one full fetch, then the latest poll
/// and the status poll on their own periods.
///
/// Each poll holds the context lock for the duration of its request, so a
/// slow api delays the next tick instead of stacking requests.
pub async fn run_polling(
    ctx: Arc<Mutex<DataContext>>,
    config: ClientConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    ctx.lock().await.fetch_all().await;

    let mut latest = interval_at(Instant::now() + config.latest_interval(), config.latest_interval());
    let mut status = interval_at(Instant::now() + config.status_interval(), config.status_interval());
    latest.set_missed_tick_behavior(MissedTickBehavior::Delay);
    status.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = latest.tick() => ctx.lock().await.fetch_latest().await,
            _ = status.tick() => ctx.lock().await.fetch_status().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("polling stopped");
}

fn mock_reading(device_id: &str, at: DateTime<Utc>, rng: &mut impl Rng) -> Reading {
    Reading::new(
        fallback_id(),
        device_id,
        mock_temperature(rng),
        mock_humidity(rng),
        at,
    )
}

/// 15-35 °C, one decimal
fn mock_temperature(rng: &mut impl Rng) -> f64 {
    (rng.gen_range(15.0..35.0_f64) * 10.0).round() / 10.0
}

/// 30-80 %, one decimal
fn mock_humidity(rng: &mut impl Rng) -> f64 {
    (rng.gen_range(30.0..80.0_f64) * 10.0).round() / 10.0
}
