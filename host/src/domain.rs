//! ==============================================================================
//! domain.rs - shared data shapes
//! ==============================================================================
//!
//! purpose:
//!     the json contract spoken by the api (api.rs) and its polling client
//!     (client.rs). field names are camelCase on the wire to match what the
//!     dashboard expects.
//!
//! ==============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// prefix carried by ids of records that never reached the database
pub const FALLBACK_ID_PREFIX: &str = "mock-";

/// one timestamped temperature/humidity sample for a device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: String,
    /// free-form device identifier, shared by all readings of that device
    pub device_id: String,
    /// temperature in celsius (not range checked)
    pub temperature: f64,
    /// relative humidity in percent (not range checked)
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reading {
    /// build a reading whose audit timestamps equal its sample time
    pub fn new(
        id: String,
        device_id: impl Into<String>,
        temperature: f64,
        humidity: f64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            device_id: device_id.into(),
            temperature,
            humidity,
            timestamp: at,
            created_at: at,
            updated_at: at,
        }
    }

    /// in-memory record substituted when persistence rejects a write
    pub fn fallback(new: &NewReading, at: DateTime<Utc>) -> Self {
        Self::new(
            fallback_id(),
            new.device_id.clone(),
            new.temperature,
            new.humidity,
            at,
        )
    }

    pub fn is_fallback(&self) -> bool {
        self.id.starts_with(FALLBACK_ID_PREFIX)
    }

    pub fn sample(&self) -> HistorySample {
        HistorySample {
            temperature: self.temperature,
            humidity: self.humidity,
            timestamp: self.timestamp,
        }
    }
}

pub fn fallback_id() -> String {
    format!("{FALLBACK_ID_PREFIX}{}", Uuid::new_v4())
}

/// a validated create request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReading {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
}

impl NewReading {
    pub fn new(device_id: impl Into<String>, temperature: f64, humidity: f64) -> Self {
        Self {
            device_id: device_id.into(),
            temperature,
            humidity,
        }
    }
}

impl From<&Reading> for NewReading {
    fn from(reading: &Reading) -> Self {
        Self::new(reading.device_id.clone(), reading.temperature, reading.humidity)
    }
}

/// raw body of `POST /api/data`, before validation
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReadingRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
}

impl CreateReadingRequest {
    /// all three fields must be present; zero readings are fine, a blank
    /// device id is not
    pub fn validate(self) -> Option<NewReading> {
        let device_id = self.device_id.filter(|id| !id.is_empty())?;
        Some(NewReading {
            device_id,
            temperature: self.temperature?,
            humidity: self.humidity?,
        })
    }
}

/// body of `GET /api/data` and `GET /api/data/latest`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingsResponse {
    pub last_updated: DateTime<Utc>,
    pub data: Vec<Reading>,
}

/// body of `GET /api/data/status`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub simulation_active: bool,
    pub last_updated: DateTime<Utc>,
    pub devices: Vec<String>,
    pub deleted_devices: Vec<String>,
    /// generation period in milliseconds
    pub update_interval: u64,
}

/// body of `DELETE /api/data/:deviceId`, also produced locally by the client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_devices: Option<Vec<String>>,
}

impl DeleteResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            deleted_count: None,
            active_devices: None,
        }
    }
}

/// `{message}` error body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// one point of a device trend chart
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistorySample {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
}

/// newest reading per device, ordered by device id.
///
/// `readings` must be yielded oldest insertion first: on equal timestamps the
/// later-inserted reading wins.
pub fn latest_by_device<'a>(readings: impl IntoIterator<Item = &'a Reading>) -> Vec<Reading> {
    let mut latest: BTreeMap<&str, &Reading> = BTreeMap::new();
    for reading in readings {
        let newer = latest
            .get(reading.device_id.as_str())
            .map_or(true, |current| current.timestamp <= reading.timestamp);
        if newer {
            latest.insert(reading.device_id.as_str(), reading);
        }
    }
    latest.into_values().cloned().collect()
}
