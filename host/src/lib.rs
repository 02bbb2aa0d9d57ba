//! telemetry-host: readings backend with in-memory fallback, a synthetic
//! data generator, and a polling client that mirrors the dashboard.

pub mod api;
pub mod client;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod fallback;
pub mod generator;
pub mod store;

pub use api::build_router;
pub use context::{AppContext, SharedContext};
pub use domain::{NewReading, Reading};
