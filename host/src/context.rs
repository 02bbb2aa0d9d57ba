//! Server-lifetime context shared by the api handlers and the generator.
//!
//! Cloned around as `Arc<AppContext>`; the mutable fallback state sits behind
//! a tokio `RwLock` (readers: list/latest/status, writers: create/delete and
//! generator ticks). Store calls go through `with_store` and are never made
//! while that lock is held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::config::HostConfig;
use crate::error::{StoreError, StoreResult};
use crate::fallback::FallbackState;
use crate::store::ReadingStore;

pub type SharedContext = Arc<AppContext>;

pub struct AppContext {
    pub store: Arc<dyn ReadingStore>,
    pub fallback: RwLock<FallbackState>,
    /// generator period, reported by the status endpoint
    pub update_interval: Duration,
    pub environment: String,
    simulation_active: AtomicBool,
}

impl AppContext {
    pub fn new(store: Arc<dyn ReadingStore>, config: &HostConfig) -> Self {
        Self {
            store,
            fallback: RwLock::new(FallbackState::seeded(
                config.simulation.devices.clone(),
                Utc::now(),
            )),
            update_interval: config.simulation.interval(),
            environment: config.server.environment.clone(),
            simulation_active: AtomicBool::new(false),
        }
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(self)
    }

    /// Run a store call on the blocking pool; redb transactions block the
    /// calling thread.
    pub async fn with_store<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce(&dyn ReadingStore) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || operation(store.as_ref()))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// true once the generator task has been started
    pub fn simulation_active(&self) -> bool {
        self.simulation_active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_simulation_active(&self, active: bool) {
        self.simulation_active.store(active, Ordering::SeqCst);
    }
}
