//! ==============================================================================
//! generator.rs - synthetic reading generator
//! ==============================================================================
//!
//! purpose:
//!     stands in for real sensors. every `simulation.interval_seconds` it
//!     synthesizes one reading per active device, writes it to the fallback
//!     buffer and then to the store (best effort).
//!
//! relationships:
//!     - spawned by: main.rs (serve)
//!     - uses: context.rs (store + fallback state)
//!
//! notes:
//!     the store write and the buffer write are independent, so a store that
//!     fails intermittently ends up holding a subset of what the buffer saw.
//!     nothing reconciles the two.
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::SharedContext;
use crate::domain::{fallback_id, NewReading, Reading};

/// Start the generator on the runtime. It stops when `shutdown` flips to true
/// or its sender is dropped.
pub fn spawn(ctx: SharedContext, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    ctx.set_simulation_active(true);
    tokio::spawn(run(ctx, shutdown))
}

async fn run(ctx: SharedContext, mut shutdown: watch::Receiver<bool>) {
    let period = ctx.update_interval;
    // first tick one full period after start
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = period.as_secs(), "started automatic data generation");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick(&ctx, Utc::now()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    ctx.set_simulation_active(false);
    info!("data generation stopped");
}

/// One generation round at time `now`. Returns the readings pushed to the
/// fallback buffer.
///
/// The buffer is updated under one write-lock scope; persistence follows on
/// the blocking pool once the lock is released.
pub async fn tick(ctx: &SharedContext, now: DateTime<Utc>) -> Vec<Reading> {
    let readings: Vec<Reading> = {
        let mut state = ctx.fallback.write().await;
        state.touch(now);

        let devices = state.active_devices();
        if devices.is_empty() {
            info!("no active devices to generate data for");
            return Vec::new();
        }

        let readings: Vec<Reading> = {
            let mut rng = rand::thread_rng();
            devices
                .iter()
                .map(|device_id| synthesize(device_id, now, &mut rng))
                .collect()
        };
        for reading in &readings {
            state.push(reading.clone());
        }
        debug!(buffered = state.len(), "fallback buffer size");
        readings
    };

    let batch: Vec<NewReading> = readings.iter().map(NewReading::from).collect();
    let persisted = ctx
        .with_store(move |store| {
            Ok(batch
                .iter()
                .map(|reading| (reading.device_id.clone(), store.insert(reading, now)))
                .collect::<Vec<_>>())
        })
        .await;
    match persisted {
        Ok(results) => {
            for (device_id, result) in results {
                if let Err(e) = result {
                    warn!(%device_id, error = %e, "failed to persist generated reading");
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to persist generated readings"),
    }

    info!(devices = readings.len(), at = %now.to_rfc3339(), "generated new readings");
    readings
}

/// A plausible indoor sample: temperature in [20, 30), humidity in [40, 60),
/// both cut to one decimal.
pub fn synthesize(device_id: &str, at: DateTime<Utc>, rng: &mut impl Rng) -> Reading {
    let temperature = one_decimal(rng.gen_range(20.0..30.0));
    let humidity = one_decimal(rng.gen_range(40.0..60.0));
    Reading::new(fallback_id(), device_id, temperature, humidity, at)
}

/// truncates rather than rounds, so the upper bound stays exclusive
fn one_decimal(value: f64) -> f64 {
    (value * 10.0).floor() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::context::AppContext;
    use crate::fallback::FALLBACK_CAPACITY;
    use crate::store::{RedbStore, ReadingStore, UnavailableStore};
    use std::sync::Arc;

    fn context_with(store: Arc<dyn ReadingStore>) -> SharedContext {
        AppContext::new(store, &HostConfig::default()).shared()
    }

    #[test]
    fn synthesized_values_stay_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..1_000 {
            let r = synthesize("d1", Utc::now(), &mut rng);
            assert!((20.0..30.0).contains(&r.temperature), "temperature {}", r.temperature);
            assert!((40.0..60.0).contains(&r.humidity), "humidity {}", r.humidity);
            assert_eq!(r.temperature, one_decimal(r.temperature));
        }
    }

    #[tokio::test]
    async fn tick_generates_one_reading_per_active_device() {
        let store = Arc::new(RedbStore::open_in_memory().unwrap());
        let ctx = context_with(store.clone());
        let now = Utc::now();

        let generated = tick(&ctx, now).await;
        assert_eq!(generated.len(), 3);
        assert!(generated.iter().all(|r| r.timestamp == now));

        let state = ctx.fallback.read().await;
        assert_eq!(state.len(), 3 + 3);
        assert_eq!(state.last_updated(), now);
        drop(state);

        assert_eq!(store.recent(100).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn tick_skips_deleted_devices() {
        let ctx = context_with(Arc::new(RedbStore::open_in_memory().unwrap()));
        ctx.fallback.write().await.mark_deleted("device002");

        let generated = tick(&ctx, Utc::now()).await;
        let ids: Vec<_> = generated.iter().map(|r| r.device_id.as_str()).collect();
        assert_eq!(ids, vec!["device001", "device003"]);
    }

    #[tokio::test]
    async fn tick_with_no_active_devices_only_touches_timestamp() {
        let ctx = context_with(Arc::new(RedbStore::open_in_memory().unwrap()));
        {
            let mut state = ctx.fallback.write().await;
            for id in ["device001", "device002", "device003"] {
                state.mark_deleted(id);
            }
        }
        let now = Utc::now();

        assert!(tick(&ctx, now).await.is_empty());
        let state = ctx.fallback.read().await;
        assert_eq!(state.len(), 3);
        assert_eq!(state.last_updated(), now);
    }

    #[tokio::test]
    async fn tick_still_buffers_when_store_is_down() {
        let ctx = context_with(Arc::new(UnavailableStore::new("offline")));
        tick(&ctx, Utc::now()).await;
        assert_eq!(ctx.fallback.read().await.len(), 6);
    }

    #[tokio::test]
    async fn buffer_never_exceeds_capacity() {
        let ctx = context_with(Arc::new(UnavailableStore::new("offline")));
        for _ in 0..50 {
            tick(&ctx, Utc::now()).await;
            assert!(ctx.fallback.read().await.len() <= FALLBACK_CAPACITY);
        }
        assert_eq!(ctx.fallback.read().await.len(), FALLBACK_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_generator_ticks_and_stops() {
        let ctx = context_with(Arc::new(UnavailableStore::new("offline")));
        let (tx, rx) = watch::channel(false);

        let handle = spawn(ctx.clone(), rx);
        assert!(ctx.simulation_active());

        // no tick before the first full period
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(ctx.fallback.read().await.len(), 3);

        tokio::time::sleep(std::time::Duration::from_secs(6)).await;
        assert_eq!(ctx.fallback.read().await.len(), 6);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!ctx.simulation_active());
    }
}
