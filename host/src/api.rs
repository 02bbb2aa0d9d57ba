//! ==============================================================================
//! api.rs - readings rest api
//! ==============================================================================
//!
//! purpose:
//!     the http surface the dashboard polls. every handler that touches the
//!     store goes through `with_fallback`, so a broken database degrades the
//!     answers to in-memory data instead of failing the request.
//!     store calls run on the blocking pool before the fallback lock is
//!     taken, so a slow commit never stalls the readers.
//!
//! routes:
//!     GET    /                      liveness / endpoint listing
//!     POST   /api/data              store a reading
//!     GET    /api/data              up to 100 newest readings
//!     GET    /api/data/latest       newest reading per device
//!     GET    /api/data/status       generator status, never touches the store
//!     DELETE /api/data/:deviceId    drop a device and stop generating for it
//!
//! relationships:
//!     - uses: context.rs (store + fallback state), fallback.rs (with_fallback)
//!     - speaks: domain.rs (json shapes)
//!
//! ==============================================================================

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::context::SharedContext;
use crate::domain::{
    CreateReadingRequest, DeleteResponse, MessageResponse, Reading, ReadingsResponse,
    StatusResponse,
};
use crate::fallback::{log_store_error, with_fallback};

/// most readings `GET /api/data` returns from the store
pub const RECENT_LIMIT: usize = 100;

/// build the complete router
pub fn build_router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/api/data", get(list_readings).post(create_reading))
        .route("/api/data/", delete(delete_without_id))
        .route("/api/data/latest", get(latest_readings))
        .route("/api/data/status", get(simulation_status))
        .route("/api/data/:device_id", delete(delete_device))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(MessageResponse::new(message))).into_response()
}

/// GET /
async fn service_info(State(ctx): State<SharedContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "API is running",
        "status": "ok",
        "environment": ctx.environment,
        "endpoints": [
            { "method": "GET", "path": "/api/data", "description": "Get all device data" },
            { "method": "GET", "path": "/api/data/latest", "description": "Get latest data for each device" },
            { "method": "GET", "path": "/api/data/status", "description": "Get simulation status" },
            { "method": "POST", "path": "/api/data", "description": "Add new device data" },
            { "method": "DELETE", "path": "/api/data/:deviceId", "description": "Delete all data for a device" }
        ]
    }))
}

/// POST /api/data
async fn create_reading(
    State(ctx): State<SharedContext>,
    payload: Result<Json<CreateReadingRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(new) = request.validate() else {
        return bad_request("Please provide all required fields");
    };

    let now = Utc::now();
    if ctx.fallback.write().await.reactivate(&new.device_id) {
        info!(device_id = %new.device_id, "device reactivated");
    }

    let to_store = new.clone();
    let persisted = ctx
        .with_store(move |store| store.insert(&to_store, now))
        .await;
    let (reading, stored) = with_fallback(
        || persisted.map(|reading| (reading, true)),
        || (Reading::fallback(&new, now), false),
        log_store_error("create reading"),
    );

    let mut state = ctx.fallback.write().await;
    if !stored {
        state.push(reading.clone());
    }
    state.touch(now);

    (StatusCode::CREATED, Json(reading)).into_response()
}

/// GET /api/data
async fn list_readings(State(ctx): State<SharedContext>) -> Json<ReadingsResponse> {
    let persisted = ctx.with_store(|store| store.recent(RECENT_LIMIT)).await;
    let state = ctx.fallback.read().await;
    let data = with_fallback(
        || persisted,
        || state.sorted_desc(),
        log_store_error("list readings"),
    );
    Json(ReadingsResponse {
        last_updated: state.last_updated(),
        data,
    })
}

/// GET /api/data/latest
async fn latest_readings(State(ctx): State<SharedContext>) -> Json<ReadingsResponse> {
    let persisted = ctx.with_store(|store| store.latest_per_device()).await;
    let state = ctx.fallback.read().await;
    let data = with_fallback(
        || persisted,
        || state.latest_per_device(),
        log_store_error("latest readings"),
    );
    Json(ReadingsResponse {
        last_updated: state.last_updated(),
        data,
    })
}

/// GET /api/data/status
async fn simulation_status(State(ctx): State<SharedContext>) -> Json<StatusResponse> {
    let state = ctx.fallback.read().await;
    Json(StatusResponse {
        simulation_active: ctx.simulation_active(),
        last_updated: state.last_updated(),
        devices: state.active_devices(),
        deleted_devices: state.deleted_devices(),
        update_interval: ctx.update_interval.as_millis() as u64,
    })
}

/// DELETE /api/data/
async fn delete_without_id() -> Response {
    bad_request("Please provide a device ID")
}

/// DELETE /api/data/:deviceId
async fn delete_device(
    State(ctx): State<SharedContext>,
    Path(device_id): Path<String>,
) -> Response {
    if device_id.trim().is_empty() {
        return bad_request("Please provide a device ID");
    }

    ctx.fallback.write().await.mark_deleted(&device_id);

    let target = device_id.clone();
    let result = ctx
        .with_store(move |store| store.delete_device(&target))
        .await;
    let persisted = with_fallback(|| result, || 0, log_store_error("delete device"));

    let mut state = ctx.fallback.write().await;
    let buffered = state.remove_device(&device_id);
    let deleted_count = if persisted > 0 { persisted } else { buffered };

    if deleted_count == 0 {
        return (
            StatusCode::NOT_FOUND,
            Json(DeleteResponse::failure(format!(
                "No data found for device: {device_id}"
            ))),
        )
            .into_response();
    }

    let active_devices = state.active_devices();
    info!(%device_id, deleted_count, active = ?active_devices, "device deleted");

    Json(DeleteResponse {
        success: true,
        message: format!("Successfully deleted all data for device: {device_id}"),
        deleted_count: Some(deleted_count),
        active_devices: Some(active_devices),
    })
    .into_response()
}
