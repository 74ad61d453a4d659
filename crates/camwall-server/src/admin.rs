//! Admin HTTP API: health, readiness, metrics and slot management
//!
//! No authentication; bind it to loopback (the default) or a trusted network.

use std::net::IpAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, Router},
    Json,
};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use camwall_core::slots::SlotSnapshot;
use camwall_core::{ImageDescriptor, IngestMetrics, SlotError, SlotId, SlotTable};

#[derive(Clone)]
pub struct AdminState {
    pub table: Arc<SlotTable>,
    pub metrics: Arc<IngestMetrics>,
}

/// Admin API server
pub struct AdminApi {
    state: AdminState,
}

impl AdminApi {
    pub fn new(table: Arc<SlotTable>, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            state: AdminState { table, metrics },
        }
    }

    /// Create admin API router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/slots", get(list_slots))
            .route("/slots/:id", get(get_slot).delete(evict_slot))
            .with_state(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }
}

/// Health check handler
async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 while a slot is free, 503 when every slot is taken
async fn ready_handler(State(state): State<AdminState>) -> StatusCode {
    if state.table.is_full() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

/// Metrics export handler
async fn metrics_handler(State(state): State<AdminState>) -> Response {
    match state.metrics.export() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Metrics export failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// List every slot, free ones included
async fn list_slots(State(state): State<AdminState>) -> Json<ListSlotsResponse> {
    let slots: Vec<SlotInfo> = state.table.snapshot().iter().map(SlotInfo::from).collect();
    let occupied = slots.iter().filter(|s| s.occupied).count();

    Json(ListSlotsResponse {
        capacity: slots.len(),
        occupied,
        slots,
    })
}

async fn get_slot(
    State(state): State<AdminState>,
    Path(id): Path<SlotId>,
) -> Result<Json<SlotInfo>, StatusCode> {
    state
        .table
        .snapshot()
        .get(id)
        .map(|slot| Json(SlotInfo::from(slot)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Forcibly end the session holding a slot
async fn evict_slot(
    State(state): State<AdminState>,
    Path(id): Path<SlotId>,
) -> Result<Json<EvictResponse>, StatusCode> {
    match state.table.evict(id) {
        Ok(address) => {
            state.metrics.record_eviction();
            info!(slot = id, peer = %address, "Admin API: evicted slot");
            Ok(Json(EvictResponse {
                slot_id: id,
                address,
                message: format!("Slot {} evicted", id),
            }))
        }
        Err(SlotError::UnknownSlot(_)) => Err(StatusCode::NOT_FOUND),
        Err(SlotError::SlotFree(_)) => Err(StatusCode::CONFLICT),
        Err(e) => {
            warn!("Admin API: evict failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Aggregate ingest statistics
async fn stats_handler(State(state): State<AdminState>) -> Json<IngestStats> {
    let metrics = &state.metrics;
    Json(IngestStats {
        capacity: state.table.capacity(),
        occupied: state.table.occupied(),
        connections_accepted: metrics.connections_accepted(),
        connections_rejected: metrics.connections_rejected(),
        evictions: metrics.evictions(),
        invalid_headers: metrics.invalid_headers(),
        idle_timeouts: metrics.idle_timeouts(),
        frames_decoded: metrics.frames_decoded(),
        bytes_received: metrics.bytes_received(),
        average_ingest_bps: metrics.average_ingest_rate(),
        uptime_seconds: metrics.uptime().as_secs(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListSlotsResponse {
    pub capacity: usize,
    pub occupied: usize,
    pub slots: Vec<SlotInfo>,
}

#[derive(Debug, Serialize)]
pub struct SlotInfo {
    pub slot_id: SlotId,
    pub occupied: bool,
    pub address: Option<IpAddr>,
    pub descriptor: Option<ImageDescriptor>,
    pub frames: u64,
    pub connected_ms: Option<u64>,
    pub last_frame_age_ms: Option<u64>,
}

impl From<&SlotSnapshot> for SlotInfo {
    fn from(slot: &SlotSnapshot) -> Self {
        let occupant = slot.occupant.as_ref();
        Self {
            slot_id: slot.slot_id,
            occupied: occupant.is_some(),
            address: occupant.map(|o| o.address),
            descriptor: occupant.and_then(|o| o.descriptor),
            frames: occupant.map_or(0, |o| o.frames),
            connected_ms: occupant.map(|o| o.connected_for.as_millis() as u64),
            last_frame_age_ms: occupant
                .and_then(|o| o.last_frame_age)
                .map(|age| age.as_millis() as u64),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EvictResponse {
    pub slot_id: SlotId,
    pub address: IpAddr,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct IngestStats {
    pub capacity: usize,
    pub occupied: usize,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub evictions: u64,
    pub invalid_headers: u64,
    pub idle_timeouts: u64,
    pub frames_decoded: u64,
    pub bytes_received: u64,
    pub average_ingest_bps: u64,
    pub uptime_seconds: u64,
}
