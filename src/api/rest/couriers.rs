use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::tracker::SampleInput;
use crate::error::AppError;
use crate::geo::is_valid_point;
use crate::models::courier::{Courier, CourierPosition, GeoPoint};
use crate::models::location::TrackingSnapshot;
use crate::state::AppState;
use crate::store::CourierFilter;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", post(create_courier).get(list_couriers))
        .route("/couriers/:id", get(get_courier))
        .route("/couriers/:id/availability", patch(update_availability))
        .route("/couriers/:id/location", post(ingest_location))
}

#[derive(Deserialize)]
pub struct CreateCourierRequest {
    pub name: String,
    pub phone: Option<String>,
    pub location: Option<GeoPoint>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ListCouriersQuery {
    pub available: Option<bool>,
}

#[derive(Deserialize)]
pub struct AvailabilityRequest {
    pub available: bool,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub courier_id: Uuid,
    pub tracking: Option<TrackingSnapshot>,
}

async fn create_courier(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCourierRequest>,
) -> Result<Json<Courier>, AppError> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("name cannot be empty".to_string()));
    }

    if let Some(point) = &payload.location {
        if !is_valid_point(point) {
            return Err(AppError::BadRequest("location is out of range".to_string()));
        }
    }

    let now = state.clock.now();
    let courier = Courier {
        id: Uuid::new_v4(),
        name: payload.name.trim().to_string(),
        phone: payload.phone.filter(|phone| !phone.trim().is_empty()),
        available: payload.available,
        position: payload.location.map(|point| CourierPosition {
            point,
            recorded_at: now,
            speed_kmh: None,
            heading_deg: None,
            accuracy_m: None,
        }),
        active_order_id: None,
        created_at: now,
        updated_at: now,
    };

    state.store.insert_courier(courier.clone())?;
    info!(courier_id = %courier.id, "courier registered");

    Ok(Json(courier))
}

async fn list_couriers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListCouriersQuery>,
) -> Result<Json<Vec<Courier>>, AppError> {
    let mut couriers: Vec<Courier> = state
        .store
        .list_couriers(&CourierFilter::default())?
        .into_iter()
        .filter(|courier| query.available.is_none_or(|flag| courier.available == flag))
        .collect();
    couriers.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(couriers))
}

async fn get_courier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Courier>, AppError> {
    state
        .store
        .get_courier(id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("courier {id} not found")))
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AvailabilityRequest>,
) -> Result<Json<Courier>, AppError> {
    let courier = state
        .store
        .set_courier_available(id, payload.available, state.clock.now())?
        .ok_or_else(|| AppError::NotFound(format!("courier {id} not found")))?;

    info!(courier_id = %id, available = payload.available, "courier availability changed");
    Ok(Json(courier))
}

async fn ingest_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<SampleInput>,
) -> Result<Json<IngestResponse>, AppError> {
    let tracking = state.tracker.ingest(id, payload)?;

    Ok(Json(IngestResponse {
        courier_id: id,
        tracking,
    }))
}
