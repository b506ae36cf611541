use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::location::TrackingSnapshot;
use crate::models::offer::MatchOffer;
use crate::models::order::{ActorRole, NewOrder, Order, OrderStatus};
use crate::models::otp::OtpReceipt;
use crate::state::AppState;
use crate::store::OrderFilter;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/transition", post(transition_order))
        .route("/orders/:id/accept", post(accept_order))
        .route("/orders/:id/assign", post(assign_order))
        .route("/orders/:id/complete", post(complete_order))
        .route("/orders/:id/otp", post(reissue_code))
        .route("/orders/:id/offer", get(get_offer))
        .route("/orders/:id/tracking", get(get_tracking))
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub status: Option<OrderStatus>,
    pub manual_assignment_required: Option<bool>,
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub to: OrderStatus,
    pub actor: ActorRole,
}

#[derive(Deserialize)]
pub struct CourierRequest {
    pub courier_id: Uuid,
}

#[derive(Deserialize)]
pub struct CompleteRequest {
    pub courier_id: Uuid,
    pub code: String,
}

#[derive(Deserialize)]
pub struct ReissueRequest {
    pub actor: ActorRole,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewOrder>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.create(payload).await?))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let filter = OrderFilter {
        status: query.status,
        manual_assignment_required: query.manual_assignment_required,
    };

    Ok(Json(state.orders.list(&filter)?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.get(id)?))
}

async fn transition_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<TransitionRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.transition(id, payload.to, payload.actor)?))
}

async fn accept_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.accept_offer(id, payload.courier_id)?))
}

async fn assign_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CourierRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(state.orders.assign(id, payload.courier_id)?))
}

async fn complete_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteRequest>,
) -> Result<Json<Order>, AppError> {
    Ok(Json(
        state
            .orders
            .complete(id, payload.courier_id, &payload.code)?,
    ))
}

async fn reissue_code(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ReissueRequest>,
) -> Result<Json<OtpReceipt>, AppError> {
    Ok(Json(state.orders.reissue_code(id, payload.actor)?))
}

async fn get_offer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<MatchOffer>, AppError> {
    state
        .coordinator
        .offer(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no open offer for order {id}")))
}

async fn get_tracking(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrackingSnapshot>, AppError> {
    state
        .tracker
        .snapshot(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("order {id} is not being tracked")))
}
