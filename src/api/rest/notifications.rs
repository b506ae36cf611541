use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::notification::{Audience, Notification};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/notifications/operator", get(operator_feed))
        .route("/notifications/operator/:id/read", post(mark_operator_read))
        .route("/notifications/customer/:owner", get(customer_feed))
        .route("/notifications/customer/:owner/:id/read", post(mark_customer_read))
        .route("/notifications/courier/:owner", get(courier_feed))
        .route("/notifications/courier/:owner/:id/read", post(mark_courier_read))
}

async fn operator_feed(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Notification>>, AppError> {
    Ok(Json(state.dispatcher.feed(Audience::Operator)?))
}

async fn customer_feed(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<Uuid>,
) -> Result<Json<Vec<Notification>>, AppError> {
    Ok(Json(state.dispatcher.feed(Audience::Customer(owner))?))
}

async fn courier_feed(
    State(state): State<Arc<AppState>>,
    Path(owner): Path<Uuid>,
) -> Result<Json<Vec<Notification>>, AppError> {
    Ok(Json(state.dispatcher.feed(Audience::Courier(owner))?))
}

async fn mark_operator_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.dispatcher.mark_read(Audience::Operator, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_customer_read(
    State(state): State<Arc<AppState>>,
    Path((owner, id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.dispatcher.mark_read(Audience::Customer(owner), id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_courier_read(
    State(state): State<Arc<AppState>>,
    Path((owner, id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    state.dispatcher.mark_read(Audience::Courier(owner), id)?;
    Ok(StatusCode::NO_CONTENT)
}
