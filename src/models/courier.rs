use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Latest known fix for a courier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourierPosition {
    pub point: GeoPoint,
    pub recorded_at: DateTime<Utc>,
    pub speed_kmh: Option<f64>,
    pub heading_deg: Option<f64>,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Courier {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub available: bool,
    pub position: Option<CourierPosition>,
    pub active_order_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Courier {
    /// Couriers holding an order are never offered another one.
    pub fn is_matchable(&self) -> bool {
        self.available && self.active_order_id.is_none() && self.position.is_some()
    }
}
