use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::{CourierPosition, GeoPoint};

/// One position observation. Samples are never mutated after ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSample {
    pub courier_id: Uuid,
    pub order_id: Option<Uuid>,
    pub point: GeoPoint,
    pub recorded_at: DateTime<Utc>,
    pub speed_kmh: Option<f64>,
    pub heading_deg: Option<f64>,
    pub accuracy_m: Option<f64>,
}

impl LocationSample {
    pub fn position(&self) -> CourierPosition {
        CourierPosition {
            point: self.point,
            recorded_at: self.recorded_at,
            speed_kmh: self.speed_kmh,
            heading_deg: self.heading_deg,
            accuracy_m: self.accuracy_m,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeedSource {
    Reported,
    RollingAverage,
    Fallback,
}

/// Freshness of a courier's position feed. A stale feed keeps its last ETA but marks it untrusted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum FeedHealth {
    NoSignal,
    Live,
    Stale { silent_secs: i64 },
}

impl FeedHealth {
    pub fn is_trustworthy(&self) -> bool {
        matches!(self, FeedHealth::Live)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingSnapshot {
    pub order_id: Uuid,
    pub courier_id: Uuid,
    pub target: Option<GeoPoint>,
    pub distance_km: Option<f64>,
    pub eta_minutes: Option<f64>,
    pub bearing_deg: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub speed_source: Option<SpeedSource>,
    pub feed: FeedHealth,
    pub eta_reliable: bool,
    pub arrived: bool,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub trail: Vec<LocationSample>,
}
