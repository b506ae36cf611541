use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub courier_id: Uuid,
    pub distance_km: f64,
}

/// Ephemeral broadcast of a ready order to nearby couriers. Lives only for the matching window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchOffer {
    pub order_id: Uuid,
    pub origin: GeoPoint,
    pub radius_km: f64,
    pub attempt: u32,
    pub candidates: Vec<Candidate>,
    /// Every courier offered this order across all rounds.
    pub offered_to: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub first_broadcast_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub accepted_by: Option<Uuid>,
}

impl MatchOffer {
    pub fn was_offered_to(&self, courier_id: Uuid) -> bool {
        self.offered_to.contains(&courier_id)
    }

    pub fn is_open(&self) -> bool {
        self.accepted_by.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TimeoutOutcome {
    /// The offer is still inside its window or already resolved.
    NotDue,
    Rebroadcast { attempt: u32, radius_km: f64, candidates: usize },
    ManualAssignment { attempts: u32 },
}
