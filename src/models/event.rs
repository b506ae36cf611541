use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::{ActorRole, OrderStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub actor_role: ActorRole,
    /// Courier bound to the order when the transition committed, if any.
    pub courier_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

/// Everything the core announces. Consumers re-read the order rather than trusting event order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DeliveryEvent {
    OrderPlaced {
        order_id: Uuid,
        at: DateTime<Utc>,
    },
    StatusChanged(TransitionEvent),
    DeliveryRequest {
        order_id: Uuid,
        courier_ids: Vec<Uuid>,
        radius_km: f64,
        attempt: u32,
        at: DateTime<Utc>,
    },
    DeliveryCodeIssued {
        order_id: Uuid,
        code: String,
        expires_at: DateTime<Utc>,
    },
    CourierNearby {
        order_id: Uuid,
        courier_id: Uuid,
        distance_m: f64,
        at: DateTime<Utc>,
    },
    ManualAssignmentRequired {
        order_id: Uuid,
        attempts: u32,
        at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            DeliveryEvent::OrderPlaced { order_id, .. }
            | DeliveryEvent::DeliveryRequest { order_id, .. }
            | DeliveryEvent::DeliveryCodeIssued { order_id, .. }
            | DeliveryEvent::CourierNearby { order_id, .. }
            | DeliveryEvent::ManualAssignmentRequired { order_id, .. } => *order_id,
            DeliveryEvent::StatusChanged(event) => event.order_id,
        }
    }

    /// Copy safe to fan out on the public event stream; delivery codes are redacted.
    pub fn redacted(&self) -> DeliveryEvent {
        match self {
            DeliveryEvent::DeliveryCodeIssued {
                order_id,
                expires_at,
                ..
            } => DeliveryEvent::DeliveryCodeIssued {
                order_id: *order_id,
                code: String::new(),
                expires_at: *expires_at,
            },
            other => other.clone(),
        }
    }
}
