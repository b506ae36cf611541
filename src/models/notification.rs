use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::ActorRole;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "role", content = "id")]
pub enum Audience {
    Customer(Uuid),
    Operator,
    Courier(Uuid),
}

impl Audience {
    pub fn role(&self) -> ActorRole {
        match self {
            Audience::Customer(_) => ActorRole::Customer,
            Audience::Operator => ActorRole::Operator,
            Audience::Courier(_) => ActorRole::Courier,
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Audience::Customer(id) => write!(f, "customer:{id}"),
            Audience::Operator => f.write_str("operator"),
            Audience::Courier(id) => write!(f, "courier:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OrderPlaced,
    OrderConfirmed,
    ReadyForPickup,
    OutForDelivery,
    Delivered,
    Cancelled,
    DeliveryRequest,
    DeliveryCode,
    CourierNearby,
    ManualAssignment,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::OrderPlaced => "order_placed",
            NotificationKind::OrderConfirmed => "order_confirmed",
            NotificationKind::ReadyForPickup => "ready_for_pickup",
            NotificationKind::OutForDelivery => "out_for_delivery",
            NotificationKind::Delivered => "delivered",
            NotificationKind::Cancelled => "cancelled",
            NotificationKind::DeliveryRequest => "delivery_request",
            NotificationKind::DeliveryCode => "delivery_code",
            NotificationKind::CourierNearby => "courier_nearby",
            NotificationKind::ManualAssignment => "manual_assignment",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub audience: Audience,
    pub kind: NotificationKind,
    pub message: String,
    pub priority: NotificationPriority,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub order_id: Option<Uuid>,
}

impl Notification {
    pub fn duplicates(&self, other: &Notification) -> bool {
        self.audience == other.audience && self.kind == other.kind && self.order_id == other.order_id
    }
}
