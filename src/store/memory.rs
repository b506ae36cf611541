//! In-process [`Store`] backed by `DashMap`s.
//!
//! Row-level atomicity comes from holding a shard write guard for the duration of each
//! conditional write. `claim_courier` is the only operation that touches two rows; it always
//! locks the order row before the courier row.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use super::{
    AppendOutcome, ClaimOutcome, CourierFilter, OrderChange, OrderFilter, Store, UpdateOutcome,
};
use crate::error::StoreError;
use crate::models::courier::{Courier, CourierPosition};
use crate::models::notification::{Audience, Notification};
use crate::models::order::{Order, OrderStatus};
use crate::models::otp::OtpRecord;

#[derive(Debug, Default)]
pub struct MemoryStore {
    orders: DashMap<Uuid, Order>,
    couriers: DashMap<Uuid, Courier>,
    otp_records: DashMap<Uuid, OtpRecord>,
    notifications: DashMap<Audience, VecDeque<Notification>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        if self.orders.contains_key(&order.id) {
            return Err(StoreError::Conflict(format!("order {} already exists", order.id)));
        }
        self.orders.insert(order.id, order);
        Ok(())
    }

    fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|order| order.created_at);
        Ok(orders)
    }

    fn update_order(
        &self,
        id: Uuid,
        expected: OrderStatus,
        change: OrderChange,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Order>, StoreError> {
        let Some(mut order) = self.orders.get_mut(&id) else {
            return Ok(UpdateOutcome::Missing);
        };

        if order.status != expected {
            return Ok(UpdateOutcome::PreconditionFailed(order.clone()));
        }

        match change {
            OrderChange::Transition { to } => {
                if to.requires_courier() != order.assigned_courier_id.is_some() {
                    return Ok(UpdateOutcome::PreconditionFailed(order.clone()));
                }
                order.status = to;
            }
            OrderChange::Cancel => {
                order.status = OrderStatus::Cancelled;
                order.assigned_courier_id = None;
                order.manual_assignment_required = false;
            }
            OrderChange::FlagManualAssignment => {
                order.manual_assignment_required = true;
            }
        }
        order.updated_at = at;

        Ok(UpdateOutcome::Applied(order.clone()))
    }

    fn insert_courier(&self, courier: Courier) -> Result<(), StoreError> {
        if self.couriers.contains_key(&courier.id) {
            return Err(StoreError::Conflict(format!(
                "courier {} already exists",
                courier.id
            )));
        }
        self.couriers.insert(courier.id, courier);
        Ok(())
    }

    fn get_courier(&self, id: Uuid) -> Result<Option<Courier>, StoreError> {
        Ok(self.couriers.get(&id).map(|entry| entry.value().clone()))
    }

    fn list_couriers(&self, filter: &CourierFilter) -> Result<Vec<Courier>, StoreError> {
        let mut couriers: Vec<Courier> = self
            .couriers
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        couriers.sort_by_key(|courier| courier.created_at);
        Ok(couriers)
    }

    fn set_courier_available(
        &self,
        id: Uuid,
        available: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Courier>, StoreError> {
        let Some(mut courier) = self.couriers.get_mut(&id) else {
            return Ok(None);
        };

        courier.available = available;
        courier.updated_at = at;
        Ok(Some(courier.clone()))
    }

    fn update_courier_position(
        &self,
        id: Uuid,
        position: CourierPosition,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Courier>, StoreError> {
        let Some(mut courier) = self.couriers.get_mut(&id) else {
            return Ok(UpdateOutcome::Missing);
        };

        let is_older = courier
            .position
            .as_ref()
            .is_some_and(|current| current.recorded_at > position.recorded_at);
        if is_older {
            return Ok(UpdateOutcome::PreconditionFailed(courier.clone()));
        }

        courier.position = Some(position);
        courier.updated_at = at;
        Ok(UpdateOutcome::Applied(courier.clone()))
    }

    fn claim_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let Some(mut order) = self.orders.get_mut(&order_id) else {
            return Ok(ClaimOutcome::OrderMissing);
        };

        if let Some(by) = order.assigned_courier_id {
            return Ok(ClaimOutcome::AlreadyClaimed {
                order: order.clone(),
                by,
            });
        }
        if order.status != OrderStatus::ReadyForPickup {
            return Ok(ClaimOutcome::OrderNotReady {
                status: order.status,
            });
        }

        let Some(mut courier) = self.couriers.get_mut(&courier_id) else {
            return Ok(ClaimOutcome::CourierMissing);
        };

        if let Some(active_order_id) = courier.active_order_id {
            return Ok(ClaimOutcome::CourierBusy { active_order_id });
        }
        if !courier.available {
            return Ok(ClaimOutcome::CourierUnavailable);
        }

        order.assigned_courier_id = Some(courier_id);
        order.status = OrderStatus::OutForDelivery;
        order.manual_assignment_required = false;
        order.updated_at = at;

        courier.active_order_id = Some(order_id);
        courier.available = false;
        courier.updated_at = at;

        Ok(ClaimOutcome::Claimed {
            order: order.clone(),
            courier: courier.clone(),
        })
    }

    fn release_courier(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
        available: bool,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Courier>, StoreError> {
        let Some(mut courier) = self.couriers.get_mut(&courier_id) else {
            return Ok(UpdateOutcome::Missing);
        };

        if courier.active_order_id != Some(order_id) {
            return Ok(UpdateOutcome::PreconditionFailed(courier.clone()));
        }

        courier.active_order_id = None;
        courier.available = available;
        courier.updated_at = at;
        Ok(UpdateOutcome::Applied(courier.clone()))
    }

    fn insert_otp_if_absent(
        &self,
        record: OtpRecord,
    ) -> Result<UpdateOutcome<OtpRecord>, StoreError> {
        match self.otp_records.entry(record.order_id) {
            Entry::Occupied(existing) => {
                Ok(UpdateOutcome::PreconditionFailed(existing.get().clone()))
            }
            Entry::Vacant(slot) => Ok(UpdateOutcome::Applied(slot.insert(record).value().clone())),
        }
    }

    fn get_otp(&self, order_id: Uuid) -> Result<Option<OtpRecord>, StoreError> {
        Ok(self
            .otp_records
            .get(&order_id)
            .map(|entry| entry.value().clone()))
    }

    fn delete_otp(&self, order_id: Uuid) -> Result<(), StoreError> {
        self.otp_records.remove(&order_id);
        Ok(())
    }

    fn compare_and_swap_otp(
        &self,
        expected: &OtpRecord,
        next: OtpRecord,
    ) -> Result<UpdateOutcome<OtpRecord>, StoreError> {
        let Some(mut current) = self.otp_records.get_mut(&expected.order_id) else {
            return Ok(UpdateOutcome::Missing);
        };

        if *current != *expected {
            return Ok(UpdateOutcome::PreconditionFailed(current.clone()));
        }

        *current = next;
        Ok(UpdateOutcome::Applied(current.clone()))
    }

    fn append_notification(
        &self,
        notification: Notification,
        dedup_since: Option<DateTime<Utc>>,
        cap: usize,
    ) -> Result<AppendOutcome, StoreError> {
        let mut feed = self.notifications.entry(notification.audience).or_default();

        let duplicate = dedup_since.and_then(|since| {
            feed.iter().rev().find(|existing| {
                !existing.read && existing.created_at >= since && existing.duplicates(&notification)
            })
        });
        if let Some(existing) = duplicate {
            return Ok(AppendOutcome::Collapsed(existing.clone()));
        }

        feed.push_back(notification.clone());
        while feed.len() > cap {
            feed.pop_front();
        }

        Ok(AppendOutcome::Appended(notification))
    }

    fn notifications_for(&self, audience: Audience) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .notifications
            .get(&audience)
            .map(|feed| feed.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn mark_notification_read(&self, audience: Audience, id: Uuid) -> Result<bool, StoreError> {
        let Some(mut feed) = self.notifications.get_mut(&audience) else {
            return Ok(false);
        };

        match feed.iter_mut().find(|notification| notification.id == id) {
            Some(notification) => {
                notification.read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
