//! Port onto the hosted table store.
//!
//! The delivery core assumes nothing beyond row-level create/read, filtered lists and
//! conditional ("update where current value matches") writes. Every mutation that can race
//! across actor sessions is expressed as one of the conditional operations below, never as
//! a read followed by an unconditional write.

pub mod memory;
#[cfg(test)]
pub mod testing;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::courier::{Courier, CourierPosition, GeoPoint};
use crate::models::notification::{Audience, Notification};
use crate::models::order::{Order, OrderStatus};
use crate::models::otp::OtpRecord;

pub use memory::MemoryStore;

#[derive(Debug, Clone)]
pub enum OrderChange {
    Transition { to: OrderStatus },
    /// Moves to `cancelled` and unbinds any courier in the same write.
    Cancel,
    FlagManualAssignment,
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome<T> {
    Applied(T),
    PreconditionFailed(T),
    Missing,
}

#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed { order: Order, courier: Courier },
    AlreadyClaimed { order: Order, by: Uuid },
    OrderNotReady { status: OrderStatus },
    CourierBusy { active_order_id: Uuid },
    CourierUnavailable,
    OrderMissing,
    CourierMissing,
}

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Appended(Notification),
    Collapsed(Notification),
}

#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub manual_assignment_required: Option<bool>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.status.is_none_or(|status| order.status == status)
            && self
                .manual_assignment_required
                .is_none_or(|flag| order.manual_assignment_required == flag)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CourierFilter {
    /// Only couriers with `available = true` and no active order.
    pub matchable_only: bool,
    /// Coarse bounding-box prefilter; exact distance is computed by the caller.
    pub near: Option<(GeoPoint, f64)>,
}

impl CourierFilter {
    pub fn matches(&self, courier: &Courier) -> bool {
        if self.matchable_only && !courier.is_matchable() {
            return false;
        }

        match (&self.near, &courier.position) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((center, radius_km)), Some(position)) => {
                within_bounding_box(center, *radius_km, &position.point)
            }
        }
    }
}

fn within_bounding_box(center: &GeoPoint, radius_km: f64, point: &GeoPoint) -> bool {
    const KM_PER_DEGREE: f64 = 111.32;

    let lat_span = radius_km / KM_PER_DEGREE;
    let lng_span = radius_km / (KM_PER_DEGREE * center.lat.to_radians().cos().abs().max(0.01));

    (point.lat - center.lat).abs() <= lat_span && (point.lng - center.lng).abs() <= lng_span
}

pub trait Store: Send + Sync {
    fn insert_order(&self, order: Order) -> Result<(), StoreError>;
    fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;
    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;
    fn update_order(
        &self,
        id: Uuid,
        expected: OrderStatus,
        change: OrderChange,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Order>, StoreError>;

    fn insert_courier(&self, courier: Courier) -> Result<(), StoreError>;
    fn get_courier(&self, id: Uuid) -> Result<Option<Courier>, StoreError>;
    fn list_couriers(&self, filter: &CourierFilter) -> Result<Vec<Courier>, StoreError>;
    fn set_courier_available(
        &self,
        id: Uuid,
        available: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Courier>, StoreError>;
    /// Applies only when `position` is newer than the stored one.
    fn update_courier_position(
        &self,
        id: Uuid,
        position: CourierPosition,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Courier>, StoreError>;

    /// Binds courier and order in one conditional write.
    fn claim_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;
    /// Clears `active_order_id` only while it still points at `order_id`.
    fn release_courier(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
        available: bool,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Courier>, StoreError>;

    /// Writes `record` only if the order has no code yet; otherwise returns the stored one
    /// as `PreconditionFailed`.
    fn insert_otp_if_absent(
        &self,
        record: OtpRecord,
    ) -> Result<UpdateOutcome<OtpRecord>, StoreError>;
    fn get_otp(&self, order_id: Uuid) -> Result<Option<OtpRecord>, StoreError>;
    fn delete_otp(&self, order_id: Uuid) -> Result<(), StoreError>;
    /// Writes `next` only if the stored record still equals `expected`.
    fn compare_and_swap_otp(
        &self,
        expected: &OtpRecord,
        next: OtpRecord,
    ) -> Result<UpdateOutcome<OtpRecord>, StoreError>;

    /// Appends to the audience feed unless an unread duplicate newer than `dedup_since`
    /// exists; trims the feed to `cap` entries. `None` disables de-duplication.
    fn append_notification(
        &self,
        notification: Notification,
        dedup_since: Option<DateTime<Utc>>,
        cap: usize,
    ) -> Result<AppendOutcome, StoreError>;
    fn notifications_for(&self, audience: Audience) -> Result<Vec<Notification>, StoreError>;
    fn mark_notification_read(&self, audience: Audience, id: Uuid) -> Result<bool, StoreError>;
}
