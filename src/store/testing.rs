//! Store wrapper for interleaving tests: runs a one-shot hook against the backing store
//! right before selected calls, so a competing write lands mid-operation.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    AppendOutcome, ClaimOutcome, CourierFilter, MemoryStore, OrderChange, OrderFilter, Store,
    UpdateOutcome,
};
use crate::error::StoreError;
use crate::models::courier::{Courier, CourierPosition};
use crate::models::notification::{Audience, Notification};
use crate::models::order::{Order, OrderStatus};
use crate::models::otp::OtpRecord;

type Hook = Box<dyn FnOnce(&MemoryStore) + Send>;

pub struct InterleavedStore {
    inner: Arc<MemoryStore>,
    before_otp_write: Mutex<Option<Hook>>,
    before_list_couriers: Mutex<Option<Hook>>,
}

impl InterleavedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            before_otp_write: Mutex::new(None),
            before_list_couriers: Mutex::new(None),
        }
    }

    /// Runs `hook` before the next conditional delivery-code write.
    pub fn before_otp_write(&self, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.before_otp_write.lock().expect("lock") = Some(Box::new(hook));
    }

    /// Runs `hook` before the next courier listing.
    pub fn before_list_couriers(&self, hook: impl FnOnce(&MemoryStore) + Send + 'static) {
        *self.before_list_couriers.lock().expect("lock") = Some(Box::new(hook));
    }

    fn fire(&self, slot: &Mutex<Option<Hook>>) {
        let hook = slot.lock().expect("lock").take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
    }
}

impl Store for InterleavedStore {
    fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        self.inner.insert_order(order)
    }

    fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        self.inner.get_order(id)
    }

    fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        self.inner.list_orders(filter)
    }

    fn update_order(
        &self,
        id: Uuid,
        expected: OrderStatus,
        change: OrderChange,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Order>, StoreError> {
        self.inner.update_order(id, expected, change, at)
    }

    fn insert_courier(&self, courier: Courier) -> Result<(), StoreError> {
        self.inner.insert_courier(courier)
    }

    fn get_courier(&self, id: Uuid) -> Result<Option<Courier>, StoreError> {
        self.inner.get_courier(id)
    }

    fn list_couriers(&self, filter: &CourierFilter) -> Result<Vec<Courier>, StoreError> {
        self.fire(&self.before_list_couriers);
        self.inner.list_couriers(filter)
    }

    fn set_courier_available(
        &self,
        id: Uuid,
        available: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Courier>, StoreError> {
        self.inner.set_courier_available(id, available, at)
    }

    fn update_courier_position(
        &self,
        id: Uuid,
        position: CourierPosition,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Courier>, StoreError> {
        self.inner.update_courier_position(id, position, at)
    }

    fn claim_courier(
        &self,
        order_id: Uuid,
        courier_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        self.inner.claim_courier(order_id, courier_id, at)
    }

    fn release_courier(
        &self,
        courier_id: Uuid,
        order_id: Uuid,
        available: bool,
        at: DateTime<Utc>,
    ) -> Result<UpdateOutcome<Courier>, StoreError> {
        self.inner.release_courier(courier_id, order_id, available, at)
    }

    fn insert_otp_if_absent(
        &self,
        record: OtpRecord,
    ) -> Result<UpdateOutcome<OtpRecord>, StoreError> {
        self.fire(&self.before_otp_write);
        self.inner.insert_otp_if_absent(record)
    }

    fn get_otp(&self, order_id: Uuid) -> Result<Option<OtpRecord>, StoreError> {
        self.inner.get_otp(order_id)
    }

    fn delete_otp(&self, order_id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_otp(order_id)
    }

    fn compare_and_swap_otp(
        &self,
        expected: &OtpRecord,
        next: OtpRecord,
    ) -> Result<UpdateOutcome<OtpRecord>, StoreError> {
        self.fire(&self.before_otp_write);
        self.inner.compare_and_swap_otp(expected, next)
    }

    fn append_notification(
        &self,
        notification: Notification,
        dedup_since: Option<DateTime<Utc>>,
        cap: usize,
    ) -> Result<AppendOutcome, StoreError> {
        self.inner.append_notification(notification, dedup_since, cap)
    }

    fn notifications_for(&self, audience: Audience) -> Result<Vec<Notification>, StoreError> {
        self.inner.notifications_for(audience)
    }

    fn mark_notification_read(&self, audience: Audience, id: Uuid) -> Result<bool, StoreError> {
        self.inner.mark_notification_read(audience, id)
    }
}
