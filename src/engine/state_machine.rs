use std::sync::Arc;

use bigdecimal::BigDecimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::engine::coordinator::{Claim, DeliveryCoordinator};
use crate::engine::dispatcher::NotificationDispatcher;
use crate::engine::otp::OtpGate;
use crate::engine::tracker::LocationTracker;
use crate::error::AppError;
use crate::external::{Geocoder, format_coordinates};
use crate::geo::is_valid_point;
use crate::models::event::{DeliveryEvent, TransitionEvent};
use crate::models::offer::TimeoutOutcome;
use crate::models::order::{ActorRole, NewOrder, Order, OrderStatus, order_total};
use crate::models::otp::{OtpReceipt, OtpRecord};
use crate::observability::metrics::Metrics;
use crate::store::{OrderChange, OrderFilter, Store, UpdateOutcome};

/// What one sweeper tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub timed_out: Vec<(Uuid, TimeoutOutcome)>,
    pub stale_feeds: Vec<Uuid>,
    pub resumed_matching: Vec<Uuid>,
}

/// Owns the order lifecycle. Every status change goes through a conditional store write
/// keyed on the status the caller saw; side effects run only after the write commits.
pub struct OrderStateMachine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    coordinator: Arc<DeliveryCoordinator>,
    tracker: Arc<LocationTracker>,
    otp: Arc<OtpGate>,
    dispatcher: Arc<NotificationDispatcher>,
    geocoder: Arc<dyn Geocoder>,
    metrics: Metrics,
}

impl OrderStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        coordinator: Arc<DeliveryCoordinator>,
        tracker: Arc<LocationTracker>,
        otp: Arc<OtpGate>,
        dispatcher: Arc<NotificationDispatcher>,
        geocoder: Arc<dyn Geocoder>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clock,
            coordinator,
            tracker,
            otp,
            dispatcher,
            geocoder,
            metrics,
        }
    }

    pub async fn create(&self, new_order: NewOrder) -> Result<Order, AppError> {
        validate_new_order(&new_order)?;

        let mut address = new_order.address.trim().to_string();
        if address.is_empty() {
            if let Some(point) = &new_order.location {
                address = match self.geocoder.reverse_geocode(point).await {
                    Ok(resolved) if !resolved.trim().is_empty() => resolved,
                    Ok(_) => format_coordinates(point),
                    Err(err) => {
                        warn!(error = %err, "reverse geocoding failed; using coordinates");
                        format_coordinates(point)
                    }
                };
            }
        }
        if address.is_empty() {
            return Err(AppError::BadRequest(
                "a delivery address or coordinates are required".to_string(),
            ));
        }

        let now = self.clock.now();
        let order = Order {
            id: Uuid::new_v4(),
            status: OrderStatus::Placed,
            total: order_total(&new_order.items),
            customer: new_order.customer,
            address,
            location: new_order.location,
            items: new_order.items,
            payment_state: new_order.payment_state,
            assigned_courier_id: None,
            manual_assignment_required: false,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_order(order.clone())?;
        self.metrics
            .order_transitions_total
            .with_label_values(&[OrderStatus::Placed.as_str()])
            .inc();
        info!(
            order_id = %order.id,
            customer_id = %order.customer.id,
            total = %order.total,
            "order placed"
        );

        self.dispatcher.publish(&DeliveryEvent::OrderPlaced {
            order_id: order.id,
            at: now,
        });

        Ok(order)
    }

    pub fn get(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.store
            .get_order(order_id)?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
    }

    pub fn list(&self, filter: &OrderFilter) -> Result<Vec<Order>, AppError> {
        let mut orders = self.store.list_orders(filter)?;
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    /// Moves an order to `target`. Asking for the status the order already holds is a no-op.
    pub fn transition(
        &self,
        order_id: Uuid,
        target: OrderStatus,
        actor: ActorRole,
    ) -> Result<Order, AppError> {
        let order = self.get(order_id)?;

        if order.status == target {
            debug!(order_id = %order_id, status = %target, "transition already applied");
            return Ok(order);
        }

        if !order.status.can_transition_to(target) {
            return Err(AppError::InvalidTransition {
                from: order.status,
                to: target,
            });
        }

        match target {
            OrderStatus::OutForDelivery => {
                return Err(AppError::Conflict(
                    "an order goes out for delivery only when a courier accepts it".to_string(),
                ));
            }
            OrderStatus::Delivered => {
                return Err(AppError::Forbidden(
                    "delivery is completed by the assigned courier with the delivery code"
                        .to_string(),
                ));
            }
            _ => {}
        }

        check_permission(actor, order.status, target)?;

        if target == OrderStatus::Cancelled {
            return self.cancel(order, actor);
        }

        let now = self.clock.now();
        match self.store.update_order(
            order_id,
            order.status,
            OrderChange::Transition { to: target },
            now,
        )? {
            UpdateOutcome::Applied(updated) => {
                self.record_transition(order.status, &updated, actor);
                if target == OrderStatus::ReadyForPickup {
                    self.on_ready_for_pickup(&updated);
                }
                Ok(updated)
            }
            UpdateOutcome::PreconditionFailed(current) if current.status == target => Ok(current),
            UpdateOutcome::PreconditionFailed(current) => Err(AppError::InvalidTransition {
                from: current.status,
                to: target,
            }),
            UpdateOutcome::Missing => Err(AppError::NotFound(format!("order {order_id} not found"))),
        }
    }

    fn cancel(&self, order: Order, actor: ActorRole) -> Result<Order, AppError> {
        let now = self.clock.now();

        let updated = match self
            .store
            .update_order(order.id, order.status, OrderChange::Cancel, now)?
        {
            UpdateOutcome::Applied(updated) => updated,
            UpdateOutcome::PreconditionFailed(current)
                if current.status == OrderStatus::Cancelled =>
            {
                return Ok(current);
            }
            // moved forward under us; re-evaluate against the new status
            UpdateOutcome::PreconditionFailed(current) if !current.status.is_terminal() => {
                return self.transition(order.id, OrderStatus::Cancelled, actor);
            }
            UpdateOutcome::PreconditionFailed(current) => {
                return Err(AppError::InvalidTransition {
                    from: current.status,
                    to: OrderStatus::Cancelled,
                });
            }
            UpdateOutcome::Missing => {
                return Err(AppError::NotFound(format!("order {} not found", order.id)));
            }
        };

        if let Some(courier_id) = order.assigned_courier_id {
            match self.store.release_courier(courier_id, order.id, true, now) {
                Ok(UpdateOutcome::Applied(_)) => {
                    info!(order_id = %order.id, courier_id = %courier_id, "courier released");
                }
                Ok(_) => {
                    debug!(order_id = %order.id, courier_id = %courier_id, "courier already released");
                }
                Err(err) => {
                    error!(error = %err, order_id = %order.id, courier_id = %courier_id, "failed to release courier");
                }
            }
        }

        self.coordinator.withdraw(order.id);
        self.tracker.stop(order.id);
        if let Err(err) = self.otp.revoke(order.id) {
            warn!(error = %err, order_id = %order.id, "failed to revoke delivery code");
        }

        self.record_transition_with(order.status, &updated, actor, order.assigned_courier_id);
        Ok(updated)
    }

    /// A courier takes a broadcast offer.
    pub fn accept_offer(&self, order_id: Uuid, courier_id: Uuid) -> Result<Order, AppError> {
        let claim = self.coordinator.accept_offer(order_id, courier_id)?;
        Ok(self.after_claim(claim, ActorRole::Courier))
    }

    /// An operator binds a courier directly, typically for an order flagged for manual assignment.
    pub fn assign(&self, order_id: Uuid, courier_id: Uuid) -> Result<Order, AppError> {
        let claim = self.coordinator.assign(order_id, courier_id)?;
        Ok(self.after_claim(claim, ActorRole::Operator))
    }

    fn after_claim(&self, claim: Claim, actor: ActorRole) -> Order {
        if claim.order.status == OrderStatus::OutForDelivery {
            self.tracker
                .start(claim.order.id, claim.courier_id, claim.order.location);
        }

        if claim.newly_claimed {
            self.record_transition(OrderStatus::ReadyForPickup, &claim.order, actor);
        }

        claim.order
    }

    /// Courier-side completion. The delivery code is the only gate to `delivered`.
    pub fn complete(&self, order_id: Uuid, courier_id: Uuid, code: &str) -> Result<Order, AppError> {
        let order = self.get(order_id)?;
        let assigned_here = order.assigned_courier_id == Some(courier_id);

        match order.status {
            OrderStatus::Delivered if assigned_here => return Ok(order),
            OrderStatus::OutForDelivery if assigned_here => {}
            OrderStatus::OutForDelivery => {
                return Err(AppError::Forbidden(
                    "only the assigned courier can complete this delivery".to_string(),
                ));
            }
            other => {
                return Err(AppError::InvalidTransition {
                    from: other,
                    to: OrderStatus::Delivered,
                });
            }
        }

        self.otp.verify(order_id, code)?;

        let now = self.clock.now();
        match self.store.update_order(
            order_id,
            OrderStatus::OutForDelivery,
            OrderChange::Transition {
                to: OrderStatus::Delivered,
            },
            now,
        )? {
            UpdateOutcome::Applied(updated) => {
                if let Err(err) = self.store.release_courier(courier_id, order_id, true, now) {
                    error!(error = %err, order_id = %order_id, courier_id = %courier_id, "failed to release courier");
                }
                self.tracker.stop(order_id);
                self.coordinator.withdraw(order_id);
                self.record_transition(OrderStatus::OutForDelivery, &updated, ActorRole::Courier);
                Ok(updated)
            }
            UpdateOutcome::PreconditionFailed(current)
                if current.status == OrderStatus::Delivered =>
            {
                Ok(current)
            }
            UpdateOutcome::PreconditionFailed(current) => Err(AppError::InvalidTransition {
                from: current.status,
                to: OrderStatus::Delivered,
            }),
            UpdateOutcome::Missing => Err(AppError::NotFound(format!("order {order_id} not found"))),
        }
    }

    /// Fresh code for an order whose previous one expired or was locked by wrong attempts.
    pub fn reissue_code(&self, order_id: Uuid, actor: ActorRole) -> Result<OtpReceipt, AppError> {
        if actor == ActorRole::Courier {
            return Err(AppError::Forbidden(
                "couriers cannot request delivery codes".to_string(),
            ));
        }

        let order = self.get(order_id)?;
        if !matches!(
            order.status,
            OrderStatus::ReadyForPickup | OrderStatus::OutForDelivery
        ) {
            return Err(AppError::Conflict(format!(
                "no delivery code is needed while the order is {}",
                order.status
            )));
        }

        let record = self.otp.issue(order_id)?;
        self.announce_code(&record);

        Ok(OtpReceipt {
            order_id,
            expires_at: record.expires_at,
        })
    }

    /// Times out expired offers, refreshes feed staleness and restarts matching for ready
    /// orders that lost their offer (for example after a restart).
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for order_id in self.coordinator.expired_offers() {
            match self.coordinator.timeout_offer(order_id) {
                Ok(TimeoutOutcome::NotDue) => {}
                Ok(outcome) => report.timed_out.push((order_id, outcome)),
                Err(err) => {
                    error!(error = %err, order_id = %order_id, "offer timeout failed");
                }
            }
        }

        report.stale_feeds = self.tracker.sweep_stale();

        let waiting = OrderFilter {
            status: Some(OrderStatus::ReadyForPickup),
            manual_assignment_required: Some(false),
        };
        match self.store.list_orders(&waiting) {
            Ok(orders) => {
                for order in orders {
                    if order.assigned_courier_id.is_some()
                        || self.coordinator.offer(order.id).is_some()
                    {
                        continue;
                    }
                    if self.start_matching(order.id).is_ok() {
                        report.resumed_matching.push(order.id);
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to list orders awaiting a courier"),
        }

        report
    }

    fn on_ready_for_pickup(&self, order: &Order) {
        match self.otp.issue(order.id) {
            Ok(record) => self.announce_code(&record),
            Err(err) => {
                error!(error = %err, order_id = %order.id, "failed to issue delivery code");
            }
        }

        let _ = self.start_matching(order.id);
    }

    fn start_matching(&self, order_id: Uuid) -> Result<(), AppError> {
        let settings = self.coordinator.settings();
        self.coordinator
            .begin_matching(order_id, settings.origin, settings.radius_km)
            .map(|_| ())
            .inspect_err(|err| {
                error!(error = %err, order_id = %order_id, "failed to start courier matching");
            })
    }

    fn announce_code(&self, record: &OtpRecord) {
        self.dispatcher.publish(&DeliveryEvent::DeliveryCodeIssued {
            order_id: record.order_id,
            code: record.code.clone(),
            expires_at: record.expires_at,
        });
    }

    fn record_transition(&self, from: OrderStatus, order: &Order, actor: ActorRole) {
        self.record_transition_with(from, order, actor, order.assigned_courier_id);
    }

    fn record_transition_with(
        &self,
        from: OrderStatus,
        order: &Order,
        actor: ActorRole,
        courier_id: Option<Uuid>,
    ) {
        self.metrics
            .order_transitions_total
            .with_label_values(&[order.status.as_str()])
            .inc();
        info!(
            order_id = %order.id,
            from = %from,
            to = %order.status,
            actor = actor.as_str(),
            "order transition committed"
        );

        self.dispatcher
            .publish(&DeliveryEvent::StatusChanged(TransitionEvent {
                order_id: order.id,
                from,
                to: order.status,
                actor_role: actor,
                courier_id,
                at: order.updated_at,
            }));
    }
}

fn check_permission(actor: ActorRole, from: OrderStatus, to: OrderStatus) -> Result<(), AppError> {
    let allowed = match to {
        OrderStatus::Confirmed | OrderStatus::ReadyForPickup => {
            matches!(actor, ActorRole::Operator | ActorRole::System)
        }
        OrderStatus::Cancelled => match actor {
            ActorRole::Operator | ActorRole::System => true,
            ActorRole::Customer => matches!(from, OrderStatus::Placed | OrderStatus::Confirmed),
            ActorRole::Courier => false,
        },
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "{} cannot move an order from {from} to {to}",
            actor.as_str()
        )))
    }
}

fn validate_new_order(new_order: &NewOrder) -> Result<(), AppError> {
    if new_order.items.is_empty() {
        return Err(AppError::BadRequest("an order needs at least one item".to_string()));
    }

    let zero = BigDecimal::from(0);
    for item in &new_order.items {
        if item.product_ref.trim().is_empty() {
            return Err(AppError::BadRequest("item product_ref cannot be empty".to_string()));
        }
        if item.quantity == 0 {
            return Err(AppError::BadRequest(format!(
                "quantity for {} must be > 0",
                item.product_ref
            )));
        }
        if item.unit_price < zero {
            return Err(AppError::BadRequest(format!(
                "unit_price for {} cannot be negative",
                item.product_ref
            )));
        }
    }

    if let Some(point) = &new_order.location {
        if !is_valid_point(point) {
            return Err(AppError::BadRequest(
                "delivery coordinates are out of range".to_string(),
            ));
        }
    }

    if new_order.customer.name.trim().is_empty() {
        return Err(AppError::BadRequest("customer name cannot be empty".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bigdecimal::BigDecimal;
    use uuid::Uuid;

    use super::{check_permission, validate_new_order};
    use crate::error::AppError;
    use crate::models::courier::GeoPoint;
    use crate::models::order::{ActorRole, Customer, LineItem, NewOrder, OrderStatus, PaymentState};

    fn new_order() -> NewOrder {
        NewOrder {
            customer: Customer {
                id: Uuid::new_v4(),
                name: "Dana".to_string(),
                phone: None,
            },
            address: "12 Elm Row".to_string(),
            location: Some(GeoPoint {
                lat: 52.53,
                lng: 13.41,
            }),
            items: vec![LineItem {
                product_ref: "milk-1l".to_string(),
                unit_price: BigDecimal::from_str("1.25").unwrap(),
                quantity: 2,
            }],
            payment_state: PaymentState::Paid,
        }
    }

    #[test]
    fn rejects_empty_and_malformed_orders() {
        assert!(validate_new_order(&new_order()).is_ok());

        let mut empty = new_order();
        empty.items.clear();
        assert!(matches!(validate_new_order(&empty), Err(AppError::BadRequest(_))));

        let mut zero_qty = new_order();
        zero_qty.items[0].quantity = 0;
        assert!(matches!(validate_new_order(&zero_qty), Err(AppError::BadRequest(_))));

        let mut negative = new_order();
        negative.items[0].unit_price = BigDecimal::from(-1);
        assert!(matches!(validate_new_order(&negative), Err(AppError::BadRequest(_))));

        let mut off_globe = new_order();
        off_globe.location = Some(GeoPoint {
            lat: 95.0,
            lng: 0.0,
        });
        assert!(matches!(validate_new_order(&off_globe), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn permissions_follow_actor_roles() {
        let allowed = |actor, from, to| check_permission(actor, from, to).is_ok();

        assert!(allowed(ActorRole::Operator, OrderStatus::Placed, OrderStatus::Confirmed));
        assert!(allowed(
            ActorRole::System,
            OrderStatus::Confirmed,
            OrderStatus::ReadyForPickup
        ));
        assert!(!allowed(ActorRole::Customer, OrderStatus::Placed, OrderStatus::Confirmed));
        assert!(!allowed(
            ActorRole::Courier,
            OrderStatus::Confirmed,
            OrderStatus::ReadyForPickup
        ));

        assert!(allowed(ActorRole::Customer, OrderStatus::Placed, OrderStatus::Cancelled));
        assert!(allowed(ActorRole::Customer, OrderStatus::Confirmed, OrderStatus::Cancelled));
        assert!(!allowed(
            ActorRole::Customer,
            OrderStatus::ReadyForPickup,
            OrderStatus::Cancelled
        ));
        assert!(allowed(
            ActorRole::Operator,
            OrderStatus::OutForDelivery,
            OrderStatus::Cancelled
        ));
        assert!(!allowed(
            ActorRole::Courier,
            OrderStatus::OutForDelivery,
            OrderStatus::Cancelled
        ));
    }
}
