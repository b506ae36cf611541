use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::NotificationSettings;
use crate::error::AppError;
use crate::external::OutboundMessage;
use crate::models::event::{DeliveryEvent, TransitionEvent};
use crate::models::notification::{Audience, Notification, NotificationKind, NotificationPriority};
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::{AppendOutcome, Store};

struct Planned {
    audience: Audience,
    kind: NotificationKind,
    priority: NotificationPriority,
    message: String,
    outbound: Option<OutboundMessage>,
}

/// Turns core events into per-audience feed entries and best-effort outbound messages.
pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    settings: NotificationSettings,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    events_tx: broadcast::Sender<DeliveryEvent>,
    metrics: Metrics,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        settings: NotificationSettings,
        outbound_tx: mpsc::Sender<OutboundMessage>,
        events_tx: broadcast::Sender<DeliveryEvent>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            outbound_tx,
            events_tx,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events_tx.subscribe()
    }

    /// Records the notifications an event produces. Never fails: feed and channel problems
    /// are logged and the caller's transition stands.
    pub fn publish(&self, event: &DeliveryEvent) -> Vec<Notification> {
        let _ = self.events_tx.send(event.redacted());

        let now = self.clock.now();
        let dedup_since = now - self.settings.dedup_window;
        let mut published = Vec::new();

        for planned in self.plan(event) {
            let notification = Notification {
                id: Uuid::new_v4(),
                audience: planned.audience,
                kind: planned.kind,
                message: planned.message,
                priority: planned.priority,
                read: false,
                created_at: now,
                order_id: Some(event.order_id()),
            };

            let since = collapses(planned.kind).then_some(dedup_since);
            match self
                .store
                .append_notification(notification, since, self.settings.feed_cap)
            {
                Ok(AppendOutcome::Appended(notification)) => {
                    self.metrics
                        .notifications_total
                        .with_label_values(&[notification.kind.as_str()])
                        .inc();
                    if let Some(message) = planned.outbound {
                        self.enqueue(message);
                    }
                    published.push(notification);
                }
                Ok(AppendOutcome::Collapsed(existing)) => {
                    debug!(
                        audience = %existing.audience,
                        kind = existing.kind.as_str(),
                        "duplicate notification collapsed"
                    );
                    published.push(existing);
                }
                Err(err) => {
                    warn!(error = %err, order_id = %event.order_id(), "failed to record notification");
                }
            }
        }

        published
    }

    pub fn feed(&self, audience: Audience) -> Result<Vec<Notification>, AppError> {
        Ok(self.store.notifications_for(audience)?)
    }

    pub fn mark_read(&self, audience: Audience, id: Uuid) -> Result<(), AppError> {
        if self.store.mark_notification_read(audience, id)? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("notification {id} not found")))
        }
    }

    fn enqueue(&self, message: OutboundMessage) {
        match self.outbound_tx.try_send(message) {
            Ok(()) => self.metrics.outbound_queue_depth.inc(),
            Err(err) => {
                self.metrics.channel_send_failures_total.inc();
                warn!(error = %err, "outbound queue unavailable; message dropped");
            }
        }
    }

    fn order(&self, order_id: Uuid) -> Option<Order> {
        match self.store.get_order(order_id) {
            Ok(order) => order,
            Err(err) => {
                warn!(error = %err, order_id = %order_id, "order lookup failed while notifying");
                None
            }
        }
    }

    fn courier_phone(&self, courier_id: Uuid) -> Option<String> {
        self.store
            .get_courier(courier_id)
            .ok()
            .flatten()
            .and_then(|courier| courier.phone)
    }

    fn plan(&self, event: &DeliveryEvent) -> Vec<Planned> {
        match event {
            DeliveryEvent::OrderPlaced { order_id, .. } => {
                let Some(order) = self.order(*order_id) else {
                    return Vec::new();
                };
                vec![
                    Planned {
                        audience: Audience::Operator,
                        kind: NotificationKind::OrderPlaced,
                        priority: NotificationPriority::High,
                        message: format!(
                            "New order {} for {} (total {})",
                            short_id(order.id),
                            order.address,
                            order.total
                        ),
                        outbound: None,
                    },
                    Planned {
                        audience: Audience::Customer(order.customer.id),
                        kind: NotificationKind::OrderPlaced,
                        priority: NotificationPriority::Low,
                        message: format!("We received your order (total {}).", order.total),
                        outbound: None,
                    },
                ]
            }
            DeliveryEvent::StatusChanged(transition) => self.plan_transition(transition),
            DeliveryEvent::DeliveryRequest {
                order_id,
                courier_ids,
                radius_km,
                ..
            } => courier_ids
                .iter()
                .map(|courier_id| Planned {
                    audience: Audience::Courier(*courier_id),
                    kind: NotificationKind::DeliveryRequest,
                    priority: NotificationPriority::High,
                    message: format!(
                        "New delivery request for order {} within {radius_km:.1} km.",
                        short_id(*order_id)
                    ),
                    outbound: self.courier_phone(*courier_id).map(|phone| OutboundMessage {
                        recipient: phone,
                        template_id: "delivery_request",
                        params: params([("order", short_id(*order_id))]),
                        order_id: Some(*order_id),
                    }),
                })
                .collect(),
            DeliveryEvent::DeliveryCodeIssued {
                order_id,
                code,
                expires_at,
            } => {
                let Some(order) = self.order(*order_id) else {
                    return Vec::new();
                };
                vec![Planned {
                    audience: Audience::Customer(order.customer.id),
                    kind: NotificationKind::DeliveryCode,
                    priority: NotificationPriority::High,
                    message: format!(
                        "Your delivery code is {code}. Share it with the courier at handoff (valid until {}).",
                        expires_at.format("%H:%M UTC")
                    ),
                    outbound: order.customer.phone.map(|phone| OutboundMessage {
                        recipient: phone,
                        template_id: "delivery_code",
                        params: params([("code", code.clone())]),
                        order_id: Some(*order_id),
                    }),
                }]
            }
            DeliveryEvent::CourierNearby {
                order_id,
                distance_m,
                ..
            } => {
                let Some(order) = self.order(*order_id) else {
                    return Vec::new();
                };
                vec![Planned {
                    audience: Audience::Customer(order.customer.id),
                    kind: NotificationKind::CourierNearby,
                    priority: NotificationPriority::High,
                    message: format!("Your courier is nearby, about {distance_m:.0} m away."),
                    outbound: order.customer.phone.map(|phone| OutboundMessage {
                        recipient: phone,
                        template_id: "courier_nearby",
                        params: params([("distance_m", format!("{distance_m:.0}"))]),
                        order_id: Some(*order_id),
                    }),
                }]
            }
            DeliveryEvent::ManualAssignmentRequired {
                order_id, attempts, ..
            } => vec![Planned {
                audience: Audience::Operator,
                kind: NotificationKind::ManualAssignment,
                priority: NotificationPriority::High,
                message: format!(
                    "No courier accepted order {} after {attempts} round(s); assign it manually.",
                    short_id(*order_id)
                ),
                outbound: None,
            }],
        }
    }

    fn plan_transition(&self, transition: &TransitionEvent) -> Vec<Planned> {
        let order = self.order(transition.order_id);
        let short = short_id(transition.order_id);

        let mut planned = vec![Planned {
            audience: Audience::Operator,
            kind: status_kind(transition.to),
            priority: match transition.to {
                OrderStatus::Cancelled => NotificationPriority::High,
                OrderStatus::Delivered => NotificationPriority::Medium,
                _ => NotificationPriority::Low,
            },
            message: format!(
                "Order {short} moved from {} to {} by {}.",
                transition.from,
                transition.to,
                transition.actor_role.as_str()
            ),
            outbound: None,
        }];

        if let Some(order) = &order {
            let (priority, message, template) = match transition.to {
                OrderStatus::Placed => return planned,
                OrderStatus::Confirmed => (
                    NotificationPriority::Medium,
                    "Your order was confirmed and is being prepared.".to_string(),
                    None,
                ),
                OrderStatus::ReadyForPickup => (
                    NotificationPriority::Medium,
                    "Your order is packed and waiting for a courier.".to_string(),
                    None,
                ),
                OrderStatus::OutForDelivery => (
                    NotificationPriority::High,
                    "Your order is on its way.".to_string(),
                    Some("out_for_delivery"),
                ),
                OrderStatus::Delivered => (
                    NotificationPriority::Medium,
                    "Your order was delivered. Enjoy!".to_string(),
                    Some("delivered"),
                ),
                OrderStatus::Cancelled => (
                    NotificationPriority::High,
                    "Your order was cancelled.".to_string(),
                    Some("cancelled"),
                ),
            };

            planned.push(Planned {
                audience: Audience::Customer(order.customer.id),
                kind: status_kind(transition.to),
                priority,
                message,
                outbound: template.and_then(|template_id| {
                    order.customer.phone.clone().map(|phone| OutboundMessage {
                        recipient: phone,
                        template_id,
                        params: params([("order", short.clone())]),
                        order_id: Some(order.id),
                    })
                }),
            });
        }

        if let Some(courier_id) = transition.courier_id {
            let message = match transition.to {
                OrderStatus::OutForDelivery => Some(format!(
                    "Order {short} is yours. Deliver to {}.",
                    order.as_ref().map_or("the customer", |o| o.address.as_str())
                )),
                OrderStatus::Delivered => Some(format!("Delivery of order {short} confirmed.")),
                OrderStatus::Cancelled => Some(format!(
                    "Order {short} was cancelled; you are free for new requests."
                )),
                _ => None,
            };

            if let Some(message) = message {
                planned.push(Planned {
                    audience: Audience::Courier(courier_id),
                    kind: status_kind(transition.to),
                    priority: NotificationPriority::High,
                    message,
                    outbound: None,
                });
            }
        }

        planned
    }
}

fn status_kind(status: OrderStatus) -> NotificationKind {
    match status {
        OrderStatus::Placed => NotificationKind::OrderPlaced,
        OrderStatus::Confirmed => NotificationKind::OrderConfirmed,
        OrderStatus::ReadyForPickup => NotificationKind::ReadyForPickup,
        OrderStatus::OutForDelivery => NotificationKind::OutForDelivery,
        OrderStatus::Delivered => NotificationKind::Delivered,
        OrderStatus::Cancelled => NotificationKind::Cancelled,
    }
}

/// Each delivery code is distinct and must reach the customer even when re-issued quickly.
fn collapses(kind: NotificationKind) -> bool {
    kind != NotificationKind::DeliveryCode
}

fn short_id(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn params<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bigdecimal::BigDecimal;
    use chrono::{Duration, Utc};
    use tokio::sync::{broadcast, mpsc};
    use uuid::Uuid;

    use super::NotificationDispatcher;
    use crate::clock::ManualClock;
    use crate::config::NotificationSettings;
    use crate::external::OutboundMessage;
    use crate::models::event::{DeliveryEvent, TransitionEvent};
    use crate::models::notification::{Audience, NotificationKind};
    use crate::models::order::{ActorRole, Customer, Order, OrderStatus, PaymentState};
    use crate::observability::metrics::Metrics;
    use crate::store::{MemoryStore, Store};

    struct Harness {
        dispatcher: NotificationDispatcher,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        outbound_rx: mpsc::Receiver<OutboundMessage>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let (events_tx, _events_rx) = broadcast::channel(16);
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            clock.clone(),
            NotificationSettings::default(),
            outbound_tx,
            events_tx,
            Metrics::new(),
        );
        Harness {
            dispatcher,
            store,
            clock,
            outbound_rx,
        }
    }

    fn seed_order(store: &MemoryStore, phone: Option<&str>) -> Order {
        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            status: OrderStatus::Placed,
            customer: Customer {
                id: Uuid::new_v4(),
                name: "Dana".to_string(),
                phone: phone.map(str::to_string),
            },
            address: "1 Market St".to_string(),
            location: None,
            items: Vec::new(),
            total: BigDecimal::from(200),
            payment_state: PaymentState::Paid,
            assigned_courier_id: None,
            manual_assignment_required: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_order(order.clone()).unwrap();
        order
    }

    fn confirmed(order_id: Uuid) -> DeliveryEvent {
        DeliveryEvent::StatusChanged(TransitionEvent {
            order_id,
            from: OrderStatus::Placed,
            to: OrderStatus::Confirmed,
            actor_role: ActorRole::Operator,
            courier_id: None,
            at: Utc::now(),
        })
    }

    #[test]
    fn transition_reaches_operator_and_customer() {
        let h = harness();
        let order = seed_order(&h.store, None);

        let published = h.dispatcher.publish(&confirmed(order.id));

        assert_eq!(published.len(), 2);
        assert_eq!(h.dispatcher.feed(Audience::Operator).unwrap().len(), 1);
        let customer_feed = h
            .dispatcher
            .feed(Audience::Customer(order.customer.id))
            .unwrap();
        assert_eq!(customer_feed.len(), 1);
        assert_eq!(customer_feed[0].kind, NotificationKind::OrderConfirmed);
    }

    #[test]
    fn repeated_event_inside_window_collapses() {
        let h = harness();
        let order = seed_order(&h.store, None);

        h.dispatcher.publish(&confirmed(order.id));
        h.dispatcher.publish(&confirmed(order.id));
        assert_eq!(h.dispatcher.feed(Audience::Operator).unwrap().len(), 1);

        h.clock.advance(Duration::seconds(31));
        h.dispatcher.publish(&confirmed(order.id));
        assert_eq!(h.dispatcher.feed(Audience::Operator).unwrap().len(), 2);
    }

    #[test]
    fn delivery_code_goes_out_on_the_channel_and_never_collapses() {
        let mut h = harness();
        let order = seed_order(&h.store, Some("+4915100000"));

        for code in ["4821", "7310"] {
            h.dispatcher.publish(&DeliveryEvent::DeliveryCodeIssued {
                order_id: order.id,
                code: code.to_string(),
                expires_at: Utc::now() + Duration::minutes(30),
            });
        }

        let feed = h
            .dispatcher
            .feed(Audience::Customer(order.customer.id))
            .unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed[0].message.contains("7310"));

        let first = h.outbound_rx.try_recv().unwrap();
        assert_eq!(first.recipient, "+4915100000");
        assert_eq!(first.template_id, "delivery_code");
        assert_eq!(first.params["code"], "4821");
    }

    #[test]
    fn delivery_request_fans_out_to_each_candidate() {
        let h = harness();
        let order_id = Uuid::new_v4();
        let couriers = [Uuid::new_v4(), Uuid::new_v4()];

        h.dispatcher.publish(&DeliveryEvent::DeliveryRequest {
            order_id,
            courier_ids: couriers.to_vec(),
            radius_km: 5.0,
            attempt: 1,
            at: Utc::now(),
        });

        for courier_id in couriers {
            let feed = h.dispatcher.feed(Audience::Courier(courier_id)).unwrap();
            assert_eq!(feed.len(), 1);
            assert_eq!(feed[0].kind, NotificationKind::DeliveryRequest);
        }
    }

    #[test]
    fn full_outbound_queue_does_not_fail_publish() {
        let store = Arc::new(MemoryStore::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        drop(outbound_rx);
        let (events_tx, _) = broadcast::channel(4);
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            Arc::new(ManualClock::default()),
            NotificationSettings::default(),
            outbound_tx,
            events_tx,
            Metrics::new(),
        );
        let order = seed_order(&store, Some("+4915100000"));

        let published = dispatcher.publish(&DeliveryEvent::DeliveryCodeIssued {
            order_id: order.id,
            code: "4821".to_string(),
            expires_at: Utc::now(),
        });
        assert_eq!(published.len(), 1);
    }
}
