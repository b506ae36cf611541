use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::MatchingSettings;
use crate::engine::dispatcher::NotificationDispatcher;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::courier::{Courier, GeoPoint};
use crate::models::event::DeliveryEvent;
use crate::models::offer::{Candidate, MatchOffer, TimeoutOutcome};
use crate::models::order::{Order, OrderStatus};
use crate::observability::metrics::Metrics;
use crate::store::{ClaimOutcome, CourierFilter, OrderChange, Store, UpdateOutcome};

/// Result of a successful acceptance. `newly_claimed` is false when the same courier
/// retried an acceptance that had already landed.
#[derive(Debug, Clone)]
pub struct Claim {
    pub order: Order,
    pub courier_id: Uuid,
    pub newly_claimed: bool,
}

pub struct DeliveryCoordinator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<NotificationDispatcher>,
    settings: MatchingSettings,
    metrics: Metrics,
    offers: DashMap<Uuid, MatchOffer>,
}

impl DeliveryCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<NotificationDispatcher>,
        settings: MatchingSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clock,
            dispatcher,
            settings,
            metrics,
            offers: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &MatchingSettings {
        &self.settings
    }

    pub fn offer(&self, order_id: Uuid) -> Option<MatchOffer> {
        self.offers.get(&order_id).map(|entry| entry.value().clone())
    }

    pub fn open_offers(&self) -> usize {
        self.offers.iter().filter(|entry| entry.is_open()).count()
    }

    /// Broadcasts the order to the nearest free couriers within `radius_km` of `origin`.
    /// A repeated call for an order with an open offer starts the next round. Returns `None`
    /// when the order was claimed or left `ready_for_pickup` while the round was built.
    pub fn begin_matching(
        &self,
        order_id: Uuid,
        origin: GeoPoint,
        radius_km: f64,
    ) -> Result<Option<MatchOffer>, AppError> {
        let now = self.clock.now();
        let candidates = self.rank_candidates(&origin, radius_km)?;

        let round = |previous: Option<&MatchOffer>| {
            let mut offered_to = previous
                .map(|offer| offer.offered_to.clone())
                .unwrap_or_default();
            for candidate in &candidates {
                if !offered_to.contains(&candidate.courier_id) {
                    offered_to.push(candidate.courier_id);
                }
            }

            MatchOffer {
                order_id,
                origin,
                radius_km,
                attempt: previous.map_or(1, |offer| offer.attempt + 1),
                candidates: candidates.clone(),
                offered_to,
                created_at: now,
                first_broadcast_at: previous.map_or(now, |offer| offer.first_broadcast_at),
                expires_at: now + self.settings.offer_timeout,
                accepted_by: None,
            }
        };

        // An accepted offer is final; only an open one is replaced.
        let offer = match self.offers.entry(order_id) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_open() {
                    info!(order_id = %order_id, "offer already accepted; round dropped");
                    return Ok(None);
                }
                let next = round(Some(slot.get()));
                slot.insert(next.clone());
                next
            }
            Entry::Vacant(slot) => slot.insert(round(None)).value().clone(),
        };

        match self.store.get_order(order_id)? {
            Some(order) if awaits_courier(&order) => {}
            Some(Order {
                assigned_courier_id: Some(winner),
                ..
            }) => {
                if let Some(mut stored) = self.offers.get_mut(&order_id) {
                    if stored.is_open() {
                        stored.accepted_by = Some(winner);
                    }
                }
                info!(
                    order_id = %order_id,
                    winner = %winner,
                    "order claimed while the round was built; broadcast dropped"
                );
                return Ok(None);
            }
            _ => {
                self.offers.remove_if(&order_id, |_, stored| stored.is_open());
                return Ok(None);
            }
        }

        self.metrics
            .offer_outcomes_total
            .with_label_values(&[if offer.attempt == 1 { "broadcast" } else { "expanded" }])
            .inc();

        if offer.candidates.is_empty() {
            warn!(
                order_id = %order_id,
                radius_km,
                attempt = offer.attempt,
                "no couriers in range; waiting for offer timeout"
            );
        } else {
            info!(
                order_id = %order_id,
                radius_km,
                attempt = offer.attempt,
                candidates = offer.candidates.len(),
                "delivery offer broadcast"
            );
            self.dispatcher.publish(&DeliveryEvent::DeliveryRequest {
                order_id,
                courier_ids: offer.candidates.iter().map(|c| c.courier_id).collect(),
                radius_km,
                attempt: offer.attempt,
                at: now,
            });
        }

        Ok(Some(offer))
    }

    /// Courier-initiated acceptance of a broadcast offer.
    pub fn accept_offer(&self, order_id: Uuid, courier_id: Uuid) -> Result<Claim, AppError> {
        if let Some(offer) = self.offer(order_id) {
            if offer.is_open() && !offer.was_offered_to(courier_id) {
                return Err(AppError::Forbidden(format!(
                    "order {order_id} was not offered to courier {courier_id}"
                )));
            }
        }

        self.claim(order_id, courier_id)
    }

    /// Operator-initiated binding; skips the candidate check but not the exclusive claim.
    pub fn assign(&self, order_id: Uuid, courier_id: Uuid) -> Result<Claim, AppError> {
        self.claim(order_id, courier_id)
    }

    fn claim(&self, order_id: Uuid, courier_id: Uuid) -> Result<Claim, AppError> {
        let now = self.clock.now();

        match self.store.claim_courier(order_id, courier_id, now)? {
            ClaimOutcome::Claimed { order, .. } => {
                if let Some(mut offer) = self.offers.get_mut(&order_id) {
                    offer.accepted_by = Some(courier_id);
                    let waited = (now - offer.first_broadcast_at).num_milliseconds().max(0);
                    self.metrics
                        .acceptance_latency_seconds
                        .observe(waited as f64 / 1000.0);
                }
                self.metrics
                    .offer_outcomes_total
                    .with_label_values(&["accepted"])
                    .inc();
                info!(order_id = %order_id, courier_id = %courier_id, "courier claimed order");

                Ok(Claim {
                    order,
                    courier_id,
                    newly_claimed: true,
                })
            }
            ClaimOutcome::AlreadyClaimed { order, by } if by == courier_id => Ok(Claim {
                order,
                courier_id,
                newly_claimed: false,
            }),
            ClaimOutcome::AlreadyClaimed { by, .. } => {
                self.metrics
                    .offer_outcomes_total
                    .with_label_values(&["taken"])
                    .inc();
                warn!(
                    order_id = %order_id,
                    courier_id = %courier_id,
                    winner = %by,
                    "acceptance lost the race"
                );
                Err(AppError::OfferAlreadyTaken)
            }
            ClaimOutcome::OrderNotReady { status } => Err(AppError::InvalidTransition {
                from: status,
                to: OrderStatus::OutForDelivery,
            }),
            ClaimOutcome::CourierBusy { .. } => Err(AppError::CourierBusy),
            ClaimOutcome::CourierUnavailable => Err(AppError::Conflict(
                "courier is not accepting new orders".to_string(),
            )),
            ClaimOutcome::OrderMissing => {
                Err(AppError::NotFound(format!("order {order_id} not found")))
            }
            ClaimOutcome::CourierMissing => {
                Err(AppError::NotFound(format!("courier {courier_id} not found")))
            }
        }
    }

    /// Re-broadcasts an unanswered offer with a wider radius, or hands the order to an
    /// operator once the retries are spent.
    pub fn timeout_offer(&self, order_id: Uuid) -> Result<TimeoutOutcome, AppError> {
        let now = self.clock.now();
        let Some(offer) = self.offer(order_id) else {
            return Ok(TimeoutOutcome::NotDue);
        };
        if !offer.is_expired(now) {
            return Ok(TimeoutOutcome::NotDue);
        }

        let still_waiting = self
            .store
            .get_order(order_id)?
            .is_some_and(|order| awaits_courier(&order));
        if !still_waiting {
            self.withdraw(order_id);
            return Ok(TimeoutOutcome::NotDue);
        }

        if offer.attempt <= self.settings.max_retries {
            let radius_km = self.settings.expanded_radius(offer.radius_km);
            let Some(next) = self.begin_matching(order_id, offer.origin, radius_km)? else {
                return Ok(TimeoutOutcome::NotDue);
            };
            return Ok(TimeoutOutcome::Rebroadcast {
                attempt: next.attempt,
                radius_km,
                candidates: next.candidates.len(),
            });
        }

        match self.store.update_order(
            order_id,
            OrderStatus::ReadyForPickup,
            OrderChange::FlagManualAssignment,
            now,
        )? {
            UpdateOutcome::Applied(_) => {}
            UpdateOutcome::PreconditionFailed(_) | UpdateOutcome::Missing => {
                self.withdraw(order_id);
                return Ok(TimeoutOutcome::NotDue);
            }
        }

        self.offers.remove(&order_id);
        self.metrics
            .offer_outcomes_total
            .with_label_values(&["manual"])
            .inc();
        warn!(
            order_id = %order_id,
            attempts = offer.attempt,
            "no courier accepted; flagged for manual assignment"
        );
        self.dispatcher
            .publish(&DeliveryEvent::ManualAssignmentRequired {
                order_id,
                attempts: offer.attempt,
                at: now,
            });

        Ok(TimeoutOutcome::ManualAssignment {
            attempts: offer.attempt,
        })
    }

    pub fn expired_offers(&self) -> Vec<Uuid> {
        let now = self.clock.now();
        self.offers
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Drops the offer for an order that no longer needs matching.
    pub fn withdraw(&self, order_id: Uuid) -> Option<MatchOffer> {
        self.offers.remove(&order_id).map(|(_, offer)| offer)
    }

    fn rank_candidates(&self, origin: &GeoPoint, radius_km: f64) -> Result<Vec<Candidate>, AppError> {
        let filter = CourierFilter {
            matchable_only: true,
            near: Some((*origin, radius_km)),
        };

        let mut candidates: Vec<Candidate> = self
            .store
            .list_couriers(&filter)?
            .iter()
            .filter_map(|courier: &Courier| {
                let position = courier.position.as_ref()?;
                let distance_km = haversine_km(origin, &position.point);
                (distance_km <= radius_km).then_some(Candidate {
                    courier_id: courier.id,
                    distance_km,
                })
            })
            .collect();

        candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        candidates.truncate(self.settings.top_k);

        Ok(candidates)
    }
}

fn awaits_courier(order: &Order) -> bool {
    order.status == OrderStatus::ReadyForPickup && order.assigned_courier_id.is_none()
}
