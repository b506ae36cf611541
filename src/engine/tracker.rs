use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::TrackingSettings;
use crate::engine::dispatcher::NotificationDispatcher;
use crate::error::AppError;
use crate::geo::{bearing_deg, eta_minutes, haversine_km, is_valid_point};
use crate::models::courier::GeoPoint;
use crate::models::event::DeliveryEvent;
use crate::models::location::{FeedHealth, LocationSample, SpeedSource, TrackingSnapshot};
use crate::models::order::OrderStatus;
use crate::observability::metrics::Metrics;
use crate::store::{Store, UpdateOutcome};

/// Raw fix as reported by a courier device.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleInput {
    pub point: GeoPoint,
    pub recorded_at: Option<DateTime<Utc>>,
    pub speed_kmh: Option<f64>,
    pub heading_deg: Option<f64>,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Estimate {
    distance_km: f64,
    eta_minutes: Option<f64>,
    bearing_deg: f64,
    speed_kmh: f64,
    speed_source: SpeedSource,
}

#[derive(Debug)]
struct TrackingSession {
    order_id: Uuid,
    courier_id: Uuid,
    target: Option<GeoPoint>,
    trail: VecDeque<LocationSample>,
    started_at: DateTime<Utc>,
    last_ingested_at: Option<DateTime<Utc>>,
    estimate: Option<Estimate>,
    nearby_notified: bool,
    stale_flagged: bool,
}

/// Streams a courier's position against the customer's coordinates. Read-only with respect
/// to orders: it supplies distance, ETA and feed health, never status changes.
pub struct LocationTracker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<NotificationDispatcher>,
    settings: TrackingSettings,
    metrics: Metrics,
    sessions: DashMap<Uuid, TrackingSession>,
}

impl LocationTracker {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<NotificationDispatcher>,
        settings: TrackingSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            clock,
            dispatcher,
            settings,
            metrics,
            sessions: DashMap::new(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn start(&self, order_id: Uuid, courier_id: Uuid, target: Option<GeoPoint>) {
        let started_at = self.clock.now();
        let mut created = false;

        self.sessions.entry(order_id).or_insert_with(|| {
            created = true;
            TrackingSession {
                order_id,
                courier_id,
                target,
                trail: VecDeque::with_capacity(self.settings.trail_len),
                started_at,
                last_ingested_at: None,
                estimate: None,
                nearby_notified: false,
                stale_flagged: false,
            }
        });

        if created {
            self.metrics.active_deliveries.inc();
            if target.is_none() {
                warn!(order_id = %order_id, "tracking without customer coordinates; no distance or eta");
            }
            info!(order_id = %order_id, courier_id = %courier_id, "tracking started");
        }
    }

    pub fn stop(&self, order_id: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&order_id) {
            self.metrics.active_deliveries.dec();
            if session.stale_flagged {
                self.metrics.stale_feeds.dec();
            }
            info!(
                order_id = %order_id,
                courier_id = %session.courier_id,
                samples = session.trail.len(),
                "tracking stopped"
            );
        }
    }

    /// Records a fix for the courier and, when it is on a delivery, refreshes distance/ETA.
    pub fn ingest(
        &self,
        courier_id: Uuid,
        input: SampleInput,
    ) -> Result<Option<TrackingSnapshot>, AppError> {
        validate_input(&input)?;

        let now = self.clock.now();
        let courier = self
            .store
            .get_courier(courier_id)?
            .ok_or_else(|| AppError::NotFound(format!("courier {courier_id} not found")))?;

        let sample = LocationSample {
            courier_id,
            order_id: courier.active_order_id,
            point: input.point,
            recorded_at: input.recorded_at.unwrap_or(now),
            speed_kmh: input.speed_kmh,
            heading_deg: input.heading_deg,
            accuracy_m: input.accuracy_m,
        };

        match self
            .store
            .update_courier_position(courier_id, sample.position(), now)?
        {
            UpdateOutcome::Applied(_) => {}
            UpdateOutcome::PreconditionFailed(_) => {
                debug!(courier_id = %courier_id, recorded_at = %sample.recorded_at, "out-of-order sample kept for trail only");
            }
            UpdateOutcome::Missing => {
                return Err(AppError::NotFound(format!("courier {courier_id} not found")));
            }
        }

        let Some(order_id) = courier.active_order_id else {
            return Ok(None);
        };

        if !self.sessions.contains_key(&order_id) && !self.resume(order_id, courier_id)? {
            return Ok(None);
        }

        let nearby = {
            let Some(mut session) = self.sessions.get_mut(&order_id) else {
                return Ok(None);
            };
            self.record(&mut session, sample, now)
        };

        if let Some(distance_m) = nearby {
            info!(order_id = %order_id, courier_id = %courier_id, distance_m, "courier nearby");
            self.dispatcher.publish(&DeliveryEvent::CourierNearby {
                order_id,
                courier_id,
                distance_m,
                at: now,
            });
        }

        Ok(self.snapshot(order_id))
    }

    pub fn snapshot(&self, order_id: Uuid) -> Option<TrackingSnapshot> {
        let now = self.clock.now();
        let session = self.sessions.get(&order_id)?;
        let feed = self.feed_health(&session, now);
        let estimate = session.estimate;

        Some(TrackingSnapshot {
            order_id: session.order_id,
            courier_id: session.courier_id,
            target: session.target,
            distance_km: estimate.map(|e| e.distance_km),
            eta_minutes: estimate.and_then(|e| e.eta_minutes),
            bearing_deg: estimate.map(|e| e.bearing_deg),
            speed_kmh: estimate.map(|e| e.speed_kmh),
            speed_source: estimate.map(|e| e.speed_source),
            feed,
            eta_reliable: feed.is_trustworthy() && estimate.is_some_and(|e| e.eta_minutes.is_some()),
            arrived: estimate
                .is_some_and(|e| e.distance_km * 1000.0 <= self.settings.arrival_radius_m),
            last_sample_at: session.trail.back().map(|sample| sample.recorded_at),
            trail: session.trail.iter().cloned().collect(),
        })
    }

    /// Drops sessions whose order is no longer out for delivery, then flags feeds that went
    /// silent past the threshold. Returns newly stale orders.
    pub fn sweep_stale(&self) -> Vec<Uuid> {
        self.drop_finished_sessions();

        let now = self.clock.now();
        let mut newly_stale = Vec::new();

        for mut session in self.sessions.iter_mut() {
            let stale = matches!(self.feed_health(&session, now), FeedHealth::Stale { .. });

            if stale && !session.stale_flagged {
                session.stale_flagged = true;
                self.metrics.stale_feeds.inc();
                warn!(
                    order_id = %session.order_id,
                    courier_id = %session.courier_id,
                    "courier position feed is stale; eta untrusted"
                );
                newly_stale.push(session.order_id);
            }
        }

        newly_stale
    }

    /// Rebuilds a session for a courier that is already bound to an order in the store.
    fn resume(&self, order_id: Uuid, courier_id: Uuid) -> Result<bool, AppError> {
        let Some(order) = self.store.get_order(order_id)? else {
            return Ok(false);
        };

        if order.status != OrderStatus::OutForDelivery
            || order.assigned_courier_id != Some(courier_id)
        {
            return Ok(false);
        }

        self.start(order_id, courier_id, order.location);

        // The delivery may have completed between the read and the start.
        if !self.is_delivering(order_id, courier_id)? {
            self.stop(order_id);
            return Ok(false);
        }
        Ok(true)
    }

    fn is_delivering(&self, order_id: Uuid, courier_id: Uuid) -> Result<bool, AppError> {
        Ok(self.store.get_order(order_id)?.is_some_and(|order| {
            order.status == OrderStatus::OutForDelivery
                && order.assigned_courier_id == Some(courier_id)
        }))
    }

    fn drop_finished_sessions(&self) {
        let tracked: Vec<(Uuid, Uuid)> = self
            .sessions
            .iter()
            .map(|session| (session.order_id, session.courier_id))
            .collect();

        for (order_id, courier_id) in tracked {
            match self.is_delivering(order_id, courier_id) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(order_id = %order_id, "order left delivery; tracking session dropped");
                    self.stop(order_id);
                }
                Err(err) => {
                    warn!(error = %err, order_id = %order_id, "could not check tracked order");
                }
            }
        }
    }

    /// Returns the distance in metres when this sample is the first to land inside the
    /// arrival radius.
    fn record(
        &self,
        session: &mut TrackingSession,
        sample: LocationSample,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let position = session
            .trail
            .iter()
            .rposition(|existing| existing.recorded_at <= sample.recorded_at)
            .map_or(0, |index| index + 1);
        session.trail.insert(position, sample);
        while session.trail.len() > self.settings.trail_len {
            session.trail.pop_front();
        }

        session.last_ingested_at = Some(now);
        if session.stale_flagged {
            session.stale_flagged = false;
            self.metrics.stale_feeds.dec();
            info!(order_id = %session.order_id, "courier position feed recovered");
        }

        let target = session.target?;
        let latest = session.trail.back()?;
        let (speed_kmh, speed_source) = self.effective_speed(&session.trail);
        let distance_km = haversine_km(&latest.point, &target);

        session.estimate = Some(Estimate {
            distance_km,
            eta_minutes: eta_minutes(distance_km, speed_kmh),
            bearing_deg: bearing_deg(&latest.point, &target),
            speed_kmh,
            speed_source,
        });

        let distance_m = distance_km * 1000.0;
        if distance_m <= self.settings.arrival_radius_m && !session.nearby_notified {
            session.nearby_notified = true;
            return Some(distance_m);
        }

        None
    }

    fn effective_speed(&self, trail: &VecDeque<LocationSample>) -> (f64, SpeedSource) {
        if let Some(speed) = trail.back().and_then(|latest| latest.speed_kmh) {
            if self.is_plausible(speed) {
                return (speed, SpeedSource::Reported);
            }
        }

        let window = trail.len().min(self.settings.speed_window);
        let recent: Vec<&LocationSample> = trail.iter().skip(trail.len() - window).collect();

        let speeds: Vec<f64> = recent
            .iter()
            .enumerate()
            .filter_map(|(i, sample)| {
                sample
                    .speed_kmh
                    .filter(|speed| self.is_plausible(*speed))
                    .or_else(|| {
                        let previous = recent.get(i.checked_sub(1)?)?;
                        derived_speed_kmh(previous, sample).filter(|speed| self.is_plausible(*speed))
                    })
            })
            .collect();

        if speeds.is_empty() {
            return (self.settings.fallback_speed_kmh, SpeedSource::Fallback);
        }

        let average = speeds.iter().sum::<f64>() / speeds.len() as f64;
        (average, SpeedSource::RollingAverage)
    }

    fn is_plausible(&self, speed_kmh: f64) -> bool {
        speed_kmh.is_finite() && speed_kmh > 0.0 && speed_kmh <= self.settings.max_plausible_speed_kmh
    }

    fn feed_health(&self, session: &TrackingSession, now: DateTime<Utc>) -> FeedHealth {
        let since = session.last_ingested_at.unwrap_or(session.started_at);
        let silent = now - since;

        if silent > self.settings.stale_after {
            FeedHealth::Stale {
                silent_secs: silent.num_seconds(),
            }
        } else if session.last_ingested_at.is_none() {
            FeedHealth::NoSignal
        } else {
            FeedHealth::Live
        }
    }
}

fn derived_speed_kmh(previous: &LocationSample, current: &LocationSample) -> Option<f64> {
    let elapsed_ms = (current.recorded_at - previous.recorded_at).num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }

    let hours = elapsed_ms as f64 / 3_600_000.0;
    Some(haversine_km(&previous.point, &current.point) / hours)
}

fn validate_input(input: &SampleInput) -> Result<(), AppError> {
    if !is_valid_point(&input.point) {
        return Err(AppError::BadRequest(format!(
            "invalid coordinates ({}, {})",
            input.point.lat, input.point.lng
        )));
    }

    let negative_or_nan = |value: Option<f64>| value.is_some_and(|v| !v.is_finite() || v < 0.0);
    if negative_or_nan(input.speed_kmh) || negative_or_nan(input.accuracy_m) {
        return Err(AppError::BadRequest(
            "speed and accuracy must be non-negative numbers".to_string(),
        ));
    }

    Ok(())
}
