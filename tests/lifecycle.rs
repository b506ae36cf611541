use std::str::FromStr;
use std::sync::{Arc, Barrier};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Duration, Utc};
use grocery_dispatch::clock::{Clock, ManualClock};
use grocery_dispatch::config::DeliverySettings;
use grocery_dispatch::engine::tracker::SampleInput;
use grocery_dispatch::error::{AppError, OtpError};
use grocery_dispatch::external::{CoordinateGeocoder, Geocoder, OutboundMessage};
use grocery_dispatch::models::courier::{Courier, CourierPosition, GeoPoint};
use grocery_dispatch::models::event::DeliveryEvent;
use grocery_dispatch::models::location::FeedHealth;
use grocery_dispatch::models::notification::{Audience, NotificationKind};
use grocery_dispatch::models::offer::TimeoutOutcome;
use grocery_dispatch::models::order::{
    ActorRole, Customer, LineItem, NewOrder, Order, OrderStatus, PaymentState,
};
use grocery_dispatch::state::AppState;
use grocery_dispatch::store::{CourierFilter, MemoryStore, Store};
use tokio::sync::mpsc;
use uuid::Uuid;

const CUSTOMER: GeoPoint = GeoPoint {
    lat: 52.5290,
    lng: 13.4010,
};

struct World {
    state: AppState,
    clock: Arc<ManualClock>,
    _outbound_rx: mpsc::Receiver<OutboundMessage>,
}

fn world() -> World {
    world_with_geocoder(Arc::new(CoordinateGeocoder))
}

fn world_with_geocoder(geocoder: Arc<dyn Geocoder>) -> World {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let (state, outbound_rx) = AppState::with_parts(
        Arc::new(MemoryStore::new()),
        clock.clone(),
        geocoder,
        DeliverySettings::default(),
        256,
        256,
    );
    World {
        state,
        clock,
        _outbound_rx: outbound_rx,
    }
}

fn new_order(customer_id: Uuid) -> NewOrder {
    NewOrder {
        customer: Customer {
            id: customer_id,
            name: "Dana".to_string(),
            phone: Some("+4915100000000".to_string()),
        },
        address: "Torstrasse 1, Berlin".to_string(),
        location: Some(CUSTOMER),
        items: vec![
            LineItem {
                product_ref: "basket-large".to_string(),
                unit_price: BigDecimal::from_str("75.50").unwrap(),
                quantity: 2,
            },
            LineItem {
                product_ref: "flowers".to_string(),
                unit_price: BigDecimal::from_str("49.00").unwrap(),
                quantity: 1,
            },
        ],
        payment_state: PaymentState::Paid,
    }
}

fn add_courier(w: &World, lat: f64, lng: f64) -> Uuid {
    let now = w.clock.now();
    let courier = Courier {
        id: Uuid::new_v4(),
        name: "rider".to_string(),
        phone: None,
        available: true,
        position: Some(CourierPosition {
            point: GeoPoint { lat, lng },
            recorded_at: now,
            speed_kmh: None,
            heading_deg: None,
            accuracy_m: None,
        }),
        active_order_id: None,
        created_at: now,
        updated_at: now,
    };
    let id = courier.id;
    w.state.store.insert_courier(courier).unwrap();
    id
}

async fn ready_order(w: &World) -> Order {
    let order = w.state.orders.create(new_order(Uuid::new_v4())).await.unwrap();
    w.state
        .orders
        .transition(order.id, OrderStatus::Confirmed, ActorRole::Operator)
        .unwrap();
    w.state
        .orders
        .transition(order.id, OrderStatus::ReadyForPickup, ActorRole::Operator)
        .unwrap()
}

fn sample_at(w: &World, point: GeoPoint) -> SampleInput {
    SampleInput {
        point,
        recorded_at: Some(w.clock.now()),
        speed_kmh: Some(18.0),
        heading_deg: None,
        accuracy_m: Some(8.0),
    }
}

fn current_code(w: &World, order_id: Uuid) -> String {
    w.state.otp.record(order_id).unwrap().unwrap().code
}

#[tokio::test]
async fn happy_path_with_racing_couriers() {
    let w = world();
    let courier_a = add_courier(&w, 52.5205, 13.4055);
    let courier_b = add_courier(&w, 52.5210, 13.4040);

    let placed = w.state.orders.create(new_order(Uuid::new_v4())).await.unwrap();
    assert_eq!(placed.total, BigDecimal::from(200));
    assert_eq!(placed.status, OrderStatus::Placed);

    w.state
        .orders
        .transition(placed.id, OrderStatus::Confirmed, ActorRole::Operator)
        .unwrap();
    let ready = w
        .state
        .orders
        .transition(placed.id, OrderStatus::ReadyForPickup, ActorRole::Operator)
        .unwrap();
    assert_eq!(ready.status, OrderStatus::ReadyForPickup);

    let code = current_code(&w, placed.id);
    assert_eq!(code.len(), 4);
    let offer = w.state.coordinator.offer(placed.id).unwrap();
    assert_eq!(offer.candidates.len(), 2);

    let barrier = Barrier::new(2);
    let results: Vec<Result<Order, AppError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = [courier_a, courier_b]
            .into_iter()
            .map(|courier_id| {
                let barrier = &barrier;
                let orders = &w.state.orders;
                scope.spawn(move || {
                    barrier.wait();
                    orders.accept_offer(placed.id, courier_id)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<&Order> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(AppError::OfferAlreadyTaken)))
    );
    let winner = winners[0].assigned_courier_id.unwrap();

    let bound: Vec<Courier> = w
        .state
        .store
        .list_couriers(&CourierFilter::default())
        .unwrap()
        .into_iter()
        .filter(|c| c.active_order_id == Some(placed.id))
        .collect();
    assert_eq!(bound.len(), 1);
    assert_eq!(bound[0].id, winner);
    assert!(!bound[0].available);

    let start = w.state.store.get_courier(winner).unwrap().unwrap().position.unwrap().point;
    let mut distances = Vec::new();
    for step in 1..=5 {
        w.clock.advance(Duration::seconds(10));
        let frac = step as f64 / 5.0;
        let point = GeoPoint {
            lat: start.lat + (CUSTOMER.lat - start.lat) * frac,
            lng: start.lng + (CUSTOMER.lng - start.lng) * frac,
        };
        let snapshot = w
            .state
            .tracker
            .ingest(winner, sample_at(&w, point))
            .unwrap()
            .unwrap();
        distances.push(snapshot.distance_km.unwrap());
    }
    assert!(distances.windows(2).all(|pair| pair[1] < pair[0]));
    assert!(w.state.tracker.snapshot(placed.id).unwrap().arrived);

    let customer_feed = w
        .state
        .dispatcher
        .feed(Audience::Customer(placed.customer.id))
        .unwrap();
    assert_eq!(
        customer_feed
            .iter()
            .filter(|n| n.kind == NotificationKind::CourierNearby)
            .count(),
        1
    );

    let delivered = w.state.orders.complete(placed.id, winner, &code).unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);

    let record = w.state.otp.record(placed.id).unwrap().unwrap();
    assert!(record.verified_at.is_some());

    let released = w.state.store.get_courier(winner).unwrap().unwrap();
    assert!(released.active_order_id.is_none());
    assert!(released.available);
    assert_eq!(w.state.tracker.active_sessions(), 0);
}

#[tokio::test]
async fn delivery_code_is_single_use() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = ready_order(&w).await;
    let code = current_code(&w, order.id);
    w.state.orders.accept_offer(order.id, courier).unwrap();

    w.state.orders.complete(order.id, courier, &code).unwrap();

    let again = w.state.otp.verify(order.id, &code);
    assert!(matches!(again, Err(AppError::Otp(OtpError::AlreadyUsed))));

    let retried = w.state.orders.complete(order.id, courier, &code).unwrap();
    assert_eq!(retried.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn expired_code_leaves_order_out_for_delivery() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = ready_order(&w).await;
    let code = current_code(&w, order.id);
    w.state.orders.accept_offer(order.id, courier).unwrap();

    w.clock.advance(Duration::minutes(31));
    let err = w.state.orders.complete(order.id, courier, &code).unwrap_err();
    assert!(matches!(err, AppError::Otp(OtpError::Expired)));
    assert_eq!(err.to_string(), "code expired, request a new one");
    assert_eq!(
        w.state.orders.get(order.id).unwrap().status,
        OrderStatus::OutForDelivery
    );

    let receipt = w
        .state
        .orders
        .reissue_code(order.id, ActorRole::Customer)
        .unwrap();
    assert!(receipt.expires_at > w.clock.now());

    let fresh = current_code(&w, order.id);
    let delivered = w.state.orders.complete(order.id, courier, &fresh).unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn wrong_codes_never_change_status() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = ready_order(&w).await;
    let code = current_code(&w, order.id);
    w.state.orders.accept_offer(order.id, courier).unwrap();

    let wrong = if code == "0000" { "1111" } else { "0000" };
    for _ in 0..4 {
        let err = w.state.orders.complete(order.id, courier, wrong).unwrap_err();
        assert!(matches!(err, AppError::Otp(OtpError::Mismatch { .. })));
    }
    let err = w.state.orders.complete(order.id, courier, wrong).unwrap_err();
    assert!(matches!(err, AppError::Otp(OtpError::TooManyAttempts)));

    let err = w.state.orders.complete(order.id, courier, &code).unwrap_err();
    assert!(matches!(err, AppError::Otp(OtpError::TooManyAttempts)));
    assert_eq!(
        w.state.orders.get(order.id).unwrap().status,
        OrderStatus::OutForDelivery
    );
}

#[tokio::test]
async fn only_assigned_courier_can_complete() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let stranger = add_courier(&w, 52.5300, 13.4100);
    let order = ready_order(&w).await;
    let code = current_code(&w, order.id);
    w.state.orders.accept_offer(order.id, courier).unwrap();

    let err = w.state.orders.complete(order.id, stranger, &code).unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn offer_timeout_expands_radius() {
    let w = world();
    // ~6 km north of the store, outside the first 5 km ring.
    let far = add_courier(&w, 52.5200 + 6.0 / 111.195, 13.4050);
    let order = ready_order(&w).await;

    let first = w.state.coordinator.offer(order.id).unwrap();
    assert!(first.candidates.is_empty());
    assert!((first.radius_km - 5.0).abs() < 1e-9);

    w.clock.advance(Duration::seconds(90));
    assert!(w.state.orders.sweep().timed_out.is_empty());

    w.clock.advance(Duration::seconds(31));
    let report = w.state.orders.sweep();
    assert_eq!(report.timed_out.len(), 1);
    assert!(matches!(
        report.timed_out[0].1,
        TimeoutOutcome::Rebroadcast { attempt: 2, candidates: 1, .. }
    ));

    let second = w.state.coordinator.offer(order.id).unwrap();
    assert!((second.radius_km - 7.5).abs() < 1e-9);
    assert_eq!(second.candidates[0].courier_id, far);
    assert!(second.candidates[0].distance_km > 5.0);

    let accepted = w.state.orders.accept_offer(order.id, far).unwrap();
    assert_eq!(accepted.status, OrderStatus::OutForDelivery);
}

#[tokio::test]
async fn unmatched_order_is_flagged_for_operator() {
    let w = world();
    let order = ready_order(&w).await;

    for _ in 0..4 {
        w.clock.advance(Duration::seconds(121));
        w.state.orders.sweep();
    }

    let flagged = w.state.orders.get(order.id).unwrap();
    assert!(flagged.manual_assignment_required);
    assert_eq!(flagged.status, OrderStatus::ReadyForPickup);
    assert!(w.state.coordinator.offer(order.id).is_none());

    w.clock.advance(Duration::seconds(121));
    let report = w.state.orders.sweep();
    assert!(report.resumed_matching.is_empty());

    let courier = add_courier(&w, 52.60, 13.50);
    let assigned = w.state.orders.assign(order.id, courier).unwrap();
    assert_eq!(assigned.status, OrderStatus::OutForDelivery);
    assert_eq!(assigned.assigned_courier_id, Some(courier));
    assert!(!assigned.manual_assignment_required);
}

#[tokio::test]
async fn repeated_requests_are_idempotent() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = ready_order(&w).await;
    let code = current_code(&w, order.id);

    let again = w
        .state
        .orders
        .transition(order.id, OrderStatus::ReadyForPickup, ActorRole::Operator)
        .unwrap();
    assert_eq!(again.status, OrderStatus::ReadyForPickup);
    assert_eq!(current_code(&w, order.id), code);

    w.state.orders.accept_offer(order.id, courier).unwrap();
    let retried = w.state.orders.accept_offer(order.id, courier).unwrap();
    assert_eq!(retried.assigned_courier_id, Some(courier));

    let courier_feed = w.state.dispatcher.feed(Audience::Courier(courier)).unwrap();
    assert_eq!(
        courier_feed
            .iter()
            .filter(|n| n.kind == NotificationKind::OutForDelivery)
            .count(),
        1
    );
}

#[tokio::test]
async fn statuses_only_move_forward() {
    let w = world();
    let mut events = w.state.dispatcher.subscribe();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = ready_order(&w).await;
    let code = current_code(&w, order.id);
    w.state.orders.accept_offer(order.id, courier).unwrap();
    w.state.orders.complete(order.id, courier, &code).unwrap();

    let err = w
        .state
        .orders
        .transition(order.id, OrderStatus::Cancelled, ActorRole::Operator)
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DeliveryEvent::StatusChanged(transition) = event {
            assert_eq!(transition.from.successor(), Some(transition.to));
            seen.push(transition.to);
        }
    }
    assert_eq!(
        seen,
        vec![
            OrderStatus::Confirmed,
            OrderStatus::ReadyForPickup,
            OrderStatus::OutForDelivery,
            OrderStatus::Delivered,
        ]
    );
}

#[tokio::test]
async fn delivery_code_is_redacted_on_event_stream() {
    let w = world();
    let mut events = w.state.dispatcher.subscribe();
    let order = ready_order(&w).await;

    let mut redacted = false;
    while let Ok(event) = events.try_recv() {
        if let DeliveryEvent::DeliveryCodeIssued { code, .. } = event {
            assert!(code.is_empty());
            redacted = true;
        }
    }
    assert!(redacted);

    let feed = w
        .state
        .dispatcher
        .feed(Audience::Customer(order.customer.id))
        .unwrap();
    let code = current_code(&w, order.id);
    assert!(
        feed.iter()
            .any(|n| n.kind == NotificationKind::DeliveryCode && n.message.contains(&code))
    );
}

#[tokio::test]
async fn cancelling_releases_courier_and_offer() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = ready_order(&w).await;

    let err = w
        .state
        .orders
        .transition(order.id, OrderStatus::Cancelled, ActorRole::Customer)
        .unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));

    w.state.orders.accept_offer(order.id, courier).unwrap();
    assert_eq!(w.state.tracker.active_sessions(), 1);

    let cancelled = w
        .state
        .orders
        .transition(order.id, OrderStatus::Cancelled, ActorRole::Operator)
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.assigned_courier_id.is_none());

    let freed = w.state.store.get_courier(courier).unwrap().unwrap();
    assert!(freed.active_order_id.is_none());
    assert!(freed.available);
    assert!(w.state.coordinator.offer(order.id).is_none());
    assert_eq!(w.state.tracker.active_sessions(), 0);
    assert!(w.state.otp.record(order.id).unwrap().is_none());

    let courier_feed = w.state.dispatcher.feed(Audience::Courier(courier)).unwrap();
    assert_eq!(courier_feed[0].kind, NotificationKind::Cancelled);
}

#[tokio::test]
async fn cancelled_order_cannot_be_accepted() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = w.state.orders.create(new_order(Uuid::new_v4())).await.unwrap();
    w.state
        .orders
        .transition(order.id, OrderStatus::Cancelled, ActorRole::Customer)
        .unwrap();

    let err = w.state.orders.accept_offer(order.id, courier).unwrap_err();
    assert!(matches!(
        err,
        AppError::InvalidTransition {
            from: OrderStatus::Cancelled,
            ..
        }
    ));
    assert!(w.state.store.get_courier(courier).unwrap().unwrap().available);
}

#[tokio::test]
async fn stale_feed_is_flagged_but_never_blocks_delivery() {
    let w = world();
    let courier = add_courier(&w, 52.5205, 13.4055);
    let order = ready_order(&w).await;
    let code = current_code(&w, order.id);
    w.state.orders.accept_offer(order.id, courier).unwrap();

    w.clock.advance(Duration::seconds(5));
    w.state
        .tracker
        .ingest(courier, sample_at(&w, GeoPoint { lat: 52.5230, lng: 13.4040 }))
        .unwrap();

    w.clock.advance(Duration::seconds(61));
    let report = w.state.orders.sweep();
    assert_eq!(report.stale_feeds, vec![order.id]);

    let snapshot = w.state.tracker.snapshot(order.id).unwrap();
    assert!(matches!(snapshot.feed, FeedHealth::Stale { .. }));
    assert!(!snapshot.eta_reliable);
    assert!(snapshot.eta_minutes.is_some());

    let delivered = w.state.orders.complete(order.id, courier, &code).unwrap();
    assert_eq!(delivered.status, OrderStatus::Delivered);
}

#[tokio::test]
async fn sweep_restarts_matching_for_orphaned_orders() {
    let w = world();
    let order = ready_order(&w).await;
    w.state.coordinator.withdraw(order.id);

    let report = w.state.orders.sweep();
    assert_eq!(report.resumed_matching, vec![order.id]);
    assert_eq!(w.state.coordinator.offer(order.id).unwrap().attempt, 1);
}

struct OfflineGeocoder;

#[async_trait]
impl Geocoder for OfflineGeocoder {
    async fn reverse_geocode(&self, _point: &GeoPoint) -> Result<String, AppError> {
        Err(AppError::Internal("geocoder offline".to_string()))
    }
}

#[tokio::test]
async fn geocoder_failure_does_not_block_placement() {
    let w = world_with_geocoder(Arc::new(OfflineGeocoder));
    let mut input = new_order(Uuid::new_v4());
    input.address = "   ".to_string();

    let order = w.state.orders.create(input).await.unwrap();
    assert_eq!(order.address, "52.52900, 13.40100");

    let mut nowhere = new_order(Uuid::new_v4());
    nowhere.address = String::new();
    nowhere.location = None;
    assert!(matches!(
        w.state.orders.create(nowhere).await,
        Err(AppError::BadRequest(_))
    ));
}
