use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::clock::{Clock, SystemClock};
use crate::config::DeliverySettings;
use crate::engine::coordinator::DeliveryCoordinator;
use crate::engine::dispatcher::NotificationDispatcher;
use crate::engine::otp::OtpGate;
use crate::engine::state_machine::OrderStateMachine;
use crate::engine::tracker::LocationTracker;
use crate::external::{CoordinateGeocoder, Geocoder, OutboundMessage};
use crate::observability::metrics::Metrics;
use crate::store::{MemoryStore, Store};

/// Service instances built once per process and shared by the HTTP layer and background tasks.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub orders: OrderStateMachine,
    pub coordinator: Arc<DeliveryCoordinator>,
    pub tracker: Arc<LocationTracker>,
    pub otp: Arc<OtpGate>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        settings: DeliverySettings,
        outbound_queue_size: usize,
        event_buffer_size: usize,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        Self::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            Arc::new(CoordinateGeocoder),
            settings,
            outbound_queue_size,
            event_buffer_size,
        )
    }

    pub fn with_parts(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        geocoder: Arc<dyn Geocoder>,
        settings: DeliverySettings,
        outbound_queue_size: usize,
        event_buffer_size: usize,
    ) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_queue_size);
        let (events_tx, _unused_rx) = broadcast::channel(event_buffer_size);
        let metrics = Metrics::new();

        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            clock.clone(),
            settings.notifications,
            outbound_tx,
            events_tx,
            metrics.clone(),
        ));
        let coordinator = Arc::new(DeliveryCoordinator::new(
            store.clone(),
            clock.clone(),
            dispatcher.clone(),
            settings.matching,
            metrics.clone(),
        ));
        let tracker = Arc::new(LocationTracker::new(
            store.clone(),
            clock.clone(),
            dispatcher.clone(),
            settings.tracking,
            metrics.clone(),
        ));
        let otp = Arc::new(OtpGate::new(
            store.clone(),
            clock.clone(),
            settings.otp,
            metrics.clone(),
        ));
        let orders = OrderStateMachine::new(
            store.clone(),
            clock.clone(),
            coordinator.clone(),
            tracker.clone(),
            otp.clone(),
            dispatcher.clone(),
            geocoder,
            metrics.clone(),
        );

        (
            Self {
                store,
                clock,
                orders,
                coordinator,
                tracker,
                otp,
                dispatcher,
                metrics,
            },
            outbound_rx,
        )
    }
}
