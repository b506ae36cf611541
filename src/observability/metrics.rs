use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub order_transitions_total: IntCounterVec,
    pub offer_outcomes_total: IntCounterVec,
    pub acceptance_latency_seconds: Histogram,
    pub otp_verifications_total: IntCounterVec,
    pub notifications_total: IntCounterVec,
    pub channel_send_failures_total: IntCounter,
    pub outbound_queue_depth: IntGauge,
    pub active_deliveries: IntGauge,
    pub stale_feeds: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Committed order transitions by target status"),
            &["to"],
        )
        .expect("valid order_transitions_total metric");

        let offer_outcomes_total = IntCounterVec::new(
            Opts::new("offer_outcomes_total", "Match offer lifecycle outcomes"),
            &["outcome"],
        )
        .expect("valid offer_outcomes_total metric");

        let acceptance_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "acceptance_latency_seconds",
                "Time from first broadcast to the winning acceptance",
            )
            .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 240.0, 480.0]),
        )
        .expect("valid acceptance_latency_seconds metric");

        let otp_verifications_total = IntCounterVec::new(
            Opts::new("otp_verifications_total", "Delivery code checks by outcome"),
            &["outcome"],
        )
        .expect("valid otp_verifications_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Notifications appended to feeds by kind"),
            &["kind"],
        )
        .expect("valid notifications_total metric");

        let channel_send_failures_total = IntCounter::new(
            "channel_send_failures_total",
            "Outbound messages the channel sender failed to deliver",
        )
        .expect("valid channel_send_failures_total metric");

        let outbound_queue_depth =
            IntGauge::new("outbound_queue_depth", "Outbound messages waiting for the channel worker")
                .expect("valid outbound_queue_depth metric");

        let active_deliveries =
            IntGauge::new("active_deliveries", "Orders currently out for delivery and tracked")
                .expect("valid active_deliveries metric");

        let stale_feeds = IntGauge::new("stale_feeds", "Tracked couriers whose position feed is stale")
            .expect("valid stale_feeds metric");

        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(offer_outcomes_total.clone()))
            .expect("register offer_outcomes_total");
        registry
            .register(Box::new(acceptance_latency_seconds.clone()))
            .expect("register acceptance_latency_seconds");
        registry
            .register(Box::new(otp_verifications_total.clone()))
            .expect("register otp_verifications_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");
        registry
            .register(Box::new(channel_send_failures_total.clone()))
            .expect("register channel_send_failures_total");
        registry
            .register(Box::new(outbound_queue_depth.clone()))
            .expect("register outbound_queue_depth");
        registry
            .register(Box::new(active_deliveries.clone()))
            .expect("register active_deliveries");
        registry
            .register(Box::new(stale_feeds.clone()))
            .expect("register stale_feeds");

        Self {
            registry,
            order_transitions_total,
            offer_outcomes_total,
            acceptance_latency_seconds,
            otp_verifications_total,
            notifications_total,
            channel_send_failures_total,
            outbound_queue_depth,
            active_deliveries,
            stale_feeds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
