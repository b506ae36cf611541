use std::sync::Arc;
use std::time::Instant;

use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::state::AppState;

/// Periodic housekeeping: offer timeouts, feed staleness and orphaned ready orders.
pub async fn run_sweeper(state: Arc<AppState>, period: Duration) {
    info!(period_ms = period.as_millis() as u64, "sweeper started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let start = Instant::now();
        let report = state.orders.sweep();

        if report.timed_out.is_empty()
            && report.stale_feeds.is_empty()
            && report.resumed_matching.is_empty()
        {
            continue;
        }

        debug!(
            timed_out = report.timed_out.len(),
            stale_feeds = report.stale_feeds.len(),
            resumed_matching = report.resumed_matching.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "sweep finished"
        );
    }
}
