//! Collaborators outside the delivery core: the message channel and the geocoder.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::courier::GeoPoint;
use crate::observability::metrics::Metrics;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel send failed: {0}")]
    ChannelSendFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Phone number or push token.
    pub recipient: String,
    pub template_id: &'static str,
    pub params: BTreeMap<String, String>,
    pub order_id: Option<Uuid>,
}

/// SMS/chat/push delivery. Best effort; callers never wait on the outcome of a transition.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        template_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), ChannelError>;
}

/// Default sender for deployments without an SMS/push provider wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingChannelSender;

#[async_trait]
impl ChannelSender for LoggingChannelSender {
    async fn send(
        &self,
        recipient: &str,
        template_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), ChannelError> {
        info!(recipient, template_id, params = ?params, "outbound message");
        Ok(())
    }
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(&self, point: &GeoPoint) -> Result<String, AppError>;
}

/// Formats the coordinates themselves; stands in until a real geocoding provider is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoordinateGeocoder;

#[async_trait]
impl Geocoder for CoordinateGeocoder {
    async fn reverse_geocode(&self, point: &GeoPoint) -> Result<String, AppError> {
        Ok(format_coordinates(point))
    }
}

pub fn format_coordinates(point: &GeoPoint) -> String {
    format!("{:.5}, {:.5}", point.lat, point.lng)
}

pub async fn run_channel_worker(
    sender: Arc<dyn ChannelSender>,
    metrics: Metrics,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
) {
    info!("channel worker started");

    while let Some(message) = outbound_rx.recv().await {
        metrics.outbound_queue_depth.dec();

        if let Err(err) = sender
            .send(&message.recipient, message.template_id, &message.params)
            .await
        {
            metrics.channel_send_failures_total.inc();
            warn!(
                error = %err,
                template_id = message.template_id,
                order_id = ?message.order_id,
                "outbound message dropped"
            );
        }
    }

    warn!("channel worker stopped: outbound channel closed");
}
