use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TelemetryConfig;
use crate::domain::Timestamp;

pub fn init_tracing(cfg: &TelemetryConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cfg.default_filter.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if cfg.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}

/// Lifecycle events published to the external telemetry sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum EventKind {
    SensorData,
    VoteBegin,
    VoteEnd,
    VoteTimeout,
    SendReqPower,
    LeaderElected,
    LeaderLeft,
    MemberLeft,
    ReqPower,
    DuplicateRequest,
    RequestRejected,
    Optimization,
    DispatchFallback,
    AggregationStalled,
    SendPower,
    GridData,
    Actuate,
}

/// Telemetry record `{Event, Group, ID, For, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "Event")]
    pub event: EventKind,
    #[serde(rename = "Group")]
    pub group: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "For")]
    pub target: String,
    pub timestamp: Timestamp,
}

impl TelemetryEvent {
    pub fn new(
        event: EventKind,
        group: impl Into<String>,
        id: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            event,
            group: group.into(),
            id: id.into(),
            target: target.into(),
            timestamp: Timestamp::now(),
        }
    }
}

/// Fire-and-forget destination for telemetry events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Writes every event to the tracing subscriber
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        info!(
            event = %event.event,
            group = %event.group,
            id = %event.id,
            target = %event.target,
            timestamp = %event.timestamp,
            "telemetry"
        );
    }
}

/// Forwards events to an unbounded channel; a closed receiver drops them silently.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: TelemetryEvent) {
        let _ = self.tx.send(event);
    }
}
