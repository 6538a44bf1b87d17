// Operational alerts: low balances, failed permits, failed reimbursements.

pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};

pub use webhook::WebhookAlertSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    LowRelayerBalance,
    LowMasterTreasuryBalance,
    ReimbursementFailed,
    PermitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(alert_type: AlertType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            alert_type,
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}

/// Fire-and-forget destination for alerts. Delivery failures are the sink's problem.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: Alert);
}

/// Writes alerts to the log only
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: Alert) {
        match alert.severity {
            Severity::High | Severity::Critical => {
                error!("🚨 [{:?}] {}", alert.alert_type, alert.message)
            }
            Severity::Medium => warn!("⚠️  [{:?}] {}", alert.alert_type, alert.message),
            Severity::Low => info!("🔔 [{:?}] {}", alert.alert_type, alert.message),
        }
    }
}

/// At most one alert per cause within the cooldown window
pub struct AlertThrottle {
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true and starts a new window when the cause is not cooling down.
    pub fn try_acquire(&self, cause: &str) -> bool {
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock();
        match last_sent.get(cause) {
            Some(at) if now.duration_since(*at) < self.cooldown => false,
            _ => {
                last_sent.insert(cause.to_string(), now);
                true
            }
        }
    }
}

/// Sink plus throttle, shared by every processor
pub struct Alerter {
    sink: Arc<dyn AlertSink>,
    throttle: AlertThrottle,
}

impl Alerter {
    pub fn new(sink: Arc<dyn AlertSink>, cooldown: Duration) -> Self {
        Self {
            sink,
            throttle: AlertThrottle::new(cooldown),
        }
    }

    pub async fn send(&self, alert: Alert) {
        self.sink.notify(alert).await;
    }

    /// Returns whether the alert went out.
    pub async fn send_throttled(&self, cause: &str, alert: Alert) -> bool {
        if !self.throttle.try_acquire(cause) {
            return false;
        }
        self.sink.notify(alert).await;
        true
    }
}
