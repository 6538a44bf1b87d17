use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::{Alert, AlertSink, LogAlertSink};

/// Posts alerts to the admin API with a bearer key
pub struct WebhookAlertSink {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { url, api_key, client }
    }

    async fn post(&self, alert: &Alert) -> Result<(), reqwest::Error> {
        let mut request = self.client.post(&self.url).json(alert);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: Alert) {
        // Always keep a local trace, the webhook may be down
        LogAlertSink.notify(alert.clone()).await;

        match self.post(&alert).await {
            Ok(()) => info!("📨 Alert {:?} delivered", alert.alert_type),
            Err(e) => warn!("Failed to deliver alert {:?}: {}", alert.alert_type, e),
        }
    }
}
