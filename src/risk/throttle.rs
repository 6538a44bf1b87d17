use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{AppError, AppResult};

/// Per `(user, service)` claim cooldown. Injected into the intake path so a
/// shared backend can replace the process-local one.
#[async_trait]
pub trait ClaimThrottle: Send + Sync {
    /// Records a claim, or fails with `RateLimited` while the cooldown runs.
    async fn check_and_record(&self, user_address: &str, service_id: &str) -> AppResult<()>;

    /// Forgets a recorded claim, used when the intake was rejected afterwards.
    async fn release(&self, user_address: &str, service_id: &str);

    /// Drops entries whose cooldown has elapsed. Returns how many were removed.
    async fn cleanup_expired(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct InMemoryClaimThrottle {
    cooldown: Duration,
    /// (user, service) -> last accepted claim
    claims: Arc<RwLock<HashMap<(String, String), DateTime<Utc>>>>,
}

impl InMemoryClaimThrottle {
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::seconds(60)),
            claims: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn key(user_address: &str, service_id: &str) -> (String, String) {
        (user_address.to_string(), service_id.to_string())
    }
}

#[async_trait]
impl ClaimThrottle for InMemoryClaimThrottle {
    async fn check_and_record(&self, user_address: &str, service_id: &str) -> AppResult<()> {
        let now = Utc::now();
        let mut claims = self.claims.write().await;
        let key = Self::key(user_address, service_id);

        if let Some(last) = claims.get(&key) {
            let ready_at = *last + self.cooldown;
            if now < ready_at {
                let remaining = (ready_at - now).num_seconds().max(1) as u64;
                return Err(AppError::RateLimited { retry_after_secs: remaining });
            }
        }

        claims.insert(key, now);
        Ok(())
    }

    async fn release(&self, user_address: &str, service_id: &str) {
        let mut claims = self.claims.write().await;
        claims.remove(&Self::key(user_address, service_id));
    }

    async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut claims = self.claims.write().await;
        let before = claims.len();
        claims.retain(|_, last| *last + self.cooldown > now);
        let removed = before - claims.len();
        if removed > 0 {
            debug!("🧹 Dropped {} expired claim cooldowns", removed);
        }
        removed
    }
}
