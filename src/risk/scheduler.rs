// Periodic claim cooldown cleanup

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info};

use crate::risk::throttle::ClaimThrottle;

#[derive(Debug, Clone)]
pub struct CleanupScheduleConfig {
    pub interval: Duration,
}

impl Default for CleanupScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

pub struct CleanupScheduler {
    config: CleanupScheduleConfig,
    claim_throttle: Arc<dyn ClaimThrottle>,
}

impl CleanupScheduler {
    pub fn new(config: CleanupScheduleConfig, claim_throttle: Arc<dyn ClaimThrottle>) -> Self {
        Self {
            config,
            claim_throttle,
        }
    }

    /// Start the scheduler (runs in background until shutdown flips to true)
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config.interval;
        let claim_throttle = self.claim_throttle.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately, skip it so startup stays quiet
            ticker.tick().await;

            info!("⏰ Claim cooldown cleanup scheduled every {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let removed = claim_throttle.cleanup_expired().await;
                debug!("Cleaned up {} expired claim cooldown(s)", removed);
            }

            info!("✓ Cleanup scheduler stopped");
        })
    }
}
