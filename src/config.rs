use serde::Deserialize;
use std::{str::FromStr, time::Duration};

use crate::{
    execution::solana::ConfirmationConfig,
    relay::processor::ProcessorConfig,
    risk::controls::GuardConfig,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub bind_address: String,
    pub solana_rpc_url: String,
    /// Comma-separated base58 secrets, one processor per relayer
    pub relayer_secrets_b58: Vec<String>,
    pub master_treasury_secret_b58: Option<String>,
    pub gasless_program_id: String,
    pub protocol_fee_bps: u16,
    pub max_retries: u32,
    pub poll_interval_ms: u64,
    pub expiry_sweep_interval_secs: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub defer_delay_ms: u64,
    pub relayer_safety_multiplier: u64,
    pub treasury_safety_multiplier: u64,
    pub estimated_fee_lamports: u64,
    pub confirmation_timeout_secs: u64,
    pub confirmation_poll_ms: u64,
    pub alert_webhook_url: Option<String>,
    pub alert_api_key: Option<String>,
    pub alert_cooldown_secs: u64,
    pub claim_cooldown_secs: u64,
    pub claim_cleanup_interval_secs: u64,
    /// How often each processor retries its own missing reimbursements
    pub reconcile_interval_secs: u64,
    pub cors_allowed_origins: Vec<String>,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    /// JSON array of services upserted at startup
    pub services_json: Option<String>,
}

/// A tenant registered from configuration
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSeed {
    pub service_id: String,
    #[serde(default)]
    pub service_fee_bps: u16,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub allowed_programs: Vec<String>,
}

fn default_active() -> bool {
    true
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: optional("DATABASE_URL"),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            solana_rpc_url: std::env::var("SOLANA_RPC_URL")
                .unwrap_or_else(|_| "http://localhost:8899".to_string()),
            relayer_secrets_b58: list("RELAYER_SECRETS_B58"),
            master_treasury_secret_b58: optional("MASTER_TREASURY_SECRET_B58"),
            gasless_program_id: std::env::var("GASLESS_PROGRAM_ID")
                .map_err(|_| config::ConfigError::NotFound("GASLESS_PROGRAM_ID".to_string()))?,
            protocol_fee_bps: parsed("PROTOCOL_FEE_BPS", 0)?,
            max_retries: parsed("MAX_RETRIES", 3)?,
            poll_interval_ms: parsed("POLL_INTERVAL_MS", 1_000)?,
            expiry_sweep_interval_secs: parsed("EXPIRY_SWEEP_INTERVAL_SECS", 30)?,
            retry_backoff_base_ms: parsed("RETRY_BACKOFF_BASE_MS", 1_000)?,
            retry_backoff_max_ms: parsed("RETRY_BACKOFF_MAX_MS", 60_000)?,
            defer_delay_ms: parsed("DEFER_DELAY_MS", 5_000)?,
            relayer_safety_multiplier: parsed("RELAYER_SAFETY_MULTIPLIER", 2)?,
            treasury_safety_multiplier: parsed("TREASURY_SAFETY_MULTIPLIER", 10)?,
            estimated_fee_lamports: parsed("ESTIMATED_FEE_LAMPORTS", 5_000)?,
            confirmation_timeout_secs: parsed("CONFIRMATION_TIMEOUT_SECS", 60)?,
            confirmation_poll_ms: parsed("CONFIRMATION_POLL_MS", 500)?,
            alert_webhook_url: optional("ALERT_WEBHOOK_URL"),
            alert_api_key: optional("ALERT_API_KEY"),
            alert_cooldown_secs: parsed("ALERT_COOLDOWN_SECS", 300)?,
            claim_cooldown_secs: parsed("CLAIM_COOLDOWN_SECS", 60)?,
            claim_cleanup_interval_secs: parsed("CLAIM_CLEANUP_INTERVAL_SECS", 3_600)?,
            reconcile_interval_secs: parsed("RECONCILE_INTERVAL_SECS", 300)?,
            cors_allowed_origins: list("CORS_ALLOWED_ORIGINS"),
            rate_limit_requests: parsed("RATE_LIMIT_REQUESTS", 100)?,
            rate_limit_window_secs: parsed("RATE_LIMIT_WINDOW_SECS", 60)?,
            services_json: optional("SERVICES_JSON"),
        })
    }

    pub fn service_seeds(&self) -> Result<Vec<ServiceSeed>, config::ConfigError> {
        match &self.services_json {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| config::ConfigError::Message(format!("SERVICES_JSON is invalid: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            max_retries: self.max_retries,
            estimated_fee: self.estimated_fee_lamports,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            expiry_sweep_interval: Duration::from_secs(self.expiry_sweep_interval_secs),
            backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
            defer_delay: Duration::from_millis(self.defer_delay_ms),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
        }
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            relayer_multiplier: self.relayer_safety_multiplier,
            treasury_multiplier: self.treasury_safety_multiplier,
        }
    }

    pub fn confirmation_config(&self) -> ConfirmationConfig {
        ConfirmationConfig {
            timeout: Duration::from_secs(self.confirmation_timeout_secs),
            poll_interval: Duration::from_millis(self.confirmation_poll_ms),
        }
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Comma-separated values, blanks dropped
fn list(key: &str) -> Vec<String> {
    optional(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T, config::ConfigError> {
    match optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| config::ConfigError::Message(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_falls_back_to_default() {
        let value: u64 = parsed("GASLESS_RELAYER_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_service_seeds_fill_defaults() {
        let raw = r#"[{"serviceId":"svc-1","serviceFeeBps":100,"allowedPrograms":["Prog"]},{"serviceId":"svc-2","isActive":false}]"#;
        let seeds: Vec<ServiceSeed> = serde_json::from_str(raw).unwrap();

        assert_eq!(seeds[0].service_fee_bps, 100);
        assert!(seeds[0].is_active);
        assert_eq!(seeds[1].service_fee_bps, 0);
        assert!(!seeds[1].is_active);
        assert!(seeds[1].allowed_programs.is_empty());
    }

    #[test]
    fn test_list_drops_blanks() {
        std::env::set_var("GASLESS_RELAYER_TEST_LIST_KEY", "a, ,b,");
        assert_eq!(list("GASLESS_RELAYER_TEST_LIST_KEY"), vec!["a".to_string(), "b".to_string()]);
        std::env::remove_var("GASLESS_RELAYER_TEST_LIST_KEY");
    }

    #[test]
    fn test_parsed_rejects_garbage() {
        std::env::set_var("GASLESS_RELAYER_TEST_BAD_KEY", "not-a-number");
        let value: Result<u32, _> = parsed("GASLESS_RELAYER_TEST_BAD_KEY", 1);
        assert!(value.is_err());
        std::env::remove_var("GASLESS_RELAYER_TEST_BAD_KEY");
    }
}
