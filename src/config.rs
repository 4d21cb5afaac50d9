use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub settlement_api_url: String,
    pub settlement_api_key: String,
    pub card_api_url: String,
    pub card_api_key: String,

    /// How often the payment monitoring job ticks
    pub monitor_interval: Duration,
    /// Max queue entries processed per monitoring tick
    pub monitor_batch_size: usize,
    /// Transient fetch failures tolerated before a payment is parked as monitoring_failed
    pub monitor_retry_ceiling: u32,
    /// Base delay for exponential backoff between fetch retries
    pub monitor_backoff_base: Duration,

    /// How often the renewal sweep job ticks
    pub renewal_interval: Duration,
    /// Window before end_date in which subscriptions without next_billing_at become due
    pub renewal_lookahead: Duration,
    /// How far next_billing_at is pushed out when a renewal attempt cannot complete
    pub renewal_retry_interval: Duration,

    /// Lease TTL for job locks
    pub job_lock_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/subpay".to_string()),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            settlement_api_url: std::env::var("SETTLEMENT_API_URL")
                .unwrap_or_else(|_| "https://api.nowpayments.io/v1".to_string()),
            settlement_api_key: std::env::var("SETTLEMENT_API_KEY").unwrap_or_default(),
            card_api_url: std::env::var("CARD_API_URL")
                .unwrap_or_else(|_| "https://gate.lava.top/api/v2".to_string()),
            card_api_key: std::env::var("CARD_API_KEY").unwrap_or_default(),
            monitor_interval: Duration::from_secs(env_u64("MONITOR_INTERVAL_SECS", 60)),
            monitor_batch_size: env_u64("MONITOR_BATCH_SIZE", 25) as usize,
            monitor_retry_ceiling: env_u64("MONITOR_RETRY_CEILING", 5) as u32,
            monitor_backoff_base: Duration::from_secs(env_u64("MONITOR_BACKOFF_BASE_SECS", 30)),
            renewal_interval: Duration::from_secs(env_u64("RENEWAL_INTERVAL_SECS", 3600)),
            renewal_lookahead: Duration::from_secs(env_u64("RENEWAL_LOOKAHEAD_SECS", 86400)),
            renewal_retry_interval: Duration::from_secs(env_u64(
                "RENEWAL_RETRY_INTERVAL_SECS",
                21600,
            )),
            job_lock_ttl: Duration::from_secs(env_u64("JOB_LOCK_TTL_SECS", 300)),
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.monitor_batch_size, 25);
        assert_eq!(config.monitor_retry_ceiling, 5);
        assert!(config.job_lock_ttl >= config.monitor_interval);
    }
}
