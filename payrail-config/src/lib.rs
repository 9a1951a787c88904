use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Runtime settings, sourced from the process environment. Required values
/// without defaults (DATABASE_URL) fail the load; per-service secrets are
/// checked by the accessor of the service that needs them so the API can run
/// without exchange credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub binance_api_key: Option<String>,
    pub binance_api_secret: Option<String>,
    pub webhook_secret: Option<String>,
    pub sentry_dsn: Option<String>,
    pub binance_base_url: String,
    pub api_addr: String,
    pub db_pool_size: u32,
    pub amount_diff_k: u32,
    pub invoice_creation_max_attempts: u32,
    pub poller_poll_interval_seconds: u64,
    pub poller_window_ms: i64,
    pub poller_initial_lookback_ms: i64,
    pub default_confirmations: i32,
    pub webhook_worker_poll_seconds: u64,
    pub webhook_max_attempts: i32,
    pub webhook_backoff_base_seconds: i64,
    pub poller_metrics_port: u16,
    pub webhook_metrics_port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("binance_base_url", "https://api.binance.com")?
            .set_default("api_addr", "0.0.0.0:8080")?
            .set_default("db_pool_size", 5i64)?
            .set_default("amount_diff_k", 3i64)?
            .set_default("invoice_creation_max_attempts", 5i64)?
            .set_default("poller_poll_interval_seconds", 20i64)?
            .set_default("poller_window_ms", 300_000i64)?
            .set_default("poller_initial_lookback_ms", 86_400_000i64)?
            .set_default("default_confirmations", 2i64)?
            .set_default("webhook_worker_poll_seconds", 2i64)?
            .set_default("webhook_max_attempts", 10i64)?
            .set_default("webhook_backoff_base_seconds", 1i64)?
            .set_default("poller_metrics_port", 8002i64)?
            .set_default("webhook_metrics_port", 8001i64)?
            .add_source(config::Environment::default());
        let cfg = builder.build()?;
        cfg.try_deserialize()
            .context("invalid environment configuration")
    }

    /// Exchange credentials; the poller refuses to start without them.
    pub fn binance_credentials(&self) -> Result<(&str, &str)> {
        let key = self
            .binance_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("BINANCE_API_KEY must be set"))?;
        let secret = self
            .binance_api_secret
            .as_deref()
            .ok_or_else(|| anyhow!("BINANCE_API_SECRET must be set"))?;
        Ok((key, secret))
    }

    /// Webhook signing secret; the dispatcher refuses to start without it.
    pub fn webhook_secret(&self) -> Result<&str> {
        self.webhook_secret
            .as_deref()
            .ok_or_else(|| anyhow!("WEBHOOK_SECRET must be set"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_from_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/payrail_test");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.amount_diff_k, 3);
        assert_eq!(settings.invoice_creation_max_attempts, 5);
        assert_eq!(settings.poller_window_ms, 300_000);
        assert_eq!(settings.poller_initial_lookback_ms, 86_400_000);
        assert_eq!(settings.webhook_max_attempts, 10);
        assert_eq!(settings.poller_metrics_port, 8002);
        assert_eq!(settings.webhook_metrics_port, 8001);
        assert!(settings.binance_credentials().is_err());
        assert!(settings.webhook_secret().is_err());
    }
}
