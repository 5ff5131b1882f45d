use anyhow::Context;
use anyhow::Result;
use std::str::FromStr;
use std::time::Duration;

/// Gateway tunables, sourced from the environment. The process-level knobs
/// (bind address, database path, log format) live on the CLI instead.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Accepted skew of `X-Timestamp` around server time, inclusive.
    pub sign_window_secs: i64,
    /// Lifetime of a used nonce; at least the signing window.
    pub nonce_ttl_secs: i64,
    pub invoice_ttl_secs: i64,
    pub paid_cache_ttl_secs: i64,
    pub rate_limit_per_minute: u32,
    pub webhook_max_attempts: i32,
    pub webhook_backoff_base_secs: i64,
    pub webhook_timeout_ms: u64,
    pub scheduler_interval_ms: u64,
    pub upstream_endpoint: String,
    pub upstream_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sign_window_secs: 60,
            nonce_ttl_secs: 120,
            invoice_ttl_secs: 600,
            paid_cache_ttl_secs: 3600,
            rate_limit_per_minute: 120,
            webhook_max_attempts: 8,
            webhook_backoff_base_secs: 60,
            webhook_timeout_ms: 8000,
            scheduler_interval_ms: 15000,
            upstream_endpoint: "http://localhost:3000".to_string(),
            upstream_timeout_ms: 8000,
        }
    }
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("Could not parse {key}={value}: {e}")),
        Err(_) => Ok(default),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();

        let settings = Self {
            sign_window_secs: env_parsed("GATEWAY_SIGN_WINDOW_SECS", defaults.sign_window_secs)?,
            nonce_ttl_secs: env_parsed("GATEWAY_NONCE_TTL_SECS", defaults.nonce_ttl_secs)?,
            invoice_ttl_secs: env_parsed("GATEWAY_INVOICE_TTL_SECS", defaults.invoice_ttl_secs)?,
            paid_cache_ttl_secs: env_parsed(
                "GATEWAY_PAID_CACHE_TTL_SECS",
                defaults.paid_cache_ttl_secs,
            )?,
            rate_limit_per_minute: env_parsed(
                "GATEWAY_RATE_LIMIT_PER_MINUTE",
                defaults.rate_limit_per_minute,
            )?,
            webhook_max_attempts: env_parsed(
                "GATEWAY_WEBHOOK_MAX_ATTEMPTS",
                defaults.webhook_max_attempts,
            )?,
            webhook_backoff_base_secs: env_parsed(
                "GATEWAY_WEBHOOK_BACKOFF_BASE_SECS",
                defaults.webhook_backoff_base_secs,
            )?,
            webhook_timeout_ms: env_parsed("GATEWAY_WEBHOOK_TIMEOUT_MS", defaults.webhook_timeout_ms)?,
            scheduler_interval_ms: env_parsed(
                "GATEWAY_SCHEDULER_INTERVAL_MS",
                defaults.scheduler_interval_ms,
            )?,
            upstream_endpoint: env_parsed(
                "GATEWAY_UPSTREAM_ENDPOINT",
                defaults.upstream_endpoint.clone(),
            )?,
            upstream_timeout_ms: env_parsed(
                "GATEWAY_UPSTREAM_TIMEOUT_MS",
                defaults.upstream_timeout_ms,
            )?,
        };

        anyhow::ensure!(
            settings.nonce_ttl_secs >= settings.sign_window_secs,
            "Nonce TTL must cover the signing window"
        );
        settings
            .validate_positive()
            .context("Settings must be positive")?;

        Ok(settings)
    }

    fn validate_positive(&self) -> Result<()> {
        anyhow::ensure!(self.sign_window_secs > 0, "sign window must be positive");
        anyhow::ensure!(self.invoice_ttl_secs > 0, "invoice TTL must be positive");
        anyhow::ensure!(self.paid_cache_ttl_secs > 0, "paid cache TTL must be positive");
        anyhow::ensure!(self.rate_limit_per_minute > 0, "rate limit must be positive");
        anyhow::ensure!(self.webhook_max_attempts > 0, "webhook attempts must be positive");
        anyhow::ensure!(
            self.webhook_backoff_base_secs > 0,
            "webhook backoff must be positive"
        );
        anyhow::ensure!(
            self.scheduler_interval_ms > 0,
            "scheduler interval must be positive"
        );
        Ok(())
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = Settings::default();

        assert_eq!(settings.sign_window_secs, 60);
        assert_eq!(settings.nonce_ttl_secs, 120);
        assert_eq!(settings.invoice_ttl_secs, 600);
        assert_eq!(settings.paid_cache_ttl_secs, 3600);
        assert_eq!(settings.rate_limit_per_minute, 120);
        assert_eq!(settings.webhook_max_attempts, 8);
        assert_eq!(settings.webhook_backoff_base_secs, 60);
        assert_eq!(settings.webhook_timeout_ms, 8000);
        assert_eq!(settings.scheduler_interval_ms, 15000);
    }

    #[test]
    fn env_override_is_parsed() {
        std::env::set_var("GATEWAY_TEST_ONLY_KNOB", "42");
        let value: i64 = env_parsed("GATEWAY_TEST_ONLY_KNOB", 7).unwrap();
        assert_eq!(value, 42);

        std::env::set_var("GATEWAY_TEST_ONLY_KNOB", "not-a-number");
        assert!(env_parsed::<i64>("GATEWAY_TEST_ONLY_KNOB", 7).is_err());
        std::env::remove_var("GATEWAY_TEST_ONLY_KNOB");
    }
}
