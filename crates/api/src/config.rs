//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use checkout::{CheckoutConfig, SweeperConfig};
use outbox::RelayConfig;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// Server configuration.
///
/// Every setting has a default; see [`Config::from_env`] for the variable
/// names.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Unset runs on the in-memory store.
    pub database_url: Option<String>,
    pub checkout: CheckoutConfig,
    pub sweeper: SweeperConfig,
    pub relay: RelayConfig,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `HOST` | `0.0.0.0` |
    /// | `PORT` | `3000` |
    /// | `RUST_LOG` | `info` |
    /// | `LOG_FORMAT` | `pretty` (`json` for JSON lines) |
    /// | `DATABASE_URL` | unset |
    /// | `PAYMENT_CALLBACK_URL` | `http://localhost:3000/payments/callback` |
    /// | `GATEWAY_TIMEOUT_SECS` | `10` |
    /// | `DUPLICATE_ORDER_WINDOW_SECS` | `30` |
    /// | `PAYMENT_WINDOW_MINS` | `20` |
    /// | `SWEEP_INTERVAL_SECS` | `60` |
    /// | `STUCK_PAYMENT_TIMEOUT_MINS` | `5` |
    /// | `SWEEP_ERROR_THRESHOLD` | `5` |
    /// | `OUTBOX_POLL_INTERVAL_MS` | `1000` |
    /// | `OUTBOX_BATCH_SIZE` | `100` |
    /// | `OUTBOX_MAX_RETRIES` | `10` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let checkout = CheckoutConfig {
            callback_url: lookup("PAYMENT_CALLBACK_URL").unwrap_or(defaults.checkout.callback_url),
            gateway_timeout: Duration::from_secs(parse_or(
                &lookup,
                "GATEWAY_TIMEOUT_SECS",
                defaults.checkout.gateway_timeout.as_secs(),
            )?),
            duplicate_order_window: chrono::Duration::seconds(parse_or(
                &lookup,
                "DUPLICATE_ORDER_WINDOW_SECS",
                defaults.checkout.duplicate_order_window.num_seconds(),
            )?),
        };

        let sweeper = SweeperConfig {
            interval: Duration::from_secs(parse_or(
                &lookup,
                "SWEEP_INTERVAL_SECS",
                defaults.sweeper.interval.as_secs(),
            )?),
            stuck_payment_timeout: chrono::Duration::minutes(parse_or(
                &lookup,
                "STUCK_PAYMENT_TIMEOUT_MINS",
                defaults.sweeper.stuck_payment_timeout.num_minutes(),
            )?),
            payment_window: chrono::Duration::minutes(parse_or(
                &lookup,
                "PAYMENT_WINDOW_MINS",
                defaults.sweeper.payment_window.num_minutes(),
            )?),
            error_threshold: parse_or(
                &lookup,
                "SWEEP_ERROR_THRESHOLD",
                defaults.sweeper.error_threshold,
            )?,
            ..defaults.sweeper
        };

        let relay = RelayConfig {
            poll_interval: Duration::from_millis(parse_or(
                &lookup,
                "OUTBOX_POLL_INTERVAL_MS",
                defaults.relay.poll_interval.as_millis() as u64,
            )?),
            batch_size: parse_or(&lookup, "OUTBOX_BATCH_SIZE", defaults.relay.batch_size)?,
            max_retries: parse_or(&lookup, "OUTBOX_MAX_RETRIES", defaults.relay.max_retries)?,
        };

        let log_format = match lookup("LOG_FORMAT") {
            Some(value) => value.parse().map_err(|()| ConfigError::InvalidValue {
                key: "LOG_FORMAT",
                value,
            })?,
            None => defaults.log_format,
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            checkout,
            sweeper,
            relay,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            checkout: CheckoutConfig::default(),
            sweeper: SweeperConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.database_url.is_none());
        assert_eq!(config.checkout.gateway_timeout, Duration::from_secs(10));
        assert_eq!(config.sweeper.payment_window, chrono::Duration::minutes(20));
        assert_eq!(config.relay.max_retries, 10);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "json"),
            ("DATABASE_URL", "postgres://localhost/shop"),
            ("PAYMENT_WINDOW_MINS", "45"),
            ("SWEEP_ERROR_THRESHOLD", "2"),
            ("OUTBOX_BATCH_SIZE", "10"),
        ])
        .unwrap();

        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/shop"));
        assert_eq!(config.sweeper.payment_window, chrono::Duration::minutes(45));
        assert_eq!(config.sweeper.error_threshold, 2);
        assert_eq!(config.relay.batch_size, 10);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = load(&[("SWEEP_INTERVAL_SECS", "soon")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "SWEEP_INTERVAL_SECS",
                value: "soon".to_string(),
            }
        );
    }

    #[test]
    fn test_empty_database_url_means_in_memory() {
        let config = load(&[("DATABASE_URL", "")]).unwrap();
        assert!(config.database_url.is_none());
    }
}
