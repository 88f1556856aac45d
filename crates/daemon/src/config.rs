//! Environment-driven daemon configuration.
//!
//! Every knob has a `CREDFLOW_` variable and a default, so a bare
//! `credflow-daemon` starts against in-memory stores with no setup at all.
//! Unparseable values fall back to the default with a warning rather than
//! aborting startup.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use credflow_core::{BackoffPolicy, RetryInterval};
use credflow_infra::RetriggerPolicy;
use tracing::warn;

/// Runtime configuration, parsed once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Items per chunk. Also sizes the worker pool and its queue.
    pub chunk_size: usize,
    /// Minimum wait before a failed credential event is attempted again.
    pub retry_interval: RetryInterval,
    /// Resubmission policy for never-confirmed requests.
    pub retrigger: RetriggerPolicy,
    /// Cadence of the credential-store job.
    pub store_job_interval: Duration,
    /// Cadence of the retrigger job.
    pub retrigger_job_interval: Duration,
    /// Postgres connection string. Unset selects the in-memory stores.
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            retry_interval: RetryInterval::default(),
            retrigger: RetriggerPolicy::default(),
            store_job_interval: Duration::from_secs(120),
            retrigger_job_interval: Duration::from_secs(900),
            database_url: None,
        }
    }
}

impl Config {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let backoff = BackoffPolicy {
            initial_delay: Duration::from_millis(parse_or(
                &lookup,
                "CREDFLOW_BACKOFF_INITIAL_MS",
                2_000,
            )),
            multiplier: parse_or(&lookup, "CREDFLOW_BACKOFF_MULTIPLIER", 2.0),
            max_delay: Duration::from_millis(parse_or(
                &lookup,
                "CREDFLOW_BACKOFF_MAX_DELAY_MS",
                30_000,
            )),
            max_retries: parse_or(&lookup, "CREDFLOW_BACKOFF_MAX_RETRIES", 3),
        };
        let retrigger = RetriggerPolicy {
            resubmit_interval: RetryInterval::new(Duration::from_secs(parse_or(
                &lookup,
                "CREDFLOW_RESUBMIT_INTERVAL_SECS",
                600,
            ))),
            max_resubmits: parse_or(&lookup, "CREDFLOW_MAX_RESUBMITS", 3),
            backoff,
        };

        Self {
            chunk_size: parse_or(&lookup, "CREDFLOW_CHUNK_SIZE", 10),
            retry_interval: RetryInterval::new(Duration::from_secs(parse_or(
                &lookup,
                "CREDFLOW_RETRY_INTERVAL_SECS",
                60,
            ))),
            retrigger,
            store_job_interval: Duration::from_secs(parse_or(
                &lookup,
                "CREDFLOW_STORE_JOB_INTERVAL_SECS",
                120,
            )),
            retrigger_job_interval: Duration::from_secs(parse_or(
                &lookup,
                "CREDFLOW_RETRIGGER_JOB_INTERVAL_SECS",
                900,
            )),
            database_url: lookup("DATABASE_URL"),
        }
    }
}

/// Parse one variable, falling back to `default` when unset or malformed.
fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr + Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(%name, %raw, %default, "unparseable configuration value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.retry_interval.min_interval, Duration::from_secs(60));
        assert_eq!(config.retrigger, RetriggerPolicy::default());
        assert_eq!(config.store_job_interval, Duration::from_secs(120));
        assert_eq!(config.retrigger_job_interval, Duration::from_secs(900));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn variables_override_defaults() {
        let config = config_from(&[
            ("CREDFLOW_CHUNK_SIZE", "25"),
            ("CREDFLOW_RETRY_INTERVAL_SECS", "5"),
            ("CREDFLOW_MAX_RESUBMITS", "7"),
            ("CREDFLOW_BACKOFF_MULTIPLIER", "1.5"),
            ("CREDFLOW_STORE_JOB_INTERVAL_SECS", "30"),
            ("DATABASE_URL", "postgres://localhost/credflow"),
        ]);

        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.retry_interval.min_interval, Duration::from_secs(5));
        assert_eq!(config.retrigger.max_resubmits, 7);
        assert_eq!(config.retrigger.backoff.multiplier, 1.5);
        assert_eq!(config.store_job_interval, Duration::from_secs(30));
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/credflow")
        );
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("CREDFLOW_CHUNK_SIZE", "lots"),
            ("CREDFLOW_BACKOFF_MAX_RETRIES", "-1"),
            ("CREDFLOW_BACKOFF_MULTIPLIER", ""),
        ]);

        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.retrigger.backoff.max_retries, 3);
        assert_eq!(config.retrigger.backoff.multiplier, 2.0);
    }
}
