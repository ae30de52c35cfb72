//! Typed configuration from environment variables.
//!
//! Loads once at startup. Every variable has a default; a variable that is
//! set but malformed fails fast instead of silently falling back.

pub mod modules;

pub use modules::{ModuleSpec, load_modules, parse_modules};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{ControllerConfig, LbPolicy, default_workers};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub lb_policy: LbPolicy,
    pub poll_interval: Duration,
    pub report_interval: Duration,
    pub worker_concurrency: usize,
    pub queue_poll_timeout: Duration,
    pub poll_inbox_capacity: usize,
    pub modules_file: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = ControllerConfig::default();
        Ok(Self {
            workers: optional_var("NFP_WORKERS")?.unwrap_or_else(default_workers),
            lb_policy: optional_var("NFP_LB_POLICY")?.unwrap_or_default(),
            poll_interval: optional_var("NFP_POLL_INTERVAL_SECS")?
                .map_or(defaults.poll_interval, Duration::from_secs),
            report_interval: optional_var("NFP_REPORT_INTERVAL_SECS")?
                .map_or(defaults.report_interval, Duration::from_secs),
            worker_concurrency: optional_var("NFP_WORKER_CONCURRENCY")?
                .unwrap_or(defaults.worker_concurrency),
            queue_poll_timeout: optional_var("NFP_QUEUE_POLL_TIMEOUT_MS")?
                .map_or(defaults.queue_poll_timeout, Duration::from_millis),
            poll_inbox_capacity: optional_var("NFP_POLL_INBOX_CAPACITY")?
                .unwrap_or(defaults.poll_inbox_capacity),
            modules_file: optional_var("NFP_MODULES_FILE")?,
            otel_endpoint: optional_var("OTEL_ENDPOINT")?,
            log_level: optional_var("LOG_LEVEL")?.unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Engine settings derived from this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            lb_policy: self.lb_policy,
            poll_interval: self.poll_interval,
            report_interval: self.report_interval,
            worker_concurrency: self.worker_concurrency,
            queue_poll_timeout: self.queue_poll_timeout,
            poll_inbox_capacity: self.poll_inbox_capacity,
            ..ControllerConfig::default()
        }
    }
}

/// Read and parse an environment variable. Unset or empty means `None`.
fn optional_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid value for {name}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::Config(format!("cannot read {name}: {e}"))),
    }
}
