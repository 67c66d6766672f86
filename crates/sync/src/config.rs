//! Sync configuration.

use std::str::FromStr;
use std::time::Duration;

use opsync_core::OperationId;
use opsync_infra::event_store::RetryPolicy;

pub const ENV_INTERVAL_SECS: &str = "OPSYNC_SYNC_INTERVAL_SECS";
pub const ENV_BATCH_SIZE: &str = "OPSYNC_BATCH_SIZE";
pub const ENV_MAX_RETRIES: &str = "OPSYNC_MAX_RETRIES";
pub const ENV_CONFLICT_WINDOW_SECS: &str = "OPSYNC_CONFLICT_WINDOW_SECS";
pub const ENV_OUTBOX_RETENTION_SECS: &str = "OPSYNC_OUTBOX_RETENTION_SECS";
pub const ENV_REMOTE_URL: &str = "OPSYNC_REMOTE_URL";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "OPSYNC_REQUEST_TIMEOUT_SECS";
pub const ENV_OPERATION_ID: &str = "OPSYNC_OPERATION_ID";

/// Settings for one sync context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Time between periodic cycles.
    pub interval: Duration,
    /// Outbox items taken per cycle.
    pub batch_size: usize,
    pub max_retries: u32,
    /// Maximum timestamp distance for two writes to be considered concurrent.
    pub conflict_window: Duration,
    /// How long `sent` outbox items are kept before pruning.
    pub outbox_retention: Duration,
    pub remote_url: Option<String>,
    pub request_timeout: Duration,
    /// Operation this context syncs; `None` syncs everything.
    pub operation: Option<OperationId>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 50,
            max_retries: 5,
            conflict_window: Duration::from_secs(5 * 60),
            outbox_retention: Duration::from_secs(7 * 24 * 60 * 60),
            remote_url: None,
            request_timeout: Duration::from_secs(30),
            operation: None,
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `OPSYNC_*` environment variables.
    ///
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`SyncConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_INTERVAL_SECS) {
            config.interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize>(&lookup, ENV_BATCH_SIZE) {
            config.batch_size = size;
        }
        if let Some(retries) = parse_var::<u32>(&lookup, ENV_MAX_RETRIES) {
            config.max_retries = retries;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CONFLICT_WINDOW_SECS) {
            config.conflict_window = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_OUTBOX_RETENTION_SECS) {
            config.outbox_retention = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(url) = lookup(ENV_REMOTE_URL).filter(|u| !u.trim().is_empty()) {
            config.remote_url = Some(url);
        }
        if let Some(op) = parse_var::<OperationId>(&lookup, ENV_OPERATION_ID) {
            config.operation = Some(op);
        }
        config
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }

    pub fn with_outbox_retention(mut self, retention: Duration) -> Self {
        self.outbox_retention = retention;
        self
    }

    pub fn with_remote_url(mut self, url: impl Into<String>) -> Self {
        self.remote_url = Some(url.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_operation(mut self, operation: OperationId) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Outbox backoff policy matching `max_retries`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_retries(self.max_retries)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(variable = name, value = %raw, error = %err, "ignoring invalid configuration value");
            None
        }
    }
}
