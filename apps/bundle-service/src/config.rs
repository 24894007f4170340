use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::warn;

pub const DEFAULT_SEND_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CLOSE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECEIVE_CANCEL_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_INBOUND_FILE_THRESHOLD: usize = 1024 * 1024;

const ENV_PREFIX: &str = "BUNDLE_SERVICE";

/// Service settings, read from `BUNDLE_SERVICE_*` environment variables.
/// Durations are given in milliseconds (`BUNDLE_SERVICE_SEND_TIMEOUT_MS`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Parent of every session's private spool directory.
    pub spool_root: PathBuf,
    /// How long `send` waits for the session lock before giving up.
    #[serde(rename = "send_timeout_ms", deserialize_with = "millis")]
    pub send_acquire_timeout: Duration,
    /// How long `close` waits for the session lock before tearing down anyway.
    #[serde(rename = "close_timeout_ms", deserialize_with = "millis")]
    pub close_acquire_timeout: Duration,
    /// How long `close` waits for the receive loop to observe cancellation.
    #[serde(rename = "receive_grace_ms", deserialize_with = "millis")]
    pub receive_cancel_grace: Duration,
    /// Pause after a malformed delivery before receiving again.
    #[serde(rename = "receive_backoff_ms", deserialize_with = "millis")]
    pub receive_error_backoff: Duration,
    /// Inbound byte payloads at least this large are delivered as files.
    /// Zero keeps every inbound payload in memory.
    pub inbound_file_threshold: usize,
    /// Let clients without an open endpoint send from the null endpoint.
    pub allow_anonymous_send: bool,
    pub log_filter: String,
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn default_spool_root() -> PathBuf {
    std::env::temp_dir().join("bundle-service")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            spool_root: default_spool_root(),
            send_acquire_timeout: DEFAULT_SEND_ACQUIRE_TIMEOUT,
            close_acquire_timeout: DEFAULT_CLOSE_ACQUIRE_TIMEOUT,
            receive_cancel_grace: DEFAULT_RECEIVE_CANCEL_GRACE,
            receive_error_backoff: DEFAULT_RECEIVE_ERROR_BACKOFF,
            inbound_file_threshold: DEFAULT_INBOUND_FILE_THRESHOLD,
            allow_anonymous_send: false,
            log_filter: "info".into(),
        }
    }
}

impl ServiceConfig {
    /// Reads the process environment. Falls back to defaults when a value
    /// does not parse.
    pub fn from_env() -> Self {
        Self::load(config::Environment::with_prefix(ENV_PREFIX)).unwrap_or_else(|err| {
            warn!(error = %err, "invalid BUNDLE_SERVICE_* settings; using defaults");
            Self::default()
        })
    }

    pub fn load(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize::<ServiceConfig>())
            .map(ServiceConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        if self.spool_root.as_os_str().is_empty() {
            self.spool_root = default_spool_root();
        }
        if self.log_filter.trim().is_empty() {
            self.log_filter = "info".into();
        }
        self
    }

    pub fn with_spool_root(mut self, spool_root: impl Into<PathBuf>) -> Self {
        self.spool_root = spool_root.into();
        self
    }
}
