//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document (or section) is a
//! valid configuration. Durations are plain millisecond counts on the wire.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ride_core::{HydrationPlan, HydrationPolicy, PollPolicy, ReconnectPolicy};
use serde::{Deserialize, Serialize};

/// Tunables for one [`RideEngine`](crate::RideEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Broker WebSocket endpoint (STOMP).
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Ride resource API root.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// HTTP request timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Bounded wait for callers of `connect()`.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// First reconnect delay; doubles per failure.
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Cap on the exponential reconnect delay.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Random jitter added to each reconnect delay.
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    /// Consecutive failed reconnects before real-time updates are reported unavailable.
    #[serde(default = "default_realtime_unavailable_after")]
    pub realtime_unavailable_after: u32,
    /// Cap on operations queued while the link is down.
    #[serde(default = "default_max_pending_operations")]
    pub max_pending_operations: usize,
    /// Reconciliation tick while tracking or in progress.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Age of the last trusted update after which a tick fetches.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Match-poll tick while booking.
    #[serde(default = "default_match_poll_interval_ms")]
    pub match_poll_interval_ms: u64,
    /// How long after booking the match poll runs at the fast tick.
    #[serde(default = "default_match_poll_window_ms")]
    pub match_poll_window_ms: u64,
    /// Age of the last trusted update after which the ride is reported unreachable.
    #[serde(default = "default_stale_ceiling_ms")]
    pub stale_ceiling_ms: u64,
    /// Code hydration attempts after a push.
    #[serde(default = "default_hydration_attempts")]
    pub hydration_attempts: u32,
    /// Delay between hydration attempts after a push.
    #[serde(default = "default_hydration_delay_ms")]
    pub hydration_delay_ms: u64,
    /// Code hydration attempts after a poll found the acceptance.
    #[serde(default = "default_hydration_attempts_after_poll")]
    pub hydration_attempts_after_poll: u32,
    /// Delay between hydration attempts after a poll.
    #[serde(default = "default_hydration_delay_after_poll_ms")]
    pub hydration_delay_after_poll_ms: u64,
    /// Counterpart marker animation length.
    #[serde(default = "default_smoothing_ms")]
    pub smoothing_ms: u64,
    /// Minimum spacing of outbound location reports.
    #[serde(default = "default_location_send_interval_ms")]
    pub location_send_interval_ms: u64,
}

// Default value functions
fn default_broker_url() -> String {
    "ws://localhost:8080/ws/websocket".to_string()
}

fn default_api_base() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_base_ms() -> u64 {
    2_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter_ms() -> u64 {
    5_000
}

fn default_realtime_unavailable_after() -> u32 {
    5
}

fn default_max_pending_operations() -> usize {
    256
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_stale_after_ms() -> u64 {
    6_000
}

fn default_match_poll_interval_ms() -> u64 {
    3_000
}

fn default_match_poll_window_ms() -> u64 {
    120_000 // 2 minutes
}

fn default_stale_ceiling_ms() -> u64 {
    600_000 // 10 minutes
}

fn default_hydration_attempts() -> u32 {
    3
}

fn default_hydration_delay_ms() -> u64 {
    500
}

fn default_hydration_attempts_after_poll() -> u32 {
    5
}

fn default_hydration_delay_after_poll_ms() -> u64 {
    800
}

fn default_smoothing_ms() -> u64 {
    2_000
}

fn default_location_send_interval_ms() -> u64 {
    2_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            api_base: default_api_base(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            realtime_unavailable_after: default_realtime_unavailable_after(),
            max_pending_operations: default_max_pending_operations(),
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            match_poll_interval_ms: default_match_poll_interval_ms(),
            match_poll_window_ms: default_match_poll_window_ms(),
            stale_ceiling_ms: default_stale_ceiling_ms(),
            hydration_attempts: default_hydration_attempts(),
            hydration_delay_ms: default_hydration_delay_ms(),
            hydration_attempts_after_poll: default_hydration_attempts_after_poll(),
            hydration_delay_after_poll_ms: default_hydration_delay_after_poll_ms(),
            smoothing_ms: default_smoothing_ms(),
            location_send_interval_ms: default_location_send_interval_ms(),
        }
    }
}

impl EngineConfig {
    /// Parse from a TOML document and validate.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("reconnect_base_ms", self.reconnect_base_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("match_poll_interval_ms", self.match_poll_interval_ms),
            ("max_pending_operations", self.max_pending_operations as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
            }
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::Invalid(
                "reconnect_max_ms must not be below reconnect_base_ms".into(),
            ));
        }
        if self.stale_ceiling_ms <= self.stale_after_ms {
            return Err(ConfigError::Invalid(
                "stale_ceiling_ms must exceed stale_after_ms".into(),
            ));
        }
        if !self.broker_url.starts_with("ws://") && !self.broker_url.starts_with("wss://") {
            return Err(ConfigError::Invalid(format!(
                "broker_url must be a ws:// or wss:// URL, got {}",
                self.broker_url
            )));
        }
        Ok(())
    }

    /// Set the broker endpoint.
    pub fn with_broker_url(mut self, url: &str) -> Self {
        self.broker_url = url.to_string();
        self
    }

    /// Set the API root.
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.to_string();
        self
    }

    /// Set the reconciliation tick and staleness threshold.
    pub fn with_poll(mut self, interval: Duration, stale_after: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self.stale_after_ms = stale_after.as_millis() as u64;
        self
    }

    /// Set the reconnect jitter (tests use zero).
    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter_ms = jitter.as_millis() as u64;
        self
    }

    /// Set the unreachable ceiling.
    pub fn with_stale_ceiling(mut self, ceiling: Duration) -> Self {
        self.stale_ceiling_ms = ceiling.as_millis() as u64;
        self
    }

    /// Bounded wait for `connect()`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Smoother animation length.
    pub fn smoothing(&self) -> Duration {
        Duration::from_millis(self.smoothing_ms)
    }

    /// Outbound location throttle.
    pub fn location_send_interval(&self) -> Duration {
        Duration::from_millis(self.location_send_interval_ms)
    }

    /// Reconnect backoff settings.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: Duration::from_millis(self.reconnect_base_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
            unavailable_after: self.realtime_unavailable_after,
        }
    }

    /// Poll cadence and thresholds.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stale_after: Duration::from_millis(self.stale_after_ms),
            match_interval: Duration::from_millis(self.match_poll_interval_ms),
            match_window: Duration::from_millis(self.match_poll_window_ms),
            stale_ceiling: Duration::from_millis(self.stale_ceiling_ms),
        }
    }

    /// Hydration budgets.
    pub fn hydration_policy(&self) -> HydrationPolicy {
        HydrationPolicy {
            after_push: HydrationPlan {
                attempts: self.hydration_attempts,
                delay: Duration::from_millis(self.hydration_delay_ms),
            },
            after_poll: HydrationPlan {
                attempts: self.hydration_attempts_after_poll,
                delay: Duration::from_millis(self.hydration_delay_after_poll_ms),
            },
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}
