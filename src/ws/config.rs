#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::Backoff;
use bon::Builder;

const DEFAULT_URL: &str = "ws://localhost:8000/ws/chat/";
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_millis(3000);
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_millis(30_000);
const DEFAULT_AUTH_RETRY_DELAY_DURATION: Duration = Duration::from_millis(1000);
const DEFAULT_AUTH_GRACE_PERIOD_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_WARNING_THRESHOLD: u32 = 2;
const DEFAULT_WARNING_COOLDOWN_DURATION: Duration = Duration::from_secs(10);

/// Configuration for the realtime connection.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Base WebSocket URL, without the `user_id`/`token` query
    #[builder(into, default = DEFAULT_URL.to_owned())]
    pub url: String,
    /// Send a heartbeat frame while the socket is open
    #[builder(default = true)]
    pub enable_heartbeat: bool,
    /// Interval between heartbeat frames
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Delay before reconnecting after a successful token refresh
    #[builder(default = DEFAULT_AUTH_RETRY_DELAY_DURATION)]
    pub auth_retry_delay: Duration,
    /// How long a socket must stay open before a later auth failure gets a fresh
    /// refresh instead of counting as a repeat of the previous one
    #[builder(default = DEFAULT_AUTH_GRACE_PERIOD_DURATION)]
    pub auth_grace_period: Duration,
    /// Reconnect attempts tolerated before a connection warning is surfaced
    #[builder(default = DEFAULT_WARNING_THRESHOLD)]
    pub warning_threshold: u32,
    /// Minimum time between two connection warnings
    #[builder(default = DEFAULT_WARNING_COOLDOWN_DURATION)]
    pub warning_cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before the failure becomes terminal
    pub max_attempts: u32,
    /// Base delay, multiplied by the attempt number
    pub interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            interval: DEFAULT_RECONNECT_INTERVAL_DURATION,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.interval.saturating_mul(attempt)
    }
}

/// Linear backoff: attempt `n` waits `interval * n`, and the sequence ends after
/// `max_attempts`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl LinearBackoff {
    /// Number of reconnect attempts handed out since the last reset.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempt >= self.config.max_attempts
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempt += 1;
        Some(self.config.delay_for(self.attempt))
    }
}

impl From<ReconnectConfig> for LinearBackoff {
    fn from(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }
}
