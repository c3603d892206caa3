//! Connection core configuration.
//!
//! The configuration is passed at manager construction and is immutable for
//! the manager's lifetime. Defaults are tuned for consumer hardware on
//! residential links.

use std::time::Duration;

/// Configuration for the post-connect public IP verification probe.
#[derive(Debug, Clone)]
pub struct IpCheckConfig {
    /// How many times to poll the IP resolver before giving up.
    pub max_attempts: u32,
    /// Pause between consecutive polls.
    pub sleep_duration_after_check: Duration,
}

impl Default for IpCheckConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            sleep_duration_after_check: Duration::from_secs(3),
        }
    }
}

/// Configuration for the control-channel keepalive loop.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between keepalive pings.
    pub send_interval: Duration,
    /// Consecutive send failures after which the channel is considered lost.
    pub max_send_err_count: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            send_interval: Duration::from_secs(20),
            max_send_err_count: 5,
        }
    }
}

/// Top-level configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct Config {
    /// IP verification probe settings.
    pub ip_check: IpCheckConfig,
    /// Keepalive loop settings.
    pub keep_alive: KeepAliveConfig,
    /// Interval between connection statistics reports.
    pub stats_report_interval: Duration,
    /// How long a disconnect waits for the tunnel to report its exit before
    /// abandoning the state stream.
    pub disconnect_grace: Duration,
}

impl Config {
    /// Create a configuration with the default statistics cadence.
    pub fn new() -> Self {
        Self {
            ip_check: IpCheckConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            stats_report_interval: Duration::from_secs(1),
            disconnect_grace: Duration::from_secs(5),
        }
    }

    /// Override the IP verification settings.
    pub fn with_ip_check(mut self, ip_check: IpCheckConfig) -> Self {
        self.ip_check = ip_check;
        self
    }

    /// Override the keepalive settings.
    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Override the statistics reporting interval.
    pub fn with_stats_report_interval(mut self, interval: Duration) -> Self {
        self.stats_report_interval = interval;
        self
    }

    /// Override the disconnect grace period.
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.disconnect_grace = grace;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
