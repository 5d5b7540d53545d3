//! Session and server configuration.
//!
//! Both sections load from TOML through [`ibtrs_config::ConfigManager`].
//! Reconnect pacing and the heartbeat timeout may be hot updated on a live
//! session; everything else is fixed when the session opens.

use std::time::Duration;

use ibtrs_config::{Config, ConfigError, from_toml_value, render_toml};
use ibtrs_proto::{DESC_SIZE, RDMA_WRITE_HDR_SIZE};
use ibtrs_utils::BackoffPolicy;
use serde::{Deserialize, Serialize};

/// Shape of the delay between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectBackoff {
    Fixed,
    Exponential,
}

/// Client-side options, consumed by session open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Delay before each reconnect attempt (the first one for exponential).
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u8,

    /// 0 disables reconnecting, a negative value retries forever.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: i16,

    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff: ReconnectBackoff,

    /// Cap for exponential backoff.
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u16,

    /// Maximum data segments per RDMA write.
    #[serde(default = "default_max_segments")]
    pub max_segments: u16,

    /// 0 disables expiry.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u32,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    /// RDMA paths per session.
    #[serde(default = "default_con_count")]
    pub con_count: u8,

    /// Sub-pools the tag pool is split into.
    #[serde(default = "default_tag_shards")]
    pub tag_shards: usize,

    /// How long close waits for in-flight operations.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Name reported to the server. Defaults to the local hostname.
    #[serde(default)]
    pub hostname: Option<String>,
}

fn default_reconnect_delay_secs() -> u8 {
    30
}
fn default_max_reconnect_attempts() -> i16 {
    -1
}
fn default_reconnect_backoff() -> ReconnectBackoff {
    ReconnectBackoff::Fixed
}
fn default_max_reconnect_delay_secs() -> u16 {
    300
}
fn default_max_segments() -> u16 {
    31
}
fn default_heartbeat_timeout_ms() -> u32 {
    20_000
}
fn default_heartbeat_interval_ms() -> u32 {
    5_000
}
fn default_con_count() -> u8 {
    1
}
fn default_tag_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
fn default_drain_timeout_secs() -> u64 {
    5
}
fn default_queue_depth() -> u16 {
    128
}
fn default_max_inflight_msg() -> u16 {
    64
}
fn default_max_io_size() -> u32 {
    128 * 1024
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff: default_reconnect_backoff(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            max_segments: default_max_segments(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            con_count: default_con_count(),
            tag_shards: default_tag_shards(),
            drain_timeout_secs: default_drain_timeout_secs(),
            hostname: None,
        }
    }
}

impl SessionConfig {
    pub fn reconnect_policy(&self) -> BackoffPolicy {
        let initial = Duration::from_secs(self.reconnect_delay_secs as u64);
        match self.reconnect_backoff {
            ReconnectBackoff::Fixed => BackoffPolicy::Fixed(initial),
            ReconnectBackoff::Exponential => BackoffPolicy::Exponential {
                initial,
                max: Duration::from_secs(self.max_reconnect_delay_secs as u64),
            },
        }
    }

    /// `None` means no limit.
    pub fn reconnect_limit(&self) -> Option<u32> {
        u32::try_from(self.max_reconnect_attempts).ok()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms as u64)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn hostname(&self) -> String {
        match &self.hostname {
            Some(h) => ibtrs_types::truncate_hostname(h),
            None => ibtrs_types::local_hostname(),
        }
    }
}

impl Config for SessionConfig {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        from_toml_value(value)
    }

    fn hot_update(&mut self, other: &Self) {
        self.reconnect_delay_secs = other.reconnect_delay_secs;
        self.max_reconnect_attempts = other.max_reconnect_attempts;
        self.reconnect_backoff = other.reconnect_backoff;
        self.max_reconnect_delay_secs = other.max_reconnect_delay_secs;
        self.heartbeat_timeout_ms = other.heartbeat_timeout_ms;
    }

    fn render(&self) -> String {
        render_toml(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.con_count == 0 {
            return Err(ConfigError::out_of_range("con_count", 0, Some(1), Some(u8::MAX)));
        }
        if self.max_segments == 0 {
            return Err(ConfigError::out_of_range("max_segments", 0, Some(1), None::<u16>));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::out_of_range("heartbeat_interval_ms", 0, Some(1), None::<u32>));
        }
        if self.tag_shards == 0 {
            return Err(ConfigError::out_of_range("tag_shards", 0, Some(1), None::<usize>));
        }
        if self.reconnect_backoff == ReconnectBackoff::Exponential
            && (self.max_reconnect_delay_secs as u64) < self.reconnect_delay_secs as u64
        {
            return Err(ConfigError::invalid(
                "max_reconnect_delay_secs",
                "must not be below reconnect_delay_secs",
            ));
        }
        Ok(())
    }
}

/// Server-side options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Receive buffers (and so client tags) per session.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u16,

    /// Outstanding user messages per direction.
    #[serde(default = "default_max_inflight_msg")]
    pub max_inflight_msg: u16,

    /// Size of each receive buffer.
    #[serde(default = "default_max_io_size")]
    pub max_io_size: u32,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u32,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u32,

    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            max_inflight_msg: default_max_inflight_msg(),
            max_io_size: default_max_io_size(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            hostname: None,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms as u64)
    }
}

/// Smallest buffer that still fits a write header, one descriptor and one
/// byte of payload.
const MIN_IO_SIZE: u32 = (RDMA_WRITE_HDR_SIZE + DESC_SIZE + 1) as u32;

impl Config for ServerConfig {
    fn from_toml(value: &toml::Value) -> Result<Self, ConfigError> {
        from_toml_value(value)
    }

    fn hot_update(&mut self, other: &Self) {
        self.heartbeat_timeout_ms = other.heartbeat_timeout_ms;
    }

    fn render(&self) -> String {
        render_toml(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth == 0 {
            return Err(ConfigError::out_of_range("queue_depth", 0, Some(1), Some(u16::MAX)));
        }
        if self.max_inflight_msg == 0 {
            return Err(ConfigError::out_of_range("max_inflight_msg", 0, Some(1), Some(u16::MAX)));
        }
        if self.max_io_size < MIN_IO_SIZE {
            return Err(ConfigError::out_of_range(
                "max_io_size",
                self.max_io_size,
                Some(MIN_IO_SIZE),
                None::<u32>,
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::out_of_range("heartbeat_interval_ms", 0, Some(1), None::<u32>));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibtrs_config::ConfigManager;

    #[test]
    fn test_session_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.reconnect_delay_secs, 30);
        assert_eq!(cfg.max_reconnect_attempts, -1);
        assert_eq!(cfg.max_segments, 31);
        assert_eq!(cfg.reconnect_limit(), None);
        assert_eq!(cfg.reconnect_policy(), BackoffPolicy::Fixed(Duration::from_secs(30)));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_reconnect_limit() {
        let mut cfg = SessionConfig::default();
        cfg.max_reconnect_attempts = 0;
        assert_eq!(cfg.reconnect_limit(), Some(0));
        cfg.max_reconnect_attempts = 3;
        assert_eq!(cfg.reconnect_limit(), Some(3));
        cfg.max_reconnect_attempts = -5;
        assert_eq!(cfg.reconnect_limit(), None);
    }

    #[test]
    fn test_session_from_toml() {
        let mgr = ConfigManager::<SessionConfig>::parse(
            "reconnect_delay_secs = 2\nreconnect_backoff = \"exponential\"\nmax_reconnect_delay_secs = 16\ncon_count = 2",
        )
        .unwrap();
        let cfg = mgr.get();
        assert_eq!(cfg.con_count, 2);
        assert_eq!(
            cfg.reconnect_policy(),
            BackoffPolicy::Exponential {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(16)
            }
        );
    }

    #[test]
    fn test_session_validation() {
        assert!(ConfigManager::<SessionConfig>::parse("con_count = 0").is_err());
        assert!(ConfigManager::<SessionConfig>::parse("max_segments = 0").is_err());
        assert!(
            ConfigManager::<SessionConfig>::parse(
                "reconnect_backoff = \"exponential\"\nreconnect_delay_secs = 10\nmax_reconnect_delay_secs = 5"
            )
            .is_err()
        );
    }

    #[test]
    fn test_session_hot_update_scope() {
        let mgr = ConfigManager::<SessionConfig>::parse("con_count = 2\nheartbeat_timeout_ms = 1000").unwrap();
        mgr.hot_update_str("con_count = 4\nheartbeat_timeout_ms = 500\nmax_reconnect_attempts = 3")
            .unwrap();
        let cfg = mgr.snapshot();
        assert_eq!(cfg.con_count, 2);
        assert_eq!(cfg.heartbeat_timeout_ms, 500);
        assert_eq!(cfg.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_server_validation() {
        assert!(ServerConfig::default().validate().is_ok());
        let cfg = ServerConfig {
            queue_depth: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ServerConfig {
            max_io_size: 8,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn test_server_serde_roundtrip() {
        let cfg = ServerConfig {
            queue_depth: 16,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queue_depth, 16);
        assert_eq!(back.max_io_size, 128 * 1024);
    }
}
