use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Firmware ceiling on concurrently open CIRA channels.
pub const MAX_CIRA_CHANNELS: usize = 6;

/// Error produced when tunnel settings fail validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_channels must be between 1 and {MAX_CIRA_CHANNELS}, got {0}")]
    MaxChannels(usize),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("max_frame_size {frame} exceeds max_inbound_frame {inbound}")]
    FrameLargerThanInbound { frame: u32, inbound: usize },
    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Timeouts, windows and addressing for one tunnel.
///
/// Every field has a default, so a JSON document only needs the values it
/// overrides. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Concurrent HTTP exchanges per transport.
    pub max_channels: usize,
    pub slot_timeout_ms: u64,
    pub open_timeout_ms: u64,
    /// Bound on each wait for send credit.
    pub window_timeout_ms: u64,
    /// Bound on reading a whole response.
    pub response_timeout_ms: u64,
    /// Granularity of inbound queue polling while reading a response.
    pub poll_interval_ms: u64,
    /// Largest payload put into one channel-data frame.
    pub max_frame_size: u32,
    /// Receive credit offered when opening a channel.
    pub rx_window_size: u32,
    pub data_queue_depth: usize,
    /// Largest inbound frame the stream decoder accepts.
    pub max_inbound_frame: usize,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
    /// Trigger reason sent back in our protocol version reply.
    pub trigger_reason: u32,
    pub keepalive_interval_secs: u32,
    pub keepalive_timeout_secs: u32,
    /// Inactivity after which a legacy session's inbound data counts as complete.
    pub quiet_period_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_channels: MAX_CIRA_CHANNELS,
            slot_timeout_ms: 30_000,
            open_timeout_ms: 10_000,
            window_timeout_ms: 10_000,
            response_timeout_ms: 30_000,
            poll_interval_ms: 100,
            max_frame_size: 4096,
            rx_window_size: 4096,
            data_queue_depth: 64,
            max_inbound_frame: 64 * 1024,
            connected_address: "::1".to_string(),
            connected_port: 16992,
            originator_address: "::1".to_string(),
            originator_port: 123,
            trigger_reason: 9,
            keepalive_interval_secs: 30,
            keepalive_timeout_secs: 90,
            quiet_period_ms: 3_000,
        }
    }
}

impl TunnelConfig {
    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<Self>(json)?.validate()
    }

    /// Rejects settings that would stall or overrun the tunnel.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_channels == 0 || self.max_channels > MAX_CIRA_CHANNELS {
            return Err(ConfigError::MaxChannels(self.max_channels));
        }
        let non_zero = [
            ("slot_timeout_ms", self.slot_timeout_ms),
            ("open_timeout_ms", self.open_timeout_ms),
            ("window_timeout_ms", self.window_timeout_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("max_frame_size", u64::from(self.max_frame_size)),
            ("rx_window_size", u64::from(self.rx_window_size)),
            ("data_queue_depth", self.data_queue_depth as u64),
        ];
        if let Some((name, _)) = non_zero.into_iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.max_frame_size as usize > self.max_inbound_frame {
            return Err(ConfigError::FrameLargerThanInbound {
                frame: self.max_frame_size,
                inbound: self.max_inbound_frame,
            });
        }
        Ok(self)
    }

    pub fn slot_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn window_timeout(&self) -> Duration {
        Duration::from_millis(self.window_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}
