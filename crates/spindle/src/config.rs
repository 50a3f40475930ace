//! Session configuration
//!
//! Everything a [`crate::Session`] needs to reach one instrument: endpoints,
//! buffer budget, sample representation, and the transport timing knobs.
//! Defaults match the instrument family conventions (client listens on
//! 51002, instrument commands go to 51001, 8 MiB receive budget).
//!
//! Timing fields are plain milliseconds so a config survives a TOML round
//! trip without ceremony; accessors hand out `Duration`s.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spindleproto::constants::{
    DEFAULT_INBOUND_PORT, DEFAULT_OUTBOUND_PORT, DEFAULT_RECEIVE_BUFFER_BYTES,
    NUM_ANALOG_CHANNELS,
};
use spindleproto::{SampleKind, MAX_CHUNK_SAMPLES};

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
}

/// Full configuration for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Which instrument instance this client binds to. Sessions with
    /// different instances are fully independent.
    pub instance: u32,
    /// Address the client listens on for instrument traffic.
    pub inbound_address: String,
    pub inbound_port: u16,
    /// Address the instrument listens on for control requests.
    pub outbound_address: String,
    pub outbound_port: u16,
    /// Client-side receive budget in bytes, divided across the per-channel
    /// rings. More budget tolerates slower polling.
    pub receive_buffer_bytes: usize,
    /// Element representation of every buffer this session produces.
    pub sample_kind: SampleKind,
    /// How long the initial handshake waits for a `HelloAck` before the
    /// session comes up offline.
    pub handshake_timeout_ms: u64,
    /// Per-attempt wait for a control reply.
    pub control_timeout_ms: u64,
    /// Control request attempts before reporting the instrument unreachable.
    pub control_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Silence threshold: no instrument traffic for this long flips
    /// `is_online` to false.
    pub offline_after_ms: u64,
    /// How often the receiver re-sends `Hello` while the link is stale, so
    /// an instrument powered on late finds us.
    pub hello_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instance: 0,
            inbound_address: "127.0.0.1".to_string(),
            inbound_port: DEFAULT_INBOUND_PORT,
            outbound_address: "127.0.0.1".to_string(),
            outbound_port: DEFAULT_OUTBOUND_PORT,
            receive_buffer_bytes: DEFAULT_RECEIVE_BUFFER_BYTES,
            sample_kind: SampleKind::Int16,
            handshake_timeout_ms: 500,
            control_timeout_ms: 250,
            control_retries: 3,
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 5_000,
            offline_after_ms: 1_000,
            hello_interval_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn new(instance: u32) -> Self {
        Self {
            instance,
            ..Self::default()
        }
    }

    /// Load from a TOML file. Missing fields fall back to defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn with_inbound(mut self, address: impl Into<String>, port: u16) -> Self {
        self.inbound_address = address.into();
        self.inbound_port = port;
        self
    }

    pub fn with_outbound(mut self, address: impl Into<String>, port: u16) -> Self {
        self.outbound_address = address.into();
        self.outbound_port = port;
        self
    }

    pub fn with_receive_buffer_bytes(mut self, bytes: usize) -> Self {
        self.receive_buffer_bytes = bytes;
        self
    }

    pub fn with_sample_kind(mut self, kind: SampleKind) -> Self {
        self.sample_kind = kind;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_control_retries(mut self, retries: u32) -> Self {
        self.control_retries = retries;
        self
    }

    pub fn with_offline_after(mut self, threshold: Duration) -> Self {
        self.offline_after_ms = threshold.as_millis() as u64;
        self
    }

    /// `host:port` string for the listening socket.
    pub fn inbound_addr(&self) -> String {
        format!("{}:{}", self.inbound_address, self.inbound_port)
    }

    /// `host:port` string for the instrument's control socket.
    pub fn outbound_addr(&self) -> String {
        format!("{}:{}", self.outbound_address, self.outbound_port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn offline_after(&self) -> Duration {
        Duration::from_millis(self.offline_after_ms)
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::from_millis(self.hello_interval_ms)
    }

    /// Backoff before retry `attempt` (1-based): capped exponential from
    /// `retry_backoff_base_ms`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Samples each per-channel receive ring holds, derived from the
    /// receive budget. Never below one full chunk.
    pub fn ring_capacity_per_channel(&self) -> usize {
        let per_channel = self.receive_buffer_bytes / (2 * usize::from(NUM_ANALOG_CHANNELS));
        per_channel.max(MAX_CHUNK_SAMPLES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_instrument_family() {
        let config = SessionConfig::default();
        assert_eq!(config.inbound_port, 51_002);
        assert_eq!(config.outbound_port, 51_001);
        assert_eq!(config.receive_buffer_bytes, 8 * 1024 * 1024);
        assert_eq!(config.sample_kind, SampleKind::Int16);
    }

    #[test]
    fn builder_chain() {
        let config = SessionConfig::new(2)
            .with_inbound("0.0.0.0", 0)
            .with_outbound("192.168.42.1", 51_001)
            .with_sample_kind(SampleKind::Float64)
            .with_control_timeout(Duration::from_millis(50));

        assert_eq!(config.instance, 2);
        assert_eq!(config.inbound_addr(), "0.0.0.0:0");
        assert_eq!(config.outbound_addr(), "192.168.42.1:51001");
        assert!(config.sample_kind.is_double());
        assert_eq!(config.control_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn backoff_progression_caps() {
        let config = SessionConfig::default();
        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for_attempt(10), Duration::from_millis(5_000));
        assert_eq!(config.backoff_for_attempt(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn ring_capacity_from_budget() {
        let config = SessionConfig::default();
        // 8 MiB / (2 bytes * 272 channels)
        assert_eq!(config.ring_capacity_per_channel(), 15_420);

        let tiny = SessionConfig::default().with_receive_buffer_bytes(1024);
        assert_eq!(tiny.ring_capacity_per_channel(), MAX_CHUNK_SAMPLES);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            instance = 3
            outbound_address = "10.0.0.9"
            sample_kind = "float64"
            "#,
        )
        .unwrap();

        assert_eq!(config.instance, 3);
        assert_eq!(config.outbound_address, "10.0.0.9");
        assert_eq!(config.sample_kind, SampleKind::Float64);
        assert_eq!(config.inbound_port, 51_002);
    }

    #[test]
    fn toml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spindle.toml");
        std::fs::write(&path, "instance = 7\ncontrol_retries = 1\n").unwrap();

        let config = SessionConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.instance, 7);
        assert_eq!(config.control_retries, 1);

        let missing = SessionConfig::from_toml_file(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead { .. })));
    }
}
