//! Session configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::link::LinkTimings;
use crate::protocol::constants::DEFAULT_GDB_PORT;

/// Configuration for a probe session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial baud rate.
    pub baud_rate: u32,
    /// TCP port used when a network target gives none.
    pub network_port: u16,
    /// Sleep between transport polls.
    pub poll_interval_ms: u64,
    /// Wait for `+`/`-` after each packet.
    pub ack_timeout_ms: u64,
    /// Transmissions per packet before giving up.
    pub send_attempts: u32,
    /// Wait for the first reply while probing a serial port.
    pub handshake_timeout_ms: u64,
    /// Wait for an ordinary command reply.
    pub reply_timeout_ms: u64,
    /// Wait for flash erase/write/done replies.
    pub flash_timeout_ms: u64,
    /// TCP connect timeout.
    pub connect_timeout_ms: u64,
    /// Largest span `dump` reads.
    pub dump_limit: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            network_port: DEFAULT_GDB_PORT,
            poll_interval_ms: 50,
            ack_timeout_ms: 500,
            send_attempts: 3,
            handshake_timeout_ms: 250,
            reply_timeout_ms: 1000,
            flash_timeout_ms: 10_000,
            connect_timeout_ms: 3000,
            dump_limit: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn link_timings(&self) -> LinkTimings {
        LinkTimings {
            poll_interval: self.poll_interval(),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            send_attempts: self.send_attempts,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn flash_timeout(&self) -> Duration {
        Duration::from_millis(self.flash_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: SessionConfig = toml::from_str("baud_rate = 921600\n").unwrap();
        assert_eq!(config.baud_rate, 921_600);
        assert_eq!(config.network_port, 2159);
        assert_eq!(config.link_timings().send_attempts, 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bmflash.toml");
        let config = SessionConfig {
            reply_timeout_ms: 2500,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(SessionConfig::load_from_file(&path).unwrap(), config);
    }
}
