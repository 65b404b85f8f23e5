//! Configuration file format and runtime settings.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! working configuration. Durations are given in milliseconds unless the
//! field name says otherwise.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use satip_protocol::rtsp::RTSP_DEFAULT_PORT;
use satip_protocol::ServerQuirks;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub tuner: TunerConfig,
    pub section_filter: SectionFilterConfig,
    pub logging: LoggingConfig,
    #[serde(rename = "server")]
    pub servers: Vec<ServerEntry>,
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }
}

/// How RTP data reaches the device sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The controller loop reads RTP and pushes into the sink.
    #[default]
    Push,
    /// A dedicated pump reads RTP, bounded by the sink's free space.
    Pull,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// First RTP port to try; ephemeral ports when unset.
    pub rtp_port_start: Option<u16>,
    pub rtp_port_stop: Option<u16>,
    pub delivery: DeliveryMode,
    pub rtsp_timeout_ms: u64,
    pub min_keep_alive_ms: u64,
    pub status_update_ms: u64,
    pub pid_update_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub tuning_timeout_ms: u64,
    pub idle_check_ms: u64,
    pub sleep_ms: u64,
    pub shutdown_grace_ms: u64,
    pub rtp_report_interval_secs: u64,
    /// Datagrams drained per readiness event.
    pub rtp_read_batch: usize,
    /// Capacity of the device TS ring in bytes.
    pub ts_buffer_size: usize,
    pub user_agent: String,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            rtp_port_start: None,
            rtp_port_stop: None,
            delivery: DeliveryMode::Push,
            rtsp_timeout_ms: 1500,
            min_keep_alive_ms: 30_000,
            status_update_ms: 1000,
            pid_update_ms: 250,
            reconnect_timeout_ms: 5000,
            tuning_timeout_ms: 20_000,
            idle_check_ms: 15_000,
            sleep_ms: 250,
            shutdown_grace_ms: 3000,
            rtp_report_interval_secs: 300,
            rtp_read_batch: 16,
            ts_buffer_size: 188 * 10_000,
            user_agent: format!("satip-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TunerConfig {
    pub fn rtsp_timeout(&self) -> Duration {
        Duration::from_millis(self.rtsp_timeout_ms)
    }

    pub fn min_keep_alive(&self) -> Duration {
        Duration::from_millis(self.min_keep_alive_ms)
    }

    pub fn status_update(&self) -> Duration {
        Duration::from_millis(self.status_update_ms)
    }

    pub fn pid_update(&self) -> Duration {
        Duration::from_millis(self.pid_update_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn tuning_timeout(&self) -> Duration {
        Duration::from_millis(self.tuning_timeout_ms)
    }

    pub fn idle_check(&self) -> Duration {
        Duration::from_millis(self.idle_check_ms)
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn rtp_report_interval(&self) -> Duration {
        Duration::from_secs(self.rtp_report_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SectionFilterConfig {
    /// Capacity of the section handler's TS ring in bytes.
    pub buffer_size: usize,
    /// Indices into the well-known filter table that may not be opened.
    pub disabled_filters: Vec<usize>,
    pub send_retry_ms: u64,
    /// Sections buffered in each delivery channel.
    pub delivery_capacity: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for SectionFilterConfig {
    fn default() -> Self {
        Self {
            buffer_size: 2 * 1024 * 1024,
            disabled_filters: Vec::new(),
            send_retry_ms: 10,
            delivery_capacity: 16,
            shutdown_grace_ms: 3000,
        }
    }
}

impl SectionFilterConfig {
    pub fn send_retry(&self) -> Duration {
        Duration::from_millis(self.send_retry_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// One statically configured SAT>IP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub address: String,
    #[serde(default = "default_rtsp_port")]
    pub port: u16,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub quirks: ServerQuirks,
}

fn default_rtsp_port() -> u16 {
    RTSP_DEFAULT_PORT
}

fn default_model() -> String {
    "DVBS2-1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ClientConfig::from_toml("").unwrap();
        assert_eq!(config.tuner.rtsp_timeout(), Duration::from_millis(1500));
        assert_eq!(config.tuner.min_keep_alive(), Duration::from_secs(30));
        assert_eq!(config.tuner.delivery, DeliveryMode::Push);
        assert_eq!(config.section_filter.buffer_size, 2 * 1024 * 1024);
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[tuner]
rtp_port_start = 45000
delivery = "pull"

[section_filter]
disabled_filters = [6]

[logging]
level = "debug"

[[server]]
address = "192.168.1.20"
model = "DVBS2-4"
quirks = {{ session_id = true, play_pids = true }}

[[server]]
address = "192.168.1.21"
port = 8554
"#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.tuner.rtp_port_start, Some(45000));
        assert_eq!(config.tuner.delivery, DeliveryMode::Pull);
        assert_eq!(config.tuner.pid_update_ms, 250);
        assert_eq!(config.section_filter.disabled_filters, vec![6]);
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
        assert_eq!(config.servers.len(), 2);
        assert!(config.servers[0].quirks.session_id);
        assert!(config.servers[0].quirks.play_pids);
        assert!(!config.servers[0].quirks.force_lock);
        assert_eq!(config.servers[0].port, 554);
        assert_eq!(config.servers[1].port, 8554);
        assert_eq!(config.servers[1].model, "DVBS2-1");
    }

    #[test]
    fn test_missing_file() {
        let err = ClientConfig::load(Path::new("/nonexistent/satip-client.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            ClientConfig::from_toml("[tuner]\nsleep_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
