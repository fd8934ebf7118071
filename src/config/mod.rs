//! Configuration management for the meter reader.
//!
//! All runtime parameters come from one TOML file:
//!
//! ```toml
//! [connection]
//! host = "10.20.30.40"
//!
//! [poll]
//! interval_secs = 300
//! read_timeout_secs = 10
//! max_read_retries = 3
//! max_gap_hours = 24
//! gap_skip_threshold = 1
//!
//! [sink]
//! database = "readings.db"
//! query_insert = "INSERT INTO readings VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
//!
//! [logging]
//! level = "info"
//!
//! [[devices]]
//! name = "boiler-house-1"
//! port = 5001
//! id_measuring = 17
//! current_data = "CUR1"
//! last_hour_archive = "LHA1"
//! backwards_archive = "BWA1"
//! ```
//!
//! The file is validated on load. The scheduler re-checks the file's mtime on
//! every tick and reloads the device list when it changed, so meters can be
//! added or removed without restarting the service.

use std::collections::HashSet;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

/// How to reach the meters. All devices sit behind one host (a serial-to-TCP
/// gateway); each device listens on its own port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
}

/// Identity and protocol parameters for one meter.
///
/// The command strings are sent verbatim over TCP; `current_data` doubles as
/// the device's identity in the watermark store, so it must be unique.
/// `forward_archive` is part of the device's command set but unused by the
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    pub port: u16,
    pub id_measuring: i64,
    pub current_data: String,
    pub last_hour_archive: String,
    pub backwards_archive: String,
    #[serde(default)]
    pub forward_archive: String,
}

/// Scheduler cadence, per-read timeout, and the gap-reconciliation policy
/// knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Wall-clock polling cadence; ticks align to multiples of this.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Deadline for accumulating one response frame.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Attempts per device per tick before the watermark is marked failed.
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,
    /// Upper bound on how many hours one reconciliation walk may backfill.
    #[serde(default = "default_max_gap_hours")]
    pub max_gap_hours: i64,
    /// Gaps of this many hours or fewer are not worth a walk.
    #[serde(default = "default_gap_skip_threshold")]
    pub gap_skip_threshold: i64,
}

fn default_interval_secs() -> u64 {
    300
}

fn default_read_timeout_secs() -> u64 {
    10
}

fn default_max_read_retries() -> u32 {
    3
}

fn default_max_gap_hours() -> i64 {
    24
}

fn default_gap_skip_threshold() -> i64 {
    1
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_read_retries: default_max_read_retries(),
            max_gap_hours: default_max_gap_hours(),
            gap_skip_threshold: default_gap_skip_threshold(),
        }
    }
}

/// Where accepted readings go. `query_insert` is executed once per reading
/// with six positional parameters: device name, measuring id, Q1, formatted
/// timestamp, the constant 192, and NULL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub database: String,
    pub query_insert: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; when set, log lines also go to the console while
    /// stdout is a TTY.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_watermark_file")]
    pub watermark_file: String,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

fn default_watermark_file() -> String {
    "watermarks.json".to_string()
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// The config file's last-modified time, used by the scheduler to decide
    /// whether to reload between ticks.
    pub async fn modified<P: AsRef<Path>>(path: P) -> Option<SystemTime> {
        fs::metadata(path.as_ref()).await.ok()?.modified().ok()
    }

    /// Write a commented starter configuration. Refuses to overwrite.
    pub async fn create_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            return Err(anyhow!("{} already exists", path.display()));
        }
        fs::write(path, DEFAULT_CONFIG)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() {
            return Err(anyhow!("connection.host must not be empty"));
        }
        if self.poll.interval_secs == 0 {
            return Err(anyhow!("poll.interval_secs must be positive"));
        }
        if self.poll.max_read_retries == 0 {
            return Err(anyhow!("poll.max_read_retries must be at least 1"));
        }
        if self.poll.max_gap_hours < 1 {
            return Err(anyhow!("poll.max_gap_hours must be at least 1"));
        }
        if self.sink.query_insert.trim().is_empty() {
            return Err(anyhow!("sink.query_insert must not be empty"));
        }
        let mut identities = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(anyhow!("every device needs a name"));
            }
            if device.port == 0 {
                return Err(anyhow!("device {}: port must not be 0", device.name));
            }
            for (label, command) in [
                ("current_data", &device.current_data),
                ("last_hour_archive", &device.last_hour_archive),
                ("backwards_archive", &device.backwards_archive),
            ] {
                if command.is_empty() {
                    return Err(anyhow!("device {}: {label} must not be empty", device.name));
                }
            }
            if !identities.insert(device.current_data.clone()) {
                return Err(anyhow!(
                    "device {}: current_data command is not unique",
                    device.name
                ));
            }
        }
        Ok(())
    }
}

const DEFAULT_CONFIG: &str = r#"# energomer-reader configuration

[connection]
# Serial-to-TCP gateway fronting the meters.
host = "127.0.0.1"

[poll]
# Poll every device's current reading on multiples of this interval.
interval_secs = 300
# Deadline for accumulating one response frame.
read_timeout_secs = 10
# Attempts per device per tick before giving up until the next tick.
max_read_retries = 3
# One reconciliation walk backfills at most this many hours.
max_gap_hours = 24
# Gaps of this many hours or fewer are left to the normal polling cycle.
gap_skip_threshold = 1

[sink]
database = "readings.db"
query_insert = "INSERT INTO readings (name, id_measuring, q1, stamp, quality, note) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"

[logging]
level = "info"
# file = "energomer-reader.log"

# One [[devices]] block per meter. current_data must be unique: it identifies
# the device in the watermark store.
[[devices]]
name = "example-meter"
port = 5001
id_measuring = 1
current_data = "CUR1"
last_hour_archive = "LHA1"
backwards_archive = "BWA1"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_parses_and_validates() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.validate().unwrap();
        assert_eq!(config.poll.max_gap_hours, 24);
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn duplicate_device_identity_rejected() {
        let mut config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        let mut dup = config.devices[0].clone();
        dup.name = "other".into();
        config.devices.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retries_rejected() {
        let mut config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        config.poll.max_read_retries = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn create_default_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        Config::create_default(&path).await.unwrap();
        assert!(Config::create_default(&path).await.is_err());
        Config::load(&path).await.unwrap();
    }
}
