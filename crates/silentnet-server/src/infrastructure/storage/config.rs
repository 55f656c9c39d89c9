//! TOML-based configuration for the Silent Net server.
//!
//! Every field carries a serde default, so a missing file, an empty file and a
//! file that only overrides a single key all load successfully:
//!
//! ```toml
//! log_level = "debug"
//!
//! [network]
//! port = 6734
//!
//! [admission]
//! max_clients = 10
//! password = "correct horse"
//!
//! [monitoring]
//! extra_ignored_processes = ["backup-agent"]
//! ```
//!
//! Command-line arguments are applied on top of the loaded file by
//! [`ServerConfig::apply_overrides`], which range-checks each value and falls
//! back to the default (with a warning) when it is out of range.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Accepted range for `admission.max_clients`.
pub const MAX_CLIENTS_RANGE: std::ops::RangeInclusive<u32> = 1..=40;
/// Accepted range for `admission.safety_threshold`.
pub const SAFETY_THRESHOLD_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

pub const DEFAULT_MAX_CLIENTS: u32 = 5;
pub const DEFAULT_SAFETY_THRESHOLD: u8 = 5;

/// Failures while reading or writing the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("cannot access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Not valid TOML, or a value of the wrong type.
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Schema ───────────────────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Listening socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Per-socket read timeout.  Bounds how long a session takes to notice
    /// shutdown.
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// SQLite database file.  `":memory:"` keeps everything in RAM.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

/// Start-up admission parameters.  A connected manager may change
/// `max_clients` and `safety_threshold` at run time; both revert to these
/// values' defaults when the manager disconnects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: u8,
    #[serde(default = "default_password")]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    /// Input gaps longer than this are recorded as inactivity.
    #[serde(default = "default_idle_threshold_minutes")]
    pub idle_threshold_minutes: i64,
    /// Repeated process-open events for the same name inside this window are
    /// dropped.
    #[serde(default = "default_debounce_window_secs")]
    pub debounce_window_secs: u64,
    /// Distinct process names remembered per connection by the debouncer.
    #[serde(default = "default_debounce_capacity")]
    pub debounce_capacity: usize,
    /// Process names ignored in addition to the built-in system list.  A
    /// trailing `*` matches any suffix.
    #[serde(default)]
    pub extra_ignored_processes: Vec<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    6734
}
fn default_recv_timeout_ms() -> u64 {
    1000
}
fn default_database_path() -> PathBuf {
    PathBuf::from("silentnet.db")
}
fn default_max_clients() -> u32 {
    DEFAULT_MAX_CLIENTS
}
fn default_safety_threshold() -> u8 {
    DEFAULT_SAFETY_THRESHOLD
}
fn default_password() -> String {
    "itzik".to_string()
}
fn default_idle_threshold_minutes() -> i64 {
    5
}
fn default_debounce_window_secs() -> u64 {
    3
}
fn default_debounce_capacity() -> usize {
    1000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            recv_timeout_ms: default_recv_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            safety_threshold: default_safety_threshold(),
            password: default_password(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            idle_threshold_minutes: default_idle_threshold_minutes(),
            debounce_window_secs: default_debounce_window_secs(),
            debounce_capacity: default_debounce_capacity(),
            extra_ignored_processes: Vec::new(),
        }
    }
}

// ── Overrides ────────────────────────────────────────────────────────────────

/// Values supplied on the command line.  `None` keeps the file's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub max_clients: Option<u32>,
    pub safety_threshold: Option<u8>,
    pub password: Option<String>,
}

impl ServerConfig {
    /// Applies command-line overrides.  Out-of-range numbers are replaced by
    /// the built-in default and logged.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(max_clients) = overrides.max_clients {
            self.admission.max_clients = if MAX_CLIENTS_RANGE.contains(&max_clients) {
                max_clients
            } else {
                warn!(
                    max_clients,
                    default = DEFAULT_MAX_CLIENTS,
                    "max_clients must be between 1 and 40; using default"
                );
                DEFAULT_MAX_CLIENTS
            };
        }
        if let Some(threshold) = overrides.safety_threshold {
            self.admission.safety_threshold = if SAFETY_THRESHOLD_RANGE.contains(&threshold) {
                threshold
            } else {
                warn!(
                    threshold,
                    default = DEFAULT_SAFETY_THRESHOLD,
                    "safety threshold must be between 1 and 5; using default"
                );
                DEFAULT_SAFETY_THRESHOLD
            };
        }
        if let Some(password) = overrides.password {
            self.admission.password = password;
        }
    }

    /// Resets out-of-range values loaded from a file to their defaults.
    pub fn sanitize(&mut self) {
        let current = ConfigOverrides {
            max_clients: Some(self.admission.max_clients),
            safety_threshold: Some(self.admission.safety_threshold),
            password: None,
        };
        self.apply_overrides(current);
        if self.monitoring.idle_threshold_minutes < 1 {
            warn!(
                value = self.monitoring.idle_threshold_minutes,
                "idle threshold must be at least one minute; using default"
            );
            self.monitoring.idle_threshold_minutes = default_idle_threshold_minutes();
        }
    }

    /// `bind_address:port` for the listener.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }
}

// ── Load / save ──────────────────────────────────────────────────────────────

/// Loads a [`ServerConfig`] from `path`, returning defaults if the file does
/// not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] when the file exists but cannot be read;
/// [`ConfigError::Parse`] when its content is not a valid configuration.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let mut cfg: ServerConfig = toml::from_str(&content)?;
            cfg.sanitize();
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_server_config_default_values() {
        // Arrange / Act
        let cfg = ServerConfig::default();

        // Assert
        assert_eq!(cfg.network.port, 6734);
        assert_eq!(cfg.network.bind_address, "0.0.0.0");
        assert_eq!(cfg.admission.max_clients, 5);
        assert_eq!(cfg.admission.safety_threshold, 5);
        assert_eq!(cfg.admission.password, "itzik");
        assert_eq!(cfg.monitoring.idle_threshold_minutes, 5);
        assert_eq!(cfg.monitoring.debounce_capacity, 1000);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: ServerConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_deserialize_partial_section_keeps_other_defaults() {
        // Arrange
        let toml_str = r#"
[admission]
max_clients = 12
"#;

        // Act
        let cfg: ServerConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.admission.max_clients, 12);
        assert_eq!(cfg.admission.password, "itzik");
        assert_eq!(cfg.network.port, 6734);
    }

    #[test]
    fn test_deserialize_invalid_toml_returns_parse_error() {
        let result: Result<ServerConfig, toml::de::Error> = toml::from_str("[[[ nope");
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_overrides_accepts_in_range_values() {
        let mut cfg = ServerConfig::default();
        cfg.apply_overrides(ConfigOverrides {
            max_clients: Some(40),
            safety_threshold: Some(1),
            password: Some("hunter2".to_string()),
        });
        assert_eq!(cfg.admission.max_clients, 40);
        assert_eq!(cfg.admission.safety_threshold, 1);
        assert_eq!(cfg.admission.password, "hunter2");
    }

    #[test]
    fn test_apply_overrides_out_of_range_falls_back_to_default() {
        // Arrange
        let mut cfg = ServerConfig::default();
        cfg.admission.max_clients = 20;

        // Act
        cfg.apply_overrides(ConfigOverrides {
            max_clients: Some(41),
            safety_threshold: Some(0),
            password: None,
        });

        // Assert
        assert_eq!(cfg.admission.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(cfg.admission.safety_threshold, DEFAULT_SAFETY_THRESHOLD);
        assert_eq!(cfg.admission.password, "itzik");
    }

    #[test]
    fn test_load_config_returns_default_when_file_absent() {
        let path = PathBuf::from("/nonexistent/silentnet/config.toml");
        let cfg = load_config(&path).expect("missing file is not an error");
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn test_load_config_sanitizes_out_of_range_file_values() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("silentnet_cfg_{}", Uuid::new_v4()));
        let path = dir.join("config.toml");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(&path, "[admission]\nmax_clients = 99\nsafety_threshold = 3\n").unwrap();

        // Act
        let cfg = load_config(&path).unwrap();

        // Assert
        assert_eq!(cfg.admission.max_clients, DEFAULT_MAX_CLIENTS);
        assert_eq!(cfg.admission.safety_threshold, 3);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_listen_address_joins_host_and_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_address(), "0.0.0.0:6734");
    }
}
