//! TOML configuration, following the same load-with-env-override-and-
//! per-field-defaults shape used throughout this codebase's config layer.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/qseriesd/qseriesd.toml";
const ENV_CONFIG_PATH: &str = "QSERIESD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `QSERIESD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    /// Load configuration from an explicit path. Exposed separately from
    /// `load()` so the CLI's `--config` flag and tests can bypass the env
    /// var lookup.
    pub fn load_from(path: &PathBuf) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstrumentConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_menu_timeout_ms")]
    pub menu_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_ring_buffer_capacity")]
    pub ring_buffer_capacity: usize,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            menu_timeout_ms: default_menu_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            ring_buffer_capacity: default_ring_buffer_capacity(),
        }
    }
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud() -> u32 {
    9600
}
fn default_menu_timeout_ms() -> u64 {
    3_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_ring_buffer_capacity() -> usize {
    crate::ring_buffer::DEFAULT_CAPACITY
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecorderConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_roll_interval_s")]
    pub roll_interval_s: u64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub mission: Option<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            roll_interval_s: default_roll_interval_s(),
            schema_version: default_schema_version(),
            mission: None,
        }
    }
}

fn default_output_dir() -> String {
    "/var/lib/qseriesd/recordings".to_string()
}
fn default_roll_interval_s() -> u64 {
    3_600
}
fn default_schema_version() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load_from(&PathBuf::from("/nonexistent/path/qseriesd.toml"));
        assert_eq!(cfg.instrument.port, default_port());
        assert_eq!(cfg.instrument.baud, 9600);
        assert_eq!(cfg.recorder.roll_interval_s, 3_600);
    }

    #[test]
    fn partial_toml_fills_remaining_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [instrument]
            port = "/dev/ttyS1"
            baud = 19200
            "#
        )
        .unwrap();
        let cfg = Config::load_from(&file.path().to_path_buf());
        assert_eq!(cfg.instrument.port, "/dev/ttyS1");
        assert_eq!(cfg.instrument.baud, 19200);
        assert_eq!(cfg.instrument.menu_timeout_ms, default_menu_timeout_ms());
        assert_eq!(cfg.recorder.output_dir, default_output_dir());
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "this is not valid toml =====").unwrap();
        let cfg = Config::load_from(&file.path().to_path_buf());
        assert_eq!(cfg.instrument.port, default_port());
    }
}
