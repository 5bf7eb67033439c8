//! Configuration system for sysprobe
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation of snaplen rules and ring buffer geometry

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Largest snaplen a single byte-buffer slot can carry
pub const MAX_SNAPLEN: u32 = u16::MAX as u32;

/// Smallest ring buffer the capture core accepts (one page)
pub const MIN_RINGBUF_SIZE: usize = 4096;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete sensor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor settings
    pub sensor: SensorSettings,

    /// Capture settings
    pub capture: CaptureSettings,
}

/// Sensor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub const fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    /// A 0..=0 range means "not configured"
    pub fn is_disabled(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

/// Per protocol/port snaplen override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnaplenOverride {
    /// Transport protocol to match (tcp, udp); any when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Ports matched against the destination of the event
    pub ports: PortRange,

    /// Cap that replaces the global snaplen on match
    pub snaplen: u32,
}

/// Capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Global snaplen: bytes of payload copied per data parameter
    pub snaplen: u32,

    /// Raise the snaplen for well-known protocols (ports and payload sniffing)
    pub dynamic_snaplen: bool,

    /// statsd port, captured with the extended snaplen over UDP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statsd_port: Option<u16>,

    /// Shared ring buffer size in bytes
    pub ringbuf_size: usize,

    /// Number of execution contexts (staging buffers), 0 = available parallelism
    pub contexts: usize,

    /// Ports whose traffic is captured with the full-capture snaplen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fullcapture_ports: Option<PortRange>,

    /// Explicit protocol/port overrides, first match wins
    pub snaplen_overrides: Vec<SnaplenOverride>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            snaplen: 80,
            dynamic_snaplen: false,
            fullcapture_ports: None,
            statsd_port: Some(8125),
            snaplen_overrides: Vec::new(),
            ringbuf_size: 8 * 1024 * 1024,
            contexts: 0,
        }
    }
}

impl CaptureSettings {
    /// Number of staging contexts to allocate
    pub fn effective_contexts(&self) -> usize {
        if self.contexts > 0 {
            return self.contexts;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

impl SensorConfig {
    /// Render as pretty TOML
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(format!("Failed to serialize config: {}", e)))
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. SYSPROBE_CONFIG environment variable
    /// 3. ~/.config/sysprobe/config.toml
    /// 4. /etc/sysprobe/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SensorConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            SensorConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("SYSPROBE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("SYSPROBE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("sysprobe").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/sysprobe/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(&self, path: &Path) -> ConfigResult<SensorConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SensorConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut SensorConfig) {
        if let Ok(val) = std::env::var("SYSPROBE_LOG_LEVEL") {
            config.sensor.log_level = val;
        }

        if let Ok(val) = std::env::var("SYSPROBE_SNAPLEN") {
            match val.parse() {
                Ok(snaplen) => config.capture.snaplen = snaplen,
                Err(_) => warn!("Ignoring invalid SYSPROBE_SNAPLEN: {}", val),
            }
        }
        if let Ok(val) = std::env::var("SYSPROBE_DYNAMIC_SNAPLEN") {
            config.capture.dynamic_snaplen = val.parse().unwrap_or(config.capture.dynamic_snaplen);
        }
        if let Ok(val) = std::env::var("SYSPROBE_RINGBUF_SIZE") {
            match val.parse() {
                Ok(size) => config.capture.ringbuf_size = size,
                Err(_) => warn!("Ignoring invalid SYSPROBE_RINGBUF_SIZE: {}", val),
            }
        }
        if let Ok(val) = std::env::var("SYSPROBE_CONTEXTS") {
            config.capture.contexts = val.parse().unwrap_or(config.capture.contexts);
        }
    }

    /// Validate configuration
    pub fn validate(&self, config: &SensorConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.sensor.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.sensor.log_level, valid_levels
            )));
        }

        let capture = &config.capture;
        if capture.snaplen == 0 || capture.snaplen > MAX_SNAPLEN {
            return Err(ConfigError::ValidationError(format!(
                "Invalid snaplen: {}. Must be within 1..={}",
                capture.snaplen, MAX_SNAPLEN
            )));
        }

        if capture.ringbuf_size < MIN_RINGBUF_SIZE || !capture.ringbuf_size.is_power_of_two() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid ring buffer size: {}. Must be a power of two and at least {}",
                capture.ringbuf_size, MIN_RINGBUF_SIZE
            )));
        }

        if let Some(range) = &capture.fullcapture_ports {
            if range.start > range.end {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid full-capture port range: {}-{}",
                    range.start, range.end
                )));
            }
        }

        let valid_protocols = ["tcp", "udp"];
        for rule in &capture.snaplen_overrides {
            if rule.ports.start > rule.ports.end {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid snaplen override port range: {}-{}",
                    rule.ports.start, rule.ports.end
                )));
            }
            if let Some(protocol) = &rule.protocol {
                if !valid_protocols.contains(&protocol.to_lowercase().as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid snaplen override protocol: {}. Must be one of: {:?}",
                        protocol, valid_protocols
                    )));
                }
            }
            if rule.snaplen > MAX_SNAPLEN {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid snaplen override: {}. Must be at most {}",
                    rule.snaplen, MAX_SNAPLEN
                )));
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &SensorConfig, path: &Path) -> ConfigResult<()> {
        let content = config.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sysprobe").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SensorConfig::default();
        assert_eq!(config.sensor.log_level, "info");
        assert_eq!(config.capture.snaplen, 80);
        assert!(!config.capture.dynamic_snaplen);
        assert_eq!(config.capture.statsd_port, Some(8125));
        assert!(config.capture.snaplen_overrides.is_empty());
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "debug"
        "#;
        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "debug");
        assert_eq!(config.capture.snaplen, 80);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [sensor]
            log_level = "trace"

            [capture]
            snaplen = 64
            dynamic_snaplen = true
            fullcapture_ports = { start = 8000, end = 8080 }
            ringbuf_size = 65536
            contexts = 4

            [[capture.snaplen_overrides]]
            protocol = "tcp"
            ports = { start = 443, end = 443 }
            snaplen = 200
        "#;

        let config: SensorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sensor.log_level, "trace");
        assert_eq!(config.capture.snaplen, 64);
        assert!(config.capture.dynamic_snaplen);
        assert_eq!(config.capture.fullcapture_ports, Some(PortRange::new(8000, 8080)));
        assert_eq!(config.capture.ringbuf_size, 65536);
        assert_eq!(config.capture.effective_contexts(), 4);
        assert_eq!(config.capture.snaplen_overrides.len(), 1);
        let rule = &config.capture.snaplen_overrides[0];
        assert_eq!(rule.protocol.as_deref(), Some("tcp"));
        assert!(rule.ports.contains(443));
        assert!(!rule.ports.contains(444));
        assert_eq!(rule.snaplen, 200);
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = SensorConfig {
            sensor: SensorSettings {
                log_level: "invalid".to_string(),
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_zero_snaplen() {
        let config = SensorConfig {
            capture: CaptureSettings {
                snaplen: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_ringbuf_not_power_of_two() {
        let config = SensorConfig {
            capture: CaptureSettings {
                ringbuf_size: 10_000,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_bad_override() {
        let mut config = SensorConfig::default();
        config.capture.snaplen_overrides.push(SnaplenOverride {
            protocol: Some("sctp".to_string()),
            ports: PortRange::single(443),
            snaplen: 200,
        });
        assert!(ConfigLoader::new().validate(&config).is_err());

        config.capture.snaplen_overrides[0] = SnaplenOverride {
            protocol: None,
            ports: PortRange::new(500, 400),
            snaplen: 200,
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SensorConfig::default();
        config.capture.snaplen = 128;
        config.capture.snaplen_overrides.push(SnaplenOverride {
            protocol: Some("udp".to_string()),
            ports: PortRange::single(53),
            snaplen: 512,
        });

        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();

        let reloaded = ConfigLoader::new()
            .with_cli_path(Some(path.clone()))
            .load_from_file(&path)
            .unwrap();
        assert_eq!(reloaded.capture.snaplen, 128);
        assert_eq!(reloaded.capture.snaplen_overrides, config.capture.snaplen_overrides);
    }

    #[test]
    fn test_serialize_config() {
        let config = SensorConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[sensor]"));
        assert!(toml_str.contains("snaplen"));
    }
}
