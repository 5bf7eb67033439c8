//! sysprobe core - configuration and capture metrics
//!
//! This crate holds what every other sysprobe crate shares:
//!
//! - **Config**: TOML configuration, discovery and environment overrides
//! - **Metrics**: lock-free counters for submitted and dropped events

pub mod config;
pub mod metrics;

pub use config::{
    CaptureSettings, ConfigError, ConfigLoader, ConfigResult, PortRange, SensorConfig,
    SnaplenOverride,
};
pub use metrics::{create_metrics, MetricsCollector, SharedMetrics};

/// Sensor version
pub const SENSOR_VERSION: &str = env!("CARGO_PKG_VERSION");
