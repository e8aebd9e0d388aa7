//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! A missing or unparsable file falls back to defaults with a warning.

use crate::domain::types::DEFAULT_PLATE_MAX_LEN;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which actuator implementation drives the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Simulated,
    Gpio,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Simulated => "simulated",
            DriverKind::Gpio => "gpio",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "gate".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Path to the embedded controller executable
    pub binary: String,
    #[serde(default = "default_park_flag")]
    pub park_flag: String,
    /// Watchdog deadline for one authorization request
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_park_flag() -> String {
    "--park".to_string()
}

fn default_deadline_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    pub driver: DriverKind,
    #[serde(default = "default_auto_close_ms")]
    pub auto_close_ms: u64,
    /// Simulated travel time between end positions
    #[serde(default = "default_travel_ms")]
    pub travel_ms: u64,
}

fn default_auto_close_ms() -> u64 {
    3000
}

fn default_travel_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpioConfig {
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,
    #[serde(default = "default_red_pin")]
    pub red_pin: u32,
    #[serde(default = "default_green_pin")]
    pub green_pin: u32,
    #[serde(default)]
    pub servo_pwm_chip: u32,
    #[serde(default)]
    pub servo_pwm_channel: u32,
}

fn default_sysfs_root() -> String {
    "/sys/class".to_string()
}

fn default_red_pin() -> u32 {
    23
}

fn default_green_pin() -> u32 {
    24
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            red_pin: default_red_pin(),
            green_pin: default_green_pin(),
            servo_pwm_chip: 0,
            servo_pwm_channel: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlateConfig {
    #[serde(default = "default_plate_max_len")]
    pub max_len: usize,
}

fn default_plate_max_len() -> usize {
    DEFAULT_PLATE_MAX_LEN
}

impl Default for PlateConfig {
    fn default() -> Self {
        Self { max_len: default_plate_max_len() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecisionsConfig {
    #[serde(default = "default_decisions_enabled")]
    pub enabled: bool,
    /// File path for decision egress (JSONL format)
    #[serde(default = "default_decisions_file")]
    pub file: String,
}

fn default_decisions_enabled() -> bool {
    true
}

fn default_decisions_file() -> String {
    "decisions.jsonl".to_string()
}

impl Default for DecisionsConfig {
    fn default() -> Self {
        Self { enabled: default_decisions_enabled(), file: default_decisions_file() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub controller: ControllerConfig,
    pub gate: GateConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub plate: PlateConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub decisions: DecisionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    controller_binary: PathBuf,
    controller_park_flag: String,
    controller_deadline_ms: u64,
    driver: DriverKind,
    auto_close_ms: u64,
    travel_ms: u64,
    gpio: GpioConfig,
    plate_max_len: usize,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    decisions_enabled: bool,
    decisions_file: String,
    log_json: bool,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            controller_binary: PathBuf::from("./parking_node"),
            controller_park_flag: default_park_flag(),
            controller_deadline_ms: default_deadline_ms(),
            driver: DriverKind::Simulated,
            auto_close_ms: default_auto_close_ms(),
            travel_ms: default_travel_ms(),
            gpio: GpioConfig::default(),
            plate_max_len: DEFAULT_PLATE_MAX_LEN,
            metrics_interval_secs: default_metrics_interval(),
            prometheus_port: 0,
            decisions_enabled: default_decisions_enabled(),
            decisions_file: default_decisions_file(),
            log_json: false,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        anyhow::ensure!(
            toml_config.controller.deadline_ms > 0,
            "controller.deadline_ms must be positive in {}",
            path.display()
        );
        anyhow::ensure!(
            toml_config.plate.max_len > 0,
            "plate.max_len must be positive in {}",
            path.display()
        );

        Ok(Self {
            site_id: toml_config.site.id,
            controller_binary: PathBuf::from(toml_config.controller.binary),
            controller_park_flag: toml_config.controller.park_flag,
            controller_deadline_ms: toml_config.controller.deadline_ms,
            driver: toml_config.gate.driver,
            auto_close_ms: toml_config.gate.auto_close_ms,
            travel_ms: toml_config.gate.travel_ms,
            gpio: toml_config.gpio,
            plate_max_len: toml_config.plate.max_len,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            decisions_enabled: toml_config.decisions.enabled,
            decisions_file: toml_config.decisions.file,
            log_json: toml_config.logging.json,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn controller_binary(&self) -> &Path {
        &self.controller_binary
    }

    pub fn controller_park_flag(&self) -> &str {
        &self.controller_park_flag
    }

    pub fn controller_deadline(&self) -> Duration {
        Duration::from_millis(self.controller_deadline_ms)
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    pub fn auto_close(&self) -> Duration {
        Duration::from_millis(self.auto_close_ms)
    }

    pub fn travel_time(&self) -> Duration {
        Duration::from_millis(self.travel_ms)
    }

    pub fn gpio(&self) -> &GpioConfig {
        &self.gpio
    }

    pub fn plate_max_len(&self) -> usize {
        self.plate_max_len
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn decisions_enabled(&self) -> bool {
        self.decisions_enabled
    }

    pub fn decisions_file(&self) -> &str {
        &self.decisions_file
    }

    pub fn log_json(&self) -> bool {
        self.log_json
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to point at a different controller executable
    pub fn with_controller_binary<P: Into<PathBuf>>(mut self, binary: P) -> Self {
        self.controller_binary = binary.into();
        self
    }

    /// Builder method to set the watchdog deadline
    pub fn with_controller_deadline_ms(mut self, ms: u64) -> Self {
        self.controller_deadline_ms = ms;
        self
    }

    /// Builder method to set the auto-close interval
    pub fn with_auto_close_ms(mut self, ms: u64) -> Self {
        self.auto_close_ms = ms;
        self
    }

    /// Builder method to set the simulated travel time
    pub fn with_travel_ms(mut self, ms: u64) -> Self {
        self.travel_ms = ms;
        self
    }

    /// Builder method to set the plate length bound
    pub fn with_plate_max_len(mut self, max_len: usize) -> Self {
        self.plate_max_len = max_len;
        self
    }
}
