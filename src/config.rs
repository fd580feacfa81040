//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every field has a default, so a partial file (or no file at all) yields a
//! working configuration. Interval fields set to `0` disable that sensor.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{CollarError, Result};
use crate::radio::RadioVariant;
use crate::telemetry::protocol::{MAX_SAMPLE_WIRE_LEN, MIN_FRAME_LEN};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub sensors: SensorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Device identity and control loop pacing
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub device_id: u32,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Sequence numbers reserved per high-water-mark write
    #[serde(default = "default_sequence_reservation")]
    pub sequence_reservation: u32,
}

/// Sampling intervals per power tier (milliseconds, 0 = disabled)
#[derive(Debug, Deserialize, Clone)]
pub struct SamplingConfig {
    #[serde(default = "default_motion_ms")]
    pub motion_ms: u64,

    #[serde(default = "default_position_ms")]
    pub position_ms: u64,

    #[serde(default = "default_heart_rate_ms")]
    pub heart_rate_ms: u64,

    #[serde(default = "default_battery_ms")]
    pub battery_ms: u64,

    /// Conservation tier multiplies every Normal interval by this factor
    #[serde(default = "default_conservation_factor")]
    pub conservation_factor: u32,

    #[serde(default)]
    pub critical_motion_ms: u64,

    #[serde(default = "default_critical_position_ms")]
    pub critical_position_ms: u64,

    #[serde(default = "default_critical_heart_rate_ms")]
    pub critical_heart_rate_ms: u64,

    #[serde(default)]
    pub critical_battery_ms: u64,
}

/// Power tier thresholds (battery percent)
#[derive(Debug, Deserialize, Clone)]
pub struct PowerConfig {
    #[serde(default = "default_conservation_enter")]
    pub conservation_enter_percent: u8,

    #[serde(default = "default_conservation_exit")]
    pub conservation_exit_percent: u8,

    #[serde(default = "default_critical_enter")]
    pub critical_enter_percent: u8,

    #[serde(default = "default_critical_exit")]
    pub critical_exit_percent: u8,
}

/// Flash-backed buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_path")]
    pub buffer_path: String,

    #[serde(default = "default_state_path")]
    pub state_path: String,

    #[serde(default = "default_slot_count")]
    pub slot_count: usize,

    #[serde(default = "default_slot_size")]
    pub slot_size: usize,

    #[serde(default = "default_max_batch_samples")]
    pub max_batch_samples: usize,

    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
}

/// Radio link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RadioConfig {
    #[serde(default)]
    pub variant: RadioVariant,

    #[serde(default = "default_radio_port")]
    pub port: String,

    #[serde(default = "default_radio_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_transmit_timeout_ms")]
    pub transmit_timeout_ms: u64,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    /// Longest one tick waits on the radio (connect, send or ack)
    #[serde(default = "default_poll_budget_ms")]
    pub poll_budget_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_uplink_normal_ms")]
    pub uplink_normal_ms: u64,

    #[serde(default = "default_uplink_conservation_ms")]
    pub uplink_conservation_ms: u64,

    #[serde(default = "default_emergency_interval_ms")]
    pub emergency_interval_ms: u64,

    #[serde(default = "default_lora_fport")]
    pub lora_fport: u8,

    #[serde(default)]
    pub cellular_host: String,

    #[serde(default = "default_cellular_port")]
    pub cellular_port: u16,
}

/// Sensor acquisition configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// NMEA serial port of the GNSS receiver (empty = simulated)
    #[serde(default)]
    pub gnss_port: String,

    #[serde(default = "default_gnss_baud_rate")]
    pub gnss_baud_rate: u32,
}

/// Delivery journal configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,
}

/// Diagnostic logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily rolling log files (empty = stdout only)
    #[serde(default)]
    pub log_dir: String,
}

/// Host simulation knobs
#[derive(Debug, Deserialize, Clone)]
pub struct SimulationConfig {
    #[serde(default = "default_battery_start_percent")]
    pub battery_start_percent: u8,

    #[serde(default = "default_drain_percent_per_hour")]
    pub drain_percent_per_hour: f32,

    #[serde(default = "default_solar_charge_percent_per_hour")]
    pub solar_charge_percent_per_hour: f32,

    /// Every Nth sensor read fails (0 = never)
    #[serde(default)]
    pub sensor_failure_every: u32,

    /// Every Nth radio transmission is NAKed (0 = never)
    #[serde(default)]
    pub radio_failure_every: u32,
}

// Default value functions
fn default_device_id() -> u32 { 1 }
fn default_tick_ms() -> u64 { 1000 }
fn default_sequence_reservation() -> u32 { 64 }

fn default_motion_ms() -> u64 { 1_000 }
fn default_position_ms() -> u64 { 30_000 }
fn default_heart_rate_ms() -> u64 { 60_000 }
fn default_battery_ms() -> u64 { 300_000 }
fn default_conservation_factor() -> u32 { 5 }
fn default_critical_position_ms() -> u64 { 600_000 }
fn default_critical_heart_rate_ms() -> u64 { 600_000 }

fn default_conservation_enter() -> u8 { 30 }
fn default_conservation_exit() -> u8 { 35 }
fn default_critical_enter() -> u8 { 10 }
fn default_critical_exit() -> u8 { 15 }

fn default_buffer_path() -> String { "./data/buffer.bin".to_string() }
fn default_state_path() -> String { "./data/state.bin".to_string() }
fn default_slot_count() -> usize { 4096 }
fn default_slot_size() -> usize { 64 }
fn default_max_batch_samples() -> usize { 64 }
fn default_max_batch_bytes() -> usize { 1024 }

fn default_radio_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_radio_baud_rate() -> u32 { 115_200 }
fn default_max_frame_len() -> usize { 222 }
fn default_connect_timeout_ms() -> u64 { 30_000 }
fn default_transmit_timeout_ms() -> u64 { 5_000 }
fn default_ack_timeout_ms() -> u64 { 10_000 }
fn default_poll_budget_ms() -> u64 { 100 }
fn default_backoff_base_ms() -> u64 { 2_000 }
fn default_backoff_cap_ms() -> u64 { 300_000 }
fn default_uplink_normal_ms() -> u64 { 300_000 }
fn default_uplink_conservation_ms() -> u64 { 1_800_000 }
fn default_emergency_interval_ms() -> u64 { 3_600_000 }
fn default_lora_fport() -> u8 { 2 }
fn default_cellular_port() -> u16 { 5_684 }

fn default_read_timeout_ms() -> u64 { 500 }
fn default_gnss_baud_rate() -> u32 { 9_600 }

fn default_telemetry_enabled() -> bool { true }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }

fn default_log_level() -> String { "info".to_string() }

fn default_battery_start_percent() -> u8 { 80 }
fn default_drain_percent_per_hour() -> f32 { 1.5 }
fn default_solar_charge_percent_per_hour() -> f32 { 2.0 }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            tick_ms: default_tick_ms(),
            sequence_reservation: default_sequence_reservation(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            motion_ms: default_motion_ms(),
            position_ms: default_position_ms(),
            heart_rate_ms: default_heart_rate_ms(),
            battery_ms: default_battery_ms(),
            conservation_factor: default_conservation_factor(),
            critical_motion_ms: 0,
            critical_position_ms: default_critical_position_ms(),
            critical_heart_rate_ms: default_critical_heart_rate_ms(),
            critical_battery_ms: 0,
        }
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            conservation_enter_percent: default_conservation_enter(),
            conservation_exit_percent: default_conservation_exit(),
            critical_enter_percent: default_critical_enter(),
            critical_exit_percent: default_critical_exit(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_path: default_buffer_path(),
            state_path: default_state_path(),
            slot_count: default_slot_count(),
            slot_size: default_slot_size(),
            max_batch_samples: default_max_batch_samples(),
            max_batch_bytes: default_max_batch_bytes(),
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            variant: RadioVariant::default(),
            port: default_radio_port(),
            baud_rate: default_radio_baud_rate(),
            max_frame_len: default_max_frame_len(),
            connect_timeout_ms: default_connect_timeout_ms(),
            transmit_timeout_ms: default_transmit_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            poll_budget_ms: default_poll_budget_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            uplink_normal_ms: default_uplink_normal_ms(),
            uplink_conservation_ms: default_uplink_conservation_ms(),
            emergency_interval_ms: default_emergency_interval_ms(),
            lora_fport: default_lora_fport(),
            cellular_host: String::new(),
            cellular_port: default_cellular_port(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            gnss_port: String::new(),
            gnss_baud_rate: default_gnss_baud_rate(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            battery_start_percent: default_battery_start_percent(),
            drain_percent_per_hour: default_drain_percent_per_hour(),
            solar_charge_percent_per_hour: default_solar_charge_percent_per_hour(),
            sensor_failure_every: 0,
            radio_failure_every: 0,
        }
    }
}

/// Build a configuration error from a message
fn invalid(msg: impl std::fmt::Display) -> CollarError {
    CollarError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use collar_firmware::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.device.tick_ms == 0 || self.device.tick_ms > 60_000 {
            return Err(invalid("tick_ms must be between 1 and 60000"));
        }

        if self.device.sequence_reservation == 0 {
            return Err(invalid("sequence_reservation must be greater than 0"));
        }

        // At least one sensor has to run in Normal and Critical tiers
        let s = &self.sampling;
        if [s.motion_ms, s.position_ms, s.heart_rate_ms, s.battery_ms].iter().all(|&ms| ms == 0) {
            return Err(invalid("at least one Normal sampling interval must be enabled"));
        }

        if s.conservation_factor == 0 || s.conservation_factor > 100 {
            return Err(invalid("conservation_factor must be between 1 and 100"));
        }

        if s.critical_motion_ms != 0 {
            return Err(invalid("motion sampling must be disabled in the Critical tier"));
        }

        if s.critical_position_ms == 0 && s.critical_heart_rate_ms == 0 {
            return Err(invalid("Critical tier must sample position or heart-rate"));
        }

        // Tier thresholds must nest: critical band below conservation band
        let p = &self.power;
        if p.critical_enter_percent >= p.critical_exit_percent {
            return Err(invalid("critical_enter_percent must be less than critical_exit_percent"));
        }

        if p.conservation_enter_percent >= p.conservation_exit_percent {
            return Err(invalid("conservation_enter_percent must be less than conservation_exit_percent"));
        }

        if p.critical_exit_percent > p.conservation_enter_percent {
            return Err(invalid("critical_exit_percent must not exceed conservation_enter_percent"));
        }

        if p.conservation_exit_percent > 100 {
            return Err(invalid("conservation_exit_percent must be at most 100"));
        }

        let b = &self.buffer;
        if b.slot_count < 2 {
            return Err(invalid("slot_count must be at least 2"));
        }

        if b.slot_size < 48 || b.slot_size > 4096 {
            return Err(invalid("slot_size must be between 48 and 4096"));
        }

        if b.max_batch_samples == 0 || b.max_batch_samples > u16::MAX as usize {
            return Err(invalid("max_batch_samples must be between 1 and 65535"));
        }

        let min_frame = MIN_FRAME_LEN + MAX_SAMPLE_WIRE_LEN;
        if b.max_batch_bytes < min_frame {
            return Err(invalid(format!("max_batch_bytes must be at least {}", min_frame)));
        }

        if b.buffer_path.is_empty() || b.state_path.is_empty() {
            return Err(invalid("buffer_path and state_path cannot be empty"));
        }

        let r = &self.radio;
        if r.max_frame_len < min_frame {
            return Err(invalid(format!("max_frame_len must be at least {}", min_frame)));
        }

        if r.variant != RadioVariant::Simulated && r.port.is_empty() {
            return Err(invalid("radio port cannot be empty"));
        }

        if r.variant == RadioVariant::Cellular && r.cellular_host.is_empty() {
            return Err(invalid("cellular_host is required for the cellular radio"));
        }

        for (name, value) in [
            ("connect_timeout_ms", r.connect_timeout_ms),
            ("transmit_timeout_ms", r.transmit_timeout_ms),
            ("ack_timeout_ms", r.ack_timeout_ms),
        ] {
            if value == 0 || value > 120_000 {
                return Err(invalid(format!("{} must be between 1 and 120000", name)));
            }
        }

        if r.poll_budget_ms == 0 {
            return Err(invalid("poll_budget_ms must be greater than 0"));
        }

        if r.backoff_base_ms == 0 || r.backoff_base_ms > r.backoff_cap_ms {
            return Err(invalid("backoff_base_ms must be greater than 0 and not exceed backoff_cap_ms"));
        }

        if r.uplink_normal_ms == 0 || r.uplink_conservation_ms < r.uplink_normal_ms {
            return Err(invalid("uplink_conservation_ms must be at least uplink_normal_ms (> 0)"));
        }

        if r.emergency_interval_ms == 0 {
            return Err(invalid("emergency_interval_ms must be greater than 0"));
        }

        if r.lora_fport == 0 || r.lora_fport > 223 {
            return Err(invalid("lora_fport must be between 1 and 223"));
        }

        if self.sensors.read_timeout_ms == 0 {
            return Err(invalid("read_timeout_ms must be greater than 0"));
        }

        // Sensor reads, one radio step and a session close all fit in a tick
        let tick_wait = self.sensors.read_timeout_ms.saturating_add(r.poll_budget_ms.saturating_mul(2));
        if tick_wait >= self.device.tick_ms {
            return Err(invalid(format!(
                "read_timeout_ms + 2 * poll_budget_ms ({}) must be less than tick_ms ({})",
                tick_wait, self.device.tick_ms
            )));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(invalid("telemetry log_dir cannot be empty when enabled"));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        if self.simulation.battery_start_percent > 100 {
            return Err(invalid("battery_start_percent must be at most 100"));
        }

        Ok(())
    }
}
