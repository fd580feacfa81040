//! # Collar Firmware
//!
//! Host runner for the tracking collar control core.
//!
//! Loads the configuration, brings up the sensors, power rail, radio and
//! flash (real serial devices or the simulation), then runs one control tick
//! per `device.tick_ms` until Ctrl+C.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use collar_firmware::config::Config;
use collar_firmware::control::ControlLoop;
use collar_firmware::radio::cellular::CellularModem;
use collar_firmware::radio::lora::LoraModem;
use collar_firmware::radio::{RadioDriver, RadioVariant};
use collar_firmware::sensors::nmea::GnssDriver;
use collar_firmware::sensors::SensorSuite;
use collar_firmware::serial::open_port;
use collar_firmware::sim::{SimulatedGnss, SimulatedHeartRate, SimulatedImu, SimulatedPowerRail, SimulatedRadio};
use collar_firmware::state::FlashStateStore;
use collar_firmware::storage::FileFlash;
use collar_firmware::telemetry::encoder::TelemetryEncoder;
use collar_firmware::telemetry::journal::DeliveryJournal;
use collar_firmware::telemetry::self_test;

/// Used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Ticks between status log messages
const LOG_INTERVAL_TICKS: u64 = 60;

/// Block size of the state flash image (two blocks, A/B)
const STATE_BLOCK_SIZE: usize = 64;

/// First CLI argument, else the default file if present
fn config_path(args: &[String]) -> Option<PathBuf> {
    if let Some(path) = args.get(1) {
        return Some(PathBuf::from(path));
    }
    let default = Path::new(DEFAULT_CONFIG_PATH);
    default.exists().then(|| default.to_path_buf())
}

/// Console logging, plus a daily rolling file when `logging.log_dir` is set
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid logging.level")?;

    if config.logging.log_dir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    }

    let appender = tracing_appender::rolling::daily(&config.logging.log_dir, "collar.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn build_radio(config: &Config) -> Result<Box<dyn RadioDriver>> {
    let r = &config.radio;
    let connect_timeout = Duration::from_millis(r.connect_timeout_ms);

    let radio: Box<dyn RadioDriver> = match r.variant {
        RadioVariant::Simulated => Box::new(
            SimulatedRadio::new(r.max_frame_len).with_failure_every(config.simulation.radio_failure_every),
        ),
        RadioVariant::Lora => {
            let port = open_port(&r.port, r.baud_rate)?;
            Box::new(LoraModem::new(port, r.lora_fport, r.max_frame_len, connect_timeout))
        }
        RadioVariant::Cellular => {
            let port = open_port(&r.port, r.baud_rate)?;
            Box::new(CellularModem::new(
                port,
                &r.cellular_host,
                r.cellular_port,
                r.max_frame_len,
                connect_timeout,
            ))
        }
    };
    Ok(radio)
}

fn build_sensors(config: &Config) -> Result<SensorSuite> {
    let failure_every = config.simulation.sensor_failure_every;
    let mut suite = SensorSuite::new(Duration::from_millis(config.sensors.read_timeout_ms))
        .with_driver(Box::new(SimulatedImu::new(failure_every)))
        .with_driver(Box::new(SimulatedHeartRate::new(failure_every)));

    if config.sensors.gnss_port.is_empty() {
        suite.install(Box::new(SimulatedGnss::new(failure_every)));
    } else {
        let port = open_port(&config.sensors.gnss_port, config.sensors.gnss_baud_rate)?;
        suite.install(Box::new(GnssDriver::new(port)));
    }
    Ok(suite)
}

fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("Cannot create {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Main entry point for the collar firmware runner
///
/// # Errors
///
/// Returns error if:
/// - The configuration cannot be loaded or is invalid
/// - A serial device or flash image cannot be opened
/// - The telemetry self-test fails
/// - The sequence number space is exhausted
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = match config_path(&args) {
        Some(path) => Config::load(&path).with_context(|| format!("Loading {}", path.display()))?,
        None => Config::default(),
    };

    let _log_guard = init_logging(&config)?;
    info!("Collar firmware v{} starting...", env!("CARGO_PKG_VERSION"));

    self_test(&TelemetryEncoder::new(config.device.device_id))?;

    let sensors = build_sensors(&config)?;
    let rail = Box::new(SimulatedPowerRail::from_config(&config.simulation));
    let radio = build_radio(&config)?;

    let b = &config.buffer;
    ensure_parent(&b.buffer_path)?;
    ensure_parent(&b.state_path)?;
    let buffer_flash = FileFlash::open(&b.buffer_path, b.slot_size, b.slot_count)?;
    let state_store = FlashStateStore::new(FileFlash::open(&b.state_path, STATE_BLOCK_SIZE, 2)?)?;

    let mut journal = if config.telemetry.enabled {
        Some(DeliveryJournal::open(&config.telemetry, config.device.device_id)?)
    } else {
        None
    };

    let mut control = ControlLoop::boot(&config, sensors, rail, radio, Box::new(buffer_flash), state_store)?;

    let mut ticker = interval(Duration::from_millis(config.device.tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let start = Instant::now();

    info!("Control loop running every {} ms", config.device.tick_ms);
    info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let report = match control.tick(now_ms).await {
                    Ok(report) => report,
                    Err(e) => {
                        error!("Control loop halted: {}", e);
                        return Err(e.into());
                    }
                };

                if let Some(journal) = journal.as_mut() {
                    for event in &report.events {
                        if let Err(e) = journal.record(event) {
                            warn!("Journal write failed: {}", e);
                        }
                    }
                }

                let stats = control.stats();
                if stats.ticks % LOG_INTERVAL_TICKS == 0 {
                    info!(
                        "Tier {}: {} samples ({} gaps), {} delivered, {} pending, {} failed sends",
                        report.tier,
                        stats.samples_created,
                        stats.gaps,
                        stats.delivered_samples,
                        control.buffer().pending_len(),
                        stats.failed_sends
                    );
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    if let Some(journal) = journal.as_mut() {
        journal.flush()?;
    }
    info!("Final counters: {:?}", control.stats());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_from_args() {
        let args = vec!["collar-firmware".to_string(), "/etc/collar.toml".to_string()];
        assert_eq!(config_path(&args), Some(PathBuf::from("/etc/collar.toml")));
    }

    #[test]
    fn test_ensure_parent_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data/buffer.bin");
        ensure_parent(path.to_str().unwrap()).unwrap();
        assert!(dir.path().join("nested/data").is_dir());
    }

    #[test]
    fn test_simulated_radio_from_default_config() {
        let radio = build_radio(&Config::default()).unwrap();
        assert_eq!(radio.variant(), RadioVariant::Simulated);
        assert_eq!(radio.max_frame_len(), Config::default().radio.max_frame_len);
    }
}
