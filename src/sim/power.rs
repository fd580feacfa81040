//! Simulated fuel gauge with a daylight solar cycle

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SimulationConfig;
use crate::error::SensorError;
use crate::power::PowerRail;

/// Length of one simulated day
pub const DAY: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug)]
struct RailState {
    percent: f32,
    drain_per_hour: f32,
    solar_per_hour: f32,
    started: Instant,
    updated: Instant,
    charging_override: Option<bool>,
    fault: bool,
}

impl RailState {
    /// Daylight for the first half of every simulated day
    fn daylight(&self, now: Instant) -> bool {
        let into_day = now.duration_since(self.started).as_secs() % DAY.as_secs();
        into_day < DAY.as_secs() / 2
    }

    fn advance(&mut self, now: Instant) {
        let hours = now.duration_since(self.updated).as_secs_f32() / 3600.0;
        self.updated = now;

        let mut delta = -self.drain_per_hour * hours;
        if self.daylight(now) {
            delta += self.solar_per_hour * hours;
        }
        self.percent = (self.percent + delta).clamp(0.0, 100.0);
    }
}

/// Battery that drains with time and charges while the sun is up
///
/// Clones share state, so a test (or the host) keeps a handle to move the
/// battery level while the control loop owns the rail.
#[derive(Debug, Clone)]
pub struct SimulatedPowerRail {
    state: Arc<Mutex<RailState>>,
}

impl SimulatedPowerRail {
    pub fn new(start_percent: u8, drain_per_hour: f32, solar_per_hour: f32) -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(RailState {
                percent: f32::from(start_percent.min(100)),
                drain_per_hour,
                solar_per_hour,
                started: now,
                updated: now,
                charging_override: None,
                fault: false,
            })),
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(
            config.battery_start_percent,
            config.drain_percent_per_hour,
            config.solar_charge_percent_per_hour,
        )
    }

    /// Constant level, no drain and no solar
    pub fn fixed(percent: u8) -> Self {
        Self::new(percent, 0.0, 0.0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RailState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_percent(&self, percent: u8) {
        let mut state = self.lock();
        state.updated = Instant::now();
        state.percent = f32::from(percent.min(100));
    }

    /// Force the charger state (`None` follows the solar cycle)
    pub fn set_charging(&self, charging: Option<bool>) {
        self.lock().charging_override = charging;
    }

    /// Make every read fail until cleared
    pub fn set_fault(&self, fault: bool) {
        self.lock().fault = fault;
    }

    fn with_state<T>(&self, read: impl FnOnce(&RailState, Instant) -> T) -> Result<T, SensorError> {
        let mut state = self.lock();
        if state.fault {
            return Err(SensorError::Bus("simulated fuel gauge fault".to_string()));
        }
        let now = Instant::now();
        state.advance(now);
        Ok(read(&state, now))
    }
}

impl PowerRail for SimulatedPowerRail {
    fn battery_percent(&mut self) -> Result<u8, SensorError> {
        self.with_state(|s, _| s.percent.round() as u8)
    }

    /// Linear Li-ion approximation, 3.3 V empty to 4.2 V full
    fn battery_millivolts(&mut self) -> Result<u16, SensorError> {
        self.with_state(|s, _| 3_300 + (s.percent * 9.0).round() as u16)
    }

    fn is_charging(&mut self) -> Result<bool, SensorError> {
        self.with_state(|s, now| {
            s.charging_override
                .unwrap_or(s.daylight(now) && s.solar_per_hour > s.drain_per_hour && s.percent < 100.0)
        })
    }

    fn solar_input_present(&mut self) -> Result<bool, SensorError> {
        self.with_state(|s, now| s.solar_per_hour > 0.0 && s.daylight(now))
    }
}
