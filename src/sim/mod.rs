//! # Simulation Module
//!
//! Host stand-ins for the collar hardware, so the control core runs (and is
//! tested) without a PCB attached.
//!
//! This module provides:
//! - Deterministic IMU, GNSS and heart-rate drivers with fault injection
//! - A fuel gauge that drains over time and charges from a daylight solar cycle
//! - A scriptable radio that records every frame it is given

pub mod power;
pub mod radio;
pub mod sensors;

use std::time::Duration;

use crate::sensors::SensorSuite;

pub use power::SimulatedPowerRail;
pub use radio::{ScriptedOutcome, SimulatedRadio};
pub use sensors::{SimulatedGnss, SimulatedHeartRate, SimulatedImu};

/// Sensor suite with every simulated driver installed
///
/// # Arguments
///
/// * `read_timeout` - Bound on each sensor read
/// * `failure_every` - Every Nth read of each sensor fails (0 = never)
pub fn simulated_suite(read_timeout: Duration, failure_every: u32) -> SensorSuite {
    SensorSuite::new(read_timeout)
        .with_driver(Box::new(SimulatedImu::new(failure_every)))
        .with_driver(Box::new(SimulatedGnss::new(failure_every)))
        .with_driver(Box::new(SimulatedHeartRate::new(failure_every)))
}
