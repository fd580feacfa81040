//! # Sensor Drivers Module
//!
//! Leaf abstraction over the sensing hardware (IMU, GNSS, heart-rate).
//!
//! Every read is bounded by a timeout, and due sensors are read concurrently,
//! so one stalled or failing sensor never delays the others or the next tick.

pub mod nmea;

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use crate::error::SensorError;
use crate::sample::{Reading, SampleKind};

/// One sensor the control core can read on demand
#[async_trait]
pub trait SensorDriver: Send {
    /// Kind of reading this driver produces
    fn kind(&self) -> SampleKind;

    async fn read(&mut self) -> Result<Reading, SensorError>;
}

/// The installed drivers, one slot per kind
pub struct SensorSuite {
    drivers: [Option<Box<dyn SensorDriver>>; 4],
    read_timeout: Duration,
}

impl SensorSuite {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            drivers: [None, None, None, None],
            read_timeout,
        }
    }

    /// Install a driver in its kind's slot, returning the one it replaces
    pub fn install(&mut self, driver: Box<dyn SensorDriver>) -> Option<Box<dyn SensorDriver>> {
        let index = driver.kind().index();
        self.drivers[index].replace(driver)
    }

    pub fn with_driver(mut self, driver: Box<dyn SensorDriver>) -> Self {
        self.install(driver);
        self
    }

    pub fn has_driver(&self, kind: SampleKind) -> bool {
        self.drivers[kind.index()].is_some()
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Read one sensor, bounded by the read timeout
    pub async fn acquire(&mut self, kind: SampleKind) -> Result<Reading, SensorError> {
        let timeout = self.read_timeout;
        bounded_read(&mut self.drivers[kind.index()], kind, timeout).await
    }

    /// Read every due kind concurrently
    ///
    /// # Returns
    ///
    /// One result per due kind, in wire tag order. Failures are returned,
    /// not retried.
    pub async fn acquire_due(&mut self, due: &[SampleKind]) -> Vec<(SampleKind, Result<Reading, SensorError>)> {
        let timeout = self.read_timeout;
        let [motion, position, heart_rate, battery] = &mut self.drivers;

        let results = tokio::join!(
            maybe_read(motion, SampleKind::Motion, due, timeout),
            maybe_read(position, SampleKind::Position, due, timeout),
            maybe_read(heart_rate, SampleKind::HeartRate, due, timeout),
            maybe_read(battery, SampleKind::Battery, due, timeout),
        );

        [results.0, results.1, results.2, results.3]
            .into_iter()
            .flatten()
            .collect()
    }
}

async fn maybe_read(
    slot: &mut Option<Box<dyn SensorDriver>>,
    kind: SampleKind,
    due: &[SampleKind],
    timeout: Duration,
) -> Option<(SampleKind, Result<Reading, SensorError>)> {
    if !due.contains(&kind) {
        return None;
    }
    Some((kind, bounded_read(slot, kind, timeout).await))
}

async fn bounded_read(
    slot: &mut Option<Box<dyn SensorDriver>>,
    kind: SampleKind,
    timeout: Duration,
) -> Result<Reading, SensorError> {
    let Some(driver) = slot.as_mut() else {
        return Err(SensorError::NotPresent(kind.name()));
    };

    match tokio::time::timeout(timeout, driver.read()).await {
        Err(_) => {
            debug!("{} read timed out after {:?}", kind, timeout);
            Err(SensorError::Timeout)
        }
        Ok(Ok(reading)) if reading.kind() != kind => Err(SensorError::Bus(format!(
            "{} driver returned a {} reading",
            kind,
            reading.kind()
        ))),
        Ok(result) => result,
    }
}
