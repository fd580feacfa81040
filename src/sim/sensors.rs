//! Deterministic sensor drivers
//!
//! Readings are smooth functions of the read count, so runs are repeatable.

use async_trait::async_trait;

use crate::error::SensorError;
use crate::sample::{HeartRate, Motion, Position, Reading, SampleKind};
use crate::sensors::SensorDriver;

/// Read counter shared by the simulated drivers
#[derive(Debug, Default)]
struct ReadCounter {
    reads: u64,
    failure_every: u32,
}

impl ReadCounter {
    fn new(failure_every: u32) -> Self {
        Self { reads: 0, failure_every }
    }

    /// Count one read; `Err` when this one is scheduled to fail
    fn next(&mut self, kind: SampleKind) -> Result<u64, SensorError> {
        self.reads += 1;
        if self.failure_every > 0 && self.reads % u64::from(self.failure_every) == 0 {
            return Err(SensorError::Bus(format!("simulated {} fault", kind)));
        }
        Ok(self.reads)
    }
}

fn wave(step: u64, period: f64, amplitude: f64) -> f64 {
    (step as f64 * std::f64::consts::TAU / period).sin() * amplitude
}

/// Grazing animal: gravity on Z plus a slow sway
pub struct SimulatedImu {
    counter: ReadCounter,
}

impl SimulatedImu {
    pub fn new(failure_every: u32) -> Self {
        Self { counter: ReadCounter::new(failure_every) }
    }
}

#[async_trait]
impl SensorDriver for SimulatedImu {
    fn kind(&self) -> SampleKind {
        SampleKind::Motion
    }

    async fn read(&mut self) -> Result<Reading, SensorError> {
        let step = self.counter.next(SampleKind::Motion)?;
        let sway = wave(step, 20.0, 150.0) as i16;
        Ok(Reading::Motion(Motion {
            accel_mg: [sway, sway / 2, 1_000 - sway.abs() / 4],
            gyro_cdps: [wave(step, 7.0, 900.0) as i16, 0, -(sway * 2)],
        }))
    }
}

/// Walks a slow circle around a fixed pasture
pub struct SimulatedGnss {
    counter: ReadCounter,
    origin: (i32, i32),
}

impl SimulatedGnss {
    pub fn new(failure_every: u32) -> Self {
        Self {
            counter: ReadCounter::new(failure_every),
            origin: (-12_345_000, 347_891_000),
        }
    }
}

#[async_trait]
impl SensorDriver for SimulatedGnss {
    fn kind(&self) -> SampleKind {
        SampleKind::Position
    }

    async fn read(&mut self) -> Result<Reading, SensorError> {
        let step = self.counter.next(SampleKind::Position)?;
        let lat = self.origin.0 + wave(step, 96.0, 20_000.0) as i32;
        let lon = self.origin.1 + wave(step + 24, 96.0, 20_000.0) as i32;
        Ok(Reading::Position(Position {
            latitude_e7: lat,
            longitude_e7: lon,
            altitude_m: 1_520 + wave(step, 48.0, 12.0) as i16,
            satellites: 7 + (step % 5) as u8,
        }))
    }
}

/// Resting heart rate with a diurnal swing
pub struct SimulatedHeartRate {
    counter: ReadCounter,
}

impl SimulatedHeartRate {
    pub fn new(failure_every: u32) -> Self {
        Self { counter: ReadCounter::new(failure_every) }
    }
}

#[async_trait]
impl SensorDriver for SimulatedHeartRate {
    fn kind(&self) -> SampleKind {
        SampleKind::HeartRate
    }

    async fn read(&mut self) -> Result<Reading, SensorError> {
        let step = self.counter.next(SampleKind::HeartRate)?;
        Ok(Reading::HeartRate(HeartRate {
            bpm: (68.0 + wave(step, 1_440.0, 12.0)).round() as u8,
            confidence: 85 + (step % 10) as u8,
            skin_temp_cc: 3_850 + wave(step, 1_440.0, 60.0) as i16,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readings_match_kind() {
        let mut imu = SimulatedImu::new(0);
        let mut gnss = SimulatedGnss::new(0);
        let mut hr = SimulatedHeartRate::new(0);

        assert_eq!(imu.read().await.unwrap().kind(), SampleKind::Motion);
        assert_eq!(gnss.read().await.unwrap().kind(), SampleKind::Position);
        assert_eq!(hr.read().await.unwrap().kind(), SampleKind::HeartRate);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut gnss = SimulatedGnss::new(3);
        assert!(gnss.read().await.is_ok());
        assert!(gnss.read().await.is_ok());
        assert!(matches!(gnss.read().await, Err(SensorError::Bus(_))));
        assert!(gnss.read().await.is_ok());
    }

    #[tokio::test]
    async fn test_deterministic() {
        let mut a = SimulatedHeartRate::new(0);
        let mut b = SimulatedHeartRate::new(0);
        for _ in 0..5 {
            assert_eq!(a.read().await, b.read().await);
        }
    }

    #[tokio::test]
    async fn test_position_stays_near_origin() {
        let mut gnss = SimulatedGnss::new(0);
        for _ in 0..100 {
            match gnss.read().await.unwrap() {
                Reading::Position(p) => {
                    assert!((p.latitude_e7 - gnss.origin.0).abs() <= 20_000);
                    assert!(p.satellites >= 7);
                }
                other => panic!("unexpected reading {:?}", other),
            }
        }
    }
}
