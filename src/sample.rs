//! # Samples and Batches
//!
//! The data model shared by every component: a [`Sample`] is one immutable
//! sensor reading (or a gap marker), a [`Batch`] is the ordered group of
//! samples assembled for one transmission attempt.
//!
//! All payload values are fixed-point integers so that a sample survives the
//! flash record and the wire format bit-for-bit.

use serde::{Deserialize, Serialize};

/// Device-scoped, strictly increasing sample sequence number
pub type SequenceNumber = u32;

/// Identifier of a batch handed to the radio link
pub type BatchId = u32;

/// Sensor kind a sample was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SampleKind {
    Motion,
    Position,
    HeartRate,
    Battery,
}

impl SampleKind {
    /// Every kind, in wire tag order
    pub const ALL: [SampleKind; 4] = [
        SampleKind::Motion,
        SampleKind::Position,
        SampleKind::HeartRate,
        SampleKind::Battery,
    ];

    /// Wire tag (also the index into per-kind tables)
    pub const fn tag(self) -> u8 {
        match self {
            Self::Motion => 0,
            Self::Position => 1,
            Self::HeartRate => 2,
            Self::Battery => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    pub const fn index(self) -> usize {
        self.tag() as usize
    }

    /// Bit of this kind in a batch kind bitmap
    pub const fn bit(self) -> u8 {
        1 << self.tag()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Motion => "motion",
            Self::Position => "position",
            Self::HeartRate => "heart-rate",
            Self::Battery => "battery",
        }
    }
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// IMU reading: accelerometer and gyroscope, three axes each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Motion {
    /// Acceleration in milli-g (X, Y, Z)
    pub accel_mg: [i16; 3],
    /// Angular rate in centi-degrees per second (X, Y, Z)
    pub gyro_cdps: [i16; 3],
}

/// GNSS fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in degrees x 10^7
    pub latitude_e7: i32,
    /// Longitude in degrees x 10^7
    pub longitude_e7: i32,
    /// Altitude above mean sea level in meters
    pub altitude_m: i16,
    /// Satellites used in the fix
    pub satellites: u8,
}

/// Heart-rate sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartRate {
    pub bpm: u8,
    /// Sensor confidence, 0-100%
    pub confidence: u8,
    /// Skin temperature in centi-degrees Celsius
    pub skin_temp_cc: i16,
}

/// Fuel gauge / PMIC reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Battery {
    /// State of charge, 0-100%
    pub percent: u8,
    pub millivolts: u16,
    pub charging: bool,
    pub solar: bool,
}

/// Sensor value payload, one variant per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reading {
    Motion(Motion),
    Position(Position),
    HeartRate(HeartRate),
    Battery(Battery),
}

impl Reading {
    pub const fn kind(&self) -> SampleKind {
        match self {
            Self::Motion(_) => SampleKind::Motion,
            Self::Position(_) => SampleKind::Position,
            Self::HeartRate(_) => SampleKind::HeartRate,
            Self::Battery(_) => SampleKind::Battery,
        }
    }
}

/// One sensor reading, or a gap marker when acquisition failed
///
/// Immutable once created: fields are only reachable through accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    seq: SequenceNumber,
    kind: SampleKind,
    timestamp_ms: u64,
    reading: Option<Reading>,
}

impl Sample {
    /// Create a sample carrying a reading
    pub fn new(seq: SequenceNumber, timestamp_ms: u64, reading: Reading) -> Self {
        Self {
            seq,
            kind: reading.kind(),
            timestamp_ms,
            reading: Some(reading),
        }
    }

    /// Create a gap marker: the sensor was due but produced no value
    pub fn gap(seq: SequenceNumber, timestamp_ms: u64, kind: SampleKind) -> Self {
        Self {
            seq,
            kind,
            timestamp_ms,
            reading: None,
        }
    }

    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    pub fn kind(&self) -> SampleKind {
        self.kind
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn reading(&self) -> Option<&Reading> {
        self.reading.as_ref()
    }

    pub fn is_gap(&self) -> bool {
        self.reading.is_none()
    }

    /// Kind tag and reading agree (always true for samples built here,
    /// checked on anything deserialized from flash)
    pub fn is_consistent(&self) -> bool {
        self.reading.map_or(true, |r| r.kind() == self.kind)
    }
}

/// Ordered group of samples assembled for one transmission attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    id: BatchId,
    emergency: bool,
    samples: Vec<Sample>,
}

impl Batch {
    /// Regular batch; samples are sorted by sequence number
    pub fn new(id: BatchId, mut samples: Vec<Sample>) -> Self {
        samples.sort_by_key(Sample::seq);
        Self {
            id,
            emergency: false,
            samples,
        }
    }

    /// Emergency batch (last known position + battery), sent ahead of
    /// regular data and allowed in the Critical tier
    pub fn emergency(id: BatchId, samples: Vec<Sample>) -> Self {
        Self {
            emergency: true,
            ..Self::new(id, samples)
        }
    }

    pub(crate) fn from_parts(id: BatchId, emergency: bool, samples: Vec<Sample>) -> Self {
        Self {
            id,
            emergency,
            samples,
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Lowest and highest sequence number, `None` for an empty batch
    pub fn seq_range(&self) -> Option<(SequenceNumber, SequenceNumber)> {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => Some((first.seq(), last.seq())),
            _ => None,
        }
    }

    /// Bitmap of the kinds present in this batch
    pub fn kind_bitmap(&self) -> u8 {
        self.samples.iter().fold(0, |bits, s| bits | s.kind().bit())
    }
}
