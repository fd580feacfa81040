//! # Telemetry Batch Encoder
//!
//! Serializes a [`Batch`] into the version 1 wire format described in
//! [`super::protocol`]. Output is deterministic: the same batch and device id
//! always produce the same bytes.

use bytes::{BufMut, Bytes, BytesMut};

use super::crc::crc16_ccitt;
use super::protocol::*;
use crate::error::CodecError;
use crate::sample::{Batch, Reading, Sample};

/// Encoder bound to one device identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryEncoder {
    device_id: u32,
}

impl TelemetryEncoder {
    pub fn new(device_id: u32) -> Self {
        Self { device_id }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Encode a batch into a complete frame (header + samples + CRC)
    ///
    /// # Arguments
    ///
    /// * `batch` - Batch to encode; may be empty
    ///
    /// # Returns
    ///
    /// * `Bytes` - Complete frame, exactly [`encoded_len`] bytes long
    ///
    /// # Errors
    ///
    /// `TooManySamples` if the batch holds more than `u16::MAX` samples
    ///
    /// # Examples
    ///
    /// ```
    /// use collar_firmware::sample::Batch;
    /// use collar_firmware::telemetry::encoder::TelemetryEncoder;
    /// use collar_firmware::telemetry::protocol::MIN_FRAME_LEN;
    ///
    /// let frame = TelemetryEncoder::new(42).encode(&Batch::new(1, Vec::new())).unwrap();
    /// assert_eq!(frame.len(), MIN_FRAME_LEN);
    /// ```
    pub fn encode(&self, batch: &Batch) -> Result<Bytes, CodecError> {
        let count = u16::try_from(batch.len()).map_err(|_| CodecError::TooManySamples(batch.len()))?;
        let mut frame = BytesMut::with_capacity(encoded_len(batch));

        let (first_seq, last_seq) = batch.seq_range().unwrap_or((0, 0));
        let base_ms = batch.samples().first().map_or(0, Sample::timestamp_ms);
        let flags = if batch.is_emergency() { FLAG_EMERGENCY } else { 0 };

        // Header
        frame.put_u8(WIRE_SYNC_BYTE);
        frame.put_u8(WIRE_FORMAT_VERSION);
        frame.put_u8(flags);
        frame.put_u8(batch.kind_bitmap());
        frame.put_u32(self.device_id);
        frame.put_u32(batch.id());
        frame.put_u32(first_seq);
        frame.put_u32(last_seq);
        frame.put_u16(count);
        frame.put_u64(base_ms);

        for sample in batch.samples() {
            encode_sample(&mut frame, sample, first_seq, base_ms);
        }

        // CRC over everything written so far
        let crc = crc16_ccitt(&frame);
        frame.put_u16(crc);

        Ok(frame.freeze())
    }
}

/// Exact encoded size of a batch
pub fn encoded_len(batch: &Batch) -> usize {
    let first_seq = batch.samples().first().map_or(0, Sample::seq);
    let base_ms = batch.samples().first().map_or(0, Sample::timestamp_ms);

    MIN_FRAME_LEN
        + batch
            .samples()
            .iter()
            .map(|s| sample_wire_len(s, first_seq, base_ms))
            .sum::<usize>()
}

fn encode_sample(frame: &mut BytesMut, sample: &Sample, first_seq: u32, base_ms: u64) {
    let mut tag = sample.kind().tag();
    if sample.is_gap() {
        tag |= TAG_GAP;
    }

    frame.put_u8(tag);
    put_varint(frame, seq_delta(sample.seq(), first_seq));
    put_varint(frame, time_delta(sample.timestamp_ms(), base_ms));

    match sample.reading() {
        None => {}
        Some(Reading::Motion(m)) => {
            for axis in m.accel_mg.iter().chain(m.gyro_cdps.iter()) {
                frame.put_i16(*axis);
            }
        }
        Some(Reading::Position(p)) => {
            frame.put_i32(p.latitude_e7);
            frame.put_i32(p.longitude_e7);
            frame.put_i16(p.altitude_m);
            frame.put_u8(p.satellites);
        }
        Some(Reading::HeartRate(h)) => {
            frame.put_u8(h.bpm);
            frame.put_u8(h.confidence);
            frame.put_i16(h.skin_temp_cc);
        }
        Some(Reading::Battery(b)) => {
            let mut flags = 0;
            if b.charging {
                flags |= BATTERY_FLAG_CHARGING;
            }
            if b.solar {
                flags |= BATTERY_FLAG_SOLAR;
            }
            frame.put_u8(b.percent);
            frame.put_u16(b.millivolts);
            frame.put_u8(flags);
        }
    }
}

/// Append `value` as an unsigned LEB128 varint
pub(crate) fn put_varint(frame: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        frame.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    frame.put_u8(value as u8);
}
