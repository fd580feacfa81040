//! # Telemetry Batch Decoder
//!
//! Decodes version 1 frames back into a [`Batch`]. The collar itself only
//! uses this for the loopback self-test; backend decoders follow the same
//! layout.

use super::crc::crc16_ccitt;
use super::protocol::*;
use crate::error::CodecError;
use crate::sample::{Batch, Battery, HeartRate, Motion, Position, Reading, Sample, SampleKind};

/// A decoded frame: header plus batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    pub batch: Batch,
}

/// Decode a complete frame into a batch
///
/// # Errors
///
/// Returns error if:
/// - Frame is shorter than the fixed header + trailer
/// - Sync byte or version is wrong
/// - CRC check fails
/// - A sample is truncated or carries an unknown kind
/// - Header fields disagree with the decoded samples
pub fn decode(frame: &[u8]) -> Result<Batch, CodecError> {
    decode_frame(frame).map(|decoded| decoded.batch)
}

/// Decode a complete frame, keeping the header
pub fn decode_frame(frame: &[u8]) -> Result<DecodedFrame, CodecError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CodecError::Truncated {
            needed: MIN_FRAME_LEN,
            got: frame.len(),
        });
    }

    if frame[0] != WIRE_SYNC_BYTE {
        return Err(CodecError::BadSync(frame[0]));
    }

    if !SUPPORTED_VERSIONS.contains(&frame[1]) {
        return Err(CodecError::UnsupportedVersion(frame[1]));
    }

    // Verify CRC before trusting any length field
    let body_len = frame.len() - TRAILER_LEN;
    let expected = crc16_ccitt(&frame[..body_len]);
    let actual = u16::from_be_bytes([frame[body_len], frame[body_len + 1]]);
    if expected != actual {
        return Err(CodecError::CrcMismatch { expected, actual });
    }

    let mut reader = Reader::new(&frame[..body_len]);
    let header = read_header(&mut reader)?;

    let mut samples = Vec::with_capacity(header.sample_count as usize);
    for _ in 0..header.sample_count {
        samples.push(read_sample(&mut reader, &header)?);
    }

    if reader.remaining() != 0 {
        return Err(CodecError::Malformed(format!(
            "{} trailing bytes after {} samples",
            reader.remaining(),
            header.sample_count
        )));
    }

    let batch = Batch::from_parts(header.batch_id, header.emergency, samples);
    validate_header(&header, &batch)?;

    Ok(DecodedFrame { header, batch })
}

fn read_header(reader: &mut Reader<'_>) -> Result<FrameHeader, CodecError> {
    let _sync = reader.u8()?;
    let version = reader.u8()?;
    let flags = reader.u8()?;
    let kind_bitmap = reader.u8()?;

    Ok(FrameHeader {
        version,
        emergency: flags & FLAG_EMERGENCY != 0,
        kind_bitmap,
        device_id: reader.u32()?,
        batch_id: reader.u32()?,
        first_seq: reader.u32()?,
        last_seq: reader.u32()?,
        sample_count: reader.u16()?,
        base_timestamp_ms: reader.u64()?,
    })
}

fn read_sample(reader: &mut Reader<'_>, header: &FrameHeader) -> Result<Sample, CodecError> {
    let tag = reader.u8()?;
    let kind_tag = tag & TAG_KIND_MASK;
    if tag & !(TAG_KIND_MASK | TAG_GAP) != 0 {
        return Err(CodecError::UnknownKind(tag));
    }
    let kind = SampleKind::from_tag(kind_tag).ok_or(CodecError::UnknownKind(kind_tag))?;

    let seq_delta = reader.varint()?;
    let seq_delta = u32::try_from(seq_delta)
        .map_err(|_| CodecError::Malformed(format!("sequence delta {} out of range", seq_delta)))?;
    let seq = header.first_seq.wrapping_add(seq_delta);
    let time_delta = zigzag_decode(reader.varint()?);
    let timestamp_ms = header.base_timestamp_ms.wrapping_add(time_delta as u64);

    if tag & TAG_GAP != 0 {
        return Ok(Sample::gap(seq, timestamp_ms, kind));
    }

    let reading = match kind {
        SampleKind::Motion => Reading::Motion(Motion {
            accel_mg: [reader.i16()?, reader.i16()?, reader.i16()?],
            gyro_cdps: [reader.i16()?, reader.i16()?, reader.i16()?],
        }),
        SampleKind::Position => Reading::Position(Position {
            latitude_e7: reader.i32()?,
            longitude_e7: reader.i32()?,
            altitude_m: reader.i16()?,
            satellites: reader.u8()?,
        }),
        SampleKind::HeartRate => Reading::HeartRate(HeartRate {
            bpm: reader.u8()?,
            confidence: reader.u8()?,
            skin_temp_cc: reader.i16()?,
        }),
        SampleKind::Battery => {
            let percent = reader.u8()?;
            let millivolts = reader.u16()?;
            let flags = reader.u8()?;
            Reading::Battery(Battery {
                percent,
                millivolts,
                charging: flags & BATTERY_FLAG_CHARGING != 0,
                solar: flags & BATTERY_FLAG_SOLAR != 0,
            })
        }
    };

    Ok(Sample::new(seq, timestamp_ms, reading))
}

fn validate_header(header: &FrameHeader, batch: &Batch) -> Result<(), CodecError> {
    if header.kind_bitmap != batch.kind_bitmap() {
        return Err(CodecError::Malformed(format!(
            "kind bitmap 0x{:02X} does not match samples (0x{:02X})",
            header.kind_bitmap,
            batch.kind_bitmap()
        )));
    }

    let last_seq = batch.samples().last().map_or(0, Sample::seq);
    if header.last_seq != last_seq {
        return Err(CodecError::Malformed(format!(
            "last sequence {} does not match samples ({})",
            header.last_seq, last_seq
        )));
    }

    Ok(())
}

/// Bounds-checked big-endian cursor
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        if self.remaining() < N {
            return Err(CodecError::Truncated {
                needed: self.pos + N + TRAILER_LEN,
                got: self.data.len() + TRAILER_LEN,
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        self.take().map(u16::from_be_bytes)
    }

    fn i16(&mut self) -> Result<i16, CodecError> {
        self.take().map(i16::from_be_bytes)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        self.take().map(u32::from_be_bytes)
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        self.take().map(i32::from_be_bytes)
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        self.take().map(u64::from_be_bytes)
    }

    fn varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.u8()?;
            value |= ((byte & 0x7F) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::Malformed("varint longer than 10 bytes".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::encoder::TelemetryEncoder;

    fn mixed_batch() -> Batch {
        Batch::new(
            77,
            vec![
                Sample::new(
                    1_000,
                    1_700_000_000_000,
                    Reading::Motion(Motion {
                        accel_mg: [-12, 8, 1_003],
                        gyro_cdps: [i16::MIN, 0, i16::MAX],
                    }),
                ),
                Sample::new(
                    1_001,
                    1_700_000_030_000,
                    Reading::Position(Position {
                        latitude_e7: -12_345_678,
                        longitude_e7: 365_123_456,
                        altitude_m: -20,
                        satellites: 11,
                    }),
                ),
                Sample::gap(1_002, 1_700_000_030_000, SampleKind::Motion),
                Sample::new(
                    1_005,
                    1_699_999_999_000, // clock stepped backwards
                    Reading::HeartRate(HeartRate {
                        bpm: 48,
                        confidence: 87,
                        skin_temp_cc: 3_812,
                    }),
                ),
                Sample::new(
                    1_900,
                    1_700_000_300_000,
                    Reading::Battery(Battery {
                        percent: 9,
                        millivolts: 3_412,
                        charging: true,
                        solar: true,
                    }),
                ),
            ],
        )
    }

    #[test]
    fn test_round_trip_mixed_batch() {
        let batch = mixed_batch();
        let frame = TelemetryEncoder::new(0x00C0_11A5).encode(&batch).unwrap();
        assert_eq!(decode(&frame).unwrap(), batch);
    }

    #[test]
    fn test_round_trip_empty_batch() {
        let batch = Batch::new(0, Vec::new());
        let frame = TelemetryEncoder::new(1).encode(&batch).unwrap();
        assert_eq!(decode(&frame).unwrap(), batch);
    }

    #[test]
    fn test_round_trip_emergency_flag() {
        let samples = mixed_batch().into_samples();
        let batch = Batch::emergency(3, samples);
        let decoded = decode_frame(&TelemetryEncoder::new(9).encode(&batch).unwrap()).unwrap();

        assert!(decoded.header.emergency);
        assert_eq!(decoded.header.device_id, 9);
        assert_eq!(decoded.header.first_seq, 1_000);
        assert_eq!(decoded.header.last_seq, 1_900);
        assert_eq!(decoded.batch, batch);
    }

    #[test]
    fn test_decode_frame_too_short() {
        let result = decode(&[WIRE_SYNC_BYTE, WIRE_FORMAT_VERSION]);
        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_bad_sync() {
        let mut frame = TelemetryEncoder::new(1).encode(&mixed_batch()).unwrap().to_vec();
        frame[0] = 0xC8;
        assert_eq!(decode(&frame), Err(CodecError::BadSync(0xC8)));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut frame = TelemetryEncoder::new(1).encode(&mixed_batch()).unwrap().to_vec();
        frame[1] = 2;
        assert_eq!(decode(&frame), Err(CodecError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_decode_crc_mismatch() {
        let mut frame = TelemetryEncoder::new(1).encode(&mixed_batch()).unwrap().to_vec();
        frame[HEADER_LEN + 4] ^= 0x01;
        assert!(matches!(decode(&frame), Err(CodecError::CrcMismatch { .. })));
    }

    #[test]
    fn test_decode_truncated_sample() {
        // Header claims one sample but the body ends after the tag; CRC is valid
        let mut frame = TelemetryEncoder::new(1).encode(&Batch::new(1, Vec::new())).unwrap().to_vec();
        frame.truncate(HEADER_LEN);
        frame[20..22].copy_from_slice(&1u16.to_be_bytes());
        frame.push(SampleKind::Battery.tag());
        let crc = crc16_ccitt(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        assert!(matches!(decode(&frame), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut frame = TelemetryEncoder::new(1)
            .encode(&Batch::new(1, vec![Sample::gap(1, 0, SampleKind::Motion)]))
            .unwrap()
            .to_vec();
        frame.truncate(frame.len() - TRAILER_LEN);
        frame[HEADER_LEN] = TAG_GAP | 0x05;
        let crc = crc16_ccitt(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        assert_eq!(decode(&frame), Err(CodecError::UnknownKind(5)));
    }

    #[test]
    fn test_decode_bitmap_mismatch() {
        let mut frame = TelemetryEncoder::new(1).encode(&mixed_batch()).unwrap().to_vec();
        frame.truncate(frame.len() - TRAILER_LEN);
        frame[3] = 0x01;
        let crc = crc16_ccitt(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        assert!(matches!(decode(&frame), Err(CodecError::Malformed(_))));
    }
}
