//! # Telemetry Wire Format Constants and Types
//!
//! Format version 1. Every multi-byte fixed field is big-endian.
//!
//! ```text
//! Header (30 bytes)
//!   0  sync            u8   0xA7
//!   1  version         u8   0x01
//!   2  flags           u8   bit0 = emergency
//!   3  kind bitmap     u8   bit n = kind with tag n present
//!   4  device id       u32
//!   8  batch id        u32
//!  12  first seq       u32
//!  16  last seq        u32
//!  20  sample count    u16
//!  22  base timestamp  u64  milliseconds
//! Samples (count times)
//!      tag             u8   bits 0-2 kind, bit 7 gap marker
//!      seq delta       LEB128 varint (seq - first seq)
//!      time delta      zigzag LEB128 varint (timestamp - base timestamp)
//!      payload         per kind, absent for gap markers
//! Trailer
//!      crc             u16  CRC-16/CCITT-FALSE over all preceding bytes
//! ```

use crate::sample::{BatchId, Sample, SampleKind, SequenceNumber};

/// Telemetry frame sync byte
pub const WIRE_SYNC_BYTE: u8 = 0xA7;

/// Current wire format version
pub const WIRE_FORMAT_VERSION: u8 = 1;

/// Versions this decoder understands
pub const SUPPORTED_VERSIONS: &[u8] = &[1];

/// Fixed header length
pub const HEADER_LEN: usize = 30;

/// CRC trailer length
pub const TRAILER_LEN: usize = 2;

/// Smallest possible frame (empty batch)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;

/// Header flag: emergency batch
pub const FLAG_EMERGENCY: u8 = 0x01;

/// Sample tag bit marking a gap
pub const TAG_GAP: u8 = 0x80;

/// Sample tag bits holding the kind
pub const TAG_KIND_MASK: u8 = 0x07;

/// Battery payload flag bits
pub const BATTERY_FLAG_CHARGING: u8 = 0x01;
pub const BATTERY_FLAG_SOLAR: u8 = 0x02;

/// Motion payload: 3 x i16 accel + 3 x i16 gyro
pub const MOTION_PAYLOAD_SIZE: usize = 12;

/// Position payload: i32 lat + i32 lon + i16 alt + u8 satellites
pub const POSITION_PAYLOAD_SIZE: usize = 11;

/// Heart-rate payload: u8 bpm + u8 confidence + i16 skin temperature
pub const HEART_RATE_PAYLOAD_SIZE: usize = 4;

/// Battery payload: u8 percent + u16 millivolts + u8 flags
pub const BATTERY_PAYLOAD_SIZE: usize = 4;

/// Longest LEB128 encoding of a u64
pub const MAX_VARINT_LEN: usize = 10;

/// Upper bound on the wire size of any single sample
pub const MAX_SAMPLE_WIRE_LEN: usize = 1 + 2 * MAX_VARINT_LEN + MOTION_PAYLOAD_SIZE;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub emergency: bool,
    pub kind_bitmap: u8,
    pub device_id: u32,
    pub batch_id: BatchId,
    pub first_seq: SequenceNumber,
    pub last_seq: SequenceNumber,
    pub sample_count: u16,
    pub base_timestamp_ms: u64,
}

/// Payload size for a kind
pub const fn payload_len(kind: SampleKind) -> usize {
    match kind {
        SampleKind::Motion => MOTION_PAYLOAD_SIZE,
        SampleKind::Position => POSITION_PAYLOAD_SIZE,
        SampleKind::HeartRate => HEART_RATE_PAYLOAD_SIZE,
        SampleKind::Battery => BATTERY_PAYLOAD_SIZE,
    }
}

/// Number of bytes `value` takes as a LEB128 varint
pub const fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub const fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub const fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Sequence delta as carried on the wire
pub(crate) fn seq_delta(seq: SequenceNumber, first_seq: SequenceNumber) -> u64 {
    seq.wrapping_sub(first_seq) as u64
}

/// Timestamp delta as carried on the wire (zigzag)
pub(crate) fn time_delta(timestamp_ms: u64, base_ms: u64) -> u64 {
    zigzag_encode(timestamp_ms.wrapping_sub(base_ms) as i64)
}

/// Exact wire size of one sample inside a batch with the given first
/// sequence number and base timestamp
pub fn sample_wire_len(sample: &Sample, first_seq: SequenceNumber, base_ms: u64) -> usize {
    let payload = if sample.is_gap() { 0 } else { payload_len(sample.kind()) };
    1 + varint_len(seq_delta(sample.seq(), first_seq))
        + varint_len(time_delta(sample.timestamp_ms(), base_ms))
        + payload
}
