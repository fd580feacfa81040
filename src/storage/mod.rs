//! # Persistent Storage Module
//!
//! Block flash abstraction and the single-block record format shared by the
//! sample buffer and the persisted device state.
//!
//! Record layout (one record per erase block):
//!
//! ```text
//! 0  marker  u8   0xFF erased, 0x5A committed, 0x00 tombstone
//! 1  len     u16  little-endian body length
//! 3  crc     u16  little-endian CRC-16/CCITT-FALSE of the body
//! 5  body    postcard-encoded value
//! ```
//!
//! A record is written by erasing the block, programming length, CRC and body,
//! and only then programming the commit marker. Interrupted writes leave the
//! marker erased and the block reads back as free.

pub mod file;
pub mod mem;

pub use file::FileFlash;
pub use mem::MemFlash;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;
use crate::telemetry::crc::crc16_ccitt;

/// Marker of an erased (free) block
pub const MARKER_ERASED: u8 = 0xFF;

/// Marker of a committed record
pub const MARKER_COMMITTED: u8 = 0x5A;

/// Marker of an acknowledged (retired) record
pub const MARKER_TOMBSTONE: u8 = 0x00;

/// Bytes in front of every record body
pub const RECORD_HEADER_LEN: usize = 5;

/// Block-erasable flash with NOR semantics: erase sets every byte to `0xFF`,
/// programming can only clear bits
pub trait FlashDevice: Send {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> usize;

    fn read(&mut self, block: usize, offset: usize, buf: &mut [u8]) -> Result<(), StorageError>;

    fn program(&mut self, block: usize, offset: usize, data: &[u8]) -> Result<(), StorageError>;

    fn erase(&mut self, block: usize) -> Result<(), StorageError>;
}

/// Reject accesses outside the device geometry
pub(crate) fn check_bounds(
    block_size: usize,
    block_count: usize,
    block: usize,
    offset: usize,
    len: usize,
) -> Result<(), StorageError> {
    if block >= block_count || offset.checked_add(len).map_or(true, |end| end > block_size) {
        return Err(StorageError::OutOfBounds { block, offset, len });
    }
    Ok(())
}

/// State of one record block after reading it back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState<T> {
    /// Erased, or a write that never reached its commit marker
    Free,
    /// Committed and later retired
    Tombstone,
    Committed(T),
}

/// Largest body a block of `block_size` bytes can hold
pub fn max_body_len(block_size: usize) -> usize {
    block_size.saturating_sub(RECORD_HEADER_LEN).min(u16::MAX as usize)
}

/// Write `value` as the only record of `block`
///
/// # Errors
///
/// Returns `RecordTooLarge` if the encoded value does not fit the block, or
/// the flash error of the failing erase/program step.
pub fn write_record<T: Serialize>(
    flash: &mut dyn FlashDevice,
    block: usize,
    value: &T,
) -> Result<(), StorageError> {
    let body = postcard::to_allocvec(value)?;
    let max = max_body_len(flash.block_size());
    if body.len() > max {
        return Err(StorageError::RecordTooLarge { len: body.len(), max });
    }

    let mut header = [0u8; RECORD_HEADER_LEN - 1];
    header[0..2].copy_from_slice(&(body.len() as u16).to_le_bytes());
    header[2..4].copy_from_slice(&crc16_ccitt(&body).to_le_bytes());

    flash.erase(block)?;
    flash.program(block, 1, &header)?;
    flash.program(block, RECORD_HEADER_LEN, &body)?;
    flash.program(block, 0, &[MARKER_COMMITTED])
}

/// Read back the record stored in `block`
///
/// # Errors
///
/// Returns `Corruption` if the block is committed but its length, CRC or body
/// does not check out; flash errors are passed through.
pub fn read_record<T: DeserializeOwned>(
    flash: &mut dyn FlashDevice,
    block: usize,
) -> Result<RecordState<T>, StorageError> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    flash.read(block, 0, &mut header)?;

    match header[0] {
        MARKER_COMMITTED => {}
        MARKER_TOMBSTONE => return Ok(RecordState::Tombstone),
        _ => return Ok(RecordState::Free),
    }

    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
    let expected_crc = u16::from_le_bytes([header[3], header[4]]);

    if len > max_body_len(flash.block_size()) {
        return Err(StorageError::Corruption {
            block,
            reason: format!("record length {} exceeds block", len),
        });
    }

    let mut body = vec![0u8; len];
    flash.read(block, RECORD_HEADER_LEN, &mut body)?;

    let actual_crc = crc16_ccitt(&body);
    if actual_crc != expected_crc {
        return Err(StorageError::Corruption {
            block,
            reason: format!("CRC mismatch (0x{:04X} != 0x{:04X})", actual_crc, expected_crc),
        });
    }

    postcard::from_bytes(&body)
        .map(RecordState::Committed)
        .map_err(|e| StorageError::Corruption {
            block,
            reason: format!("undecodable body: {}", e),
        })
}

/// Retire the record in `block` without erasing it
pub fn tombstone(flash: &mut dyn FlashDevice, block: usize) -> Result<(), StorageError> {
    flash.program(block, 0, &[MARKER_TOMBSTONE])
}
