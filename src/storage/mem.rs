//! In-memory flash with NOR semantics, erase counters and power-cut injection

use std::sync::{Arc, Mutex, MutexGuard};

use super::{check_bounds, FlashDevice};
use crate::error::StorageError;

#[derive(Debug)]
struct Inner {
    data: Vec<u8>,
    erase_counts: Vec<u32>,
    /// Program calls left before the simulated power cut
    programs_until_cut: Option<usize>,
}

/// RAM-backed flash
///
/// Clones share the same storage, so a test can hand one clone to the
/// component under test and keep another to inspect or "reboot" with.
#[derive(Debug, Clone)]
pub struct MemFlash {
    block_size: usize,
    block_count: usize,
    inner: Arc<Mutex<Inner>>,
}

impl MemFlash {
    /// Create a fully erased device
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            block_count,
            inner: Arc::new(Mutex::new(Inner {
                data: vec![0xFF; block_size * block_count],
                erase_counts: vec![0; block_count],
                programs_until_cut: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Let `programs` more program calls succeed, then tear the next one
    /// halfway through and fail every write until [`MemFlash::restore_power`]
    pub fn cut_power_after(&self, programs: usize) {
        self.lock().programs_until_cut = Some(programs);
    }

    pub fn restore_power(&self) {
        self.lock().programs_until_cut = None;
    }

    /// Flip the low bit of one byte, bypassing NOR rules
    pub fn corrupt(&self, block: usize, offset: usize) {
        let idx = block * self.block_size + offset;
        let mut inner = self.lock();
        if let Some(byte) = inner.data.get_mut(idx) {
            *byte ^= 0x01;
        }
    }

    pub fn erase_count(&self, block: usize) -> u32 {
        self.lock().erase_counts.get(block).copied().unwrap_or(0)
    }

    fn range(&self, block: usize, offset: usize, len: usize) -> std::ops::Range<usize> {
        let start = block * self.block_size + offset;
        start..start + len
    }
}

impl FlashDevice for MemFlash {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read(&mut self, block: usize, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(self.block_size, self.block_count, block, offset, buf.len())?;
        let range = self.range(block, offset, buf.len());
        buf.copy_from_slice(&self.lock().data[range]);
        Ok(())
    }

    fn program(&mut self, block: usize, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(self.block_size, self.block_count, block, offset, data.len())?;
        let range = self.range(block, offset, data.len());
        let mut inner = self.lock();

        let written = match inner.programs_until_cut {
            Some(0) => data.len() / 2,
            Some(ref mut left) => {
                *left -= 1;
                data.len()
            }
            None => data.len(),
        };

        for (cell, byte) in inner.data[range].iter_mut().zip(&data[..written]) {
            *cell &= *byte;
        }

        if written < data.len() {
            return Err(StorageError::Io("power lost during program".to_string()));
        }
        Ok(())
    }

    fn erase(&mut self, block: usize) -> Result<(), StorageError> {
        check_bounds(self.block_size, self.block_count, block, 0, 0)?;
        let range = self.range(block, 0, self.block_size);
        let mut inner = self.lock();

        if inner.programs_until_cut == Some(0) {
            return Err(StorageError::Io("power lost before erase".to_string()));
        }

        inner.data[range].fill(0xFF);
        inner.erase_counts[block] += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_device_is_erased() {
        let mut flash = MemFlash::new(16, 2);
        let mut buf = [0u8; 16];
        flash.read(1, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 16]);
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = MemFlash::new(8, 1);
        flash.program(0, 0, &[0b1010_1010]).unwrap();
        flash.program(0, 0, &[0b0110_0110]).unwrap();

        let mut buf = [0u8; 1];
        flash.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0b0010_0010);
    }

    #[test]
    fn test_erase_restores_ones_and_counts() {
        let mut flash = MemFlash::new(8, 2);
        flash.program(1, 0, &[0; 8]).unwrap();
        flash.erase(1).unwrap();

        let mut buf = [0u8; 8];
        flash.read(1, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);
        assert_eq!(flash.erase_count(1), 1);
        assert_eq!(flash.erase_count(0), 0);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut flash = MemFlash::new(8, 2);
        assert!(flash.program(2, 0, &[0]).is_err());
        assert!(flash.read(0, 4, &mut [0u8; 5]).is_err());
        assert!(flash.erase(5).is_err());
    }

    #[test]
    fn test_power_cut_tears_program() {
        let mut flash = MemFlash::new(8, 1);
        flash.cut_power_after(1);

        flash.program(0, 0, &[0x11]).unwrap();
        assert!(flash.program(0, 4, &[0, 0, 0, 0]).is_err());

        let mut buf = [0u8; 8];
        flash.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0x11, 0xFF, 0xFF, 0xFF, 0, 0, 0xFF, 0xFF]);

        // Still dead until power comes back
        assert!(flash.erase(0).is_err());
        flash.restore_power();
        assert!(flash.erase(0).is_ok());
    }

    #[test]
    fn test_clones_share_storage() {
        let mut a = MemFlash::new(4, 1);
        let mut b = a.clone();
        a.program(0, 0, &[0x42]).unwrap();

        let mut buf = [0u8; 1];
        b.read(0, 0, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);
    }
}
