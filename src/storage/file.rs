//! File-backed flash for running the control core on a host
//!
//! The image file holds `block_count * block_size` bytes. A missing file, or
//! one with the wrong size, is (re)created fully erased.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{check_bounds, FlashDevice};
use crate::error::StorageError;

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Io(e.to_string())
}

#[derive(Debug)]
pub struct FileFlash {
    path: PathBuf,
    file: File,
    block_size: usize,
    block_count: usize,
}

impl FileFlash {
    /// Open or create a flash image
    ///
    /// # Arguments
    ///
    /// * `path` - Image file; parent directories are created
    /// * `block_size` - Erase block size in bytes
    /// * `block_count` - Number of blocks
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the file cannot be created or sized
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize, block_count: usize) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let expected = (block_size * block_count) as u64;
        let actual = file.metadata().map_err(io_err)?.len();

        if actual != expected {
            if actual != 0 {
                warn!(
                    "Flash image {:?} is {} bytes, expected {}; reformatting",
                    path, actual, expected
                );
            } else {
                info!("Creating flash image {:?} ({} x {} bytes)", path, block_count, block_size);
            }
            file.set_len(0).map_err(io_err)?;
            file.write_all(&vec![0xFF; expected as usize]).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }

        Ok(Self {
            path,
            file,
            block_size,
            block_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn seek(&mut self, block: usize, offset: usize) -> Result<(), StorageError> {
        let pos = (block * self.block_size + offset) as u64;
        self.file.seek(SeekFrom::Start(pos)).map_err(io_err)?;
        Ok(())
    }
}

impl FlashDevice for FileFlash {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read(&mut self, block: usize, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(self.block_size, self.block_count, block, offset, buf.len())?;
        self.seek(block, offset)?;
        self.file.read_exact(buf).map_err(io_err)
    }

    fn program(&mut self, block: usize, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(self.block_size, self.block_count, block, offset, data.len())?;

        let mut current = vec![0u8; data.len()];
        self.read(block, offset, &mut current)?;
        for (cell, byte) in current.iter_mut().zip(data) {
            *cell &= *byte;
        }

        self.seek(block, offset)?;
        self.file.write_all(&current).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)
    }

    fn erase(&mut self, block: usize) -> Result<(), StorageError> {
        check_bounds(self.block_size, self.block_count, block, 0, 0)?;
        self.seek(block, 0)?;
        self.file.write_all(&vec![0xFF; self.block_size]).map_err(io_err)?;
        self.file.sync_data().map_err(io_err)
    }
}
