//! Typed raw-block I/O over a single pre-sized file (spec.md §4.1).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::config::BLOCK_SIZE;
use crate::error::{Error, Result};

/// A file of exactly `capacity * BLOCK_SIZE` bytes, written as a circular
/// buffer of fixed blocks. `Volume` itself only knows about linear
/// append/read within its own capacity; wraparound and generation
/// bookkeeping live one layer up, in `BlockStore`.
pub struct Volume {
    file: File,
    path: PathBuf,
    capacity: u32,
    write_pos: u32,
    /// Set once an I/O error is observed; from then on the volume refuses
    /// further writes (spec.md §4.1: "the store marks the volume
    /// read-only").
    poisoned: bool,
}

impl Volume {
    /// Creates a new, zero-filled volume file of `capacity` blocks.
    /// Fails if the file already exists.
    pub fn create(path: &Path, capacity: u32) -> Result<Volume> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create_new(true);
        let file = opts.open(path)?;
        file.set_len(capacity as u64 * BLOCK_SIZE as u64)?;
        file.try_lock_exclusive()
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), "volume already locked")))?;

        Ok(Volume {
            file,
            path: path.to_owned(),
            capacity,
            write_pos: 0,
            poisoned: false,
        })
    }

    /// Opens an existing volume file, resuming appends at `write_pos`.
    pub fn open(path: &Path, capacity: u32, write_pos: u32) -> Result<Volume> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        let file = opts.open(path)?;
        file.try_lock_exclusive()
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), "volume already locked")))?;

        if write_pos > capacity {
            return Err(Error::BadInput("write_pos beyond capacity".into()));
        }

        Ok(Volume {
            file,
            path: path.to_owned(),
            capacity,
            write_pos,
            poisoned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn write_pos(&self) -> u32 {
        self.write_pos
    }

    pub fn is_full(&self) -> bool {
        self.write_pos >= self.capacity
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Appends one block at the current `write_pos`, advancing it.
    /// Returns `Overflow` (not `Error::Io`) when the volume is full --
    /// that's the expected, recoverable "time to rotate" signal.
    pub fn append_block(&mut self, src: &[u8; BLOCK_SIZE]) -> Result<u32> {
        if self.poisoned {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "volume is read-only after a prior I/O error",
            )));
        }
        if self.write_pos >= self.capacity {
            return Err(Error::Overflow);
        }

        let index = self.write_pos;
        if let Err(e) = self.write_at(index, src) {
            self.poisoned = true;
            return Err(e);
        }
        self.write_pos += 1;
        Ok(index)
    }

    fn write_at(&mut self, index: u32, src: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(index as u64 * BLOCK_SIZE as u64))?;
        self.file.write_all(src)?;
        Ok(())
    }

    /// Reads the block at `index` into `dst`. `OutOfRange` when `index`
    /// isn't a valid block position in this volume.
    pub fn read_block(&mut self, index: u32, dst: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        if index >= self.capacity {
            return Err(Error::OutOfRange);
        }
        self.file
            .seek(SeekFrom::Start(index as u64 * BLOCK_SIZE as u64))?;
        if let Err(e) = self.file.read_exact(dst) {
            self.poisoned = true;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Resets the volume for reuse under a new generation: rewinds
    /// `write_pos` to zero without touching the underlying bytes (they'll
    /// be overwritten block-by-block as new appends land).
    pub fn reset(&mut self) {
        self.write_pos = 0;
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol0");
        let mut vol = Volume::create(&path, 4).unwrap();

        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xAB;
        let idx = vol.append_block(&block).unwrap();
        assert_eq!(idx, 0);

        let mut out = [0u8; BLOCK_SIZE];
        vol.read_block(0, &mut out).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn overflow_when_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol0");
        let mut vol = Volume::create(&path, 2).unwrap();
        let block = [0u8; BLOCK_SIZE];
        vol.append_block(&block).unwrap();
        vol.append_block(&block).unwrap();
        assert!(matches!(vol.append_block(&block), Err(Error::Overflow)));
    }

    #[test]
    fn out_of_range_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol0");
        let mut vol = Volume::create(&path, 2).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        assert!(matches!(vol.read_block(5, &mut out), Err(Error::OutOfRange)));
    }

    #[test]
    fn reopen_resumes_at_write_pos() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol0");
        {
            let mut vol = Volume::create(&path, 4).unwrap();
            let block = [1u8; BLOCK_SIZE];
            vol.append_block(&block).unwrap();
            vol.append_block(&block).unwrap();
            vol.flush().unwrap();
        }
        let vol = Volume::open(&path, 4, 2).unwrap();
        assert_eq!(vol.write_pos(), 2);
    }
}
