//! MetaVolume: the single source of truth for per-volume generation,
//! capacity, and block count (spec.md §3, §4.2, §6).
//!
//! Layout mirrors the original Akumuli `MetaVolume` concept (one 4096-byte
//! slot per volume) but packs the slot itself: `u32 version, u32 id, u32
//! nblocks, u32 capacity, u32 generation`, little-endian, rest zero.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::config::BLOCK_SIZE;
use crate::error::{Error, Result};

const SLOT_VERSION: u32 = 1;
const PACKED_LEN: usize = 20; // 5 * u32

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeSlot {
    pub id: u32,
    pub nblocks: u32,
    pub capacity: u32,
    pub generation: u32,
}

impl VolumeSlot {
    fn pack(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], SLOT_VERSION);
        LittleEndian::write_u32(&mut buf[4..8], self.id);
        LittleEndian::write_u32(&mut buf[8..12], self.nblocks);
        LittleEndian::write_u32(&mut buf[12..16], self.capacity);
        LittleEndian::write_u32(&mut buf[16..20], self.generation);
        buf
    }

    fn unpack(buf: &[u8; BLOCK_SIZE]) -> Result<VolumeSlot> {
        let version = LittleEndian::read_u32(&buf[0..4]);
        if version != SLOT_VERSION {
            return Err(Error::BadBlock(format!(
                "unrecognized MetaVolume slot version {}",
                version
            )));
        }
        Ok(VolumeSlot {
            id: LittleEndian::read_u32(&buf[4..8]),
            nblocks: LittleEndian::read_u32(&buf[8..12]),
            capacity: LittleEndian::read_u32(&buf[12..16]),
            generation: LittleEndian::read_u32(&buf[16..20]),
        })
    }
}

pub struct MetaVolume {
    file: File,
    slots: Vec<VolumeSlot>,
}

impl MetaVolume {
    /// Creates a fresh MetaVolume with `count` slots, one per volume,
    /// each starting at generation 0 / nblocks 0.
    pub fn create(path: &Path, capacities: &[u32]) -> Result<MetaVolume> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create_new(true);
        let mut file = opts.open(path)?;
        file.set_len(capacities.len() as u64 * BLOCK_SIZE as u64)?;

        let mut slots = Vec::with_capacity(capacities.len());
        for (i, &cap) in capacities.iter().enumerate() {
            let slot = VolumeSlot {
                id: i as u32,
                nblocks: 0,
                capacity: cap,
                generation: 0,
            };
            file.seek(SeekFrom::Start(i as u64 * BLOCK_SIZE as u64))?;
            file.write_all(&slot.pack())?;
            slots.push(slot);
        }
        file.sync_data()?;

        Ok(MetaVolume { file, slots })
    }

    /// Opens an existing MetaVolume, reading all slots into memory.
    pub fn open(path: &Path) -> Result<MetaVolume> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        let mut file = opts.open(path)?;

        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            return Err(Error::BadBlock("MetaVolume length not block-aligned".into()));
        }
        let count = (len / BLOCK_SIZE as u64) as usize;

        let mut slots = Vec::with_capacity(count);
        let mut buf = [0u8; BLOCK_SIZE];
        for i in 0..count {
            file.seek(SeekFrom::Start(i as u64 * BLOCK_SIZE as u64))?;
            file.read_exact(&mut buf)?;
            slots.push(VolumeSlot::unpack(&buf)?);
        }

        Ok(MetaVolume { file, slots })
    }

    pub fn slot(&self, index: usize) -> Result<VolumeSlot> {
        self.slots.get(index).copied().ok_or(Error::OutOfRange)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Overwrites slot `index` and writes it through to disk. Does not
    /// flush -- callers batch the flush per `Durability`.
    pub fn set_slot(&mut self, index: usize, slot: VolumeSlot) -> Result<()> {
        if index >= self.slots.len() {
            return Err(Error::OutOfRange);
        }
        self.file
            .seek(SeekFrom::Start(index as u64 * BLOCK_SIZE as u64))?;
        self.file.write_all(&slot.pack())?;
        self.slots[index] = slot;
        Ok(())
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
    fn create_and_reopen_round_trips_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        {
            let mut mv = MetaVolume::create(&path, &[16, 16, 32]).unwrap();
            let mut slot = mv.slot(1).unwrap();
            slot.nblocks = 5;
            slot.generation = 2;
            mv.set_slot(1, slot).unwrap();
            mv.flush().unwrap();
        }

        let mv = MetaVolume::open(&path).unwrap();
        assert_eq!(mv.len(), 3);
        assert_eq!(mv.slot(0).unwrap().capacity, 16);
        assert_eq!(mv.slot(2).unwrap().capacity, 32);
        let slot1 = mv.slot(1).unwrap();
        assert_eq!(slot1.nblocks, 5);
        assert_eq!(slot1.generation, 2);
    }

    #[test]
    fn out_of_range_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta");
        let mv = MetaVolume::create(&path, &[16]).unwrap();
        assert!(matches!(mv.slot(1), Err(Error::OutOfRange)));
    }
}
