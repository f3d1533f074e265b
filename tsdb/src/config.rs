use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed size of every on-disk block. Not runtime-configurable (spec.md
/// §6); kept as a named constant rather than a literal scattered across
/// the codec/volume/block-store modules.
pub const BLOCK_SIZE: usize = 4096;

/// Controls how eagerly `MetaVolume` writes are flushed after a block
/// append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Flush the MetaVolume after every block append.
    MaxSafety,
    /// Flush once every 4096 appends.
    Balanced,
    /// Only flush when the caller explicitly calls `flush()`.
    MaxThroughput,
}

impl Durability {
    /// Number of appends allowed to accumulate before an automatic flush
    /// is forced. `MaxThroughput` returns `None` (never forced).
    pub fn batch_size(self) -> Option<u64> {
        match self {
            Durability::MaxSafety => Some(1),
            Durability::Balanced => Some(4096),
            Durability::MaxThroughput => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Width of the late-write acceptance window, in nanoseconds.
    pub window_size: u64,

    /// Samples accumulated per writer before a checkpoint is forced.
    pub checkpoint_size: usize,

    /// Number of blocks a single volume file can hold.
    pub volume_capacity: u32,

    /// Backing files for the block store's volumes, in round-robin order.
    pub volumes: Vec<PathBuf>,

    /// Path to the MetaVolume file.
    pub meta_path: PathBuf,

    pub durability: Durability,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::BadInput("window_size must be > 0".into()));
        }
        if self.checkpoint_size == 0 {
            return Err(Error::BadInput("checkpoint_size must be > 0".into()));
        }
        if self.volumes.is_empty() {
            return Err(Error::BadInput("at least one volume is required".into()));
        }
        if self.volume_capacity == 0 {
            return Err(Error::BadInput("volume_capacity must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            window_size: 10_000_000_000, // 10 s
            checkpoint_size: 1024,
            volume_capacity: 1024,
            volumes: Vec::new(),
            meta_path: PathBuf::new(),
            durability: Durability::Balanced,
        }
    }
}
