use std::io;

use failure_derive::Fail;

/// Taxonomy of everything that can go wrong in the storage core.
///
/// `Overflow` is always handled internally by the caller that receives it
/// (the sequencer starts a new block); every other variant is meant to
/// cross the crate boundary. Invariant violations (I1-I6 in the design
/// docs) are never represented here — those panic.
#[derive(Debug, Fail)]
pub enum Error {
    /// Malformed sample or out-of-range configuration value.
    #[fail(display = "bad input: {}", _0)]
    BadInput(String),

    /// Sample older than the currently active late-write window.
    #[fail(display = "late write rejected")]
    LateWrite,

    /// The writer ran out of room in the current block; caller should
    /// commit it and retry against a fresh one.
    #[fail(display = "block overflow")]
    Overflow,

    /// A `LogicAddr` pointed at a volume slot whose generation has moved
    /// on; the data that used to live there is gone.
    #[fail(display = "stale address")]
    Stale,

    /// An index (volume id, block index, ...) fell outside its valid range.
    #[fail(display = "out of range")]
    OutOfRange,

    /// A block's header or stripe lengths were internally inconsistent.
    #[fail(display = "corrupt block: {}", _0)]
    BadBlock(String),

    /// Underlying file I/O failed; fatal for the affected volume.
    #[fail(display = "io error: {}", _0)]
    Io(#[fail(cause)] io::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
