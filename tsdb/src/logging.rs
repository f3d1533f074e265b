//! Logging as an injected capability.
//!
//! The original source keeps a process-wide logger callback. Per the
//! storage core's design, components instead take a `Arc<dyn Sink>` at
//! construction and never reach for a global.

use log::Level;

pub trait Sink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Forwards to the `log` crate's global facade. This is the default used
/// when a caller doesn't care to inject anything more specific (e.g. a
/// per-test capture sink).
pub struct StdSink;

impl Sink for StdSink {
    fn log(&self, level: Level, message: &str) {
        log::log!(level, "{}", message);
    }
}

macro_rules! log_at {
    ($sink:expr, $level:expr, $($arg:tt)*) => {
        $sink.log($level, &format!($($arg)*))
    };
}

pub(crate) use log_at;
