//! Storage core of a time-series database: late-write reordering, a
//! block-level compression codec, and a fixed-size block store.
//!
//! Layering (bottom to top): [`volume`] -> [`block_store`] -> [`codec`] ->
//! [`sequencer`] -> [`Engine`], the top-level type ingest and query layers
//! talk to.

pub mod block_store;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod meta_volume;
pub mod sample;
pub mod sequencer;
pub mod volume;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::Level;

use block_store::{BlockStore, LogicAddr};
use codec::{DataBlockReader, DataBlockWriter};
use config::{Config, BLOCK_SIZE};
use error::{Error, Result};
use logging::{log_at, Sink, StdSink};
use sample::{Direction, Payload, Sample};
use sequencer::{AddOutcome, Sequencer, WriterId};

/// Per-series commit state: the writer currently accumulating samples,
/// and the logical addresses of everything already committed, in
/// block-index order (I3: concatenation of committed blocks is
/// nondecreasing in ts).
#[derive(Default)]
struct SeriesState {
    writer: DataBlockWriter,
    committed: Vec<LogicAddr>,
}

/// Ties the sequencer, codec, and block store together behind the
/// producer/consumer interfaces from spec.md §6.
pub struct Engine {
    sequencer: Sequencer,
    store: Mutex<BlockStore>,
    series: Mutex<HashMap<u64, SeriesState>>,
    sink: Arc<dyn Sink>,
}

impl Engine {
    /// Creates a brand-new engine: fresh MetaVolume and volume files per
    /// `config`, an empty sequencer sized for `n_writers` concurrent
    /// writer threads.
    pub fn create(config: &Config, n_writers: usize) -> Result<Engine> {
        config.validate()?;
        let sink: Arc<dyn Sink> = Arc::new(StdSink);
        let store = BlockStore::create(config, sink.clone())?;
        Ok(Engine {
            sequencer: Sequencer::new(config.window_size, config.checkpoint_size, n_writers),
            store: Mutex::new(store),
            series: Mutex::new(HashMap::new()),
            sink,
        })
    }

    /// Reopens an engine from existing volume/MetaVolume files (spec.md
    /// §8 scenario 6, crash recovery). In-memory sequencer state does not
    /// survive a crash -- only committed blocks do, by design (I6).
    pub fn open(config: &Config, n_writers: usize) -> Result<Engine> {
        config.validate()?;
        let sink: Arc<dyn Sink> = Arc::new(StdSink);
        let store = BlockStore::open(config, sink.clone())?;
        Ok(Engine {
            sequencer: Sequencer::new(config.window_size, config.checkpoint_size, n_writers),
            store: Mutex::new(store),
            series: Mutex::new(HashMap::new()),
            sink,
        })
    }

    /// Registers a new writer thread identity. Call once per thread
    /// before its first `write_sample`.
    pub fn register_writer(&self) -> Result<WriterId> {
        self.sequencer.register_writer()
    }

    /// Producer interface (spec.md §6): `write_sample(id, ts, value)`.
    /// `Overflow` is never returned -- the codec's per-series writer
    /// rotation it signals is handled internally (spec.md §7's
    /// propagation policy: "Overflow is always handled locally").
    pub fn write_sample(&self, writer: WriterId, id: u64, ts: u64, value: f64) -> Result<()> {
        self.ingest(writer, Sample::float(id, ts, value))
    }

    /// Same as `write_sample` but for an opaque event payload.
    pub fn write_event(&self, writer: WriterId, id: u64, ts: u64, data: Vec<u8>) -> Result<()> {
        self.ingest(writer, Sample::event(id, ts, data))
    }

    fn ingest(&self, writer: WriterId, sample: Sample) -> Result<()> {
        let outcome = self.sequencer.add(writer, sample)?;
        if outcome == AddOutcome::Rotated {
            if let Some(lock) = self.sequencer.merge_lock_if_pending() {
                let merged = self.sequencer.merge(lock);
                self.commit_merged(merged)?;
            }
        }
        Ok(())
    }

    /// Groups a freshly merged run by series and folds each group's
    /// samples into that series' current block writer, committing and
    /// appending to the block store whenever a writer overflows.
    fn commit_merged(&self, merged: Vec<Sample>) -> Result<()> {
        let mut by_series: HashMap<u64, Vec<Sample>> = HashMap::new();
        for s in merged {
            by_series.entry(s.id).or_default().push(s);
        }

        let mut series_map = self.series.lock().unwrap();
        let mut store = self.store.lock().unwrap();

        for (id, samples) in by_series {
            let state = series_map.entry(id).or_default();
            for sample in &samples {
                Self::add_to_series(state, &mut store, sample, &self.sink)?;
            }
        }
        Ok(())
    }

    fn add_to_series(
        state: &mut SeriesState,
        store: &mut BlockStore,
        sample: &Sample,
        sink: &Arc<dyn Sink>,
    ) -> Result<()> {
        match state.writer.add(sample) {
            Ok(()) => Ok(()),
            Err(Error::Overflow) => {
                let full = std::mem::take(&mut state.writer);
                let block = full.commit()?;
                let addr = store.append(&block)?;
                state.committed.push(addr);
                log_at!(sink, Level::Debug, "committed block for series {}", sample.id);
                state.writer.add(sample)
            }
            Err(e) => Err(e),
        }
    }

    /// Forces a final sequencer rotation/merge and flushes every series'
    /// partial writer, regardless of fill level (spec.md §4.4 `close`).
    /// Idempotent: a second call with nothing pending is a no-op.
    pub fn close(&self) -> Result<()> {
        if let Some(merged) = self.sequencer.close() {
            self.commit_merged(merged)?;
        }

        let mut series_map = self.series.lock().unwrap();
        let mut store = self.store.lock().unwrap();
        for state in series_map.values_mut() {
            if !state.writer.is_empty() {
                let full = std::mem::take(&mut state.writer);
                let block = full.commit()?;
                let addr = store.append(&block)?;
                state.committed.push(addr);
            }
        }
        store.flush()
    }

    /// Consumer interface (spec.md §6): a finite, non-restartable scan
    /// over `[ts_from, ts_to]` for one series, merging in-window
    /// (un-flushed) data from the sequencer with already-committed
    /// blocks from the store.
    pub fn scan(
        &self,
        id: u64,
        ts_from: u64,
        ts_to: u64,
        direction: Direction,
    ) -> Result<ScanIter> {
        let mut out: Vec<(u64, Payload)> = Vec::new();

        {
            let series_map = self.series.lock().unwrap();
            if let Some(state) = series_map.get(&id) {
                let mut store = self.store.lock().unwrap();
                for &addr in &state.committed {
                    let mut buf = [0u8; BLOCK_SIZE];
                    match store.read(addr, &mut buf) {
                        Ok(()) => {
                            let mut reader = DataBlockReader::new(&buf)?;
                            while let Some((ts, payload)) = reader.next()? {
                                if ts >= ts_from && ts <= ts_to {
                                    out.push((ts, payload));
                                }
                            }
                        }
                        Err(Error::Stale) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        for sample in self.sequencer.search(id, ts_from, ts_to) {
            out.push((sample.ts, sample.payload));
        }

        out.sort_by_key(|(ts, _)| *ts);
        if direction == Direction::Backward {
            out.reverse();
        }

        Ok(ScanIter {
            samples: out.into_iter(),
        })
    }
}

/// Explicit finite iterator over a scan's result (spec.md §9's "replace
/// coroutines with an explicit iterator" design note). The bounded
/// result set (at most a handful of 4 KiB blocks plus the active window)
/// is assembled once in `Engine::scan`; this type just walks it.
pub struct ScanIter {
    samples: std::vec::IntoIter<(u64, Payload)>,
}

impl Iterator for ScanIter {
    type Item = (u64, Payload);

    fn next(&mut self) -> Option<Self::Item> {
        self.samples.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            volumes: vec![dir.join("vol0"), dir.join("vol1")],
            meta_path: dir.join("meta"),
            volume_capacity: 8,
            window_size: 10_000,
            checkpoint_size: 16,
            ..Config::default()
        }
    }

    #[test]
    fn write_then_scan_round_trips() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(&config(dir.path()), 1).unwrap();
        let w = engine.register_writer().unwrap();

        for ts in 0..20u64 {
            engine.write_sample(w, 1, ts, ts as f64).unwrap();
        }
        engine.close().unwrap();

        let got: Vec<(u64, Payload)> = engine.scan(1, 0, 19, Direction::Forward).unwrap().collect();
        assert_eq!(got.len(), 20);
        for (i, (ts, payload)) in got.iter().enumerate() {
            assert_eq!(*ts, i as u64);
            assert_eq!(*payload, Payload::Float(i as f64));
        }
    }

    #[test]
    fn backward_scan_reverses_order() {
        let dir = tempdir().unwrap();
        let engine = Engine::create(&config(dir.path()), 1).unwrap();
        let w = engine.register_writer().unwrap();
        for ts in 0..5u64 {
            engine.write_sample(w, 2, ts, ts as f64).unwrap();
        }
        engine.close().unwrap();

        let got: Vec<u64> = engine
            .scan(2, 0, 4, Direction::Backward)
            .unwrap()
            .map(|(ts, _)| ts)
            .collect();
        assert_eq!(got, vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn late_write_surfaces_to_caller() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.window_size = 100;
        let engine = Engine::create(&cfg, 1).unwrap();
        let w = engine.register_writer().unwrap();

        engine.write_sample(w, 1, 10_000, 1.0).unwrap();
        let err = engine.write_sample(w, 1, 9_800, 1.0).unwrap_err();
        assert!(matches!(err, Error::LateWrite));
    }
}
