//! A single fixed 4096-byte block: header, timestamp stripe, value stripe
//! (spec.md §3, §4.3, §6).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec::predictor::Predictors;
use crate::codec::timestamp;
use crate::codec::value;
use crate::codec::vbyte::{read_uvarint, write_uvarint};
use crate::config::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::sample::{Payload, Sample};

const HEADER_SIZE: usize = 16;
const CHUNK_LEN: usize = 16;
const MAGIC: u16 = 0x414B; // "AK"

const VERSION_FLOAT: u16 = 1;
const VERSION_EVENT: u16 = 2;

struct Header {
    series_id: u64,
    count: u16,
    version: u16,
    ts_bytes: u16,
}

impl Header {
    fn write(&self, out: &mut [u8]) {
        let mut w = &mut out[..HEADER_SIZE];
        w.write_u64::<LittleEndian>(self.series_id).unwrap();
        w.write_u16::<LittleEndian>(self.count).unwrap();
        w.write_u16::<LittleEndian>(self.version).unwrap();
        w.write_u16::<LittleEndian>(self.ts_bytes).unwrap();
        w.write_u16::<LittleEndian>(MAGIC).unwrap();
    }

    fn read(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::BadBlock("block shorter than header".into()));
        }
        let mut r = &buf[..HEADER_SIZE];
        let series_id = r.read_u64::<LittleEndian>().unwrap();
        let count = r.read_u16::<LittleEndian>().unwrap();
        let version = r.read_u16::<LittleEndian>().unwrap();
        let ts_bytes = r.read_u16::<LittleEndian>().unwrap();
        let magic = r.read_u16::<LittleEndian>().unwrap();
        if magic != MAGIC {
            return Err(Error::BadBlock("bad magic".into()));
        }
        if version != VERSION_FLOAT && version != VERSION_EVENT {
            return Err(Error::BadBlock(format!("unknown version {}", version)));
        }
        Ok(Header {
            series_id,
            count,
            version,
            ts_bytes,
        })
    }
}

/// Builds up a single block's worth of samples for one series, in
/// nondecreasing ts order. All samples given to one writer must share the
/// same `Payload` variant (float vs. event) -- the block format is
/// homogeneous per spec.md §9's `ValueKind` design note.
///
/// Samples are buffered in batches of up to 16 (`CHUNK_LEN`) and only
/// folded into the committed byte buffers once a full batch is known to
/// fit (or at `commit()`, for the trailing partial batch). This is what
/// makes `Overflow` re-entrancy-safe: a rejected sample never touched
/// `ts_buf`/`value_buf`.
pub struct DataBlockWriter {
    series_id: Option<u64>,
    is_event: Option<bool>,
    committed_count: u16,
    base_ts: Option<u64>,
    ts_prev: u64,
    d_prev: i64,
    ts_buf: Vec<u8>,
    value_buf: Vec<u8>,
    predictors: Predictors,
    pending: Vec<Sample>,
}

impl DataBlockWriter {
    pub fn new() -> DataBlockWriter {
        DataBlockWriter {
            series_id: None,
            is_event: None,
            committed_count: 0,
            base_ts: None,
            ts_prev: 0,
            d_prev: 0,
            ts_buf: Vec::new(),
            value_buf: Vec::new(),
            predictors: Predictors::new(),
            pending: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.committed_count == 0 && self.pending.is_empty()
    }

    pub fn series_id(&self) -> Option<u64> {
        self.series_id
    }

    /// Whether a hypothetical batch of `pending_len` samples (the current
    /// pending set plus one more) would still fit in the block, assuming
    /// the worst-case (non-run) encoding of its timestamp and value
    /// chunks (spec.md §4.3: "Overflow ... next chunk's worst-case size
    /// exceeds remaining space").
    fn would_fit(&self, pending_len: usize) -> bool {
        let dd_count = if self.base_ts.is_none() {
            pending_len.saturating_sub(1)
        } else {
            pending_len
        };
        let base_ts_extra = if self.base_ts.is_none() && pending_len > 0 {
            8
        } else {
            0
        };
        let worst = base_ts_extra
            + timestamp::worst_case_chunk_len(dd_count)
            + value::worst_case_chunk_len(pending_len);
        let remaining = BLOCK_SIZE - HEADER_SIZE - self.ts_buf.len() - self.value_buf.len();
        worst <= remaining
    }

    /// Attempts to add one sample. Returns `Error::Overflow` (without
    /// mutating any committed state) if the block has no room left; a
    /// fresh writer should be started with this sample as its first input.
    pub fn add(&mut self, sample: &Sample) -> Result<()> {
        let is_event = matches!(sample.payload, Payload::Event(_));
        match self.is_event {
            None => self.is_event = Some(is_event),
            Some(prev) => {
                if prev != is_event {
                    return Err(Error::BadInput(
                        "a block cannot mix float and event samples".into(),
                    ));
                }
            }
        }
        match self.series_id {
            None => self.series_id = Some(sample.id),
            Some(id) => {
                if id != sample.id {
                    return Err(Error::BadInput("a block may only hold one series".into()));
                }
            }
        }

        if !self.would_fit(self.pending.len() + 1) {
            return Err(Error::Overflow);
        }

        self.pending.push(sample.clone());
        if self.pending.len() == CHUNK_LEN {
            self.commit_pending();
        }
        Ok(())
    }

    fn commit_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);

        let mut dd = Vec::with_capacity(pending.len());
        let mut start = 0;
        if self.base_ts.is_none() {
            let ts0 = pending[0].ts;
            self.ts_buf.extend_from_slice(&ts0.to_le_bytes());
            self.base_ts = Some(ts0);
            self.ts_prev = ts0;
            self.d_prev = 0;
            start = 1;
        }
        for s in &pending[start..] {
            let d = (s.ts - self.ts_prev) as i64;
            dd.push(d - self.d_prev);
            self.d_prev = d;
            self.ts_prev = s.ts;
        }
        timestamp::encode_chunk(&dd, &mut self.ts_buf);

        if self.is_event == Some(true) {
            for s in &pending {
                if let Payload::Event(bytes) = &s.payload {
                    write_uvarint(&mut self.value_buf, bytes.len() as u64);
                    self.value_buf.extend_from_slice(bytes);
                }
            }
        } else {
            let values: Vec<f64> = pending
                .iter()
                .map(|s| s.value().expect("float block"))
                .collect();
            value::encode_chunk(&values, &mut self.predictors, &mut self.value_buf);
        }

        self.committed_count += pending.len() as u16;
    }

    /// Finalizes the block, flushing any partial trailing batch. The
    /// result always fits in `BLOCK_SIZE` bytes (guaranteed by `add`'s
    /// admission check) and decodes back to exactly the samples that were
    /// successfully `add`ed.
    pub fn commit(mut self) -> Result<[u8; BLOCK_SIZE]> {
        self.commit_pending();

        let mut block = [0u8; BLOCK_SIZE];
        let header = Header {
            series_id: self.series_id.unwrap_or(0),
            count: self.committed_count,
            version: if self.is_event == Some(true) {
                VERSION_EVENT
            } else {
                VERSION_FLOAT
            },
            ts_bytes: self.ts_buf.len() as u16,
        };
        header.write(&mut block);

        if HEADER_SIZE + self.ts_buf.len() + self.value_buf.len() > BLOCK_SIZE {
            // Unreachable: `would_fit` is checked on every `add`.
            return Err(Error::Overflow);
        }
        let body = &mut block[HEADER_SIZE..];
        body[..self.ts_buf.len()].copy_from_slice(&self.ts_buf);
        body[self.ts_buf.len()..self.ts_buf.len() + self.value_buf.len()]
            .copy_from_slice(&self.value_buf);

        Ok(block)
    }
}

impl Default for DataBlockWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads back the samples committed into a block, batch by batch, in the
/// same forward order they were written (the same 16-sample batches the
/// writer committed). `next()` returns `Ok(None)` once `count` samples
/// have been returned -- the declared-length sentinel from spec.md §4.3.3,
/// not an error.
pub struct DataBlockReader<'a> {
    header: Header,
    ts_section: &'a [u8],
    value_section: &'a [u8],
    ts_pos: usize,
    value_pos: usize,
    ts_prev: u64,
    d_prev: i64,
    predictors: Predictors,
    decoded: usize,
    ts_batch: Vec<u64>,
    value_batch: Vec<Payload>,
    batch_index: usize,
}

impl<'a> DataBlockReader<'a> {
    pub fn new(block: &'a [u8; BLOCK_SIZE]) -> Result<DataBlockReader<'a>> {
        let header = Header::read(block)?;
        let body = &block[HEADER_SIZE..];
        let ts_bytes = header.ts_bytes as usize;
        if ts_bytes > body.len() {
            return Err(Error::BadBlock("ts_bytes overruns block".into()));
        }
        let (ts_section, value_section) = body.split_at(ts_bytes);

        let mut ts_prev = 0u64;
        let mut ts_pos = 0usize;
        if header.count > 0 {
            if ts_section.len() < 8 {
                return Err(Error::BadBlock("missing base timestamp".into()));
            }
            ts_prev = u64::from_le_bytes(ts_section[..8].try_into().unwrap());
            ts_pos = 8;
        }

        Ok(DataBlockReader {
            header,
            ts_section,
            value_section,
            ts_pos,
            value_pos: 0,
            ts_prev,
            d_prev: 0,
            predictors: Predictors::new(),
            decoded: 0,
            ts_batch: Vec::new(),
            value_batch: Vec::new(),
            batch_index: 0,
        })
    }

    pub fn series_id(&self) -> u64 {
        self.header.series_id
    }

    pub fn count(&self) -> u16 {
        self.header.count
    }

    pub fn is_event(&self) -> bool {
        self.header.version == VERSION_EVENT
    }

    fn decode_next_batch(&mut self) -> Result<()> {
        let remaining = self.header.count as usize - self.decoded;
        let batch_len = remaining.min(CHUNK_LEN);
        let is_first_batch = self.decoded == 0;
        let dd_count = if is_first_batch { batch_len - 1 } else { batch_len };

        let dd = timestamp::decode_chunk(self.ts_section, &mut self.ts_pos, dd_count)?;

        let mut ts_vals = Vec::with_capacity(batch_len);
        if is_first_batch {
            ts_vals.push(self.ts_prev);
        }
        for d_dd in dd {
            let d = self.d_prev + d_dd;
            let ts = (self.ts_prev as i64 + d) as u64;
            self.ts_prev = ts;
            self.d_prev = d;
            ts_vals.push(ts);
        }

        let payloads = if self.is_event() {
            let mut out = Vec::with_capacity(batch_len);
            for _ in 0..batch_len {
                let len = read_uvarint(self.value_section, &mut self.value_pos)
                    .ok_or_else(|| Error::BadBlock("truncated event length".into()))?
                    as usize;
                if self.value_pos + len > self.value_section.len() {
                    return Err(Error::BadBlock("truncated event payload".into()));
                }
                let bytes = self.value_section[self.value_pos..self.value_pos + len].to_vec();
                self.value_pos += len;
                out.push(Payload::Event(bytes));
            }
            out
        } else {
            value::decode_chunk(
                self.value_section,
                &mut self.value_pos,
                batch_len,
                &mut self.predictors,
            )?
            .into_iter()
            .map(Payload::Float)
            .collect()
        };

        self.ts_batch = ts_vals;
        self.value_batch = payloads;
        self.batch_index = 0;
        self.decoded += batch_len;
        Ok(())
    }

    /// Pulls the next `(ts, payload)` pair, or `None` once `count` samples
    /// have been returned.
    pub fn next(&mut self) -> Result<Option<(u64, Payload)>> {
        if self.batch_index >= self.ts_batch.len() {
            if self.decoded >= self.header.count as usize {
                return Ok(None);
            }
            self.decode_next_batch()?;
        }
        let ts = self.ts_batch[self.batch_index];
        let payload = self.value_batch[self.batch_index].clone();
        self.batch_index += 1;
        Ok(Some((ts, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_samples(id: u64, n: usize, value_fn: impl Fn(usize) -> f64) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::float(id, i as u64, value_fn(i)))
            .collect()
    }

    #[test]
    fn roundtrip_flat_series() {
        let samples = float_samples(7, 1000, |_| 3.14);
        let mut w = DataBlockWriter::new();
        for s in &samples {
            w.add(s).unwrap();
        }
        let block = w.commit().unwrap();

        let mut r = DataBlockReader::new(&block).unwrap();
        assert_eq!(r.series_id(), 7);
        let mut i = 0;
        while let Some((ts, payload)) = r.next().unwrap() {
            assert_eq!(ts, samples[i].ts);
            assert_eq!(payload, samples[i].payload);
            i += 1;
        }
        assert_eq!(i, samples.len());
    }

    #[test]
    fn roundtrip_small_odd_count() {
        for n in [0usize, 1, 2, 15, 16, 17, 31, 32, 33] {
            let samples = float_samples(1, n, |i| i as f64 * 1.5);
            let mut w = DataBlockWriter::new();
            for s in &samples {
                w.add(s).unwrap();
            }
            let block = w.commit().unwrap();
            let mut r = DataBlockReader::new(&block).unwrap();
            assert_eq!(r.count() as usize, n);
            let mut i = 0;
            while let Some((ts, payload)) = r.next().unwrap() {
                assert_eq!(ts, samples[i].ts);
                assert_eq!(payload, samples[i].payload);
                i += 1;
            }
            assert_eq!(i, n);
            assert_eq!(r.next().unwrap(), None);
        }
    }

    #[test]
    fn overflow_then_fresh_writer_completes_the_stream() {
        // Encourage many distinct values (defeats run-length framing) so the
        // block fills up well before 1000 samples.
        let samples = float_samples(3, 2000, |i| (i as f64).sin() * 1e6 + i as f64);

        let mut w = DataBlockWriter::new();
        let mut k = 0;
        for (idx, s) in samples.iter().enumerate() {
            match w.add(s) {
                Ok(()) => k = idx + 1,
                Err(Error::Overflow) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert!(k < samples.len(), "expected the block to fill up");

        let block = w.commit().unwrap();
        let mut r = DataBlockReader::new(&block).unwrap();
        let mut i = 0;
        while let Some((ts, payload)) = r.next().unwrap() {
            assert_eq!(ts, samples[i].ts);
            assert_eq!(payload, samples[i].payload);
            i += 1;
        }
        assert_eq!(i, k);

        // A fresh writer picks up exactly where the first left off.
        let mut w2 = DataBlockWriter::new();
        for s in &samples[k..] {
            w2.add(s).unwrap();
        }
        let block2 = w2.commit().unwrap();
        let mut r2 = DataBlockReader::new(&block2).unwrap();
        let mut i2 = k;
        while let Some((ts, payload)) = r2.next().unwrap() {
            assert_eq!(ts, samples[i2].ts);
            assert_eq!(payload, samples[i2].payload);
            i2 += 1;
        }
        assert_eq!(i2, samples.len());
    }

    #[test]
    fn event_samples_round_trip_as_opaque_bytes() {
        let samples: Vec<Sample> = (0..50)
            .map(|i| Sample::event(9, i as u64, format!("payload-{}", i).into_bytes()))
            .collect();
        let mut w = DataBlockWriter::new();
        for s in &samples {
            w.add(s).unwrap();
        }
        let block = w.commit().unwrap();

        let mut r = DataBlockReader::new(&block).unwrap();
        assert!(r.is_event());
        let mut i = 0;
        while let Some((ts, payload)) = r.next().unwrap() {
            assert_eq!(ts, samples[i].ts);
            assert_eq!(payload, samples[i].payload);
            i += 1;
        }
        assert_eq!(i, samples.len());
    }

    #[test]
    fn mixed_payload_kinds_rejected() {
        let mut w = DataBlockWriter::new();
        w.add(&Sample::float(1, 0, 1.0)).unwrap();
        let err = w.add(&Sample::event(1, 1, vec![1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn mixed_series_rejected() {
        let mut w = DataBlockWriter::new();
        w.add(&Sample::float(1, 0, 1.0)).unwrap();
        let err = w.add(&Sample::float(2, 1, 1.0)).unwrap_err();
        assert!(matches!(err, Error::BadInput(_)));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut block = [0u8; BLOCK_SIZE];
        block[14] = 0xFF;
        block[15] = 0xFF;
        assert!(DataBlockReader::new(&block).is_err());
    }
}
