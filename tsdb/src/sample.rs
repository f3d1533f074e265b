use std::cmp::Ordering;

/// One (series-id, timestamp, value) triple, or an opaque event payload.
///
/// `ts` is nanoseconds since epoch. Samples are immutable once constructed;
/// the sequencer and codec only ever move and copy them, never mutate one
/// in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: u64,
    pub ts: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Float(f64),
    /// Opaque byte string. Passes through the codec as a length-prefixed
    /// copy and never participates in float compression (spec.md §3).
    Event(Vec<u8>),
}

/// Compares `Float` by bit pattern rather than IEEE `==`, so two NaN
/// payloads decoded from the same bytes compare equal (spec.md §8's
/// round-trip-exactness property; plain float equality would make
/// `NaN != NaN` even when the bits are identical).
impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Payload::Float(a), Payload::Float(b)) => a.to_bits() == b.to_bits(),
            (Payload::Event(a), Payload::Event(b)) => a == b,
            _ => false,
        }
    }
}

impl Sample {
    pub fn float(id: u64, ts: u64, value: f64) -> Sample {
        Sample {
            id,
            ts,
            payload: Payload::Float(value),
        }
    }

    pub fn event(id: u64, ts: u64, data: Vec<u8>) -> Sample {
        Sample {
            id,
            ts,
            payload: Payload::Event(data),
        }
    }

    pub fn value(&self) -> Option<f64> {
        match &self.payload {
            Payload::Float(v) => Some(*v),
            Payload::Event(_) => None,
        }
    }

    /// Ordering key used everywhere a "sorted run" is built: (ts, id)
    /// ascending (spec.md §3).
    fn sort_key(&self) -> (u64, u64) {
        (self.ts, self.id)
    }
}

impl Eq for Sample {}

impl PartialOrd for Sample {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Sample {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// An ordered sequence of samples, sorted by (ts, id) ascending. Produced
/// by the sequencer, consumed by the codec.
pub type SortedRun = Vec<Sample>;

/// Scan direction requested by the consumer interface (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}
