//! FCM/DFCM predictor XOR value stripe (spec.md §4.3.2).

use crate::codec::predictor::{leading_and_significant, Predictor, Predictors};
use crate::error::{Error, Result};

/// Upper bound on the number of bytes `encode_chunk` can produce for
/// `count` values: one descriptor byte plus up to 8 raw payload bytes
/// each.
pub fn worst_case_chunk_len(count: usize) -> usize {
    count * 9
}

fn descriptor(selector: Predictor, lz: u32, sig: u32) -> u8 {
    let sel_bit = match selector {
        Predictor::Fcm => 0u8,
        Predictor::Dfcm => 1u8,
    };
    (sel_bit << 7) | ((lz as u8) << 4) | (sig as u8)
}

/// Encodes one chunk of float values, threading predictor state across
/// calls (predictor state spans the whole block, not just one chunk).
pub fn encode_chunk(values: &[f64], predictors: &mut Predictors, out: &mut Vec<u8>) {
    for &v in values {
        let bits = v.to_bits();
        let (selector, xor) = predictors.select(bits);
        let (lz, sig) = leading_and_significant(xor);
        out.push(descriptor(selector, lz, sig));
        if sig > 0 {
            let be = xor.to_be_bytes();
            out.extend_from_slice(&be[lz as usize..(lz + sig) as usize]);
        }
        predictors.update(bits);
    }
}

/// Decodes `count` float values starting at `*pos`.
pub fn decode_chunk(
    buf: &[u8],
    pos: &mut usize,
    count: usize,
    predictors: &mut Predictors,
) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let d = *buf
            .get(*pos)
            .ok_or_else(|| Error::BadBlock("truncated value descriptor".into()))?;
        *pos += 1;

        let selector = if d & 0x80 != 0 {
            Predictor::Dfcm
        } else {
            Predictor::Fcm
        };
        let lz = ((d >> 4) & 0b111) as u32;
        let sig = (d & 0b1111) as u32;

        let xor = if sig == 0 {
            0u64
        } else {
            if *pos + sig as usize > buf.len() {
                return Err(Error::BadBlock("truncated value payload".into()));
            }
            let mut be = [0u8; 8];
            be[lz as usize..(lz + sig) as usize].copy_from_slice(&buf[*pos..*pos + sig as usize]);
            *pos += sig as usize;
            u64::from_be_bytes(be)
        };

        let pred = predictors.predict(selector);
        let bits = pred ^ xor;
        predictors.update(bits);
        out.push(f64::from_bits(bits));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(values: &[f64]) {
        let mut enc_predictors = Predictors::new();
        let mut buf = Vec::new();
        encode_chunk(values, &mut enc_predictors, &mut buf);

        let mut dec_predictors = Predictors::new();
        let mut pos = 0;
        let decoded = decode_chunk(&buf, &mut pos, values.len(), &mut dec_predictors).unwrap();
        assert_eq!(pos, buf.len());
        for (a, b) in values.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn constant_series_compresses_to_near_nothing() {
        let values = vec![3.14f64; 100];
        let mut predictors = Predictors::new();
        let mut buf = Vec::new();
        encode_chunk(&values, &mut predictors, &mut buf);
        // After the first couple of samples the FCM table has learned the
        // exact value, so descriptors should dominate (1 byte/sample) with
        // almost no payload.
        assert!(buf.len() < values.len() * 2);
        roundtrip(&values);
    }

    #[test]
    fn nan_bit_patterns_round_trip_exactly() {
        roundtrip(&[f64::NAN, -f64::NAN, 0.0, -0.0, f64::INFINITY, f64::NEG_INFINITY]);
    }

    #[test]
    fn random_walk_round_trips() {
        let mut v = 0.0f64;
        let mut values = Vec::new();
        let mut seed = 12345u64;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            let step = ((seed >> 32) as i32 as f64) / (i32::MAX as f64);
            v += step * 0.01;
            values.push(v);
        }
        roundtrip(&values);
    }
}
