//! Delta-of-delta timestamp stripe (spec.md §4.3.1).

use crate::codec::vbyte::{read_uvarint, uvarint_max_len, write_uvarint, zigzag_decode, zigzag_encode};
use crate::error::{Error, Result};

const TAG_RUN: u8 = 0;
const TAG_PACKED: u8 = 1;

/// Upper bound on the number of bytes `encode_chunk` can produce for
/// `dd_count` second-differences, used by the writer to decide whether a
/// chunk fits before committing to it.
pub fn worst_case_chunk_len(dd_count: usize) -> usize {
    if dd_count == 0 {
        return 0;
    }
    // Worst case: the "packed" framing with every value needing the full
    // variable-length zigzag encoding (class 3).
    1 + control_word_len(dd_count) + dd_count * uvarint_max_len(64)
}

fn control_word_len(dd_count: usize) -> usize {
    (dd_count * 2 + 7) / 8
}

fn width_class(zz: u64) -> u8 {
    if zz == 0 {
        0
    } else if zz <= 0xFF {
        1
    } else if zz <= 0xFFFF {
        2
    } else {
        3
    }
}

fn set_class(control: &mut [u8], index: usize, class: u8) {
    let byte_idx = index / 4;
    let shift = 6 - (index % 4) * 2;
    control[byte_idx] |= class << shift;
}

fn get_class(control: &[u8], index: usize) -> u8 {
    let byte_idx = index / 4;
    let shift = 6 - (index % 4) * 2;
    (control[byte_idx] >> shift) & 0b11
}

/// Encodes one chunk (<=16 entries) of second-differences.
pub fn encode_chunk(dd: &[i64], out: &mut Vec<u8>) {
    if dd.is_empty() {
        return;
    }

    let first = dd[0];
    if dd.iter().all(|&v| v == first) {
        out.push(TAG_RUN);
        write_uvarint(out, zigzag_encode(first));
        return;
    }

    out.push(TAG_PACKED);
    let mut control = vec![0u8; control_word_len(dd.len())];
    let mut payload = Vec::new();
    for (i, &d) in dd.iter().enumerate() {
        let zz = zigzag_encode(d);
        let class = width_class(zz);
        set_class(&mut control, i, class);
        match class {
            0 => {}
            1 => payload.push(zz as u8),
            2 => payload.extend_from_slice(&(zz as u16).to_le_bytes()),
            3 => {
                write_uvarint(&mut payload, zz);
            }
            _ => unreachable!(),
        }
    }
    out.extend_from_slice(&control);
    out.extend_from_slice(&payload);
}

/// Decodes one chunk of `dd_count` second-differences starting at `*pos`.
pub fn decode_chunk(buf: &[u8], pos: &mut usize, dd_count: usize) -> Result<Vec<i64>> {
    if dd_count == 0 {
        return Ok(Vec::new());
    }

    let tag = *buf
        .get(*pos)
        .ok_or_else(|| Error::BadBlock("truncated timestamp chunk tag".into()))?;
    *pos += 1;

    match tag {
        TAG_RUN => {
            let zz = read_uvarint(buf, pos)
                .ok_or_else(|| Error::BadBlock("truncated run value".into()))?;
            Ok(vec![zigzag_decode(zz); dd_count])
        }
        TAG_PACKED => {
            let control_len = control_word_len(dd_count);
            if *pos + control_len > buf.len() {
                return Err(Error::BadBlock("truncated control word".into()));
            }
            let control = &buf[*pos..*pos + control_len];
            *pos += control_len;

            let mut out = Vec::with_capacity(dd_count);
            for i in 0..dd_count {
                let class = get_class(control, i);
                let zz = match class {
                    0 => 0,
                    1 => {
                        let b = *buf
                            .get(*pos)
                            .ok_or_else(|| Error::BadBlock("truncated 1-byte value".into()))?;
                        *pos += 1;
                        b as u64
                    }
                    2 => {
                        if *pos + 2 > buf.len() {
                            return Err(Error::BadBlock("truncated 2-byte value".into()));
                        }
                        let v = u16::from_le_bytes([buf[*pos], buf[*pos + 1]]);
                        *pos += 2;
                        v as u64
                    }
                    3 => read_uvarint(buf, pos)
                        .ok_or_else(|| Error::BadBlock("truncated varint value".into()))?,
                    _ => unreachable!(),
                };
                out.push(zigzag_decode(zz));
            }
            Ok(out)
        }
        _ => Err(Error::BadBlock(format!("bad chunk tag {}", tag))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(dd: &[i64]) {
        let mut buf = Vec::new();
        encode_chunk(dd, &mut buf);
        let mut pos = 0;
        let decoded = decode_chunk(&buf, &mut pos, dd.len()).unwrap();
        assert_eq!(decoded, dd);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn empty_chunk() {
        roundtrip(&[]);
    }

    #[test]
    fn run_of_zeros() {
        roundtrip(&[0; 16]);
    }

    #[test]
    fn run_of_constant_nonzero() {
        roundtrip(&[7; 16]);
    }

    #[test]
    fn mixed_small_values() {
        roundtrip(&[0, 1, -1, 2, -2, 100, -100, 0, 0, 5, -5, 0, 3, -3, 1, -1]);
    }

    #[test]
    fn mixed_with_large_jump() {
        roundtrip(&[0, 1, 1_000_000_000, -1_000_000_000, 0, i64::MAX / 2]);
    }

    #[test]
    fn partial_tail_chunk() {
        roundtrip(&[1, 2, 3]);
    }

    #[test]
    fn worst_case_bound_is_never_exceeded() {
        let dd = vec![i64::MAX; 16];
        let mut buf = Vec::new();
        encode_chunk(&dd, &mut buf);
        assert!(buf.len() <= worst_case_chunk_len(16));
    }
}
