//! Key encoding for the key-value engine.
//!
//! Every key starts with a short ASCII family tag followed by a `.`
//! delimiter, then fixed-width big-endian numeric fields with the sign bit
//! flipped (offset binary).  Lexicographic byte order therefore equals
//! numeric order, including for negative identifiers, which is what makes
//! prefix range scans return correctly ordered results.  Any change to
//! this layout invalidates existing databases.

const SIGN: u64 = 1 << 63;
const SIGN32: u32 = 1 << 31;

/// Start a key with its family tag.
pub fn tag(family: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(family.len() + 1 + 24);
    buf.extend_from_slice(family.as_bytes());
    buf.push(b'.');
    buf
}

pub fn push_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&((v as u64) ^ SIGN).to_be_bytes());
}

pub fn push_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&((v as u32) ^ SIGN32).to_be_bytes());
}

pub fn push_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn push_str(buf: &mut Vec<u8>, v: &str) {
    buf.extend_from_slice(v.as_bytes());
}

/// Encode an `f64` so that unsigned byte comparison orders values
/// numerically.  Used by rate-ordered secondary indexes.
pub fn f64_sortable(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let bits = if bits & SIGN != 0 { !bits } else { bits | SIGN };
    bits.to_be_bytes()
}

pub fn f64_from_sortable(b: &[u8]) -> Option<f64> {
    let arr: [u8; 8] = b.try_into().ok()?;
    let bits = u64::from_be_bytes(arr);
    let bits = if bits & SIGN != 0 { bits & !SIGN } else { !bits };
    Some(f64::from_bits(bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i64_key(v: i64) -> Vec<u8> {
        let mut b = Vec::new();
        push_i64(&mut b, v);
        b
    }

    #[test]
    fn i64_keys_sort_numerically() {
        let values = [i64::MIN, -500, -1, 0, 1, 42, i64::MAX];
        for w in values.windows(2) {
            assert!(
                i64_key(w[0]) < i64_key(w[1]),
                "{} should sort before {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn i32_keys_sort_numerically() {
        let enc = |v: i32| {
            let mut b = Vec::new();
            push_i32(&mut b, v);
            b
        };
        assert!(enc(-3) < enc(0));
        assert!(enc(0) < enc(7));
        assert!(enc(i32::MIN) < enc(i32::MAX));
    }

    #[test]
    fn f64_sortable_orders_and_round_trips() {
        let values = [-1000.5, -1.0, -0.25, 0.0, 0.5, 3.25, 1e9];
        for w in values.windows(2) {
            assert!(f64_sortable(w[0]) < f64_sortable(w[1]));
        }
        for v in values {
            assert_eq!(f64_from_sortable(&f64_sortable(v)), Some(v));
        }
    }

    #[test]
    fn tagged_keys_share_their_family_prefix() {
        let mut a = tag("MSG");
        push_i64(&mut a, 1);
        let b = tag("MSG");
        assert!(a.starts_with(&b));
    }
}
