//! Order-sensitive field hashing for change detection
//!
//! Every codec computes a 64-bit content hash over exactly the fields it
//! serializes, in serialization order. Variable-length sequences fold each
//! element in order, so a reorder changes the hash. The combiner is
//! `h * 31 + v` with seed 17; deterministic across peers and runs.

/// Hash seed
pub const HASH_SEED: i64 = 17;

/// Combine two hash values, order-sensitively
#[inline]
pub fn combine(h: i64, v: i64) -> i64 {
    h.wrapping_mul(31).wrapping_add(v)
}

/// Round a float to a number of decimal places
///
/// Applied before both serialization and hashing so the payload and its
/// hash always agree.
#[inline]
pub fn round_places(v: f32, places: u8) -> f32 {
    let m = 10f32.powi(places as i32);
    (v * m).round() / m
}

/// Incremental order-sensitive field hasher
#[derive(Debug)]
pub struct FieldHasher {
    h: i64,
}

impl FieldHasher {
    pub fn new() -> Self {
        FieldHasher { h: HASH_SEED }
    }

    #[inline]
    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.h = combine(self.h, v);
        self
    }

    #[inline]
    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.write_i64(v as i64)
    }

    #[inline]
    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_i64(v as i64)
    }

    /// Hash a float by its bit pattern; callers round first if a decimal
    /// precision applies
    #[inline]
    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.write_i64(v.to_bits() as i64)
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        for b in s.bytes() {
            self.write_i64(b as i64);
        }
        self
    }

    pub fn write_f32_slice(&mut self, vs: &[f32]) -> &mut Self {
        for &v in vs {
            self.write_f32(v);
        }
        self
    }

    pub fn write_u32_slice(&mut self, vs: &[u32]) -> &mut Self {
        for &v in vs {
            self.write_u32(v);
        }
        self
    }

    #[inline]
    pub fn finish(&self) -> i64 {
        self.h
    }
}

impl Default for FieldHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hash_is_deterministic() {
        let mut a = FieldHasher::new();
        a.write_str("box").write_f32(1.5).write_bool(true);
        let mut b = FieldHasher::new();
        b.write_str("box").write_f32(1.5).write_bool(true);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_hash_is_order_sensitive() {
        let mut a = FieldHasher::new();
        a.write_f32_slice(&[1.0, 2.0, 3.0]);
        let mut b = FieldHasher::new();
        b.write_f32_slice(&[3.0, 2.0, 1.0]);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_round_places() {
        assert_eq!(round_places(1.234_567, 2), 1.23);
        assert_eq!(round_places(1.235, 2), 1.24);
        assert_eq!(round_places(-0.000_004, 5), -0.0);
    }

    proptest! {
        #[test]
        fn prop_identity_permutation_idempotent(vs in proptest::collection::vec(any::<f32>(), 0..32)) {
            let mut a = FieldHasher::new();
            a.write_f32_slice(&vs);
            let mut b = FieldHasher::new();
            b.write_f32_slice(&vs);
            prop_assert_eq!(a.finish(), b.finish());
        }

        #[test]
        fn prop_swap_changes_hash(vs in proptest::collection::vec(0u32..1000, 2..16)) {
            prop_assume!(vs[0] != vs[1]);
            let mut swapped = vs.clone();
            swapped.swap(0, 1);
            let mut a = FieldHasher::new();
            a.write_u32_slice(&vs);
            let mut b = FieldHasher::new();
            b.write_u32_slice(&swapped);
            prop_assert_ne!(a.finish(), b.finish());
        }
    }
}
