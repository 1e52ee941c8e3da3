//! Memoized look-up tables for sample value transformations.
//!
//! Building a modality or VOI LUT is linear in `2^bits_stored`,
//! so tables are cached by their construction parameters.
//! The cache is a bounded LRU shared across transcode invocations;
//! correctness does not depend on the eviction policy.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use num_traits::NumCast;

/// The number of LUTs kept by a [`LutCache`] before eviction.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// The parameters which fully determine a modality/VOI LUT.
///
/// Floating point inputs are keyed by their bit patterns
/// so that the whole key is hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LutParameters {
    slope_bits: u64,
    intercept_bits: u64,
    pub pixel_padding: Option<i32>,
    pub bits_stored: u16,
    pub signed: bool,
    pub output_signed: bool,
    pub output_bits: u16,
    pub inverse: bool,
}

impl LutParameters {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slope: f64,
        intercept: f64,
        pixel_padding: Option<i32>,
        bits_stored: u16,
        signed: bool,
        output_signed: bool,
        output_bits: u16,
        inverse: bool,
    ) -> LutParameters {
        LutParameters {
            slope_bits: slope.to_bits(),
            intercept_bits: intercept.to_bits(),
            pixel_padding,
            bits_stored,
            signed,
            output_signed,
            output_bits,
            inverse,
        }
    }

    pub fn slope(&self) -> f64 {
        f64::from_bits(self.slope_bits)
    }

    pub fn intercept(&self) -> f64 {
        f64::from_bits(self.intercept_bits)
    }
}

/// A look up table for pixel data sample value transformations.
#[derive(Debug)]
pub struct Lut {
    /// maps an input sample value to a transformed value,
    /// of size 2 to the power of `bits_stored`
    table: Vec<i32>,
    /// whether the input sample values are signed
    signed: bool,
}

impl Lut {
    /// Create a new LUT with the given characteristics
    /// and populate it with the outputs of the provided function.
    ///
    /// - `bits_stored`:
    ///   the number of bits effectively used to represent the sample values
    /// - `signed`:
    ///   whether the input sample values are expected to be signed
    /// - `f`: the mapping function
    pub fn new_with_fn(bits_stored: u16, signed: bool, f: impl Fn(f64) -> f64) -> Lut {
        let size = 1_usize << bits_stored as u32;
        debug_assert!(size.is_power_of_two());

        let table = (0..size)
            .map(|i| {
                // account for signedness to determine the input pixel value
                let x = if signed && i >= size / 2 {
                    i as f64 - size as f64
                } else {
                    i as f64
                };
                let v = f(x);
                <i32 as NumCast>::from(v).unwrap_or(0)
            })
            .collect();
        Lut { table, signed }
    }

    /// Build the modality LUT described by the given parameters:
    /// the linear rescale, optionally inverted
    /// and clamped to the output sample range.
    pub fn new_modality(params: &LutParameters) -> Lut {
        let slope = params.slope();
        let intercept = params.intercept();
        let max_out = ((1_i64 << params.output_bits) - 1) as f64;
        let (lo, hi) = if params.output_signed {
            (-(max_out + 1.0) / 2.0, (max_out - 1.0) / 2.0)
        } else {
            (0.0, max_out)
        };
        let inverse = params.inverse;
        Lut::new_with_fn(params.bits_stored, params.signed, move |v| {
            let y = slope * v + intercept;
            let y = if inverse { max_out - y } else { y };
            y.clamp(lo, hi)
        })
    }

    /// Apply the transformation to a single sample value.
    ///
    /// Signed sample values are accepted
    /// with their bits reinterpreted as unsigned.
    pub fn get(&self, sample_value: u32) -> i32 {
        let index = if self.signed {
            // mask out the extra sign bits
            sample_value as usize & (self.table.len() - 1)
        } else {
            sample_value as usize
        };
        self.table[index.min(self.table.len() - 1)]
    }

    /// The number of entries in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// A bounded cache of modality LUTs keyed by their parameters.
///
/// Entries are shared handles;
/// the least recently used entry is evicted at capacity.
pub struct LutCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

struct CacheInner {
    map: HashMap<LutParameters, Arc<Lut>>,
    order: VecDeque<LutParameters>,
}

impl Default for LutCache {
    fn default() -> Self {
        LutCache::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl LutCache {
    pub fn new() -> LutCache {
        LutCache::default()
    }

    pub fn with_capacity(capacity: usize) -> LutCache {
        LutCache {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Fetch the modality LUT for the given parameters,
    /// building and caching it on the first request.
    ///
    /// Equal parameters return the same handle.
    pub fn get_modality_lut(&self, params: &LutParameters) -> Arc<Lut> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lut) = inner.map.get(params) {
            let lut = Arc::clone(lut);
            // refresh recency
            if let Some(position) = inner.order.iter().position(|k| k == params) {
                inner.order.remove(position);
            }
            inner.order.push_back(*params);
            return lut;
        }

        let lut = Arc::new(Lut::new_modality(params));
        inner.map.insert(*params, Arc::clone(&lut));
        inner.order.push_back(*params);
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
            }
        }
        lut
    }

    /// The number of cached tables.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modality_lut_applies_rescale() {
        let params = LutParameters::new(2.0, -1024.0, None, 10, true, true, 16, false);
        let lut = Lut::new_modality(&params);
        assert_eq!(lut.len(), 1024);

        assert_eq!(lut.get(0), -1024);
        assert_eq!(lut.get(1), -1022);
        // negative input, represented in two's complement
        assert_eq!(lut.get(-1_i16 as u16 as u32), -1026);
        assert_eq!(lut.get(500), -24);
    }

    #[test]
    fn equal_parameters_share_a_handle() {
        let cache = LutCache::new();
        let params = LutParameters::new(1.0, 0.0, None, 12, false, false, 12, false);
        let first = cache.get_modality_lut(&params);
        let second = cache.get_modality_lut(&params);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = LutCache::with_capacity(2);
        let a = LutParameters::new(1.0, 0.0, None, 8, false, false, 8, false);
        let b = LutParameters::new(2.0, 0.0, None, 8, false, false, 8, false);
        let c = LutParameters::new(3.0, 0.0, None, 8, false, false, 8, false);

        let first_a = cache.get_modality_lut(&a);
        let _ = cache.get_modality_lut(&b);
        // touch a, then insert c: b is the one to go
        let second_a = cache.get_modality_lut(&a);
        assert!(Arc::ptr_eq(&first_a, &second_a));
        let _ = cache.get_modality_lut(&c);

        assert_eq!(cache.len(), 2);
        let third_a = cache.get_modality_lut(&a);
        assert!(Arc::ptr_eq(&first_a, &third_a));
        // b was evicted and is rebuilt as a fresh handle
        let second_b = cache.get_modality_lut(&b);
        assert!(!Arc::ptr_eq(&first_a, &second_b));
    }

    #[test]
    fn inverse_flag_flips_output() {
        let straight = LutParameters::new(1.0, 0.0, None, 8, false, false, 8, false);
        let inverse = LutParameters::new(1.0, 0.0, None, 8, false, false, 8, true);
        let lut = Lut::new_modality(&straight);
        let inv = Lut::new_modality(&inverse);
        assert_eq!(lut.get(0), 0);
        assert_eq!(inv.get(0), 255);
        assert_eq!(lut.get(255), 255);
        assert_eq!(inv.get(255), 0);
    }
}
