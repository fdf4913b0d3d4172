//! Type-specialised index sorting.
//!
//! `asc`/`desc` return a permutation vector `p` with `v[p[i]]` ordered and
//! equal keys preserving input position. The dispatcher picks the algorithm
//! from the element type, the vector length, the observed scope
//! (min, max, null count) and the pool width:
//!
//! | element        | small            | medium           | large               |
//! |----------------|------------------|------------------|---------------------|
//! | u8/b8/c8       | 1-pass counting  | same             | parallel counting   |
//! | i16            | 2-pass radix-8   | 65 536 counting  | parallel counting   |
//! | i32/date/time  | radix-8/counting | 2-pass radix-16  | parallel counting/radix |
//! | i64/timestamp  | radix-8/counting | 4-pass radix-16  | parallel counting/radix |
//! | f64            | 4-pass radix-16  | same             | parallel radix-16   |
//! | symbol         | merge by interned string                                  |
//! | list           | merge by element comparator                               |
//!
//! Sorting runs over bias-transformed unsigned keys, which puts nulls ahead
//! of every non-null value ascending and after them descending. Vectors
//! already carrying the ASC/DESC attribute short-circuit to (reverse) iota.

pub mod counting;
pub mod merge;
pub mod parallel;
pub mod radix;

use crate::error;
use crate::obj::{attr, Obj, NULL_I64, TAG_B8, TAG_C8, TAG_DATE, TAG_F64, TAG_I16, TAG_I32,
    TAG_I64, TAG_LIST, TAG_SYM, TAG_TIME, TAG_TIMESTAMP, TAG_U8};
use crate::pool;

const SMALL_VEC_THRESHOLD: usize = 4096;
const PARALLEL_SORT_THRESHOLD: usize = 262_144;
const TINY_INSERTION: usize = 32;
const COUNTING_RANGE_MAX: u64 = 65_536;

/// One-pass scan result used for algorithm choice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scope {
    pub min: i64,
    pub max: i64,
    pub nulls: i64,
}

/// Min/max/null-count over an i64 slice, skipping nulls.
pub fn scope(xs: &[i64]) -> Scope {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    let mut nulls = 0i64;
    for &x in xs {
        if x == NULL_I64 {
            nulls += 1;
        } else {
            if x < min {
                min = x;
            }
            if x > max {
                max = x;
            }
        }
    }
    Scope { min, max, nulls }
}

/// Bias transforms: unsigned views that preserve the source order, nulls
/// smallest.
pub mod keys {
    #[inline(always)]
    pub fn i16_key(v: i16) -> u16 {
        (v as u16) ^ 0x8000
    }

    #[inline(always)]
    pub fn i32_key(v: i32) -> u32 {
        (v as u32) ^ 0x8000_0000
    }

    #[inline(always)]
    pub fn i64_key(v: i64) -> u64 {
        (v as u64) ^ (1 << 63)
    }

    /// NaN maps to 0 (the null slot); negatives invert entirely so larger
    /// magnitudes order first; non-negatives just flip the sign bit.
    #[inline(always)]
    pub fn f64_key(v: f64) -> u64 {
        if v.is_nan() {
            return 0;
        }
        let bits = v.to_bits();
        if bits >> 63 == 1 {
            !bits
        } else {
            bits ^ (1 << 63)
        }
    }
}

/// Ascending grade.
pub fn asc(v: &Obj) -> Obj {
    grade(v, true)
}

/// Descending grade.
pub fn desc(v: &Obj) -> Obj {
    grade(v, false)
}

struct IotaCtx {
    out: *mut i64,
    len: i64,
}

fn iota_asc_worker(len: i64, offset: i64, ctx: *mut ()) -> Obj {
    let ctx = unsafe { &*(ctx as *const IotaCtx) };
    for i in 0..len {
        unsafe { *ctx.out.add((offset + i) as usize) = offset + i };
    }
    Obj::null()
}

fn iota_desc_worker(len: i64, offset: i64, ctx: *mut ()) -> Obj {
    let ctx = unsafe { &*(ctx as *const IotaCtx) };
    for i in 0..len {
        unsafe { *ctx.out.add((offset + i) as usize) = ctx.len - 1 - (offset + i) };
    }
    Obj::null()
}

fn iota_indices(n: usize, reverse: bool) -> Obj {
    let mut out = Obj::vector(TAG_I64, n);
    if out.is_err() {
        return out;
    }
    let ctx = IotaCtx { out: out.as_i64s_mut().as_mut_ptr(), len: n as i64 };
    let fun = if reverse { iota_desc_worker } else { iota_asc_worker };
    pool::global().map(n as i64, fun, &ctx as *const IotaCtx as *mut ());
    out
}

fn tiny_sort(keyed: &[u64], asc_order: bool) -> Obj {
    let mut idx: Vec<i64> = (0..keyed.len() as i64).collect();
    counting::insertion_by_key(keyed, &mut idx, asc_order);
    let mut out = Obj::vector(TAG_I64, keyed.len());
    if !out.is_err() {
        out.as_i64s_mut().copy_from_slice(&idx);
    }
    out
}

/// Counting/radix choice for 32- and 64-bit keys once they are biased.
fn grade_wide(keyed: Vec<u64>, passes16: usize, asc_order: bool) -> Obj {
    let n = keyed.len();
    if n <= TINY_INSERTION {
        return tiny_sort(&keyed, asc_order);
    }

    let mut kmin = u64::MAX;
    let mut kmax = 0u64;
    for &k in &keyed {
        if k < kmin {
            kmin = k;
        }
        if k > kmax {
            kmax = k;
        }
    }
    let range = kmax - kmin + 1;

    if n >= PARALLEL_SORT_THRESHOLD {
        let pool = pool::global();
        if pool.split_by(n as i64, 0) > 1 {
            return if range <= COUNTING_RANGE_MAX {
                parallel::parallel_counting(pool, &keyed, kmin, range as usize, asc_order)
            } else {
                parallel::parallel_radix16(pool, &keyed, passes16, asc_order)
            };
        }
    }

    if range <= COUNTING_RANGE_MAX {
        return counting::counting_range(&keyed, kmin, range as usize, asc_order);
    }
    if n < SMALL_VEC_THRESHOLD {
        radix::radix8(keyed.as_slice(), asc_order)
    } else {
        radix::radix16(keyed.as_slice(), asc_order)
    }
}

fn grade(v: &Obj, asc_order: bool) -> Obj {
    let n = v.len();
    if v.tag() < 0 {
        return error::err_type(TAG_LIST, v.tag(), 0, 0);
    }
    if n == 0 {
        return Obj::vector(TAG_I64, 0);
    }
    if n == 1 {
        return Obj::i64_vec(&[0]);
    }

    // Attribute short-circuit: already ordered either way.
    let attrs = v.attrs();
    if attrs & attr::ASC != 0 {
        return iota_indices(n, !asc_order);
    }
    if attrs & attr::DESC != 0 {
        return iota_indices(n, asc_order);
    }

    match v.tag() {
        TAG_B8 | TAG_U8 | TAG_C8 => {
            let data = v.as_u8s();
            if n >= PARALLEL_SORT_THRESHOLD {
                let keyed: Vec<u64> = data.iter().map(|&x| x as u64).collect();
                parallel::parallel_counting(pool::global(), &keyed, 0, 256, asc_order)
            } else {
                counting::counting_u8(data, asc_order)
            }
        }
        TAG_I16 => {
            let data = v.as_i16s();
            if n >= PARALLEL_SORT_THRESHOLD {
                let keyed: Vec<u64> = data.iter().map(|&x| keys::i16_key(x) as u64).collect();
                parallel::parallel_counting(pool::global(), &keyed, 0, 65_536, asc_order)
            } else if n >= SMALL_VEC_THRESHOLD {
                let keyed: Vec<u16> = data.iter().map(|&x| keys::i16_key(x)).collect();
                counting::counting_u16(&keyed, asc_order)
            } else {
                let keyed: Vec<u16> = data.iter().map(|&x| keys::i16_key(x)).collect();
                radix::radix8(keyed.as_slice(), asc_order)
            }
        }
        TAG_I32 | TAG_DATE | TAG_TIME => {
            let keyed: Vec<u64> = v.as_i32s().iter().map(|&x| keys::i32_key(x) as u64).collect();
            grade_wide(keyed, 2, asc_order)
        }
        TAG_I64 | TAG_TIMESTAMP => {
            let keyed: Vec<u64> = v.as_i64s().iter().map(|&x| keys::i64_key(x)).collect();
            grade_wide(keyed, 4, asc_order)
        }
        TAG_F64 => {
            let keyed: Vec<u64> = v.as_f64s().iter().map(|&x| keys::f64_key(x)).collect();
            let n = keyed.len();
            if n >= PARALLEL_SORT_THRESHOLD && pool::global().split_by(n as i64, 0) > 1 {
                parallel::parallel_radix16(pool::global(), &keyed, 4, asc_order)
            } else if n <= TINY_INSERTION {
                tiny_sort(&keyed, asc_order)
            } else {
                radix::radix16(keyed.as_slice(), asc_order)
            }
        }
        TAG_SYM => merge::sort_syms(v, asc_order),
        TAG_LIST => merge::sort_objs(v, asc_order),
        other => error::err_type(TAG_LIST, other, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng_seq(n: usize, seed: u64) -> Vec<u64> {
        let mut x = seed | 1;
        (0..n)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x
            })
            .collect()
    }

    fn check_graded_i64(v: &Obj, idx: &Obj, asc_order: bool) {
        let data = v.as_i64s();
        let p = idx.as_i64s();
        assert_eq!(p.len(), data.len());
        let mut seen = vec![false; data.len()];
        for &i in p {
            assert!(!seen[i as usize], "not a permutation");
            seen[i as usize] = true;
        }
        for w in p.windows(2) {
            let (a, b) = (
                keys::i64_key(data[w[0] as usize]),
                keys::i64_key(data[w[1] as usize]),
            );
            if asc_order {
                assert!(a < b || (a == b && w[0] < w[1]));
            } else {
                assert!(a > b || (a == b && w[0] < w[1]));
            }
        }
    }

    #[test]
    fn test_lengths_i64() {
        for n in [0usize, 1, 2, 31, 127, 1024, 131_072] {
            let data: Vec<i64> = rng_seq(n, 42)
                .into_iter()
                .map(|x| (x % 1000) as i64 - 500)
                .collect();
            let v = Obj::i64_vec(&data);
            let p = asc(&v);
            check_graded_i64(&v, &p, true);
            let p = desc(&v);
            check_graded_i64(&v, &p, false);
        }
    }

    #[test]
    fn test_radix_matches_reference_i64() {
        let data: Vec<i64> = rng_seq(50_000, 7).into_iter().map(|x| x as i64).collect();
        let v = Obj::i64_vec(&data);
        let p = asc(&v);

        let mut reference: Vec<i64> = (0..data.len() as i64).collect();
        reference.sort_by_key(|&i| (keys::i64_key(data[i as usize]), i));
        assert_eq!(p.as_i64s(), reference.as_slice());
    }

    #[test]
    fn test_radix_matches_reference_i32() {
        let data: Vec<i32> = rng_seq(20_000, 11).into_iter().map(|x| x as i32).collect();
        let v = Obj::i32_vec(&data);
        let p = asc(&v);
        let mut reference: Vec<i64> = (0..data.len() as i64).collect();
        reference.sort_by_key(|&i| (keys::i32_key(data[i as usize]), i));
        assert_eq!(p.as_i64s(), reference.as_slice());
    }

    #[test]
    fn test_radix_matches_reference_f64() {
        let mut data: Vec<f64> = rng_seq(10_000, 13)
            .into_iter()
            .map(|x| ((x % 100_000) as f64 - 50_000.0) / 37.0)
            .collect();
        data[17] = f64::NAN;
        data[400] = f64::NEG_INFINITY;
        data[900] = f64::INFINITY;
        let v = Obj::f64_vec(&data);
        let p = asc(&v);
        let mut reference: Vec<i64> = (0..data.len() as i64).collect();
        reference.sort_by_key(|&i| (keys::f64_key(data[i as usize]), i));
        assert_eq!(p.as_i64s(), reference.as_slice());
    }

    #[test]
    fn test_nulls_first_asc_last_desc() {
        let data = vec![5i64, NULL_I64, -2, NULL_I64, 9];
        let v = Obj::i64_vec(&data);
        let p = asc(&v);
        let order: Vec<i64> = p.as_i64s().iter().map(|&i| data[i as usize]).collect();
        assert_eq!(&order[..2], &[NULL_I64, NULL_I64]);
        let p = desc(&v);
        let order: Vec<i64> = p.as_i64s().iter().map(|&i| data[i as usize]).collect();
        assert_eq!(&order[3..], &[NULL_I64, NULL_I64]);
    }

    #[test]
    fn test_sorted_attribute_short_circuit() {
        let v = Obj::iota(1000);
        let p = asc(&v);
        assert_eq!(p.as_i64s()[0], 0);
        assert_eq!(p.as_i64s()[999], 999);
        let p = desc(&v);
        assert_eq!(p.as_i64s()[0], 999);
        assert_eq!(p.as_i64s()[999], 0);
    }

    #[test]
    fn test_u8_and_i16() {
        let bytes: Vec<u8> = rng_seq(5000, 3).into_iter().map(|x| x as u8).collect();
        let v = Obj::u8_vec(&bytes);
        let p = asc(&v);
        for w in p.as_i64s().windows(2) {
            let (a, b) = (bytes[w[0] as usize], bytes[w[1] as usize]);
            assert!(a < b || (a == b && w[0] < w[1]));
        }

        let shorts: Vec<i16> = rng_seq(5000, 5).into_iter().map(|x| x as i16).collect();
        let v = Obj::i16_vec(&shorts);
        let p = asc(&v);
        let mut reference: Vec<i64> = (0..shorts.len() as i64).collect();
        reference.sort_by_key(|&i| (keys::i16_key(shorts[i as usize]), i));
        assert_eq!(p.as_i64s(), reference.as_slice());
    }

    #[test]
    fn test_parallel_large_vector() {
        let data: Vec<i64> = rng_seq(400_000, 23)
            .into_iter()
            .map(|x| (x % 100) as i64)
            .collect();
        let v = Obj::i64_vec(&data);
        let p = asc(&v);
        check_graded_i64(&v, &p, true);
    }
}
