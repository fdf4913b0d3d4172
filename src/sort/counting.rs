//! Single-threaded counting sorts.
//!
//! All counting paths run over bias-transformed unsigned keys (see
//! [`super::keys`]), so nulls occupy the smallest bucket and need no special
//! casing: ascending prefix sums place them first, descending place them
//! last. Scatter preserves input order within a bucket, which makes every
//! sort here stable.

use crate::obj::{Obj, TAG_I64};

/// 256-bucket counting sort for byte keys.
pub fn counting_u8(keys: &[u8], asc: bool) -> Obj {
    let n = keys.len();
    let mut counts = [0i64; 256];
    for &k in keys {
        counts[k as usize] += 1;
    }

    let mut pos = [0i64; 256];
    prefix(&counts, &mut pos, asc);

    let mut out = Obj::vector(TAG_I64, n);
    if out.is_err() {
        return out;
    }
    let ov = out.as_i64s_mut();
    for (i, &k) in keys.iter().enumerate() {
        let p = &mut pos[k as usize];
        ov[*p as usize] = i as i64;
        *p += 1;
    }
    out
}

/// One-pass 65 536-bucket counting sort for 16-bit keys.
pub fn counting_u16(keys: &[u16], asc: bool) -> Obj {
    let n = keys.len();
    let mut counts = vec![0i64; 65536];
    for &k in keys {
        counts[k as usize] += 1;
    }

    let mut pos = vec![0i64; 65536];
    prefix(&counts, &mut pos, asc);

    let mut out = Obj::vector(TAG_I64, n);
    if out.is_err() {
        return out;
    }
    let ov = out.as_i64s_mut();
    for (i, &k) in keys.iter().enumerate() {
        let p = &mut pos[k as usize];
        ov[*p as usize] = i as i64;
        *p += 1;
    }
    out
}

/// Range counting sort: bucket is `key - min`. Chosen by the dispatcher when
/// the observed range is small.
pub fn counting_range(keys: &[u64], min: u64, range: usize, asc: bool) -> Obj {
    let n = keys.len();
    let mut counts = vec![0i64; range];
    for &k in keys {
        counts[(k - min) as usize] += 1;
    }

    let mut pos = vec![0i64; range];
    prefix(&counts, &mut pos, asc);

    let mut out = Obj::vector(TAG_I64, n);
    if out.is_err() {
        return out;
    }
    let ov = out.as_i64s_mut();
    for (i, &k) in keys.iter().enumerate() {
        let p = &mut pos[(k - min) as usize];
        ov[*p as usize] = i as i64;
        *p += 1;
    }
    out
}

/// Exclusive prefix sums over bucket counts; reversed bucket order for
/// descending output.
pub fn prefix(counts: &[i64], pos: &mut [i64], asc: bool) {
    if asc {
        let mut acc = 0i64;
        for (p, &c) in pos.iter_mut().zip(counts) {
            *p = acc;
            acc += c;
        }
    } else {
        let mut acc = 0i64;
        for (p, &c) in pos.iter_mut().zip(counts).rev() {
            *p = acc;
            acc += c;
        }
    }
}

/// Insertion sort on an index slice; used for tiny partitions where bucket
/// setup costs more than the quadratic scan.
pub fn insertion_by_key(keys: &[u64], idx: &mut [i64], asc: bool) {
    for i in 1..idx.len() {
        let cur = idx[i];
        let kc = keys[cur as usize];
        let mut j = i;
        while j > 0 {
            let kp = keys[idx[j - 1] as usize];
            let out_of_order = if asc { kp > kc } else { kp < kc };
            if !out_of_order {
                break;
            }
            idx[j] = idx[j - 1];
            j -= 1;
        }
        idx[j] = cur;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_perm(idx: &[i64], n: usize) -> bool {
        let mut seen = vec![false; n];
        for &i in idx {
            if i < 0 || i as usize >= n || seen[i as usize] {
                return false;
            }
            seen[i as usize] = true;
        }
        true
    }

    #[test]
    fn test_counting_u8_sorted_and_stable() {
        let keys = [3u8, 1, 2, 1, 3, 0, 1];
        let out = counting_u8(&keys, true);
        let idx = out.as_i64s();
        assert!(is_perm(idx, keys.len()));
        for w in idx.windows(2) {
            let (a, b) = (keys[w[0] as usize], keys[w[1] as usize]);
            assert!(a < b || (a == b && w[0] < w[1]));
        }
    }

    #[test]
    fn test_counting_u8_desc() {
        let keys = [3u8, 1, 2, 1];
        let out = counting_u8(&keys, false);
        let idx = out.as_i64s();
        let sorted: Vec<u8> = idx.iter().map(|&i| keys[i as usize]).collect();
        assert_eq!(sorted, vec![3, 2, 1, 1]);
        // Equal keys keep input order.
        assert_eq!(&idx[2..], &[1, 3]);
    }

    #[test]
    fn test_counting_range() {
        let keys: Vec<u64> = vec![105, 100, 103, 100, 104];
        let out = counting_range(&keys, 100, 6, true);
        let idx = out.as_i64s();
        assert!(is_perm(idx, keys.len()));
        let sorted: Vec<u64> = idx.iter().map(|&i| keys[i as usize]).collect();
        assert_eq!(sorted, vec![100, 100, 103, 104, 105]);
        assert!(idx[0] < idx[1]);
    }

    #[test]
    fn test_insertion_matches_counting() {
        let keys: Vec<u64> = vec![9, 2, 7, 2, 5, 9, 0];
        let mut idx: Vec<i64> = (0..keys.len() as i64).collect();
        insertion_by_key(&keys, &mut idx, true);
        let reference = counting_range(&keys, 0, 10, true);
        assert_eq!(idx.as_slice(), reference.as_i64s());
    }
}
