//! Boolean-mask filtering and gather.
//!
//! `where_indices` converts a predicate mask into an index vector in one
//! pass; `filter_map` wraps table columns in deferred MAPFILTER views;
//! `filter_collect` materialises a view by gather, including the parted
//! forms (PARTEDI64 per-partition indices, MAPCOMMON virtual constants).

use crate::error;
use crate::obj::{Obj, NULL_I64, TAG_B8, TAG_DATE, TAG_F64, TAG_GUID, TAG_I16, TAG_I32, TAG_I64,
    TAG_LIST, TAG_MAPCOMMON, TAG_PARTEDI64, TAG_SYM, TAG_TABLE, TAG_TIME, TAG_TIMESTAMP, TAG_U8,
    TAG_C8};

/// Positions of true bytes in a B8 mask. The counting pass runs 8 lanes at
/// a time so the compiler can keep it in vector registers.
pub fn where_indices(mask: &Obj) -> Obj {
    if mask.tag() != TAG_B8 {
        return error::err_type(TAG_B8, mask.tag(), 0, 0);
    }
    let data = mask.as_u8s();
    let n = data.len();

    // Pass 1: population count, unrolled 8 wide.
    let mut total = 0usize;
    let chunks = n / 8;
    for c in 0..chunks {
        let base = c * 8;
        let mut acc = 0u32;
        for lane in 0..8 {
            acc += (data[base + lane] != 0) as u32;
        }
        total += acc as usize;
    }
    for &b in &data[chunks * 8..] {
        total += (b != 0) as usize;
    }

    // Pass 2: write positions.
    let mut out = Obj::vector(TAG_I64, total);
    if out.is_err() {
        return out;
    }
    let ov = out.as_i64s_mut();
    let mut k = 0usize;
    for (i, &b) in data.iter().enumerate() {
        if b != 0 {
            ov[k] = i as i64;
            k += 1;
        }
    }
    out.set_attrs(crate::obj::attr::ASC);
    out
}

/// Gather `v[ids]`. A `NULL_I64` id produces the type's null.
pub fn at_ids(v: &Obj, ids: &[i64]) -> Obj {
    let n = ids.len();
    let tag = v.tag();
    let mut out = Obj::vector(tag, n);
    if out.is_err() {
        return out;
    }
    match tag {
        TAG_B8 | TAG_U8 | TAG_C8 => {
            let src = v.as_u8s();
            let dst = out.as_u8s_mut();
            for (d, &i) in dst.iter_mut().zip(ids) {
                *d = if i == NULL_I64 { crate::obj::NULL_U8 } else { src[i as usize] };
            }
        }
        TAG_I16 => {
            let src = v.as_i16s();
            let dst = out.as_i16s_mut();
            for (d, &i) in dst.iter_mut().zip(ids) {
                *d = if i == NULL_I64 { crate::obj::NULL_I16 } else { src[i as usize] };
            }
        }
        TAG_I32 | TAG_DATE | TAG_TIME => {
            let src = v.as_i32s();
            let dst = out.as_i32s_mut();
            for (d, &i) in dst.iter_mut().zip(ids) {
                *d = if i == NULL_I64 { crate::obj::NULL_I32 } else { src[i as usize] };
            }
        }
        TAG_I64 | TAG_SYM | TAG_TIMESTAMP => {
            let src = v.as_i64s();
            let dst = out.as_i64s_mut();
            for (d, &i) in dst.iter_mut().zip(ids) {
                *d = if i == NULL_I64 { NULL_I64 } else { src[i as usize] };
            }
        }
        TAG_F64 => {
            let src = v.as_f64s();
            let dst = out.as_f64s_mut();
            for (d, &i) in dst.iter_mut().zip(ids) {
                *d = if i == NULL_I64 { crate::obj::NULL_F64 } else { src[i as usize] };
            }
        }
        TAG_GUID => {
            let src = v.as_guids();
            let dst = out.as_guids_mut();
            for (d, &i) in dst.iter_mut().zip(ids) {
                *d = if i == NULL_I64 { [0; 16] } else { src[i as usize] };
            }
        }
        TAG_LIST => {
            let src = v.as_list();
            for (k, &i) in ids.iter().enumerate() {
                let item = if i == NULL_I64 { Obj::null() } else { src[i as usize].clone() };
                out.list_set(k, item);
            }
        }
        other => {
            drop(out);
            return error::err_type(TAG_LIST, other, 0, 0);
        }
    }
    out
}

/// Wrap every column of `val` in a deferred MAPFILTER over `index`; other
/// values are wrapped directly.
pub fn filter_map(val: &Obj, index: &Obj) -> Obj {
    if val.tag() == TAG_TABLE {
        let names = val.as_list()[0].clone();
        let cols = val.as_list()[1].as_list();
        let mut wrapped = Obj::list(cols.len());
        for (i, c) in cols.iter().enumerate() {
            wrapped.list_set(i, filter_map(c, index));
        }
        return Obj::table(names, wrapped);
    }
    Obj::map_filter(val.clone(), index.clone())
}

/// Concatenate a LIST of same-typed vectors into one vector.
pub fn raze(parts: &Obj) -> Obj {
    let items = parts.as_list();
    if items.is_empty() {
        return Obj::vector(TAG_I64, 0);
    }
    let tag = items[0].tag();
    let total: usize = items.iter().map(|p| p.len()).sum();
    let mut out = Obj::vector(tag, total);
    if out.is_err() {
        return out;
    }
    let esz = crate::obj::elem_size(tag);
    if tag == TAG_LIST {
        let mut k = 0;
        for p in items {
            for item in p.as_list() {
                out.list_set(k, item.clone());
                k += 1;
            }
        }
        return out;
    }
    let mut off = 0usize;
    for p in items {
        if p.tag() != tag {
            drop(out);
            return error::err_type(tag, p.tag(), 0, 0);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                p.as_u8s().as_ptr(),
                out.as_u8s_mut().as_mut_ptr().add(off * esz),
                p.len() * esz,
            );
        }
        off += p.len();
    }
    out
}

/// Materialise a deferred view: plain index → gather; PARTEDI64 index →
/// per-partition gather stitched with [`raze`], expanding MAPCOMMON virtual
/// columns by repetition.
pub fn filter_collect(val: &Obj, index: &Obj) -> Obj {
    if index.tag() != TAG_PARTEDI64 {
        return at_ids(val, index.as_i64s());
    }

    let idxs = index.as_list();
    let nparts = idxs.len();

    // Virtual constant column: one value per partition, repeated.
    if val.tag() == TAG_MAPCOMMON {
        let values = &val.as_list()[0];
        let counts = val.as_list()[1].as_i64s();
        let mut total = 0usize;
        for (i, idx) in idxs.iter().enumerate() {
            if idx.is_null() {
                continue;
            }
            total += if take_all(idx) { counts[i] as usize } else { idx.len() };
        }
        let tag = values.tag();
        let mut out = Obj::vector(tag, total);
        if out.is_err() {
            return out;
        }
        let mut n = 0usize;
        for (i, idx) in idxs.iter().enumerate() {
            if idx.is_null() {
                continue;
            }
            let count = if take_all(idx) { counts[i] as usize } else { idx.len() };
            match tag {
                TAG_I32 | TAG_DATE | TAG_TIME => {
                    let v = values.as_i32s()[i];
                    out.as_i32s_mut()[n..n + count].fill(v);
                }
                TAG_F64 => {
                    let v = values.as_f64s()[i];
                    out.as_f64s_mut()[n..n + count].fill(v);
                }
                _ => {
                    let v = values.as_i64s()[i];
                    out.as_i64s_mut()[n..n + count].fill(v);
                }
            }
            n += count;
        }
        return out;
    }

    // Parted column: per-partition vectors selected then stitched.
    debug_assert_eq!(val.tag(), TAG_PARTEDI64);
    let cols = val.as_list();
    let mut parts = Vec::with_capacity(nparts);
    for (i, idx) in idxs.iter().enumerate() {
        if idx.is_null() {
            continue;
        }
        if take_all(idx) {
            if !cols[i].is_empty() {
                parts.push(cols[i].clone());
            }
        } else if !idx.is_empty() {
            let sel = at_ids(&cols[i], idx.as_i64s());
            if sel.is_err() {
                return sel;
            }
            parts.push(sel);
        }
    }
    let list = Obj::list_from(parts);
    raze(&list)
}

/// The `-1` atom marker: take every row of the partition.
fn take_all(idx: &Obj) -> bool {
    idx.tag() == -TAG_I64 && idx.i64_val() == -1
}

/// Expand a MAPCOMMON virtual column to its full per-row vector.
pub fn expand_common(common: &Obj) -> Obj {
    let values = &common.as_list()[0];
    let counts = common.as_list()[1].as_i64s();
    let total: i64 = counts.iter().sum();
    let tag = values.tag();
    let mut out = Obj::vector(tag, total as usize);
    if out.is_err() {
        return out;
    }
    let mut n = 0usize;
    for (i, &c) in counts.iter().enumerate() {
        let c = c as usize;
        match tag {
            TAG_I32 | TAG_DATE | TAG_TIME => out.as_i32s_mut()[n..n + c].fill(values.as_i32s()[i]),
            TAG_F64 => out.as_f64s_mut()[n..n + c].fill(values.as_f64s()[i]),
            _ => out.as_i64s_mut()[n..n + c].fill(values.as_i64s()[i]),
        }
        n += c;
    }
    out
}

/// Split a global (ascending) index vector into per-partition local index
/// vectors, producing the PARTEDI64 form the parted gather understands.
pub fn split_parted_indices(global: &Obj, counts: &[i64]) -> Obj {
    let ids = global.as_i64s();
    let mut parts = Vec::with_capacity(counts.len());
    let mut pos = 0usize;
    let mut offset = 0i64;
    for &c in counts {
        let end = offset + c;
        let start = pos;
        while pos < ids.len() && ids[pos] < end {
            pos += 1;
        }
        let local: Vec<i64> = ids[start..pos].iter().map(|&i| i - offset).collect();
        parts.push(Obj::i64_vec(&local));
        offset = end;
    }
    let out = Obj::list_from(parts);
    unsafe { (*out.raw()).tag = TAG_PARTEDI64 };
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_indices() {
        let mut mask = Obj::vector(TAG_B8, 7);
        mask.as_u8s_mut().copy_from_slice(&[0, 1, 1, 0, 0, 1, 0]);
        let idx = where_indices(&mask);
        assert_eq!(idx.as_i64s(), &[1, 2, 5]);
    }

    #[test]
    fn test_at_ids_with_null() {
        let v = Obj::i64_vec(&[10, 20, 30]);
        let out = at_ids(&v, &[2, NULL_I64, 0]);
        assert_eq!(out.as_i64s(), &[30, NULL_I64, 10]);
    }

    #[test]
    fn test_filter_map_wraps_columns() {
        let t = Obj::table(
            Obj::sym_vec_strs(&["a"]),
            Obj::list_from(vec![Obj::i64_vec(&[1, 2, 3])]),
        );
        let idx = Obj::i64_vec(&[0, 2]);
        let wrapped = filter_map(&t, &idx);
        let col = &wrapped.as_list()[1].as_list()[0];
        assert_eq!(col.tag(), crate::obj::TAG_MAPFILTER);
        let collected = filter_collect(&col.as_list()[0], &col.as_list()[1]);
        assert_eq!(collected.as_i64s(), &[1, 3]);
    }

    #[test]
    fn test_raze() {
        let parts = Obj::list_from(vec![Obj::i64_vec(&[1, 2]), Obj::i64_vec(&[3])]);
        let out = raze(&parts);
        assert_eq!(out.as_i64s(), &[1, 2, 3]);
    }

    #[test]
    fn test_parted_collect_with_common() {
        // Two partitions with a virtual date column.
        let values = Obj::i32_vec(&[100, 200]);
        let counts = Obj::i64_vec(&[3, 2]);
        let common = Obj::map_common(values, counts);

        let idx = Obj::list_from(vec![Obj::i64(-1), Obj::i64_vec(&[1])]);
        unsafe { (*idx.raw()).tag = TAG_PARTEDI64 };

        let out = filter_collect(&common, &idx);
        assert_eq!(out.as_i32s(), &[100, 100, 100, 200]);
    }
}
