//! Left join by key symbols.
//!
//! Row hashes for both sides are precomputed column-by-column with the
//! batched mixer into a scratch buffer; the right side's rows go into an
//! open-addressing table keyed by (hash, row-compare) callbacks, then every
//! left row probes it. A miss yields `NULL_I64`, and the stitched output
//! columns fall back to the left value wherever the probe missed.

use crate::error;
use crate::hash::{mix, mix_batch, OaSeed, OaTable, HASH_INIT};
use crate::obj::{self, Obj, NULL_I64, TAG_B8, TAG_C8, TAG_DATE, TAG_F64, TAG_GUID, TAG_I16,
    TAG_I32, TAG_I64, TAG_LIST, TAG_SYM, TAG_TABLE, TAG_TIME, TAG_TIMESTAMP, TAG_U8};

use super::filter::at_ids;
use super::sets;

fn table_rows(t: &Obj) -> usize {
    t.as_list()[1].as_list().first().map(|c| c.len()).unwrap_or(0)
}

fn column_by_sym(t: &Obj, sym: i64) -> Option<Obj> {
    let names = t.as_list()[0].as_i64s();
    let pos = names.iter().position(|&n| n == sym)?;
    Some(t.as_list()[1].as_list()[pos].clone())
}

/// Extract the named key columns of `t` as a LIST.
fn key_columns(t: &Obj, syms: &Obj) -> Obj {
    let mut out = Obj::list(syms.len());
    for (i, &s) in syms.as_i64s().iter().enumerate() {
        match column_by_sym(t, s) {
            Some(c) => out.list_set(i, c),
            None => return error::err_value(s),
        }
    }
    out
}

/// Fold one column into the running row hashes.
fn hash_column(col: &Obj, out: &mut [u64]) {
    match col.tag() {
        TAG_I64 | TAG_SYM | TAG_TIMESTAMP => {
            let vals = col.as_i64s();
            // The i64 payload is the common case; batch it.
            let as_u64: &[u64] =
                unsafe { std::slice::from_raw_parts(vals.as_ptr() as *const u64, vals.len()) };
            mix_batch(out, as_u64);
        }
        TAG_I32 | TAG_DATE | TAG_TIME => {
            for (h, &v) in out.iter_mut().zip(col.as_i32s()) {
                *h = mix(*h, v as u64);
            }
        }
        TAG_I16 => {
            for (h, &v) in out.iter_mut().zip(col.as_i16s()) {
                *h = mix(*h, v as u64);
            }
        }
        TAG_B8 | TAG_U8 | TAG_C8 => {
            for (h, &v) in out.iter_mut().zip(col.as_u8s()) {
                *h = mix(*h, v as u64);
            }
        }
        TAG_F64 => {
            for (h, &v) in out.iter_mut().zip(col.as_f64s()) {
                *h = mix(*h, v.to_bits());
            }
        }
        TAG_GUID => {
            for (h, g) in out.iter_mut().zip(col.as_guids()) {
                let lo = u64::from_le_bytes(g[..8].try_into().unwrap());
                let hi = u64::from_le_bytes(g[8..].try_into().unwrap());
                *h = mix(mix(*h, lo), hi);
            }
        }
        _ => {}
    }
}

/// Precomputed row hashes over all key columns.
fn precalc_hashes(cols: &Obj, nrows: usize) -> Vec<u64> {
    let mut out = vec![HASH_INIT; nrows];
    for col in cols.as_list() {
        hash_column(col, &mut out);
    }
    out
}

/// Cross-table probe context. Right rows live in the table as plain ids;
/// left probes are tagged with the high bit so the callbacks know which
/// side a row id belongs to.
struct JoinSeed<'a> {
    left_cols: &'a Obj,
    right_cols: &'a Obj,
    left_hashes: &'a [u64],
    right_hashes: &'a [u64],
}

const LEFT_BIT: i64 = 1 << 62;

impl JoinSeed<'_> {
    fn col_eq(a: &Obj, ai: usize, b: &Obj, bi: usize) -> bool {
        match a.tag() {
            TAG_I64 | TAG_SYM | TAG_TIMESTAMP => a.as_i64s()[ai] == b.as_i64s()[bi],
            TAG_I32 | TAG_DATE | TAG_TIME => a.as_i32s()[ai] == b.as_i32s()[bi],
            TAG_I16 => a.as_i16s()[ai] == b.as_i16s()[bi],
            TAG_B8 | TAG_U8 | TAG_C8 => a.as_u8s()[ai] == b.as_u8s()[bi],
            TAG_F64 => a.as_f64s()[ai].to_bits() == b.as_f64s()[bi].to_bits(),
            TAG_GUID => a.as_guids()[ai] == b.as_guids()[bi],
            _ => false,
        }
    }

    fn side(&self, row: i64) -> (&Obj, usize) {
        if row & LEFT_BIT != 0 {
            (self.left_cols, (row & !LEFT_BIT) as usize)
        } else {
            (self.right_cols, row as usize)
        }
    }
}

impl OaSeed for JoinSeed<'_> {
    fn row_hash(&self, row: i64) -> u64 {
        if row & LEFT_BIT != 0 {
            self.left_hashes[(row & !LEFT_BIT) as usize]
        } else {
            self.right_hashes[row as usize]
        }
    }

    fn rows_equal(&self, a: i64, b: i64) -> bool {
        let (ta, ia) = self.side(a);
        let (tb, ib) = self.side(b);
        for (ca, cb) in ta.as_list().iter().zip(tb.as_list()) {
            if ca.tag() != cb.tag() {
                return false;
            }
            if !Self::col_eq(ca, ia, cb, ib) {
                return false;
            }
        }
        true
    }
}

/// Single-key fast path: the key value itself feeds the table, skipping
/// per-row composite hashing.
fn build_idx_single(lkey: &Obj, rkey: &Obj) -> Obj {
    let seed = crate::hash::IdentitySeed;
    let lvals = lkey.as_i64s();
    let rvals = rkey.as_i64s();

    let mut ht = OaTable::new(rvals.len() * 2, true);
    for (i, &k) in rvals.iter().enumerate() {
        if k != NULL_I64 {
            ht.insert(k, i as i64, &seed);
        }
    }

    let mut out = Obj::vector(TAG_I64, lvals.len());
    if out.is_err() {
        return out;
    }
    let ov = out.as_i64s_mut();
    for (o, &k) in ov.iter_mut().zip(lvals) {
        *o = if k == NULL_I64 { NULL_I64 } else { ht.get(k, &seed) };
    }
    out
}

/// left-row → right-row id map; misses are `NULL_I64`.
fn build_idx(lcols: &Obj, rcols: &Obj) -> Obj {
    if lcols.len() == 1
        && matches!(lcols.as_list()[0].tag(), TAG_I64 | TAG_SYM | TAG_TIMESTAMP)
        && rcols.as_list()[0].tag() == lcols.as_list()[0].tag()
    {
        return build_idx_single(&lcols.as_list()[0], &rcols.as_list()[0]);
    }

    let ll = lcols.as_list()[0].len();
    let rl = rcols.as_list()[0].len();

    let left_hashes = precalc_hashes(lcols, ll);
    let right_hashes = precalc_hashes(rcols, rl);
    let seed = JoinSeed { left_cols: lcols, right_cols: rcols, left_hashes: &left_hashes, right_hashes: &right_hashes };

    // Insertion keeps the first row for duplicate right keys.
    let mut ht = OaTable::new(rl * 2, true);
    for i in 0..rl {
        ht.insert(i as i64, i as i64, &seed);
    }

    let mut out = Obj::vector(TAG_I64, ll);
    if out.is_err() {
        return out;
    }
    let ov = out.as_i64s_mut();
    for i in 0..ll {
        ov[i] = ht.get(i as i64 | LEFT_BIT, &seed);
    }
    out
}

/// Output column: left value where the probe missed, right value otherwise.
fn select_column(left_col: Option<&Obj>, right_col: Option<&Obj>, ids: &[i64]) -> Obj {
    let right_col = match right_col {
        // Column only exists on the left: keep it as-is.
        None => return left_col.expect("column on neither side").clone(),
        Some(c) => c,
    };

    if let Some(lc) = left_col {
        if lc.tag() != right_col.tag() {
            return error::err_type(lc.tag(), right_col.tag(), 0, 0);
        }
    }

    // Gather from the right, then backfill misses from the left (or leave
    // the type's null when the column is right-only).
    let mut out = at_ids(right_col, ids);
    if out.is_err() {
        return out;
    }
    if let Some(lc) = left_col {
        for (i, &id) in ids.iter().enumerate() {
            if id == NULL_I64 {
                let item = lc.at_idx(i);
                match out.tag() {
                    TAG_I64 | TAG_SYM | TAG_TIMESTAMP => out.as_i64s_mut()[i] = item.i64_val(),
                    TAG_I32 | TAG_DATE | TAG_TIME => out.as_i32s_mut()[i] = item.i32_val(),
                    TAG_I16 => out.as_i16s_mut()[i] = item.i16_val(),
                    TAG_B8 | TAG_U8 | TAG_C8 => out.as_u8s_mut()[i] = item.u8_val(),
                    TAG_F64 => out.as_f64s_mut()[i] = item.f64_val(),
                    TAG_GUID => out.as_guids_mut()[i] = item.guid_val(),
                    TAG_LIST => out.list_set(i, item),
                    _ => {}
                }
            }
        }
    }
    out
}

/// Left join `right` onto `left` by the key symbols in `syms`. Empty inputs
/// short-circuit to a clone of the left table.
pub fn left_join(syms: &Obj, left: &Obj, right: &Obj) -> Obj {
    if syms.tag() != TAG_SYM {
        return error::err_type(TAG_SYM, syms.tag(), 0, 0);
    }
    if left.tag() != TAG_TABLE {
        return error::err_type(TAG_TABLE, left.tag(), 1, 0);
    }
    if right.tag() != TAG_TABLE {
        return error::err_type(TAG_TABLE, right.tag(), 2, 0);
    }
    if table_rows(left) == 0 || table_rows(right) == 0 {
        return left.clone();
    }

    let lkeys = key_columns(left, syms);
    if lkeys.is_err() {
        return lkeys;
    }
    let rkeys = key_columns(right, syms);
    if rkeys.is_err() {
        return rkeys;
    }

    let idx = build_idx(&lkeys, &rkeys);
    if idx.is_err() {
        return idx;
    }
    let ids = idx.as_i64s();

    // (left ∪ right) − keys, in appearance order.
    let all = sets::union(&left.as_list()[0], &right.as_list()[0]);
    let others = sets::except(&all, syms);
    if others.is_err() {
        return others;
    }
    if others.is_empty() {
        return error::err_length(0, 0, 0);
    }

    let mut vals = Obj::list(others.len());
    for (i, &s) in others.as_i64s().iter().enumerate() {
        let lc = column_by_sym(left, s);
        let rc = column_by_sym(right, s);
        let col = select_column(lc.as_ref(), rc.as_ref(), ids);
        if col.is_err() {
            return col;
        }
        vals.list_set(i, col);
    }

    // Key columns come from the left side unchanged.
    let mut names = Obj::vector(TAG_SYM, 0);
    for &s in syms.as_i64s().iter().chain(others.as_i64s()) {
        Obj::push_i64(&mut names, s);
    }
    let mut cols = Obj::list(0);
    for i in 0..syms.len() {
        Obj::push_obj(&mut cols, lkeys.as_list()[i].clone());
    }
    for i in 0..vals.len() {
        Obj::push_obj(&mut cols, vals.as_list()[i].clone());
    }
    Obj::table(names, cols)
}

/// Inner join: left join restricted to rows whose probe hit.
pub fn inner_join(syms: &Obj, left: &Obj, right: &Obj) -> Obj {
    if syms.tag() != TAG_SYM {
        return error::err_type(TAG_SYM, syms.tag(), 0, 0);
    }
    if left.tag() != TAG_TABLE || right.tag() != TAG_TABLE {
        return error::err_type(TAG_TABLE, if left.tag() != TAG_TABLE { left.tag() } else { right.tag() }, 1, 0);
    }
    if table_rows(left) == 0 || table_rows(right) == 0 {
        // No possible matches: the left schema with zero rows.
        let names = left.as_list()[0].clone();
        let cols = left.as_list()[1].as_list();
        let mut empty = Obj::list(cols.len());
        for (i, c) in cols.iter().enumerate() {
            empty.list_set(i, Obj::vector(c.tag(), 0));
        }
        return Obj::table(names, empty);
    }

    let lkeys = key_columns(left, syms);
    if lkeys.is_err() {
        return lkeys;
    }
    let rkeys = key_columns(right, syms);
    if rkeys.is_err() {
        return rkeys;
    }
    let idx = build_idx(&lkeys, &rkeys);
    if idx.is_err() {
        return idx;
    }

    // Keep left rows with a match, then reuse the left-join stitcher on the
    // filtered table.
    let mut hits = Obj::vector(TAG_I64, 0);
    for (i, &id) in idx.as_i64s().iter().enumerate() {
        if id != NULL_I64 {
            Obj::push_i64(&mut hits, i as i64);
        }
    }
    let names = left.as_list()[0].clone();
    let cols = left.as_list()[1].as_list();
    let mut filtered = Obj::list(cols.len());
    for (i, c) in cols.iter().enumerate() {
        filtered.list_set(i, at_ids(c, hits.as_i64s()));
    }
    let narrowed = Obj::table(names, filtered);
    if narrowed.is_err() {
        return narrowed;
    }
    left_join(syms, &narrowed, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trades() -> Obj {
        Obj::table(
            Obj::sym_vec_strs(&["sym", "price"]),
            Obj::list_from(vec![
                Obj::sym_vec_strs(&["AAPL", "GOOG", "MSFT"]),
                Obj::i64_vec(&[190, 170, 410]),
            ]),
        )
    }

    fn quotes() -> Obj {
        Obj::table(
            Obj::sym_vec_strs(&["sym", "bid"]),
            Obj::list_from(vec![
                Obj::sym_vec_strs(&["AAPL", "GOOG", "TSLA"]),
                Obj::i64_vec(&[189, 169, 250]),
            ]),
        )
    }

    #[test]
    fn test_left_join_fills_nulls() {
        let keys = Obj::sym_vec_strs(&["sym"]);
        let l = Obj::table(
            Obj::sym_vec_strs(&["sym", "x"]),
            Obj::list_from(vec![
                Obj::sym_vec_strs(&["a", "b", "c"]),
                Obj::i64_vec(&[1, 2, 3]),
            ]),
        );
        let r = Obj::table(
            Obj::sym_vec_strs(&["sym", "y"]),
            Obj::list_from(vec![Obj::sym_vec_strs(&["a", "c"]), Obj::i64_vec(&[10, 30])]),
        );
        let out = left_join(&keys, &l, &r);
        assert_eq!(out.tag(), TAG_TABLE);
        let cols = out.as_list()[1].as_list();
        // sym, x, y
        assert_eq!(cols[1].as_i64s(), &[1, 2, 3]);
        assert_eq!(cols[2].as_i64s(), &[10, NULL_I64, 30]);
    }

    #[test]
    fn test_inner_join_drops_misses() {
        let keys = Obj::sym_vec_strs(&["sym"]);
        let out = inner_join(&keys, &trades(), &quotes());
        let cols = out.as_list()[1].as_list();
        assert_eq!(cols[0].len(), 2); // AAPL and GOOG only
        assert_eq!(cols[1].as_i64s(), &[190, 170]);
        assert_eq!(cols[2].as_i64s(), &[189, 169]);
    }

    #[test]
    fn test_empty_left_short_circuits() {
        let keys = Obj::sym_vec_strs(&["sym"]);
        let empty = Obj::table(
            Obj::sym_vec_strs(&["sym", "x"]),
            Obj::list_from(vec![Obj::sym_vec_strs(&[]), Obj::i64_vec(&[])]),
        );
        let out = left_join(&keys, &empty, &quotes());
        assert_eq!(table_rows(&out), 0);
    }

    #[test]
    fn test_type_mismatch_errors() {
        let keys = Obj::sym_vec_strs(&["sym"]);
        let l = Obj::table(
            Obj::sym_vec_strs(&["sym", "v"]),
            Obj::list_from(vec![Obj::sym_vec_strs(&["a"]), Obj::i64_vec(&[1])]),
        );
        let r = Obj::table(
            Obj::sym_vec_strs(&["sym", "v"]),
            Obj::list_from(vec![Obj::sym_vec_strs(&["a"]), Obj::f64_vec(&[1.0])]),
        );
        assert!(left_join(&keys, &l, &r).is_err());
    }

    #[test]
    fn test_multi_key_join() {
        let keys = Obj::sym_vec_strs(&["sym", "day"]);
        let l = Obj::table(
            Obj::sym_vec_strs(&["sym", "day", "x"]),
            Obj::list_from(vec![
                Obj::sym_vec_strs(&["a", "a", "b"]),
                Obj::i64_vec(&[1, 2, 1]),
                Obj::i64_vec(&[100, 200, 300]),
            ]),
        );
        let r = Obj::table(
            Obj::sym_vec_strs(&["sym", "day", "y"]),
            Obj::list_from(vec![
                Obj::sym_vec_strs(&["a", "b"]),
                Obj::i64_vec(&[2, 1]),
                Obj::i64_vec(&[-2, -1]),
            ]),
        );
        let out = left_join(&keys, &l, &r);
        let cols = out.as_list()[1].as_list();
        assert_eq!(cols[3].as_i64s(), &[NULL_I64, -2, -1]);
    }
}
