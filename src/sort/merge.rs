//! Comparator sorts for element types without a radix key: symbols order by
//! their interned strings, lists by recursive value comparison. Both lean on
//! the standard library's stable sort over an index vector.

use std::cmp::Ordering;

use crate::obj::{self, Obj, NULL_I64, TAG_I64};
use crate::symbols;

/// Grade a SYMBOL vector by interned string order, nulls first ascending.
/// Identical ids short-circuit the string fetch.
pub fn sort_syms(vec: &Obj, asc: bool) -> Obj {
    let ids = vec.as_i64s();
    let n = ids.len();

    // Fetch each id's string once; repeated ids hit the small cache.
    let mut strings: Vec<Option<String>> = Vec::with_capacity(n);
    let mut last: Option<(i64, Option<String>)> = None;
    for &id in ids {
        match &last {
            Some((cached, s)) if *cached == id => strings.push(s.clone()),
            _ => {
                let s = if id == NULL_I64 { None } else { symbols::str_of(id) };
                strings.push(s.clone());
                last = Some((id, s));
            }
        }
    }

    let mut idx: Vec<i64> = (0..n as i64).collect();
    idx.sort_by(|&a, &b| {
        if ids[a as usize] == ids[b as usize] {
            return Ordering::Equal;
        }
        let c = match (&strings[a as usize], &strings[b as usize]) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        };
        if asc {
            c
        } else {
            c.reverse()
        }
    });

    let mut out = Obj::vector(TAG_I64, n);
    if !out.is_err() {
        out.as_i64s_mut().copy_from_slice(&idx);
    }
    out
}

/// Grade a LIST with the element-wise comparator.
pub fn sort_objs(vec: &Obj, asc: bool) -> Obj {
    let items = vec.as_list();
    let n = items.len();

    let mut idx: Vec<i64> = (0..n as i64).collect();
    idx.sort_by(|&a, &b| {
        let c = obj::obj_cmp(&items[a as usize], &items[b as usize]);
        if asc {
            c
        } else {
            c.reverse()
        }
    });

    let mut out = Obj::vector(TAG_I64, n);
    if !out.is_err() {
        out.as_i64s_mut().copy_from_slice(&idx);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_sort_by_string_not_id() {
        // Interned in reverse lexical order so id order differs.
        let z = symbols::intern("zebra");
        let a = symbols::intern("aardvark");
        let m = symbols::intern("marmot");
        let v = Obj::sym_vec(&[z, a, m]);
        let out = sort_syms(&v, true);
        assert_eq!(out.as_i64s(), &[1, 2, 0]);
    }

    #[test]
    fn test_symbols_nulls_first() {
        let a = symbols::intern("alpha");
        let v = Obj::sym_vec(&[a, NULL_I64, a]);
        let asc = sort_syms(&v, true);
        assert_eq!(asc.as_i64s()[0], 1);
        let desc = sort_syms(&v, false);
        assert_eq!(desc.as_i64s()[2], 1);
    }

    #[test]
    fn test_lists_sort_recursively() {
        let v = Obj::list_from(vec![
            Obj::i64_vec(&[2, 1]),
            Obj::i64_vec(&[1, 9]),
            Obj::i64_vec(&[1, 2]),
        ]);
        let out = sort_objs(&v, true);
        assert_eq!(out.as_i64s(), &[2, 1, 0]);
    }
}
