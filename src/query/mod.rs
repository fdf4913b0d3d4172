//! The select pipeline.
//!
//! A query is a DICT keyed by symbols. `from`, `where`, `by` (and `take`)
//! are reserved and drive the pipeline; every other key names a projected
//! column evaluated in the column-resolution scope:
//!
//! 1. **Fetch**: evaluate `from` into the query context so column lookups
//!    resolve against it.
//! 2. **Filter**: evaluate `where` to a boolean vector, convert to an
//!    index vector, and swap the working table for a MAPFILTER view.
//! 3. **Group**: materialise the key columns into the context's `groupby`
//!    slot and wrap the working columns in MAPGROUP. No grouping happens
//!    here; it is fused into aggregation.
//! 4. **Project**: evaluate the remaining keys; MAPFILTER results gather,
//!    MAPGROUP results must have been consumed by an aggregate. Group key
//!    columns are prepended to the projected ones.

pub mod aggr;
pub mod filter;
pub mod group;
pub mod join;
pub mod sets;

use crate::error;
use crate::eval;
use crate::obj::{Obj, TAG_B8, TAG_DICT, TAG_MAPFILTER, TAG_MAPGROUP, TAG_SYM, TAG_TABLE};
use crate::symbols;
use crate::vm::{self, QueryCtx};

/// Value bound to `name` in a symbol-keyed DICT, if present.
pub fn at_sym(dict: &Obj, name: &str) -> Option<Obj> {
    let sym = symbols::intern(name);
    let keys = dict.as_list()[0].as_i64s();
    let pos = keys.iter().position(|&k| k == sym)?;
    Some(dict.as_list()[1].at_idx(pos))
}

fn fetch_table(q: &Obj) -> Obj {
    let Some(prm) = at_sym(q, "from") else {
        return error::err_value(symbols::intern("from"));
    };
    let val = eval::eval(&prm);
    if val.is_err() {
        return val;
    }
    if val.tag() != TAG_TABLE {
        return error::err_type(TAG_TABLE, val.tag(), 0, symbols::intern("from"));
    }
    vm::ctx_set_table(val);

    if let Some(prm) = at_sym(q, "take") {
        let take = eval::eval(&prm);
        if take.is_err() {
            return take;
        }
        vm::ctx_set_take(take);
    }
    Obj::null()
}

fn apply_filters(q: &Obj) -> Obj {
    let Some(prm) = at_sym(q, "where") else {
        return Obj::null();
    };
    let mask = eval::eval(&prm);
    if mask.is_err() {
        return mask;
    }
    if mask.tag() != TAG_B8 {
        return error::err_type(TAG_B8, mask.tag(), 0, symbols::intern("where"));
    }
    let mut fil = filter::where_indices(&mask);
    if fil.is_err() {
        return fil;
    }

    let table = vm::ctx_table().expect("fetch ran first");
    // Parted tables filter partition-locally: the global positions are
    // rebased per partition so the deferred gather stays partition-wise.
    if let Some(counts) = crate::storage::parted_counts(&table) {
        fil = filter::split_parted_indices(&fil, &counts);
    }
    let view = filter::filter_map(&table, &fil);
    vm::ctx_set_filter(fil);
    vm::ctx_set_table(view);
    Obj::null()
}

/// Evaluate one group-key expression and force it to a plain vector.
fn materialise_key(expr: &Obj) -> Obj {
    let v = eval::eval(expr);
    if v.is_err() {
        return v;
    }
    match v.tag() {
        TAG_MAPFILTER => filter::filter_collect(&v.as_list()[0], &v.as_list()[1]),
        TAG_MAPGROUP => error::err_nyi(TAG_MAPGROUP),
        _ => v,
    }
}

/// Names and materialised columns of the `by` clause.
fn group_keys_of(prm: &Obj) -> Result<(Vec<i64>, Obj), Obj> {
    match prm.tag() {
        t if t == -TAG_SYM => {
            let col = materialise_key(prm);
            if col.is_err() {
                return Err(col);
            }
            Ok((vec![prm.sym_val()], Obj::list_from(vec![col])))
        }
        TAG_DICT => {
            let names = &prm.as_list()[0];
            if names.tag() != TAG_SYM {
                return Err(error::err_type(TAG_SYM, names.tag(), 0, 0));
            }
            let exprs = &prm.as_list()[1];
            let mut cols = Vec::with_capacity(names.len());
            for i in 0..exprs.len() {
                let e = exprs.at_idx(i);
                let col = materialise_key(&e);
                if col.is_err() {
                    return Err(col);
                }
                cols.push(col);
            }
            Ok((names.as_i64s().to_vec(), Obj::list_from(cols)))
        }
        other => Err(error::err_type(TAG_SYM, other, 0, symbols::intern("by"))),
    }
}

fn apply_groupings(q: &Obj) -> Result<Vec<i64>, Obj> {
    let Some(prm) = at_sym(q, "by") else {
        return Ok(Vec::new());
    };
    let (names, groupby) = group_keys_of(&prm)?;

    let table = vm::ctx_table().expect("fetch ran first");
    let grouped = group::group_map(&table, &groupby);
    vm::ctx_set_groupby(groupby);
    vm::ctx_set_table(grouped);
    Ok(names)
}

fn reserved() -> [i64; 4] {
    [
        symbols::intern("from"),
        symbols::intern("where"),
        symbols::intern("by"),
        symbols::intern("take"),
    ]
}

/// Materialise every column of the working table (used when the query has
/// no projections).
fn collect_table(table: &Obj) -> Obj {
    let names = table.as_list()[0].clone();
    let cols = table.as_list()[1].as_list();
    let mut out = Obj::list(cols.len());
    for (i, c) in cols.iter().enumerate() {
        let v = match c.tag() {
            TAG_MAPFILTER => filter::filter_collect(&c.as_list()[0], &c.as_list()[1]),
            crate::obj::TAG_MAPCOMMON => filter::expand_common(c),
            crate::obj::TAG_PARTEDI64 => filter::raze(c),
            _ => c.clone(),
        };
        if v.is_err() {
            return v;
        }
        out.list_set(i, v);
    }
    Obj::table(names, out)
}

fn head_table(table: Obj, n: i64) -> Obj {
    let rows = table.as_list()[1].as_list().first().map(|c| c.len()).unwrap_or(0);
    let n = (n.max(0) as usize).min(rows);
    let ids: Vec<i64> = (0..n as i64).collect();
    let names = table.as_list()[0].clone();
    let cols = table.as_list()[1].as_list();
    let mut out = Obj::list(cols.len());
    for (i, c) in cols.iter().enumerate() {
        out.list_set(i, filter::at_ids(c, &ids));
    }
    Obj::table(names, out)
}

/// Run a select query.
pub fn select(q: &Obj) -> Obj {
    if q.tag() != TAG_DICT {
        return error::err_type(TAG_DICT, q.tag(), 0, 0);
    }
    if q.as_list()[0].tag() != TAG_SYM {
        return error::err_type(TAG_SYM, q.as_list()[0].tag(), 0, 0);
    }

    vm::ctx_push(QueryCtx::new());
    let res = select_inner(q);
    let popped = vm::ctx_pop();
    drop(popped);
    res
}

fn select_inner(q: &Obj) -> Obj {
    let r = fetch_table(q);
    if r.is_err() {
        return r;
    }
    let r = apply_filters(q);
    if r.is_err() {
        return r;
    }
    let gnames = match apply_groupings(q) {
        Ok(n) => n,
        Err(e) => return e,
    };

    let reserved = reserved();
    let qkeys = q.as_list()[0].as_i64s();

    let mut names: Vec<i64> = Vec::new();
    let mut cols: Vec<Obj> = Vec::new();

    // Group keys lead the output, one value per group.
    if !gnames.is_empty() {
        let groupby = vm::ctx_groupby().expect("groupby set");
        for (i, &name) in gnames.iter().enumerate() {
            let key_col = &groupby.as_list()[i];
            let vals = aggr::group_keys(&groupby, key_col);
            if vals.is_err() {
                return vals;
            }
            names.push(name);
            cols.push(vals);
        }
    }

    let mut projected = 0usize;
    for (i, &key) in qkeys.iter().enumerate() {
        if reserved.contains(&key) {
            continue;
        }
        projected += 1;
        let expr = q.as_list()[1].at_idx(i);
        let val = eval::eval(&expr);
        if val.is_err() {
            return val;
        }
        let val = match val.tag() {
            TAG_MAPFILTER => filter::filter_collect(&val.as_list()[0], &val.as_list()[1]),
            // A grouped column must reach projection through an aggregate.
            TAG_MAPGROUP => error::err_nyi(TAG_MAPGROUP),
            _ => val,
        };
        if val.is_err() {
            return val;
        }
        names.push(key);
        cols.push(val);
    }

    let mut result = if projected == 0 && gnames.is_empty() {
        let table = vm::ctx_table().expect("fetch ran first");
        collect_table(&table)
    } else {
        Obj::table(Obj::sym_vec(&names), Obj::list_from(cols))
    };
    if result.is_err() {
        return result;
    }

    if let Some(take) = vm::with(|v| v.query_ctx.last().map(|c| c.take.clone())) {
        if take.tag() == -crate::obj::TAG_I64 {
            result = head_table(result, take.i64_val());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::aggr::AggOp;
    use crate::verbs;

    fn sample_table() -> Obj {
        Obj::table(
            Obj::sym_vec_strs(&["sym", "x"]),
            Obj::list_from(vec![
                Obj::sym_vec_strs(&["a", "a", "b", "b", "c"]),
                Obj::i64_vec(&[1, 2, 3, 4, 5]),
            ]),
        )
    }

    fn query(pairs: Vec<(&str, Obj)>) -> Obj {
        let names: Vec<&str> = pairs.iter().map(|(n, _)| *n).collect();
        let keys = Obj::sym_vec_strs(&names);
        let vals = Obj::list_from(pairs.into_iter().map(|(_, v)| v).collect());
        Obj::dict(keys, vals)
    }

    #[test]
    fn test_select_all() {
        verbs::install();
        let q = query(vec![("from", sample_table())]);
        let r = select(&q);
        assert_eq!(r.tag(), TAG_TABLE);
        assert_eq!(r.as_list()[1].as_list()[1].as_i64s(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_select_where() {
        verbs::install();
        // where: x > 2 expressed as a precomputed mask through a verb-free
        // tree: (gt x 2) via the installed comparator.
        let gt = verbs::lookup("gt");
        let expr = Obj::list_from(vec![gt, Obj::sym_str("x"), Obj::i64(2)]);
        let q = query(vec![("from", sample_table()), ("where", expr), ("x", Obj::sym_str("x"))]);
        let r = select(&q);
        let col = &r.as_list()[1].as_list()[0];
        assert_eq!(col.as_i64s(), &[3, 4, 5]);
    }

    #[test]
    fn test_select_group_sum() {
        verbs::install();
        let sum = verbs::lookup("sum");
        let s_expr = Obj::list_from(vec![sum, Obj::sym_str("x")]);
        let q = query(vec![
            ("from", sample_table()),
            ("by", Obj::sym_str("sym")),
            ("s", s_expr),
        ]);
        let r = select(&q);
        assert_eq!(r.tag(), TAG_TABLE);
        let names = r.as_list()[0].as_i64s();
        assert_eq!(crate::symbols::str_of(names[0]).as_deref(), Some("sym"));
        assert_eq!(crate::symbols::str_of(names[1]).as_deref(), Some("s"));
        let cols = r.as_list()[1].as_list();
        let keys: Vec<String> = cols[0]
            .as_i64s()
            .iter()
            .map(|&id| crate::symbols::str_of(id).unwrap())
            .collect();
        let sums = cols[1].as_i64s();
        let mut pairs: Vec<(String, i64)> =
            keys.into_iter().zip(sums.iter().copied()).collect();
        pairs.sort();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), 3),
                ("b".to_string(), 7),
                ("c".to_string(), 5)
            ]
        );
    }

    #[test]
    fn test_select_where_and_group() {
        verbs::install();
        let gt = verbs::lookup("gt");
        let sum = verbs::lookup("sum");
        let q = query(vec![
            ("from", sample_table()),
            ("where", Obj::list_from(vec![gt, Obj::sym_str("x"), Obj::i64(1)])),
            ("by", Obj::sym_str("sym")),
            ("s", Obj::list_from(vec![sum, Obj::sym_str("x")])),
        ]);
        let r = select(&q);
        let cols = r.as_list()[1].as_list();
        let mut pairs: Vec<(String, i64)> = cols[0]
            .as_i64s()
            .iter()
            .map(|&id| crate::symbols::str_of(id).unwrap())
            .zip(cols[1].as_i64s().iter().copied())
            .collect();
        pairs.sort();
        // Row x=1 filtered out: a→2, b→7, c→5.
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), 2),
                ("b".to_string(), 7),
                ("c".to_string(), 5)
            ]
        );
    }

    #[test]
    fn test_groupby_thousand_rows() {
        verbs::install();
        // 1000 rows, sym cycling a/b/c, x = 1..1000.
        let syms: Vec<&str> = (0..1000).map(|i| ["a", "b", "c"][i % 3]).collect();
        let xs: Vec<i64> = (1..=1000).collect();
        let t = Obj::table(
            Obj::sym_vec_strs(&["sym", "x"]),
            Obj::list_from(vec![Obj::sym_vec_strs(&syms), Obj::i64_vec(&xs)]),
        );
        let sum = verbs::lookup("sum");
        let q = query(vec![
            ("from", t),
            ("by", Obj::sym_str("sym")),
            ("s", Obj::list_from(vec![sum, Obj::sym_str("x")])),
        ]);
        let r = select(&q);
        let cols = r.as_list()[1].as_list();
        let total: i64 = cols[1].as_i64s().iter().sum();
        assert_eq!(total, 500_500);
        assert_eq!(cols[0].len(), 3);
    }

    #[test]
    fn test_missing_from_is_error() {
        verbs::install();
        let q = query(vec![("x", Obj::i64(1))]);
        assert!(select(&q).is_err());
    }

    #[test]
    fn test_aggregate_outside_group_ctx() {
        let v = Obj::i64_vec(&[1, 2, 3]);
        assert!(aggr::aggregate(AggOp::Sum, &v).is_err());
    }
}
