//! Host-function table.
//!
//! These are the VARY/BINARY/UNARY host functions the evaluator interface
//! exposes to query trees. Aggregating verbs notice when their argument is
//! a grouped column (MAPGROUP) and route through the fused aggregator;
//! otherwise they reduce in place. `install` binds the table into the
//! current thread's environment.

use crate::error;
use crate::obj::{Obj, NULL_F64, NULL_I64, TAG_B8, TAG_DATE, TAG_F64, TAG_I32, TAG_I64, TAG_LIST,
    TAG_MAPFILTER, TAG_MAPGROUP, TAG_SYM, TAG_TABLE, TAG_TIME, TAG_TIMESTAMP};
use crate::query::aggr::{aggregate_with_keys, AggOp};
use crate::query::{self, filter, join};
use crate::sort;
use crate::symbols::intern;
use crate::vm;

/// Unwrap deferred views: returns the materialised column and the group-key
/// list when the value was grouped.
fn unwrap_view(v: Obj) -> (Obj, Option<Obj>) {
    match v.tag() {
        TAG_MAPGROUP => {
            let base = v.as_list()[0].clone();
            let keys = v.as_list()[1].clone();
            let (plain, _) = unwrap_view(base);
            (plain, Some(keys))
        }
        TAG_MAPFILTER => {
            let plain = filter::filter_collect(&v.as_list()[0], &v.as_list()[1]);
            (plain, None)
        }
        crate::obj::TAG_MAPCOMMON => (filter::expand_common(&v), None),
        crate::obj::TAG_PARTEDI64 => (filter::raze(&v), None),
        _ => (v, None),
    }
}

fn agg_or(op: AggOp, x: Obj, plain: fn(&Obj) -> Obj) -> Obj {
    let (v, keys) = unwrap_view(x);
    if v.is_err() {
        return v;
    }
    match keys {
        Some(keys) => aggregate_with_keys(op, &keys, &v),
        None => plain(&v),
    }
}

// ---------------------------------------------------------------------------
// Reductions
// ---------------------------------------------------------------------------

fn sum_plain(v: &Obj) -> Obj {
    match v.tag() {
        TAG_I64 | TAG_TIMESTAMP => {
            let mut acc = 0i64;
            for &x in v.as_i64s() {
                if x != NULL_I64 {
                    acc += x;
                }
            }
            Obj::i64(acc)
        }
        TAG_I32 | TAG_DATE | TAG_TIME => {
            let mut acc = 0i64;
            for &x in v.as_i32s() {
                if x != crate::obj::NULL_I32 {
                    acc += x as i64;
                }
            }
            Obj::i64(acc)
        }
        TAG_F64 => {
            let mut acc = 0.0f64;
            for &x in v.as_f64s() {
                if !x.is_nan() {
                    acc += x;
                }
            }
            Obj::f64(acc)
        }
        t if t == -TAG_I64 => v.clone(),
        t if t == -TAG_F64 => v.clone(),
        other => error::err_type(TAG_I64, other, 0, 0),
    }
}

fn count_plain(v: &Obj) -> Obj {
    let n = match v.tag() {
        TAG_TABLE => v.as_list()[1].as_list().first().map(|c| c.len()).unwrap_or(0),
        t if t < 0 => 1,
        _ => v.len(),
    };
    Obj::i64(n as i64)
}

fn avg_plain(v: &Obj) -> Obj {
    let (sum, n) = match v.tag() {
        TAG_I64 => {
            let xs: Vec<i64> = v.as_i64s().iter().copied().filter(|&x| x != NULL_I64).collect();
            (xs.iter().sum::<i64>() as f64, xs.len())
        }
        TAG_F64 => {
            let xs: Vec<f64> = v.as_f64s().iter().copied().filter(|x| !x.is_nan()).collect();
            (xs.iter().sum::<f64>(), xs.len())
        }
        other => return error::err_type(TAG_F64, other, 0, 0),
    };
    Obj::f64(if n > 0 { sum / n as f64 } else { 0.0 })
}

fn minmax_plain(v: &Obj, want_min: bool) -> Obj {
    match v.tag() {
        TAG_I64 | TAG_SYM | TAG_TIMESTAMP => {
            let mut best: Option<i64> = None;
            for &x in v.as_i64s() {
                if x != NULL_I64 {
                    best = Some(match best {
                        None => x,
                        Some(b) => {
                            if want_min {
                                b.min(x)
                            } else {
                                b.max(x)
                            }
                        }
                    });
                }
            }
            Obj::i64(best.unwrap_or(NULL_I64))
        }
        TAG_F64 => {
            let mut best: Option<f64> = None;
            for &x in v.as_f64s() {
                if !x.is_nan() {
                    best = Some(match best {
                        None => x,
                        Some(b) => {
                            if want_min {
                                b.min(x)
                            } else {
                                b.max(x)
                            }
                        }
                    });
                }
            }
            Obj::f64(best.unwrap_or(NULL_F64))
        }
        other => error::err_type(TAG_I64, other, 0, 0),
    }
}

fn first_plain(v: &Obj) -> Obj {
    if v.tag() < 0 {
        return v.clone();
    }
    if v.is_empty() {
        return Obj::null();
    }
    v.at_idx(0)
}

fn last_plain(v: &Obj) -> Obj {
    if v.tag() < 0 {
        return v.clone();
    }
    if v.is_empty() {
        return Obj::null();
    }
    v.at_idx(v.len() - 1)
}

// ---------------------------------------------------------------------------
// Verb implementations
// ---------------------------------------------------------------------------

fn v_sum(x: Obj) -> Obj {
    agg_or(AggOp::Sum, x, sum_plain)
}

fn v_count(x: Obj) -> Obj {
    agg_or(AggOp::Count, x, count_plain)
}

fn v_avg(x: Obj) -> Obj {
    agg_or(AggOp::Avg, x, avg_plain)
}

fn v_min(x: Obj) -> Obj {
    agg_or(AggOp::Min, x, |v| minmax_plain(v, true))
}

fn v_max(x: Obj) -> Obj {
    agg_or(AggOp::Max, x, |v| minmax_plain(v, false))
}

fn v_first(x: Obj) -> Obj {
    agg_or(AggOp::First, x, first_plain)
}

fn v_last(x: Obj) -> Obj {
    agg_or(AggOp::Last, x, last_plain)
}

fn v_til(x: Obj) -> Obj {
    if x.tag() != -TAG_I64 || x.i64_val() < 0 {
        return error::err_type(-TAG_I64, x.tag(), 0, 0);
    }
    Obj::iota(x.i64_val() as usize)
}

fn v_where(x: Obj) -> Obj {
    let (v, _) = unwrap_view(x);
    if v.is_err() {
        return v;
    }
    filter::where_indices(&v)
}

fn v_asc(x: Obj) -> Obj {
    let (v, _) = unwrap_view(x);
    if v.is_err() {
        return v;
    }
    sort::asc(&v)
}

fn v_desc(x: Obj) -> Obj {
    let (v, _) = unwrap_view(x);
    if v.is_err() {
        return v;
    }
    sort::desc(&v)
}

fn v_select(x: Obj) -> Obj {
    query::select(&x)
}

fn v_at(x: Obj, ids: Obj) -> Obj {
    let (v, _) = unwrap_view(x);
    if v.is_err() {
        return v;
    }
    if ids.tag() != TAG_I64 {
        return error::err_type(TAG_I64, ids.tag(), 1, 0);
    }
    filter::at_ids(&v, ids.as_i64s())
}

fn v_table(names: Obj, cols: Obj) -> Obj {
    if cols.tag() != TAG_LIST {
        return error::err_type(TAG_LIST, cols.tag(), 1, 0);
    }
    Obj::table(names, cols)
}

fn v_list(args: &mut [Obj]) -> Obj {
    let items: Vec<Obj> = args.iter().cloned().collect();
    Obj::list_from(items)
}

fn v_lj(args: &mut [Obj]) -> Obj {
    if args.len() != 3 {
        return error::err_arity(3, args.len() as u8, 0);
    }
    join::left_join(&args[0], &args[1], &args[2])
}

fn v_ij(args: &mut [Obj]) -> Obj {
    if args.len() != 3 {
        return error::err_arity(3, args.len() as u8, 0);
    }
    join::inner_join(&args[0], &args[1], &args[2])
}

// ---------------------------------------------------------------------------
// Arithmetic and comparison with atom/vector broadcast
// ---------------------------------------------------------------------------

enum Num {
    I(i64),
    F(f64),
    Iv(Obj),
    Fv(Obj),
}

fn num_of(v: &Obj) -> Option<Num> {
    match v.tag() {
        t if t == -TAG_I64 => Some(Num::I(v.i64_val())),
        t if t == -TAG_F64 => Some(Num::F(v.f64_val())),
        TAG_I64 => Some(Num::Iv(v.clone())),
        TAG_F64 => Some(Num::Fv(v.clone())),
        _ => None,
    }
}

#[inline(always)]
fn add_i64(a: i64, b: i64) -> i64 {
    if a == NULL_I64 || b == NULL_I64 {
        NULL_I64
    } else {
        a.wrapping_add(b)
    }
}

fn v_add(a: Obj, b: Obj) -> Obj {
    let (a, _) = unwrap_view(a);
    let (b, _) = unwrap_view(b);
    if a.is_err() {
        return a;
    }
    if b.is_err() {
        return b;
    }
    let (Some(x), Some(y)) = (num_of(&a), num_of(&b)) else {
        return error::err_type(TAG_I64, if num_of(&a).is_none() { a.tag() } else { b.tag() }, 0, 0);
    };
    match (x, y) {
        (Num::I(p), Num::I(q)) => Obj::i64(add_i64(p, q)),
        (Num::F(p), Num::F(q)) => Obj::f64(p + q),
        (Num::I(p), Num::F(q)) => Obj::f64(p as f64 + q),
        (Num::F(p), Num::I(q)) => Obj::f64(p + q as f64),
        (Num::Iv(v), Num::I(s)) | (Num::I(s), Num::Iv(v)) => {
            let mut out = Obj::vector(TAG_I64, v.len());
            if !out.is_err() {
                for (o, &x) in out.as_i64s_mut().iter_mut().zip(v.as_i64s()) {
                    *o = add_i64(x, s);
                }
            }
            out
        }
        (Num::Fv(v), Num::F(s)) | (Num::F(s), Num::Fv(v)) => {
            let mut out = Obj::vector(TAG_F64, v.len());
            if !out.is_err() {
                for (o, &x) in out.as_f64s_mut().iter_mut().zip(v.as_f64s()) {
                    *o = x + s;
                }
            }
            out
        }
        (Num::Fv(v), Num::I(s)) | (Num::I(s), Num::Fv(v)) => {
            let mut out = Obj::vector(TAG_F64, v.len());
            if !out.is_err() {
                for (o, &x) in out.as_f64s_mut().iter_mut().zip(v.as_f64s()) {
                    *o = x + s as f64;
                }
            }
            out
        }
        (Num::Iv(v), Num::F(s)) | (Num::F(s), Num::Iv(v)) => {
            let mut out = Obj::vector(TAG_F64, v.len());
            if !out.is_err() {
                for (o, &x) in out.as_f64s_mut().iter_mut().zip(v.as_i64s()) {
                    *o = x as f64 + s;
                }
            }
            out
        }
        (Num::Iv(p), Num::Iv(q)) => {
            if p.len() != q.len() {
                return error::err_length(p.len() as i64, q.len() as i64, 0);
            }
            let mut out = Obj::vector(TAG_I64, p.len());
            if !out.is_err() {
                for ((o, &x), &y) in out.as_i64s_mut().iter_mut().zip(p.as_i64s()).zip(q.as_i64s())
                {
                    *o = add_i64(x, y);
                }
            }
            out
        }
        (Num::Fv(p), Num::Fv(q)) => {
            if p.len() != q.len() {
                return error::err_length(p.len() as i64, q.len() as i64, 0);
            }
            let mut out = Obj::vector(TAG_F64, p.len());
            if !out.is_err() {
                for ((o, &x), &y) in out.as_f64s_mut().iter_mut().zip(p.as_f64s()).zip(q.as_f64s())
                {
                    *o = x + y;
                }
            }
            out
        }
        (Num::Iv(p), Num::Fv(q)) | (Num::Fv(q), Num::Iv(p)) => {
            if p.len() != q.len() {
                return error::err_length(p.len() as i64, q.len() as i64, 0);
            }
            let mut out = Obj::vector(TAG_F64, p.len());
            if !out.is_err() {
                for ((o, &x), &y) in out.as_f64s_mut().iter_mut().zip(p.as_i64s()).zip(q.as_f64s())
                {
                    *o = x as f64 + y;
                }
            }
            out
        }
    }
}

/// Comparison producing a B8 mask, broadcasting atoms over vectors.
fn compare(a: &Obj, b: &Obj, op: fn(std::cmp::Ordering) -> bool) -> Obj {
    use std::cmp::Ordering;

    fn ord_i64(x: i64, y: i64) -> Ordering {
        x.cmp(&y)
    }

    // (vector, atom) comparisons over the i64- and i32-backed kinds.
    let (vec, atom, swapped) = if a.tag() > 0 && b.tag() < 0 {
        (a, b, false)
    } else if b.tag() > 0 && a.tag() < 0 {
        (b, a, true)
    } else if a.tag() < 0 && b.tag() < 0 {
        let c = crate::obj::obj_cmp(a, b);
        return Obj::b8(op(c));
    } else {
        // vector vs vector
        if a.len() != b.len() {
            return error::err_length(a.len() as i64, b.len() as i64, 0);
        }
        let n = a.len();
        let mut out = Obj::vector(TAG_B8, n);
        if out.is_err() {
            return out;
        }
        for i in 0..n {
            let (x, y) = (a.at_idx(i), b.at_idx(i));
            out.as_u8s_mut()[i] = op(crate::obj::obj_cmp(&x, &y)) as u8;
        }
        return out;
    };

    let n = vec.len();
    let mut out = Obj::vector(TAG_B8, n);
    if out.is_err() {
        return out;
    }
    let flip = |o: Ordering| if swapped { o.reverse() } else { o };
    match (vec.tag(), atom.tag()) {
        (TAG_I64 | TAG_SYM | TAG_TIMESTAMP, _) => {
            let s = atom.i64_val();
            for (o, &x) in out.as_u8s_mut().iter_mut().zip(vec.as_i64s()) {
                *o = op(flip(ord_i64(x, s))) as u8;
            }
        }
        (TAG_I32 | TAG_DATE | TAG_TIME, _) => {
            let s = atom.i32_val();
            for (o, &x) in out.as_u8s_mut().iter_mut().zip(vec.as_i32s()) {
                *o = op(flip(x.cmp(&s))) as u8;
            }
        }
        (TAG_F64, _) => {
            let s = atom.f64_val();
            for (o, &x) in out.as_u8s_mut().iter_mut().zip(vec.as_f64s()) {
                *o = op(flip(x.partial_cmp(&s).unwrap_or(Ordering::Less))) as u8;
            }
        }
        _ => {
            drop(out);
            return error::err_type(TAG_I64, vec.tag(), 0, 0);
        }
    }
    out
}

fn v_eq(a: Obj, b: Obj) -> Obj {
    let (a, _) = unwrap_view(a);
    let (b, _) = unwrap_view(b);
    if a.is_err() {
        return a;
    }
    if b.is_err() {
        return b;
    }
    compare(&a, &b, |o| o == std::cmp::Ordering::Equal)
}

fn v_gt(a: Obj, b: Obj) -> Obj {
    let (a, _) = unwrap_view(a);
    let (b, _) = unwrap_view(b);
    if a.is_err() {
        return a;
    }
    if b.is_err() {
        return b;
    }
    compare(&a, &b, |o| o == std::cmp::Ordering::Greater)
}

fn v_lt(a: Obj, b: Obj) -> Obj {
    let (a, _) = unwrap_view(a);
    let (b, _) = unwrap_view(b);
    if a.is_err() {
        return a;
    }
    if b.is_err() {
        return b;
    }
    compare(&a, &b, |o| o == std::cmp::Ordering::Less)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Bind the verb table into the current thread's environment.
pub fn install() {
    let unary: &[(&str, crate::obj::UnaryFn)] = &[
        ("sum", v_sum),
        ("count", v_count),
        ("avg", v_avg),
        ("min", v_min),
        ("max", v_max),
        ("first", v_first),
        ("last", v_last),
        ("til", v_til),
        ("where", v_where),
        ("asc", v_asc),
        ("desc", v_desc),
        ("select", v_select),
    ];
    for &(name, f) in unary {
        let sym = intern(name);
        vm::env_define(sym, Obj::unary(sym, f));
    }

    let binary: &[(&str, crate::obj::BinaryFn)] = &[
        ("+", v_add),
        ("==", v_eq),
        ("gt", v_gt),
        ("lt", v_lt),
        ("at", v_at),
        ("table", v_table),
    ];
    for &(name, f) in binary {
        let sym = intern(name);
        vm::env_define(sym, Obj::binary(sym, f));
    }

    let vary: &[(&str, crate::obj::VaryFn)] = &[("list", v_list), ("lj", v_lj), ("ij", v_ij)];
    for &(name, f) in vary {
        let sym = intern(name);
        vm::env_define(sym, Obj::vary(sym, f));
    }
}

/// Fetch an installed verb by name (test and embedding convenience).
pub fn lookup(name: &str) -> Obj {
    vm::env_lookup(intern(name)).unwrap_or_else(Obj::null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::eval;

    #[test]
    fn test_add_vector_scalar() {
        install();
        let expr = Obj::list_from(vec![lookup("+"), Obj::i64_vec(&[1, 2, 3]), Obj::i64(3)]);
        let v = eval(&expr);
        assert_eq!(v.as_i64s(), &[4, 5, 6]);
    }

    #[test]
    fn test_add_atoms() {
        install();
        let expr = Obj::list_from(vec![lookup("+"), Obj::i64(1), Obj::i64(2)]);
        assert_eq!(eval(&expr).i64_val(), 3);
    }

    #[test]
    fn test_sum_vector() {
        install();
        let expr = Obj::list_from(vec![lookup("sum"), Obj::i64_vec(&[1, 2, 3, 4, 5])]);
        assert_eq!(eval(&expr).i64_val(), 15);
    }

    #[test]
    fn test_count_til() {
        install();
        let inner = Obj::list_from(vec![lookup("til"), Obj::i64(100)]);
        let expr = Obj::list_from(vec![lookup("count"), inner]);
        assert_eq!(eval(&expr).i64_val(), 100);
    }

    #[test]
    fn test_eq_broadcast() {
        install();
        let mask = v_eq(Obj::i64_vec(&[1, 2, 1]), Obj::i64(1));
        assert_eq!(mask.as_u8s(), &[1, 0, 1]);
    }

    #[test]
    fn test_add_length_mismatch() {
        install();
        let v = v_add(Obj::i64_vec(&[1, 2]), Obj::i64_vec(&[1]));
        assert!(v.is_err());
    }

    #[test]
    fn test_null_propagates_through_add() {
        install();
        let v = v_add(Obj::i64_vec(&[1, NULL_I64]), Obj::i64(5));
        assert_eq!(v.as_i64s(), &[6, NULL_I64]);
    }
}
