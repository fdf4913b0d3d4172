//! Set operators over SYMBOL vectors, used by the select pipeline to derive
//! projection column sets and by the join to assemble output columns. All
//! three run on hash presence tests; result order follows the left operand.

use crate::error;
use crate::hash::{IdentitySeed, OaTable};
use crate::obj::{Obj, NULL_I64, TAG_SYM};

fn presence(v: &Obj) -> OaTable {
    let seed = IdentitySeed;
    let mut t = OaTable::new(v.len().max(8), false);
    for &id in v.as_i64s() {
        if id != NULL_I64 {
            t.insert(id, NULL_I64, &seed);
        }
    }
    t
}

fn check_sym(v: &Obj) -> Option<Obj> {
    if v.tag() != TAG_SYM {
        Some(error::err_type(TAG_SYM, v.tag(), 0, 0))
    } else {
        None
    }
}

/// Distinct symbols of `a` followed by symbols of `b` not in `a`.
pub fn union(a: &Obj, b: &Obj) -> Obj {
    if let Some(e) = check_sym(a).or_else(|| check_sym(b)) {
        return e;
    }
    let seed = IdentitySeed;
    let mut seen = OaTable::new(a.len() + b.len() + 8, false);
    let mut out = Obj::vector(TAG_SYM, 0);
    for &id in a.as_i64s().iter().chain(b.as_i64s()) {
        if seen.get(id, &seed) == NULL_I64 {
            seen.insert(id, NULL_I64, &seed);
            Obj::push_i64(&mut out, id);
        }
    }
    out
}

/// Symbols of `a` that do not occur in `b`, in `a`'s order.
pub fn except(a: &Obj, b: &Obj) -> Obj {
    if let Some(e) = check_sym(a).or_else(|| check_sym(b)) {
        return e;
    }
    let seed = IdentitySeed;
    let absent = presence(b);
    let mut out = Obj::vector(TAG_SYM, 0);
    for &id in a.as_i64s() {
        if absent.get(id, &seed) == NULL_I64 {
            Obj::push_i64(&mut out, id);
        }
    }
    out
}

/// Symbols occurring in both vectors, in `a`'s order.
pub fn sect(a: &Obj, b: &Obj) -> Obj {
    if let Some(e) = check_sym(a).or_else(|| check_sym(b)) {
        return e;
    }
    let seed = IdentitySeed;
    let present = presence(b);
    let mut out = Obj::vector(TAG_SYM, 0);
    for &id in a.as_i64s() {
        if present.get(id, &seed) != NULL_I64 {
            Obj::push_i64(&mut out, id);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::intern;

    fn syms(names: &[&str]) -> Obj {
        Obj::sym_vec_strs(names)
    }

    fn as_names(v: &Obj) -> Vec<String> {
        v.as_i64s()
            .iter()
            .map(|&id| crate::symbols::str_of(id).unwrap())
            .collect()
    }

    #[test]
    fn test_union() {
        let u = union(&syms(&["a", "b"]), &syms(&["b", "c"]));
        assert_eq!(as_names(&u), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_except() {
        let e = except(&syms(&["a", "b", "c"]), &syms(&["b"]));
        assert_eq!(as_names(&e), vec!["a", "c"]);
        let _ = intern("zz");
    }

    #[test]
    fn test_sect() {
        let s = sect(&syms(&["a", "b", "c"]), &syms(&["c", "a"]));
        assert_eq!(as_names(&s), vec!["a", "c"]);
    }
}
