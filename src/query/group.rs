//! Deferred grouping views.
//!
//! Grouping itself happens inside the fused aggregator; this module only
//! rewrites a table so every column carries a MAPGROUP marker pointing at
//! the group-key list stored in the query context. Projection expressions
//! that aggregate unwrap the marker; anything else touching a grouped
//! column is a domain error at materialisation time.

use crate::obj::{Obj, TAG_TABLE};

/// Wrap `val`'s columns (or `val` itself) in MAPGROUP over `groupby`.
pub fn group_map(val: &Obj, groupby: &Obj) -> Obj {
    if val.tag() == TAG_TABLE {
        let names = val.as_list()[0].clone();
        let cols = val.as_list()[1].as_list();
        let mut wrapped = Obj::list(cols.len());
        for (i, c) in cols.iter().enumerate() {
            wrapped.list_set(i, group_map(c, groupby));
        }
        return Obj::table(names, wrapped);
    }
    Obj::map_group(val.clone(), groupby.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::TAG_MAPGROUP;

    #[test]
    fn test_group_map_wraps_every_column() {
        let t = Obj::table(
            Obj::sym_vec_strs(&["k", "v"]),
            Obj::list_from(vec![Obj::i64_vec(&[1, 1, 2]), Obj::i64_vec(&[10, 20, 30])]),
        );
        let keys = Obj::list_from(vec![Obj::i64_vec(&[1, 1, 2])]);
        let g = group_map(&t, &keys);
        for col in g.as_list()[1].as_list() {
            assert_eq!(col.tag(), TAG_MAPGROUP);
        }
    }
}
