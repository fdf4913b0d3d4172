//! Value-tree evaluation interface.
//!
//! The S-expression tokenizer, parser and full evaluator live outside the
//! core; what the runtime consumes is already-parsed value trees. This
//! module is that consumption surface: atoms evaluate to themselves, a
//! symbol resolves first against the active query context's columns and
//! then against the thread's environment, and a LIST whose head evaluates
//! to a host function applies it to the evaluated tail. Anything richer
//! (lambdas with environments, control forms) belongs to the external
//! evaluator and comes back NYI here.

use crate::error;
use crate::obj::{Obj, TAG_BINARY, TAG_LAMBDA, TAG_LIST, TAG_SYM, TAG_UNARY, TAG_VARY};
use crate::vm;

/// Resolve a symbol: innermost query-context column first, then the
/// thread environment.
pub fn resolve(sym: i64) -> Option<Obj> {
    if let Some(table) = vm::ctx_table() {
        let names = table.as_list()[0].as_i64s();
        if let Some(pos) = names.iter().position(|&n| n == sym) {
            return Some(table.as_list()[1].as_list()[pos].clone());
        }
    }
    vm::env_lookup(sym)
}

/// Apply a host function object to owned arguments.
pub fn apply(f: &Obj, mut args: Vec<Obj>) -> Obj {
    match f.tag() {
        TAG_UNARY => {
            if args.len() != 1 {
                return error::err_arity(1, args.len() as u8, 0);
            }
            (f.unary_fn())(args.pop().unwrap())
        }
        TAG_BINARY => {
            if args.len() != 2 {
                return error::err_arity(2, args.len() as u8, 0);
            }
            let b = args.pop().unwrap();
            let a = args.pop().unwrap();
            (f.binary_fn())(a, b)
        }
        TAG_VARY => (f.vary_fn())(&mut args),
        TAG_LAMBDA => error::err_nyi(TAG_LAMBDA),
        other => error::err_type(TAG_UNARY, other, 0, 0),
    }
}

/// Evaluate a parsed value tree.
pub fn eval(expr: &Obj) -> Obj {
    let tag = expr.tag();

    if tag == -TAG_SYM {
        return match resolve(expr.sym_val()) {
            Some(v) => v,
            None => error::err_value(expr.sym_val()),
        };
    }
    if tag < 0 {
        return expr.clone();
    }

    if tag == TAG_LIST && !expr.is_empty() {
        let head = eval(&expr.as_list()[0]);
        if head.is_err() {
            return head;
        }
        if matches!(head.tag(), TAG_UNARY | TAG_BINARY | TAG_VARY | TAG_LAMBDA) {
            let mut args = Vec::with_capacity(expr.len() - 1);
            for item in &expr.as_list()[1..] {
                let v = eval(item);
                if v.is_err() {
                    return v;
                }
                args.push(v);
            }
            return apply(&head, args);
        }
    }

    // Vectors, dicts, tables and function values are self-evaluating.
    expr.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::intern;

    fn double(x: Obj) -> Obj {
        Obj::i64(x.i64_val() * 2)
    }

    #[test]
    fn test_atoms_self_evaluate() {
        let v = eval(&Obj::i64(7));
        assert_eq!(v.i64_val(), 7);
    }

    #[test]
    fn test_symbol_resolves_env() {
        let sym = intern("eval_test_binding");
        vm::env_define(sym, Obj::i64(99));
        let v = eval(&Obj::sym(sym));
        assert_eq!(v.i64_val(), 99);
    }

    #[test]
    fn test_unknown_symbol_is_value_error() {
        let v = eval(&Obj::sym(intern("no_such_binding_xyz")));
        assert!(v.is_err());
    }

    #[test]
    fn test_application() {
        let f = Obj::unary(intern("dbl"), double);
        let expr = Obj::list_from(vec![f, Obj::i64(21)]);
        let v = eval(&expr);
        assert_eq!(v.i64_val(), 42);
    }

    #[test]
    fn test_arity_error() {
        let f = Obj::unary(intern("dbl"), double);
        let expr = Obj::list_from(vec![f, Obj::i64(1), Obj::i64(2)]);
        assert!(eval(&expr).is_err());
    }
}
