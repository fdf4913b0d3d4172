//! End-to-end scenarios: parsed query trees through the evaluator, selects
//! over in-memory and parted tables, joins, IPC round-trips and heap
//! behaviour under churn.

use rayforce::eval::eval;
use rayforce::ipc::reactor::Reactor;
use rayforce::obj::{obj_eq, Obj, NULL_I64, TAG_TABLE};
use rayforce::query::{self, filter};
use rayforce::symbols::intern;
use rayforce::{storage, verbs, vm};

fn tree(parts: Vec<Obj>) -> Obj {
    Obj::list_from(parts)
}

fn sym(s: &str) -> Obj {
    Obj::sym(intern(s))
}

fn col_by_name(t: &Obj, name: &str) -> Obj {
    let id = intern(name);
    let names = t.as_list()[0].as_i64s();
    let pos = names.iter().position(|&n| n == id).unwrap();
    t.as_list()[1].as_list()[pos].clone()
}

#[test]
fn test_add_vector_scalar_tree() {
    verbs::install();
    let v = eval(&tree(vec![sym("+"), Obj::i64_vec(&[1, 2, 3]), Obj::i64(3)]));
    assert!(obj_eq(&v, &Obj::i64_vec(&[4, 5, 6])));
}

#[test]
fn test_sum_tree() {
    verbs::install();
    let v = eval(&tree(vec![sym("sum"), Obj::i64_vec(&[1, 2, 3, 4, 5])]));
    assert_eq!(v.i64_val(), 15);
}

#[test]
fn test_select_group_sum_tree() {
    verbs::install();
    // (select {from: (table [k v] (list [a a b b c] [1 2 3 4 5])) by: k s: (sum v)})
    let table_expr = tree(vec![
        sym("table"),
        Obj::sym_vec_strs(&["k", "v"]),
        tree(vec![
            sym("list"),
            Obj::sym_vec_strs(&["a", "a", "b", "b", "c"]),
            Obj::i64_vec(&[1, 2, 3, 4, 5]),
        ]),
    ]);
    let q = Obj::dict(
        Obj::sym_vec_strs(&["from", "by", "s"]),
        Obj::list_from(vec![
            table_expr,
            sym("k"),
            tree(vec![sym("sum"), sym("v")]),
        ]),
    );
    let r = eval(&tree(vec![sym("select"), q]));
    assert_eq!(r.tag(), TAG_TABLE);

    let keys = col_by_name(&r, "k");
    let sums = col_by_name(&r, "s");
    let mut pairs: Vec<(String, i64)> = keys
        .as_i64s()
        .iter()
        .map(|&id| rayforce::symbols::str_of(id).unwrap())
        .zip(sums.as_i64s().iter().copied())
        .collect();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            ("a".into(), 3),
            ("b".into(), 7),
            ("c".into(), 5)
        ]
    );
}

#[test]
fn test_parted_where_count() {
    verbs::install();
    let dir = tempfile::TempDir::new().unwrap();

    // Five partitions of 100 rows each.
    let days = ["2024.01.01", "2024.01.02", "2024.01.03", "2024.01.04", "2024.01.05"];
    for (p, day) in days.iter().enumerate() {
        let vals: Vec<i64> = (0..100).map(|i| (p * 100 + i) as i64).collect();
        let t = Obj::table(
            Obj::sym_vec_strs(&["v"]),
            Obj::list_from(vec![Obj::i64_vec(&vals)]),
        );
        storage::write_splayed(&dir.path().join(day), &t).unwrap();
    }

    let parted = storage::read_parted(dir.path()).unwrap();
    vm::env_define(intern("t"), parted);

    // (count (select {from: t where: (== Date 2024.01.01)}))
    let date = storage::parse_date("2024.01.01").unwrap();
    let q = Obj::dict(
        Obj::sym_vec_strs(&["from", "where"]),
        Obj::list_from(vec![
            sym("t"),
            tree(vec![sym("=="), sym("Date"), Obj::date(date)]),
        ]),
    );
    let r = eval(&tree(vec![sym("count"), tree(vec![sym("select"), q])]));
    assert_eq!(r.i64_val(), 100);
}

#[test]
fn test_inner_join_tree() {
    verbs::install();
    let trades = Obj::table(
        Obj::sym_vec_strs(&["sym", "px"]),
        Obj::list_from(vec![
            Obj::sym_vec_strs(&["AAPL", "GOOG", "MSFT"]),
            Obj::i64_vec(&[190, 170, 410]),
        ]),
    );
    let quotes = Obj::table(
        Obj::sym_vec_strs(&["sym", "bid"]),
        Obj::list_from(vec![
            Obj::sym_vec_strs(&["AAPL", "GOOG", "TSLA"]),
            Obj::i64_vec(&[189, 169, 250]),
        ]),
    );
    let r = eval(&tree(vec![
        sym("ij"),
        Obj::sym_vec_strs(&["sym"]),
        trades,
        quotes,
    ]));
    let syms = col_by_name(&r, "sym");
    let names: Vec<String> = syms
        .as_i64s()
        .iter()
        .map(|&id| rayforce::symbols::str_of(id).unwrap())
        .collect();
    assert_eq!(names, vec!["AAPL", "GOOG"]);
}

#[test]
fn test_left_join_keeps_left_values() {
    verbs::install();
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
    let out = eval(&tree(vec![sym("lj"), Obj::sym_vec_strs(&["sym"]), l, r]));
    let x = col_by_name(&out, "x");
    let y = col_by_name(&out, "y");
    assert_eq!(x.as_i64s(), &[1, 2, 3]);
    assert_eq!(y.as_i64s(), &[10, NULL_I64, 30]);
}

#[test]
fn test_ipc_idempotent_requests() {
    let (addr_tx, addr_rx) = std::sync::mpsc::channel();
    let server = std::thread::spawn(move || {
        verbs::install();
        // The identity verb stands in for a lambda; lambdas belong to the
        // external evaluator.
        let id_sym = intern("id");
        vm::env_define(id_sym, Obj::unary(id_sym, |x| x));
        let mut r = Reactor::new(Some(0)).unwrap();
        addr_tx
            .send((r.local_addr().unwrap(), r.shutdown_handle()))
            .unwrap();
        r.run()
    });
    let (addr, shutdown) = addr_rx.recv().unwrap();

    verbs::install();
    let mut client = Reactor::new(None).unwrap();
    let conn = client.connect(addr, None).unwrap();

    for _ in 0..3 {
        let resp = client
            .send_sync(conn, &tree(vec![sym("+"), Obj::i64(1), Obj::i64(2)]))
            .unwrap();
        assert_eq!(resp.i64_val(), 3);
    }

    let resp = client
        .send_sync(
            conn,
            &tree(vec![sym("count"), tree(vec![sym("til"), Obj::i64(100)])]),
        )
        .unwrap();
    assert_eq!(resp.i64_val(), 100);

    let resp = client
        .send_sync(conn, &tree(vec![sym("id"), Obj::string("abc")]))
        .unwrap();
    assert!(obj_eq(&resp, &Obj::string("abc")));

    shutdown.shutdown();
    assert_eq!(server.join().unwrap(), 0);
}

#[test]
fn test_heap_returns_to_baseline_after_churn() {
    // Warm up, then measure.
    vm::gc();
    let baseline = vm::memstat();

    let mut x = 0x9e3779b97f4a7c15u64;
    let mut live: Vec<Obj> = Vec::new();
    for round in 0..50 {
        for _ in 0..200 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let n = (x % 10_000) as usize + 1;
            live.push(Obj::vector(rayforce::obj::TAG_I64, n));
        }
        if round % 2 == 1 {
            live.clear();
        }
    }
    drop(live);
    vm::gc();
    let after = vm::memstat();
    assert_eq!(after.heap, baseline.heap);
}

#[test]
fn test_where_filter_collect_roundtrip() {
    verbs::install();
    let data = Obj::i64_vec(&[5, 1, 7, 3, 9]);
    let mask = eval(&tree(vec![sym("gt"), data.clone(), Obj::i64(4)]));
    let idx = filter::where_indices(&mask);
    assert_eq!(idx.as_i64s(), &[0, 2, 4]);
    let picked = filter::at_ids(&data, idx.as_i64s());
    assert_eq!(picked.as_i64s(), &[5, 7, 9]);
}

#[test]
fn test_select_then_sort_pipeline() {
    verbs::install();
    let t = Obj::table(
        Obj::sym_vec_strs(&["g", "v"]),
        Obj::list_from(vec![
            Obj::i64_vec(&[2, 1, 2, 1]),
            Obj::f64_vec(&[4.0, 3.0, 2.0, 1.0]),
        ]),
    );
    let q = Obj::dict(
        Obj::sym_vec_strs(&["from", "by", "m"]),
        Obj::list_from(vec![t, sym("g"), tree(vec![sym("max"), sym("v")])]),
    );
    let r = query::select(&q);
    let g = col_by_name(&r, "g");
    let m = col_by_name(&r, "m");
    // Perfect hash: groups in key order 1, 2.
    assert_eq!(g.as_i64s(), &[1, 2]);
    assert_eq!(m.as_f64s(), &[3.0, 4.0]);
}
