//! Interned symbol table.
//!
//! Strings are interned once, process-wide, and travel as dense i64 ids.
//! The string→id direction is a chained hash table with lock-free insertion:
//! a new entry is allocated, then CASed onto its bucket head; losers rescan
//! the chain and adopt the winner's id. Lookups walk the chain without any
//! locking. The id→string spine is append-only behind a read-write lock.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

const BUCKETS: usize = 1 << 16;

struct Node {
    name: &'static str,
    id: i64,
    next: *mut Node,
}

static TABLE: Lazy<Vec<AtomicPtr<Node>>> =
    Lazy::new(|| (0..BUCKETS).map(|_| AtomicPtr::new(ptr::null_mut())).collect());

static SPINE: Lazy<RwLock<Vec<&'static str>>> = Lazy::new(|| RwLock::new(Vec::new()));

#[inline(always)]
fn bucket_of(s: &str) -> usize {
    // FNV-1a over the bytes; only the bucket index needs it.
    let mut h = 0xcbf29ce484222325u64;
    for &b in s.as_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h as usize) & (BUCKETS - 1)
}

/// Intern `s`, returning its id. Existing symbols are found without locking.
pub fn intern(s: &str) -> i64 {
    let bucket = &TABLE[bucket_of(s)];
    let mut head = bucket.load(Ordering::Acquire);

    let mut node = head;
    while !node.is_null() {
        unsafe {
            if (*node).name == s {
                return (*node).id;
            }
            node = (*node).next;
        }
    }

    // Not present: claim an id and publish a node.
    let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
    let id = {
        let mut spine = SPINE.write();
        spine.push(leaked);
        (spine.len() - 1) as i64
    };
    let new = Box::into_raw(Box::new(Node { name: leaked, id, next: head }));

    loop {
        unsafe { (*new).next = head };
        match bucket.compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return id,
            Err(h) => {
                // Someone moved the head; if they inserted our string, adopt
                // their id and discard ours.
                let mut node = h;
                while node != head {
                    unsafe {
                        if (*node).name == s {
                            drop(Box::from_raw(new));
                            return (*node).id;
                        }
                        node = (*node).next;
                    }
                }
                head = h;
            }
        }
    }
}

/// The interned string for `id`, if `id` was handed out by [`intern`].
pub fn str_of(id: i64) -> Option<String> {
    if id < 0 {
        return None;
    }
    SPINE.read().get(id as usize).map(|s| s.to_string())
}

/// Compare two symbols by their interned strings; nulls sort first.
pub fn cmp_syms(a: i64, b: i64) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;
    if a == b {
        return Equal;
    }
    match (str_of(a), str_of(b)) {
        (None, None) => Equal,
        (None, Some(_)) => Less,
        (Some(_), None) => Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

/// Number of interned symbols.
pub fn count() -> i64 {
    SPINE.read().len() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let a = intern("price");
        let b = intern("price");
        assert_eq!(a, b);
        assert_eq!(str_of(a).as_deref(), Some("price"));
    }

    #[test]
    fn test_distinct_symbols_distinct_ids() {
        let a = intern("bid");
        let b = intern("ask");
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_id() {
        assert_eq!(str_of(-1), None);
        assert_eq!(str_of(1 << 40), None);
    }

    #[test]
    fn test_concurrent_intern_agrees() {
        let names: Vec<String> = (0..64).map(|i| format!("con_sym_{}", i)).collect();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let names = names.clone();
            handles.push(std::thread::spawn(move || {
                names.iter().map(|n| intern(n)).collect::<Vec<_>>()
            }));
        }
        let results: Vec<Vec<i64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
    }
}
