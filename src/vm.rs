//! Thread-local VM context.
//!
//! Every executor thread owns one [`Vm`]: its heap, the query-context stack,
//! the reusable error record and the `rc_sync` flag that switches reference
//! counting between plain and atomic read-modify-write. The main thread's VM
//! is created lazily on first use; worker threads install theirs explicitly
//! at startup and tear it down on exit.

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ErrRecord;
use crate::heap::Heap;
use crate::obj::Obj;

static NEXT_HEAP_ID: AtomicU32 = AtomicU32::new(0);

/// One frame of the query-context stack. Holds strong references so column
/// resolution can find the working table for the duration of a select.
pub struct QueryCtx {
    pub table: Obj,
    pub filter: Obj,
    pub groupby: Obj,
    pub take: Obj,
}

impl QueryCtx {
    pub fn new() -> Self {
        Self {
            table: Obj::null(),
            filter: Obj::null(),
            groupby: Obj::null(),
            take: Obj::null(),
        }
    }
}

impl Default for QueryCtx {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Vm {
    pub heap: Heap,
    pub err: ErrRecord,
    pub query_ctx: Vec<QueryCtx>,
    /// Named bindings visible to the evaluator on this thread.
    pub env: HashMap<i64, Obj>,
    /// Connection id of the request currently being evaluated (0 = none).
    pub user_fd: i64,
}

thread_local! {
    static VM_SLOT: Cell<*mut Vm> = const { Cell::new(ptr::null_mut()) };
    static RC_SYNC: Cell<bool> = const { Cell::new(false) };
}

fn vm_ptr() -> *mut Vm {
    VM_SLOT.with(|slot| {
        let mut p = slot.get();
        if p.is_null() {
            let id = NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed);
            let vm = Box::new(Vm {
                heap: Heap::new(id),
                err: ErrRecord::default(),
                query_ctx: Vec::new(),
                env: HashMap::new(),
                user_fd: 0,
            });
            p = Box::into_raw(vm);
            slot.set(p);
        }
        p
    })
}

/// Run `f` against the current thread's VM. Not reentrant: callers must not
/// invoke `with` (directly or through object clone/drop) from inside `f`
/// while holding borrows derived from `vm`.
#[inline]
pub(crate) fn with<R>(f: impl FnOnce(&mut Vm) -> R) -> R {
    unsafe { f(&mut *vm_ptr()) }
}

/// Create the VM for a worker thread. Returns the raw pointer the pool
/// publishes for borrow/merge access while the worker is quiescent.
pub fn install_worker() -> *mut Vm {
    let p = vm_ptr();
    set_rc_sync(true);
    p
}

/// Destroy the current thread's VM (worker shutdown).
pub fn teardown() {
    VM_SLOT.with(|slot| {
        let p = slot.get();
        if !p.is_null() {
            slot.set(ptr::null_mut());
            drop(unsafe { Box::from_raw(p) });
        }
    });
}

#[inline(always)]
pub fn rc_sync() -> bool {
    RC_SYNC.with(|c| c.get())
}

#[inline(always)]
pub fn set_rc_sync(on: bool) {
    RC_SYNC.with(|c| c.set(on));
}

#[inline(always)]
pub fn alloc(size: usize) -> *mut u8 {
    with(|vm| vm.heap.alloc(size))
}

#[inline(always)]
pub fn free(raw: *mut u8) {
    with(|vm| vm.heap.free(raw))
}

#[inline(always)]
pub fn realloc(raw: *mut u8, size: usize) -> *mut u8 {
    with(|vm| vm.heap.realloc(raw, size))
}

pub fn gc() -> i64 {
    with(|vm| {
        vm.heap.drain_foreign();
        vm.heap.gc()
    })
}

pub fn memstat() -> crate::heap::MemStat {
    with(|vm| vm.heap.memstat())
}

pub fn ctx_push(ctx: QueryCtx) {
    with(|vm| vm.query_ctx.push(ctx));
}

pub fn ctx_pop() -> Option<QueryCtx> {
    with(|vm| vm.query_ctx.pop())
}

/// Clone of the innermost context's working table, if any.
pub fn ctx_table() -> Option<Obj> {
    let raw = with(|vm| match vm.query_ctx.last() {
        Some(c) if !c.table.is_null() => Some(c.table.raw()),
        _ => None,
    });
    raw.map(|p| unsafe { Obj::clone_raw(p) })
}

/// Clone of the innermost context's group-key list, if grouping is active.
pub fn ctx_groupby() -> Option<Obj> {
    let raw = with(|vm| match vm.query_ctx.last() {
        Some(c) if !c.groupby.is_null() => Some(c.groupby.raw()),
        _ => None,
    });
    raw.map(|p| unsafe { Obj::clone_raw(p) })
}

/// Replace a field of the innermost query context. The previous value is
/// returned so the caller drops it outside the VM borrow.
pub fn ctx_set_table(table: Obj) {
    let old = with(|vm| {
        vm.query_ctx
            .last_mut()
            .map(|c| std::mem::replace(&mut c.table, table))
    });
    drop(old);
}

pub fn ctx_set_filter(filter: Obj) {
    let old = with(|vm| {
        vm.query_ctx
            .last_mut()
            .map(|c| std::mem::replace(&mut c.filter, filter))
    });
    drop(old);
}

pub fn ctx_set_groupby(groupby: Obj) {
    let old = with(|vm| {
        vm.query_ctx
            .last_mut()
            .map(|c| std::mem::replace(&mut c.groupby, groupby))
    });
    drop(old);
}

pub fn ctx_set_take(take: Obj) {
    let old = with(|vm| {
        vm.query_ctx
            .last_mut()
            .map(|c| std::mem::replace(&mut c.take, take))
    });
    drop(old);
}

/// Bind `sym` in the thread's evaluation environment.
pub fn env_define(sym: i64, val: Obj) {
    let old = with(|vm| vm.env.insert(sym, val));
    drop(old);
}

/// Clone of the binding for `sym`, if any.
pub fn env_lookup(sym: i64) -> Option<Obj> {
    let raw = with(|vm| vm.env.get(&sym).map(|o| o.raw()));
    raw.map(|p| unsafe { Obj::clone_raw(p) })
}

pub fn user_fd() -> i64 {
    with(|vm| vm.user_fd)
}

pub fn set_user_fd(fd: i64) {
    with(|vm| vm.user_fd = fd);
}
