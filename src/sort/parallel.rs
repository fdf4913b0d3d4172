//! Pool-parallel counting and radix sorts.
//!
//! Both run the same three phases per digit: per-worker histograms, a serial
//! merge that turns histograms into per-worker scatter positions, then a
//! parallel scatter. Chunks are contiguous and workers write disjoint output
//! slots, so the scatter needs no synchronisation. The radix variant repeats
//! the phases per 16-bit digit, ping-ponging two index buffers.

use crate::obj::{Obj, TAG_I64};
use crate::pool::Pool;

use super::counting::{self, prefix};

struct HistCtx {
    keys: *const u64,
    order: *const i64,
    min: u64,
    chunk: i64,
    shift: u32,
    mask: u64,
    nbuckets: usize,
    hists: *mut i64,
}

struct ScatterCtx {
    keys: *const u64,
    order: *const i64,
    min: u64,
    chunk: i64,
    shift: u32,
    mask: u64,
    nbuckets: usize,
    positions: *mut i64,
    out: *mut i64,
}

#[inline(always)]
unsafe fn bucket_of(ctx_keys: *const u64, order: *const i64, i: i64, min: u64, shift: u32, mask: u64) -> (usize, i64) {
    let j = if order.is_null() { i } else { *order.add(i as usize) };
    let k = *ctx_keys.add(j as usize);
    ((((k - min) >> shift) & mask) as usize, j)
}

fn hist_worker(len: i64, offset: i64, ctx: *mut ()) -> Obj {
    let ctx = unsafe { &*(ctx as *const HistCtx) };
    let worker = (offset / ctx.chunk) as usize;
    unsafe {
        let hist = ctx.hists.add(worker * ctx.nbuckets);
        std::ptr::write_bytes(hist, 0, ctx.nbuckets);
        for i in offset..offset + len {
            let (b, _) = bucket_of(ctx.keys, ctx.order, i, ctx.min, ctx.shift, ctx.mask);
            *hist.add(b) += 1;
        }
    }
    Obj::null()
}

fn scatter_worker(len: i64, offset: i64, ctx: *mut ()) -> Obj {
    let ctx = unsafe { &*(ctx as *const ScatterCtx) };
    let worker = (offset / ctx.chunk) as usize;
    unsafe {
        let pos = ctx.positions.add(worker * ctx.nbuckets);
        for i in offset..offset + len {
            let (b, j) = bucket_of(ctx.keys, ctx.order, i, ctx.min, ctx.shift, ctx.mask);
            let p = pos.add(b);
            *ctx.out.add(*p as usize) = j;
            *p += 1;
        }
    }
    Obj::null()
}

fn add_chunks(pool: &Pool, fun: crate::pool::ChunkFn, len: i64, n: i64, chunk: i64, ctx: *mut ()) {
    pool.prepare();
    let mut offset = 0;
    for _ in 0..n - 1 {
        pool.add_task(fun, chunk, offset, ctx);
        offset += chunk;
    }
    pool.add_task(fun, len - offset, offset, ctx);
}

/// Turn merged per-worker histograms into per-worker scatter positions.
fn positions(hists: &mut [i64], n_workers: usize, nbuckets: usize, asc: bool) {
    let mut counts = vec![0i64; nbuckets];
    for w in 0..n_workers {
        for b in 0..nbuckets {
            counts[b] += hists[w * nbuckets + b];
        }
    }
    let mut pfx = vec![0i64; nbuckets];
    prefix(&counts, &mut pfx, asc);
    for b in 0..nbuckets {
        let mut pos = pfx[b];
        for w in 0..n_workers {
            let c = hists[w * nbuckets + b];
            hists[w * nbuckets + b] = pos;
            pos += c;
        }
    }
}

/// Parallel counting sort over pre-transformed keys; buckets are
/// `key - min`. Falls back to the serial range sort below the split
/// threshold.
pub fn parallel_counting(pool: &Pool, keys: &[u64], min: u64, nbuckets: usize, asc: bool) -> Obj {
    let len = keys.len() as i64;
    let n = pool.split_by(len, 0);
    if n <= 1 {
        return counting::counting_range(keys, min, nbuckets, asc);
    }
    let chunk = len / n;

    let mut out = Obj::vector(TAG_I64, keys.len());
    if out.is_err() {
        return out;
    }
    let mut hists = vec![0i64; n as usize * nbuckets];

    pool.run_session(|p| {
        let hist_ctx = HistCtx {
            keys: keys.as_ptr(),
            order: std::ptr::null(),
            min,
            chunk,
            shift: 0,
            mask: u64::MAX,
            nbuckets,
            hists: hists.as_mut_ptr(),
        };
        add_chunks(p, hist_worker, len, n, chunk, &hist_ctx as *const HistCtx as *mut ());
        drop(p.run());

        positions(&mut hists, n as usize, nbuckets, asc);

        let scatter_ctx = ScatterCtx {
            keys: keys.as_ptr(),
            order: std::ptr::null(),
            min,
            chunk,
            shift: 0,
            mask: u64::MAX,
            nbuckets,
            positions: hists.as_mut_ptr(),
            out: out.as_i64s_mut().as_mut_ptr(),
        };
        add_chunks(p, scatter_worker, len, n, chunk, &scatter_ctx as *const ScatterCtx as *mut ());
        drop(p.run());
    });

    out
}

/// Parallel 16-bit radix sort: `passes` digits, least significant first.
pub fn parallel_radix16(pool: &Pool, keys: &[u64], passes: usize, asc: bool) -> Obj {
    const NBUCKETS: usize = 65536;
    let len = keys.len() as i64;
    let n = pool.split_by(len, 0);
    if n <= 1 {
        return super::radix::radix16(keys, asc);
    }
    let chunk = len / n;

    let mut out = Obj::vector(TAG_I64, keys.len());
    if out.is_err() {
        return out;
    }

    let mut cur: Vec<i64> = (0..len).collect();
    let mut next: Vec<i64> = vec![0; keys.len()];
    let mut hists = vec![0i64; n as usize * NBUCKETS];

    pool.run_session(|p| {
        for pass in 0..passes {
            let shift = 16 * pass as u32;
            let hist_ctx = HistCtx {
                keys: keys.as_ptr(),
                order: cur.as_ptr(),
                min: 0,
                chunk,
                shift,
                mask: 0xFFFF,
                nbuckets: NBUCKETS,
                hists: hists.as_mut_ptr(),
            };
            add_chunks(p, hist_worker, len, n, chunk, &hist_ctx as *const HistCtx as *mut ());
            drop(p.run());

            positions(&mut hists, n as usize, NBUCKETS, asc);

            let scatter_ctx = ScatterCtx {
                keys: keys.as_ptr(),
                order: cur.as_ptr(),
                min: 0,
                chunk,
                shift,
                mask: 0xFFFF,
                nbuckets: NBUCKETS,
                positions: hists.as_mut_ptr(),
                out: next.as_mut_ptr(),
            };
            add_chunks(p, scatter_worker, len, n, chunk, &scatter_ctx as *const ScatterCtx as *mut ());
            drop(p.run());

            std::mem::swap(&mut cur, &mut next);
        }
    });

    out.as_i64s_mut().copy_from_slice(&cur);
    out
}
