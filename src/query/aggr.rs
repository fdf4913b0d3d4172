//! Fused hash-aggregate.
//!
//! Grouping and aggregation happen in a single pass over the rows. The
//! strategy is chosen once per (key columns, row count) pair, so every
//! aggregation in one select sees the same group ids in the same order:
//!
//! * **Perfect hash**: one key column of I64/SYMBOL whose observed range
//!   fits [`PERFECT_HASH_THRESHOLD`]: `key - min` indexes the state arrays
//!   directly, groups emerge in key order. The sum loop is unrolled 4× with
//!   branchless null handling.
//! * **Composite table**: packed (salt, group-id) cells probe linearly;
//!   the 16-bit salt rejects most mismatches before the key columns are
//!   compared against the group's representative row. Parallel state arrays
//!   indexed by group id hold every aggregate, plus the full hash for
//!   rehash and merge without recomputation.
//! * **Parallel**: above [`PARALLEL_AGG_THRESHOLD`] rows, chunks build
//!   per-worker tables which are then merged through the stored hashes.
//!   Workers are capped to bound merge cost.

use crate::error;
use crate::hash::{mix, salt_of, AggCell, HASH_INIT};
use crate::obj::{Obj, NULL_F64, NULL_I64, TAG_B8, TAG_DATE, TAG_F64, TAG_I16, TAG_I32, TAG_I64,
    TAG_SYM, TAG_TIME, TAG_TIMESTAMP, TAG_U8};
use crate::pool;
use crate::sort::scope;
use crate::vm;

pub const PERFECT_HASH_THRESHOLD: i64 = 65_536;
const INITIAL_HT_CAPACITY: usize = 4096;
pub const PARALLEL_AGG_THRESHOLD: usize = 100_000;
const MAX_AGG_WORKERS: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggOp {
    Sum,
    Count,
    Avg,
    Min,
    Max,
    First,
    Last,
}

// ---------------------------------------------------------------------------
// Key column views
// ---------------------------------------------------------------------------

enum KeyCol<'a> {
    I64(&'a [i64]),
    I32(&'a [i32]),
    I16(&'a [i16]),
    U8(&'a [u8]),
    F64(&'a [f64]),
}

fn key_cols(keys: &Obj) -> Result<Vec<KeyCol<'_>>, Obj> {
    let mut out = Vec::with_capacity(keys.len());
    for col in keys.as_list() {
        out.push(match col.tag() {
            TAG_I64 | TAG_SYM | TAG_TIMESTAMP => KeyCol::I64(col.as_i64s()),
            TAG_I32 | TAG_DATE | TAG_TIME => KeyCol::I32(col.as_i32s()),
            TAG_I16 => KeyCol::I16(col.as_i16s()),
            TAG_B8 | TAG_U8 => KeyCol::U8(col.as_u8s()),
            TAG_F64 => KeyCol::F64(col.as_f64s()),
            other => return Err(error::err_type(TAG_I64, other, 0, 0)),
        });
    }
    Ok(out)
}

#[inline(always)]
fn composite_hash(cols: &[KeyCol<'_>], row: usize) -> u64 {
    let mut h = HASH_INIT;
    for col in cols {
        let k = match col {
            KeyCol::I64(v) => v[row] as u64,
            KeyCol::I32(v) => v[row] as u64,
            KeyCol::I16(v) => v[row] as u64,
            KeyCol::U8(v) => v[row] as u64,
            KeyCol::F64(v) => v[row].to_bits(),
        };
        h = mix(h, k);
    }
    h
}

#[inline(always)]
fn keys_equal(cols: &[KeyCol<'_>], a: usize, b: usize) -> bool {
    for col in cols {
        let eq = match col {
            KeyCol::I64(v) => v[a] == v[b],
            KeyCol::I32(v) => v[a] == v[b],
            KeyCol::I16(v) => v[a] == v[b],
            KeyCol::U8(v) => v[a] == v[b],
            KeyCol::F64(v) => v[a].to_bits() == v[b].to_bits(),
        };
        if !eq {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Local aggregate table
// ---------------------------------------------------------------------------

struct LocalAgg {
    cells: Vec<AggCell>,
    mask: usize,
    sums_i64: Vec<i64>,
    sums_f64: Vec<f64>,
    counts: Vec<i64>,
    mins_i64: Vec<i64>,
    maxs_i64: Vec<i64>,
    mins_f64: Vec<f64>,
    maxs_f64: Vec<f64>,
    first_rows: Vec<i64>,
    last_rows: Vec<i64>,
    hashes: Vec<u64>,
}

impl LocalAgg {
    fn new(capacity: usize) -> Self {
        let cap = capacity.next_power_of_two().max(16);
        Self {
            cells: vec![AggCell::empty(); cap],
            mask: cap - 1,
            sums_i64: Vec::new(),
            sums_f64: Vec::new(),
            counts: Vec::new(),
            mins_i64: Vec::new(),
            maxs_i64: Vec::new(),
            mins_f64: Vec::new(),
            maxs_f64: Vec::new(),
            first_rows: Vec::new(),
            last_rows: Vec::new(),
            hashes: Vec::new(),
        }
    }

    fn groups(&self) -> usize {
        self.hashes.len()
    }

    fn resize(&mut self) {
        let cap = self.cells.len() * 2;
        let mut cells = vec![AggCell::empty(); cap];
        let mask = cap - 1;
        for cell in &self.cells {
            if !cell.is_empty() {
                let gid = cell.group_id();
                let h = self.hashes[gid as usize];
                let mut idx = h as usize & mask;
                while !cells[idx].is_empty() {
                    idx = (idx + 1) & mask;
                }
                cells[idx] = AggCell::new(salt_of(h), gid);
            }
        }
        self.cells = cells;
        self.mask = mask;
    }

    #[inline]
    fn find_or_create(&mut self, cols: &[KeyCol<'_>], row: usize, hash: u64) -> u32 {
        let salt = salt_of(hash);
        let mut idx = hash as usize & self.mask;
        loop {
            let cell = self.cells[idx];
            if cell.is_empty() {
                if (self.groups() + 1) * 10 > self.cells.len() * 7 {
                    self.resize();
                    return self.find_or_create(cols, row, hash);
                }
                let gid = self.groups() as u32;
                self.cells[idx] = AggCell::new(salt, gid);
                self.sums_i64.push(0);
                self.sums_f64.push(0.0);
                self.counts.push(0);
                self.mins_i64.push(i64::MAX);
                self.maxs_i64.push(i64::MIN);
                self.mins_f64.push(f64::MAX);
                self.maxs_f64.push(-f64::MAX);
                self.first_rows.push(row as i64);
                self.last_rows.push(row as i64);
                self.hashes.push(hash);
                return gid;
            }
            if cell.salt() == salt {
                let gid = cell.group_id();
                let rep = self.first_rows[gid as usize] as usize;
                if keys_equal(cols, rep, row) {
                    self.last_rows[gid as usize] = row as i64;
                    return gid;
                }
            }
            idx = (idx + 1) & self.mask;
        }
    }
}

// ---------------------------------------------------------------------------
// Value column views and state updates
// ---------------------------------------------------------------------------

enum ValCol<'a> {
    I64(&'a [i64]),
    I32(&'a [i32]),
    F64(&'a [f64]),
}

fn val_col(val: &Obj) -> Option<ValCol<'_>> {
    match val.tag() {
        TAG_I64 | TAG_SYM | TAG_TIMESTAMP => Some(ValCol::I64(val.as_i64s())),
        TAG_I32 | TAG_DATE | TAG_TIME => Some(ValCol::I32(val.as_i32s())),
        TAG_F64 => Some(ValCol::F64(val.as_f64s())),
        _ => None,
    }
}

#[inline(always)]
fn update(agg: &mut LocalAgg, gid: usize, col: &ValCol<'_>, row: usize) {
    match col {
        ValCol::I64(v) => {
            let x = v[row];
            if x != NULL_I64 {
                agg.sums_i64[gid] += x;
                agg.counts[gid] += 1;
                if x < agg.mins_i64[gid] {
                    agg.mins_i64[gid] = x;
                }
                if x > agg.maxs_i64[gid] {
                    agg.maxs_i64[gid] = x;
                }
            }
        }
        ValCol::I32(v) => {
            let x = v[row];
            if x != crate::obj::NULL_I32 {
                let x = x as i64;
                agg.sums_i64[gid] += x;
                agg.counts[gid] += 1;
                if x < agg.mins_i64[gid] {
                    agg.mins_i64[gid] = x;
                }
                if x > agg.maxs_i64[gid] {
                    agg.maxs_i64[gid] = x;
                }
            }
        }
        ValCol::F64(v) => {
            let x = v[row];
            if !x.is_nan() {
                agg.sums_f64[gid] += x;
                agg.counts[gid] += 1;
                if x < agg.mins_f64[gid] {
                    agg.mins_f64[gid] = x;
                }
                if x > agg.maxs_f64[gid] {
                    agg.maxs_f64[gid] = x;
                }
            }
        }
    }
}

/// Build the per-op output vector from accumulated group state. `rows_total`
/// per group (row occupancy, not non-null count) backs Count.
fn extract(op: AggOp, agg: &LocalAgg, rows_per_group: &[i64], val: &Obj) -> Obj {
    let n = agg.groups();
    let float = matches!(val.tag(), TAG_F64);
    match op {
        AggOp::Sum => {
            if float {
                let mut out = Obj::vector(TAG_F64, n);
                if !out.is_err() {
                    out.as_f64s_mut().copy_from_slice(&agg.sums_f64);
                }
                out
            } else {
                let mut out = Obj::vector(TAG_I64, n);
                if !out.is_err() {
                    out.as_i64s_mut().copy_from_slice(&agg.sums_i64);
                }
                out
            }
        }
        AggOp::Count => {
            let mut out = Obj::vector(TAG_I64, n);
            if !out.is_err() {
                out.as_i64s_mut().copy_from_slice(rows_per_group);
            }
            out
        }
        AggOp::Avg => {
            let mut out = Obj::vector(TAG_F64, n);
            if !out.is_err() {
                let ov = out.as_f64s_mut();
                for g in 0..n {
                    ov[g] = if agg.counts[g] > 0 {
                        let sum = if float { agg.sums_f64[g] } else { agg.sums_i64[g] as f64 };
                        sum / agg.counts[g] as f64
                    } else {
                        0.0
                    };
                }
            }
            out
        }
        AggOp::Min | AggOp::Max => {
            if float {
                let mut out = Obj::vector(TAG_F64, n);
                if !out.is_err() {
                    let ov = out.as_f64s_mut();
                    for g in 0..n {
                        ov[g] = if agg.counts[g] == 0 {
                            NULL_F64
                        } else if op == AggOp::Min {
                            agg.mins_f64[g]
                        } else {
                            agg.maxs_f64[g]
                        };
                    }
                }
                out
            } else {
                let tag = val.tag();
                let mut out = Obj::vector(tag, n);
                if out.is_err() {
                    return out;
                }
                for g in 0..n {
                    let x = if agg.counts[g] == 0 {
                        NULL_I64
                    } else if op == AggOp::Min {
                        agg.mins_i64[g]
                    } else {
                        agg.maxs_i64[g]
                    };
                    match tag {
                        TAG_I32 | TAG_DATE | TAG_TIME => {
                            out.as_i32s_mut()[g] =
                                if x == NULL_I64 { crate::obj::NULL_I32 } else { x as i32 }
                        }
                        _ => out.as_i64s_mut()[g] = x,
                    }
                }
                out
            }
        }
        AggOp::First => super::filter::at_ids(val, &agg.first_rows),
        AggOp::Last => super::filter::at_ids(val, &agg.last_rows),
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

enum Strategy {
    Perfect { min: i64, range: usize },
    Serial,
    Parallel { workers: i64 },
}

fn choose_strategy(keys: &Obj, nrows: usize) -> Strategy {
    if keys.len() == 1 {
        let k = &keys.as_list()[0];
        if matches!(k.tag(), TAG_I64 | TAG_SYM) {
            let sc = scope(k.as_i64s());
            if sc.nulls == 0 && sc.max >= sc.min {
                let range = sc.max - sc.min + 1;
                if range > 0 && range <= PERFECT_HASH_THRESHOLD {
                    return Strategy::Perfect { min: sc.min, range: range as usize };
                }
            }
        }
    }
    if nrows >= PARALLEL_AGG_THRESHOLD {
        let pool = pool::global();
        let workers = pool.split_by(nrows as i64, 0).min(MAX_AGG_WORKERS);
        if workers > 1 {
            return Strategy::Parallel { workers };
        }
    }
    Strategy::Serial
}

// ---------------------------------------------------------------------------
// Perfect hash path
// ---------------------------------------------------------------------------

fn perfect_agg(op: AggOp, key: &Obj, val: &Obj, min: i64, range: usize) -> Obj {
    let keys = key.as_i64s();
    let nrows = keys.len();

    let mut agg = LocalAgg::new(16);
    agg.sums_i64 = vec![0; range];
    agg.sums_f64 = vec![0.0; range];
    agg.counts = vec![0; range];
    agg.mins_i64 = vec![i64::MAX; range];
    agg.maxs_i64 = vec![i64::MIN; range];
    agg.mins_f64 = vec![f64::MAX; range];
    agg.maxs_f64 = vec![-f64::MAX; range];
    agg.first_rows = vec![-1; range];
    agg.last_rows = vec![-1; range];
    agg.hashes = vec![0; range];
    let mut rows = vec![0i64; range];

    // Non-numeric columns still group for first/last: occupancy tracking
    // alone determines the gathered rows.
    let Some(col) = val_col(val) else {
        if matches!(op, AggOp::First | AggOp::Last) {
            for (row, &k) in keys.iter().enumerate() {
                let idx = (k - min) as usize;
                if agg.first_rows[idx] < 0 {
                    agg.first_rows[idx] = row as i64;
                }
                agg.last_rows[idx] = row as i64;
            }
            let rows_src = if op == AggOp::First { &agg.first_rows } else { &agg.last_rows };
            let occupied: Vec<i64> = rows_src.iter().copied().filter(|&r| r >= 0).collect();
            return super::filter::at_ids(val, &occupied);
        }
        return error::err_type(TAG_I64, val.tag(), 0, 0);
    };

    // The sum kernel carries the occupancy bookkeeping for all ops; it is
    // unrolled 4x and the null checks inside `update` compile to selects.
    let mut i = 0usize;
    while i + 4 <= nrows {
        for lane in 0..4 {
            let row = i + lane;
            let idx = (keys[row] - min) as usize;
            if agg.first_rows[idx] < 0 {
                agg.first_rows[idx] = row as i64;
            }
            agg.last_rows[idx] = row as i64;
            rows[idx] += 1;
            update(&mut agg, idx, &col, row);
        }
        i += 4;
    }
    while i < nrows {
        let idx = (keys[i] - min) as usize;
        if agg.first_rows[idx] < 0 {
            agg.first_rows[idx] = i as i64;
        }
        agg.last_rows[idx] = i as i64;
        rows[idx] += 1;
        update(&mut agg, idx, &col, i);
        i += 1;
    }

    // Compact occupied buckets in key order.
    let mut packed = LocalAgg::new(16);
    let mut packed_rows = Vec::new();
    for b in 0..range {
        if agg.first_rows[b] >= 0 {
            packed.sums_i64.push(agg.sums_i64[b]);
            packed.sums_f64.push(agg.sums_f64[b]);
            packed.counts.push(agg.counts[b]);
            packed.mins_i64.push(agg.mins_i64[b]);
            packed.maxs_i64.push(agg.maxs_i64[b]);
            packed.mins_f64.push(agg.mins_f64[b]);
            packed.maxs_f64.push(agg.maxs_f64[b]);
            packed.first_rows.push(agg.first_rows[b]);
            packed.last_rows.push(agg.last_rows[b]);
            packed.hashes.push(0);
            packed_rows.push(rows[b]);
        }
    }
    extract(op, &packed, &packed_rows, val)
}

// ---------------------------------------------------------------------------
// Serial composite path
// ---------------------------------------------------------------------------

fn serial_agg(op: AggOp, keys: &Obj, val: &Obj) -> Obj {
    let cols = match key_cols(keys) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(col) = val_col(val) else {
        // first/last work for any gatherable type.
        if matches!(op, AggOp::First | AggOp::Last) {
            return serial_rows_only(op, keys, val);
        }
        return error::err_type(TAG_I64, val.tag(), 0, 0);
    };
    let nrows = val.len();

    let mut agg = LocalAgg::new(INITIAL_HT_CAPACITY);
    let mut rows: Vec<i64> = Vec::new();
    for row in 0..nrows {
        let h = composite_hash(&cols, row);
        let gid = agg.find_or_create(&cols, row, h) as usize;
        if gid == rows.len() {
            rows.push(0);
        }
        rows[gid] += 1;
        update(&mut agg, gid, &col, row);
    }
    extract(op, &agg, &rows, val)
}

/// Group discovery alone, for first/last over non-numeric columns.
fn serial_rows_only(op: AggOp, keys: &Obj, val: &Obj) -> Obj {
    let cols = match key_cols(keys) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let nrows = keys.as_list()[0].len();
    let mut agg = LocalAgg::new(INITIAL_HT_CAPACITY);
    for row in 0..nrows {
        let h = composite_hash(&cols, row);
        agg.find_or_create(&cols, row, h);
    }
    match op {
        AggOp::First => super::filter::at_ids(val, &agg.first_rows),
        _ => super::filter::at_ids(val, &agg.last_rows),
    }
}

// ---------------------------------------------------------------------------
// Parallel path
// ---------------------------------------------------------------------------

struct ParCtx {
    keys: *const Obj,
    val: *const Obj,
    chunk: i64,
    aggs: *mut LocalAgg,
    rows: *mut Vec<i64>,
}

fn parallel_worker(len: i64, offset: i64, ctx: *mut ()) -> Obj {
    let ctx = unsafe { &*(ctx as *const ParCtx) };
    let keys = unsafe { &*ctx.keys };
    let val = unsafe { &*ctx.val };
    let worker = (offset / ctx.chunk) as usize;
    let agg = unsafe { &mut *ctx.aggs.add(worker) };
    let rows = unsafe { &mut *ctx.rows.add(worker) };

    let cols = match key_cols(keys) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(col) = val_col(val) else {
        return error::err_type(TAG_I64, val.tag(), 0, 0);
    };

    for row in offset..offset + len {
        let row = row as usize;
        let h = composite_hash(&cols, row);
        let gid = agg.find_or_create(&cols, row, h) as usize;
        if gid == rows.len() {
            rows.push(0);
        }
        rows[gid] += 1;
        update(agg, gid, &col, row);
    }
    Obj::null()
}

fn parallel_agg(op: AggOp, keys: &Obj, val: &Obj, workers: i64) -> Obj {
    let nrows = val.len() as i64;
    let chunk = pool::Pool::chunk_aligned(nrows, workers, 8);
    // Alignment can absorb the tail chunk entirely; shrink the worker count
    // to the chunks that actually exist.
    let workers = ((nrows + chunk - 1) / chunk).max(1);
    if workers <= 1 {
        return serial_agg(op, keys, val);
    }

    let mut aggs: Vec<LocalAgg> = (0..workers).map(|_| LocalAgg::new(INITIAL_HT_CAPACITY)).collect();
    let mut rows: Vec<Vec<i64>> = (0..workers).map(|_| Vec::new()).collect();

    let ctx = ParCtx {
        keys: keys as *const Obj,
        val: val as *const Obj,
        chunk,
        aggs: aggs.as_mut_ptr(),
        rows: rows.as_mut_ptr(),
    };

    let pool = pool::global();
    let res = pool.run_session(|p| {
        p.prepare();
        let mut offset = 0;
        for _ in 0..workers - 1 {
            p.add_task(parallel_worker, chunk, offset, &ctx as *const ParCtx as *mut ());
            offset += chunk;
        }
        p.add_task(parallel_worker, nrows - offset, offset, &ctx as *const ParCtx as *mut ());
        p.run()
    });
    if res.is_err() {
        return res;
    }
    drop(res);

    // Merge per-worker tables through the stored hashes: the group's
    // representative row in its worker indexes the shared key columns, so
    // no key bytes are recomputed.
    let cols = match key_cols(keys) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut merged = LocalAgg::new(INITIAL_HT_CAPACITY * workers as usize);
    let mut merged_rows: Vec<i64> = Vec::new();
    for (w, agg) in aggs.iter().enumerate() {
        for g in 0..agg.groups() {
            let h = agg.hashes[g];
            let rep = agg.first_rows[g] as usize;
            let gid = merged.find_or_create(&cols, rep, h) as usize;
            if gid == merged_rows.len() {
                merged_rows.push(0);
                // A fresh merged group adopts the worker's extrema wholesale.
                merged.first_rows[gid] = agg.first_rows[g];
                merged.last_rows[gid] = agg.last_rows[g];
            } else {
                merged.first_rows[gid] = merged.first_rows[gid].min(agg.first_rows[g]);
                merged.last_rows[gid] = merged.last_rows[gid].max(agg.last_rows[g]);
            }
            merged_rows[gid] += rows[w][g];
            merged.sums_i64[gid] += agg.sums_i64[g];
            merged.sums_f64[gid] += agg.sums_f64[g];
            merged.counts[gid] += agg.counts[g];
            merged.mins_i64[gid] = merged.mins_i64[gid].min(agg.mins_i64[g]);
            merged.maxs_i64[gid] = merged.maxs_i64[gid].max(agg.maxs_i64[g]);
            merged.mins_f64[gid] = merged.mins_f64[gid].min(agg.mins_f64[g]);
            merged.maxs_f64[gid] = merged.maxs_f64[gid].max(agg.maxs_f64[g]);
        }
    }
    extract(op, &merged, &merged_rows, val)
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Aggregate `val` over the group keys stored in the active query context.
pub fn aggregate(op: AggOp, val: &Obj) -> Obj {
    let Some(keys) = vm::ctx_groupby() else {
        return error::err_domain(0, 0);
    };
    aggregate_with_keys(op, &keys, val)
}

/// Aggregate with explicit key columns (a LIST of equal-length vectors).
pub fn aggregate_with_keys(op: AggOp, keys: &Obj, val: &Obj) -> Obj {
    let nrows = val.len();
    if keys.is_empty() {
        return error::err_domain(0, 0);
    }
    for k in keys.as_list() {
        if k.len() != nrows {
            return error::err_length(k.len() as i64, nrows as i64, 0);
        }
    }
    if nrows == 0 {
        return match op {
            AggOp::Count => Obj::vector(TAG_I64, 0),
            AggOp::Avg => Obj::vector(TAG_F64, 0),
            _ => Obj::vector(val.tag(), 0),
        };
    }

    match choose_strategy(keys, nrows) {
        Strategy::Perfect { min, range } => {
            let key = &keys.as_list()[0];
            perfect_agg(op, key, val, min, range)
        }
        Strategy::Serial => serial_agg(op, keys, val),
        Strategy::Parallel { workers } => parallel_agg(op, keys, val, workers),
    }
}

/// Per-group values of one key column, aligned with every aggregate of the
/// same select (the strategy choice is shared).
pub fn group_keys(keys: &Obj, key_col: &Obj) -> Obj {
    aggregate_with_keys(AggOp::First, keys, key_col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;

    fn keys_of(v: Obj) -> Obj {
        Obj::list_from(vec![v])
    }

    #[test]
    fn test_perfect_sum() {
        let k = Obj::i64_vec(&[5, 7, 5, 7, 9]);
        let v = Obj::i64_vec(&[1, 2, 3, 4, 5]);
        let out = aggregate_with_keys(AggOp::Sum, &keys_of(k), &v);
        // Perfect hash emits groups in key order.
        assert_eq!(out.as_i64s(), &[4, 6, 5]);
    }

    #[test]
    fn test_composite_two_keys() {
        let k1 = Obj::i64_vec(&[1, 1, 2, 2, 1]);
        // A wide-range second key defeats the perfect path.
        let k2 = Obj::i64_vec(&[1 << 40, 1 << 41, 1 << 40, 1 << 40, 1 << 40]);
        let v = Obj::i64_vec(&[10, 20, 30, 40, 50]);
        let keys = Obj::list_from(vec![k1, k2]);
        let out = aggregate_with_keys(AggOp::Sum, &keys, &v);
        // First-occurrence order: (1,2^40)=60, (1,2^41)=20, (2,2^40)=70.
        assert_eq!(out.as_i64s(), &[60, 20, 70]);
    }

    #[test]
    fn test_all_ops_match_reference() {
        let n = 5000;
        let mut keys = Vec::with_capacity(n);
        let mut vals = Vec::with_capacity(n);
        let mut x = 88172645463325252u64;
        for _ in 0..n {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            keys.push((x % (1 << 20)) as i64); // wide range: composite path
            vals.push((x % 1000) as i64);
        }

        let kv = Obj::i64_vec(&keys);
        let vv = Obj::i64_vec(&vals);
        let klist = keys_of(kv);

        // Reference with a plain hash map, first-occurrence group order.
        let mut order: Vec<i64> = Vec::new();
        let mut state: AHashMap<i64, (i64, i64, i64, i64, i64, i64)> = AHashMap::new();
        for (i, (&k, &v)) in keys.iter().zip(&vals).enumerate() {
            let e = state.entry(k).or_insert_with(|| {
                order.push(k);
                (0, 0, i64::MAX, i64::MIN, i as i64, i as i64)
            });
            e.0 += v;
            e.1 += 1;
            e.2 = e.2.min(v);
            e.3 = e.3.max(v);
            e.5 = i as i64;
        }

        let sums = aggregate_with_keys(AggOp::Sum, &klist, &vv);
        let counts = aggregate_with_keys(AggOp::Count, &klist, &vv);
        let mins = aggregate_with_keys(AggOp::Min, &klist, &vv);
        let maxs = aggregate_with_keys(AggOp::Max, &klist, &vv);
        let firsts = aggregate_with_keys(AggOp::First, &klist, &vv);
        let lasts = aggregate_with_keys(AggOp::Last, &klist, &vv);
        let avgs = aggregate_with_keys(AggOp::Avg, &klist, &vv);

        assert_eq!(sums.len(), order.len());
        for (g, k) in order.iter().enumerate() {
            let e = &state[k];
            assert_eq!(sums.as_i64s()[g], e.0, "sum of group {}", k);
            assert_eq!(counts.as_i64s()[g], e.1);
            assert_eq!(mins.as_i64s()[g], e.2);
            assert_eq!(maxs.as_i64s()[g], e.3);
            assert_eq!(firsts.as_i64s()[g], vals[e.4 as usize]);
            assert_eq!(lasts.as_i64s()[g], vals[e.5 as usize]);
            assert!((avgs.as_f64s()[g] - e.0 as f64 / e.1 as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn test_parallel_matches_serial_bitwise() {
        let n = 300_000;
        let mut keys = Vec::with_capacity(n);
        let mut vals = Vec::with_capacity(n);
        let mut x = 0x2545f4914f6cdd1du64;
        for _ in 0..n {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            keys.push((x % 500) as i64 + (1 << 30));
            vals.push((x % 97) as i64);
        }
        // A second wide-range key forces the composite paths.
        let k2: Vec<i64> = keys.iter().map(|k| k.wrapping_mul(1 << 21)).collect();

        let klist = Obj::list_from(vec![Obj::i64_vec(&keys), Obj::i64_vec(&k2)]);
        let vv = Obj::i64_vec(&vals);

        let par = aggregate_with_keys(AggOp::Sum, &klist, &vv);
        let ser = serial_agg(AggOp::Sum, &klist, &vv);

        // Group order can differ between the two; compare as key→sum maps
        // via first rows.
        let par_first = aggregate_with_keys(AggOp::First, &klist, &Obj::i64_vec(&keys));
        let ser_first = serial_agg(AggOp::First, &klist, &Obj::i64_vec(&keys));

        let mut pm: AHashMap<i64, i64> = AHashMap::new();
        for (k, s) in par_first.as_i64s().iter().zip(par.as_i64s()) {
            pm.insert(*k, *s);
        }
        let mut sm: AHashMap<i64, i64> = AHashMap::new();
        for (k, s) in ser_first.as_i64s().iter().zip(ser.as_i64s()) {
            sm.insert(*k, *s);
        }
        assert_eq!(pm, sm);
    }

    #[test]
    fn test_f64_avg_and_nulls() {
        let k = Obj::i64_vec(&[1, 1, 2, 2]);
        let v = Obj::f64_vec(&[1.0, f64::NAN, 3.0, 5.0]);
        let avg = aggregate_with_keys(AggOp::Avg, &keys_of(k.clone()), &v);
        assert_eq!(avg.as_f64s(), &[1.0, 4.0]);
        let min = aggregate_with_keys(AggOp::Min, &keys_of(k), &v);
        assert_eq!(min.as_f64s(), &[1.0, 3.0]);
    }

    #[test]
    fn test_group_keys_alignment() {
        let k = Obj::sym_vec_strs(&["a", "a", "b", "b", "c"]);
        let v = Obj::i64_vec(&[1, 2, 3, 4, 5]);
        let klist = keys_of(k.clone());
        let sums = aggregate_with_keys(AggOp::Sum, &klist, &v);
        let names = group_keys(&klist, &k);
        assert_eq!(names.len(), sums.len());
        let mut by_name: Vec<(String, i64)> = names
            .as_i64s()
            .iter()
            .zip(sums.as_i64s())
            .map(|(&id, &s)| (crate::symbols::str_of(id).unwrap(), s))
            .collect();
        by_name.sort();
        assert_eq!(
            by_name,
            vec![
                ("a".to_string(), 3),
                ("b".to_string(), 7),
                ("c".to_string(), 5)
            ]
        );
    }
}
