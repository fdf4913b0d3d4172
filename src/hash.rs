//! Hashing primitives and the open-addressing table.
//!
//! The core mixer folds one 64-bit key into a running hash; a 4-wide batched
//! variant covers bulk hash building and is bit-identical to the scalar loop.
//! `OaTable` is a linear-probing i64→i64 table stored as a value (a LIST of
//! two parallel vectors) with an in-band empty sentinel, used by the group
//! and join operators. The fused aggregator's packed (salt, group-id) cell
//! also lives here.

use crate::obj::{Obj, NULL_I64, TAG_I64, TAG_LIST};

/// Fixed odd multiplier of the mixing step.
pub const HASH_SEED: u64 = 0x9ddfea08eb382d69;

/// Initial running hash for composite keys.
pub const HASH_INIT: u64 = 0xcbf29ce484222325;

/// Mix key `k` into running hash `h`.
#[inline(always)]
pub fn mix(h: u64, k: u64) -> u64 {
    let mut a = (h ^ k).wrapping_mul(HASH_SEED);
    a ^= a >> 47;
    let mut b = (k.rotate_left(31) ^ a).wrapping_mul(HASH_SEED);
    b ^= b >> 47;
    b.wrapping_mul(HASH_SEED)
}

/// Mix four lanes at once. The compiler keeps the lanes independent, which
/// is enough for it to vectorise the arithmetic; results must match scalar
/// [`mix`] element-by-element.
#[inline(always)]
fn mix4(h: &mut [u64; 4], k: &[u64; 4]) {
    let mut a = [0u64; 4];
    let mut b = [0u64; 4];
    for i in 0..4 {
        a[i] = (h[i] ^ k[i]).wrapping_mul(HASH_SEED);
    }
    for i in 0..4 {
        a[i] ^= a[i] >> 47;
    }
    for i in 0..4 {
        b[i] = ((k[i] << 31) | (k[i] >> 33)) ^ a[i];
    }
    for i in 0..4 {
        b[i] = b[i].wrapping_mul(HASH_SEED);
    }
    for i in 0..4 {
        b[i] ^= b[i] >> 47;
    }
    for i in 0..4 {
        h[i] = b[i].wrapping_mul(HASH_SEED);
    }
}

/// Fold `vals` into the running hashes in `out`, four lanes at a time.
pub fn mix_batch(out: &mut [u64], vals: &[u64]) {
    let n = out.len().min(vals.len());
    let mut i = 0;
    while i + 4 <= n {
        let mut h = [out[i], out[i + 1], out[i + 2], out[i + 3]];
        let k = [vals[i], vals[i + 1], vals[i + 2], vals[i + 3]];
        mix4(&mut h, &k);
        out[i..i + 4].copy_from_slice(&h);
        i += 4;
    }
    while i < n {
        out[i] = mix(out[i], vals[i]);
        i += 1;
    }
}

/// Upper 16 bits of a full hash, cached inside aggregate cells so most
/// mismatches are rejected without touching key columns.
#[inline(always)]
pub fn salt_of(h: u64) -> u16 {
    (h >> 48) as u16
}

/// Packed aggregate-table cell: 16-bit salt, 16 reserved bits, 32-bit group
/// id. `0xFFFFFFFF` in the group-id lane marks an empty cell.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct AggCell(pub u64);

pub const GROUP_EMPTY: u32 = u32::MAX;

impl AggCell {
    #[inline(always)]
    pub fn empty() -> Self {
        AggCell(GROUP_EMPTY as u64)
    }

    #[inline(always)]
    pub fn new(salt: u16, group_id: u32) -> Self {
        AggCell(((salt as u64) << 48) | group_id as u64)
    }

    #[inline(always)]
    pub fn salt(self) -> u16 {
        (self.0 >> 48) as u16
    }

    #[inline(always)]
    pub fn group_id(self) -> u32 {
        self.0 as u32
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.group_id() == GROUP_EMPTY
    }
}

// ---------------------------------------------------------------------------
// Open-addressing table, stored as a value
// ---------------------------------------------------------------------------

pub type HashFn = fn(i64, &dyn OaSeed) -> u64;
pub type CmpFn = fn(i64, i64, &dyn OaSeed) -> bool;

/// Context threaded through custom hash/compare callbacks (e.g. the join's
/// precomputed row hashes and key columns).
pub trait OaSeed {
    fn row_hash(&self, row: i64) -> u64;
    fn rows_equal(&self, a: i64, b: i64) -> bool;
}

/// Trivial seed hashing the key itself.
pub struct IdentitySeed;

impl OaSeed for IdentitySeed {
    #[inline(always)]
    fn row_hash(&self, row: i64) -> u64 {
        mix(HASH_INIT, row as u64)
    }

    #[inline(always)]
    fn rows_equal(&self, a: i64, b: i64) -> bool {
        a == b
    }
}

/// Linear-probing hash table over i64 keys with optional parallel values.
/// Stored as a LIST of two I64 vectors so it participates in the ordinary
/// value lifecycle; the key array uses `NULL_I64` as the empty sentinel.
pub struct OaTable {
    store: Obj,
    mask: usize,
    count: usize,
    has_vals: bool,
}

const LOAD_NUM: usize = 7;
const LOAD_DEN: usize = 10;

fn next_pow2(n: usize) -> usize {
    n.next_power_of_two().max(16)
}

impl OaTable {
    pub fn new(capacity: usize, has_vals: bool) -> Self {
        let cap = next_pow2(capacity * LOAD_DEN / LOAD_NUM);
        let mut keys = Obj::vector(TAG_I64, cap);
        keys.as_i64s_mut().fill(NULL_I64);
        let vals = if has_vals {
            let mut v = Obj::vector(TAG_I64, cap);
            v.as_i64s_mut().fill(NULL_I64);
            v
        } else {
            Obj::vector(TAG_I64, 0)
        };
        let mut store = Obj::list(2);
        debug_assert_eq!(store.tag(), TAG_LIST);
        store.list_set(0, keys);
        store.list_set(1, vals);
        Self { store, mask: cap - 1, count: 0, has_vals }
    }

    #[inline(always)]
    fn keys(&self) -> &[i64] {
        self.store.as_list()[0].as_i64s()
    }

    #[inline(always)]
    fn keys_mut(&mut self) -> &mut [i64] {
        self.store.as_list_mut()[0].as_i64s_mut()
    }

    #[inline(always)]
    fn vals_mut(&mut self) -> &mut [i64] {
        self.store.as_list_mut()[1].as_i64s_mut()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn maybe_grow(&mut self, seed: &dyn OaSeed) {
        if (self.count + 1) * LOAD_DEN <= (self.mask + 1) * LOAD_NUM {
            return;
        }
        let old = std::mem::replace(self, OaTable::new((self.mask + 1) * 2, self.has_vals));
        let keys = old.keys();
        let vals = old.store.as_list()[1].as_i64s();
        for (i, &k) in keys.iter().enumerate() {
            if k != NULL_I64 {
                let v = if old.has_vals { vals[i] } else { NULL_I64 };
                self.insert(k, v, seed);
            }
        }
    }

    /// Insert `key` (with `val`) unless an equal key is present. Returns the
    /// slot's value either way; for tables without values, the key found.
    pub fn insert(&mut self, key: i64, val: i64, seed: &dyn OaSeed) -> i64 {
        self.maybe_grow(seed);
        let mask = self.mask;
        let mut idx = (seed.row_hash(key) as usize) & mask;
        loop {
            let k = self.keys()[idx];
            if k == NULL_I64 {
                self.keys_mut()[idx] = key;
                if self.has_vals {
                    self.vals_mut()[idx] = val;
                }
                self.count += 1;
                return if self.has_vals { val } else { key };
            }
            if seed.rows_equal(k, key) {
                return if self.has_vals { self.store.as_list()[1].as_i64s()[idx] } else { k };
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Probe for `key`; `NULL_I64` when absent.
    pub fn get(&self, key: i64, seed: &dyn OaSeed) -> i64 {
        let mask = self.mask;
        let mut idx = (seed.row_hash(key) as usize) & mask;
        loop {
            let k = self.keys()[idx];
            if k == NULL_I64 {
                return NULL_I64;
            }
            if seed.rows_equal(k, key) {
                return if self.has_vals { self.store.as_list()[1].as_i64s()[idx] } else { k };
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Presence test. A keyless table never stores `NULL_I64`, so the miss
    /// sentinel is unambiguous.
    pub fn contains(&self, key: i64, seed: &dyn OaSeed) -> bool {
        self.get(key, seed) != NULL_I64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_matches_scalar() {
        let vals: Vec<u64> = (0..37).map(|i| (i as u64).wrapping_mul(0x2545f4914f6cdd1d)).collect();
        let mut batch: Vec<u64> = (0..37).map(|i| i as u64 ^ 0xdead).collect();
        let scalar: Vec<u64> = batch
            .iter()
            .zip(&vals)
            .map(|(&h, &k)| mix(h, k))
            .collect();
        mix_batch(&mut batch, &vals);
        assert_eq!(batch, scalar);
    }

    #[test]
    fn test_mix_spreads() {
        let a = mix(HASH_INIT, 1);
        let b = mix(HASH_INIT, 2);
        assert_ne!(a, b);
        assert_ne!(salt_of(a), 0xFFFF ^ salt_of(a));
    }

    #[test]
    fn test_agg_cell_packing() {
        let c = AggCell::new(0xBEEF, 123);
        assert_eq!(c.salt(), 0xBEEF);
        assert_eq!(c.group_id(), 123);
        assert!(!c.is_empty());
        assert!(AggCell::empty().is_empty());
    }

    #[test]
    fn test_oa_table_insert_get() {
        let seed = IdentitySeed;
        let mut t = OaTable::new(8, true);
        for i in 0..100 {
            t.insert(i, i * 10, &seed);
        }
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert_eq!(t.get(i, &seed), i * 10);
        }
        assert_eq!(t.get(1000, &seed), NULL_I64);
    }

    #[test]
    fn test_oa_table_rehash_keeps_entries() {
        let seed = IdentitySeed;
        let mut t = OaTable::new(4, false);
        for i in 1..=1000 {
            t.insert(i, NULL_I64, &seed);
        }
        assert_eq!(t.len(), 1000);
        for i in 1..=1000 {
            assert_eq!(t.get(i, &seed), i);
        }
    }
}
