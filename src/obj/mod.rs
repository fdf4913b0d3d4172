//! Tagged object model.
//!
//! Every value is a 16-byte header followed by its payload, carved from the
//! buddy heap. The header carries the signed type tag (an atom's tag is the
//! negative of its vector's), the memory mode, advisory attribute bits, the
//! reference count and the length word, which doubles as the inline payload
//! for 8-byte atoms. [`Obj`] is the owning handle: `Clone` increments the
//! reference count, `Drop` decrements it and at zero releases children and
//! returns the block to the heap. While a pool fan-out is active
//! (`vm::rc_sync`), both operations use atomic read-modify-write; in serial
//! phases they are plain loads and stores.

use std::cmp::Ordering as CmpOrdering;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error;
use crate::symbols;
use crate::vm;

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

pub const TAG_NULL: i8 = 0;
pub const TAG_B8: i8 = 1;
pub const TAG_U8: i8 = 2;
pub const TAG_C8: i8 = 3;
pub const TAG_I16: i8 = 4;
pub const TAG_I32: i8 = 5;
pub const TAG_I64: i8 = 6;
pub const TAG_F64: i8 = 7;
pub const TAG_SYM: i8 = 8;
pub const TAG_DATE: i8 = 9;
pub const TAG_TIME: i8 = 10;
pub const TAG_TIMESTAMP: i8 = 11;
pub const TAG_GUID: i8 = 12;
pub const TAG_LIST: i8 = 20;
pub const TAG_DICT: i8 = 21;
pub const TAG_TABLE: i8 = 22;
pub const TAG_LAMBDA: i8 = 30;
pub const TAG_UNARY: i8 = 31;
pub const TAG_BINARY: i8 = 32;
pub const TAG_VARY: i8 = 33;
pub const TAG_MAPFILTER: i8 = 40;
pub const TAG_MAPGROUP: i8 = 41;
pub const TAG_MAPCOMMON: i8 = 42;
pub const TAG_PARTEDI64: i8 = 43;
pub const TAG_ERR: i8 = -128;

/// Vector-kind view of the tag space, for dispatch tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum TypeTag {
    B8 = TAG_B8,
    U8 = TAG_U8,
    C8 = TAG_C8,
    I16 = TAG_I16,
    I32 = TAG_I32,
    I64 = TAG_I64,
    F64 = TAG_F64,
    Symbol = TAG_SYM,
    Date = TAG_DATE,
    Time = TAG_TIME,
    Timestamp = TAG_TIMESTAMP,
    Guid = TAG_GUID,
    List = TAG_LIST,
    Dict = TAG_DICT,
    Table = TAG_TABLE,
}

// Per-type null sentinels. These are values inside the payload, not types.
pub const NULL_I16: i16 = i16::MIN;
pub const NULL_I32: i32 = i32::MIN;
pub const NULL_I64: i64 = i64::MIN;
pub const NULL_F64: f64 = f64::NAN;
pub const NULL_U8: u8 = u8::MAX;
pub const INF_I64: i64 = i64::MAX;

/// Advisory attribute bits.
pub mod attr {
    pub const ASC: u8 = 1;
    pub const DESC: u8 = 2;
    pub const DISTINCT: u8 = 4;
}

pub use attr as Attr;

const MODE_HEAP: u8 = 0;
const MODE_STATIC: u8 = 1;
const MODE_MAPPED: u8 = 2;

pub fn tag_name(tag: i8) -> &'static str {
    match tag.abs() {
        0 => "null",
        TAG_B8 => "b8",
        TAG_U8 => "u8",
        TAG_C8 => "c8",
        TAG_I16 => "i16",
        TAG_I32 => "i32",
        TAG_I64 => "i64",
        TAG_F64 => "f64",
        TAG_SYM => "symbol",
        TAG_DATE => "date",
        TAG_TIME => "time",
        TAG_TIMESTAMP => "timestamp",
        TAG_GUID => "guid",
        TAG_LIST => "list",
        TAG_DICT => "dict",
        TAG_TABLE => "table",
        TAG_LAMBDA => "lambda",
        TAG_UNARY => "unary",
        TAG_BINARY => "binary",
        TAG_VARY => "vary",
        TAG_MAPFILTER => "mapfilter",
        TAG_MAPGROUP => "mapgroup",
        TAG_MAPCOMMON => "mapcommon",
        TAG_PARTEDI64 => "partedi64",
        _ if tag == TAG_ERR => "error",
        _ => "unknown",
    }
}

/// Payload bytes per element for a vector tag.
#[inline(always)]
pub fn elem_size(tag: i8) -> usize {
    match tag {
        TAG_B8 | TAG_U8 | TAG_C8 => 1,
        TAG_I16 => 2,
        TAG_I32 | TAG_DATE | TAG_TIME => 4,
        TAG_GUID => 16,
        _ => 8,
    }
}

#[inline(always)]
fn holds_objs(tag: i8) -> bool {
    matches!(
        tag,
        TAG_LIST
            | TAG_DICT
            | TAG_TABLE
            | TAG_LAMBDA
            | TAG_MAPFILTER
            | TAG_MAPGROUP
            | TAG_MAPCOMMON
            | TAG_PARTEDI64
    )
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// 16-byte value header. `data` is the length for vectors and the inline
/// payload for 8-byte atoms.
#[repr(C)]
pub struct Head {
    pub tag: i8,
    pub mode: u8,
    pub attrs: u8,
    _pad: u8,
    rc: AtomicU32,
    pub data: u64,
}

pub const OBJ_HDR_SIZE: usize = std::mem::size_of::<Head>();

static NULL_HEAD: Head = Head {
    tag: TAG_NULL,
    mode: MODE_STATIC,
    attrs: 0,
    _pad: 0,
    rc: AtomicU32::new(1),
    data: 0,
};

static ERR_HEAD: Head = Head {
    tag: TAG_ERR,
    mode: MODE_STATIC,
    attrs: 0,
    _pad: 0,
    rc: AtomicU32::new(1),
    data: 0,
};

#[inline(always)]
fn null_ptr() -> *mut Head {
    &NULL_HEAD as *const Head as *mut Head
}

#[inline(always)]
fn err_ptr() -> *mut Head {
    &ERR_HEAD as *const Head as *mut Head
}

/// The interned error sentinel. Context lives in the VM error record.
pub fn err_obj() -> Obj {
    Obj(unsafe { NonNull::new_unchecked(err_ptr()) })
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owning handle to a heap value. 8 bytes, `repr(transparent)`, so a LIST
/// payload is an array of handles.
#[repr(transparent)]
pub struct Obj(NonNull<Head>);

/// Values cross threads during pool fan-outs; `rc_sync` makes the reference
/// count atomic for exactly those windows, and blocks freed off-thread land
/// in the owner's foreign bin.
unsafe impl Send for Obj {}

impl Obj {
    // -- lifecycle ---------------------------------------------------------

    #[inline(always)]
    pub fn null() -> Obj {
        Obj(unsafe { NonNull::new_unchecked(null_ptr()) })
    }

    #[inline(always)]
    pub(crate) fn raw(&self) -> *mut Head {
        self.0.as_ptr()
    }

    /// Rebuild a handle from a raw header pointer, bumping the count.
    pub(crate) unsafe fn clone_raw(p: *mut Head) -> Obj {
        let o = Obj(NonNull::new_unchecked(p));
        let c = o.clone();
        std::mem::forget(o);
        c
    }

    /// Take ownership of a raw header pointer without touching the count.
    #[inline(always)]
    pub(crate) unsafe fn from_raw(p: *mut Head) -> Obj {
        Obj(NonNull::new_unchecked(p))
    }

    /// Release the handle without dropping: the caller owns the count.
    #[inline(always)]
    pub(crate) fn into_raw(self) -> *mut Head {
        let p = self.0.as_ptr();
        std::mem::forget(self);
        p
    }

    #[inline(always)]
    fn head(&self) -> &Head {
        unsafe { self.0.as_ref() }
    }

    #[inline(always)]
    fn head_mut(&mut self) -> &mut Head {
        unsafe { self.0.as_mut() }
    }

    fn alloc_head(tag: i8, data: u64, extra: usize) -> Option<Obj> {
        let raw = vm::alloc(OBJ_HDR_SIZE + extra);
        if raw.is_null() {
            return None;
        }
        unsafe {
            let head = raw as *mut Head;
            ptr::write(
                head,
                Head {
                    tag,
                    mode: MODE_HEAP,
                    attrs: 0,
                    _pad: 0,
                    rc: AtomicU32::new(1),
                    data,
                },
            );
            Some(Obj(NonNull::new_unchecked(head)))
        }
    }

    // -- inspection --------------------------------------------------------

    #[inline(always)]
    pub fn tag(&self) -> i8 {
        self.head().tag
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        self.0.as_ptr() == null_ptr()
    }

    #[inline(always)]
    pub fn is_err(&self) -> bool {
        self.head().tag == TAG_ERR
    }

    #[inline(always)]
    pub fn is_atom(&self) -> bool {
        self.head().tag < 0 && self.head().tag != TAG_ERR
    }

    #[inline(always)]
    pub fn is_vector(&self) -> bool {
        let t = self.head().tag;
        (TAG_B8..=TAG_GUID).contains(&t)
    }

    /// Element count for vectors and composites, 1 for atoms.
    #[inline(always)]
    pub fn len(&self) -> usize {
        if self.head().tag < 0 {
            1
        } else {
            self.head().data as usize
        }
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn attrs(&self) -> u8 {
        self.head().attrs
    }

    #[inline(always)]
    pub fn set_attrs(&mut self, attrs: u8) {
        self.head_mut().attrs = attrs;
    }

    #[inline(always)]
    pub fn is_mapped(&self) -> bool {
        self.head().mode == MODE_MAPPED
    }

    pub fn rc(&self) -> u32 {
        self.head().rc.load(Ordering::Relaxed)
    }

    /// Shrink the logical length. Used on error paths to drop only the
    /// elements already built.
    pub fn set_len(&mut self, n: usize) {
        debug_assert!(n <= self.head().data as usize);
        self.head_mut().data = n as u64;
    }

    // -- payload access ----------------------------------------------------

    #[inline(always)]
    fn payload(&self) -> *mut u8 {
        unsafe {
            let base = (self.0.as_ptr() as *mut u8).add(OBJ_HDR_SIZE);
            if self.head().mode == MODE_MAPPED {
                *(base as *const *mut u8)
            } else {
                base
            }
        }
    }

    #[inline(always)]
    pub fn as_i64s(&self) -> &[i64] {
        unsafe { std::slice::from_raw_parts(self.payload() as *const i64, self.len()) }
    }

    #[inline(always)]
    pub fn as_i64s_mut(&mut self) -> &mut [i64] {
        unsafe { std::slice::from_raw_parts_mut(self.payload() as *mut i64, self.len()) }
    }

    #[inline(always)]
    pub fn as_i32s(&self) -> &[i32] {
        unsafe { std::slice::from_raw_parts(self.payload() as *const i32, self.len()) }
    }

    #[inline(always)]
    pub fn as_i32s_mut(&mut self) -> &mut [i32] {
        unsafe { std::slice::from_raw_parts_mut(self.payload() as *mut i32, self.len()) }
    }

    #[inline(always)]
    pub fn as_i16s(&self) -> &[i16] {
        unsafe { std::slice::from_raw_parts(self.payload() as *const i16, self.len()) }
    }

    #[inline(always)]
    pub fn as_i16s_mut(&mut self) -> &mut [i16] {
        unsafe { std::slice::from_raw_parts_mut(self.payload() as *mut i16, self.len()) }
    }

    #[inline(always)]
    pub fn as_f64s(&self) -> &[f64] {
        unsafe { std::slice::from_raw_parts(self.payload() as *const f64, self.len()) }
    }

    #[inline(always)]
    pub fn as_f64s_mut(&mut self) -> &mut [f64] {
        unsafe { std::slice::from_raw_parts_mut(self.payload() as *mut f64, self.len()) }
    }

    #[inline(always)]
    pub fn as_u8s(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload() as *const u8, self.len()) }
    }

    #[inline(always)]
    pub fn as_u8s_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload(), self.len()) }
    }

    /// Raw payload bytes of a primitive vector (`len * elem_size`).
    pub fn payload_bytes(&self) -> &[u8] {
        debug_assert!(self.tag() > 0 && !holds_objs(self.tag()));
        unsafe { std::slice::from_raw_parts(self.payload(), self.len() * elem_size(self.tag())) }
    }

    #[inline(always)]
    pub fn as_guids(&self) -> &[[u8; 16]] {
        unsafe { std::slice::from_raw_parts(self.payload() as *const [u8; 16], self.len()) }
    }

    #[inline(always)]
    pub fn as_guids_mut(&mut self) -> &mut [[u8; 16]] {
        unsafe { std::slice::from_raw_parts_mut(self.payload() as *mut [u8; 16], self.len()) }
    }

    #[inline(always)]
    pub fn as_list(&self) -> &[Obj] {
        debug_assert!(holds_objs(self.tag()));
        unsafe { std::slice::from_raw_parts(self.payload() as *const Obj, self.len()) }
    }

    #[inline(always)]
    pub fn as_list_mut(&mut self) -> &mut [Obj] {
        debug_assert!(holds_objs(self.tag()));
        unsafe { std::slice::from_raw_parts_mut(self.payload() as *mut Obj, self.len()) }
    }

    /// Replace the list element at `i`, releasing the previous one.
    pub fn list_set(&mut self, i: usize, v: Obj) {
        debug_assert!(holds_objs(self.tag()) && i < self.len());
        unsafe {
            let slot = (self.payload() as *mut Obj).add(i);
            ptr::drop_in_place(slot);
            ptr::write(slot, v);
        }
    }

    // -- atom payloads -----------------------------------------------------

    #[inline(always)]
    pub fn i64_val(&self) -> i64 {
        self.head().data as i64
    }

    #[inline(always)]
    pub fn f64_val(&self) -> f64 {
        f64::from_bits(self.head().data)
    }

    #[inline(always)]
    pub fn sym_val(&self) -> i64 {
        self.head().data as i64
    }

    #[inline(always)]
    pub fn u8_val(&self) -> u8 {
        self.head().data as u8
    }

    #[inline(always)]
    pub fn bool_val(&self) -> bool {
        self.head().data != 0
    }

    #[inline(always)]
    pub fn i32_val(&self) -> i32 {
        self.head().data as i32
    }

    #[inline(always)]
    pub fn i16_val(&self) -> i16 {
        self.head().data as i16
    }

    pub fn guid_val(&self) -> [u8; 16] {
        debug_assert_eq!(self.tag(), -TAG_GUID);
        unsafe { *(self.payload() as *const [u8; 16]) }
    }

    // -- atom constructors -------------------------------------------------

    pub fn i64(v: i64) -> Obj {
        Self::alloc_head(-TAG_I64, v as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn f64(v: f64) -> Obj {
        Self::alloc_head(-TAG_F64, v.to_bits(), 0).unwrap_or_else(err_oom)
    }

    pub fn b8(v: bool) -> Obj {
        Self::alloc_head(-TAG_B8, v as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn u8(v: u8) -> Obj {
        Self::alloc_head(-TAG_U8, v as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn c8(v: u8) -> Obj {
        Self::alloc_head(-TAG_C8, v as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn i16(v: i16) -> Obj {
        Self::alloc_head(-TAG_I16, v as u16 as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn i32(v: i32) -> Obj {
        Self::alloc_head(-TAG_I32, v as u32 as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn date(days: i32) -> Obj {
        Self::alloc_head(-TAG_DATE, days as u32 as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn time(ms: i32) -> Obj {
        Self::alloc_head(-TAG_TIME, ms as u32 as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn timestamp(ns: i64) -> Obj {
        Self::alloc_head(-TAG_TIMESTAMP, ns as u64, 0).unwrap_or_else(err_oom)
    }

    pub fn sym(id: i64) -> Obj {
        Self::alloc_head(-TAG_SYM, id as u64, 0).unwrap_or_else(err_oom)
    }

    /// Intern `s` and wrap the id.
    pub fn sym_str(s: &str) -> Obj {
        Self::sym(symbols::intern(s))
    }

    pub fn guid(bytes: [u8; 16]) -> Obj {
        match Self::alloc_head(-TAG_GUID, 0, 16) {
            Some(o) => {
                unsafe { ptr::write(o.payload() as *mut [u8; 16], bytes) };
                o
            }
            None => err_oom(),
        }
    }

    // -- vector constructors -----------------------------------------------

    /// Vector of `len` elements of vector-kind `tag`. Payload is left
    /// uninitialised; callers fill it before reading.
    pub fn vector(tag: i8, len: usize) -> Obj {
        debug_assert!(tag > 0);
        match Self::alloc_head(tag, len as u64, len * elem_size(tag)) {
            Some(o) => {
                if holds_objs(tag) {
                    unsafe {
                        let slots = o.payload() as *mut Obj;
                        for i in 0..len {
                            ptr::write(slots.add(i), Obj::null());
                        }
                    }
                }
                o
            }
            None => err_oom(),
        }
    }

    pub fn list(len: usize) -> Obj {
        Self::vector(TAG_LIST, len)
    }

    pub fn i64_vec(vals: &[i64]) -> Obj {
        let mut o = Self::vector(TAG_I64, vals.len());
        if !o.is_err() {
            o.as_i64s_mut().copy_from_slice(vals);
        }
        o
    }

    pub fn i32_vec(vals: &[i32]) -> Obj {
        let mut o = Self::vector(TAG_I32, vals.len());
        if !o.is_err() {
            o.as_i32s_mut().copy_from_slice(vals);
        }
        o
    }

    pub fn i16_vec(vals: &[i16]) -> Obj {
        let mut o = Self::vector(TAG_I16, vals.len());
        if !o.is_err() {
            o.as_i16s_mut().copy_from_slice(vals);
        }
        o
    }

    pub fn f64_vec(vals: &[f64]) -> Obj {
        let mut o = Self::vector(TAG_F64, vals.len());
        if !o.is_err() {
            o.as_f64s_mut().copy_from_slice(vals);
        }
        o
    }

    pub fn u8_vec(vals: &[u8]) -> Obj {
        let mut o = Self::vector(TAG_U8, vals.len());
        if !o.is_err() {
            o.as_u8s_mut().copy_from_slice(vals);
        }
        o
    }

    /// Character vector from UTF-8 text.
    pub fn string(s: &str) -> Obj {
        let mut o = Self::vector(TAG_C8, s.len());
        if !o.is_err() {
            o.as_u8s_mut().copy_from_slice(s.as_bytes());
        }
        o
    }

    pub fn sym_vec(ids: &[i64]) -> Obj {
        let mut o = Self::vector(TAG_SYM, ids.len());
        if !o.is_err() {
            o.as_i64s_mut().copy_from_slice(ids);
        }
        o
    }

    pub fn sym_vec_strs(names: &[&str]) -> Obj {
        let ids: Vec<i64> = names.iter().map(|s| symbols::intern(s)).collect();
        Self::sym_vec(&ids)
    }

    /// `0..n` index vector.
    pub fn iota(n: usize) -> Obj {
        let mut o = Self::vector(TAG_I64, n);
        if !o.is_err() {
            let out = o.as_i64s_mut();
            for (i, slot) in out.iter_mut().enumerate() {
                *slot = i as i64;
            }
            o.set_attrs(attr::ASC);
        }
        o
    }

    /// List from already-owned elements.
    pub fn list_from(items: Vec<Obj>) -> Obj {
        let mut o = Self::list(items.len());
        if !o.is_err() {
            for (i, item) in items.into_iter().enumerate() {
                o.list_set(i, item);
            }
        }
        o
    }

    /// Pair container retagged to `tag` (DICT/TABLE/MAP kinds).
    fn pair(tag: i8, a: Obj, b: Obj) -> Obj {
        let mut o = Self::list(2);
        if o.is_err() {
            return o;
        }
        o.list_set(0, a);
        o.list_set(1, b);
        o.head_mut().tag = tag;
        o
    }

    /// DICT of two parallel vectors/lists of equal length.
    pub fn dict(keys: Obj, vals: Obj) -> Obj {
        if keys.len() != vals.len() {
            let (k, v) = (keys.len(), vals.len());
            return error::err_length(k as i64, v as i64, 0);
        }
        Self::pair(TAG_DICT, keys, vals)
    }

    /// TABLE: `names` is a SYMBOL vector of length C, `cols` a LIST of C
    /// equal-length columns.
    pub fn table(names: Obj, cols: Obj) -> Obj {
        if names.tag() != TAG_SYM {
            return error::err_type(TAG_SYM, names.tag(), 0, 0);
        }
        if names.len() != cols.len() {
            return error::err_length(names.len() as i64, cols.len() as i64, 1);
        }
        let rows = cols.as_list().first().map(|c| c.len());
        if let Some(rows) = rows {
            for c in cols.as_list() {
                if c.len() != rows {
                    return error::err_length(rows as i64, c.len() as i64, 1);
                }
            }
        }
        Self::pair(TAG_TABLE, names, cols)
    }

    pub fn map_filter(base: Obj, index: Obj) -> Obj {
        Self::pair(TAG_MAPFILTER, base, index)
    }

    pub fn map_group(base: Obj, group: Obj) -> Obj {
        Self::pair(TAG_MAPGROUP, base, group)
    }

    pub fn map_common(values: Obj, counts: Obj) -> Obj {
        Self::pair(TAG_MAPCOMMON, values, counts)
    }

    /// Wrap a column of mapped memory. The map itself outlives the handle;
    /// dropping the handle frees only the header block.
    pub fn mapped_vector(tag: i8, len: usize, data: *const u8) -> Obj {
        debug_assert!(tag > 0 && !holds_objs(tag));
        match Self::alloc_head(tag, len as u64, 8) {
            Some(mut o) => unsafe {
                let base = (o.0.as_ptr() as *mut u8).add(OBJ_HDR_SIZE);
                *(base as *mut *const u8) = data;
                o.head_mut().mode = MODE_MAPPED;
                o
            },
            None => err_oom(),
        }
    }

    // -- host functions ----------------------------------------------------

    pub fn unary(name: i64, f: UnaryFn) -> Obj {
        match Self::alloc_head(TAG_UNARY, name as u64, 8) {
            Some(o) => unsafe {
                let base = (o.0.as_ptr() as *mut u8).add(OBJ_HDR_SIZE);
                *(base as *mut usize) = f as usize;
                o
            },
            None => err_oom(),
        }
    }

    pub fn binary(name: i64, f: BinaryFn) -> Obj {
        match Self::alloc_head(TAG_BINARY, name as u64, 8) {
            Some(o) => unsafe {
                let base = (o.0.as_ptr() as *mut u8).add(OBJ_HDR_SIZE);
                *(base as *mut usize) = f as usize;
                o
            },
            None => err_oom(),
        }
    }

    pub fn vary(name: i64, f: VaryFn) -> Obj {
        match Self::alloc_head(TAG_VARY, name as u64, 8) {
            Some(o) => unsafe {
                let base = (o.0.as_ptr() as *mut u8).add(OBJ_HDR_SIZE);
                *(base as *mut usize) = f as usize;
                o
            },
            None => err_oom(),
        }
    }

    pub fn fn_name(&self) -> i64 {
        self.head().data as i64
    }

    pub fn unary_fn(&self) -> UnaryFn {
        debug_assert_eq!(self.tag(), TAG_UNARY);
        unsafe {
            let base = (self.0.as_ptr() as *const u8).add(OBJ_HDR_SIZE);
            std::mem::transmute::<usize, UnaryFn>(*(base as *const usize))
        }
    }

    pub fn binary_fn(&self) -> BinaryFn {
        debug_assert_eq!(self.tag(), TAG_BINARY);
        unsafe {
            let base = (self.0.as_ptr() as *const u8).add(OBJ_HDR_SIZE);
            std::mem::transmute::<usize, BinaryFn>(*(base as *const usize))
        }
    }

    pub fn vary_fn(&self) -> VaryFn {
        debug_assert_eq!(self.tag(), TAG_VARY);
        unsafe {
            let base = (self.0.as_ptr() as *const u8).add(OBJ_HDR_SIZE);
            std::mem::transmute::<usize, VaryFn>(*(base as *const usize))
        }
    }

    // -- growth ------------------------------------------------------------

    /// Elements the current block can hold without reallocating. Lengths are
    /// authoritative; capacity is implied by the size class.
    pub fn capacity(&self) -> usize {
        if self.head().mode != MODE_HEAP {
            return self.len();
        }
        unsafe {
            let blk = crate::heap::BlockHdr::from_payload(self.0.as_ptr() as *mut u8);
            let avail = crate::heap::order_size((*blk).order)
                - crate::heap::HDR_SIZE
                - OBJ_HDR_SIZE;
            avail / elem_size(self.tag().abs())
        }
    }

    fn grow(obj: &mut Obj, need: usize) -> bool {
        let tag = obj.tag();
        let bytes = OBJ_HDR_SIZE + need * elem_size(tag);
        let raw = vm::realloc(obj.0.as_ptr() as *mut u8, bytes);
        if raw.is_null() {
            return false;
        }
        obj.0 = unsafe { NonNull::new_unchecked(raw as *mut Head) };
        true
    }

    /// Append to an I64/SYM/TIMESTAMP vector, reallocating as needed.
    pub fn push_i64(obj: &mut Obj, v: i64) {
        let len = obj.len();
        if len == obj.capacity() && !Self::grow(obj, len + 1) {
            return;
        }
        unsafe {
            *(obj.payload() as *mut i64).add(len) = v;
        }
        obj.head_mut().data = (len + 1) as u64;
    }

    /// Append an element to a LIST.
    pub fn push_obj(obj: &mut Obj, v: Obj) {
        let len = obj.len();
        if len == obj.capacity() && !Self::grow(obj, len + 1) {
            return;
        }
        unsafe {
            ptr::write((obj.payload() as *mut Obj).add(len), v);
        }
        obj.head_mut().data = (len + 1) as u64;
    }

    // -- element extraction ------------------------------------------------

    /// Element `i` as an atom (or a clone for object containers).
    pub fn at_idx(&self, i: usize) -> Obj {
        if i >= self.len() {
            return error::err_index(i as i64, self.len() as i64);
        }
        match self.tag() {
            TAG_B8 => Obj::b8(self.as_u8s()[i] != 0),
            TAG_U8 => Obj::u8(self.as_u8s()[i]),
            TAG_C8 => Obj::c8(self.as_u8s()[i]),
            TAG_I16 => Obj::i16(self.as_i16s()[i]),
            TAG_I32 => Obj::i32(self.as_i32s()[i]),
            TAG_DATE => Obj::date(self.as_i32s()[i]),
            TAG_TIME => Obj::time(self.as_i32s()[i]),
            TAG_I64 => Obj::i64(self.as_i64s()[i]),
            TAG_TIMESTAMP => Obj::timestamp(self.as_i64s()[i]),
            TAG_F64 => Obj::f64(self.as_f64s()[i]),
            TAG_SYM => Obj::sym(self.as_i64s()[i]),
            TAG_GUID => Obj::guid(self.as_guids()[i]),
            t if holds_objs(t) => self.as_list()[i].clone(),
            _ => error::err_type(TAG_LIST, self.tag(), 0, 0),
        }
    }

    /// Copy-on-write: the value itself when uniquely owned, otherwise a
    /// fresh copy (children keep shared ownership).
    pub fn cow(self) -> Obj {
        if self.head().mode == MODE_HEAP && self.rc() == 1 {
            return self;
        }
        self.shallow_copy()
    }

    fn shallow_copy(&self) -> Obj {
        let tag = self.tag();
        if tag < 0 {
            // Atoms: rebuild from payload.
            return match tag {
                t if t == -TAG_GUID => Obj::guid(self.guid_val()),
                _ => match Self::alloc_head(tag, self.head().data, 0) {
                    Some(o) => o,
                    None => err_oom(),
                },
            };
        }
        let len = self.len();
        let mut out = Self::vector(tag, len);
        if out.is_err() {
            return out;
        }
        if holds_objs(tag) {
            for (i, item) in self.as_list().iter().enumerate() {
                out.list_set(i, item.clone());
            }
            out.head_mut().tag = tag;
        } else {
            unsafe {
                ptr::copy_nonoverlapping(self.payload(), out.payload(), len * elem_size(tag));
            }
        }
        out
    }
}

fn err_oom() -> Obj {
    error::err_limit(0)
}

impl Clone for Obj {
    #[inline]
    fn clone(&self) -> Obj {
        let head = self.head();
        if head.mode != MODE_STATIC {
            if vm::rc_sync() {
                head.rc.fetch_add(1, Ordering::AcqRel);
            } else {
                let rc = head.rc.load(Ordering::Relaxed);
                head.rc.store(rc + 1, Ordering::Relaxed);
            }
        }
        Obj(self.0)
    }
}

impl Drop for Obj {
    fn drop(&mut self) {
        unsafe {
            let head = self.0.as_ref();
            if head.mode == MODE_STATIC {
                return;
            }
            let last = if vm::rc_sync() {
                head.rc.fetch_sub(1, Ordering::AcqRel) == 1
            } else {
                let rc = head.rc.load(Ordering::Relaxed);
                head.rc.store(rc - 1, Ordering::Relaxed);
                rc == 1
            };
            if !last {
                return;
            }
            // Release children, then the block itself.
            let tag = head.tag;
            if holds_objs(tag) && head.mode != MODE_MAPPED {
                let slots = (self.0.as_ptr() as *mut u8).add(OBJ_HDR_SIZE) as *mut Obj;
                for i in 0..head.data as usize {
                    ptr::drop_in_place(slots.add(i));
                }
            }
            vm::free(self.0.as_ptr() as *mut u8);
        }
    }
}

impl std::fmt::Debug for Obj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Obj<{}", tag_name(self.tag()))?;
        if self.tag() >= 0 {
            write!(f, "; len={}", self.len())?;
        }
        write!(f, ">")
    }
}

// ---------------------------------------------------------------------------
// Structural equality and ordering
// ---------------------------------------------------------------------------

/// Deep structural equality. Float NaNs compare equal to themselves so
/// round-trip tests can use it.
pub fn obj_eq(a: &Obj, b: &Obj) -> bool {
    if a.tag() != b.tag() {
        return false;
    }
    let tag = a.tag();
    if tag < 0 {
        return match tag {
            t if t == -TAG_GUID => a.guid_val() == b.guid_val(),
            t if t == -TAG_F64 => {
                let (x, y) = (a.f64_val(), b.f64_val());
                x == y || (x.is_nan() && y.is_nan())
            }
            TAG_ERR => true,
            _ => a.head().data == b.head().data,
        };
    }
    if a.len() != b.len() {
        return false;
    }
    match tag {
        TAG_B8 | TAG_U8 | TAG_C8 => a.as_u8s() == b.as_u8s(),
        TAG_I16 => a.as_i16s() == b.as_i16s(),
        TAG_I32 | TAG_DATE | TAG_TIME => a.as_i32s() == b.as_i32s(),
        TAG_I64 | TAG_SYM | TAG_TIMESTAMP => a.as_i64s() == b.as_i64s(),
        TAG_F64 => a
            .as_f64s()
            .iter()
            .zip(b.as_f64s())
            .all(|(x, y)| x == y || (x.is_nan() && y.is_nan())),
        TAG_GUID => a.as_guids() == b.as_guids(),
        t if holds_objs(t) => a
            .as_list()
            .iter()
            .zip(b.as_list())
            .all(|(x, y)| obj_eq(x, y)),
        _ => false,
    }
}

/// Total order over values, used by the generic merge sort. Symbols compare
/// by their interned strings, nulls first.
pub fn obj_cmp(a: &Obj, b: &Obj) -> CmpOrdering {
    let (ta, tb) = (a.tag(), b.tag());
    if ta != tb {
        return ta.cmp(&tb);
    }
    if ta < 0 {
        return match ta {
            t if t == -TAG_F64 => a.f64_val().partial_cmp(&b.f64_val()).unwrap_or(CmpOrdering::Equal),
            t if t == -TAG_SYM => symbols::cmp_syms(a.sym_val(), b.sym_val()),
            t if t == -TAG_GUID => a.guid_val().cmp(&b.guid_val()),
            _ => (a.head().data as i64).cmp(&(b.head().data as i64)),
        };
    }
    let n = a.len().min(b.len());
    for i in 0..n {
        let (x, y) = (a.at_idx(i), b.at_idx(i));
        let c = obj_cmp(&x, &y);
        if c != CmpOrdering::Equal {
            return c;
        }
    }
    a.len().cmp(&b.len())
}

pub type UnaryFn = fn(Obj) -> Obj;
pub type BinaryFn = fn(Obj, Obj) -> Obj;
pub type VaryFn = fn(&mut [Obj]) -> Obj;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_roundtrip() {
        let a = Obj::i64(42);
        assert_eq!(a.tag(), -TAG_I64);
        assert_eq!(a.i64_val(), 42);
        assert_eq!(a.len(), 1);

        let f = Obj::f64(2.5);
        assert_eq!(f.f64_val(), 2.5);

        let s = Obj::sym_str("trade");
        assert_eq!(s.tag(), -TAG_SYM);
        assert_eq!(crate::symbols::str_of(s.sym_val()).as_deref(), Some("trade"));
    }

    #[test]
    fn test_clone_drop_refcount() {
        let v = Obj::i64_vec(&[1, 2, 3]);
        assert_eq!(v.rc(), 1);
        let w = v.clone();
        assert_eq!(v.rc(), 2);
        drop(w);
        assert_eq!(v.rc(), 1);
    }

    #[test]
    fn test_list_releases_children() {
        let child = Obj::i64_vec(&[1, 2, 3]);
        let probe = child.clone();
        let list = Obj::list_from(vec![child]);
        assert_eq!(probe.rc(), 2);
        drop(list);
        assert_eq!(probe.rc(), 1);
    }

    #[test]
    fn test_cow_unique_is_identity() {
        let v = Obj::i64_vec(&[1, 2, 3]);
        let p = v.raw();
        let w = v.cow();
        assert_eq!(w.raw(), p);
    }

    #[test]
    fn test_cow_shared_copies() {
        let v = Obj::i64_vec(&[1, 2, 3]);
        let shared = v.clone();
        let mut w = shared.cow();
        assert_ne!(w.raw(), v.raw());
        w.as_i64s_mut()[0] = 99;
        assert_eq!(v.as_i64s()[0], 1);
    }

    #[test]
    fn test_table_validation() {
        let names = Obj::sym_vec_strs(&["a", "b"]);
        let cols = Obj::list_from(vec![Obj::i64_vec(&[1, 2]), Obj::i64_vec(&[3, 4])]);
        let t = Obj::table(names, cols);
        assert_eq!(t.tag(), TAG_TABLE);
        assert_eq!(t.as_list()[1].as_list()[0].len(), 2);

        let names = Obj::sym_vec_strs(&["a", "b"]);
        let cols = Obj::list_from(vec![Obj::i64_vec(&[1, 2]), Obj::i64_vec(&[3])]);
        assert!(Obj::table(names, cols).is_err());
    }

    #[test]
    fn test_push_grows_through_size_classes() {
        let mut v = Obj::vector(TAG_I64, 0);
        for i in 0..10_000 {
            Obj::push_i64(&mut v, i);
        }
        assert_eq!(v.len(), 10_000);
        assert_eq!(v.as_i64s()[9_999], 9_999);
        assert_eq!(v.as_i64s()[0], 0);
    }

    #[test]
    fn test_obj_eq_and_cmp() {
        let a = Obj::i64_vec(&[1, 2, 3]);
        let b = Obj::i64_vec(&[1, 2, 3]);
        let c = Obj::i64_vec(&[1, 2, 4]);
        assert!(obj_eq(&a, &b));
        assert!(!obj_eq(&a, &c));
        assert_eq!(obj_cmp(&a, &c), CmpOrdering::Less);

        let x = Obj::sym_str("apple");
        let y = Obj::sym_str("banana");
        assert_eq!(obj_cmp(&x, &y), CmpOrdering::Less);
    }

    #[test]
    fn test_null_and_err_sentinels() {
        let n = Obj::null();
        assert!(n.is_null());
        let n2 = n.clone();
        drop(n2);
        assert!(!n.is_err());
        let e = err_obj();
        assert!(e.is_err());
    }

    #[test]
    fn test_attrs_advisory() {
        let v = Obj::iota(10);
        assert_eq!(v.attrs() & attr::ASC, attr::ASC);
    }
}
