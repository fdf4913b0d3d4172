//! Wire format.
//!
//! Every frame is a 16-byte little-endian header followed by a recursively
//! encoded value: byte 0 reserved, byte 1 format version, byte 2 flags
//! (carrying the logical message type), bytes 3–7 padding, bytes 8–15 the
//! unsigned payload size. Atoms carry their fixed payload inline (symbols
//! travel as NUL-terminated UTF-8, never as process-local ids); vectors are
//! a u64 length then elements; lists, dicts and tables encode their
//! children in order. Runtime-only intermediates (MAP*/PARTED, function
//! kinds) are not transmitted.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{self, ErrKind};
use crate::obj::{self, Obj, TAG_B8, TAG_C8, TAG_DATE, TAG_DICT, TAG_ERR, TAG_F64, TAG_GUID,
    TAG_I16, TAG_I32, TAG_I64, TAG_LIST, TAG_NULL, TAG_SYM, TAG_TABLE, TAG_TIME, TAG_TIMESTAMP,
    TAG_U8};
use crate::symbols;
use crate::{RayError, Result};

pub const WIRE_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Async = 0,
    Sync = 1,
    Resp = 2,
}

impl MsgType {
    pub fn from_flags(flags: u8) -> MsgType {
        match flags & 0x3 {
            0 => MsgType::Async,
            1 => MsgType::Sync,
            _ => MsgType::Resp,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub version: u8,
    pub msgtype: MsgType,
    pub size: u64,
}

pub fn write_header(buf: &mut [u8], msgtype: MsgType, size: u64) {
    buf[..HEADER_SIZE].fill(0);
    buf[1] = WIRE_VERSION;
    buf[2] = msgtype as u8;
    LittleEndian::write_u64(&mut buf[8..16], size);
}

pub fn parse_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_SIZE {
        return Err(RayError::FrameTruncated { expected: HEADER_SIZE as u64, actual: buf.len() as u64 });
    }
    let version = buf[1];
    if version > WIRE_VERSION {
        return Err(RayError::WireVersion(version));
    }
    Ok(Header {
        version,
        msgtype: MsgType::from_flags(buf[2]),
        size: LittleEndian::read_u64(&buf[8..16]),
    })
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_sym(out: &mut Vec<u8>, id: i64) {
    if let Some(s) = symbols::str_of(id) {
        out.extend_from_slice(s.as_bytes());
    }
    out.push(0);
}

fn encode(v: &Obj, out: &mut Vec<u8>) -> Result<()> {
    let tag = v.tag();
    out.push(tag as u8);
    match tag {
        TAG_NULL => {}
        t if t == -TAG_B8 || t == -TAG_U8 || t == -TAG_C8 => out.push(v.u8_val()),
        t if t == -TAG_I16 => out.extend_from_slice(&v.i16_val().to_le_bytes()),
        t if t == -TAG_I32 || t == -TAG_DATE || t == -TAG_TIME => {
            out.extend_from_slice(&v.i32_val().to_le_bytes())
        }
        t if t == -TAG_I64 || t == -TAG_TIMESTAMP => {
            out.extend_from_slice(&v.i64_val().to_le_bytes())
        }
        t if t == -TAG_F64 => out.extend_from_slice(&v.f64_val().to_le_bytes()),
        t if t == -TAG_SYM => put_sym(out, v.sym_val()),
        t if t == -TAG_GUID => out.extend_from_slice(&v.guid_val()),
        TAG_B8 | TAG_U8 | TAG_C8 => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            out.extend_from_slice(v.as_u8s());
        }
        TAG_I16 => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for &x in v.as_i16s() {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TAG_I32 | TAG_DATE | TAG_TIME => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for &x in v.as_i32s() {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TAG_I64 | TAG_TIMESTAMP => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for &x in v.as_i64s() {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TAG_F64 => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for &x in v.as_f64s() {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        TAG_SYM => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for &id in v.as_i64s() {
                put_sym(out, id);
            }
        }
        TAG_GUID => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for g in v.as_guids() {
                out.extend_from_slice(g);
            }
        }
        TAG_LIST => {
            out.extend_from_slice(&(v.len() as u64).to_le_bytes());
            for item in v.as_list() {
                encode(item, out)?;
            }
        }
        TAG_DICT | TAG_TABLE => {
            encode(&v.as_list()[0], out)?;
            encode(&v.as_list()[1], out)?;
        }
        TAG_ERR => {
            // Kind byte plus the rendered context; the record itself is
            // per-thread and never crosses the wire.
            let kind = error::current();
            out.push(err_code(&kind));
            let msg = error::format(&kind);
            out.extend_from_slice(msg.as_bytes());
            out.push(0);
        }
        other => {
            return Err(RayError::InvalidColumnFile(format!(
                "type {} is runtime-only and cannot be serialized",
                obj::tag_name(other)
            )))
        }
    }
    Ok(())
}

fn err_code(kind: &ErrKind) -> u8 {
    match kind {
        ErrKind::None => 0,
        ErrKind::Type { .. } => 1,
        ErrKind::Arity { .. } => 2,
        ErrKind::Length { .. } => 3,
        ErrKind::Index { .. } => 4,
        ErrKind::Domain { .. } => 5,
        ErrKind::Value { .. } => 6,
        ErrKind::Limit { .. } => 7,
        ErrKind::Os { .. } => 8,
        ErrKind::Parse => 9,
        ErrKind::Nyi { .. } => 10,
        ErrKind::User { .. } => 11,
    }
}

/// Frame `v` into a header-prefixed byte buffer.
pub fn serialize(v: &Obj, msgtype: MsgType) -> Result<Vec<u8>> {
    let mut out = vec![0u8; HEADER_SIZE];
    encode(v, &mut out)?;
    let size = (out.len() - HEADER_SIZE) as u64;
    let (head, _) = out.split_at_mut(HEADER_SIZE);
    write_header(head, msgtype, size);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(RayError::FrameTruncated {
                expected: (self.pos + n) as u64,
                actual: self.buf.len() as u64,
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn cstr(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.buf.len() && self.buf[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.buf.len() {
            return Err(RayError::FrameTruncated {
                expected: self.pos as u64 + 1,
                actual: self.buf.len() as u64,
            });
        }
        let s = &self.buf[start..self.pos];
        self.pos += 1;
        Ok(s)
    }
}

fn decode(cur: &mut Cursor<'_>) -> Result<Obj> {
    let tag = cur.u8()? as i8;
    let v = match tag {
        TAG_NULL => Obj::null(),
        t if t == -TAG_B8 => Obj::b8(cur.u8()? != 0),
        t if t == -TAG_U8 => Obj::u8(cur.u8()?),
        t if t == -TAG_C8 => Obj::c8(cur.u8()?),
        t if t == -TAG_I16 => Obj::i16(i16::from_le_bytes(cur.take(2)?.try_into().unwrap())),
        t if t == -TAG_I32 => Obj::i32(i32::from_le_bytes(cur.take(4)?.try_into().unwrap())),
        t if t == -TAG_DATE => Obj::date(i32::from_le_bytes(cur.take(4)?.try_into().unwrap())),
        t if t == -TAG_TIME => Obj::time(i32::from_le_bytes(cur.take(4)?.try_into().unwrap())),
        t if t == -TAG_I64 => Obj::i64(i64::from_le_bytes(cur.take(8)?.try_into().unwrap())),
        t if t == -TAG_TIMESTAMP => {
            Obj::timestamp(i64::from_le_bytes(cur.take(8)?.try_into().unwrap()))
        }
        t if t == -TAG_F64 => Obj::f64(f64::from_le_bytes(cur.take(8)?.try_into().unwrap())),
        t if t == -TAG_SYM => {
            let s = cur.cstr()?;
            Obj::sym(symbols::intern(&String::from_utf8_lossy(s)))
        }
        t if t == -TAG_GUID => Obj::guid(cur.take(16)?.try_into().unwrap()),
        TAG_B8 | TAG_U8 | TAG_C8 => {
            let n = cur.u64()? as usize;
            let mut v = Obj::vector(tag, n);
            v.as_u8s_mut().copy_from_slice(cur.take(n)?);
            v
        }
        TAG_I16 => {
            let n = cur.u64()? as usize;
            let bytes = cur.take(n * 2)?;
            let mut v = Obj::vector(tag, n);
            for (i, slot) in v.as_i16s_mut().iter_mut().enumerate() {
                *slot = i16::from_le_bytes(bytes[i * 2..i * 2 + 2].try_into().unwrap());
            }
            v
        }
        TAG_I32 | TAG_DATE | TAG_TIME => {
            let n = cur.u64()? as usize;
            let bytes = cur.take(n * 4)?;
            let mut v = Obj::vector(tag, n);
            for (i, slot) in v.as_i32s_mut().iter_mut().enumerate() {
                *slot = i32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
            }
            v
        }
        TAG_I64 | TAG_TIMESTAMP => {
            let n = cur.u64()? as usize;
            let bytes = cur.take(n * 8)?;
            let mut v = Obj::vector(tag, n);
            for (i, slot) in v.as_i64s_mut().iter_mut().enumerate() {
                *slot = i64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
            }
            v
        }
        TAG_F64 => {
            let n = cur.u64()? as usize;
            let bytes = cur.take(n * 8)?;
            let mut v = Obj::vector(tag, n);
            for (i, slot) in v.as_f64s_mut().iter_mut().enumerate() {
                *slot = f64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
            }
            v
        }
        TAG_SYM => {
            let n = cur.u64()? as usize;
            let mut v = Obj::vector(tag, n);
            for i in 0..n {
                let s = cur.cstr()?;
                let id = symbols::intern(&String::from_utf8_lossy(s));
                v.as_i64s_mut()[i] = id;
            }
            v
        }
        TAG_GUID => {
            let n = cur.u64()? as usize;
            let bytes = cur.take(n * 16)?;
            let mut v = Obj::vector(tag, n);
            for (i, slot) in v.as_guids_mut().iter_mut().enumerate() {
                slot.copy_from_slice(&bytes[i * 16..i * 16 + 16]);
            }
            v
        }
        TAG_LIST => {
            let n = cur.u64()? as usize;
            let mut v = Obj::list(n);
            for i in 0..n {
                v.list_set(i, decode(cur)?);
            }
            v
        }
        TAG_DICT => {
            let keys = decode(cur)?;
            let vals = decode(cur)?;
            Obj::dict(keys, vals)
        }
        TAG_TABLE => {
            let names = decode(cur)?;
            let cols = decode(cur)?;
            Obj::table(names, cols)
        }
        TAG_ERR => {
            let _code = cur.u8()?;
            let msg = cur.cstr()?;
            error::err_user(&String::from_utf8_lossy(msg))
        }
        other => {
            return Err(RayError::InvalidColumnFile(format!(
                "unknown wire tag {}",
                other
            )))
        }
    };
    Ok(v)
}

/// Decode the payload of a frame (header already stripped).
pub fn deserialize(payload: &[u8]) -> Result<Obj> {
    let mut cur = Cursor { buf: payload, pos: 0 };
    decode(&mut cur)
}

/// Decode a whole frame: header + payload.
pub fn deserialize_frame(frame: &[u8]) -> Result<(MsgType, Obj)> {
    let header = parse_header(frame)?;
    let body = &frame[HEADER_SIZE..];
    if (body.len() as u64) < header.size {
        return Err(RayError::FrameTruncated { expected: header.size, actual: body.len() as u64 });
    }
    let v = deserialize(&body[..header.size as usize])?;
    Ok((header.msgtype, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::obj_eq;

    fn roundtrip(v: &Obj) -> Obj {
        let bytes = serialize(v, MsgType::Sync).unwrap();
        let header = parse_header(&bytes).unwrap();
        assert_eq!(header.msgtype, MsgType::Sync);
        assert_eq!(header.size as usize, bytes.len() - HEADER_SIZE);
        deserialize(&bytes[HEADER_SIZE..]).unwrap()
    }

    #[test]
    fn test_atom_roundtrips() {
        for v in [
            Obj::i64(-42),
            Obj::f64(2.718),
            Obj::b8(true),
            Obj::u8(0xCC),
            Obj::i16(-999),
            Obj::i32(123456),
            Obj::date(8888),
            Obj::time(86_399_000),
            Obj::timestamp(1_700_000_000_000_000_000),
            Obj::sym_str("wire_sym"),
            Obj::guid(*b"0123456789abcdef"),
        ] {
            let back = roundtrip(&v);
            assert!(obj_eq(&v, &back), "{:?} failed roundtrip", v);
        }
    }

    #[test]
    fn test_vector_roundtrips() {
        let vs = vec![
            Obj::i64_vec(&[1, 2, 3, i64::MIN, i64::MAX]),
            Obj::f64_vec(&[1.0, f64::NAN, -0.0, f64::INFINITY]),
            Obj::u8_vec(&[0, 255, 3]),
            Obj::i16_vec(&[-1, 0, 1]),
            Obj::i32_vec(&[i32::MIN, 7]),
            Obj::sym_vec_strs(&["alpha", "beta", "alpha"]),
            Obj::string("hello wire"),
        ];
        for v in vs {
            let back = roundtrip(&v);
            assert!(obj_eq(&v, &back), "{:?} failed roundtrip", v);
        }
    }

    #[test]
    fn test_nested_roundtrips() {
        let table = Obj::table(
            Obj::sym_vec_strs(&["k", "v"]),
            Obj::list_from(vec![
                Obj::sym_vec_strs(&["a", "b"]),
                Obj::f64_vec(&[1.5, -2.5]),
            ]),
        );
        let list = Obj::list_from(vec![table.clone(), Obj::i64(9), Obj::null()]);
        let back = roundtrip(&list);
        assert!(obj_eq(&list, &back));

        let dict = Obj::dict(Obj::sym_vec_strs(&["x"]), Obj::list_from(vec![Obj::i64(5)]));
        let back = roundtrip(&dict);
        assert!(obj_eq(&dict, &back));
    }

    #[test]
    fn test_truncated_frame_errors() {
        let bytes = serialize(&Obj::i64_vec(&[1, 2, 3]), MsgType::Async).unwrap();
        assert!(deserialize(&bytes[HEADER_SIZE..bytes.len() - 4]).is_err());
        assert!(parse_header(&bytes[..8]).is_err());
    }

    #[test]
    fn test_runtime_only_rejected() {
        let mf = Obj::map_filter(Obj::i64_vec(&[1]), Obj::i64_vec(&[0]));
        assert!(serialize(&mf, MsgType::Async).is_err());
    }

    #[test]
    fn test_err_value_crosses_wire() {
        let e = crate::error::err_index(5, 3);
        let bytes = serialize(&e, MsgType::Resp).unwrap();
        let back = deserialize(&bytes[HEADER_SIZE..]).unwrap();
        assert!(back.is_err());
    }
}
