//! Errors as values.
//!
//! An error is an ERR-tagged object. The context travels in a per-thread
//! record inside the VM, not in the object itself: every constructor below
//! writes the record and returns the one shared ERR handle. Callers check
//! with [`Obj::is_err`] and propagate. The REPL renders the record as
//! `** [Ekind] <context>`; wire responses carry the ERR tag.

use crate::obj::{self, Obj};
use crate::symbols;
use crate::vm;

/// Inline budget for user-raised messages.
pub const ERR_MSG_SIZE: usize = 24;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ErrKind {
    #[default]
    None,
    Type {
        expected: i8,
        actual: i8,
        arg: u8,
        field: i64,
    },
    Arity {
        need: u8,
        have: u8,
        arg: u8,
    },
    Length {
        need: i64,
        have: i64,
        arg: u8,
    },
    Index {
        idx: i64,
        len: i64,
    },
    Domain {
        arg: u8,
        field: i64,
    },
    Value {
        sym: i64,
    },
    Limit {
        value: i64,
    },
    Os {
        errno: i32,
    },
    Parse,
    Nyi {
        tag: i8,
    },
    User {
        msg: [u8; ERR_MSG_SIZE],
        len: u8,
    },
}

#[derive(Debug, Default)]
pub struct ErrRecord {
    pub kind: ErrKind,
}

fn raise(kind: ErrKind) -> Obj {
    vm::with(|vm| vm.err.kind = kind);
    obj::err_obj()
}

pub fn err_type(expected: i8, actual: i8, arg: u8, field: i64) -> Obj {
    raise(ErrKind::Type { expected, actual, arg, field })
}

pub fn err_arity(need: u8, have: u8, arg: u8) -> Obj {
    raise(ErrKind::Arity { need, have, arg })
}

pub fn err_length(need: i64, have: i64, arg: u8) -> Obj {
    raise(ErrKind::Length { need, have, arg })
}

pub fn err_index(idx: i64, len: i64) -> Obj {
    raise(ErrKind::Index { idx, len })
}

pub fn err_domain(arg: u8, field: i64) -> Obj {
    raise(ErrKind::Domain { arg, field })
}

pub fn err_value(sym: i64) -> Obj {
    raise(ErrKind::Value { sym })
}

pub fn err_limit(value: i64) -> Obj {
    raise(ErrKind::Limit { value })
}

pub fn err_os() -> Obj {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    raise(ErrKind::Os { errno })
}

pub fn err_parse() -> Obj {
    raise(ErrKind::Parse)
}

pub fn err_nyi(tag: i8) -> Obj {
    raise(ErrKind::Nyi { tag })
}

pub fn err_user(msg: &str) -> Obj {
    let bytes = msg.as_bytes();
    let len = bytes.len().min(ERR_MSG_SIZE);
    let mut buf = [0u8; ERR_MSG_SIZE];
    buf[..len].copy_from_slice(&bytes[..len]);
    raise(ErrKind::User { msg: buf, len: len as u8 })
}

/// Snapshot of the current thread's error context.
pub fn current() -> ErrKind {
    vm::with(|vm| vm.err.kind.clone())
}

pub fn name(kind: &ErrKind) -> &'static str {
    match kind {
        ErrKind::None => "Enone",
        ErrKind::Type { .. } => "Etype",
        ErrKind::Arity { .. } => "Earity",
        ErrKind::Length { .. } => "Elength",
        ErrKind::Index { .. } => "Eindex",
        ErrKind::Domain { .. } => "Edomain",
        ErrKind::Value { .. } => "Evalue",
        ErrKind::Limit { .. } => "Elimit",
        ErrKind::Os { .. } => "Eos",
        ErrKind::Parse => "Eparse",
        ErrKind::Nyi { .. } => "Enyi",
        ErrKind::User { .. } => "Euser",
    }
}

/// `** [Ekind] <context>` rendering used by the REPL path.
pub fn format(kind: &ErrKind) -> String {
    let body = match kind {
        ErrKind::None => String::new(),
        ErrKind::Type { expected, actual, .. } => format!(
            "expected {}, got {}",
            obj::tag_name(*expected),
            obj::tag_name(*actual)
        ),
        ErrKind::Arity { need, have, .. } => format!("need {} args, got {}", need, have),
        ErrKind::Length { need, have, .. } => format!("lengths differ: {} vs {}", need, have),
        ErrKind::Index { idx, len } => format!("index {} out of 0..{}", idx, len),
        ErrKind::Domain { .. } => "out of domain".to_string(),
        ErrKind::Value { sym } => symbols::str_of(*sym).unwrap_or_default(),
        ErrKind::Limit { value } => format!("limit {}", value),
        ErrKind::Os { errno } => std::io::Error::from_raw_os_error(*errno).to_string(),
        ErrKind::Parse => "parse".to_string(),
        ErrKind::Nyi { tag } => format!("nyi: {}", obj::tag_name(*tag)),
        ErrKind::User { msg, len } => {
            String::from_utf8_lossy(&msg[..*len as usize]).into_owned()
        }
    };
    format!("** [{}] {}", name(kind), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_returns_shared_err_obj() {
        let e = err_index(12, 10);
        assert!(e.is_err());
        match current() {
            ErrKind::Index { idx, len } => {
                assert_eq!(idx, 12);
                assert_eq!(len, 10);
            }
            other => panic!("wrong error context: {:?}", other),
        }
    }

    #[test]
    fn test_format() {
        let _ = err_index(3, 2);
        assert_eq!(format(&current()), "** [Eindex] index 3 out of 0..2");

        let _ = err_user("bad things");
        assert_eq!(format(&current()), "** [Euser] bad things");
    }

    #[test]
    fn test_user_message_truncates() {
        let _ = err_user("0123456789012345678901234567890123456789");
        match current() {
            ErrKind::User { len, .. } => assert_eq!(len as usize, ERR_MSG_SIZE),
            _ => panic!("expected user error"),
        }
    }
}
