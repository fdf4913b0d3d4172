//! Rayforce Core Runtime
//!
//! An in-process columnar analytic engine: a tagged, reference-counted
//! value model allocated from a buddy heap with per-thread slab caches,
//! a CPU-topology-aware worker pool, type-specialised parallel sorting,
//! a fused hash-aggregating select pipeline, and an event-driven reactor
//! speaking a length-prefixed sync/async wire protocol.
//!
//! The S-expression front-end (tokenizer, parser, REPL terminal) is an
//! external collaborator: the runtime consumes already-parsed value trees
//! through the small applier in [`eval`].

pub mod error;
pub mod eval;
pub mod hash;
pub mod heap;
pub mod ipc;
pub mod obj;
pub mod pool;
pub mod query;
pub mod sort;
pub mod storage;
pub mod symbols;
pub mod verbs;
pub mod vm;
pub mod wire;

// Re-export main types
pub use error::{ErrKind, ErrRecord};
pub use obj::{Attr, Obj, TypeTag};
pub use pool::Pool;
pub use vm::Vm;

/// Boundary error type. Inside the value universe errors are ERR-tagged
/// objects (see [`error`]); this enum covers the layers that talk to the
/// OS: storage, sockets, the reactor and the binary entry point.
#[derive(Debug, thiserror::Error)]
pub enum RayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Column file missing: {0}")]
    ColumnFileMissing(String),

    #[error("Invalid column file: {0}")]
    InvalidColumnFile(String),

    #[error("Not a splayed table directory: {0}")]
    NotSplayed(String),

    #[error("Handshake rejected by peer")]
    HandshakeRejected,

    #[error("Connection {0} not registered")]
    UnknownConnection(i64),

    #[error("Sync request timed out")]
    SyncTimeout,

    #[error("Wire format version {0} not supported")]
    WireVersion(u8),

    #[error("Frame truncated: expected {expected} bytes, got {actual}")]
    FrameTruncated { expected: u64, actual: u64 },
}

pub type Result<T> = std::result::Result<T, RayError>;
