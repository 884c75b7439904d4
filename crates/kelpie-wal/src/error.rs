use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("log is closed")]
    Closed,

    #[error("index.META does not start with the META marker")]
    InvalidMetaMarker,

    #[error("no codec registered for type tag {0:#04x}")]
    UnknownType(u8),

    #[error("corrupt entry at index {index}: CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    CorruptEntry {
        index: u32,
        stored: u32,
        computed: u32,
    },

    #[error("unexpected end of segment inside a frame")]
    UnexpectedEof,

    #[error("decode called without a buffered frame")]
    NoCurrentEntry,

    #[error("index {index} outside the live range [{base}, {head})")]
    OutOfBounds { index: u32, base: u32, head: u32 },

    #[error("cannot truncate at {0}: at or below the commit index")]
    TruncateCommitted(u32),

    #[error("out-of-order commit: expected {expected}")]
    OutOfOrderCommit { expected: u32 },

    #[error("segment {given} is behind the current segment {current}")]
    OutOfOrderSegment { given: u32, current: u32 },

    #[error("index {0} is already committed")]
    AlreadyCommitted(u32),

    #[error("short write: {written} of {expected} bytes reached the file")]
    ShortWrite { written: usize, expected: usize },

    #[error("durability sync failed: {0}")]
    SyncFailed(String),

    /// More input is needed before a length can be determined. Codec read
    /// helpers return this to ask the caller to refill its buffer; it never
    /// escapes the segment reader.
    #[error("incomplete payload")]
    Incomplete,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, WalError>;
