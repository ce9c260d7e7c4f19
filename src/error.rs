use thiserror::Error;

/// Error taxonomy for the object-resolution and B-tree traversal engine.
///
/// Propagation policy: leaf-level decoders never raise on empty input;
/// navigator descents record the first error and stop rather than
/// attempt speculative repair; the resolver wraps checksum/format
/// failures from object-map nodes as `Corrupt`; checkpoint discovery is
/// the only subsystem that tolerates per-block errors by design.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("checksum mismatch at paddr {paddr}")]
    Checksum { paddr: u64 },

    #[error("not found")]
    NotFound,

    #[error("operation cancelled")]
    Cancelled,

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported on-disk form: {0}")]
    UnsupportedForm(String),

    #[error("no valid container superblock found")]
    NoValidSuperblock,
}

pub type Result<T> = std::result::Result<T, Error>;
