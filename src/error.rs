use thiserror::Error;

/// Status codes returned by the B-tree layer.
///
/// Every failure surfaced by the engine is one of these; pager-level I/O
/// errors propagate unchanged through `Io`.
#[derive(Error, Debug)]
pub enum BtreeError {
    #[error("out of memory")]
    NoMem,

    #[error("database disk image is malformed: {context}")]
    Corrupt { context: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error while reading page {0}")]
    IoRead(u32),

    #[error("I/O error while writing page {0}")]
    IoWrite(u32),

    #[error("database is locked")]
    Busy,

    #[error("table {root} is locked")]
    Locked { root: u32 },

    #[error("table {root} is locked by another shared-cache connection")]
    LockedSharedCache { root: u32 },

    #[error("attempt to write a readonly database")]
    ReadOnly,

    #[error("database is already open in this cache")]
    Constraint,

    #[error("database is full")]
    Full,

    #[error("cursor invalidated by a concurrent write")]
    Abort,

    #[error("no more work to do")]
    Done,
}

impl BtreeError {
    /// Shorthand for corruption reports; the context names the structure
    /// that failed validation.
    pub(crate) fn corrupt(context: &'static str) -> Self {
        BtreeError::Corrupt { context }
    }
}

pub type Result<T> = std::result::Result<T, BtreeError>;
