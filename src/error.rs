use thiserror::Error;

/// Storage-engine error type.
///
/// The first group of variants are domain errors surfaced to cursors and
/// the schema layer; the second group mirrors the POSIX-style codes the
/// engine reports for invalid input, contention and resource exhaustion.
#[derive(Error, Debug)]
pub enum Error {
    #[error("item not found")]
    NotFound,

    /// The operation raced with another thread and should be retried by
    /// its caller (contended request table, contended page state).
    #[error("restart operation")]
    Restart,

    #[error("duplicate key")]
    DuplicateKey,

    /// The page (or handle) is busy, typically contended for eviction.
    #[error("resource busy")]
    Busy,

    #[error("item already exists")]
    Exists,

    #[error("no space available: {0}")]
    NoSpace(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Structural corruption detected while reading: bad checksum, bad
    /// magic, or an invalid cell stream.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient errors are recovered by the caller's immediate loop
    /// rather than propagated to the operation's entry point.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Restart | Error::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Restart.is_transient());
        assert!(Error::Busy.is_transient());
        assert!(!Error::NotFound.is_transient());
        assert!(!Error::InvalidInput("x".into()).is_transient());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
