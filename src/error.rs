use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, IoError>;

/// Error kinds surfaced by the block I/O, stream and HTTP layers.
///
/// Errors are recorded on in-flight buffers and re-surfaced through
/// callbacks, so the enum is Clone + PartialEq rather than wrapping
/// live `std::io::Error` values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    #[error("operation failed")]
    Fail,

    #[error("out of memory")]
    OutOfMemory,

    #[error("not implemented")]
    NotImpl,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("end of stream")]
    Eof,

    #[error("no response")]
    NoResponse,

    #[error("https is not supported")]
    HttpsRequired,

    #[error("cannot resolve host address")]
    NoHostAddress,

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("too many open sockets")]
    TooManySockets,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid http header: {0}")]
    InvalidHttpHeader(String),

    #[error("http document too large")]
    HttpDocTooLarge,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("no disk space")]
    NoDiskSpace,

    #[error("operation timed out")]
    Timeout,

    #[error("io error: {0}")]
    Io(String),
}

impl IoError {
    /// Map an OS-level error onto the closest crate error kind.
    pub fn from_os(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => IoError::FileNotFound(err.to_string()),
            ErrorKind::OutOfMemory => IoError::OutOfMemory,
            ErrorKind::TimedOut | ErrorKind::WouldBlock => IoError::Timeout,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => IoError::PeerDisconnected,
            ErrorKind::ConnectionRefused => IoError::NoResponse,
            ErrorKind::UnexpectedEof => IoError::Eof,
            ErrorKind::StorageFull => IoError::NoDiskSpace,
            _ => IoError::Io(err.to_string()),
        }
    }
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        IoError::from_os(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_os_error_mapping() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(IoError::from_os(&err), IoError::FileNotFound(_)));

        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(IoError::from_os(&err), IoError::PeerDisconnected);

        let err = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(IoError::from_os(&err), IoError::Timeout);
    }

    #[test]
    fn test_errors_are_comparable() {
        assert_eq!(IoError::Eof, IoError::Eof);
        assert_ne!(IoError::Eof, IoError::Fail);
    }
}
