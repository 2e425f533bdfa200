use std::fmt;
use std::io;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed from this side.
    Local,
    /// The peer closed the connection (orderly EOF).
    Remote,
    /// A read or transport error tore the connection down.
    BadData,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Remote => write!(f, "closed by peer"),
            CloseReason::BadData => write!(f, "transport error"),
        }
    }
}

/// Status code for client and server operations.
///
/// Synchronous calls report failures through this type; conditions discovered
/// while draining I/O (peer closes, read errors) surface only through the
/// close callback, never as a return value of an unrelated call.
#[derive(Debug)]
pub enum NetError {
    /// Invalid parameter: empty or unparseable address, empty payload.
    BadParam,
    /// Not connected, the id is unknown, or the readiness check failed.
    Closed,
    /// Duplicate connect/listen while the instance is already running.
    Running,
    /// Resource allocation failed.
    Alloc,
    /// The readiness multiplexer could not be created, or a descriptor
    /// could not be registered with it.
    PollSetup(io::Error),
    /// The connect attempt did not complete within the configured timeout.
    Timeout,
    /// The connection limit was reached.
    TooMany,
    /// The peer did not accept more data within the write retry budget.
    Backpressure,
    /// Any other OS-level error, passed through unmodified.
    Io(io::Error),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::BadParam => write!(f, "invalid parameter"),
            NetError::Closed => write!(f, "connection closed"),
            NetError::Running => write!(f, "already running"),
            NetError::Alloc => write!(f, "allocation failed"),
            NetError::PollSetup(e) => write!(f, "poll setup failed: {}", e),
            NetError::Timeout => write!(f, "connect timed out"),
            NetError::TooMany => write!(f, "too many connections"),
            NetError::Backpressure => write!(f, "send retry budget exhausted"),
            NetError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NetError::PollSetup(e) | NetError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::OutOfMemory => NetError::Alloc,
            _ => NetError::Io(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_covers_taxonomy() {
        assert_eq!(NetError::BadParam.to_string(), "invalid parameter");
        assert_eq!(NetError::Running.to_string(), "already running");
        assert_eq!(NetError::Timeout.to_string(), "connect timed out");
        assert_eq!(CloseReason::Remote.to_string(), "closed by peer");
    }

    #[test]
    fn io_error_mapping() {
        let oom = io::Error::new(io::ErrorKind::OutOfMemory, "oom");
        assert!(matches!(NetError::from(oom), NetError::Alloc));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        match NetError::from(refused) {
            NetError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn source_exposes_inner_io_error() {
        use std::error::Error as _;
        let err = NetError::PollSetup(io::Error::new(io::ErrorKind::Other, "epoll"));
        assert!(err.source().is_some());
        assert!(NetError::Timeout.source().is_none());
    }
}
