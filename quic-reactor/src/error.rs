use std::fmt;

use crate::server::ServerState;

pub type Errno = nix::errno::Errno;

/// Result type alias for quic-reactor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for quic-reactor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The socket cannot report the local address of received datagrams.
    ///
    /// Replies cannot be routed without it, so this is fatal at initialization.
    AddressInfoUnsupported(Errno),
    /// A lifecycle operation was called in a state that does not allow it.
    InvalidState {
        op: &'static str,
        state: ServerState,
    },
    /// An OS-level socket operation failed.
    Io(Errno),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AddressInfoUnsupported(e) => {
                write!(f, "IP address detection not supported: {e}")
            }
            Error::InvalidState { op, state } => {
                write!(f, "cannot {op} while server is {state}")
            }
            Error::Io(e) => write!(f, "socket error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::AddressInfoUnsupported(e) | Error::Io(e) => Some(e),
            Error::InvalidState { .. } => None,
        }
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = Error::AddressInfoUnsupported(Errno::ENOPROTOOPT);
        assert!(e.to_string().starts_with("IP address detection not supported"));

        let e = Error::InvalidState {
            op: "start",
            state: ServerState::Closed,
        };
        assert_eq!(e.to_string(), "cannot start while server is closed");
    }

    #[test]
    fn test_source() {
        use std::error::Error as _;
        assert!(Error::Io(Errno::EBADF).source().is_some());
        let e = Error::InvalidState {
            op: "initialize",
            state: ServerState::Running,
        };
        assert!(e.source().is_none());
    }
}
