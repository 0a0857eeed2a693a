//! Error taxonomy shared by every Keelson operation.
//!
//! Operating-system errors are classified into a small set of kinds at the
//! boundary; callers match on kinds, never on raw `errno` values.

use std::io;
use thiserror::Error;

/// Main error type for Keelson operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation cannot complete now; retry on the next readiness event
    #[error("operation would block")]
    WouldBlock,

    /// The peer has shut down its sending side
    #[error("end of stream")]
    EndOfStream,

    /// The connection was refused by the peer
    #[error("connection refused")]
    ConnectionRefused,

    /// The connection was reset by the peer
    #[error("connection reset")]
    ConnectionReset,

    /// A deadline elapsed before the operation completed
    #[error("operation timed out")]
    TimedOut,

    /// The operation was cancelled before any of its data was transferred
    #[error("operation cancelled")]
    Cancelled,

    /// An argument or the object state does not permit the operation
    #[error("invalid argument or state")]
    Invalid,

    /// The named entity does not exist
    #[error("not found")]
    NotFound,

    /// The peer failed authorization
    #[error("not authorized")]
    NotAuthorized,

    /// The operation is not supported on this platform or socket type
    #[error("not supported")]
    NotSupported,

    /// The address is already in use
    #[error("address in use")]
    InUse,

    /// The socket is already open
    #[error("already open")]
    AlreadyOpen,

    /// Enqueuing would breach the queue high watermark
    #[error("queue full")]
    QueueFull,

    /// A signal interrupted the system call; retry immediately
    #[error("operation interrupted")]
    Interrupted,

    /// The operation has started and can no longer be cancelled
    #[error("operation in progress")]
    InProgress,

    /// The socket is closed; a category of invalid state
    #[error("socket closed")]
    Closed,

    /// An unclassified operating system error
    #[error("system error: {0}")]
    System(i32),
}

/// Result type alias for Keelson operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(unix)]
const EINPROGRESS: i32 = 115;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        #[cfg(unix)]
        if e.raw_os_error() == Some(EINPROGRESS) {
            return Self::InProgress;
        }

        match e.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            io::ErrorKind::Interrupted => Self::Interrupted,
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
                Self::ConnectionReset
            }
            io::ErrorKind::AddrInUse => Self::InUse,
            io::ErrorKind::UnexpectedEof => Self::EndOfStream,
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::NotAuthorized,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => Self::Invalid,
            _ => match e.raw_os_error() {
                Some(code) => Self::System(code),
                None => Self::Invalid,
            },
        }
    }
}

impl Error {
    /// Check if this error is recoverable by retrying on a later event.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::Interrupted | Self::InProgress)
    }

    /// Check if this error indicates the connection is unusable.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused | Self::ConnectionReset | Self::EndOfStream | Self::Closed
        )
    }

    /// Check if a connect attempt that failed with this error is worth
    /// retrying with backoff.
    #[must_use]
    pub const fn is_transient_connect_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused | Self::ConnectionReset | Self::TimedOut | Self::System(_)
        )
    }
}
