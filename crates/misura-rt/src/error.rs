//! Error taxonomy shared by the runtime and the engine.
//!
//! Every variant maps to a stable reason string (the `Display` impl) that
//! higher layers embed into `FAILURE` events. OS errors are folded into the
//! taxonomy through [`Error::from_io`]; whatever does not have a dedicated
//! name keeps its OS message as a freeform reason.

use std::io;

use thiserror::Error;

/// Result alias used across the runtime.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed settings, bad enum value, wrong address family.
    #[error("value_error")]
    Value,

    /// A poll, readiness or datagram I/O deadline expired.
    #[error("timeout_error")]
    Timeout,

    /// Non-blocking operation could not complete. Drives the internal
    /// read loop; only `try_sendto` ever hands it to a caller.
    #[error("operation_would_block_error")]
    WouldBlock,

    /// Datagram truncated while sending.
    #[error("message_size_error")]
    MessageSize,

    /// The peer closed the connection.
    #[error("eof_error")]
    Eof,

    #[error("connection_reset_error")]
    ConnectionReset,

    #[error("host_unreachable_error")]
    HostUnreachable,

    #[error("connection_refused_error")]
    ConnectionRefused,

    /// Operation on a datagram socket that was already closed.
    #[error("socket_closed_error")]
    SocketClosed,

    #[error("file_io_error")]
    FileIo,

    #[error("json_parse_error")]
    JsonParse,

    /// A JSON document did not have the expected shape.
    #[error("json_domain_error")]
    JsonDomain,

    /// A JSON document was missing a required key.
    #[error("json_key_error")]
    JsonKey,

    /// A parallel sub-operation failed; used by composite runnables.
    #[error("parallel_operation_error")]
    ParallelOperation,

    /// Failure injected by a fake [`NetSys`](crate::sys::NetSys) in tests.
    #[error("mocked_error")]
    Mocked,

    /// OS-level socket failure without a dedicated name.
    #[error("socket_error {0}")]
    Socket(String),
}

impl Error {
    /// The stable reason string for this error.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    /// Fold an OS error into the taxonomy.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::InvalidInput => Error::Value,
            _ => match err.raw_os_error() {
                Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => Error::HostUnreachable,
                _ => Error::Socket(err.to_string()),
            },
        }
    }

    /// The most recent OS error, folded into the taxonomy.
    pub(crate) fn last_os() -> Self {
        Error::from_io(io::Error::last_os_error())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(Error::Value.reason(), "value_error");
        assert_eq!(Error::Timeout.reason(), "timeout_error");
        assert_eq!(Error::Eof.reason(), "eof_error");
        assert_eq!(Error::ConnectionReset.reason(), "connection_reset_error");
        assert_eq!(Error::MessageSize.reason(), "message_size_error");
    }

    #[test]
    fn io_errors_fold_into_named_kinds() {
        let err = Error::from_io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(err, Error::WouldBlock));
        let err = Error::from_io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, Error::ConnectionReset));
        let err = Error::from_io(io::Error::from_raw_os_error(libc::EHOSTUNREACH));
        assert!(matches!(err, Error::HostUnreachable));
    }
}
