//! The closed error taxonomy shared by every fallible operation in the crate.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A platform-native error code, kept around for diagnostics when an OS
/// failure doesn't map onto one of our named kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeCode(pub i32);

impl fmt::Display for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native code {}", self.0)
    }
}

/// The closed error enumeration from the specification.
///
/// Errors fall into four bands (see crate docs): argument/state errors are
/// returned synchronously and never reach an observer callback; transient
/// backend conditions are absorbed internally; operational failures are
/// delivered to the relevant `on_*` callback; fatal platform violations abort
/// the process before this type is ever constructed.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArg,
    #[error("object is not in a state that permits this operation")]
    BadState,
    #[error("operation cancelled")]
    Cancelled,
    #[error("end of file")]
    Eof,
    #[error("operation is already in progress")]
    InProgress,
    #[error("operation already performed")]
    Already,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation interrupted")]
    Interrupted,
    #[error("address already in use")]
    AddressInUse,
    #[error("address not available")]
    AddressNotAvailable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("network is down")]
    NetworkDown,
    #[error("no buffers available")]
    NoBuffers,
    #[error("out of memory")]
    OutOfMemory,
    #[error("value overflowed its buffer or range")]
    Overflow,
    #[error("value out of range")]
    Range,
    #[error("operation timed out")]
    TimedOut,
    #[error("not connected")]
    NotConnected,
    #[error("operation not supported")]
    NotSupported,
    #[error("permission denied")]
    PermissionDenied,
    #[error("descriptor table full")]
    DescriptorTableFull,
    #[error("system table full")]
    SystemTableFull,
    #[error("platform-dependent failure ({0})")]
    PlatformDependency(NativeCode),
    #[error("internal error")]
    Internal,
    #[error("syntax error")]
    Syntax,
}

impl Error {
    /// `true` for the transient backend conditions that are absorbed
    /// internally rather than surfaced to user callbacks (band 2).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::WouldBlock | Error::Interrupted | Error::InProgress | Error::Already
        )
    }

    /// `true` for argument/state errors returned synchronously from the
    /// issuing call (band 1); these never reach an observer callback.
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Error::InvalidArg | Error::BadState)
    }

    /// The platform-native code, if this error was folded from one.
    pub fn native_code(&self) -> Option<NativeCode> {
        match self {
            Error::PlatformDependency(code) => Some(*code),
            _ => None,
        }
    }

    /// Fold an arbitrary `std::io::Error` into the closed taxonomy, keeping
    /// the native code when no named kind applies.
    pub fn from_io(err: &std::io::Error) -> Error {
        use std::io::ErrorKind::*;
        let mapped = match err.kind() {
            NotFound | Unsupported => Error::NotSupported,
            PermissionDenied => Error::PermissionDenied,
            ConnectionRefused => Error::ConnectionRefused,
            ConnectionReset => Error::ConnectionReset,
            ConnectionAborted => Error::ConnectionAborted,
            NotConnected => Error::NotConnected,
            AddrInUse => Error::AddressInUse,
            AddrNotAvailable => Error::AddressNotAvailable,
            WouldBlock => Error::WouldBlock,
            TimedOut => Error::TimedOut,
            Interrupted => Error::Interrupted,
            InvalidInput | InvalidData => Error::InvalidArg,
            _ => {
                let code = err.raw_os_error().unwrap_or(-1);
                Error::PlatformDependency(NativeCode(code))
            }
        };
        mapped
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_band_is_exactly_four_kinds() {
        let transient = [
            Error::WouldBlock,
            Error::Interrupted,
            Error::InProgress,
            Error::Already,
        ];
        for e in transient {
            assert!(e.is_transient());
        }
        assert!(!Error::BadState.is_transient());
        assert!(!Error::Eof.is_transient());
    }

    #[test]
    fn synchronous_band_is_invalid_arg_and_bad_state() {
        assert!(Error::InvalidArg.is_synchronous());
        assert!(Error::BadState.is_synchronous());
        assert!(!Error::Cancelled.is_synchronous());
    }

    #[test]
    fn would_block_round_trips_through_io_error() {
        let io_err = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        assert_eq!(Error::from(io_err), Error::WouldBlock);
    }

    #[test]
    fn unrecognised_os_error_folds_into_platform_dependency() {
        let io_err = std::io::Error::from_raw_os_error(9999);
        let err = Error::from(io_err);
        assert!(matches!(err, Error::PlatformDependency(_)));
        assert_eq!(err.native_code(), Some(NativeCode(9999)));
    }
}
