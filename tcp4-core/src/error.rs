//! Error types for the TCP socket core.

use std::{error, fmt, result};

/// A convenience wrapper around `Result` for `tcp4_core::Error`.
pub type Result<T> = result::Result<T, Error>;

/// Set of errors socket operations can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The operation was called with arguments that make no sense in the
    /// socket's current state.
    IllegalArguments,
    /// The requested local endpoint is already bound.
    AddressInUse,
    /// The requested address is not served by the local stack, or no
    /// ephemeral port could be allocated for it.
    AddressNotAvailable,
    /// The requested address may not be used by TCP (broadcast).
    AccessDenied,
    /// The address is not an `AF_INET` address.
    AfNotSupported,
    /// No route to the remote endpoint.
    NetUnreachable,
    /// The socket was closed while the operation was in flight.
    ConnectionReset,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::IllegalArguments => write!(f, "illegal arguments"),
            Error::AddressInUse => write!(f, "address already in use"),
            Error::AddressNotAvailable => write!(f, "address not available"),
            Error::AccessDenied => write!(f, "access denied"),
            Error::AfNotSupported => write!(f, "address family not supported"),
            Error::NetUnreachable => write!(f, "network unreachable"),
            Error::ConnectionReset => write!(f, "connection reset"),
        }
    }
}

/// Error occurred while trying to parse a TCP segment out of an IP
/// payload. Broken segments are dropped; the parse error only surfaces in
/// debug logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The IP payload is shorter than a minimal TCP header.
    Truncated {
        /// Bytes present in the IP payload.
        provided: usize,
        /// Bytes required for a minimal header.
        min: usize,
    },
    /// The header-words field is below the minimum of 5, or claims more
    /// header than the IP payload carries.
    InvalidHeaderWords {
        /// Value of the header-words field.
        provided: u16,
    },
    /// The segment carries a nonzero checksum that does not verify
    /// against the pseudo-header.
    InvalidChecksum,
}

impl error::Error for ParseError {}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ParseError::Truncated { provided, min } => {
                write!(
                    f,
                    "truncated TCP segment: {provided} bytes (minimum {min} bytes)"
                )
            }
            ParseError::InvalidHeaderWords { provided } => {
                write!(f, "invalid TCP header-words field: {provided}")
            }
            ParseError::InvalidChecksum => write!(f, "invalid TCP checksum"),
        }
    }
}
