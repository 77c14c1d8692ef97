//! Error Types

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    // ============= Malformed Client Input =============

    #[error("record truncated")]
    ShortRead,

    #[error("unexpected TLS record type: 0x{0:02x}")]
    UnexpectedRecordType(u8),

    #[error("unexpected handshake type: 0x{0:02x}")]
    UnexpectedHandshakeType(u8),

    #[error("unexpected session id length: {0}")]
    BadSessionIdLength(u8),

    #[error("no user matched the client hello tag")]
    HmacMismatch,

    // ============= Transport Faults =============

    #[error("cover dial failed: {0}")]
    CoverDial(#[source] io::Error),

    #[error("cover read failed: {0}")]
    CoverRead(#[source] io::Error),

    #[error("cover write failed: {0}")]
    CoverWrite(#[source] io::Error),

    #[error("client read failed: {0}")]
    ClientRead(#[source] io::Error),

    #[error("client write failed: {0}")]
    ClientWrite(#[source] io::Error),

    // ============= Tunnel Errors =============

    #[error("record verification failed")]
    VerificationFailed,

    #[error("remote peer sent an alert")]
    RemoteAlert,

    // ============= Config Errors =============

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    // ============= General Errors =============

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Whether the error means the peer simply went away.
    ///
    /// The cover side of the handshake relay reports such errors as success
    /// once the client has switched to tunnel traffic, because closing the
    /// cover connection is the expected end of that direction.
    pub fn is_disconnect(&self) -> bool {
        let io_err = match self {
            RelayError::ShortRead => return true,
            RelayError::CoverRead(e)
            | RelayError::CoverWrite(e)
            | RelayError::ClientRead(e)
            | RelayError::ClientWrite(e)
            | RelayError::Io(e) => e,
            _ => return false,
        };
        matches!(
            io_err.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected
        )
    }

    /// Recover a `RelayError` smuggled through an `io::Error` by the
    /// verified stream's poll implementations.
    pub fn from_io(err: &io::Error) -> Option<&RelayError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<RelayError>())
    }
}

/// Map a record-codec read failure on the client connection.
pub fn client_read_err(err: io::Error) -> RelayError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RelayError::ShortRead
    } else {
        RelayError::ClientRead(err)
    }
}

/// Map a record-codec read failure on the cover connection.
pub fn cover_read_err(err: io::Error) -> RelayError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        RelayError::ShortRead
    } else {
        RelayError::CoverRead(err)
    }
}
