use std::io;

use mixcomms_crypto::CryptoError;
use mixcomms_primitives::{Id, IdError, Status, TokenError};
use thiserror::Error;

/// Substrings that mark an error as a transient connection failure.
pub const CONNECTION_ERROR_MARKERS: [&str; 3] = [
    "context deadline exceeded",
    "connection refused",
    "host disconnected",
];

/// Prefix of the error a receiver reports when a transmission token is rejected.
pub const AUTH_ERROR_MARKER: &str = "failed to authenticate id:";

/// Reported by a proxying peer when it could not reach the downstream host.
pub const PROXY_ERROR_MARKER: &str = "could not reach target host";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("host {0} has no address, it might be receive only")]
    NoAddress(Id),
    #[error("host {0} is not registered")]
    UnknownHost(Id),
    #[error("failed to dial {id} at {address} after {attempts} attempts: {source}")]
    Dial {
        id: Id,
        address: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("call to {id} failed after {attempts} attempts: {source}")]
    Transmit {
        id: Id,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("connection refused: {0}")]
    ConnectionRefused(#[source] io::Error),
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("host disconnected")]
    Disconnected,
    #[error("failed to authenticate id: {0}")]
    Unauthenticated(Id),
    #[error("handshake with {id} failed: {source}")]
    Handshake {
        id: Id,
        #[source]
        source: Box<Error>,
    },
    #[error("token rejected: {0}")]
    TokenRejected(&'static str),
    #[error("too many proxy failures reaching {id}: {source}")]
    TooManyProxyErrors {
        id: Id,
        #[source]
        source: Box<Error>,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid rpc frame: {0}")]
    Frame(String),
    #[error("invalid call metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    Status(#[from] Status),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("http: {0}")]
    Hyper(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(#[from] http::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// How [`transmit`](crate::ProtoComms::send) reacts to a failed attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Reconnect and try again.
    Connection,
    /// Re-run the handshake and try again.
    Auth,
    /// Hand the error to the caller.
    Other,
}

impl Error {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ConnectionRefused(_) | Self::DeadlineExceeded | Self::Disconnected => {
                ErrorClass::Connection
            }
            Self::Unauthenticated(_) => ErrorClass::Auth,
            Self::Transmit { source, .. } => source.class(),
            Self::Hyper(err) if err.is_closed() || err.is_canceled() || err.is_incomplete_message() => {
                ErrorClass::Connection
            }
            Self::Io(err) if is_connection_io_error(err) => ErrorClass::Connection,
            // Dial and handshake failures already retried internally and are
            // fatal for the attempt; the remaining local variants are not
            // recoverable by reconnecting.
            Self::NoAddress(_)
            | Self::UnknownHost(_)
            | Self::Dial { .. }
            | Self::Handshake { .. }
            | Self::TokenRejected(_)
            | Self::TooManyProxyErrors { .. }
            | Self::Configuration(_)
            | Self::Crypto(_)
            | Self::Id(_)
            | Self::Token(_)
            | Self::Decode(_)
            | Self::Frame(_)
            | Self::Metadata(_) => ErrorClass::Other,
            // Statuses come from the peer as text.
            Self::Status(_) | Self::Tls(_) | Self::Hyper(_) | Self::Request(_) | Self::Io(_) => {
                classify_message(&self.to_string())
            }
        }
    }
}

/// Classifies an error that only exists as a message.
#[must_use]
pub fn classify_message(message: &str) -> ErrorClass {
    if CONNECTION_ERROR_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
    {
        ErrorClass::Connection
    } else if message.contains(AUTH_ERROR_MARKER) {
        ErrorClass::Auth
    } else {
        ErrorClass::Other
    }
}

fn is_connection_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

pub(crate) fn connect_error(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        Error::ConnectionRefused(err)
    } else {
        Error::Io(err)
    }
}
