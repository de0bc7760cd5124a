use std::io;
use thiserror::Error;

/// Failures that end a connection.
///
/// Per the framework's error policy, none of these are reported to the peer:
/// a malformed or timed-out request drops the connection without a response.
#[derive(Debug, Error)]
pub(crate) enum ErrorKind {
    #[error("socket read timed out")]
    Timeout,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("request exceeded the connection buffer")]
    BufferExhausted,
    #[error("header block exceeded the header cap")]
    HeadersTooLarge,
    #[error("malformed request line")]
    InvalidRequestLine,
    #[error("malformed header line")]
    InvalidHeader,
    #[error("invalid content-length value")]
    InvalidContentLength,
    #[error("request body exceeded the body cap")]
    BodyTooLarge,
    #[error("response header block exceeded the header cap")]
    ResponseHeadersTooLarge,
    #[error("i/o failure: {0}")]
    Io(#[from] IoError),
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        use ErrorKind::*;
        match (self, other) {
            (Timeout, Timeout)
            | (PeerClosed, PeerClosed)
            | (BufferExhausted, BufferExhausted)
            | (HeadersTooLarge, HeadersTooLarge)
            | (InvalidRequestLine, InvalidRequestLine)
            | (InvalidHeader, InvalidHeader)
            | (InvalidContentLength, InvalidContentLength)
            | (BodyTooLarge, BodyTooLarge)
            | (ResponseHeadersTooLarge, ResponseHeadersTooLarge) => true,
            (Io(a), Io(b)) => a == b,
            _ => false,
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

// Compared by kind only so parse tests can assert on error values.
#[derive(Debug, Error)]
#[error("{0}")]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Errors surfaced while setting up or running the server.
///
/// Bind and listen failures are the cases a binary is expected to exit
/// non-zero on.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("listener setup failed: {0}")]
    Listener(#[from] io::Error),
}

/// Canned response for connections rejected at admission time.
pub(crate) const BLOB_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
connection: close\r\n\
content-length: 19\r\n\
\r\n\
Service Unavailable";
