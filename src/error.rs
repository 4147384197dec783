use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("could not open socket: {0}")]
    SocketOpenFailed(String),
    #[error("could not bind socket: {0}")]
    BindFailed(String),
    #[error("could not join multicast group {group}: {reason}")]
    JoinGroupFailed { group: String, reason: String },
    #[error("invalid query '{query}': {reason}")]
    QueryInvalid { query: String, reason: String },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("peer disconnected")]
    PeerDisconnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the underlying transport reported the peer as gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::PeerDisconnected => true,
            Error::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
