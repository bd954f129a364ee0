use thiserror::Error;

use crate::{PieceIdx, Sha1};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure is scoped to a single peer session unless it is raised while
/// loading the torrent or binding the listener.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed header, unknown message type, unsupported version or an
    /// unexpected message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer asked for a different torrent.
    #[error("torrent id not valid")]
    TorrentMismatch,

    #[error("chunk invalid: {index} is out of range for {count} pieces")]
    OutOfRange { index: u64, count: u32 },

    /// The peer asked for a piece we do not have.
    #[error("chunk unavailable: {0}")]
    Unavailable(PieceIdx),

    #[error("hash mismatch: expected {expected}, received {received}")]
    HashMismatch { expected: Sha1, received: Sha1 },

    #[error("piece {0} is not being downloaded")]
    NotClaimed(Sha1),

    /// Reading or writing the local piece directory failed.
    #[error("storage error: {0}")]
    Storage(std::io::Error),

    /// Transport failure, including the stream ending mid-exchange.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("timed out waiting for peer")]
    Timeout,

    /// The peer sent an ERROR message.
    #[error("peer reported error: {0}")]
    Remote(String),

    #[error("invalid torrent descriptor: {0}")]
    Descriptor(String),

    #[error("tracker error: {0}")]
    Tracker(String),

    #[error("torrent is incomplete: {available}/{total} pieces available")]
    Incomplete { available: u32, total: u32 },
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn end_of_stream() -> Self {
        Self::Connection(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ))
    }

    /// Reason sent to the remote peer in an ERROR message, if any.
    pub fn peer_reason(&self) -> Option<String> {
        match self {
            Error::Protocol(msg) => Some(msg.clone()),
            Error::TorrentMismatch => Some("torrent id not valid".to_string()),
            Error::OutOfRange { .. } => Some("chunk invalid".to_string()),
            Error::Unavailable(_) => Some("chunk unavailable".to_string()),
            Error::HashMismatch { .. } => Some("chunk hash mismatch".to_string()),
            Error::NotClaimed(_)
            | Error::Storage(_)
            | Error::Connection(_)
            | Error::Timeout
            | Error::Remote(_)
            | Error::Descriptor(_)
            | Error::Tracker(_)
            | Error::Incomplete { .. } => None,
        }
    }
}
