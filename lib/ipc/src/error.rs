use std::io;
use thiserror::Error;

/// A message could not be exchanged with the peer.
///
/// Receivers must treat every variant as "no valid message arrived".
#[derive(Error, Debug)]
pub enum IpcError {
    /// An IO error
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The peer closed its end of the socket.
    #[error("peer closed the connection")]
    Closed,
    /// No message arrived within the socket's receive timeout.
    #[error("timed out waiting for a message")]
    Timeout,
    /// The message could not be encoded.
    #[error("could not serialize message: {0}")]
    Serialize(bincode::Error),
    /// The datagram is not a valid message.
    #[error("could not deserialize message: {0}")]
    Deserialize(bincode::Error),
    /// The encoded message does not fit in one datagram.
    #[error("message of {size} bytes exceeds the maximum message size")]
    MessageTooLarge {
        /// Encoded size of the rejected message.
        size: usize,
    },
    /// More descriptors than one message may carry.
    #[error("{count} descriptors exceed the per-message maximum")]
    TooManyFds {
        /// Number of descriptors offered or received.
        count: usize,
    },
    /// The datagram did not fit into the receive buffer.
    #[error("received a truncated message")]
    TruncatedMessage,
    /// The kernel dropped ancillary data that did not fit.
    #[error("received truncated descriptor data")]
    ControlTruncated,
    /// A valid message arrived, but not the one the protocol expects here.
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
    /// The compile monitor refused to open a session.
    #[error("compile monitor rejected the session: {0}")]
    Rejected(String),
}
