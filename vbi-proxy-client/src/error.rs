//! Client error types.

use std::io;

use thiserror::Error;
use vbi_proxy_protocol::{MessageType, ProtocolError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The daemon refused the request; the text is its reason.
    #[error("{0}")]
    Rejected(String),

    #[error("connection closed by the daemon")]
    ConnectionClosed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("unexpected reply {0:?}")]
    UnexpectedReply(MessageType),
}

pub type Result<T> = std::result::Result<T, ClientError>;
