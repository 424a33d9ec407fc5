//! # Error
//!
//! All fallible client operations return this crate's [`Error`], whether the
//! failure came off the wire, from a malformed server frame, or from the
//! server rejecting a proposed action.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("websocket error: {source}")]
    WebSocket {
        #[from]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("server rejected the action: {reason}")]
    Rejected { reason: String },

    #[error("topic not found: {topic_name}")]
    TopicNotFound { topic_name: String },
}

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection { message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol { message: message.into() }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Error::Rejected { reason: reason.into() }
    }

    pub fn topic_not_found(topic_name: impl Into<String>) -> Self {
        Error::TopicNotFound { topic_name: topic_name.into() }
    }
}
