//! Error types for wl-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid object id: {0}")]
    InvalidObject(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("missing file descriptor for fd-typed argument")]
    MissingFd,

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("would block")]
    WouldBlock,
}

pub type Result<T> = std::result::Result<T, Error>;
