use std::io;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors raised by the engine and its building blocks.
///
/// Application callbacks report failures with [`anyhow::Error`]; the engine
/// logs those and turns them into a graceful close instead of surfacing them
/// here.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed call, e.g. an empty slice handed to a buffer.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A buffer write would grow past its configured ceiling.
    #[error("buffer capacity exceeded: {required} bytes required, limit is {limit}")]
    CapacityExceeded { required: usize, limit: usize },

    /// Malformed frame head or unparseable HTTP input.
    #[error("parse error: {0}")]
    Parse(String),

    /// Well-formed input that breaks a protocol rule.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// A bounded pool had nothing to hand out in non-blocking mode.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("worker pool is stopped")]
    PoolStopped,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that mean "retry on the next readiness event".
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
