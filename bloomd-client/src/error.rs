//! # Client Errors
//!
//! Purpose: Give every failure the client can surface a distinct, matchable
//! kind, and decide in one place which of them leave a connection unusable.
//!
//! ## Design Principles
//! 1. **Single Error Type**: All public operations return `BloomdResult<T>`.
//! 2. **Classification Over Inspection**: `poisons_connection` is the only
//!    rule the pool and connection consult when deciding reuse.
//! 3. **Preserve Server Text**: Command errors keep the server's message.

use std::io;

use thiserror::Error;

/// Result type for the bloomd client.
pub type BloomdResult<T> = Result<T, BloomdError>;

/// Errors surfaced by the bloomd client.
#[derive(Debug, Error)]
pub enum BloomdError {
    /// Dialing the server failed on every attempt.
    #[error("bloomd unavailable at {addr} after {attempts} attempt(s): {source}")]
    Unavailable {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    /// The call deadline elapsed during I/O.
    #[error("deadline exceeded")]
    Timeout,
    /// The caller cancelled the call.
    #[error("operation cancelled")]
    Cancelled,
    /// The connection was poisoned or closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// The response did not match the shape expected for the command.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server rejected the command (`Client Error:` / `Internal Error:`).
    #[error("command error: {0}")]
    Command(String),
    /// The server reported `Filter does not exist`.
    #[error("filter does not exist: {0}")]
    FilterNotFound(String),
    /// The pool was closed.
    #[error("connection pool closed")]
    PoolClosed,
    /// No connection became available before the deadline.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Filter names must be non-empty and free of whitespace.
    #[error("invalid filter name: {0:?}")]
    InvalidFilterName(String),
    /// Keys must be non-empty and free of whitespace unless pre-hashed.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    /// Address could not be resolved into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Raw socket failure that is neither a timeout nor a cancellation.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BloomdError {
    /// Returns true when a connection that produced this error must not be
    /// reused.
    ///
    /// Filter absence and command errors are complete, well-framed replies,
    /// so the connection stays healthy.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            BloomdError::Timeout
                | BloomdError::Cancelled
                | BloomdError::ConnectionClosed
                | BloomdError::Protocol(_)
                | BloomdError::Io(_)
        )
    }

    /// Returns true for `FilterNotFound`.
    pub fn is_filter_not_found(&self) -> bool {
        matches!(self, BloomdError::FilterNotFound(_))
    }
}
